//! Context assembler — builds the message list for one LLM turn.
//!
//! Layered composition under a token budget, priority order: system
//! persona, the active skill's procedural guide, a git status summary
//! when available, associative memories recalled for the current query,
//! then the pruned conversational history.  Token accounting is
//! approximate (`chars / 4`).  A layer that would overflow the remaining
//! budget is dropped at the layer boundary — never mid-message — and the
//! system persona and current user message are never dropped.

use std::path::Path;

use tracing::debug;

use crate::config::AssembleConfig;
use crate::memory::Episode;
use crate::session::{prune_history, ChatMessage};

/// Approximate token count: chars / 4, minimum 1 for non-empty text.
pub fn estimate_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    if chars == 0 {
        0
    } else {
        (chars / 4).max(1)
    }
}

fn message_cost(msg: &ChatMessage) -> usize {
    estimate_tokens(&msg.content) + estimate_tokens(&msg.role) + 4
}

/// Everything one turn is assembled from.
pub struct TurnInputs<'a> {
    pub persona: &'a str,
    /// Active skill's SKILL.md body.
    pub skill_guide: Option<String>,
    pub git_summary: Option<String>,
    pub memories: Vec<Episode>,
    pub history: Vec<ChatMessage>,
    pub user_query: &'a str,
}

pub struct ContextAssembler {
    cfg: AssembleConfig,
}

impl ContextAssembler {
    pub fn new(cfg: AssembleConfig) -> Self {
        Self { cfg }
    }

    /// Should episodic recall run for this query at all?
    pub fn wants_memories(&self, query: &str) -> bool {
        query.chars().count() >= self.cfg.memory_min_query_chars
    }

    /// Compose the turn.  Returns messages ready for the LLM client.
    pub fn assemble(&self, mut inputs: TurnInputs<'_>) -> Vec<ChatMessage> {
        let budget = self.cfg.turn_budget_tokens;

        let user_msg = ChatMessage::new("user", inputs.user_query);
        let persona_msg = ChatMessage::new("system", inputs.persona);
        // The persona and the current user message are unconditional.
        let mut spent = message_cost(&persona_msg) + message_cost(&user_msg);
        let mut out = vec![persona_msg];

        // Layer 2: active skill guide.
        if let Some(guide) = inputs.skill_guide.filter(|g| !g.trim().is_empty()) {
            let msg = ChatMessage::new(
                "system",
                format!("<skill_guide>\n{}\n</skill_guide>", guide.trim()),
            );
            spent = push_if_fits(&mut out, msg, spent, budget, "skill_guide");
        }

        // Layer 3: git status summary.
        if let Some(git) = inputs.git_summary.filter(|g| !g.trim().is_empty()) {
            let msg = ChatMessage::new(
                "system",
                format!("<git_status>\n{}\n</git_status>", git.trim()),
            );
            spent = push_if_fits(&mut out, msg, spent, budget, "git_status");
        }

        // Layer 4: associative memories, skipped for short queries.
        if self.wants_memories(inputs.user_query) && !inputs.memories.is_empty() {
            let mut block = String::from("<memories>\n");
            for episode in &inputs.memories {
                block.push_str(&format!("- {}: {}\n", episode.key, episode.content));
            }
            block.push_str("</memories>");
            let msg = ChatMessage::new("system", block);
            spent = push_if_fits(&mut out, msg, spent, budget, "memories");
        }

        // Layer 5: pruned history, newest-first admission at message
        // boundaries with the remaining budget.
        prune_history(&mut inputs.history, self.cfg.keep_recent_rounds);
        let mut admitted: Vec<ChatMessage> = Vec::new();
        for msg in inputs.history.into_iter().rev() {
            if msg.role == "system" {
                continue; // the persona layer owns system content
            }
            let cost = message_cost(&msg);
            if spent + cost > budget {
                break;
            }
            spent += cost;
            admitted.push(msg);
        }
        admitted.reverse();
        out.extend(admitted);

        out.push(user_msg);
        debug!(
            messages = out.len(),
            tokens = spent,
            budget,
            "context assembled"
        );
        out
    }
}

fn push_if_fits(
    out: &mut Vec<ChatMessage>,
    msg: ChatMessage,
    spent: usize,
    budget: usize,
    layer: &str,
) -> usize {
    let cost = message_cost(&msg);
    if spent + cost > budget {
        debug!(layer, cost, spent, budget, "layer dropped at boundary");
        return spent;
    }
    out.push(msg);
    spent + cost
}

/// Short git status summary for the injection layer, or `None` when
/// `dir` is not inside a work tree (or git is unavailable).
pub async fn git_status_summary(dir: &Path) -> Option<String> {
    let output = tokio::process::Command::new("git")
        .arg("status")
        .arg("--porcelain")
        .arg("-b")
        .current_dir(dir)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let mut lines = text.lines();
    let branch = lines.next().unwrap_or("").trim_start_matches("## ").to_string();
    let changes: Vec<&str> = lines.collect();
    if branch.is_empty() {
        return None;
    }
    Some(if changes.is_empty() {
        format!("branch {branch}, clean")
    } else {
        format!(
            "branch {branch}, {} changed file(s):\n{}",
            changes.len(),
            changes.join("\n")
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(budget: usize) -> AssembleConfig {
        AssembleConfig {
            turn_budget_tokens: budget,
            keep_recent_rounds: 2,
            memory_min_query_chars: 12,
        }
    }

    fn memory(key: &str, content: &str) -> Episode {
        Episode {
            key: key.into(),
            content: content.into(),
            source: "test".into(),
            ts: String::new(),
            score: Some(1.0),
        }
    }

    #[test]
    fn chars_over_four_accounting() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("ab"), 1);
        assert_eq!(estimate_tokens(&"x".repeat(400)), 100);
    }

    #[test]
    fn all_layers_fit_under_generous_budget() {
        let assembler = ContextAssembler::new(cfg(10_000));
        let msgs = assembler.assemble(TurnInputs {
            persona: "You are the runtime.",
            skill_guide: Some("Use git.status first.".into()),
            git_summary: Some("branch main, clean".into()),
            memories: vec![memory("deploy", "release branch only")],
            history: vec![
                ChatMessage::new("user", "earlier question"),
                ChatMessage::new("assistant", "earlier answer"),
            ],
            user_query: "commit my staged changes",
        });

        assert_eq!(msgs[0].role, "system");
        assert!(msgs.iter().any(|m| m.content.contains("<skill_guide>")));
        assert!(msgs.iter().any(|m| m.content.contains("<git_status>")));
        assert!(msgs.iter().any(|m| m.content.contains("<memories>")));
        assert_eq!(msgs.last().unwrap().content, "commit my staged changes");
    }

    #[test]
    fn overflowing_layer_is_dropped_whole() {
        let assembler = ContextAssembler::new(cfg(60));
        let huge_guide = "guide ".repeat(500);
        let msgs = assembler.assemble(TurnInputs {
            persona: "persona",
            skill_guide: Some(huge_guide),
            git_summary: Some("branch main, clean".into()),
            memories: vec![],
            history: vec![],
            user_query: "do the thing now",
        });

        // Guide dropped at the boundary — not truncated mid-message.
        assert!(!msgs.iter().any(|m| m.content.contains("<skill_guide>")));
        assert!(msgs.iter().any(|m| m.content.contains("<git_status>")));
    }

    #[test]
    fn persona_and_user_survive_impossible_budget() {
        let assembler = ContextAssembler::new(cfg(1));
        let msgs = assembler.assemble(TurnInputs {
            persona: "persona",
            skill_guide: Some("g".into()),
            git_summary: None,
            memories: vec![],
            history: vec![ChatMessage::new("user", "old"), ChatMessage::new("assistant", "a")],
            user_query: "current question",
        });
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, "system");
        assert_eq!(msgs[1].content, "current question");
    }

    #[test]
    fn short_query_skips_memories() {
        let assembler = ContextAssembler::new(cfg(10_000));
        assert!(!assembler.wants_memories("hi"));
        let msgs = assembler.assemble(TurnInputs {
            persona: "p",
            skill_guide: None,
            git_summary: None,
            memories: vec![memory("k", "v")],
            history: vec![],
            user_query: "hi",
        });
        assert!(!msgs.iter().any(|m| m.content.contains("<memories>")));
    }

    #[tokio::test]
    async fn git_summary_tolerates_non_repo_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        // Outside a work tree (or with git absent) the layer is skipped.
        let summary = git_status_summary(tmp.path()).await;
        if let Some(s) = summary {
            assert!(s.starts_with("branch "));
        }
    }

    #[test]
    fn history_admits_newest_first_at_message_boundaries() {
        let assembler = ContextAssembler::new(cfg(80));
        let history: Vec<ChatMessage> = (0..20)
            .flat_map(|i| {
                vec![
                    ChatMessage::new("user", format!("question number {i} padding padding")),
                    ChatMessage::new("assistant", format!("answer number {i} padding padding")),
                ]
            })
            .collect();
        let msgs = assembler.assemble(TurnInputs {
            persona: "p",
            skill_guide: None,
            git_summary: None,
            memories: vec![],
            history,
            user_query: "latest",
        });

        // Whatever fits must be the newest tail, in order.
        let contents: Vec<&str> = msgs.iter().map(|m| m.content.as_str()).collect();
        let answer19 = contents.iter().position(|c| c.contains("answer number 19"));
        assert!(answer19.is_some(), "newest history must be admitted");
        assert!(!contents.iter().any(|c| c.contains("question number 0")));
    }
}
