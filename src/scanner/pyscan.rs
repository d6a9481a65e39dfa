//! Lightweight Python surface parser.
//!
//! Locates functions tagged with the `@skill_command(...)` marker inside a
//! source file without executing it, and lifts enough of the signature to
//! build a JSON Schema for the command's arguments.  This is a line-level
//! parser, not a full AST: it only needs decorator arguments, the `def`
//! header, and the leading docstring.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Value};

/// One tagged function lifted from a source file.
#[derive(Debug, Clone)]
pub struct PyCommand {
    /// Exposed command name (decorator override or the function name).
    pub name: String,
    /// The `def` identifier as written in the source.
    pub def_name: String,
    pub category: String,
    pub description: String,
    /// Full docstring body (first paragraph retained verbatim).
    pub docstring: String,
    /// JSON Schema for the arguments object.
    pub input_schema: Value,
    /// `true` for `async def`.
    pub is_async: bool,
}

fn decorator_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*@skill_command\s*(\(|$)").expect("decorator regex"))
}

fn def_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(async\s+)?def\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(").expect("def regex")
    })
}

fn kwarg_str_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(\w+)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("kwarg regex")
    })
}

fn kwarg_bool_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\w+)\s*=\s*(True|False)").expect("bool kwarg regex"))
}

fn kwarg_list_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\w+)\s*=\s*\[([^\]]*)\]").expect("list kwarg regex"))
}

/// Scan a Python source file for `@skill_command`-tagged functions.
///
/// Declaration order in the file is preserved.
pub fn extract_commands(source: &str) -> Vec<PyCommand> {
    let lines: Vec<&str> = source.lines().collect();
    let mut out = Vec::new();
    let mut i = 0usize;

    while i < lines.len() {
        if !decorator_re().is_match(lines[i]) {
            i += 1;
            continue;
        }

        // Accumulate the decorator call until parens balance.
        let (deco_text, after_deco) = collect_balanced(&lines, i);

        // Skip stacked decorators between the marker and the def.
        let mut j = after_deco;
        while j < lines.len() && lines[j].trim_start().starts_with('@') {
            j += 1;
        }
        let Some(def_caps) = lines.get(j).and_then(|l| def_re().captures(l)) else {
            i = after_deco;
            continue;
        };

        let is_async = def_caps.get(1).is_some();
        let fn_name = def_caps[2].to_string();
        let (def_text, after_def) = collect_balanced(&lines, j);

        let params_raw = extract_param_list(&def_text);
        let docstring = extract_docstring(&lines, after_def);

        let name = str_kwarg(&deco_text, "name").unwrap_or_else(|| fn_name.clone());
        let category = str_kwarg(&deco_text, "category").unwrap_or_else(|| "general".into());
        let description = str_kwarg(&deco_text, "description")
            .or_else(|| docstring.lines().next().map(|l| l.trim().to_string()))
            .unwrap_or_default();

        // Injected parameters never appear in the public schema.
        let mut injected: HashSet<String> = HashSet::new();
        if bool_kwarg(&deco_text, "inject_root") {
            injected.insert("project_root".into());
        }
        for key in list_kwarg(&deco_text, "inject_settings") {
            injected.insert(key.replace('.', "_"));
        }

        let input_schema = build_schema(&params_raw, &injected);

        out.push(PyCommand {
            name,
            def_name: fn_name,
            category,
            description,
            docstring,
            input_schema,
            is_async,
        });
        i = after_def;
    }

    out
}

/// Join lines from `start` until open/close parens balance.  Returns the
/// joined text and the index of the first line after the construct.
fn collect_balanced(lines: &[&str], start: usize) -> (String, usize) {
    let mut depth = 0i32;
    let mut text = String::new();
    let mut idx = start;
    while idx < lines.len() {
        let line = lines[idx];
        text.push_str(line);
        text.push('\n');
        for c in line.chars() {
            match c {
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' => depth -= 1,
                _ => {}
            }
        }
        idx += 1;
        if depth <= 0 && text.contains('(') {
            break;
        }
        // Bare `@skill_command` with no call at all.
        if depth == 0 && !text.contains('(') {
            break;
        }
    }
    (text, idx)
}

/// Extract the raw parameter list between the outermost parens of a def.
fn extract_param_list(def_text: &str) -> String {
    let Some(open) = def_text.find('(') else {
        return String::new();
    };
    let mut depth = 0i32;
    for (pos, c) in def_text[open..].char_indices() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                depth -= 1;
                if depth == 0 {
                    return def_text[open + 1..open + pos].to_string();
                }
            }
            _ => {}
        }
    }
    String::new()
}

/// Pull the leading docstring starting at `line_idx`, if present.
fn extract_docstring(lines: &[&str], line_idx: usize) -> String {
    let Some(first) = lines.get(line_idx) else {
        return String::new();
    };
    let trimmed = first.trim_start();
    let quote = if trimmed.starts_with("\"\"\"") {
        "\"\"\""
    } else if trimmed.starts_with("'''") {
        "'''"
    } else {
        return String::new();
    };

    let rest = &trimmed[3..];
    if let Some(end) = rest.find(quote) {
        return rest[..end].trim().to_string();
    }
    // Multi-line docstring: collect until the closing fence.
    let mut body = vec![rest.to_string()];
    for line in lines.iter().skip(line_idx + 1) {
        if let Some(end) = line.find(quote) {
            body.push(line[..end].to_string());
            break;
        }
        body.push((*line).to_string());
    }
    body.join("\n").trim().to_string()
}

fn str_kwarg(text: &str, key: &str) -> Option<String> {
    kwarg_str_re().captures_iter(text).find_map(|c| {
        if &c[1] == key {
            c.get(2).or_else(|| c.get(3)).map(|m| m.as_str().to_string())
        } else {
            None
        }
    })
}

fn bool_kwarg(text: &str, key: &str) -> bool {
    kwarg_bool_re()
        .captures_iter(text)
        .any(|c| &c[1] == key && &c[2] == "True")
}

fn list_kwarg(text: &str, key: &str) -> Vec<String> {
    kwarg_list_re()
        .captures_iter(text)
        .find(|c| &c[1] == key)
        .map(|c| {
            c[2].split(',')
                .map(|s| s.trim().trim_matches(|q| q == '"' || q == '\'').to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Build a JSON Schema object from the raw parameter list.
fn build_schema(params_raw: &str, injected: &HashSet<String>) -> Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();

    for part in split_top_level(params_raw) {
        let part = part.trim();
        if part.is_empty() || part == "self" || part.starts_with('*') {
            continue;
        }
        // `name: hint = default`
        let (head, default) = match split_once_top_level(part, '=') {
            Some((h, d)) => (h.trim(), Some(d.trim())),
            None => (part, None),
        };
        let (pname, hint) = match head.split_once(':') {
            Some((n, h)) => (n.trim(), Some(h.trim())),
            None => (head, None),
        };
        if injected.contains(pname) {
            continue;
        }
        let ty = hint.map(json_type_for_hint).unwrap_or("string");
        properties.insert(pname.to_string(), json!({ "type": ty }));
        if default.is_none() {
            required.push(Value::String(pname.to_string()));
        }
    }

    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false,
    })
}

/// Map a Python type hint to a JSON Schema primitive.
fn json_type_for_hint(hint: &str) -> &'static str {
    let base = hint
        .trim()
        .trim_start_matches("Optional[")
        .trim_end_matches(']');
    let base = base.split('|').next().unwrap_or(base).trim();
    match base {
        "int" => "integer",
        "float" => "number",
        "bool" => "boolean",
        h if h.starts_with("list") || h.starts_with("List") => "array",
        h if h.starts_with("dict") || h.starts_with("Dict") => "object",
        _ => "string",
    }
}

/// Split on `sep` only at bracket depth zero.
fn split_top_level(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut cur = String::new();
    for c in s.chars() {
        match c {
            '(' | '[' | '{' => {
                depth += 1;
                cur.push(c);
            }
            ')' | ']' | '}' => {
                depth -= 1;
                cur.push(c);
            }
            ',' if depth == 0 => {
                parts.push(std::mem::take(&mut cur));
            }
            _ => cur.push(c),
        }
    }
    if !cur.trim().is_empty() {
        parts.push(cur);
    }
    parts
}

fn split_once_top_level(s: &str, sep: char) -> Option<(&str, &str)> {
    let mut depth = 0i32;
    for (i, c) in s.char_indices() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            c if c == sep && depth == 0 => {
                return Some((&s[..i], &s[i + c.len_utf8()..]));
            }
            _ => {}
        }
    }
    None
}
