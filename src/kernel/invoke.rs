//! Command invokers — how a registered command actually runs.
//!
//! Two shapes: [`FnInvoker`] wraps an in-process async closure (builtins,
//! tests), [`SubprocessInvoker`] spawns the configured Python interpreter
//! with an inline bootstrap that loads the skill's source file and calls
//! the tagged function with JSON keyword arguments.  Each line the child
//! writes counts as activity for the idle-timeout supervisor.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::error::{KernelError, KernelResult};
use crate::kernel::heartbeat::heartbeat;

/// Anything the kernel can execute for a canonical command name.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(&self, args: Value) -> KernelResult<Value>;
}

// ── In-process closures ─────────────────────────────────────

/// Boxed async handler, the registration currency for in-process commands.
pub type Handler = Arc<
    dyn Fn(Value) -> Pin<Box<dyn Future<Output = KernelResult<Value>> + Send>> + Send + Sync,
>;

pub struct FnInvoker {
    handler: Handler,
}

impl FnInvoker {
    pub fn new(handler: Handler) -> Self {
        Self { handler }
    }

    /// Convenience for plain closures returning a value.
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = KernelResult<Value>> + Send + 'static,
    {
        let f = Arc::new(f);
        Self {
            handler: Arc::new(move |args| {
                let f = Arc::clone(&f);
                Box::pin(async move { f(args).await })
            }),
        }
    }
}

#[async_trait]
impl Invoker for FnInvoker {
    async fn invoke(&self, args: Value) -> KernelResult<Value> {
        (self.handler)(args).await
    }
}

// ── Subprocess invocation ───────────────────────────────────

/// Inline bootstrap executed as `python -c`.  Loads the source file as a
/// module (applying decorators), calls the function with JSON kwargs,
/// awaits coroutines, and prints the JSON result as the final line.
const BOOTSTRAP: &str = r#"
import importlib.util, inspect, json, sys
path, fn_name, raw = sys.argv[1], sys.argv[2], sys.argv[3]
spec = importlib.util.spec_from_file_location("skilld_entry", path)
mod = importlib.util.module_from_spec(spec)
spec.loader.exec_module(mod)
fn = getattr(mod, fn_name)
out = fn(**json.loads(raw))
if inspect.iscoroutine(out):
    import asyncio
    out = asyncio.run(out)
print(json.dumps(out))
"#;

pub struct SubprocessInvoker {
    interpreter: String,
    source_path: PathBuf,
    def_name: String,
}

impl SubprocessInvoker {
    pub fn new(interpreter: impl Into<String>, source_path: PathBuf, def_name: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
            source_path,
            def_name: def_name.into(),
        }
    }
}

#[async_trait]
impl Invoker for SubprocessInvoker {
    async fn invoke(&self, args: Value) -> KernelResult<Value> {
        let args_json = serde_json::to_string(&args)
            .map_err(|e| KernelError::Internal(format!("serialize args: {e}")))?;

        let mut child = Command::new(&self.interpreter)
            .arg("-c")
            .arg(BOOTSTRAP)
            .arg(&self.source_path)
            .arg(&self.def_name)
            .arg(&args_json)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                KernelError::Internal(format!(
                    "spawn {} for {}: {e}",
                    self.interpreter,
                    self.source_path.display()
                ))
            })?;

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        // Child output is activity: every line refreshes the idle window.
        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();
        let mut captured: Vec<String> = Vec::new();
        let mut errors: Vec<String> = Vec::new();
        let mut out_open = true;
        let mut err_open = true;

        while out_open || err_open {
            tokio::select! {
                line = out_lines.next_line(), if out_open => match line {
                    Ok(Some(l)) => { heartbeat(); captured.push(l); }
                    Ok(None) => out_open = false,
                    Err(e) => return Err(KernelError::Internal(format!("read stdout: {e}"))),
                },
                line = err_lines.next_line(), if err_open => match line {
                    Ok(Some(l)) => { heartbeat(); errors.push(l); }
                    Ok(None) => err_open = false,
                    Err(e) => return Err(KernelError::Internal(format!("read stderr: {e}"))),
                },
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| KernelError::Internal(format!("wait: {e}")))?;
        if !status.success() {
            let detail = errors.join("\n");
            return Err(KernelError::Internal(format!(
                "{} exited with {}: {}",
                self.def_name,
                status.code().map(|c| c.to_string()).unwrap_or_else(|| "signal".into()),
                crate::truncate_chars(&detail, 2000),
            )));
        }

        debug!(
            command = %self.def_name,
            lines = captured.len(),
            "subprocess invocation complete"
        );

        // The bootstrap prints the result as the final line; anything the
        // command printed before that is passed through as plain text.
        let last = captured
            .iter()
            .rev()
            .find(|l| !l.trim().is_empty())
            .cloned()
            .unwrap_or_default();
        Ok(serde_json::from_str(&last).unwrap_or(Value::String(last)))
    }
}
