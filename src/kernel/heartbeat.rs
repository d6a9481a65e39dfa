//! Tool execution context: heartbeats and the idle/total supervisor.
//!
//! Every dispatched call runs inside a task-local [`ExecContext`].  The
//! command (or a wrapper on its behalf) calls [`heartbeat`] to mark
//! activity; a parallel supervisor polls `last_activity` and cancels the
//! call when either the idle window or the total budget elapses.  No
//! signal-based timers anywhere.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::TimeoutsConfig;
use crate::error::{KernelError, KernelResult};

/// Grace window a cancelled command gets to drain before being abandoned.
const CANCEL_DRAIN: Duration = Duration::from_millis(500);

/// Per-call execution context.
pub struct ExecContext {
    epoch: Instant,
    /// Millis since `epoch` of the last observed activity.
    last_activity_ms: AtomicU64,
}

impl ExecContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            epoch: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        })
    }

    /// Record activity now.
    pub fn touch(&self) {
        let elapsed = self.epoch.elapsed().as_millis() as u64;
        self.last_activity_ms.store(elapsed, Ordering::Relaxed);
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        self.epoch
            .elapsed()
            .saturating_sub(Duration::from_millis(last))
    }

    /// Time since the call started.
    pub fn running_for(&self) -> Duration {
        self.epoch.elapsed()
    }
}

impl Default for ExecContext {
    fn default() -> Self {
        Self {
            epoch: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        }
    }
}

tokio::task_local! {
    static EXEC_CONTEXT: Arc<ExecContext>;
}

/// Mark the current tool call as alive.  No other effects; a no-op when
/// called outside a dispatched command.
pub fn heartbeat() {
    let _ = EXEC_CONTEXT.try_with(|ctx| ctx.touch());
}

/// Run `fut` while firing a heartbeat every `interval` on its behalf.
///
/// Convenience for cooperative tasks that are busy awaiting something
/// external (a subprocess, a network call) and cannot call
/// [`heartbeat`] themselves at a useful cadence.
pub async fn run_with_heartbeat<F, T>(fut: F, interval: Duration) -> T
where
    F: Future<Output = T>,
{
    tokio::pin!(fut);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            out = &mut fut => return out,
            _ = ticker.tick() => heartbeat(),
        }
    }
}

/// Outcome classifier carried into the dispatch audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuperviseOutcome {
    Ok,
    Error,
    TimeoutIdle,
    TimeoutTotal,
    Cancelled,
}

impl SuperviseOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::TimeoutIdle => "timeout-idle",
            Self::TimeoutTotal => "timeout-total",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Supervise `fut` under the configured idle and total timeouts.
///
/// The future runs scoped to a fresh [`ExecContext`]; either timeout
/// firing drops it.  On external cancellation the future gets a short
/// drain window before being abandoned with kind `cancelled`.
pub async fn supervise<F, T>(
    fut: F,
    timeouts: &TimeoutsConfig,
    cancel: &CancellationToken,
) -> KernelResult<T>
where
    F: Future<Output = KernelResult<T>>,
{
    let ctx = ExecContext::new();
    ctx.touch();

    let total = Duration::from_millis(timeouts.total_ms);
    let idle = Duration::from_millis(timeouts.idle_ms);
    // Sample often enough that a tight idle window is enforced promptly.
    let sample = (idle / 4).clamp(Duration::from_millis(10), Duration::from_millis(50));
    let deadline = tokio::time::Instant::now() + total;

    let scoped = EXEC_CONTEXT.scope(Arc::clone(&ctx), fut);
    tokio::pin!(scoped);

    loop {
        tokio::select! {
            out = &mut scoped => return out,
            _ = tokio::time::sleep_until(deadline) => {
                return Err(KernelError::TimeoutTotal { ms: timeouts.total_ms });
            }
            _ = tokio::time::sleep(sample) => {
                if ctx.idle_for() > idle {
                    return Err(KernelError::TimeoutIdle { ms: timeouts.idle_ms });
                }
            }
            _ = cancel.cancelled() => {
                return match tokio::time::timeout(CANCEL_DRAIN, &mut scoped).await {
                    Ok(out) => out,
                    Err(_) => Err(KernelError::Cancelled),
                };
            }
        }
    }
}
