//! Executor - runs claimed tasks in their slots.
//!
//! The dispatcher receives claimed tasks from the scheduler and spawns one
//! execution unit per task into a `JoinSet`. Each unit:
//! 1. marks the task Running
//! 2. resolves the handler by task type
//! 3. runs the handler in its own tokio task, racing it against the
//!    execution timeout, lease renewal ticks and a local cancel signal
//! 4. records the outcome, unless the lease was lost, in which case the
//!    result is dropped: someone else may already own the task
//!
//! Execution is at-least-once. A handler may run again after a lease expiry.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::context::NodeContext;
use super::scheduler::ClaimedTask;
use crate::domain::{BobbinError, HandlerError, TaskEnvelope, TaskFailure, TaskId};
use crate::ports::deadline_after;
use crate::typed::TaskContext;

/// How an execution unit ended.
#[derive(Debug)]
pub(crate) enum ExecutionEnd {
    Finished(Result<serde_json::Value, HandlerError>),
    Panicked(String),
    TimedOut,
    Cancelled,
    /// Renewal was refused, or transient renewal errors outlasted the lease.
    LeaseLost,
    /// Running could not be recorded; nothing was executed.
    NotStarted,
}

/// Receives claimed work and cancel requests; owns every execution unit.
pub(crate) async fn dispatcher_loop(
    ctx: Arc<NodeContext>,
    mut work_rx: mpsc::Receiver<ClaimedTask>,
    mut cancel_rx: mpsc::Receiver<TaskId>,
) {
    let mut units: JoinSet<TaskId> = JoinSet::new();
    let mut cancels: HashMap<TaskId, oneshot::Sender<()>> = HashMap::new();
    let mut accepting = true;

    loop {
        tokio::select! {
            claimed = work_rx.recv(), if accepting => match claimed {
                Some(claimed) => {
                    let task_id = claimed.envelope.task_id;
                    let (cancel_tx, cancel_signal) = oneshot::channel();
                    cancels.insert(task_id, cancel_tx);
                    let ctx = Arc::clone(&ctx);
                    units.spawn(async move {
                        execute(ctx, claimed, cancel_signal).await;
                        task_id
                    });
                }
                None => accepting = false,
            },
            Some(task_id) = cancel_rx.recv() => {
                if let Some(tx) = cancels.remove(&task_id) {
                    debug!(node_id = %ctx.node_id, %task_id, "local cancel signal");
                    let _ = tx.send(());
                }
            }
            Some(joined) = units.join_next() => {
                match joined {
                    Ok(task_id) => {
                        cancels.remove(&task_id);
                    }
                    Err(e) => warn!(node_id = %ctx.node_id, error = %e, "execution unit aborted"),
                }
            }
            else => break,
        }

        if !accepting && units.is_empty() {
            break;
        }
    }
    info!(node_id = %ctx.node_id, "executor drained");
}

/// Run one claimed task to the end and record what happened.
pub(crate) async fn execute(
    ctx: Arc<NodeContext>,
    claimed: ClaimedTask,
    cancel_signal: oneshot::Receiver<()>,
) -> ExecutionEnd {
    let ClaimedTask { envelope, permit } = claimed;
    let task_id = envelope.task_id;

    let Some(running) = start(&ctx, &envelope).await else {
        drop(permit);
        return ExecutionEnd::NotStarted;
    };

    let (end, lease_end) = if running.cancel_requested {
        (ExecutionEnd::Cancelled, lease_end_of(&ctx, &running))
    } else {
        run_attempt(&ctx, &running, cancel_signal).await
    };
    debug!(node_id = %ctx.node_id, %task_id, ?end, "execution ended");
    record(&ctx, &running, &end, lease_end).await;
    drop(permit);
    end
}

/// Mark the task Running, retrying transient store errors while the claim
/// lease lasts.
async fn start(ctx: &NodeContext, claimed: &TaskEnvelope) -> Option<TaskEnvelope> {
    let task_id = claimed.task_id;
    let lease_end = lease_end_of(ctx, claimed);
    let backoff = ctx.config.store_backoff();
    let mut failures = 0u32;

    loop {
        match ctx.queue.mark_running(task_id, &ctx.node_id).await {
            Ok(running) => return Some(running),
            Err(e) if e.is_transient() && still_leased(ctx.clock.now(), lease_end) => {
                failures += 1;
                let delay = backoff.next_delay(failures);
                debug!(node_id = %ctx.node_id, %task_id, error = %e, ?delay, "marking task running failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                warn!(node_id = %ctx.node_id, %task_id, error = %e, "could not start task");
                return None;
            }
        }
    }
}

fn lease_end_of(ctx: &NodeContext, task: &TaskEnvelope) -> DateTime<Utc> {
    task.lease_expires_at().unwrap_or_else(|| ctx.clock.now())
}

async fn run_attempt(
    ctx: &NodeContext,
    task: &TaskEnvelope,
    cancel_signal: oneshot::Receiver<()>,
) -> (ExecutionEnd, DateTime<Utc>) {
    let task_id = task.task_id;
    let mut lease_expires_at = lease_end_of(ctx, task);
    let Some(handler) = ctx.registry.get(&task.task_type) else {
        let err = BobbinError::HandlerNotFound(task.task_type.clone());
        warn!(node_id = %ctx.node_id, %task_id, error = %err, "no handler on this node");
        // another node may have it registered
        let end = ExecutionEnd::Finished(Err(HandlerError::transient(err.to_string())));
        return (end, lease_expires_at);
    };

    let handler_ctx = TaskContext {
        task_id,
        node_id: ctx.node_id.clone(),
        attempt: task.attempts,
        max_attempts: task.max_attempts,
    };
    let payload = task.payload.clone();
    info!(
        node_id = %ctx.node_id,
        %task_id,
        task_type = %task.task_type,
        attempt = task.attempts,
        "executing task"
    );
    let mut unit = AbortOnDrop(tokio::spawn(async move {
        handler.handle_dyn(payload, handler_ctx).await
    }));

    let lease_duration = ctx.config.lease_duration();
    let renew_every = ctx.config.renew_interval();

    let timeout = tokio::time::sleep(ctx.config.execution_timeout());
    tokio::pin!(timeout);
    let mut renew = tokio::time::interval_at(tokio::time::Instant::now() + renew_every, renew_every);
    renew.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tokio::pin!(cancel_signal);
    let mut cancel_open = true;

    let end = loop {
        tokio::select! {
            joined = &mut unit.0 => break finished(joined),
            _ = &mut timeout => break ExecutionEnd::TimedOut,
            signal = &mut cancel_signal, if cancel_open => match signal {
                Ok(()) => break ExecutionEnd::Cancelled,
                // dispatcher went away; renewals still catch remote cancels
                Err(_) => cancel_open = false,
            },
            _ = renew.tick() => {
                let new_expiry = deadline_after(ctx.clock.now(), lease_duration);
                match ctx.queue.renew_lease(task_id, &ctx.node_id, new_expiry).await {
                    Ok(state) => {
                        lease_expires_at = state.expires_at;
                        if state.cancel_requested {
                            break ExecutionEnd::Cancelled;
                        }
                    }
                    Err(e) if e.is_transient() => {
                        if still_leased(ctx.clock.now(), lease_expires_at) {
                            warn!(node_id = %ctx.node_id, %task_id, error = %e, "lease renewal failed, retrying");
                        } else {
                            warn!(node_id = %ctx.node_id, %task_id, "lease ran out while the store was unreachable");
                            break ExecutionEnd::LeaseLost;
                        }
                    }
                    Err(e) => {
                        warn!(node_id = %ctx.node_id, %task_id, error = %e, "lease renewal refused, aborting");
                        break ExecutionEnd::LeaseLost;
                    }
                }
            }
        }
    };

    (end, lease_expires_at)
}

/// Aborts the handler when its execution unit ends early or is itself
/// aborted.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn finished(
    joined: Result<Result<serde_json::Value, HandlerError>, JoinError>,
) -> ExecutionEnd {
    match joined {
        Ok(result) => ExecutionEnd::Finished(result),
        Err(e) if e.is_panic() => {
            let panic = e.into_panic();
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            ExecutionEnd::Panicked(message)
        }
        Err(e) => ExecutionEnd::Panicked(format!("handler task aborted: {e}")),
    }
}

fn still_leased(now: DateTime<Utc>, expires_at: DateTime<Utc>) -> bool {
    now < expires_at
}

/// Write the outcome, retrying transient store errors until `lease_end`, the
/// last expiry the store confirmed.
async fn record(ctx: &NodeContext, task: &TaskEnvelope, end: &ExecutionEnd, lease_end: DateTime<Utc>) {
    let task_id = task.task_id;
    let node_id = &ctx.node_id;
    let attempts_left = task.has_attempts_left();
    let backoff = ctx.config.store_backoff();
    let mut failures = 0u32;

    loop {
        let result = match end {
            ExecutionEnd::Finished(Ok(value)) => {
                ctx.queue.complete(task_id, node_id, value.clone()).await
            }
            ExecutionEnd::Finished(Err(err)) => {
                let should_retry = attempts_left && err.is_retryable();
                ctx.queue
                    .fail(task_id, node_id, TaskFailure::handler(err.message.clone()), should_retry)
                    .await
            }
            ExecutionEnd::Panicked(message) => {
                let failure = TaskFailure::handler(format!("handler panicked: {message}"));
                ctx.queue.fail(task_id, node_id, failure, attempts_left).await
            }
            ExecutionEnd::TimedOut => {
                let failure = TaskFailure::timeout(ctx.config.execution_timeout());
                ctx.queue.fail(task_id, node_id, failure, attempts_left).await
            }
            ExecutionEnd::Cancelled => ctx.queue.finish_cancelled(task_id, node_id).await,
            ExecutionEnd::LeaseLost | ExecutionEnd::NotStarted => return,
        };

        match result {
            Ok(_) => return,
            Err(e) if e.is_transient() && still_leased(ctx.clock.now(), lease_end) => {
                failures += 1;
                let delay = backoff.next_delay(failures);
                debug!(%node_id, %task_id, error = %e, ?delay, "recording outcome failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                // the lease will lapse and the recovery sweep takes over
                warn!(%node_id, %task_id, error = %e, "could not record task outcome");
                return;
            }
        }
    }
}
