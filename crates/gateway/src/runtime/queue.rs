//! Queue router — decides what happens to an inbound user message based
//! on the thread's state machine.
//!
//! Within a thread messages are strictly FIFO; steering preempts FIFO by
//! injecting into the live run, not by reordering the queue.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use leon_domain::{Error, Result};
use leon_store::RoutingMode;

use super::machine::SupervisorState;
use super::producer;
use crate::state::AppState;

/// What the router did with a message; returned to the HTTP caller.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "routing", rename_all = "snake_case")]
pub enum Routing {
    /// A new run was started right away.
    Dispatched { run_id: uuid::Uuid, mode: RoutingMode },
    /// The message waits in the thread's mailbox.
    Queued { mode: RoutingMode, depth: usize },
    /// Injected into the live run's next model call.
    Steered,
    /// The running run was cancelled and the message dispatched.
    Interrupted { run_id: uuid::Uuid },
}

/// Per-thread steer slots, drained by the producer before each model call.
#[derive(Default)]
pub struct QueueRouter {
    steer: Mutex<HashMap<String, Vec<String>>>,
}

impl QueueRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_steer(&self, thread_id: &str, content: String) {
        self.steer
            .lock()
            .entry(thread_id.to_owned())
            .or_default()
            .push(content);
    }

    pub fn take_steer(&self, thread_id: &str) -> Vec<String> {
        self.steer.lock().remove(thread_id).unwrap_or_default()
    }

    pub fn pending_steer(&self, thread_id: &str) -> usize {
        self.steer.lock().get(thread_id).map_or(0, Vec::len)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Routing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Route one inbound user message. `interrupt` is the explicit user
/// override that cancels the current run first.
pub async fn route_message(
    state: &AppState,
    thread_id: &str,
    content: &str,
    interrupt: bool,
) -> Result<Routing> {
    if !state.threads.exists(thread_id)? {
        return Err(Error::thread_not_found(thread_id));
    }

    let machine = state.supervisor.machines.get(thread_id);
    let current = machine.state();

    if interrupt && current.is_busy() {
        return interrupt_and_dispatch(state, thread_id, content).await;
    }

    match current {
        SupervisorState::Idle | SupervisorState::Recovering => {
            if state.queue.depth(thread_id)? == 0 {
                let run = producer::start_run(state, thread_id, content).await?;
                Ok(Routing::Dispatched {
                    run_id: run.run_id,
                    mode: RoutingMode::Immediate,
                })
            } else {
                queue_message(state, thread_id, content, RoutingMode::Followup)
            }
        }
        SupervisorState::Running | SupervisorState::ToolExec => {
            if state.config.queue.steer_enabled {
                state.router.push_steer(thread_id, content.to_owned());
                machine.update_flags(|f| f.steer_requested = true);
                tracing::info!(thread_id, "message steered into live run");
                Ok(Routing::Steered)
            } else {
                queue_message(state, thread_id, content, RoutingMode::Collect)
            }
        }
        SupervisorState::Suspended => {
            tracing::warn!(thread_id, "thread suspended; message parked for the operator");
            queue_message(state, thread_id, content, RoutingMode::SteerBacklog)
        }
        SupervisorState::Cancelling | SupervisorState::Error => {
            queue_message(state, thread_id, content, RoutingMode::Followup)
        }
        SupervisorState::Shutdown => Err(Error::Conflict(format!(
            "thread {thread_id} is shutting down"
        ))),
    }
}

fn queue_message(
    state: &AppState,
    thread_id: &str,
    content: &str,
    mode: RoutingMode,
) -> Result<Routing> {
    state.queue.enqueue(thread_id, content, mode)?;
    let depth = state.queue.depth(thread_id)?;
    state
        .supervisor
        .machines
        .get(thread_id)
        .update_flags(|f| f.has_pending_queue = true);
    tracing::debug!(thread_id, mode = mode.as_str(), depth, "message queued");
    Ok(Routing::Queued { mode, depth })
}

async fn interrupt_and_dispatch(state: &AppState, thread_id: &str, content: &str) -> Result<Routing> {
    let machine = state.supervisor.machines.get(thread_id);
    machine.update_flags(|f| f.interrupt_requested = true);
    state.supervisor.cancel_run(thread_id);

    // Wait for the producer to clear, bounded by the cancel grace period
    // plus the watchdog's slack.
    let deadline = tokio::time::Instant::now()
        + Duration::from_secs(state.config.runs.cancel_grace_secs + 2);
    while state.supervisor.is_busy(thread_id) {
        if tokio::time::Instant::now() >= deadline {
            machine.update_flags(|f| f.interrupt_requested = false);
            return Err(Error::Conflict(format!(
                "thread {thread_id} did not stop in time"
            )));
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    machine.update_flags(|f| f.interrupt_requested = false);

    let run = producer::start_run(state, thread_id, content).await?;
    Ok(Routing::Interrupted { run_id: run.run_id })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Idle drain
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `on_enter_idle` hook: pop the FIFO head and act on it. Run-starting
/// entries dispatch one run (whose completion drains the next); notice
/// entries are consumed in place.
pub async fn drain_idle(state: AppState, thread_id: &str) {
    loop {
        let head = match state.queue.pop_head(thread_id) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                state
                    .supervisor
                    .machines
                    .get(thread_id)
                    .update_flags(|f| f.has_pending_queue = false);
                return;
            }
            Err(e) => {
                tracing::error!(thread_id, error = %e, "queue drain failed");
                return;
            }
        };

        match head.mode {
            RoutingMode::TaskNotification => {
                tracing::info!(thread_id, content = %head.content, "task notification drained");
                continue;
            }
            _ => match producer::start_run(&state, thread_id, &head.content).await {
                Ok(run) => {
                    tracing::debug!(thread_id, run_id = %run.run_id, "queued message dispatched");
                    return;
                }
                Err(e) if e.kind() == leon_domain::ErrorKind::Conflict => {
                    // A new run won the race; put the message back.
                    tracing::warn!(thread_id, error = %e, "drain raced a new run; requeueing");
                    if let Err(e) = state.queue.enqueue(thread_id, &head.content, head.mode) {
                        tracing::error!(thread_id, error = %e, "requeue failed, message dropped");
                    }
                    return;
                }
                Err(e) => {
                    tracing::error!(thread_id, error = %e, "queued message failed to dispatch");
                    return;
                }
            },
        }
    }
}
