//! The producer — one task driving the agent loop for one run.
//!
//! Every observable moment goes through `Supervisor::emit`, which persists
//! to the event log before publishing to the ring. The producer catches
//! every error at the top of its loop: failures before the terminal event
//! become an `error` event; the terminal event is emitted exactly once.

use futures_util::StreamExt;
use tracing::Instrument;

use leon_domain::event::{EventType, Run, RunEvent, RunStatus};
use leon_domain::message::{Message, ToolCall};
use leon_domain::stream::{StreamEvent, Usage};
use leon_domain::{Error, Result};
use leon_providers::ChatRequest;
use leon_store::{Checkpoint, CheckpointConfig, ThreadRecord};

use super::buffer::RunEventBuffer;
use super::cancel::CancelToken;
use super::machine::SupervisorState;
use super::tools;
use crate::state::AppState;

enum Outcome {
    Done,
    Cancelled,
}

/// Start a run for a thread: reserve it with the supervisor and launch
/// the producer task. Returns immediately; events flow to observers.
///
/// Returns a boxed, type-erased future (rather than `async fn`) because
/// `start_run` sits in a mutual-recursion cycle with `produce` and
/// `queue::drain_idle` (produce -> drain_idle -> start_run -> spawns
/// produce); an opaque `impl Future` here would make that cycle
/// self-referential and the compiler cannot prove it `Send`.
pub fn start_run<'a>(
    state: &'a AppState,
    thread_id: &'a str,
    message: &'a str,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Run>> + Send + 'a>> {
    Box::pin(async move {
        let thread = state
            .threads
            .get(thread_id)?
            .ok_or_else(|| Error::thread_not_found(thread_id))?;

        let (run, buffer, token) = state.supervisor.begin_run(thread_id, message)?;

        let span = tracing::info_span!("run", run_id = %run.run_id, thread_id = %thread_id);
        let task_state = state.clone();
        let task_run = run.clone();
        let fut: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> = Box::pin(
            async move {
                produce(task_state, thread, task_run, buffer, token).await;
            }
            .instrument(span),
        );
        let handle = tokio::spawn(fut);
        state.supervisor.track_task(thread_id, handle);
        Ok(run)
    })
}

/// Producer outer shell: run the loop, emit exactly one terminal event,
/// tear down, and hand the thread back to the queue router.
async fn produce(
    state: AppState,
    thread: ThreadRecord,
    run: Run,
    buffer: std::sync::Arc<RunEventBuffer>,
    cancel: CancelToken,
) {
    let thread_id = run.thread_id.clone();
    let machine = state.supervisor.machines.get(&thread_id);

    let outcome = run_loop(&state, &thread, &run, &buffer, &cancel).await;

    let (status, error_text) = match outcome {
        Ok(Outcome::Done) => {
            let evt = RunEvent::new(EventType::Done, serde_json::json!({"run_id": run.run_id}));
            if let Err(e) = state.supervisor.emit(&thread_id, &buffer, evt) {
                tracing::error!(error = %e, "failed to emit done");
            }
            (RunStatus::Done, None)
        }
        Ok(Outcome::Cancelled) => {
            let evt =
                RunEvent::new(EventType::Cancelled, serde_json::json!({"run_id": run.run_id}));
            if let Err(e) = state.supervisor.emit(&thread_id, &buffer, evt) {
                tracing::error!(error = %e, "failed to emit cancelled");
            }
            (RunStatus::Cancelled, None)
        }
        Err(e) => {
            machine.transition(SupervisorState::Error);
            // The ERROR state is observable before the terminal event.
            if let Err(status_err) = emit_status(&state, &thread_id, &buffer) {
                tracing::warn!(error = %status_err, "failed to emit error status");
            }
            let evt = RunEvent::new(
                EventType::Error,
                serde_json::json!({"message": e.to_string(), "kind": e.kind()}),
            );
            if let Err(emit_err) = state.supervisor.emit(&thread_id, &buffer, evt) {
                tracing::error!(error = %emit_err, "failed to emit error event");
            }
            (RunStatus::Error, Some(e.to_string()))
        }
    };

    state
        .supervisor
        .finish_run(&thread_id, run.run_id, status, error_text.as_deref());
    state.supervisor.monitors.set_current_tool(&thread_id, None);

    if status == RunStatus::Error {
        machine.transition(SupervisorState::Recovering);
    }
    machine.transition(SupervisorState::Idle);

    // on_enter_idle: hand the head of the queue to the router.
    super::queue::drain_idle(state, &thread_id).await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The agent loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_loop(
    state: &AppState,
    thread: &ThreadRecord,
    run: &Run,
    buffer: &RunEventBuffer,
    cancel: &CancelToken,
) -> Result<Outcome> {
    let thread_id = &run.thread_id;
    state
        .supervisor
        .machines
        .get(thread_id)
        .transition(SupervisorState::Running);

    // Resolve the sandbox-backed terminal before any model call.
    let mut resources = state.resolver.resolve(thread).await?;

    let result = agent_loop(state, run, buffer, cancel, &mut resources.terminal).await;

    // Persist terminal state back onto the abstract terminal whatever the
    // loop's outcome was.
    if let Err(e) = resources.terminal.detach() {
        tracing::warn!(thread_id, error = %e, "terminal detach failed");
    }
    result
}

async fn agent_loop(
    state: &AppState,
    run: &Run,
    buffer: &RunEventBuffer,
    cancel: &CancelToken,
    terminal: &mut super::terminal::TerminalRuntime,
) -> Result<Outcome> {
    let thread_id = &run.thread_id;
    let machine = state.supervisor.machines.get(thread_id);

    // Checkpoints are the source of truth for messages.
    let ck_config = CheckpointConfig::latest(thread_id);
    let (mut history, mut parent_id) = match state.checkpoints.get(&ck_config)? {
        Some(ck) => (ck.messages, Some(ck.checkpoint_id)),
        None => (Vec::new(), None),
    };

    history.push(Message::user(&run.input_message));
    save_checkpoint(state, &ck_config, &mut parent_id, &history, run, 0)?;

    let provider = state
        .llm
        .resolve(None)
        .ok_or_else(|| Error::TransientUpstream("no LLM provider configured".into()))?;
    let model = provider.model().to_owned();
    let tool_defs = tools::definitions();
    let mut total_usage = Usage::default();

    for loop_idx in 0..state.config.runs.max_tool_loops {
        if cancel.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }

        // Steering: inject queued mid-run messages as system reminders
        // ahead of this model call.
        for steer in state.router.take_steer(thread_id) {
            history.push(Message::system(format!(
                "<system-reminder>\n{steer}\n</system-reminder>"
            )));
        }
        machine.update_flags(|f| f.steer_requested = false);

        let prepared = state
            .memory
            .prepare(thread_id, &model, &history, Some(&machine))
            .await?;
        state.supervisor.monitors.record_context(
            thread_id,
            prepared.messages.len(),
            prepared.estimated_tokens,
            prepared.context_limit,
        );

        let req = ChatRequest {
            messages: prepared.messages,
            tools: tool_defs.clone(),
            temperature: Some(0.2),
            max_tokens: None,
            model: None,
        };
        let mut stream = provider.chat_stream(req).await?;

        let mut text_buf = String::new();
        let mut assistant_message_id: Option<String> = None;
        let mut pending_calls: Vec<ToolCall> = Vec::new();

        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return Ok(Outcome::Cancelled),
                item = stream.next() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            match item? {
                StreamEvent::Chunk { message_id, text } => {
                    // Emit per chunk; clients deduplicate by message_id.
                    let evt = RunEvent::new(EventType::Text, serde_json::json!({"content": text}))
                        .with_message_id(&message_id);
                    state.supervisor.emit(thread_id, buffer, evt)?;
                    assistant_message_id.get_or_insert(message_id);
                    text_buf.push_str(&text);
                }
                StreamEvent::ToolCall { message_id, call } => {
                    let evt = RunEvent::new(
                        EventType::ToolCall,
                        serde_json::json!({
                            "call_id": call.call_id,
                            "tool_name": call.tool_name,
                            "arguments": call.arguments,
                        }),
                    )
                    .with_message_id(&message_id);
                    state.supervisor.emit(thread_id, buffer, evt)?;
                    assistant_message_id.get_or_insert(message_id);
                    pending_calls.push(call);
                }
                StreamEvent::Done { usage } => {
                    if let Some(usage) = usage {
                        total_usage.add(&usage);
                        state.supervisor.monitors.record_usage(
                            thread_id,
                            &model,
                            &usage,
                            &state.config.model,
                        );
                    }
                }
                StreamEvent::Error { message } => {
                    return Err(Error::TransientUpstream(message));
                }
            }
        }

        // Record the assistant turn under the model's message id.
        let mut assistant = Message::assistant_with_tools(&text_buf, pending_calls.clone());
        if let Some(id) = assistant_message_id {
            assistant.id = id;
        }
        history.push(assistant);
        save_checkpoint(state, &ck_config, &mut parent_id, &history, run, loop_idx + 1)?;

        if pending_calls.is_empty() {
            tracing::debug!(
                thread_id,
                input_tokens = total_usage.input_tokens,
                output_tokens = total_usage.output_tokens,
                "agent loop finished"
            );
            return Ok(Outcome::Done);
        }

        // ── Tool round ─────────────────────────────────────────────
        machine.transition(SupervisorState::ToolExec);
        for call in &pending_calls {
            state
                .supervisor
                .monitors
                .set_current_tool(thread_id, Some(call.tool_name.clone()));

            // A slow tool is abandoned on cancel: the tool_call event is
            // already out, the tool_result never happens.
            let (content, is_error) = tokio::select! {
                _ = cancel.cancelled() => return Ok(Outcome::Cancelled),
                result = tools::dispatch(terminal, thread_id, call) => result,
            };

            let evt = RunEvent::new(
                EventType::ToolResult,
                serde_json::json!({
                    "call_id": call.call_id,
                    "tool_name": call.tool_name,
                    "content": content,
                    "is_error": is_error,
                }),
            );
            state.supervisor.emit(thread_id, buffer, evt)?;

            history.push(Message::tool_result(&call.call_id, &content));
            save_checkpoint(state, &ck_config, &mut parent_id, &history, run, loop_idx + 1)?;
        }
        state.supervisor.monitors.set_current_tool(thread_id, None);
        machine.transition(SupervisorState::Running);

        // Status snapshot after every tool round.
        emit_status(state, thread_id, buffer)?;
    }

    Err(Error::Fatal(format!(
        "tool loop limit reached ({} iterations)",
        state.config.runs.max_tool_loops
    )))
}

fn emit_status(state: &AppState, thread_id: &str, buffer: &RunEventBuffer) -> Result<()> {
    let mut status = state.supervisor.runtime_status(thread_id)?;
    status.flags.has_pending_queue = state.queue.depth(thread_id)? > 0;
    let evt = RunEvent::new(EventType::Status, serde_json::to_value(&status)?);
    state.supervisor.emit(thread_id, buffer, evt)?;
    Ok(())
}

fn save_checkpoint(
    state: &AppState,
    config: &CheckpointConfig,
    parent_id: &mut Option<String>,
    history: &[Message],
    run: &Run,
    step: usize,
) -> Result<()> {
    let checkpoint = Checkpoint::next(
        parent_id.clone(),
        history.to_vec(),
        serde_json::json!({"run_id": run.run_id, "step": step}),
    );
    *parent_id = Some(checkpoint.checkpoint_id.clone());
    state.checkpoints.put(
        config,
        checkpoint,
        serde_json::json!({"source": "producer", "step": step}),
    )
}
