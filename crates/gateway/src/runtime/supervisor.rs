//! Run supervisor — at most one producer per thread, durable event log,
//! observer fan-out with resume cursors.
//!
//! `emit` is the single choke point for events: assign the next seq,
//! append to the log (failure is fatal to the run), then publish to the
//! ring. Observers merge historical log reads with the live buffer and
//! always terminate after a terminal event.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;

use leon_domain::config::RunsConfig;
use leon_domain::event::{EventType, Run, RunEvent, RunStatus};
use leon_domain::stream::BoxStream;
use leon_domain::{Error, Result};
use leon_store::{EventLog, RunStore};

use super::buffer::RunEventBuffer;
use super::cancel::{CancelMap, CancelToken};
use super::machine::{Flags, MachineRegistry, SupervisorState};
use super::monitor::{MonitorRegistry, ThreadMonitorSnapshot};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status snapshot
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStatus {
    pub state: SupervisorState,
    pub flags: Flags,
    #[serde(flatten)]
    pub monitor: ThreadMonitorSnapshot,
    pub last_seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<uuid::Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_status: Option<RunStatus>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Supervisor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Supervisor {
    config: RunsConfig,
    event_log: Arc<EventLog>,
    run_store: Arc<RunStore>,
    /// thread_id → live buffer. Presence means a producer is (or is about
    /// to be) running for the thread.
    buffers: RwLock<HashMap<String, Arc<RunEventBuffer>>>,
    /// thread_id → producer task handle, for the cancel watchdog.
    tasks: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
    pub cancel_map: CancelMap,
    pub machines: MachineRegistry,
    pub monitors: MonitorRegistry,
}

impl Supervisor {
    pub fn new(config: RunsConfig, event_log: Arc<EventLog>, run_store: Arc<RunStore>) -> Arc<Self> {
        Arc::new(Self {
            config,
            event_log,
            run_store,
            buffers: RwLock::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            cancel_map: CancelMap::new(),
            machines: MachineRegistry::new(),
            monitors: MonitorRegistry::new(),
        })
    }

    pub fn run_store(&self) -> &Arc<RunStore> {
        &self.run_store
    }

    pub fn event_log(&self) -> &Arc<EventLog> {
        &self.event_log
    }

    /// Is a producer live for this thread?
    pub fn is_busy(&self, thread_id: &str) -> bool {
        self.buffers.read().contains_key(thread_id)
    }

    // ── Run lifecycle ──────────────────────────────────────────────

    /// Reserve the thread for a new run: record it, install the buffer,
    /// register the cancel token. Fails `Conflict` when a run is active.
    pub fn begin_run(&self, thread_id: &str, input_message: &str) -> Result<(Run, Arc<RunEventBuffer>, CancelToken)> {
        let mut buffers = self.buffers.write();
        if buffers.contains_key(thread_id) {
            return Err(Error::already_running(thread_id));
        }
        if self.run_store.active_for_thread(thread_id)?.is_some() {
            return Err(Error::already_running(thread_id));
        }

        let run = Run::new(thread_id, input_message);
        self.run_store.insert(&run)?;

        let buffer = Arc::new(RunEventBuffer::new(run.run_id, self.config.ring_capacity));
        buffers.insert(thread_id.to_owned(), buffer.clone());
        let token = self.cancel_map.register(thread_id);
        self.machines.get(thread_id).transition(SupervisorState::Running);

        tracing::info!(thread_id, run_id = %run.run_id, "run started");
        Ok((run, buffer, token))
    }

    /// Track the producer task so the cancel watchdog can abort it.
    pub fn track_task(&self, thread_id: &str, handle: tokio::task::JoinHandle<()>) {
        self.tasks.lock().insert(thread_id.to_owned(), handle);
    }

    /// Sequence, persist, publish. Log append failure is fatal to the run.
    pub fn emit(&self, thread_id: &str, buffer: &RunEventBuffer, mut evt: RunEvent) -> Result<RunEvent> {
        buffer.assign_seq(&mut evt);
        self.event_log
            .append(thread_id, buffer.run_id(), &evt)
            .map_err(|e| Error::Fatal(format!("event log append: {e}")))?;
        buffer.publish(evt.clone());
        Ok(evt)
    }

    /// Finish the run record and tear down the per-thread entry. Keeps
    /// only the latest run's events in the log.
    pub fn finish_run(
        &self,
        thread_id: &str,
        run_id: uuid::Uuid,
        status: RunStatus,
        error_text: Option<&str>,
    ) {
        if let Err(e) = self.run_store.finish(run_id, status, error_text) {
            tracing::error!(thread_id, error = %e, "failed to finish run record");
        }
        if let Err(e) = self.event_log.retain_only(thread_id, run_id) {
            tracing::warn!(thread_id, error = %e, "event retention failed");
        }
        self.buffers.write().remove(thread_id);
        self.tasks.lock().remove(thread_id);
        self.cancel_map.remove(thread_id);
        tracing::info!(thread_id, run_id = %run_id, status = status.as_str(), "run finished");
    }

    // ── Cancellation ───────────────────────────────────────────────

    /// Signal the producer to stop and arm the grace-period watchdog.
    /// Returns false when no run is active.
    pub fn cancel_run(self: &Arc<Self>, thread_id: &str) -> bool {
        if !self.cancel_map.cancel(thread_id) {
            return false;
        }
        self.machines.get(thread_id).transition(SupervisorState::Cancelling);

        let this = self.clone();
        let thread_id = thread_id.to_owned();
        let grace = Duration::from_secs(self.config.cancel_grace_secs.max(1));
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            this.force_abort(&thread_id);
        });
        true
    }

    /// Watchdog body: if the producer is still tracked after the grace
    /// period, abort it and close the run as an error.
    fn force_abort(self: &Arc<Self>, thread_id: &str) {
        let Some(handle) = self.tasks.lock().remove(thread_id) else {
            return; // producer exited cleanly
        };
        handle.abort();
        tracing::warn!(thread_id, "producer aborted after cancel grace period");

        let Some(buffer) = self.buffers.read().get(thread_id).cloned() else {
            return;
        };
        let run_id = buffer.run_id();
        // Only emit the terminal error if the producer never got there.
        let already_terminal = self
            .run_store
            .get(run_id)
            .ok()
            .flatten()
            .map(|r| r.status.is_terminal())
            .unwrap_or(false);
        if !already_terminal {
            let evt = RunEvent::new(
                EventType::Error,
                serde_json::json!({
                    "message": "cancel grace period exceeded",
                    "kind": "fatal",
                }),
            );
            if let Err(e) = self.emit(thread_id, &buffer, evt) {
                tracing::error!(thread_id, error = %e, "failed to emit watchdog error");
            }
        }
        self.finish_run(thread_id, run_id, RunStatus::Error, Some("cancel timeout"));
        self.machines.get(thread_id).transition(SupervisorState::Idle);
    }

    // ── Observation ────────────────────────────────────────────────

    /// The merged historical + live event stream for a thread, starting
    /// after `after`. The stream ends after a terminal event, or after
    /// draining the log when no producer is live.
    pub fn observe(&self, thread_id: &str, after: u64) -> Result<BoxStream<'static, Result<RunEvent>>> {
        let live = self.buffers.read().get(thread_id).cloned();
        let log = self.event_log.clone();
        let thread_id = thread_id.to_owned();

        let Some(buffer) = live else {
            // No live buffer: replay the latest run's remaining log and end.
            let run = self
                .run_store
                .latest_for_thread(&thread_id)?
                .ok_or_else(|| Error::NotFound(format!("no runs for thread {thread_id}")))?;
            let events = log.replay(&thread_id, run.run_id, after)?;
            return Ok(Box::pin(futures_util::stream::iter(events.into_iter().map(Ok))));
        };

        let run_id = buffer.run_id();
        let sub = buffer.subscribe(after);

        // When the ring has already evicted events the cursor needs, fill
        // the gap from the durable log.
        let prefix: Vec<RunEvent> = match sub.backlog.first() {
            Some(first) if first.seq > after + 1 => log
                .replay(&thread_id, run_id, after)?
                .into_iter()
                .filter(|e| e.seq < first.seq)
                .collect(),
            Some(_) => Vec::new(),
            None => log.replay(&thread_id, run_id, after)?,
        };

        let backlog = sub.backlog;
        let mut rx = sub.rx;
        let stream = async_stream::stream! {
            let mut last = after;

            for evt in prefix.into_iter().chain(backlog) {
                if evt.seq <= last {
                    continue;
                }
                last = evt.seq;
                let terminal = evt.event_type.is_terminal();
                yield Ok(evt);
                if terminal {
                    return;
                }
            }

            loop {
                match rx.recv().await {
                    Ok(evt) => {
                        if evt.seq <= last {
                            continue;
                        }
                        last = evt.seq;
                        let terminal = evt.event_type.is_terminal();
                        yield Ok(evt);
                        if terminal {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // Fell off the ring; catch up from the durable log
                        // and keep following the live feed.
                        tracing::debug!(thread_id = %thread_id, lagged = n, "observer lagged, recovering from log");
                        let events = match log.replay(&thread_id, run_id, last) {
                            Ok(events) => events,
                            Err(e) => {
                                yield Err(e);
                                return;
                            }
                        };
                        for evt in events {
                            if evt.seq <= last {
                                continue;
                            }
                            last = evt.seq;
                            let terminal = evt.event_type.is_terminal();
                            yield Ok(evt);
                            if terminal {
                                return;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        // Producer gone; drain whatever made it to the log.
                        if let Ok(events) = log.replay(&thread_id, run_id, last) {
                            for evt in events {
                                if evt.seq <= last {
                                    continue;
                                }
                                last = evt.seq;
                                yield Ok(evt);
                            }
                        }
                        return;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    // ── Status ─────────────────────────────────────────────────────

    pub fn runtime_status(&self, thread_id: &str) -> Result<RuntimeStatus> {
        let (state, mut flags) = self.machines.get(thread_id).snapshot();
        let monitor = self.monitors.snapshot(thread_id);

        let (last_seq, run_id, run_status) = match self.buffers.read().get(thread_id) {
            Some(buffer) => (buffer.last_seq(), Some(buffer.run_id()), Some(RunStatus::Running)),
            None => match self.run_store.latest_for_thread(thread_id)? {
                Some(run) => (
                    self.event_log.last_seq(thread_id, run.run_id)?,
                    Some(run.run_id),
                    Some(run.status),
                ),
                None => (0, None, None),
            },
        };
        flags.awaiting_user = state == SupervisorState::Idle;

        Ok(RuntimeStatus {
            state,
            flags,
            monitor,
            last_seq,
            run_id,
            run_status,
        })
    }

    // ── Shutdown ───────────────────────────────────────────────────

    /// Drain all producers: cancel every run, then wait (bounded) for the
    /// per-thread entries to clear.
    pub async fn shutdown(self: &Arc<Self>) {
        let threads: Vec<String> = self.buffers.read().keys().cloned().collect();
        for thread_id in &threads {
            self.cancel_run(thread_id);
            self.machines.get(thread_id).transition(SupervisorState::Shutdown);
        }
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.cancel_grace_secs + 2);
        while !self.buffers.read().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use leon_store::Database;

    fn supervisor() -> Arc<Supervisor> {
        let db = Database::open_in_memory().unwrap();
        Supervisor::new(
            RunsConfig {
                ring_capacity: 16,
                cancel_grace_secs: 1,
                max_tool_loops: 25,
            },
            Arc::new(EventLog::new(db.clone())),
            Arc::new(RunStore::new(db)),
        )
    }

    fn text_evt(content: &str) -> RunEvent {
        RunEvent::new(EventType::Text, serde_json::json!({"content": content}))
    }

    #[tokio::test]
    async fn begin_run_enforces_single_active() {
        let sup = supervisor();
        let (run, _buffer, _token) = sup.begin_run("t1", "hello").unwrap();

        let err = sup.begin_run("t1", "again").unwrap_err();
        assert_eq!(err.kind(), leon_domain::ErrorKind::Conflict);

        // Other threads are unaffected.
        sup.begin_run("t2", "independent").unwrap();

        sup.finish_run("t1", run.run_id, RunStatus::Done, None);
        sup.begin_run("t1", "next").unwrap();
    }

    #[tokio::test]
    async fn emit_assigns_gapless_seq_and_persists() {
        let sup = supervisor();
        let (run, buffer, _token) = sup.begin_run("t1", "hi").unwrap();

        for i in 0..5 {
            let evt = sup.emit("t1", &buffer, text_evt(&format!("c{i}"))).unwrap();
            assert_eq!(evt.seq, i + 1);
        }
        let logged = sup.event_log.replay("t1", run.run_id, 0).unwrap();
        let seqs: Vec<u64> = logged.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn observe_live_then_terminal() {
        let sup = supervisor();
        let (_run, buffer, _token) = sup.begin_run("t1", "hi").unwrap();
        sup.emit("t1", &buffer, text_evt("a")).unwrap();

        let mut stream = sup.observe("t1", 0).unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.seq, 1);

        sup.emit("t1", &buffer, text_evt("b")).unwrap();
        sup.emit(
            "t1",
            &buffer,
            RunEvent::new(EventType::Done, serde_json::json!({})),
        )
        .unwrap();

        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.seq, 2);
        let done = stream.next().await.unwrap().unwrap();
        assert_eq!(done.event_type, EventType::Done);
        // Stream ends after the terminal event.
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn observe_resume_cursor_is_exact() {
        let sup = supervisor();
        let (run, buffer, _token) = sup.begin_run("t1", "hi").unwrap();
        for i in 0..4 {
            sup.emit("t1", &buffer, text_evt(&format!("c{i}"))).unwrap();
        }
        sup.emit(
            "t1",
            &buffer,
            RunEvent::new(EventType::Done, serde_json::json!({})),
        )
        .unwrap();
        sup.finish_run("t1", run.run_id, RunStatus::Done, None);

        // Buffer gone: resume reads the remaining log and terminates.
        let mut stream = sup.observe("t1", 2).unwrap();
        let mut seqs = Vec::new();
        while let Some(evt) = stream.next().await {
            seqs.push(evt.unwrap().seq);
        }
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn observe_ring_eviction_backfills_from_log() {
        let sup = supervisor();
        let (_run, buffer, _token) = sup.begin_run("t1", "hi").unwrap();
        // Ring capacity is 16; push enough to evict early events.
        for i in 0..30 {
            sup.emit("t1", &buffer, text_evt(&format!("c{i}"))).unwrap();
        }
        sup.emit(
            "t1",
            &buffer,
            RunEvent::new(EventType::Done, serde_json::json!({})),
        )
        .unwrap();

        let mut stream = sup.observe("t1", 0).unwrap();
        let mut seqs = Vec::new();
        while let Some(evt) = stream.next().await {
            seqs.push(evt.unwrap().seq);
        }
        // Exactly 1..=31 with no gaps despite the eviction.
        assert_eq!(seqs, (1..=31).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn observe_unknown_thread_is_not_found() {
        let sup = supervisor();
        let err = match sup.observe("ghost", 0) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert_eq!(err.kind(), leon_domain::ErrorKind::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_watchdog_aborts_stuck_producer() {
        let sup = supervisor();
        let (run, _buffer, _token) = sup.begin_run("t1", "hi").unwrap();

        // A producer that ignores its cancel token.
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        sup.track_task("t1", handle);

        assert!(sup.cancel_run("t1"));
        // Let the watchdog fire.
        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;

        let finished = sup.run_store.get(run.run_id).unwrap().unwrap();
        assert_eq!(finished.status, RunStatus::Error);
        assert_eq!(finished.error_text.as_deref(), Some("cancel timeout"));
        assert!(!sup.is_busy("t1"));
    }

    #[tokio::test]
    async fn cancel_without_run_is_false() {
        let sup = supervisor();
        assert!(!sup.cancel_run("t1"));
    }

    #[tokio::test]
    async fn runtime_status_reflects_buffer() {
        let sup = supervisor();
        let status = sup.runtime_status("t1").unwrap();
        assert_eq!(status.last_seq, 0);
        assert!(status.run_id.is_none());

        let (run, buffer, _token) = sup.begin_run("t1", "hi").unwrap();
        sup.emit("t1", &buffer, text_evt("a")).unwrap();
        let status = sup.runtime_status("t1").unwrap();
        assert_eq!(status.state, SupervisorState::Running);
        assert_eq!(status.last_seq, 1);
        assert_eq!(status.run_id, Some(run.run_id));
    }
}
