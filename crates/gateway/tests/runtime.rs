//! End-to-end scenarios over the assembled runtime: scripted LLM provider,
//! in-memory sandbox provider, real stores on a temp-dir database.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;

use leon_domain::config::Config;
use leon_domain::event::{EventType, RunEvent, RunStatus};
use leon_domain::message::Role;
use leon_gateway::bootstrap::build_state_with;
use leon_gateway::runtime::{producer, queue};
use leon_gateway::state::AppState;
use leon_providers::{ProviderRegistry, ScriptedProvider, ScriptedTurn};
use leon_sandbox::{MemSandboxProvider, ProviderManager};
use leon_store::{CheckpointConfig, Database, RoutingMode, ThreadRecord};

struct World {
    state: AppState,
    llm: Arc<ScriptedProvider>,
    #[allow(dead_code)]
    sandbox: Arc<MemSandboxProvider>,
}

fn build_world(dir: &Path, tune: impl FnOnce(&mut Config)) -> World {
    let mut config = Config::default();
    config.reconciler.interval_ms = 10;
    config.reconciler.converge_timeout_secs = 5;
    tune(&mut config);

    let db = Database::open(&dir.join("leon.db")).unwrap();
    let llm_provider = Arc::new(ScriptedProvider::new("scripted"));
    let llm = Arc::new(ProviderRegistry::new("scripted"));
    llm.register(llm_provider.clone());
    let sandbox_provider = Arc::new(MemSandboxProvider::new("mem"));
    let sandboxes = Arc::new(ProviderManager::new());
    sandboxes.register(sandbox_provider.clone());

    let state = build_state_with(Arc::new(config), db, llm, sandboxes).unwrap();
    World {
        state,
        llm: llm_provider,
        sandbox: sandbox_provider,
    }
}

fn thread(world: &World) -> ThreadRecord {
    let record = ThreadRecord::new("mem");
    world.state.threads.create(&record).unwrap();
    record
}

/// Drain an observer stream to completion (ends at a terminal event, or
/// when the log is exhausted with no live producer).
async fn collect_events(state: &AppState, thread_id: &str, after: u64) -> Vec<RunEvent> {
    let stream = state.supervisor.observe(thread_id, after).unwrap();
    let items = tokio::time::timeout(Duration::from_secs(10), stream.collect::<Vec<_>>())
        .await
        .expect("observer stream did not terminate");
    items.into_iter().map(|r| r.unwrap()).collect()
}

async fn wait_idle(state: &AppState, thread_id: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while state.supervisor.is_busy(thread_id) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "producer for {thread_id} did not finish"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn assert_gapless(events: &[RunEvent], start_after: u64) {
    let mut expected = start_after + 1;
    for evt in events {
        assert_eq!(evt.seq, expected, "seq gap in {:?}", evt.event_type);
        expected += 1;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: happy path
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn happy_path_events_and_second_observer() {
    let dir = tempfile::tempdir().unwrap();
    let world = build_world(dir.path(), |_| {});
    let t = thread(&world);

    world.llm.push(ScriptedTurn::text("hi"));
    let run = producer::start_run(&world.state, &t.thread_id, "hello")
        .await
        .unwrap();

    let events = collect_events(&world.state, &t.thread_id, 0).await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_type, EventType::Text);
    assert_eq!(events[0].data["content"], "hi");
    assert!(events[0].message_id.is_some());
    assert_eq!(events[1].event_type, EventType::Done);
    assert_gapless(&events, 0);

    // A late observer joining with after=0 sees the identical stream.
    let replayed = collect_events(&world.state, &t.thread_id, 0).await;
    assert_eq!(replayed.len(), 2);
    assert_eq!(
        replayed.iter().map(|e| e.seq).collect::<Vec<_>>(),
        events.iter().map(|e| e.seq).collect::<Vec<_>>()
    );

    // The log and the observer agree exactly.
    let logged = world
        .state
        .supervisor
        .event_log()
        .replay(&t.thread_id, run.run_id, 0)
        .unwrap();
    assert_eq!(logged.len(), events.len());

    let record = world
        .state
        .supervisor
        .run_store()
        .get(run.run_id)
        .unwrap()
        .unwrap();
    assert_eq!(record.status, RunStatus::Done);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: tool round with status event
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn tool_round_emits_call_result_status() {
    let dir = tempfile::tempdir().unwrap();
    let world = build_world(dir.path(), |_| {});
    let t = thread(&world);

    world
        .llm
        .push(ScriptedTurn::tool("shell", serde_json::json!({"command": "ls"})));
    world.llm.push(ScriptedTurn::text("listed"));

    producer::start_run(&world.state, &t.thread_id, "list files")
        .await
        .unwrap();
    let events = collect_events(&world.state, &t.thread_id, 0).await;

    let kinds: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        kinds,
        vec![
            EventType::ToolCall,
            EventType::ToolResult,
            EventType::Status,
            EventType::Text,
            EventType::Done,
        ]
    );
    assert_gapless(&events, 0);
    assert_eq!(events[1].data["is_error"], false);
    assert!(events[1].data["content"].as_str().unwrap().contains("ls"));

    // Checkpointed history holds the full tool dialog.
    let checkpoint = world
        .state
        .checkpoints
        .get(&CheckpointConfig::latest(&t.thread_id))
        .unwrap()
        .unwrap();
    let roles: Vec<Role> = checkpoint.messages.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: cancel during a slow tool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn cancel_during_tool_skips_tool_result() {
    let dir = tempfile::tempdir().unwrap();
    let world = build_world(dir.path(), |_| {});
    let t = thread(&world);

    world
        .llm
        .push(ScriptedTurn::tool("shell", serde_json::json!({"command": "sleep 30"})));

    let run = producer::start_run(&world.state, &t.thread_id, "long job")
        .await
        .unwrap();

    // Follow the live stream until the tool_call is out, then cancel.
    let mut stream = world.state.supervisor.observe(&t.thread_id, 0).unwrap();
    let first = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(first.event_type, EventType::ToolCall);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(world.state.supervisor.cancel_run(&t.thread_id));

    let mut rest = Vec::new();
    while let Some(evt) = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
    {
        rest.push(evt.unwrap());
    }
    let kinds: Vec<EventType> = rest.iter().map(|e| e.event_type).collect();
    assert_eq!(kinds, vec![EventType::Cancelled]);

    let record = world
        .state
        .supervisor
        .run_store()
        .get(run.run_id)
        .unwrap()
        .unwrap();
    assert_eq!(record.status, RunStatus::Cancelled);

    // The abandoned tool output never reached the checkpointed history.
    let checkpoint = world
        .state
        .checkpoints
        .get(&CheckpointConfig::latest(&t.thread_id))
        .unwrap()
        .unwrap();
    assert!(checkpoint.messages.iter().all(|m| m.role != Role::Tool));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: reconnect across restart
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn resume_cursor_survives_process_restart() {
    let dir = tempfile::tempdir().unwrap();
    let t = {
        let world = build_world(dir.path(), |_| {});
        let t = thread(&world);
        world.llm.push(ScriptedTurn {
            chunks: (0..6).map(|i| format!("c{i}")).collect(),
            ..Default::default()
        });
        producer::start_run(&world.state, &t.thread_id, "chunky")
            .await
            .unwrap();
        let events = collect_events(&world.state, &t.thread_id, 0).await;
        assert_eq!(events.len(), 7); // 6 text + done
        t
    };

    // A fresh process over the same database: no live buffer, the durable
    // log alone serves the resume cursor.
    let world = build_world(dir.path(), |_| {});
    let resumed = collect_events(&world.state, &t.thread_id, 5).await;
    let seqs: Vec<u64> = resumed.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![6, 7]);
    assert_eq!(resumed.last().unwrap().event_type, EventType::Done);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: steer into a live run
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn steer_injects_reminder_without_touching_queue() {
    let dir = tempfile::tempdir().unwrap();
    let world = build_world(dir.path(), |_| {});
    let t = thread(&world);

    world
        .llm
        .push(ScriptedTurn::tool("shell", serde_json::json!({"command": "sleep 0.5"})));
    world.llm.push(ScriptedTurn::text("finished"));

    producer::start_run(&world.state, &t.thread_id, "work")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let routing = queue::route_message(&world.state, &t.thread_id, "also check the logs", false)
        .await
        .unwrap();
    assert!(matches!(routing, queue::Routing::Steered));

    wait_idle(&world.state, &t.thread_id).await;

    // The next model call saw the reminder; the FIFO queue stayed empty.
    let checkpoint = world
        .state
        .checkpoints
        .get(&CheckpointConfig::latest(&t.thread_id))
        .unwrap()
        .unwrap();
    let reminder = checkpoint
        .messages
        .iter()
        .find(|m| m.role == Role::System && m.text().contains("<system-reminder>"))
        .expect("steer reminder missing from history");
    assert!(reminder.text().contains("also check the logs"));
    assert_eq!(world.state.queue.depth(&t.thread_id).unwrap(), 0);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: collect + idle drain (steer disabled)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn collected_message_dispatches_after_run() {
    let dir = tempfile::tempdir().unwrap();
    let world = build_world(dir.path(), |c| c.queue.steer_enabled = false);
    let t = thread(&world);

    world
        .llm
        .push(ScriptedTurn::tool("shell", serde_json::json!({"command": "sleep 0.4"})));
    world.llm.push(ScriptedTurn::text("first done"));
    world.llm.push(ScriptedTurn::text("second done"));

    producer::start_run(&world.state, &t.thread_id, "first")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let routing = queue::route_message(&world.state, &t.thread_id, "second", false)
        .await
        .unwrap();
    match routing {
        queue::Routing::Queued { mode, depth } => {
            assert_eq!(mode, RoutingMode::Collect);
            assert_eq!(depth, 1);
        }
        other => panic!("expected queued, got {other:?}"),
    }

    // First run finishes, the drain hook dispatches the collected message.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let runs = world
            .state
            .supervisor
            .run_store()
            .list_for_thread(&t.thread_id)
            .unwrap();
        if runs.len() == 2 && runs.iter().all(|r| r.status.is_terminal()) {
            assert!(runs.iter().any(|r| r.input_message == "second"));
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "followup never ran");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(world.state.queue.depth(&t.thread_id).unwrap(), 0);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: immediate dispatch vs. second run conflict
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn one_active_run_per_thread() {
    let dir = tempfile::tempdir().unwrap();
    let world = build_world(dir.path(), |_| {});
    let t = thread(&world);

    world
        .llm
        .push(ScriptedTurn::tool("shell", serde_json::json!({"command": "sleep 0.4"})));
    world.llm.push(ScriptedTurn::text("ok"));

    producer::start_run(&world.state, &t.thread_id, "one")
        .await
        .unwrap();
    let err = producer::start_run(&world.state, &t.thread_id, "two")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), leon_domain::ErrorKind::Conflict);

    wait_idle(&world.state, &t.thread_id).await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: provider failure becomes an error event
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn upstream_failure_surfaces_as_error_event() {
    let dir = tempfile::tempdir().unwrap();
    let world = build_world(dir.path(), |_| {});
    let t = thread(&world);

    world.llm.push(ScriptedTurn::failing("model melted"));

    let run = producer::start_run(&world.state, &t.thread_id, "doomed")
        .await
        .unwrap();
    let events = collect_events(&world.state, &t.thread_id, 0).await;

    let last = events.last().unwrap();
    assert_eq!(last.event_type, EventType::Error);
    assert!(last.data["message"].as_str().unwrap().contains("model melted"));
    assert_eq!(last.data["kind"], "transient_upstream");

    let record = world
        .state
        .supervisor
        .run_store()
        .get(run.run_id)
        .unwrap()
        .unwrap();
    assert_eq!(record.status, RunStatus::Error);
    assert!(record.error_text.is_some());

    // The thread recovers: a new message dispatches immediately.
    let routing = queue::route_message(&world.state, &t.thread_id, "try again", false)
        .await
        .unwrap();
    assert!(matches!(routing, queue::Routing::Dispatched { .. }));
    wait_idle(&world.state, &t.thread_id).await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: interrupt replaces the running run
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn interrupt_cancels_then_dispatches() {
    let dir = tempfile::tempdir().unwrap();
    let world = build_world(dir.path(), |_| {});
    let t = thread(&world);

    world
        .llm
        .push(ScriptedTurn::tool("shell", serde_json::json!({"command": "sleep 30"})));
    world.llm.push(ScriptedTurn::text("the replacement"));

    let first = producer::start_run(&world.state, &t.thread_id, "slow one")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let routing = queue::route_message(&world.state, &t.thread_id, "drop that, do this", true)
        .await
        .unwrap();
    let second_id = match routing {
        queue::Routing::Interrupted { run_id } => run_id,
        other => panic!("expected interrupt, got {other:?}"),
    };
    assert_ne!(first.run_id, second_id);

    wait_idle(&world.state, &t.thread_id).await;
    let first_record = world
        .state
        .supervisor
        .run_store()
        .get(first.run_id)
        .unwrap()
        .unwrap();
    assert_eq!(first_record.status, RunStatus::Cancelled);
    let second_record = world
        .state
        .supervisor
        .run_store()
        .get(second_id)
        .unwrap()
        .unwrap();
    assert_eq!(second_record.status, RunStatus::Done);
}
