//! Per-thread supervisor state machine.
//!
//! The machine is observational: the producer and the queue router drive
//! transitions, the router reads the state to pick a routing mode, and the
//! runtime-status endpoint snapshots it. Transitions are logged at debug.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State & flags
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Idle,
    Running,
    ToolExec,
    Suspended,
    Error,
    Recovering,
    Cancelling,
    Shutdown,
}

impl SupervisorState {
    /// A run may be dispatched from these states.
    pub fn can_start_run(self) -> bool {
        matches!(self, Self::Idle | Self::Recovering)
    }

    /// A producer is live in these states.
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Running | Self::ToolExec | Self::Cancelling)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Flags {
    pub has_pending_queue: bool,
    pub compacting: bool,
    pub sandbox_paused: bool,
    pub rate_limited: bool,
    pub awaiting_user: bool,
    pub steer_requested: bool,
    pub interrupt_requested: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Machine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ThreadMachine {
    thread_id: String,
    inner: Mutex<(SupervisorState, Flags)>,
}

impl ThreadMachine {
    fn new(thread_id: String) -> Self {
        Self {
            thread_id,
            inner: Mutex::new((SupervisorState::Idle, Flags::default())),
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.inner.lock().0
    }

    pub fn flags(&self) -> Flags {
        self.inner.lock().1
    }

    pub fn snapshot(&self) -> (SupervisorState, Flags) {
        *self.inner.lock()
    }

    pub fn transition(&self, to: SupervisorState) {
        let mut inner = self.inner.lock();
        let from = inner.0;
        if from == to {
            return;
        }
        inner.0 = to;
        tracing::debug!(thread_id = %self.thread_id, ?from, ?to, "state transition");
    }

    pub fn update_flags(&self, f: impl FnOnce(&mut Flags)) {
        f(&mut self.inner.lock().1);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct MachineRegistry {
    machines: RwLock<HashMap<String, Arc<ThreadMachine>>>,
}

impl MachineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, thread_id: &str) -> Arc<ThreadMachine> {
        if let Some(machine) = self.machines.read().get(thread_id) {
            return machine.clone();
        }
        let mut machines = self.machines.write();
        machines
            .entry(thread_id.to_owned())
            .or_insert_with(|| Arc::new(ThreadMachine::new(thread_id.to_owned())))
            .clone()
    }

    pub fn remove(&self, thread_id: &str) {
        self.machines.write().remove(thread_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_idle() {
        let registry = MachineRegistry::new();
        let machine = registry.get("t1");
        assert_eq!(machine.state(), SupervisorState::Idle);
        assert!(machine.state().can_start_run());
        assert!(!machine.state().is_busy());
    }

    #[test]
    fn transitions_and_flags() {
        let registry = MachineRegistry::new();
        let machine = registry.get("t1");

        machine.transition(SupervisorState::Running);
        machine.transition(SupervisorState::ToolExec);
        assert!(machine.state().is_busy());
        assert!(!machine.state().can_start_run());

        machine.update_flags(|f| f.steer_requested = true);
        let (state, flags) = machine.snapshot();
        assert_eq!(state, SupervisorState::ToolExec);
        assert!(flags.steer_requested);
        assert!(!flags.compacting);
    }

    #[test]
    fn registry_returns_same_machine() {
        let registry = MachineRegistry::new();
        let a = registry.get("t1");
        a.transition(SupervisorState::Running);
        let b = registry.get("t1");
        assert_eq!(b.state(), SupervisorState::Running);

        registry.remove("t1");
        assert_eq!(registry.get("t1").state(), SupervisorState::Idle);
    }

    #[test]
    fn error_then_recovering_can_start() {
        let registry = MachineRegistry::new();
        let machine = registry.get("t1");
        machine.transition(SupervisorState::Error);
        assert!(!machine.state().can_start_run());
        machine.transition(SupervisorState::Recovering);
        assert!(machine.state().can_start_run());
    }
}
