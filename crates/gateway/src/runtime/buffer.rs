//! Per-run in-memory event buffer: bounded ring + live broadcast.
//!
//! The producer assigns each event the next `seq` (starting at 1), appends
//! to the durable log, then publishes here. Subscribers atomically get the
//! ring backlog plus a live receiver; publishing and subscribing share the
//! ring lock so no event can fall in the gap between the two. A full ring
//! drops its *oldest* entries — safe, because any subscriber that needs
//! them still has the durable log.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::broadcast;

use leon_domain::event::RunEvent;

#[derive(Debug)]
pub struct RunEventBuffer {
    run_id: uuid::Uuid,
    capacity: usize,
    next_seq: AtomicU64,
    ring: Mutex<VecDeque<RunEvent>>,
    tx: broadcast::Sender<RunEvent>,
}

/// A subscription: replayable backlog plus the live feed. Events in
/// `backlog` all have `seq > after`; the receiver was registered under the
/// same lock as the last published event, so the two splice gap-free
/// (duplicates are possible on the seam and filtered by seq).
pub struct Subscription {
    pub backlog: Vec<RunEvent>,
    pub rx: broadcast::Receiver<RunEvent>,
}

impl RunEventBuffer {
    pub fn new(run_id: uuid::Uuid, capacity: usize) -> Self {
        let capacity = capacity.max(8);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            run_id,
            capacity,
            next_seq: AtomicU64::new(1),
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            tx,
        }
    }

    pub fn run_id(&self) -> uuid::Uuid {
        self.run_id
    }

    /// Reserve the next sequence number for an event. Single producer, so
    /// reservation order equals publication order.
    pub fn assign_seq(&self, evt: &mut RunEvent) {
        evt.seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
    }

    /// The seq of the most recently assigned event (0 before the first).
    pub fn last_seq(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst) - 1
    }

    /// Publish an already-sequenced, already-logged event.
    pub fn publish(&self, evt: RunEvent) {
        let mut ring = self.ring.lock();
        ring.push_back(evt.clone());
        while ring.len() > self.capacity {
            ring.pop_front();
        }
        // No receivers is fine; the log has it.
        let _ = self.tx.send(evt);
    }

    /// Snapshot the backlog with `seq > after` and open the live feed.
    pub fn subscribe(&self, after: u64) -> Subscription {
        let ring = self.ring.lock();
        let backlog = ring.iter().filter(|e| e.seq > after).cloned().collect();
        let rx = self.tx.subscribe();
        Subscription { backlog, rx }
    }

    /// The oldest seq still held by the ring, if any.
    pub fn oldest_seq(&self) -> Option<u64> {
        self.ring.lock().front().map(|e| e.seq)
    }
}
