//! Ready queue — hand-off between conflation units and the worker pool.
//!
//! Tickets come out in ascending priority; equal priorities are FIFO.
//! `pop` parks the calling worker until a ticket is available.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// One (source, bundle type) that is eligible for processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub source: String,
    pub bundle_type: String,
    pub priority: u32,
}

#[derive(Debug)]
struct Queued {
    priority: u32,
    seq: u64,
    ticket: Ticket,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.priority, self.seq).cmp(&(other.priority, other.seq))
    }
}

#[derive(Debug, Default)]
pub struct ReadyQueue {
    heap: Mutex<BinaryHeap<Reverse<Queued>>>,
    seq: AtomicU64,
    available: Notify,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, ticket: Ticket) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.heap.lock().push(Reverse(Queued {
            priority: ticket.priority,
            seq,
            ticket,
        }));
        self.available.notify_one();
    }

    pub fn try_pop(&self) -> Option<Ticket> {
        self.heap.lock().pop().map(|Reverse(q)| q.ticket)
    }

    /// Wait for the next ticket. Cancel by dropping the future (e.g. in a
    /// `select!` against the shutdown signal).
    pub async fn pop(&self) -> Ticket {
        loop {
            if let Some(ticket) = self.try_pop() {
                return ticket;
            }
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(ticket) = self.try_pop() {
                return ticket;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }
}
