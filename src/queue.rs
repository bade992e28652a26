//! Earliest-deadline-first queue of pending firings.
//!
//! Entries point into the event table by id and own nothing. They may go
//! stale when a timer is cancelled; the worker checks the slot before
//! acting on one.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Instant;

use crate::timer::TimerId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TimeEvent {
    pub(crate) deadline: Instant,
    pub(crate) id: TimerId,
    seq: u64,
}

// Equal deadlines pop in insertion order.
impl Ord for TimeEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for TimeEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub(crate) struct TimeoutQueue {
    heap: BinaryHeap<Reverse<TimeEvent>>,
    next_seq: u64,
}

impl TimeoutQueue {
    pub(crate) fn push(&mut self, deadline: Instant, id: TimerId) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.heap.push(Reverse(TimeEvent { deadline, id, seq }));
    }

    pub(crate) fn peek_min(&self) -> Option<TimeEvent> {
        self.heap.peek().map(|Reverse(event)| *event)
    }

    pub(crate) fn pop_min(&mut self) -> Option<TimeEvent> {
        self.heap.pop().map(|Reverse(event)| event)
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn clear(&mut self) {
        self.heap.clear();
        self.next_seq = 0;
    }
}
