//! Event table and identifier allocation.
//!
//! A timer's id is its index in the table. Retired indices go onto a LIFO
//! pool and are handed out again before the table grows. Only the worker
//! pushes onto the pool, and only after it has seen the slot invalid, so an
//! index is never recycled while a queue entry for its old record could
//! still fire.

use std::time::{Duration, Instant};

use crate::timer::TimerId;

pub(crate) type BoxedCallback = Box<dyn FnMut(TimerId) + Send + 'static>;

/// One slot of the event table.
pub(crate) struct Event {
    deadline: Instant,
    period: Duration,
    /// `None` while the worker is invoking it, or once released.
    callback: Option<BoxedCallback>,
    valid: bool,
}

impl Event {
    pub(crate) fn new(deadline: Instant, period: Duration, callback: BoxedCallback) -> Self {
        Event {
            deadline,
            period,
            callback: Some(callback),
            valid: true,
        }
    }

    fn vacant() -> Self {
        Event {
            deadline: Instant::now(),
            period: Duration::ZERO,
            callback: None,
            valid: false,
        }
    }
}

/// What the worker should do with a timer after its callback returned.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Next {
    Reschedule(Instant),
    Retire,
}

#[derive(Default)]
pub(crate) struct EventTable {
    events: Vec<Event>,
    free_ids: Vec<TimerId>,
}

impl EventTable {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        EventTable {
            events: Vec::with_capacity(capacity),
            free_ids: Vec::new(),
        }
    }

    /// Returns a vacant id, reusing the most recently reclaimed one first.
    pub(crate) fn allocate(&mut self) -> TimerId {
        match self.free_ids.pop() {
            Some(id) => id,
            None => {
                self.events.push(Event::vacant());
                self.events.len() - 1
            }
        }
    }

    /// Installs `event` at `id`. The id must come from [`allocate`](Self::allocate).
    pub(crate) fn write(&mut self, id: TimerId, event: Event) {
        debug_assert!(!self.events[id].valid, "slot {id} overwritten while live");
        self.events[id] = event;
    }

    pub(crate) fn insert(&mut self, event: Event) -> TimerId {
        let id = self.allocate();
        self.write(id, event);
        id
    }

    /// Clears the validity flag. Returns `false` for ids outside the table.
    pub(crate) fn invalidate(&mut self, id: TimerId) -> bool {
        match self.events.get_mut(id) {
            Some(event) => {
                event.valid = false;
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_valid(&self, id: TimerId) -> bool {
        self.events.get(id).is_some_and(|event| event.valid)
    }

    #[cfg(test)]
    pub(crate) fn deadline(&self, id: TimerId) -> Option<Instant> {
        self.events.get(id).map(|event| event.deadline)
    }

    /// Moves the callback out of its slot.
    ///
    /// The worker does this before invoking it with the lock released;
    /// `remove` does it to release captured state early.
    pub(crate) fn take_callback(&mut self, id: TimerId) -> Option<BoxedCallback> {
        self.events.get_mut(id).and_then(|event| event.callback.take())
    }

    /// Decides the fate of a timer whose callback just returned.
    ///
    /// A still-valid periodic timer gets its callback back and its deadline
    /// advanced by exactly one period. Anything else is marked invalid and
    /// the callback is handed back to the caller for dropping.
    pub(crate) fn complete(
        &mut self,
        id: TimerId,
        callback: BoxedCallback,
    ) -> (Next, Option<BoxedCallback>) {
        let Some(event) = self.events.get_mut(id) else {
            return (Next::Retire, Some(callback));
        };
        if event.valid && !event.period.is_zero() {
            if let Some(deadline) = event.deadline.checked_add(event.period) {
                event.deadline = deadline;
                event.callback = Some(callback);
                return (Next::Reschedule(deadline), None);
            }
            #[cfg(feature = "logging")]
            log::warn!("Timer {} deadline overflowed; retiring it.", id);
        }
        event.valid = false;
        (Next::Retire, Some(callback))
    }

    /// Marks `id` invalid and returns whatever callback it still owns.
    pub(crate) fn retire(&mut self, id: TimerId) -> Option<BoxedCallback> {
        let event = self.events.get_mut(id)?;
        event.valid = false;
        event.callback.take()
    }

    /// Returns a retired id to the pool. Ids outside the table are ignored.
    pub(crate) fn reclaim(&mut self, id: TimerId) {
        if id >= self.events.len() {
            return;
        }
        debug_assert!(!self.is_valid(id), "reclaiming live slot {id}");
        self.free_ids.push(id);
    }

    /// Number of live timers.
    pub(crate) fn live(&self) -> usize {
        self.events.iter().filter(|event| event.valid).count()
    }

    /// Empties the table and the pool, handing back the slots so their
    /// callbacks can be dropped outside the lock.
    pub(crate) fn clear(&mut self) -> Vec<Event> {
        self.free_ids.clear();
        std::mem::take(&mut self.events)
    }
}
