use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
#[cfg(feature = "logging")]
use log::{debug, error, trace};

use crate::errors::TimerError;
use crate::event::{BoxedCallback, Event, EventTable, Next};
use crate::queue::TimeoutQueue;

/// Identifies a timer. Equal to the timer's slot in the event table, so an
/// id may be handed out again once the timer has fired for the last time or
/// was removed and the worker has retired it.
pub type TimerId = usize;

/// Represents the state of the worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// No pending timers; blocked until one is added.
    Idle,
    /// Blocked until the earliest deadline or an earlier wake-up.
    Waiting,
    /// Running a callback with the lock released.
    Firing,
    Stopped,
}

/// Statistics for a timer service.
#[derive(Debug, Clone, Default)]
pub struct TimerStatistics {
    /// Number of times a callback has been executed.
    pub execution_count: u64,
    /// Number of callbacks that panicked.
    pub panic_count: u64,
    /// Number of ids returned to the reuse pool.
    pub reclaimed_count: u64,
    /// Timers that are still live.
    pub active_timers: usize,
    /// Entries in the timeout queue, including ones left behind by `remove`.
    pub pending_entries: usize,
}

struct Inner {
    done: bool,
    /// Bumped by every `start`; a worker only owns the state of its own epoch.
    epoch: u64,
    state: TimerState,
    events: EventTable,
    queue: TimeoutQueue,
    stats: TimerStatistics,
}

impl Inner {
    /// Whether the worker started in `epoch` must exit.
    fn retired(&self, epoch: u64) -> bool {
        self.done || self.epoch != epoch
    }

    fn stopped() -> Self {
        Inner {
            done: true,
            epoch: 0,
            state: TimerState::Stopped,
            events: EventTable::default(),
            queue: TimeoutQueue::default(),
            stats: TimerStatistics::default(),
        }
    }
}

struct Shared {
    inner: Mutex<Inner>,
    wake: Condvar,
}

impl Shared {
    // No critical section can unwind halfway through an update, and callbacks
    // never run under the lock, so a poisoned guard still holds consistent data.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, Inner>) -> MutexGuard<'a, Inner> {
        self.wake.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, Inner>,
        timeout: Duration,
    ) -> MutexGuard<'a, Inner> {
        match self.wake.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }
}

/// Cloneable access to a running [`Timer`] for registering and removing
/// timers, typically captured by callbacks.
///
/// A handle does not keep the worker alive; once the owning `Timer` is
/// stopped or dropped, [`add`](Self::add) fails with
/// [`TimerError::TimerStopped`].
#[derive(Clone)]
pub struct TimerHandle {
    shared: Arc<Shared>,
}

impl TimerHandle {
    /// Registers `callback` to fire at `when`, then every `period` after
    /// that. A zero `period` fires once.
    ///
    /// Deadlines in the past fire on the worker's next wake-up. Periodic
    /// deadlines advance by exactly `period` per firing, so a timer delayed
    /// by a slow callback catches up instead of skipping ticks.
    pub fn add<F>(&self, when: Instant, callback: F, period: Duration) -> Result<TimerId, TimerError>
    where
        F: FnMut(TimerId) + Send + 'static,
    {
        let mut inner = self.shared.lock();
        if inner.done {
            drop(inner);
            return Err(TimerError::TimerStopped);
        }
        let id = inner.events.insert(Event::new(when, period, Box::new(callback)));
        inner.queue.push(when, id);
        drop(inner);
        self.shared.wake.notify_one();

        #[cfg(feature = "logging")]
        trace!("Timer {} added, period {:?}.", id, period);
        Ok(id)
    }

    /// Registers a one-shot timer.
    pub fn add_once<F>(&self, when: Instant, callback: F) -> Result<TimerId, TimerError>
    where
        F: FnMut(TimerId) + Send + 'static,
    {
        self.add(when, callback, Duration::ZERO)
    }

    /// Registers a timer whose first deadline is `delay` from now.
    pub fn add_after<F>(
        &self,
        delay: Duration,
        callback: F,
        period: Duration,
    ) -> Result<TimerId, TimerError>
    where
        F: FnMut(TimerId) + Send + 'static,
    {
        let when = Instant::now().checked_add(delay).ok_or_else(|| {
            TimerError::InvalidParameter(format!("Delay {delay:?} overflows the clock."))
        })?;
        self.add(when, callback, period)
    }

    /// Like [`add_after`](Self::add_after), with delay and period given in
    /// microseconds.
    pub fn add_micros<F>(&self, when: u64, callback: F, period: u64) -> Result<TimerId, TimerError>
    where
        F: FnMut(TimerId) + Send + 'static,
    {
        self.add_after(
            Duration::from_micros(when),
            callback,
            Duration::from_micros(period),
        )
    }

    /// Cancels the timer `id`. Returns `false` if `id` was never handed out.
    ///
    /// The callback will not be invoked again and is released right away,
    /// unless it is running at this moment, in which case it is released
    /// when it returns. Safe to call from any callback, including the one
    /// being cancelled.
    ///
    /// The id is only reused after the worker has retired it. Removing an
    /// id that already fired its last time and was handed out again cancels
    /// the new timer.
    pub fn remove(&self, id: TimerId) -> bool {
        let mut inner = self.shared.lock();
        if !inner.events.invalidate(id) {
            return false;
        }
        let released = inner.events.take_callback(id);
        drop(inner);
        self.shared.wake.notify_one();
        drop(released);

        #[cfg(feature = "logging")]
        trace!("Timer {} removed.", id);
        true
    }

    /// Gets the current state of the worker.
    pub fn state(&self) -> TimerState {
        self.shared.lock().state
    }

    /// Gets the service's statistics.
    pub fn statistics(&self) -> TimerStatistics {
        let inner = self.shared.lock();
        TimerStatistics {
            active_timers: inner.events.live(),
            pending_entries: inner.queue.len(),
            ..inner.stats.clone()
        }
    }

    /// Whether the service accepts new timers.
    pub fn is_running(&self) -> bool {
        !self.shared.lock().done
    }
}

/// A timer service: one worker thread firing one-shot and periodic
/// callbacks in deadline order.
///
/// ```
/// use std::time::Duration;
/// use timer_lib::Timer;
///
/// let timer = Timer::new().unwrap();
/// timer
///     .add_after(Duration::from_millis(10), |id| println!("timer {id} fired"), Duration::ZERO)
///     .unwrap();
/// std::thread::sleep(Duration::from_millis(20));
/// ```
pub struct Timer {
    handle: TimerHandle,
    worker: Option<JoinHandle<()>>,
}

impl Timer {
    /// Creates a timer service and starts its worker.
    pub fn new() -> Result<Self, TimerError> {
        Self::start_with(None)
    }

    /// Creates a timer service sized for about `expected` concurrent timers.
    pub fn with_capacity(expected: usize) -> Result<Self, TimerError> {
        Self::start_with(Some(expected))
    }

    fn start_with(expected_capacity: Option<usize>) -> Result<Self, TimerError> {
        let mut timer = Timer {
            handle: TimerHandle {
                shared: Arc::new(Shared {
                    inner: Mutex::new(Inner::stopped()),
                    wake: Condvar::new(),
                }),
            },
            worker: None,
        };
        timer.start(expected_capacity)?;
        Ok(timer)
    }

    /// Starts the worker of a stopped timer, with all state reset.
    ///
    /// Ids are handed out from zero again.
    pub fn start(&mut self, expected_capacity: Option<usize>) -> Result<(), TimerError> {
        if self.worker.is_some() {
            return Err(TimerError::AlreadyRunning);
        }

        let shared = &self.handle.shared;
        let (epoch, released) = {
            let mut inner = shared.lock();
            inner.done = false;
            inner.epoch = inner.epoch.wrapping_add(1);
            inner.state = TimerState::Idle;
            inner.queue.clear();
            inner.stats = TimerStatistics::default();
            let released = inner.events.clear();
            inner.events = EventTable::with_capacity(expected_capacity.unwrap_or(0));
            (inner.epoch, released)
        };
        drop(released);

        let worker_shared = Arc::clone(shared);
        let spawned = thread::Builder::new()
            .name("timer-worker".into())
            .spawn(move || run(worker_shared, epoch));
        match spawned {
            Ok(worker) => {
                self.worker = Some(worker);
                Ok(())
            }
            Err(e) => {
                let mut inner = shared.lock();
                inner.done = true;
                inner.state = TimerState::Stopped;
                Err(e.into())
            }
        }
    }

    /// Stops the worker and discards every pending timer.
    ///
    /// Blocks until a callback that is running right now has returned and
    /// the worker has exited.
    pub fn stop(&mut self) -> Result<(), TimerError> {
        let worker = self.worker.take().ok_or(TimerError::TimerStopped)?;

        let shared = &self.handle.shared;
        let released = {
            let mut inner = shared.lock();
            inner.done = true;
            inner.queue.clear();
            inner.events.clear()
        };
        shared.wake.notify_all();
        drop(released);

        // Stopped by one of its own callbacks; the worker exits when it
        // returns, even if the timer has been started again meanwhile.
        if worker.thread().id() == thread::current().id() {
            return Ok(());
        }

        #[cfg(feature = "logging")]
        debug!("Stopping timer.");
        if let Err(_payload) = worker.join() {
            #[cfg(feature = "logging")]
            error!("Timer worker panicked: {}", panic_message(&*_payload));
        }
        Ok(())
    }

    /// Returns a handle that callbacks can use to add and remove timers.
    pub fn handle(&self) -> TimerHandle {
        self.handle.clone()
    }

    /// See [`TimerHandle::add`].
    pub fn add<F>(&self, when: Instant, callback: F, period: Duration) -> Result<TimerId, TimerError>
    where
        F: FnMut(TimerId) + Send + 'static,
    {
        self.handle.add(when, callback, period)
    }

    /// See [`TimerHandle::add_once`].
    pub fn add_once<F>(&self, when: Instant, callback: F) -> Result<TimerId, TimerError>
    where
        F: FnMut(TimerId) + Send + 'static,
    {
        self.handle.add_once(when, callback)
    }

    /// See [`TimerHandle::add_after`].
    pub fn add_after<F>(
        &self,
        delay: Duration,
        callback: F,
        period: Duration,
    ) -> Result<TimerId, TimerError>
    where
        F: FnMut(TimerId) + Send + 'static,
    {
        self.handle.add_after(delay, callback, period)
    }

    /// See [`TimerHandle::add_micros`].
    pub fn add_micros<F>(&self, when: u64, callback: F, period: u64) -> Result<TimerId, TimerError>
    where
        F: FnMut(TimerId) + Send + 'static,
    {
        self.handle.add_micros(when, callback, period)
    }

    /// See [`TimerHandle::remove`].
    pub fn remove(&self, id: TimerId) -> bool {
        self.handle.remove(id)
    }

    /// Gets the current state of the worker.
    pub fn state(&self) -> TimerState {
        self.handle.state()
    }

    /// Gets the service's statistics.
    pub fn statistics(&self) -> TimerStatistics {
        self.handle.statistics()
    }

    /// Whether the worker is running.
    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Worker loop. Holds the lock except while waiting and while a callback
/// runs. Exits once stopped or superseded by a worker of a later `epoch`.
fn run(shared: Arc<Shared>, epoch: u64) {
    #[cfg(feature = "logging")]
    debug!("Timer worker started.");

    let mut inner = shared.lock();
    while !inner.retired(epoch) {
        let Some(next) = inner.queue.peek_min() else {
            inner.state = TimerState::Idle;
            inner = shared.wait(inner);
            continue;
        };

        let now = Instant::now();
        if next.deadline > now {
            inner.state = TimerState::Waiting;
            inner = shared.wait_timeout(inner, next.deadline - now);
            continue;
        }

        inner.queue.pop_min();
        let id = next.id;
        let callback = if inner.events.is_valid(id) {
            inner.events.take_callback(id)
        } else {
            None
        };

        let released = match callback {
            // Cancelled while queued.
            None => {
                let released = inner.events.retire(id);
                inner.events.reclaim(id);
                inner.stats.reclaimed_count += 1;
                released
            }
            Some(mut callback) => {
                inner.state = TimerState::Firing;
                drop(inner);
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(id)));
                inner = shared.lock();

                if inner.retired(epoch) {
                    // Stopped meanwhile; the table is not ours any more.
                    Some(callback)
                } else {
                    inner.stats.execution_count += 1;
                    settle(&mut inner, id, callback, outcome.err())
                }
            }
        };

        // User drop code may touch the timer, so never run it under the lock.
        if let Some(callback) = released {
            drop(inner);
            drop(callback);
            inner = shared.lock();
        }
    }
    if inner.epoch == epoch {
        inner.state = TimerState::Stopped;
    }
    drop(inner);

    #[cfg(feature = "logging")]
    debug!("Timer worker stopped.");
}

/// Reschedules or retires `id` after its callback returned or panicked.
fn settle(
    inner: &mut Inner,
    id: TimerId,
    callback: BoxedCallback,
    panicked: Option<Box<dyn Any + Send>>,
) -> Option<BoxedCallback> {
    if let Some(_payload) = panicked {
        #[cfg(feature = "logging")]
        error!("Timer {} callback panicked: {}", id, panic_message(&*_payload));
        inner.stats.panic_count += 1;
        inner.events.invalidate(id);
        inner.events.reclaim(id);
        inner.stats.reclaimed_count += 1;
        return Some(callback);
    }

    match inner.events.complete(id, callback) {
        (Next::Reschedule(deadline), _) => {
            inner.queue.push(deadline, id);
            None
        }
        (Next::Retire, released) => {
            inner.events.reclaim(id);
            inner.stats.reclaimed_count += 1;
            released
        }
    }
}

#[cfg(feature = "logging")]
fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
