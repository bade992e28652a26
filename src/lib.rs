//! # TimerLib
//! A single-worker software timer service for one-shot and periodic callbacks.
//!
//! A [`Timer`] owns one background thread that sleeps until the earliest
//! deadline, runs the due callback and reschedules or retires it. Any
//! thread, including a running callback, can add and remove timers through
//! the `Timer` or a cloned [`TimerHandle`].
//!
//! Enable the `logging` feature to emit diagnostics through the `log` facade.

pub mod errors;
mod event;
mod queue;
pub mod timer;

pub use errors::TimerError;
pub use timer::{Timer, TimerHandle, TimerId, TimerState, TimerStatistics};
