use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant};

use timer_lib::{Timer, TimerError};

fn main() -> Result<(), TimerError> {
    let mut timer = Timer::new()?;
    let handle = timer.handle();

    // 1. One-time timer
    timer.add_after(
        Duration::from_millis(200),
        |id| println!("One-time timer {id} executed!"),
        Duration::ZERO,
    )?;

    // 2. Recurring timer that cancels itself after five ticks
    let ticks = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&ticks);
    timer.add_after(
        Duration::from_millis(100),
        move |id| {
            let n = counted.fetch_add(1, Ordering::SeqCst) + 1;
            println!("Recurring timer {id} tick {n}");
            if n == 5 {
                handle.remove(id);
            }
        },
        Duration::from_millis(100),
    )?;

    // 3. Absolute deadline, in the past: fires right away
    timer.add_once(Instant::now() - Duration::from_millis(5), |id| {
        println!("Overdue timer {id} executed!");
    })?;

    // 4. Panicking callback: caught and retired, the worker keeps going
    timer.add_micros(150_000, |_| panic!("Simulated error!"), 0)?;

    // 5. Cancelled before it fires
    let id = timer.add_after(Duration::from_secs(1), |_| unreachable!(), Duration::ZERO)?;
    timer.remove(id);

    sleep(Duration::from_millis(700));
    println!("Statistics: {:?}", timer.statistics());

    timer.stop()?;
    println!("State after stop: {:?}", timer.state());
    Ok(())
}
