//! §4.1 — monotonic tick counter and sleep/wake, driven by an external PIT
//! the boot collaborator owns. This crate only ever reacts to `tick()`
//! being called; it never touches the PIT hardware itself.
//!
//! Grounded on `original_source/devices/timer.c`: a global tick counter
//! incremented from interrupt context, a sleep list ordered by wake tick,
//! and `loops_per_tick` busy-wait calibration for sub-tick `usleep`/`nsleep`.

use spin::Mutex;
use lazy_static::lazy_static;

use crate::config::TIMER_FREQ_HZ;

lazy_static! {
    static ref TICKS: Mutex<i64> = Mutex::new(0);
    /// Calibrated at boot by the external collaborator via `set_loops_per_tick`;
    /// used only to size the busy-wait loop `nsleep`/`usleep` fall back to
    /// when the requested delay is under one tick.
    static ref LOOPS_PER_TICK: Mutex<u64> = Mutex::new(1);
}

/// Interrupt-safe read of the tick counter.
pub fn ticks() -> i64 {
    *TICKS.lock()
}

/// Ticks elapsed since `t0` (as returned by `ticks()`).
pub fn elapsed(t0: i64) -> i64 {
    ticks() - t0
}

/// Record the busy-wait calibration the boot collaborator measured with
/// interrupts enabled (largest power-of-two iteration count that takes
/// strictly less than one tick, refined linearly from there).
pub fn set_loops_per_tick(loops: u64) {
    *LOOPS_PER_TICK.lock() = loops.max(1);
}

pub fn loops_per_tick() -> u64 {
    *LOOPS_PER_TICK.lock()
}

/// Called from the tick interrupt handler (external collaborator's PIT ISR).
/// Increments the counter, wakes due sleepers, and drives the scheduler's
/// quantum/MLFQS accounting. Runs with interrupts already disabled by
/// virtue of being in interrupt context; never blocks.
pub fn tick() {
    let now = {
        let mut t = TICKS.lock();
        *t += 1;
        *t
    };
    crate::thread::scheduler::awake(now);
    crate::thread::scheduler::on_tick(now);
}

/// §4.1 `sleep(n)`: `n <= 0` returns immediately; otherwise blocks the
/// calling thread until `ticks() >= ticks() + n` at call time.
pub fn sleep(n: i64) {
    if n <= 0 {
        return;
    }
    let wake_at = ticks() + n;
    crate::thread::scheduler::sleep_until(wake_at);
}

/// Convert a millisecond delay to ticks, falling back to a calibrated
/// busy-wait when the delay is under one tick.
pub fn msleep(ms: i64) {
    real_sleep(ms, 1000);
}

pub fn usleep(us: i64) {
    real_sleep(us, 1_000_000);
}

pub fn nsleep(ns: i64) {
    real_sleep(ns, 1_000_000_000);
}

/// `num / denom` seconds of delay, in the units `denom` implies (ms/us/ns).
/// Mirrors `devices/timer.c`'s `real_time_sleep`: sleep for whole ticks when
/// at least one elapses, else busy-wait the fractional remainder.
fn real_sleep(num: i64, denom: i64) {
    if num <= 0 {
        return;
    }
    let freq = TIMER_FREQ_HZ as i64;
    // ticks = num * freq / denom, rounded down; avoid overflow by dividing first
    // the way timer.c does (denom / freq, then num / that), tolerating
    // precision loss rather than overflowing at high `num`.
    let ticks_to_wait = num * freq / denom;
    if ticks_to_wait >= 1 {
        sleep(ticks_to_wait);
    } else {
        busy_wait(num * (loops_per_tick() as i64) / (denom / freq).max(1));
    }
}

fn busy_wait(loops: i64) {
    let mut x: u64 = 0;
    for _ in 0..loops.max(0) {
        x = x.wrapping_add(1);
        core::hint::black_box(&mut x);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_zero_or_negative_is_noop() {
        // Should not touch the scheduler's sleep list at all; if it tried
        // to block with no scheduler initialized this would panic.
        sleep(0);
        sleep(-5);
    }

    #[test]
    fn tick_advances_monotonically() {
        let base = ticks();
        tick();
        tick();
        assert_eq!(ticks(), base + 2);
    }
}
