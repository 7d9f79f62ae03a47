/*
 * System Timer and Uptime Management
 *
 * Global uptime tracking in milliseconds since boot. The platform layer's
 * timer interrupt handler calls on_timer_tick() once per tick (100Hz
 * nominal); everything else in the kernel reads time through uptime_ms().
 *
 * Resolution:
 * - Timer frequency: 100Hz (10ms per tick) driven by the platform layer
 * - uptime_us() interpolates microseconds for callers that need a
 *   high-resolution-ish value (TCP initial sequence numbers)
 *
 * The counters are atomics so the scheduler may read them from interrupt
 * context without taking a lock.
 */

use core::sync::atomic::{AtomicU64, Ordering};

/// Scheduler tick frequency in Hz.
pub const HZ: u64 = 100;

/// Milliseconds advanced per timer tick.
pub const MS_PER_TICK: u64 = 1000 / HZ;

/// Global uptime counter in milliseconds since boot
static UPTIME_MS: AtomicU64 = AtomicU64::new(0);

/// Timer tick counter ("jiffies") - increments once per timer interrupt
static JIFFIES: AtomicU64 = AtomicU64::new(0);

/// Called from the timer interrupt handler, exactly once per tick.
pub fn on_timer_tick() {
    JIFFIES.fetch_add(1, Ordering::Relaxed);
    UPTIME_MS.fetch_add(MS_PER_TICK, Ordering::Relaxed);
}

/// Advance the clock by an arbitrary amount.
///
/// Platform layers with a tick rate other than 100Hz (or test harnesses
/// driving virtual time) use this instead of on_timer_tick().
pub fn advance_ms(ms: u64) {
    JIFFIES.fetch_add(ms / MS_PER_TICK, Ordering::Relaxed);
    UPTIME_MS.fetch_add(ms, Ordering::Relaxed);
}

/// Milliseconds since boot.
pub fn uptime_ms() -> u64 {
    UPTIME_MS.load(Ordering::Relaxed)
}

/// Microseconds since boot.
///
/// Millisecond resolution under the hood; good enough for sequence-number
/// seeding, not for profiling.
pub fn uptime_us() -> u64 {
    uptime_ms() * 1000
}

/// Timer ticks since boot.
pub fn jiffies() -> u64 {
    JIFFIES.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_advance_uptime() {
        let start = uptime_ms();
        for _ in 0..100 {
            on_timer_tick();
        }
        assert_eq!(uptime_ms() - start, 1000);
    }
}
