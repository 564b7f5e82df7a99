//! Fixed-rate tick clock for simulation drivers.
//!
//! The engine never owns a timer. A driver keeps one of these and calls
//! `Scheduler::detect_and_resolve` once per tick.

use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_TICKS_PER_SECOND: u32 = 4;
/// Finest rate with a non-zero tick duration.
pub const MAX_TICKS_PER_SECOND: u32 = 1_000_000_000;

#[derive(Debug)]
pub struct TickClock {
    ticks_per_second: u32,
    tick_duration: Duration,
    origin: Instant,
    last_tick: Instant,
    /// Elapsed time not yet accounted for by whole ticks.
    tick_delay: Duration,
}

impl TickClock {
    pub fn new(ticks_per_second: u32) -> Self {
        let ticks_per_second = ticks_per_second.clamp(1, MAX_TICKS_PER_SECOND);
        let now = Instant::now();
        Self {
            ticks_per_second,
            tick_duration: Duration::from_secs(1) / ticks_per_second,
            origin: now,
            last_tick: now,
            tick_delay: Duration::ZERO,
        }
    }

    pub fn ticks_per_second(&self) -> u32 {
        self.ticks_per_second
    }

    pub fn tick_duration(&self) -> Duration {
        self.tick_duration
    }

    /// Whole ticks elapsed since the clock started.
    pub fn current_tick(&self) -> u64 {
        (self.origin.elapsed().as_nanos() / self.tick_duration.as_nanos()) as u64
    }

    /// Account for time since the last sync and return how many ticks were missed.
    pub fn sync_ticks(&mut self) -> u64 {
        let now = Instant::now();
        self.tick_delay += now.saturating_duration_since(self.last_tick);
        self.last_tick = now;

        let tick = self.tick_duration.as_nanos();
        let delay = self.tick_delay.as_nanos();
        self.tick_delay = Duration::from_nanos((delay % tick) as u64);
        (delay / tick) as u64
    }

    /// Sleep until one tick after the previous one, then start the next tick.
    pub fn wait_for_next_tick(&mut self) {
        let next = self.last_tick + self.tick_duration;
        let now = Instant::now();
        if next > now {
            thread::sleep(next - now);
        }
        self.last_tick = Instant::now();
    }

    #[cfg(test)]
    fn set_last_tick_for_test(&mut self, instant: Instant) {
        self.last_tick = instant;
    }
}

impl Default for TickClock {
    fn default() -> Self {
        Self::new(DEFAULT_TICKS_PER_SECOND)
    }
}
