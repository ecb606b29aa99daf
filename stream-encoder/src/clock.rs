use std::{
    sync::atomic::{AtomicI64, Ordering},
    time::Instant,
};

use once_cell::sync::Lazy;

static ORIGIN: Lazy<Instant> = Lazy::new(Instant::now);

/// Source of monotonic time in microseconds.
pub trait Clock: Send + Sync {
    fn now_us(&self) -> i64;
}

/// Monotonic clock measured from the first time any instance is read.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_us(&self) -> i64 {
        ORIGIN.elapsed().as_micros() as i64
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_us: AtomicI64,
}

impl ManualClock {
    pub fn new(now_us: i64) -> Self {
        Self {
            now_us: AtomicI64::new(now_us),
        }
    }

    pub fn set(&self, now_us: i64) {
        self.now_us.store(now_us, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_us: i64) {
        self.now_us.fetch_add(delta_us, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> i64 {
        self.now_us.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn monotonic_clock_never_goes_back() {
        let clock = MonotonicClock;
        let mut last = clock.now_us();
        for _ in 0..1000 {
            let now = clock.now_us();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn manual_clock_moves_on_demand() {
        let clock = ManualClock::new(10);
        assert_eq!(clock.now_us(), 10);
        clock.advance(5);
        assert_eq!(clock.now_us(), 15);
        clock.set(100);
        assert_eq!(clock.now_us(), 100);
    }
}
