//! Monotonic time access for the MAC.
//
// https://github.com/rust-iot/rust-tsch
// Copyright 2022 Ryan Kurte

/// Timer trait provides mechanisms for accessing monotonic times
/// to assist with protocol implementations.
///
/// All methods are monotonic and relative to the same unknown epoch.
/// `ticks` is the high resolution hardware timer driving slot operation,
/// it wraps and must only be compared through the helpers below.
pub trait Timer {
    /// Returns the high-resolution hardware timer value, wrapping
    fn ticks(&self) -> u32;

    /// Returns the number of milliseconds since some unknown epoch
    fn ticks_ms(&self) -> u64;
}

/// Wrap-safe "is a before b" comparison on the hardware timer
pub fn clock_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Checks if `now` has passed `ref_time + offset - min_delay`.
///
/// Both now and the target may have wrapped once past `ref_time`; the counter
/// is treated as circular and the deadline is missed iff the target lies at
/// or before now in the forward arc.
pub fn deadline_missed(ref_time: u32, offset: u32, now: u32, min_delay: u32) -> bool {
    let target = ref_time.wrapping_add(offset).wrapping_sub(min_delay);
    let now_wrapped = now < ref_time;
    let target_wrapped = target < ref_time;

    if now_wrapped == target_wrapped {
        // Both or neither have wrapped, compare directly
        target <= now
    } else {
        // If now wrapped it has passed the target, if the target wrapped
        // we have not reached it yet
        now_wrapped
    }
}

#[cfg(any(test, feature = "mocks"))]
pub mod mock {
    use std::sync::{Arc, Mutex};

    struct Inner {
        ticks: u64,
        auto_step: u32,
        ticks_per_ms: u32,
    }

    /// Shared-handle mock timer. Clones observe the same clock.
    ///
    /// `auto_step` advances the clock on every `ticks()` read so that
    /// guard-time bounded busy-wait loops terminate under test.
    #[derive(Clone)]
    pub struct MockTimer(Arc<Mutex<Inner>>);

    impl MockTimer {
        pub fn new() -> Self {
            Self(Arc::new(Mutex::new(Inner {
                ticks: 0,
                auto_step: 1,
                ticks_per_ms: 1000,
            })))
        }

        /// Set the per-read clock advance
        pub fn set_auto_step(&self, step: u32) {
            self.0.lock().unwrap().auto_step = step;
        }

        /// Set the clock to an absolute tick value
        pub fn set_ticks(&self, val: u32) {
            self.0.lock().unwrap().ticks = val as u64;
        }

        /// Set the clock in milliseconds
        pub fn set_ms(&self, val: u64) {
            let mut i = self.0.lock().unwrap();
            i.ticks = val * i.ticks_per_ms as u64;
        }

        /// Advance the clock by a number of ticks
        pub fn advance(&self, ticks: u32) {
            self.0.lock().unwrap().ticks += ticks as u64;
        }

        pub fn val(&self) -> u32 {
            self.0.lock().unwrap().ticks as u32
        }
    }

    impl super::Timer for MockTimer {
        fn ticks(&self) -> u32 {
            let mut i = self.0.lock().unwrap();
            i.ticks += i.auto_step as u64;
            i.ticks as u32
        }

        fn ticks_ms(&self) -> u64 {
            let i = self.0.lock().unwrap();
            i.ticks / i.ticks_per_ms as u64
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deadline_linear() {
        // Target at 1000 - 10, not yet reached
        assert_eq!(deadline_missed(500, 500, 980, 10), false);
        // At the target
        assert_eq!(deadline_missed(500, 500, 990, 10), true);
        // Past the target
        assert_eq!(deadline_missed(500, 500, 2000, 10), true);
    }

    #[test]
    fn deadline_target_wrapped() {
        // Reference near the top of the counter, target wraps past zero
        let r = u32::MAX - 100;
        // Now still below the wrap: target not reached
        assert_eq!(deadline_missed(r, 200, u32::MAX - 50, 10), false);
        // Now wrapped and past the target
        assert_eq!(deadline_missed(r, 200, 120, 10), true);
        // Now wrapped but before the target
        assert_eq!(deadline_missed(r, 200, 50, 10), false);
    }

    #[test]
    fn deadline_now_wrapped_only() {
        // Target does not wrap, now does: deadline long gone
        let r = u32::MAX - 1000;
        assert_eq!(deadline_missed(r, 100, 5, 10), true);
    }

    #[test]
    fn clock_compare() {
        assert!(clock_lt(1, 2));
        assert!(!clock_lt(2, 1));
        // Across the wrap
        assert!(clock_lt(u32::MAX - 1, 1));
        assert!(!clock_lt(1, u32::MAX - 1));
    }
}
