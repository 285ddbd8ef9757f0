//! Timestamps and the hybrid-logical clock.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A hybrid-logical timestamp: wall-clock nanoseconds plus a logical
/// counter for events within the same nanosecond. Ordering is
/// lexicographic. The zero timestamp means "no MVCC version".
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    pub wall_time: i64,
    pub logical: i32,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp {
        wall_time: 0,
        logical: 0,
    };
    pub const MAX: Timestamp = Timestamp {
        wall_time: i64::MAX,
        logical: i32::MAX,
    };

    pub fn new(wall_time: i64, logical: i32) -> Self {
        Self { wall_time, logical }
    }

    pub fn is_zero(&self) -> bool {
        self.wall_time == 0 && self.logical == 0
    }

    /// The smallest timestamp greater than this one.
    pub fn next(&self) -> Timestamp {
        if self.logical == i32::MAX {
            Timestamp {
                wall_time: self.wall_time + 1,
                logical: 0,
            }
        } else {
            Timestamp {
                wall_time: self.wall_time,
                logical: self.logical + 1,
            }
        }
    }

    /// The largest timestamp smaller than this one.
    pub fn prev(&self) -> Timestamp {
        if self.logical > 0 {
            Timestamp {
                wall_time: self.wall_time,
                logical: self.logical - 1,
            }
        } else if self.wall_time > 0 {
            Timestamp {
                wall_time: self.wall_time - 1,
                logical: i32::MAX,
            }
        } else {
            Timestamp::ZERO
        }
    }

    /// Monotonic max: ratchet this timestamp up to `other`.
    pub fn forward(&mut self, other: Timestamp) {
        if *self < other {
            *self = other;
        }
    }

    pub fn less(&self, other: Timestamp) -> bool {
        *self < other
    }

    pub fn equal(&self, other: Timestamp) -> bool {
        *self == other
    }

    pub fn add(&self, wall_time: i64, logical: i32) -> Timestamp {
        Timestamp {
            wall_time: self.wall_time + wall_time,
            logical: self.logical + logical,
        }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:09}", self.wall_time, self.logical)
    }
}

/// Hybrid-logical clock. Reads never go backwards; `update` ratchets the
/// clock forward to the highest timestamp observed from other nodes.
pub struct Clock {
    physical: Box<dyn Fn() -> i64 + Send + Sync>,
    state: Mutex<Timestamp>,
    max_offset: Duration,
}

impl Clock {
    /// System-clock-backed instance.
    pub fn system(max_offset: Duration) -> Self {
        Self::with_source(max_offset, || {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
                .min(u128::from(u64::MAX)) as i64
        })
    }

    pub fn with_source(
        max_offset: Duration,
        physical: impl Fn() -> i64 + Send + Sync + 'static,
    ) -> Self {
        Self {
            physical: Box::new(physical),
            state: Mutex::new(Timestamp::ZERO),
            max_offset,
        }
    }

    /// Manually advanced clock for tests; bump the returned handle to
    /// move physical time.
    pub fn manual(start_nanos: i64) -> (Self, Arc<AtomicI64>) {
        let source = Arc::new(AtomicI64::new(start_nanos));
        let reader = source.clone();
        let clock = Self::with_source(Duration::ZERO, move || reader.load(Ordering::SeqCst));
        (clock, source)
    }

    pub fn max_offset(&self) -> Duration {
        self.max_offset
    }

    pub fn physical_now(&self) -> i64 {
        (self.physical)()
    }

    /// Current HLC reading; monotonically increasing across calls.
    pub fn now(&self) -> Timestamp {
        let physical = self.physical_now();
        let mut state = self.state.lock().expect("clock lock");
        if physical > state.wall_time {
            *state = Timestamp::new(physical, 0);
        } else {
            *state = state.next();
        }
        *state
    }

    /// Fold a remote timestamp into the clock, ratcheting it forward.
    pub fn update(&self, remote: Timestamp) -> Timestamp {
        let physical = self.physical_now();
        let mut state = self.state.lock().expect("clock lock");
        let mut next = *state;
        next.forward(remote);
        next.forward(Timestamp::new(physical, 0));
        if next == *state {
            next = state.next();
        }
        *state = next;
        *state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_lexicographic() {
        let a = Timestamp::new(1, 5);
        let b = Timestamp::new(1, 6);
        let c = Timestamp::new(2, 0);
        assert!(a.less(b));
        assert!(b.less(c));
        assert!(a.next().equal(b));
        assert!(b.prev().equal(a));
        assert!(Timestamp::ZERO.is_zero());
    }

    #[test]
    fn forward_is_monotonic_max() {
        let mut ts = Timestamp::new(10, 0);
        ts.forward(Timestamp::new(5, 0));
        assert_eq!(ts, Timestamp::new(10, 0));
        ts.forward(Timestamp::new(10, 3));
        assert_eq!(ts, Timestamp::new(10, 3));
    }

    #[test]
    fn manual_clock_ticks_logically_within_one_nanosecond() {
        let (clock, source) = Clock::manual(100);
        let a = clock.now();
        let b = clock.now();
        assert!(a.less(b));
        assert_eq!(a.wall_time, 100);
        assert_eq!(b.wall_time, 100);
        source.store(200, Ordering::SeqCst);
        let c = clock.now();
        assert_eq!(c, Timestamp::new(200, 0));
    }

    #[test]
    fn update_ratchets_to_remote_high_water_mark() {
        let (clock, _source) = Clock::manual(100);
        let updated = clock.update(Timestamp::new(500, 2));
        assert!(Timestamp::new(500, 2) <= updated);
        // Subsequent reads stay above the remote timestamp.
        assert!(Timestamp::new(500, 2).less(clock.now()));
    }
}
