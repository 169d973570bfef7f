//! Hybrid logical clock and op-times.
//!
//! Prepare timestamps, commit timestamps and write op-times all come from one
//! `Clock` per node. After a restart the clock is reseeded from the highest
//! persisted timestamp so it never runs backward across failover.

use std::fmt;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Cluster timestamp: wall milliseconds plus a logical counter.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp {
    pub wall_ms: u64,
    pub counter: u32,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp {
        wall_ms: 0,
        counter: 0,
    };

    pub fn new(wall_ms: u64, counter: u32) -> Self {
        Self { wall_ms, counter }
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}, {})", self.wall_ms, self.counter)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.wall_ms, self.counter)
    }
}

/// Durable log position: election term plus timestamp.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct OpTime {
    pub term: u64,
    pub ts: Timestamp,
}

impl OpTime {
    pub fn new(term: u64, ts: Timestamp) -> Self {
        Self { term, ts }
    }
}

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@t{}", self.ts, self.term)
    }
}

#[derive(Debug)]
struct ClockState {
    last: Timestamp,
}

/// Hybrid logical clock.
///
/// Every `tick` is strictly greater than every previous tick and every
/// timestamp passed to `observe`, even when the wall clock moves backward.
#[derive(Debug)]
pub struct Clock {
    state: Mutex<ClockState>,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClockState {
                last: Timestamp::ZERO,
            }),
        }
    }

    pub fn tick(&self) -> Timestamp {
        let now = now_ms();
        let mut state = self.state.lock().expect("clock lock poisoned");
        let next = if now > state.last.wall_ms {
            Timestamp::new(now, 0)
        } else {
            Timestamp::new(state.last.wall_ms, state.last.counter.saturating_add(1))
        };
        state.last = next;
        next
    }

    /// Fold in a timestamp seen elsewhere (storage on restart, a participant).
    pub fn observe(&self, seen: Timestamp) {
        let mut state = self.state.lock().expect("clock lock poisoned");
        if seen > state.last {
            state.last = seen;
        }
    }

    pub fn last(&self) -> Timestamp {
        self.state.lock().expect("clock lock poisoned").last
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
