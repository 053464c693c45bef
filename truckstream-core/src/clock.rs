//! Time sources driving window closes and periodic ticks.
//!
//! Stages never read the system time directly. Passing a [ManualClock] instead of the
//! [SystemClock] makes window closing and ticking fully deterministic.
use std::{
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::types::{duration_millis, EventTime};

/// A source of the current time in milliseconds
pub trait Clock: Send + Sync + 'static {
    /// Current time
    fn now(&self) -> EventTime;
}

/// Wall clock time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> EventTime {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| duration_millis(&d))
            // before 1970, should really not happen
            .unwrap_or_default()
    }
}

/// A clock which only moves when told to.
/// Clones share the same time.
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    /// Create a clock standing at the given time
    pub fn new(start: EventTime) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(start)),
        }
    }

    /// Set the clock to `time`. Setting it backwards is ignored.
    pub fn set(&self, time: EventTime) {
        self.now.fetch_max(time, Ordering::SeqCst);
    }

    /// Move the clock forward by `by`
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(duration_millis(&by), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> EventTime {
        self.now.load(Ordering::SeqCst)
    }
}

/// Fires at a constant interval of clock time.
///
/// Ticks are aligned to multiples of the interval, so two triggers with the same
/// interval fire at the same clock values.
#[derive(Debug, Clone)]
pub struct IntervalTrigger {
    interval: EventTime,
    next: Option<EventTime>,
}

impl IntervalTrigger {
    /// Create a new trigger for the given interval
    ///
    /// **PANIC:** if the interval is zero
    pub fn new(interval: Duration) -> Self {
        let interval = duration_millis(&interval);
        assert!(interval > 0, "Trigger interval must be positive");
        Self {
            interval,
            next: None,
        }
    }

    /// Returns the tick time if a tick is due at `now`.
    /// When several ticks were missed, only the latest one is reported.
    pub fn poll(&mut self, now: EventTime) -> Option<EventTime> {
        let aligned = now.div_euclid(self.interval) * self.interval;
        match self.next {
            None => {
                // first poll only arms the trigger
                self.next = Some(aligned + self.interval);
                None
            }
            Some(next) if now >= next => {
                self.next = Some(aligned + self.interval);
                Some(aligned)
            }
            Some(_) => None,
        }
    }
}
