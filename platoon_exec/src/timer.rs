//! # Timers
//!
//! A set of cancellable one-shot timers keyed by their purpose. At most one instance of each
//! purpose is pending at any time: starting a purpose which is already pending replaces its
//! deadline.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::collections::BTreeMap;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Pending timers of one component.
#[derive(Debug, Clone)]
pub struct TimerSet<T: Ord + Copy> {
    pending: BTreeMap<T, f64>,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl<T: Ord + Copy> TimerSet<T> {
    pub fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
        }
    }

    /// Start (or restart) the timer for `purpose`, expiring at `deadline_s`.
    pub fn start(&mut self, purpose: T, deadline_s: f64) {
        self.pending.insert(purpose, deadline_s);
    }

    /// Cancel the timer for `purpose`. Does nothing if it is not pending.
    pub fn stop(&mut self, purpose: T) {
        self.pending.remove(&purpose);
    }

    pub fn is_pending(&self, purpose: T) -> bool {
        self.pending.contains_key(&purpose)
    }

    /// Deadline of the pending timer for `purpose`.
    pub fn deadline(&self, purpose: T) -> Option<f64> {
        self.pending.get(&purpose).copied()
    }

    /// The earliest deadline of all pending timers.
    pub fn next_deadline(&self) -> Option<f64> {
        self.pending
            .values()
            .copied()
            .fold(None, |acc: Option<f64>, d| match acc {
                Some(a) if a <= d => Some(a),
                _ => Some(d),
            })
    }

    /// Remove and return the timer with the earliest deadline at or before `now_s`.
    ///
    /// Timers with equal deadlines expire in purpose order.
    pub fn pop_expired(&mut self, now_s: f64) -> Option<T> {
        let mut earliest: Option<(T, f64)> = None;

        for (purpose, deadline) in self.pending.iter() {
            if *deadline > now_s {
                continue;
            }
            match earliest {
                Some((_, d)) if d <= *deadline => (),
                _ => earliest = Some((*purpose, *deadline)),
            }
        }

        let (purpose, _) = earliest?;
        self.pending.remove(&purpose);
        Some(purpose)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl<T: Ord + Copy> Default for TimerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    enum Purpose {
        Control,
        Heartbeat,
    }

    #[test]
    fn test_single_pending_per_purpose() {
        let mut timers = TimerSet::new();

        timers.start(Purpose::Control, 1.0);
        timers.start(Purpose::Control, 3.0);

        assert_eq!(timers.len(), 1);
        assert_eq!(timers.deadline(Purpose::Control), Some(3.0));
        assert_eq!(timers.pop_expired(2.0), None);
        assert_eq!(timers.pop_expired(3.0), Some(Purpose::Control));
        assert!(timers.is_empty());
    }

    #[test]
    fn test_expiry_order() {
        let mut timers = TimerSet::new();

        timers.start(Purpose::Heartbeat, 0.5);
        timers.start(Purpose::Control, 0.7);

        assert_eq!(timers.next_deadline(), Some(0.5));
        assert_eq!(timers.pop_expired(1.0), Some(Purpose::Heartbeat));
        assert_eq!(timers.pop_expired(1.0), Some(Purpose::Control));
        assert_eq!(timers.pop_expired(1.0), None);
    }

    #[test]
    fn test_stop() {
        let mut timers = TimerSet::new();

        timers.start(Purpose::Control, 0.1);
        timers.stop(Purpose::Control);
        timers.stop(Purpose::Heartbeat);

        assert!(!timers.is_pending(Purpose::Control));
        assert_eq!(timers.pop_expired(10.0), None);
    }
}
