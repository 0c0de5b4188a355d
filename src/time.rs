//! Clock and timer queue.
//!
//! The stack never reads the wall clock. The driver hands it a monotonically increasing
//! [`Millis`] value through [`crate::Stack::poll`], which makes every timeout in the stack
//! reproducible under a virtual clock.

use std::collections::{BTreeMap, HashMap};

/// Milliseconds since an arbitrary epoch chosen by the driver.
pub type Millis = u64;

/// Handle returned by [`TimerQueue::schedule`], used to cancel a pending timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Deadline-ordered queue of events. Events sharing a deadline fire in scheduling order.
#[derive(Debug)]
pub struct TimerQueue<E> {
    next_id: u64,
    pending: BTreeMap<(Millis, TimerId), E>,
    deadlines: HashMap<TimerId, Millis>,
}

impl<E> TimerQueue<E> {
    pub fn new() -> Self {
        TimerQueue {
            next_id: 0,
            pending: BTreeMap::new(),
            deadlines: HashMap::new(),
        }
    }

    pub fn schedule(&mut self, at: Millis, event: E) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.pending.insert((at, id), event);
        self.deadlines.insert(id, at);
        id
    }

    /// Cancels a timer. Returns the event if it had not fired yet.
    pub fn cancel(&mut self, id: TimerId) -> Option<E> {
        let at = self.deadlines.remove(&id)?;
        self.pending.remove(&(at, id))
    }

    /// Removes and returns the earliest event due at or before `now`.
    pub fn pop_due(&mut self, now: Millis) -> Option<E> {
        let (&(at, id), _) = self.pending.iter().next()?;
        if at > now {
            return None;
        }
        self.deadlines.remove(&id);
        self.pending.remove(&(at, id))
    }

    pub fn next_deadline(&self) -> Option<Millis> {
        self.pending.keys().next().map(|&(at, _)| at)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl<E> Default for TimerQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_then_schedule_order() {
        let mut timers = TimerQueue::new();
        timers.schedule(20, "late");
        timers.schedule(10, "first");
        timers.schedule(10, "second");

        assert_eq!(timers.pop_due(5), None);
        assert_eq!(timers.pop_due(10), Some("first"));
        assert_eq!(timers.pop_due(10), Some("second"));
        assert_eq!(timers.pop_due(19), None);
        assert_eq!(timers.next_deadline(), Some(20));
        assert_eq!(timers.pop_due(100), Some("late"));
        assert!(timers.is_empty());
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut timers = TimerQueue::new();
        let id = timers.schedule(10, 1);
        timers.schedule(10, 2);
        assert_eq!(timers.cancel(id), Some(1));
        assert_eq!(timers.cancel(id), None);
        assert_eq!(timers.pop_due(10), Some(2));
        assert_eq!(timers.pop_due(10), None);
    }
}
