// src/timer.rs
//! Timer substrate for the single-threaded core loop.
//!
//! Every debounce window, escalation delay, silence watchdog and repeat
//! publication in the service is an entry in one [`TimerSet`]. Entries
//! carry an event payload instead of a callback so the service can own
//! all mutable state: the loop pops due entries and dispatches the
//! events itself, which sidesteps the cyclic borrows a callback registry
//! would need.

use std::time::Duration;

use tokio::time::Instant;

/// Handle to a timer entry. Stable for the lifetime of the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(usize);

/// What the dispatcher wants done with a timer after its event fired.
///
/// Returning [`Stop`](TimerVerdict::Stop) from a handler cancels further
/// firings, mirroring a repeating job that decides it is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerVerdict {
    Continue,
    Stop,
}

struct Entry<E> {
    interval: Duration,
    event: E,
    deadline: Option<Instant>,
    repeating: bool,
}

/// A set of cancellable timers carrying event payloads.
///
/// Deadlines use [`tokio::time::Instant`], so a paused test clock drives
/// the set deterministically via `tokio::time::advance`.
pub struct TimerSet<E> {
    entries: Vec<Entry<E>>,
}

impl<E: Clone> TimerSet<E> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Register a repeating timer. If `start_immediately` is set the
    /// first fire is due at once; otherwise the timer is created stopped
    /// and must be armed with [`start`](Self::start).
    pub fn every(&mut self, interval: Duration, event: E, start_immediately: bool) -> TimerId {
        let deadline = start_immediately.then(Instant::now);
        self.entries.push(Entry {
            interval,
            event,
            deadline,
            repeating: true,
        });
        TimerId(self.entries.len() - 1)
    }

    /// Register a one-shot timer due `interval` from now.
    pub fn after(&mut self, interval: Duration, event: E) -> TimerId {
        self.entries.push(Entry {
            interval,
            event,
            deadline: Some(Instant::now() + interval),
            repeating: false,
        });
        TimerId(self.entries.len() - 1)
    }

    /// Arm the timer. `delayed` schedules the first fire one interval
    /// from now; otherwise it is due immediately.
    pub fn start(&mut self, id: TimerId, delayed: bool) {
        let entry = &mut self.entries[id.0];
        let now = Instant::now();
        entry.deadline = Some(if delayed { now + entry.interval } else { now });
    }

    /// Disarm the timer without firing it.
    pub fn stop(&mut self, id: TimerId) {
        self.entries[id.0].deadline = None;
    }

    /// Clear any pending fire and re-arm with the current interval.
    pub fn restart(&mut self, id: TimerId, delayed: bool) {
        self.start(id, delayed);
    }

    /// Change the interval. Takes effect on the next `start`/`restart`
    /// and on periodic re-arms; a pending deadline is left untouched.
    pub fn set_interval(&mut self, id: TimerId, interval: Duration) {
        self.entries[id.0].interval = interval;
    }

    pub fn is_running(&self, id: TimerId) -> bool {
        self.entries[id.0].deadline.is_some()
    }

    /// Earliest pending deadline, if any timer is armed.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().filter_map(|e| e.deadline).min()
    }

    /// Pop the earliest timer due at `now`, re-arming it first when
    /// repeating. Re-arm is drift-free (`deadline + interval`), so a
    /// timer that fell behind fires repeatedly until caught up.
    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerId, E)> {
        let idx = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.deadline.map(|d| (i, d)))
            .filter(|&(_, d)| d <= now)
            .min_by_key(|&(_, d)| d)
            .map(|(i, _)| i)?;

        let entry = &mut self.entries[idx];
        entry.deadline = if entry.repeating {
            entry.deadline.map(|d| d + entry.interval)
        } else {
            None
        };
        Some((TimerId(idx), entry.event.clone()))
    }
}

impl<E: Clone> Default for TimerSet<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{self, Duration};

    fn drain(set: &mut TimerSet<&'static str>) -> Vec<&'static str> {
        let now = Instant::now();
        let mut fired = Vec::new();
        while let Some((_, ev)) = set.pop_due(now) {
            fired.push(ev);
        }
        fired
    }

    #[tokio::test(start_paused = true)]
    async fn every_fires_after_interval_when_delayed() {
        let mut set = TimerSet::new();
        let id = set.every(Duration::from_secs(5), "tick", false);
        set.start(id, true);

        assert!(drain(&mut set).is_empty());
        time::advance(Duration::from_secs(4)).await;
        assert!(drain(&mut set).is_empty());
        time::advance(Duration::from_secs(1)).await;
        assert_eq!(drain(&mut set), vec!["tick"]);
    }

    #[tokio::test(start_paused = true)]
    async fn undelayed_start_is_due_immediately() {
        let mut set = TimerSet::new();
        let id = set.every(Duration::from_secs(5), "tick", false);
        set.start(id, false);
        assert_eq!(drain(&mut set), vec!["tick"]);
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_timer_rearms() {
        let mut set = TimerSet::new();
        let id = set.every(Duration::from_secs(2), "tick", false);
        set.start(id, true);

        time::advance(Duration::from_secs(2)).await;
        assert_eq!(drain(&mut set).len(), 1);
        time::advance(Duration::from_secs(2)).await;
        assert_eq!(drain(&mut set).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lagging_timer_catches_up() {
        let mut set = TimerSet::new();
        let id = set.every(Duration::from_secs(1), "tick", false);
        set.start(id, true);

        time::advance(Duration::from_secs(3)).await;
        assert_eq!(drain(&mut set).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_clears_pending_fire() {
        let mut set = TimerSet::new();
        let id = set.every(Duration::from_secs(1), "tick", false);
        set.start(id, true);
        set.stop(id);

        time::advance(Duration::from_secs(5)).await;
        assert!(drain(&mut set).is_empty());
        assert!(!set.is_running(id));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_delays_pending_fire() {
        let mut set = TimerSet::new();
        let id = set.every(Duration::from_secs(2), "tick", false);
        set.start(id, true);

        time::advance(Duration::from_secs(1)).await;
        set.restart(id, true);
        time::advance(Duration::from_secs(1)).await;
        assert!(drain(&mut set).is_empty());
        time::advance(Duration::from_secs(1)).await;
        assert_eq!(drain(&mut set), vec!["tick"]);
    }

    #[tokio::test(start_paused = true)]
    async fn after_fires_once() {
        let mut set = TimerSet::new();
        set.after(Duration::from_secs(3), "once");

        time::advance(Duration::from_secs(3)).await;
        assert_eq!(drain(&mut set), vec!["once"]);
        time::advance(Duration::from_secs(10)).await;
        assert!(drain(&mut set).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn set_interval_applies_on_restart() {
        let mut set = TimerSet::new();
        let id = set.every(Duration::from_secs(60), "tick", false);
        set.set_interval(id, Duration::from_secs(2));
        set.start(id, true);

        time::advance(Duration::from_secs(2)).await;
        assert_eq!(drain(&mut set), vec!["tick"]);
    }

    #[tokio::test(start_paused = true)]
    async fn due_timers_pop_in_deadline_order() {
        let mut set = TimerSet::new();
        let slow = set.every(Duration::from_secs(3), "slow", false);
        let fast = set.every(Duration::from_secs(1), "fast", false);
        set.start(slow, true);
        set.start(fast, true);

        time::advance(Duration::from_secs(3)).await;
        let now = Instant::now();
        let order: Vec<_> = std::iter::from_fn(|| set.pop_due(now).map(|(_, e)| e)).collect();
        assert_eq!(order, vec!["fast", "fast", "slow", "fast"]);
    }
}
