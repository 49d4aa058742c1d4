// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Timer bookkeeping for per-step timeouts and `spawn` readiness
//! windows.

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Timer {
    fires_at: Instant,
}

/// Tracks outstanding deadlines keyed by step id. The dispatcher polls
/// [`Scheduler::fired_timers`] once per loop iteration against the
/// current clock reading.
#[derive(Debug, Default)]
pub struct Scheduler {
    timers: HashMap<String, Timer>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_timer(&mut self, id: String, duration: Duration, now: Instant) {
        let fires_at = now + duration;
        self.timers.insert(id, Timer { fires_at });
    }

    pub fn cancel_timer(&mut self, id: &str) {
        self.timers.remove(id);
    }

    pub fn cancel_timers_with_prefix(&mut self, prefix: &str) {
        self.timers.retain(|id, _| !id.starts_with(prefix));
    }

    /// Drain and return the ids of every timer that has fired by `now`.
    pub fn fired_timers(&mut self, now: Instant) -> Vec<String> {
        let mut fired = Vec::new();
        self.timers.retain(|id, timer| {
            if timer.fires_at <= now {
                fired.push(id.clone());
                false
            } else {
                true
            }
        });
        fired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.values().map(|t| t.fires_at).min()
    }

    pub fn has_timers(&self) -> bool {
        !self.timers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fired_timers_drains_expired_entries() {
        let mut sched = Scheduler::new();
        let now = Instant::now();
        sched.set_timer("a".into(), Duration::from_secs(1), now);
        sched.set_timer("b".into(), Duration::from_secs(10), now);

        assert!(sched.fired_timers(now).is_empty());

        let later = now + Duration::from_secs(2);
        let fired = sched.fired_timers(later);
        assert_eq!(fired, vec!["a".to_string()]);
        assert!(sched.has_timers());
    }

    #[test]
    fn cancel_by_prefix_removes_matching_timers() {
        let mut sched = Scheduler::new();
        let now = Instant::now();
        sched.set_timer("step1.a".into(), Duration::from_secs(5), now);
        sched.set_timer("step1.b".into(), Duration::from_secs(5), now);
        sched.set_timer("step2.a".into(), Duration::from_secs(5), now);

        sched.cancel_timers_with_prefix("step1.");
        assert_eq!(sched.next_deadline(), Some(now + Duration::from_secs(5)));
        assert_eq!(sched.fired_timers(now + Duration::from_secs(6)).len(), 1);
    }
}
