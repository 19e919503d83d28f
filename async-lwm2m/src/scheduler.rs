// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Timer wheel and job queue shared by the state machines.
//!
//! Jobs are plain values; the owner decides what running one means. Jobs
//! that fall due at the same instant run in the order they were scheduled.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Handle for cancelling a scheduled job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobHandle(u64);

/// A queue of jobs ordered by due time.
#[derive(Debug, Clone)]
pub struct Scheduler<J> {
    jobs: BTreeMap<(Instant, u64), J>,
    next_seq: u64,
}

impl<J> Default for Scheduler<J> {
    fn default() -> Self {
        Scheduler {
            jobs: BTreeMap::new(),
            next_seq: 0,
        }
    }
}

impl<J> Scheduler<J> {
    /// Creates an empty scheduler.
    pub fn new() -> Scheduler<J> {
        Default::default()
    }

    /// Schedules `job` to run at `at`.
    pub fn schedule_at(&mut self, at: Instant, job: J) -> JobHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.jobs.insert((at, seq), job);
        JobHandle(seq)
    }

    /// Schedules `job` to run `delay` after `now`.
    pub fn schedule_in(&mut self, now: Instant, delay: Duration, job: J) -> JobHandle {
        self.schedule_at(now + delay, job)
    }

    /// Removes a scheduled job, returning it if it had not run yet.
    pub fn cancel(&mut self, handle: JobHandle) -> Option<J> {
        let key = self.jobs.keys().find(|(_, seq)| *seq == handle.0).copied()?;
        self.jobs.remove(&key)
    }

    /// Removes every job matching `f`.
    pub fn cancel_where<F: FnMut(&J) -> bool>(&mut self, mut f: F) {
        self.jobs.retain(|_, job| !f(job));
    }

    /// True if a job matching `f` is scheduled.
    pub fn contains<F: FnMut(&J) -> bool>(&self, mut f: F) -> bool {
        self.jobs.values().any(|job| f(job))
    }

    /// When the earliest job falls due.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.jobs.keys().next().map(|(at, _)| *at)
    }

    /// Removes and returns the earliest job due at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<J> {
        let key = *self.jobs.keys().next()?;
        if key.0 > now {
            return None;
        }
        self.jobs.remove(&key)
    }

    /// Number of scheduled jobs.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// True if nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_order() {
        let now = Instant::now();
        let mut sched = Scheduler::new();
        sched.schedule_in(now, Duration::from_secs(2), "late");
        sched.schedule_at(now, "first");
        sched.schedule_at(now, "second");

        assert_eq!(Some(now), sched.next_deadline());
        assert_eq!(Some("first"), sched.pop_due(now));
        assert_eq!(Some("second"), sched.pop_due(now));
        assert_eq!(None, sched.pop_due(now));
        assert_eq!(Some("late"), sched.pop_due(now + Duration::from_secs(2)));
        assert!(sched.is_empty());
    }

    #[test]
    fn cancel() {
        let now = Instant::now();
        let mut sched = Scheduler::new();
        let handle = sched.schedule_at(now, 1);
        sched.schedule_at(now, 2);
        assert_eq!(Some(1), sched.cancel(handle));
        assert_eq!(None, sched.cancel(handle));
        sched.cancel_where(|job| *job == 2);
        assert!(sched.is_empty());
    }
}
