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

use std::collections::VecDeque;

/// FIFO bounded by `limit`; pushing onto a full queue evicts the oldest
/// entry. A limit of zero stores nothing.
#[derive(Debug, Clone)]
pub struct DropOldestQueue<T> {
    items: VecDeque<T>,
    limit: usize,
    dropped: u64,
}

impl<T> DropOldestQueue<T> {
    /// Creates an empty queue holding at most `limit` entries.
    pub fn new(limit: usize) -> DropOldestQueue<T> {
        DropOldestQueue {
            items: VecDeque::new(),
            limit,
            dropped: 0,
        }
    }

    /// The limit.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Changes the limit, evicting the oldest entries if needed.
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
        self.trim();
    }

    fn trim(&mut self) {
        while self.items.len() > self.limit {
            self.items.pop_front();
            self.dropped += 1;
        }
    }

    /// Appends `item`, evicting the oldest entry when full.
    pub fn push(&mut self, item: T) {
        self.items.push_back(item);
        self.trim();
    }

    /// Removes and returns the oldest entry.
    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Removes every entry for which `f` returns false.
    pub fn retain<F: FnMut(&T) -> bool>(&mut self, f: F) {
        self.items.retain(f);
    }

    /// Removes and returns every entry, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.items.drain(..)
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Total number of evicted entries.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Iterates oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_most_recent() {
        let mut queue = DropOldestQueue::new(3);
        for i in 0..6 {
            queue.push(i);
        }
        assert_eq!(vec![3, 4, 5], queue.drain().collect::<Vec<_>>());
        assert_eq!(3, queue.dropped());
        assert!(queue.is_empty());
    }

    #[test]
    fn zero_limit_and_shrink() {
        let mut queue = DropOldestQueue::new(0);
        queue.push(1);
        assert!(queue.is_empty());

        queue.set_limit(4);
        for i in 0..4 {
            queue.push(i);
        }
        queue.set_limit(2);
        assert_eq!(vec![&2, &3], queue.iter().collect::<Vec<_>>());
    }
}
