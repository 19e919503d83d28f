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

use super::*;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Remembers recently received confirmable and non-confirmable requests so
/// that retransmissions are answered with the same response instead of
/// being processed twice.
#[derive(Debug, Default)]
pub struct DedupCache {
    entries: HashMap<(SocketAddr, MsgId), (Instant, Option<CoapMessage>)>,
    lifetime: Duration,
}

/// What to do with a received request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupVerdict {
    /// First time seen; process it.
    New,

    /// Seen before and already answered; resend this.
    Answered(CoapMessage),

    /// Seen before and still being processed; drop it.
    InProgress,
}

impl DedupCache {
    /// Creates a cache that forgets entries after `lifetime`
    /// (`EXCHANGE_LIFETIME` for confirmable requests).
    pub fn new(lifetime: Duration) -> DedupCache {
        DedupCache {
            entries: HashMap::new(),
            lifetime,
        }
    }

    /// Records the request and tells whether it is a duplicate.
    pub fn check(&mut self, now: Instant, remote: SocketAddr, msg_id: MsgId) -> DedupVerdict {
        self.expire(now);
        match self.entries.get(&(remote, msg_id)) {
            Some((_, Some(resp))) => DedupVerdict::Answered(resp.clone()),
            Some((_, None)) => DedupVerdict::InProgress,
            None => {
                self.entries
                    .insert((remote, msg_id), (now + self.lifetime, None));
                DedupVerdict::New
            }
        }
    }

    /// Stores the response sent for the request with `msg_id`.
    pub fn answered(&mut self, remote: SocketAddr, msg_id: MsgId, response: &CoapMessage) {
        if let Some(entry) = self.entries.get_mut(&(remote, msg_id)) {
            entry.1 = Some(response.clone());
        }
    }

    /// Drops expired entries.
    pub fn expire(&mut self, now: Instant) {
        self.entries.retain(|_, (expiry, _)| *expiry > now);
    }

    /// Number of requests remembered.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_gets_cached_response() {
        let remote = SocketAddr::from(([10, 0, 0, 1], 5683));
        let now = Instant::now();
        let mut cache = DedupCache::new(Duration::from_secs(247));

        assert_eq!(DedupVerdict::New, cache.check(now, remote, 7));
        assert_eq!(DedupVerdict::InProgress, cache.check(now, remote, 7));

        let resp = CoapMessage::new(MsgType::Ack, MsgCode::CONTENT).with_msg_id(7);
        cache.answered(remote, 7, &resp);
        assert_eq!(DedupVerdict::Answered(resp), cache.check(now, remote, 7));

        let later = now + Duration::from_secs(248);
        assert_eq!(DedupVerdict::New, cache.check(later, remote, 7));
    }
}
