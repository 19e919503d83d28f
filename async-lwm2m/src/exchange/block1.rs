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

//! Server-side reassembly of BLOCK1 request bodies.

use super::*;
use std::collections::VecDeque;

/// What a [`Block1Receiver`] decided about an incoming block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block1Outcome {
    /// The block is the next one in sequence. Its payload should be consumed
    /// and answered with `2.31 Continue` carrying `block` (or with the final
    /// response if `last` is set).
    Accepted {
        /// The BLOCK1 option to echo in the response.
        block: BlockInfo,

        /// Absolute byte offset of the payload.
        offset: usize,

        /// True for the final block of the body.
        last: bool,
    },

    /// A repeated block that was already answered. Send this response again.
    Duplicate(CoapMessage),

    /// The block cannot be accepted.
    Reject(ResponseError),
}

/// What to do with a request that arrives while a transfer is in progress.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The request belongs to the transfer, or no transfer is running.
    Accept,

    /// Answer a confirmable request with `5.03 Service Unavailable`.
    Busy,

    /// Drop a non-confirmable request.
    Ignore,
}

#[derive(Debug)]
struct Transfer {
    path: Vec<String>,
    next_offset: usize,
    szx: u8,
}

/// Tracks one BLOCK1 upload towards a resource, plus a bounded cache of
/// responses to recently accepted blocks.
#[derive(Debug)]
pub struct Block1Receiver {
    transfer: Option<Transfer>,
    cache: VecDeque<(MsgToken, u32, CoapMessage)>,
    cache_budget: usize,
}

impl Block1Receiver {
    /// Creates a receiver whose duplicate cache holds responses totalling at
    /// most `cache_budget` payload bytes (always at least one response).
    pub fn new(cache_budget: usize) -> Block1Receiver {
        Block1Receiver {
            transfer: None,
            cache: VecDeque::new(),
            cache_budget,
        }
    }

    /// True while a transfer has started and not finished.
    pub fn in_progress(&self) -> bool {
        self.transfer.is_some()
    }

    /// Number of bytes received so far in the current transfer.
    pub fn received(&self) -> usize {
        self.transfer.as_ref().map(|t| t.next_offset).unwrap_or(0)
    }

    /// Abandons the current transfer.
    pub fn abort(&mut self) {
        self.transfer = None;
        self.cache.clear();
    }

    /// Decides whether a request unrelated to the running transfer may be
    /// processed now.
    pub fn admits(&self, msg: &CoapMessage) -> Admission {
        match &self.transfer {
            None => Admission::Accept,
            Some(t) if t.path == msg.uri_path() => Admission::Accept,
            Some(_) if msg.msg_type == Some(MsgType::Non) => Admission::Ignore,
            Some(_) => Admission::Busy,
        }
    }

    /// Examines a request carrying a BLOCK1 option.
    pub fn handle(&mut self, msg: &CoapMessage) -> Block1Outcome {
        let block = match msg.try_option(option::BLOCK1) {
            Ok(Some(block)) => block,
            Ok(None) => {
                // A plain request restarts the resource from scratch.
                self.abort();
                return Block1Outcome::Accepted {
                    block: BlockInfo::default(),
                    offset: 0,
                    last: true,
                };
            }
            Err(_) => return Block1Outcome::Reject(ResponseError::BadOption),
        };

        if block.more_flag() && msg.payload.len() != block.len() {
            return Block1Outcome::Reject(ResponseError::BadRequest);
        }

        if block.num() == 0 {
            // Either a fresh transfer, or a repeat of the first block.
            if let Some(cached) = self.cached(msg.token, 0) {
                if self.received() <= block.len() {
                    return Block1Outcome::Duplicate(cached);
                }
            }
            self.cache.clear();
            self.transfer = Some(Transfer {
                path: msg.uri_path(),
                next_offset: 0,
                szx: block.szx(),
            });
        }

        let (next_offset, szx) = match &self.transfer {
            Some(t) => (t.next_offset, t.szx),
            None => return Block1Outcome::Reject(ResponseError::RequestEntityIncomplete),
        };

        let offset = block.offset();

        if offset < next_offset {
            return match self.cached(msg.token, block.num()) {
                Some(cached) => Block1Outcome::Duplicate(cached),
                None => Block1Outcome::Reject(ResponseError::ServiceUnavailable),
            };
        }

        if offset > next_offset {
            if block.szx() != szx && next_offset % block.len() != 0 {
                return Block1Outcome::Reject(ResponseError::BadOption);
            }
            return Block1Outcome::Reject(ResponseError::RequestEntityIncomplete);
        }

        if let Some(transfer) = self.transfer.as_mut() {
            transfer.szx = block.szx();
            transfer.next_offset = offset + msg.payload.len();
        }

        let last = !block.more_flag();
        let echoed = block.without_more_flag();
        let echoed = if last { echoed } else { echoed.with_more_flag() };
        if last {
            self.transfer = None;
        }

        Block1Outcome::Accepted {
            block: echoed,
            offset,
            last,
        }
    }

    /// Remembers the response sent for an accepted block.
    pub fn cache_response(&mut self, request: &CoapMessage, response: &CoapMessage) {
        let num = match request.block1() {
            Some(block) => block.num(),
            None => return,
        };

        self.cache.push_back((request.token, num, response.clone()));

        let mut total: usize = self.cache.iter().map(|(_, _, r)| r.payload.len() + 16).sum();
        while self.cache.len() > 1 && total > self.cache_budget {
            if let Some((_, _, evicted)) = self.cache.pop_front() {
                total -= evicted.payload.len() + 16;
            }
        }
    }

    fn cached(&self, token: MsgToken, num: u32) -> Option<CoapMessage> {
        self.cache
            .iter()
            .rev()
            .find(|(t, n, _)| *t == token && *n == num)
            .map(|(_, _, r)| r.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_req(num: u32, more: bool, szx: u8, payload: &[u8]) -> CoapMessage {
        CoapMessage::request(MsgCode::PUT)
            .with_token(MsgToken::from(0x99u32))
            .with_uri_path("5/0/0")
            .with_option(option::BLOCK1, BlockInfo::new(num, more, szx).unwrap())
            .with_payload(payload)
    }

    fn accept_and_cache(rx: &mut Block1Receiver, req: &CoapMessage) -> (usize, bool) {
        match rx.handle(req) {
            Block1Outcome::Accepted { offset, last, block } => {
                let resp = req
                    .response(if last { MsgCode::CHANGED } else { MsgCode::CONTINUE })
                    .with_option(option::BLOCK1, block);
                rx.cache_response(req, &resp);
                (offset, last)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn reassembles_in_order() {
        let payload: Vec<u8> = (0..40u8).collect();
        let mut rx = Block1Receiver::new(64);
        let mut out = Vec::new();

        for (num, chunk) in payload.chunks(16).enumerate() {
            let more = (num + 1) * 16 < payload.len();
            let req = block_req(num as u32, more, 0, chunk);
            let (offset, last) = accept_and_cache(&mut rx, &req);
            assert_eq!(out.len(), offset);
            out.extend_from_slice(chunk);
            assert_eq!(!more, last);
        }

        assert_eq!(payload, out);
        assert!(!rx.in_progress());
    }

    #[test]
    fn duplicate_answered_from_cache() {
        let mut rx = Block1Receiver::new(1024);
        accept_and_cache(&mut rx, &block_req(0, true, 0, &[1; 16]));
        accept_and_cache(&mut rx, &block_req(1, true, 0, &[2; 16]));

        match rx.handle(&block_req(1, true, 0, &[2; 16])) {
            Block1Outcome::Duplicate(resp) => assert_eq!(MsgCode::CONTINUE, resp.code),
            other => panic!("unexpected {:?}", other),
        }

        // Still expecting block 2.
        let (offset, _) = accept_and_cache(&mut rx, &block_req(2, false, 0, &[3; 4]));
        assert_eq!(32, offset);
    }

    #[test]
    fn gap_is_incomplete() {
        let mut rx = Block1Receiver::new(1024);
        accept_and_cache(&mut rx, &block_req(0, true, 0, &[1; 16]));
        assert_eq!(
            Block1Outcome::Reject(ResponseError::RequestEntityIncomplete),
            rx.handle(&block_req(3, true, 0, &[1; 16]))
        );
    }

    #[test]
    fn old_block_without_cache_is_unavailable() {
        let mut rx = Block1Receiver::new(0);
        accept_and_cache(&mut rx, &block_req(0, true, 0, &[1; 16]));
        accept_and_cache(&mut rx, &block_req(1, true, 0, &[1; 16]));
        accept_and_cache(&mut rx, &block_req(2, true, 0, &[1; 16]));
        assert_eq!(
            Block1Outcome::Reject(ResponseError::ServiceUnavailable),
            rx.handle(&block_req(1, true, 0, &[1; 16]))
        );
    }

    #[test]
    fn size_change_must_stay_aligned() {
        let mut rx = Block1Receiver::new(1024);
        // 32-byte blocks, then switching to 16-byte blocks at offset 32 is fine.
        accept_and_cache(&mut rx, &block_req(0, true, 1, &[1; 32]));
        let (offset, _) = accept_and_cache(&mut rx, &block_req(2, true, 0, &[1; 16]));
        assert_eq!(32, offset);

        // Now at offset 48; 32-byte block 2 would start at 64.
        assert_eq!(
            Block1Outcome::Reject(ResponseError::BadOption),
            rx.handle(&block_req(2, true, 1, &[1; 32]))
        );
    }

    #[test]
    fn largest_blocks() {
        let mut rx = Block1Receiver::new(2048);
        let (_, last) = accept_and_cache(&mut rx, &block_req(0, true, 6, &[7; 1024]));
        assert!(!last);
        let (offset, last) = accept_and_cache(&mut rx, &block_req(1, false, 6, &[7; 10]));
        assert_eq!((1024, true), (offset, last));
    }

    #[test]
    fn unrelated_requests_while_busy() {
        let mut rx = Block1Receiver::new(64);
        accept_and_cache(&mut rx, &block_req(0, true, 0, &[1; 16]));

        let other = CoapMessage::request(MsgCode::PUT).with_uri_path("5/0/1");
        assert_eq!(Admission::Busy, rx.admits(&other));

        let mut non = other.clone();
        non.msg_type = Some(MsgType::Non);
        assert_eq!(Admission::Ignore, rx.admits(&non));

        assert_eq!(Admission::Accept, rx.admits(&block_req(1, true, 0, &[])));
    }
}
