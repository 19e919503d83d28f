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
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Per-endpoint message id and token generator.
///
/// Message ids start at a random value and increase by one; tokens are
/// random. Each endpoint owns its own generator.
#[derive(Debug)]
pub struct IdGenerator {
    rng: StdRng,
    next_msg_id: MsgId,
    token_len: usize,
}

impl IdGenerator {
    /// Creates a generator seeded from the operating system.
    pub fn new() -> IdGenerator {
        IdGenerator::from_rng(StdRng::from_entropy())
    }

    /// Creates a deterministic generator, for tests.
    pub fn seeded(seed: u64) -> IdGenerator {
        IdGenerator::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(mut rng: StdRng) -> IdGenerator {
        let next_msg_id = rng.gen();
        IdGenerator {
            rng,
            next_msg_id,
            token_len: 8,
        }
    }

    /// Sets the length of generated tokens, clamped to 1..=8.
    pub fn set_token_len(&mut self, len: usize) {
        self.token_len = len.clamp(1, MsgToken::MAX_LEN);
    }

    /// Allocates the next message id.
    pub fn next_msg_id(&mut self) -> MsgId {
        let id = self.next_msg_id;
        self.next_msg_id = self.next_msg_id.wrapping_add(1);
        id
    }

    /// Allocates a fresh random token.
    pub fn next_token(&mut self) -> MsgToken {
        MsgToken::random(&mut self.rng, self.token_len)
    }

    /// The random number generator, for retransmission jitter.
    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        IdGenerator::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_ids_increase_and_wrap() {
        let mut ids = IdGenerator::seeded(7);
        let first = ids.next_msg_id();
        assert_eq!(first.wrapping_add(1), ids.next_msg_id());

        ids.next_msg_id = u16::MAX;
        assert_eq!(u16::MAX, ids.next_msg_id());
        assert_eq!(0, ids.next_msg_id());
    }

    #[test]
    fn separate_generators_are_independent() {
        let mut a = IdGenerator::new();
        let mut b = IdGenerator::new();
        assert_ne!(a.next_token(), b.next_token());
    }
}
