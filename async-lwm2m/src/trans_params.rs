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

use rand::Rng;
use std::time::Duration;

/// Largest `MAX_RETRANSMIT` the derived timers are computed for.
pub const MAX_RETRANSMIT_LIMIT: u32 = 20;

/// Largest `ACK_RANDOM_FACTOR` the derived timers are computed for.
pub const MAX_ACK_RANDOM_FACTOR: f32 = 10.0;

/// [CoAP transmission parameters][tp] used by the exchange engine.
///
/// Unlike a compile-time constant set, these are configured per endpoint so
/// that a client can run with shortened timers against a local test server.
///
/// [tp]: https://tools.ietf.org/html/rfc7252#section-4.8
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct TransParams {
    /// `ACK_TIMEOUT`, default 2 seconds.
    pub ack_timeout: Duration,

    /// `ACK_RANDOM_FACTOR`, default 1.5.
    pub ack_random_factor: f32,

    /// `MAX_RETRANSMIT`, default 4.
    pub max_retransmit: u32,

    /// `NSTART`, default 1.
    pub nstart: usize,

    /// From RFC7252:
    ///
    /// > `MAX_LATENCY` is the maximum time a datagram is expected to take
    /// > from the start of its transmission to the completion of its
    /// > reception. [...] We, also arbitrarily, define `MAX_LATENCY` to be
    /// > 100 seconds.
    pub max_latency: Duration,
}

impl Default for TransParams {
    fn default() -> Self {
        TransParams {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            max_retransmit: 4,
            nstart: 1,
            max_latency: Duration::from_secs(100),
        }
    }
}

impl TransParams {
    /// `ACK_RANDOM_FACTOR` clamped to `1.0..=MAX_ACK_RANDOM_FACTOR`.
    fn random_factor(&self) -> f32 {
        self.ack_random_factor.max(1.0).min(MAX_ACK_RANDOM_FACTOR)
    }

    /// `2 ** exp - 1`, with `exp` clamped to `MAX_RETRANSMIT_LIMIT + 1`.
    fn doublings(exp: u32) -> f32 {
        ((1u64 << exp.min(MAX_RETRANSMIT_LIMIT + 1)) - 1) as f32
    }

    /// From RFC7252:
    ///
    /// > `PROCESSING_DELAY` is the time a node takes to turn around a
    /// > Confirmable message into an acknowledgement.  We assume the node
    /// > will attempt to send an ACK before having the sender time out, so as
    /// > a conservative assumption we set it equal to `ACK_TIMEOUT`.
    pub fn processing_delay(&self) -> Duration {
        self.ack_timeout
    }

    /// From RFC7252:
    ///
    /// >> `ACK_TIMEOUT * ((2 ** MAX_RETRANSMIT) - 1) * ACK_RANDOM_FACTOR`
    pub fn max_transmit_span(&self) -> Duration {
        let factor = Self::doublings(self.max_retransmit) * self.random_factor();
        self.ack_timeout.mul_f32(factor)
    }

    /// From RFC7252:
    ///
    /// >> `ACK_TIMEOUT * ((2 ** (MAX_RETRANSMIT + 1)) - 1) * ACK_RANDOM_FACTOR`
    pub fn max_transmit_wait(&self) -> Duration {
        let factor = Self::doublings(self.max_retransmit.saturating_add(1)) * self.random_factor();
        self.ack_timeout.mul_f32(factor)
    }

    /// `(2 * MAX_LATENCY) + PROCESSING_DELAY`
    pub fn max_rtt(&self) -> Duration {
        2 * self.max_latency + self.processing_delay()
    }

    /// From RFC7252:
    ///
    /// >> `MAX_TRANSMIT_SPAN + (2 * MAX_LATENCY) + PROCESSING_DELAY`
    /// >
    /// > or 247 seconds with the default transmission parameters.
    pub fn exchange_lifetime(&self) -> Duration {
        self.max_transmit_span() + 2 * self.max_latency + self.processing_delay()
    }

    /// `MAX_TRANSMIT_SPAN + MAX_LATENCY`
    pub fn non_lifetime(&self) -> Duration {
        self.max_transmit_span() + self.max_latency
    }

    /// Picks the first retransmission timeout, uniformly between `ACK_TIMEOUT`
    /// and `ACK_TIMEOUT * ACK_RANDOM_FACTOR`.
    pub fn initial_timeout<R: Rng>(&self, rng: &mut R) -> Duration {
        let factor = if self.random_factor() > 1.0 {
            rng.gen_range(1.0..self.random_factor())
        } else {
            1.0
        };
        self.ack_timeout.mul_f32(factor)
    }

    /// How long an exchange may live before it is abandoned: `EXCHANGE_LIFETIME`.
    pub fn default_deadline(&self) -> Duration {
        self.exchange_lifetime()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn derived_defaults() {
        let params = TransParams::default();
        assert_eq!(Duration::from_secs(45), params.max_transmit_span());
        assert_eq!(Duration::from_secs(93), params.max_transmit_wait());
        assert_eq!(Duration::from_secs(202), params.max_rtt());
        assert_eq!(Duration::from_secs(247), params.exchange_lifetime());
        assert_eq!(Duration::from_secs(145), params.non_lifetime());
        assert_eq!(params.exchange_lifetime(), params.default_deadline());
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let params = TransParams {
            max_retransmit: 200,
            ack_random_factor: f32::NAN,
            ..TransParams::default()
        };
        let bounded = TransParams {
            max_retransmit: MAX_RETRANSMIT_LIMIT,
            ack_random_factor: 1.0,
            ..TransParams::default()
        };
        assert_eq!(bounded.max_transmit_span(), params.max_transmit_span());
        assert_eq!(bounded.exchange_lifetime(), params.exchange_lifetime());
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(Duration::from_secs(2), params.initial_timeout(&mut rng));
    }

    #[test]
    fn initial_timeout_range() {
        let params = TransParams::default();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let timeout = params.initial_timeout(&mut rng);
            assert!(timeout >= Duration::from_secs(2), "{:?}", timeout);
            assert!(timeout <= Duration::from_secs(3), "{:?}", timeout);
        }
    }
}
