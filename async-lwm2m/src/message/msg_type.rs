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

/// The type of a datagram-framed message, from the two type bits of its
/// header. Messages on a stream carry no type.
#[derive(Debug, Copy, Eq, PartialEq, Hash, Clone, Default)]
pub enum MsgType {
    /// Confirmable; retransmitted until acknowledged.
    #[default]
    Con = 0,

    /// Non-confirmable.
    Non = 1,

    /// Acknowledgement of a `Con`, possibly carrying a response.
    Ack = 2,

    /// Reset; the receiver could not process a message.
    Rst = 3,
}

impl MsgType {
    /// Decodes the two type bits.
    pub fn try_from(bits: u8) -> Option<MsgType> {
        [MsgType::Con, MsgType::Non, MsgType::Ack, MsgType::Rst]
            .get(usize::from(bits))
            .copied()
    }

    /// True for `Con`.
    pub fn is_con(self) -> bool {
        self == MsgType::Con
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_bits() {
        assert_eq!(Some(MsgType::Ack), MsgType::try_from(2));
        assert_eq!(None, MsgType::try_from(4));
        assert_eq!(3, MsgType::Rst as u8);
    }
}
