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

//! Client-side BLOCK2 download bookkeeping.

use super::*;

/// The result of feeding one response to a [`Block2Assembler`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Block2Step {
    /// Request this block next.
    More(BlockInfo),

    /// The resource has been received completely.
    Done,
}

/// Follows a BLOCK2 transfer: checks that every block continues at the
/// expected byte offset, adapts to the block size chosen by the server and
/// detects a change of the resource through its ETag.
///
/// The assembler does not keep the payload; callers consume each block as it
/// arrives, which is what lets a download be resumed after a restart.
#[derive(Debug, Clone)]
pub struct Block2Assembler {
    next_offset: usize,
    szx: u8,
    etag: Option<ETag>,
}

impl Block2Assembler {
    /// Starts a transfer from the beginning, asking for blocks of `2^(szx+4)` bytes.
    pub fn new(szx: u8) -> Block2Assembler {
        Block2Assembler {
            next_offset: 0,
            szx: szx.min(BlockInfo::SZX_MAX),
            etag: None,
        }
    }

    /// Continues a transfer of which `offset` bytes are already stored.
    ///
    /// The block size is reduced until `offset` falls on a block boundary.
    /// If the server later presents an ETag different from `etag`, the
    /// transfer fails with [`Error::ResourceChanged`].
    pub fn resume(offset: usize, szx: u8, etag: Option<ETag>) -> Block2Assembler {
        let mut szx = szx.min(BlockInfo::SZX_MAX);
        while szx > 0 && offset % (1usize << (szx + 4)) != 0 {
            szx -= 1;
        }

        // Offsets below 16 bytes cannot be expressed; start over.
        let next_offset = if offset % 16 == 0 { offset } else { 0 };

        Block2Assembler {
            next_offset,
            szx,
            etag,
        }
    }

    /// Byte offset of the next expected block.
    pub fn offset(&self) -> usize {
        self.next_offset
    }

    /// ETag seen so far.
    pub fn etag(&self) -> Option<&ETag> {
        self.etag.as_ref()
    }

    /// The BLOCK2 option to put in the next request.
    pub fn next_block(&self) -> BlockInfo {
        BlockInfo::at_offset(self.next_offset, self.szx).unwrap_or_default()
    }

    /// Checks a response and advances. On success the response payload is
    /// the data at the previous [`offset`](Block2Assembler::offset).
    pub fn feed(&mut self, response: &CoapMessage) -> Result<Block2Step, Error> {
        if let Some(etag) = response.etag() {
            match &self.etag {
                Some(expected) if !expected.weak_eq(&etag) => {
                    warn!("resource changed: ETag {} -> {}", expected, etag);
                    return Err(Error::ResourceChanged);
                }
                Some(_) => (),
                None => self.etag = Some(etag),
            }
        }

        let block = match response.try_option(option::BLOCK2)? {
            Some(block) => block,
            None if self.next_offset == 0 => {
                // Whole representation in a single response.
                self.next_offset = response.payload.len();
                return Ok(Block2Step::Done);
            }
            None => return Err(Error::BadOption),
        };

        if block.offset() != self.next_offset || block.szx() > self.szx {
            return Err(Error::BadOption);
        }

        if block.more_flag() && response.payload.len() != block.len() {
            return Err(Error::InvalidMessage);
        }

        self.szx = block.szx();
        self.next_offset += response.payload.len();

        if !block.more_flag() {
            return Ok(Block2Step::Done);
        }

        BlockInfo::at_offset(self.next_offset, self.szx)
            .map(Block2Step::More)
            .ok_or(Error::OutOfSpace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_resp(num: u32, more: bool, szx: u8, payload: &[u8]) -> CoapMessage {
        CoapMessage::stream(MsgCode::CONTENT)
            .with_option(option::BLOCK2, BlockInfo::new(num, more, szx).unwrap())
            .with_payload(payload)
    }

    #[test]
    fn follows_server_shrinking() {
        let mut asm = Block2Assembler::new(6);
        assert_eq!(BlockInfo::new(0, false, 6).unwrap(), asm.next_block());

        // Server answers with 32-byte blocks.
        assert_eq!(
            Ok(Block2Step::More(BlockInfo::new(1, false, 1).unwrap())),
            asm.feed(&block_resp(0, true, 1, &[0; 32]))
        );
        assert_eq!(
            Ok(Block2Step::Done),
            asm.feed(&block_resp(1, false, 1, &[0; 5]))
        );
        assert_eq!(37, asm.offset());
    }

    #[test]
    fn rejects_misaligned_block() {
        let mut asm = Block2Assembler::new(1);
        asm.feed(&block_resp(0, true, 1, &[0; 32])).unwrap();
        assert_eq!(Err(Error::BadOption), asm.feed(&block_resp(3, true, 1, &[0; 32])));
    }

    #[test]
    fn etag_change_is_detected() {
        let mut asm = Block2Assembler::resume(64, 6, Some(ETag::new(&[1, 2])));
        assert_eq!(BlockInfo::new(1, false, 2).unwrap(), asm.next_block());

        let resp = block_resp(1, true, 2, &[0; 64]).with_option(option::ETAG, ETag::new(&[3]));
        assert_eq!(Err(Error::ResourceChanged), asm.feed(&resp));
    }

    #[test]
    fn single_response_without_block2() {
        let mut asm = Block2Assembler::new(6);
        let resp = CoapMessage::stream(MsgCode::CONTENT).with_payload(&b"small"[..]);
        assert_eq!(Ok(Block2Step::Done), asm.feed(&resp));
        assert_eq!(5, asm.offset());
    }
}
