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

use std::convert::From;
use std::fmt::{Debug, Display, Formatter};

/// Type for interpreting `block1` and `block2` option values.
///
/// The wire value is `(NUM << 4) | (M << 3) | SZX`, where the block size is
/// `1 << (SZX + 4)`.
#[derive(Copy, Clone, Eq, Ord, Hash, PartialOrd, PartialEq)]
pub struct BlockInfo(pub u32);

impl BlockInfo {
    const MORE_FLAG: u32 = 0b1000;

    /// Maximum legal value for `num`.
    pub const NUM_MAX: u32 = (1 << 20) - 1;

    /// SZX value 7 is reserved for BERT, which is only meaningful over TCP.
    const SZX_RESERVED: u8 = 0b0111;

    /// Maximum legal value for `szx`.
    pub const SZX_MAX: u8 = Self::SZX_RESERVED - 1;

    /// Smallest block size, in bytes.
    pub const MIN_SIZE: usize = 16;

    /// Largest block size, in bytes.
    pub const MAX_SIZE: usize = 1024;

    /// Constructs a new `BlockInfo` from the number, more flag, and size exponent.
    pub fn new(num: u32, m: bool, szx: u8) -> Option<BlockInfo> {
        if num > Self::NUM_MAX || szx > Self::SZX_MAX {
            None
        } else {
            Some(BlockInfo((num << 4) + ((m as u32) << 3) + szx as u32))
        }
    }

    /// Returns the size exponent for a block size in bytes, if it is one of
    /// the legal sizes (16 through 1024).
    pub fn szx_for_size(size: usize) -> Option<u8> {
        if !size.is_power_of_two() || !(Self::MIN_SIZE..=Self::MAX_SIZE).contains(&size) {
            return None;
        }
        Some(size.trailing_zeros() as u8 - 4)
    }

    /// Constructs the block that starts at `offset` for the given size exponent.
    /// Fails if `offset` is not a multiple of the block size.
    pub fn at_offset(offset: usize, szx: u8) -> Option<BlockInfo> {
        let size = 1usize << (szx as usize + 4);
        if offset % size != 0 {
            return None;
        }
        let num = offset / size;
        if num > Self::NUM_MAX as usize {
            return None;
        }
        Self::new(num as u32, false, szx)
    }

    /// Block number value.
    #[inline]
    pub fn num(&self) -> u32 {
        self.0 >> 4
    }

    /// More flag value. If set, there are more blocks to follow.
    #[inline]
    pub fn more_flag(&self) -> bool {
        (self.0 & Self::MORE_FLAG) == Self::MORE_FLAG
    }

    /// Block size exponent field value.
    #[inline]
    pub fn szx(&self) -> u8 {
        self.0 as u8 & 0b111
    }

    /// The offset (in bytes) that this block starts at.
    #[inline]
    pub fn offset(&self) -> usize {
        let val = self.0 as usize;
        (val >> 4) << ((val & 0b0111) + 4)
    }

    /// The length of this block, in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        1 << (self.szx() as usize + 4)
    }

    /// True if the number is out of range or the size exponent is the
    /// reserved value 7.
    pub fn is_invalid(&self) -> bool {
        (self.num() > Self::NUM_MAX) || self.szx() == Self::SZX_RESERVED
    }

    /// `Some(self)` unless [`is_invalid`](BlockInfo::is_invalid).
    pub fn valid(self) -> Option<BlockInfo> {
        if self.is_invalid() {
            None
        } else {
            Some(self)
        }
    }

    /// The same block with M set.
    pub fn with_more_flag(&self) -> BlockInfo {
        BlockInfo(self.0 | Self::MORE_FLAG)
    }

    /// The same block with M cleared.
    pub fn without_more_flag(&self) -> BlockInfo {
        BlockInfo(self.0 & !Self::MORE_FLAG)
    }
}

impl From<u32> for BlockInfo {
    fn from(x: u32) -> Self {
        BlockInfo(x)
    }
}

impl Default for BlockInfo {
    /// Returns a block info with an offset of zero and a block size of 1024.
    fn default() -> Self {
        BlockInfo(6)
    }
}

impl Display for BlockInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "{}/{}/{}",
            self.num(),
            self.more_flag() as u8,
            self.len()
        )?;
        if self.is_invalid() {
            f.write_str("(!)")
        } else {
            Ok(())
        }
    }
}

impl Debug for BlockInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "BlockInfo(0x{:06X}:", self.0)?;
        Display::fmt(self, f)?;
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let block = BlockInfo::default();
        assert_eq!(false, block.more_flag());
        assert_eq!(6, block.szx());
        assert_eq!(0, block.num());
        assert_eq!(1024, block.len());
        assert_eq!(0, block.offset());
        assert_eq!(false, block.is_invalid());
    }

    #[test]
    fn wire_value() {
        let block = BlockInfo::new(3, true, 2).unwrap();
        assert_eq!(0x3A, block.0);
        assert_eq!(64, block.len());
        assert_eq!(192, block.offset());
        assert_eq!(0x32, block.without_more_flag().0);
    }

    #[test]
    fn sizes() {
        assert_eq!(Some(0), BlockInfo::szx_for_size(16));
        assert_eq!(Some(6), BlockInfo::szx_for_size(1024));
        assert_eq!(None, BlockInfo::szx_for_size(2048));
        assert_eq!(None, BlockInfo::szx_for_size(100));
        assert_eq!(Some(BlockInfo(0x20)), BlockInfo::at_offset(32, 0));
        assert_eq!(None, BlockInfo::at_offset(48, 1));
    }

    #[test]
    fn reserved_szx() {
        assert!(BlockInfo(7).is_invalid());
        assert_eq!(None, BlockInfo(7).valid());
        assert_eq!(None, BlockInfo::new(0, false, 7));
    }
}
