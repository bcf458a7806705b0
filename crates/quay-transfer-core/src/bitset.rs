//! Record of which chunks have been verified and stored.
//!
//! Bits are stored most-significant-bit first within each byte, matching the
//! layout the storage engine exchanges on the wire. The mapper only ever reads
//! point-in-time copies of this structure.

use std::ops::RangeInclusive;

use crate::error::{TransferError, TransferResult};

/// Boolean-per-chunk record of verified data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkBitSet {
    bits: Vec<u8>,
    len: u32,
}

impl ChunkBitSet {
    /// Create a bitset of `len` chunks with every bit cleared.
    #[must_use]
    pub fn new(len: u32) -> Self {
        Self {
            bits: vec![0; byte_len(len)],
            len,
        }
    }

    /// Create a bitset of `len` chunks with every bit set.
    #[must_use]
    pub fn with_all_set(len: u32) -> Self {
        let mut set = Self::new(len);
        for index in 0..len {
            set.set(index, true);
        }
        set
    }

    /// Wrap raw bytes holding `len` chunk bits.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::BitSetTooShort`] when `bytes` cannot hold `len` bits.
    pub fn from_bytes(bytes: Vec<u8>, len: u32) -> TransferResult<Self> {
        let expected_bytes = byte_len(len);
        if bytes.len() < expected_bytes {
            return Err(TransferError::BitSetTooShort {
                expected_bytes,
                actual_bytes: bytes.len(),
            });
        }
        Ok(Self { bits: bytes, len })
    }

    /// Number of chunks covered.
    #[must_use]
    pub const fn len(&self) -> u32 {
        self.len
    }

    /// Whether the bitset covers no chunks at all.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mark a chunk present or missing. Returns `false` when `index` is out of range.
    pub fn set(&mut self, index: u32, value: bool) -> bool {
        if index >= self.len {
            return false;
        }
        let (byte, mask) = locate(index);
        if value {
            self.bits[byte] |= mask;
        } else {
            self.bits[byte] &= !mask;
        }
        true
    }

    /// Whether a chunk is present. Indices past the end read as missing.
    #[must_use]
    pub fn get(&self, index: u32) -> bool {
        if index >= self.len {
            return false;
        }
        let (byte, mask) = locate(index);
        self.bits[byte] & mask != 0
    }

    /// Count present chunks within an inclusive range.
    #[must_use]
    pub fn count_in(&self, range: RangeInclusive<u32>) -> u32 {
        let count = range.filter(|index| self.get(*index)).count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    /// Count every present chunk.
    #[must_use]
    pub fn count_ones(&self) -> u32 {
        if self.len == 0 {
            return 0;
        }
        self.count_in(0..=self.len - 1)
    }

    /// Whether every chunk is present.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.count_ones() == self.len
    }

    /// Raw bytes, most-significant-bit first.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}

fn byte_len(len: u32) -> usize {
    (len as usize).div_ceil(8)
}

fn locate(index: u32) -> (usize, u8) {
    let index = index as usize;
    (index / 8, 1 << (7 - (index % 8)))
}
