//! Presence vectors over chunk indices.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A bit per chunk of a blob.
///
/// Bits are packed most significant bit first. Bits past [`Bitfield::len`] exist only as
/// padding of the last byte and are always zero, so two bitfields of the same length compare
/// equal exactly when they mark the same chunks.
///
/// All operations are total over valid indices. Indexing past the end or combining
/// bitfields of different lengths is a bug in the caller and panics.
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Bitfield {
    len: u32,
    bytes: Vec<u8>,
}

impl Bitfield {
    /// An all-zero bitfield of `len` bits.
    pub fn new(len: u32) -> Self {
        Self {
            len,
            bytes: vec![0u8; byte_len(len)],
        }
    }

    /// An all-one bitfield of `len` bits.
    pub fn full(len: u32) -> Self {
        Self::new(len).invert()
    }

    /// Reconstructs a bitfield from its packed bytes.
    ///
    /// Returns `None` if `bytes` does not have the packed size of `len` bits. Padding bits
    /// are cleared.
    pub fn from_bytes(len: u32, bytes: impl Into<Vec<u8>>) -> Option<Self> {
        let bytes = bytes.into();
        if bytes.len() != byte_len(len) {
            return None;
        }
        let mut this = Self { len, bytes };
        this.clear_padding();
        Some(this)
    }

    /// Number of bits.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Whether this bitfield has no bits at all.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The packed bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consumes the bitfield, returning the packed bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Returns the bit at `index`.
    pub fn get(&self, index: u32) -> bool {
        self.check_index(index);
        let (byte, mask) = position(index);
        self.bytes[byte] & mask != 0
    }

    /// Sets the bit at `index` to `value`.
    pub fn set(&mut self, index: u32, value: bool) {
        self.check_index(index);
        let (byte, mask) = position(index);
        if value {
            self.bytes[byte] |= mask;
        } else {
            self.bytes[byte] &= !mask;
        }
    }

    /// Bitwise AND of two bitfields of equal length.
    pub fn and(&self, other: &Bitfield) -> Bitfield {
        assert_eq!(
            self.len, other.len,
            "bitfield length mismatch: {} vs {}",
            self.len, other.len
        );
        let bytes = self
            .bytes
            .iter()
            .zip(other.bytes.iter())
            .map(|(a, b)| a & b)
            .collect();
        Bitfield {
            len: self.len,
            bytes,
        }
    }

    /// The complement of this bitfield.
    pub fn invert(&self) -> Bitfield {
        let mut out = Bitfield {
            len: self.len,
            bytes: self.bytes.iter().map(|b| !b).collect(),
        };
        out.clear_padding();
        out
    }

    /// Number of set bits in `[from, to)`.
    pub fn count(&self, from: u32, to: u32) -> u32 {
        assert!(
            from <= to && to <= self.len,
            "range {from}..{to} out of bounds for bitfield of length {}",
            self.len
        );
        if from == to {
            return 0;
        }
        let first = (from / 8) as usize;
        let last = ((to - 1) / 8) as usize;
        let mut total = 0;
        for (i, byte) in self.bytes[first..=last].iter().enumerate() {
            let i = first + i;
            let mut byte = *byte;
            if i == first {
                byte &= 0xff >> (from % 8);
            }
            if i == last {
                let keep = (to - 1) % 8 + 1;
                byte &= 0xffu8 << (8 - keep);
            }
            total += byte.count_ones();
        }
        total
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> u32 {
        self.bytes.iter().map(|b| b.count_ones()).sum()
    }

    /// Whether every bit is set.
    pub fn is_full(&self) -> bool {
        self.count_ones() == self.len
    }

    /// Indices of the set bits, ascending.
    pub fn find_indexes(&self) -> Vec<u32> {
        let mut out = Vec::new();
        for (i, byte) in self.bytes.iter().enumerate() {
            let mut byte = *byte;
            while byte != 0 {
                let bit = byte.leading_zeros();
                out.push(i as u32 * 8 + bit);
                byte &= !(0x80 >> bit);
            }
        }
        out
    }

    fn check_index(&self, index: u32) {
        assert!(
            index < self.len,
            "index {index} out of bounds for bitfield of length {}",
            self.len
        );
    }

    fn clear_padding(&mut self) {
        let rem = self.len % 8;
        if rem != 0 {
            if let Some(last) = self.bytes.last_mut() {
                *last &= 0xffu8 << (8 - rem);
            }
        }
    }
}

impl fmt::Debug for Bitfield {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bitfield({}/{} ", self.count_ones(), self.len)?;
        for i in 0..self.len.min(64) {
            f.write_str(if self.get(i) { "1" } else { "0" })?;
        }
        if self.len > 64 {
            f.write_str("..")?;
        }
        f.write_str(")")
    }
}

fn byte_len(bits: u32) -> usize {
    bits.div_ceil(8) as usize
}

fn position(index: u32) -> (usize, u8) {
    ((index / 8) as usize, 0x80 >> (index % 8))
}
