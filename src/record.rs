//! On-disk record headers and the size-class function.
//!
//! Every record starts with a 64-bit word whose top bits say what it is.
//! A free record steals the top byte for [`NTDB_FREE_MAGIC`]; a used record
//! puts a 16-bit magic there instead, so the two never collide.
//!
//! ```text
//! free record (24 bytes)
//!   word 0: magic(8)  | prev(56)
//!   word 1: ftable(8) | len(56)
//!   word 2: next
//!
//! used record (16 bytes)
//!   word 0: magic(16) | key bits(5) | padding(32) | hash(11)
//!   word 1: data len << (2 * key bits) | key len
//! ```

use crate::constants::{
    FREE_RECORD_SIZE, NTDB_FREE_BUCKETS, NTDB_FREE_MAGIC, NTDB_FTABLE_MAGIC, NTDB_HTABLE_MAGIC,
    NTDB_MIN_DATA_LEN, NTDB_OFF_MASK, NTDB_OFF_UPPER_STEAL, NTDB_USED_MAGIC, USED_RECORD_SIZE,
};
use crate::error::{Error, Result};
use crate::types::Offset;

const UPPER_SHIFT: u32 = 64 - NTDB_OFF_UPPER_STEAL;

/// Index of the highest set bit, counting from one. Zero for zero.
#[inline]
pub(crate) fn fls64(val: u64) -> u32 {
    64 - val.leading_zeros()
}

/// Map a payload length to its size class.
///
/// Lengths below the minimum are treated as the minimum. The first nine
/// buckets step by eight bytes, after that each bucket doubles.
pub fn size_to_bucket(data_len: u64) -> usize {
    let len = data_len.max(NTDB_MIN_DATA_LEN) - NTDB_MIN_DATA_LEN;
    let bucket = if len <= 64 {
        (len / 8) as usize
    } else {
        fls64(len) as usize + 2
    };
    bucket.min(NTDB_FREE_BUCKETS - 1)
}

/// Payload size actually reserved for a key and data of these lengths.
pub fn adjust_size(key_len: u64, data_len: u64) -> u64 {
    let size = (key_len + data_len).max(NTDB_MIN_DATA_LEN);
    (size + 7) & !7
}

/// Header of a record on a free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRecord {
    /// Previous record in the bucket; for the head this is the tail.
    pub prev: Offset,
    /// Owning free table, or `NTDB_FTABLE_NONE` while being coalesced.
    pub ftable: u8,
    /// Payload length, not counting the used-record sized header.
    pub len: u64,
    pub next: Offset,
}

impl FreeRecord {
    pub const SIZE: usize = FREE_RECORD_SIZE as usize;

    pub fn is_free_word(word0: u64) -> bool {
        word0 >> UPPER_SHIFT == NTDB_FREE_MAGIC
    }

    pub fn encode(&self) -> Result<[u8; Self::SIZE]> {
        let words = [
            (NTDB_FREE_MAGIC << UPPER_SHIFT) | self.prev.get(),
            ((self.ftable as u64) << UPPER_SHIFT) | self.len,
            self.next.get(),
        ];
        let mut buf = [0u8; Self::SIZE];
        for (chunk, word) in buf.chunks_exact_mut(8).zip(words.iter()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        // Oversized fields would bleed into the tag bits.
        if Self::decode(&buf).ok().as_ref() != Some(self) || self.next.get() > NTDB_OFF_MASK {
            return Err(Error::corrupt(format!(
                "cannot encode free record prev={} ftable={} len={} next={}",
                self.prev, self.ftable, self.len, self.next
            )));
        }
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::corrupt("short free record"));
        }
        let word0 = read_word(buf, 0);
        let word1 = read_word(buf, 1);
        if !Self::is_free_word(word0) {
            return Err(Error::corrupt(format!("bad free magic 0x{:x}", word0 >> UPPER_SHIFT)));
        }
        Ok(FreeRecord {
            prev: Offset::new(word0 & NTDB_OFF_MASK),
            ftable: (word1 >> UPPER_SHIFT) as u8,
            len: word1 & NTDB_OFF_MASK,
            next: Offset::new(read_word(buf, 2)),
        })
    }

    /// Length of the whole record including its header.
    pub fn total_len(&self) -> u64 {
        USED_RECORD_SIZE + self.len
    }
}

/// Header of an allocated record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsedRecord {
    pub magic: u16,
    pub key_len: u64,
    pub data_len: u64,
    pub padding: u64,
    /// Low hash bits kept by the hash layer; zero from the allocator.
    pub hash: u16,
}

impl UsedRecord {
    pub const SIZE: usize = USED_RECORD_SIZE as usize;

    /// Header for a record spanning `actual_len` payload bytes.
    pub fn new(magic: u16, key_len: u64, data_len: u64, actual_len: u64) -> Result<Self> {
        let padding = actual_len
            .checked_sub(key_len + data_len)
            .ok_or_else(|| Error::Invalid(format!("record length {} too small", actual_len)))?;
        let rec = UsedRecord {
            magic,
            key_len,
            data_len,
            padding,
            hash: 0,
        };
        rec.encode()?;
        Ok(rec)
    }

    pub fn is_used_magic(magic: u16) -> bool {
        matches!(magic, NTDB_USED_MAGIC | NTDB_HTABLE_MAGIC | NTDB_FTABLE_MAGIC)
    }

    pub fn encode(&self) -> Result<[u8; Self::SIZE]> {
        let key_bits = ((fls64(self.key_len) + 1) / 2) as u64;
        let word0 = ((self.magic as u64) << 48)
            | (key_bits << 43)
            | (self.padding << 11)
            | (self.hash as u64 & 0x7FF);
        let word1 = self.key_len | self.data_len.checked_shl(key_bits as u32 * 2).unwrap_or(0);

        let mut buf = [0u8; Self::SIZE];
        buf[..8].copy_from_slice(&word0.to_le_bytes());
        buf[8..].copy_from_slice(&word1.to_le_bytes());

        match Self::decode(&buf) {
            Ok(back) if back == *self => Ok(buf),
            _ => Err(Error::corrupt(format!(
                "cannot encode used record k={} d={} pad={}",
                self.key_len, self.data_len, self.padding
            ))),
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::corrupt("short used record"));
        }
        let word0 = read_word(buf, 0);
        let word1 = read_word(buf, 1);
        let magic = (word0 >> 48) as u16;
        if !Self::is_used_magic(magic) {
            return Err(Error::corrupt(format!("bad used magic 0x{:x}", magic)));
        }
        let key_bits = ((word0 >> 43) & 0x1F) as u32;
        let key_mask = match key_bits * 2 {
            0 => 0,
            n if n >= 64 => u64::MAX,
            n => (1u64 << n) - 1,
        };
        Ok(UsedRecord {
            magic,
            key_len: word1 & key_mask,
            data_len: word1.checked_shr(key_bits * 2).unwrap_or(0),
            padding: (word0 >> 11) & 0xFFFF_FFFF,
            hash: (word0 & 0x7FF) as u16,
        })
    }

    /// Length of the whole record including its header.
    pub fn total_len(&self) -> u64 {
        USED_RECORD_SIZE + self.key_len + self.data_len + self.padding
    }
}

/// Any record found at a record boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record {
    Free(FreeRecord),
    Used(UsedRecord),
}

impl Record {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 {
            return Err(Error::corrupt("short record"));
        }
        if FreeRecord::is_free_word(read_word(buf, 0)) {
            FreeRecord::decode(buf).map(Record::Free)
        } else {
            UsedRecord::decode(buf).map(Record::Used)
        }
    }

    pub fn total_len(&self) -> u64 {
        match self {
            Record::Free(rec) => rec.total_len(),
            Record::Used(rec) => rec.total_len(),
        }
    }

    pub fn is_free(&self) -> bool {
        matches!(self, Record::Free(_))
    }
}

#[inline]
fn read_word(buf: &[u8], idx: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&buf[idx * 8..idx * 8 + 8]);
    u64::from_le_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::NTDB_FTABLE_NONE;

    #[test]
    fn small_sizes_step_by_eight() {
        assert_eq!(size_to_bucket(0), 0);
        assert_eq!(size_to_bucket(8), 0);
        assert_eq!(size_to_bucket(16), 1);
        assert_eq!(size_to_bucket(72), 8);
        assert_eq!(size_to_bucket(80), 9);
        assert_eq!(size_to_bucket(128), 9);
        assert_eq!(size_to_bucket(136), 10);
    }

    #[test]
    fn bucket_is_monotonic_and_capped() {
        let mut last = 0;
        for len in (8..1 << 20).step_by(8) {
            let b = size_to_bucket(len);
            assert!(b >= last, "bucket dropped at {}", len);
            last = b;
        }
        assert_eq!(size_to_bucket(u64::MAX >> 8), NTDB_FREE_BUCKETS - 1);
    }

    #[test]
    fn adjust_size_rounds_to_words() {
        assert_eq!(adjust_size(0, 0), NTDB_MIN_DATA_LEN);
        assert_eq!(adjust_size(3, 4), 8);
        assert_eq!(adjust_size(0, 100), 104);
        assert_eq!(adjust_size(10, 14), 24);
    }

    #[test]
    fn free_record_round_trips() {
        let rec = FreeRecord {
            prev: Offset::new(4096),
            ftable: 3,
            len: 1000,
            next: Offset::new(8192),
        };
        let buf = rec.encode().unwrap();
        assert_eq!(FreeRecord::decode(&buf).unwrap(), rec);
        assert!(Record::decode(&buf).unwrap().is_free());
    }

    #[test]
    fn free_record_rejects_oversized_fields() {
        let rec = FreeRecord {
            prev: Offset::new(1),
            ftable: NTDB_FTABLE_NONE as u8,
            len: NTDB_OFF_MASK + 1,
            next: Offset::NONE,
        };
        assert!(rec.encode().unwrap_err().is_corrupt());

        let rec = FreeRecord {
            prev: Offset::new(NTDB_OFF_MASK + 8),
            ftable: 0,
            len: 8,
            next: Offset::NONE,
        };
        assert!(rec.encode().is_err());
    }

    #[test]
    fn used_record_round_trips() {
        let rec = UsedRecord::new(NTDB_USED_MAGIC, 300, 70_000, 70_400).unwrap();
        assert_eq!(rec.padding, 100);
        let buf = rec.encode().unwrap();
        let back = UsedRecord::decode(&buf).unwrap();
        assert_eq!(back, rec);
        assert_eq!(back.total_len(), USED_RECORD_SIZE + 70_400);
        assert!(!Record::decode(&buf).unwrap().is_free());
    }

    #[test]
    fn used_record_rejects_padding_overflow() {
        let err = UsedRecord::new(NTDB_USED_MAGIC, 0, 8, 8 + (1 << 33)).unwrap_err();
        assert!(err.is_corrupt());
    }

    #[test]
    fn used_record_rejects_data_overflow() {
        // Key needs 40 bits, leaving too few for this much data.
        assert!(UsedRecord::new(NTDB_USED_MAGIC, 1 << 39, 1 << 30, (1 << 39) + (1 << 30)).is_err());
    }

    #[test]
    fn free_and_used_magic_never_collide() {
        let used = UsedRecord::new(NTDB_FTABLE_MAGIC, 0, 8, 8).unwrap().encode().unwrap();
        assert!(!FreeRecord::is_free_word(read_word(&used, 0)));
        assert!(FreeRecord::decode(&used).is_err());
    }
}
