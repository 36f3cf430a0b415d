use crate::constants::{
    FTABLE_DATA_LEN, FTABLE_NEXT_OFFSET, HEADER_SIZE, MAX_FREE_TABLES, MAX_HASH_BITS, NTDB_FTABLE_MAGIC,
    NTDB_HTABLE_MAGIC, NTDB_MAGIC_FOOD, NTDB_VERSION, USED_RECORD_SIZE,
};
use crate::error::{Error, Result};
use crate::io::Backing;
use crate::record::UsedRecord;
use crate::types::Offset;

const MAGIC_LEN: usize = 32;
const VERSION_FIELD: usize = 32;
const HASH_SEED_FIELD: usize = 40;
const FREE_TABLE_FIELD: usize = 48;
/// Offset of the recovery area pointer within the header
pub(crate) const RECOVERY_FIELD: u64 = 56;
const HASH_TABLE_FIELD: usize = 64;
const HASH_BITS_FIELD: usize = 72;

/// File header matching ntdb_header
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Header {
    /// Format version
    pub(crate) version: u64,
    /// Seed for the (external) hash function
    pub(crate) hash_seed: u64,
    /// First free table in the chain
    pub(crate) free_table: Offset,
    /// Recovery area, zero when there is none
    pub(crate) recovery: Offset,
    /// Top-level hash table record
    pub(crate) hash_table: Offset,
    /// log2 of the number of hash buckets
    pub(crate) hash_bits: u32,
}

impl Header {
    pub(crate) fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[..NTDB_MAGIC_FOOD.len()].copy_from_slice(NTDB_MAGIC_FOOD);
        put(&mut buf, VERSION_FIELD, self.version);
        put(&mut buf, HASH_SEED_FIELD, self.hash_seed);
        put(&mut buf, FREE_TABLE_FIELD, self.free_table.get());
        put(&mut buf, RECOVERY_FIELD as usize, self.recovery.get());
        put(&mut buf, HASH_TABLE_FIELD, self.hash_table.get());
        put(&mut buf, HASH_BITS_FIELD, self.hash_bits as u64);
        buf
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE as usize {
            return Err(Error::corrupt("file too small for header"));
        }
        let magic = &buf[..MAGIC_LEN];
        if &magic[..NTDB_MAGIC_FOOD.len()] != NTDB_MAGIC_FOOD
            || magic[NTDB_MAGIC_FOOD.len()..].iter().any(|&b| b != 0)
        {
            return Err(Error::Invalid("not an ntdb file".into()));
        }
        let version = get(buf, VERSION_FIELD);
        if version != NTDB_VERSION {
            return Err(Error::Invalid(format!("unknown version 0x{:x}", version)));
        }
        let hash_bits = get(buf, HASH_BITS_FIELD);
        if hash_bits == 0 || hash_bits > MAX_HASH_BITS as u64 {
            return Err(Error::corrupt(format!("bad hash bits {}", hash_bits)));
        }
        Ok(Header {
            version,
            hash_seed: get(buf, HASH_SEED_FIELD),
            free_table: Offset::new(get(buf, FREE_TABLE_FIELD)),
            recovery: Offset::new(get(buf, RECOVERY_FIELD as usize)),
            hash_table: Offset::new(get(buf, HASH_TABLE_FIELD)),
            hash_bits: hash_bits as u32,
        })
    }

    pub(crate) fn read(io: &mut Backing) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE as usize];
        io.read(0, &mut buf)?;
        Self::decode(&buf)
    }
}

/// Lay out a fresh database image: header, hash table, then the free tables.
///
/// The image ends exactly after the last free table; the first allocation
/// grows the file.
pub(crate) fn new_database(hash_bits: u32, free_tables: usize, hash_seed: u64) -> Result<(Header, Vec<u8>)> {
    if hash_bits == 0 || hash_bits > MAX_HASH_BITS {
        return Err(Error::Invalid(format!("hash bits {} out of range", hash_bits)));
    }
    if free_tables == 0 || free_tables > MAX_FREE_TABLES {
        return Err(Error::Invalid(format!("{} free tables out of range", free_tables)));
    }

    let htable_len = 8u64 << hash_bits;
    let ftable_total = USED_RECORD_SIZE + FTABLE_DATA_LEN;
    let hash_table = HEADER_SIZE;
    let first_ftable = hash_table + USED_RECORD_SIZE + htable_len;
    let total = first_ftable + ftable_total * free_tables as u64;

    let mut image = vec![0u8; total as usize];
    let htable = UsedRecord::new(NTDB_HTABLE_MAGIC, 0, htable_len, htable_len)?;
    put_slice(&mut image, hash_table, &htable.encode()?);

    let ftable = UsedRecord::new(NTDB_FTABLE_MAGIC, 0, FTABLE_DATA_LEN, FTABLE_DATA_LEN)?.encode()?;
    for i in 0..free_tables as u64 {
        let off = first_ftable + i * ftable_total;
        put_slice(&mut image, off, &ftable);
        let next = if i + 1 < free_tables as u64 { off + ftable_total } else { 0 };
        put(&mut image, (off + FTABLE_NEXT_OFFSET) as usize, next);
    }

    let header = Header {
        version: NTDB_VERSION,
        hash_seed,
        free_table: Offset::new(first_ftable),
        recovery: Offset::NONE,
        hash_table: Offset::new(hash_table),
        hash_bits,
    };
    image[..HEADER_SIZE as usize].copy_from_slice(&header.encode());
    Ok((header, image))
}

/// Offsets of every free table, in chain order.
pub(crate) fn free_table_chain(io: &mut Backing, header: &Header) -> Result<Vec<Offset>> {
    let mut tables = Vec::new();
    let mut off = header.free_table;
    while !off.is_none() {
        if tables.len() >= MAX_FREE_TABLES {
            return Err(Error::corrupt("free table chain too long"));
        }
        let mut buf = [0u8; UsedRecord::SIZE];
        io.read(off.get(), &mut buf)?;
        let rec = UsedRecord::decode(&buf)?;
        if rec.magic != NTDB_FTABLE_MAGIC || rec.data_len != FTABLE_DATA_LEN {
            return Err(Error::corrupt(format!("free table at {} has bad header", off)));
        }
        tables.push(off);
        let mut next = [0u8; 8];
        io.read(off.get() + FTABLE_NEXT_OFFSET, &mut next)?;
        off = Offset::new(u64::from_le_bytes(next));
    }
    if tables.is_empty() {
        return Err(Error::corrupt("no free tables"));
    }
    Ok(tables)
}

fn put(buf: &mut [u8], at: usize, val: u64) {
    buf[at..at + 8].copy_from_slice(&val.to_le_bytes());
}

fn put_slice(buf: &mut [u8], at: u64, data: &[u8]) {
    buf[at as usize..at as usize + data.len()].copy_from_slice(data);
}

fn get(buf: &[u8], at: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_image_chains_free_tables() {
        let (header, image) = new_database(4, 3, 42).unwrap();
        let mut io = Backing::Memory(image);
        assert_eq!(Header::read(&mut io).unwrap(), header);

        let tables = free_table_chain(&mut io, &header).unwrap();
        assert_eq!(tables.len(), 3);
        assert_eq!(tables[0], header.free_table);
        let stride = USED_RECORD_SIZE + FTABLE_DATA_LEN;
        assert_eq!(tables[2].get(), tables[0].get() + 2 * stride);
        assert_eq!(io.size(), tables[2].get() + stride);
    }

    #[test]
    fn rejects_foreign_file() {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[..4].copy_from_slice(b"TDB ");
        assert!(matches!(Header::decode(&buf), Err(Error::Invalid(_))));
    }

    #[test]
    fn rejects_bad_table_counts() {
        assert!(new_database(10, 0, 0).is_err());
        assert!(new_database(10, MAX_FREE_TABLES + 1, 0).is_err());
        assert!(new_database(0, 1, 0).is_err());
    }
}
