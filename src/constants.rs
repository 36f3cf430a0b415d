use bitflags::bitflags;

// Open flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenFlags: u32 {
        /// Memory only, never touches a file. Implies NOLOCK.
        const INTERNAL = 0x02;
        const NOLOCK = 0x04;
        /// Use positional reads/writes instead of a memory map.
        const NOMMAP = 0x08;
        const RDONLY = 0x10;
    }
}

// Lock request flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LockFlags: u32 {
        const WAIT = 0x01;
        /// Failure is expected; don't log it.
        const PROBE = 0x02;
        /// Don't check whether recovery is needed.
        const NOCHECK = 0x04;
    }
}

impl LockFlags {
    pub const NOWAIT: LockFlags = LockFlags::empty();
}

/// Magic string at the start of every file
pub const NTDB_MAGIC_FOOD: &[u8] = b"NTDB file\n";
/// On-disk format version
pub const NTDB_VERSION: u64 = 0x2607_1955;
/// Size reserved for the file header
pub const HEADER_SIZE: u64 = 128;

/// Bits of every 64-bit word taken for tags, table ids and counters
pub const NTDB_OFF_UPPER_STEAL: u32 = 8;
pub const NTDB_OFF_MASK: u64 = (1u64 << (64 - NTDB_OFF_UPPER_STEAL)) - 1;

/// Number of size classes in each free table
pub const NTDB_FREE_BUCKETS: usize = 64 - NTDB_OFF_UPPER_STEAL as usize;
/// Smallest payload a record may have
pub const NTDB_MIN_DATA_LEN: u64 = FREE_RECORD_SIZE - USED_RECORD_SIZE;

pub const USED_RECORD_SIZE: u64 = 16;
pub const FREE_RECORD_SIZE: u64 = 24;

/// Tag in the top byte of a free record
pub const NTDB_FREE_MAGIC: u64 = 0xFE;
/// Table id meaning "being coalesced, not in any list"
pub const NTDB_FTABLE_NONE: u64 = (1 << NTDB_OFF_UPPER_STEAL) - 1;
/// Used record magics (top 16 bits)
pub const NTDB_USED_MAGIC: u16 = 0x1999;
pub const NTDB_HTABLE_MAGIC: u16 = 0x1888;
pub const NTDB_FTABLE_MAGIC: u16 = 0x1777;

/// Free table body: next table offset, then the bucket heads
pub const FTABLE_NEXT_OFFSET: u64 = USED_RECORD_SIZE;
pub const FTABLE_BUCKETS_OFFSET: u64 = FTABLE_NEXT_OFFSET + 8;
pub const FTABLE_DATA_LEN: u64 = 8 + 8 * NTDB_FREE_BUCKETS as u64;

pub const DEFAULT_HASH_BITS: u32 = 10;
pub const MAX_HASH_BITS: u32 = 24;
pub const DEFAULT_FREE_TABLES: usize = 1;
pub const MAX_FREE_TABLES: usize = NTDB_FTABLE_NONE as usize - 1;

// Lock offsets
pub const NTDB_OPEN_LOCK: u64 = 0;
pub const NTDB_EXPANSION_LOCK: u64 = 1;
pub const NTDB_TRANSACTION_LOCK: u64 = 2;
pub const NTDB_HASH_LOCK_START: u64 = 64;
pub const NTDB_HASH_LOCK_RANGE_BITS: u32 = 30;
pub const NTDB_HASH_LOCK_RANGE: u64 = 1 << NTDB_HASH_LOCK_RANGE_BITS;
pub const NTDB_FREE_LOCK_START: u64 = NTDB_HASH_LOCK_START + NTDB_HASH_LOCK_RANGE;

/// Attempts made to upgrade the all-record lock
pub const UPGRADE_ATTEMPTS: u32 = 1000;

/// Files always grow by a multiple of this
pub const NTDB_PGSIZE: u64 = 16384;

/// Forward merges tried per record before giving up
pub const COALESCE_MERGE_STEPS: u32 = 8;
pub const COALESCE_MERGE_STEPS_MAX: u32 = 32;
/// Entries examined by a housekeeping pass over a bucket
pub const COALESCE_HOUSEKEEPING_LIMIT: usize = 16;
