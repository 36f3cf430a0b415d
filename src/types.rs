use std::fmt;
use std::ops::Add;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::constants::{
    NTDB_EXPANSION_LOCK, NTDB_FREE_LOCK_START, NTDB_HASH_LOCK_RANGE_BITS, NTDB_HASH_LOCK_START,
    NTDB_OPEN_LOCK, NTDB_TRANSACTION_LOCK,
};

/// Byte offset into the database file.
///
/// Offset zero is the header, so it doubles as "no record".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Offset(u64);

impl Offset {
    pub const NONE: Offset = Offset(0);

    pub const fn new(off: u64) -> Self {
        Offset(off)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl Add<u64> for Offset {
    type Output = Offset;

    fn add(self, rhs: u64) -> Offset {
        Offset(self.0 + rhs)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    Read,
    Write,
}

impl LockType {
    pub(crate) fn fcntl_type(self) -> libc::c_short {
        match self {
            LockType::Read => libc::F_RDLCK as libc::c_short,
            LockType::Write => libc::F_WRLCK as libc::c_short,
        }
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LockType::Read => write!(f, "read"),
            LockType::Write => write!(f, "write"),
        }
    }
}

/// A lockable region of the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    /// Held while opening or creating the file
    Open,
    /// Held while growing the file
    Expansion,
    /// Held by a writing transaction
    Transaction,
    /// Hash chain selected by the top bits of a hash value
    Hash(u64),
    /// A free-list bucket, named by the offset of its head word
    FreeBucket(Offset),
}

impl Region {
    /// The byte the OS lock is taken on.
    pub fn lock_offset(&self) -> u64 {
        match *self {
            Region::Open => NTDB_OPEN_LOCK,
            Region::Expansion => NTDB_EXPANSION_LOCK,
            Region::Transaction => NTDB_TRANSACTION_LOCK,
            Region::Hash(hash) => NTDB_HASH_LOCK_START + (hash >> (64 - NTDB_HASH_LOCK_RANGE_BITS)),
            Region::FreeBucket(b_off) => NTDB_FREE_LOCK_START + b_off.get() / 8,
        }
    }
}

/// Identity of one open handle within this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(u64);

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

impl HandleId {
    pub(crate) fn next() -> Self {
        HandleId(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }
}
