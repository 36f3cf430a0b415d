// src/lib.rs
//! Free-space allocator and lock manager for the ntdb file format.
//!
//! Space in the file is handed out by [`Ntdb::allocate`] and returned with
//! [`Ntdb::free`]. Every structure lives in the file and is shared by all
//! processes that open it, guarded by fcntl byte-range locks.

mod check;
mod constants;
mod env;
mod error;
mod expand;
mod free;
mod header;
mod io;
mod lock;
mod record;
mod recovery;
mod stats;
mod types;

pub use check::CheckReport;
pub use constants::{
    LockFlags, OpenFlags, FREE_RECORD_SIZE, HEADER_SIZE, NTDB_FREE_BUCKETS, NTDB_MIN_DATA_LEN,
    NTDB_PGSIZE, USED_RECORD_SIZE,
};
pub use env::{Config, Ntdb};
pub use error::{Error, Result};
pub use expand::expand_adjust;
pub use lock::{AllRecordGuard, LockGuard};
pub use record::{adjust_size, size_to_bucket, FreeRecord, Record, UsedRecord};
pub use recovery::{HeaderRecovery, RecoveryLog, NTDB_RECOVERY_MAGIC};
pub use stats::Stats;
pub use types::{LockType, Offset, Region};
