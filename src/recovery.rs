//! Hand-off to transaction recovery.
//!
//! Replaying a transaction log is not this crate's job. The lock manager
//! only needs to ask whether a previous writer died mid-commit and, if so,
//! call the replay with the whole database locked.

use log::warn;

use crate::env::Ntdb;
use crate::error::Result;
use crate::header::RECOVERY_FIELD;
use crate::types::Offset;

/// Marks a valid recovery area.
pub const NTDB_RECOVERY_MAGIC: u64 = 0xf53b_c0e7_ad12_4589;

pub trait RecoveryLog: Send + Sync {
    /// Whether a dead writer left work to replay.
    fn needs_recovery(&self, db: &Ntdb) -> Result<bool>;

    /// Replay it. Called with the all-record and open locks held for writing.
    fn recover(&self, db: &Ntdb) -> Result<()>;
}

/// Reads the recovery pointer from the file header.
///
/// A recovery area is live when the header points at it and it starts with
/// [`NTDB_RECOVERY_MAGIC`]. Recovery here only retires the area.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeaderRecovery;

impl HeaderRecovery {
    fn area(db: &Ntdb) -> Result<Offset> {
        Ok(Offset::new(db.read_u64(Offset::new(RECOVERY_FIELD))?))
    }
}

impl RecoveryLog for HeaderRecovery {
    fn needs_recovery(&self, db: &Ntdb) -> Result<bool> {
        let area = Self::area(db)?;
        if area.is_none() {
            return Ok(false);
        }
        Ok(db.read_u64(area)? == NTDB_RECOVERY_MAGIC)
    }

    fn recover(&self, db: &Ntdb) -> Result<()> {
        let area = Self::area(db)?;
        warn!("retiring recovery area at {}", area);
        if !area.is_none() {
            db.write_u64(area, 0)?;
        }
        db.write_u64(Offset::new(RECOVERY_FIELD), 0)
    }
}
