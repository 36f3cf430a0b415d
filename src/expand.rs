use log::debug;

use crate::constants::{LockFlags, NTDB_PGSIZE, USED_RECORD_SIZE};
use crate::env::Ntdb;
use crate::error::Result;
use crate::record::adjust_size;
use crate::stats::Counters;
use crate::types::{LockType, Offset, Region};

const SMALL_RECORD: u64 = 100 * 1024;
const LARGE_FILE: u64 = 100 * 1024 * 1024;

/// Bytes to add to a file of `map_size` bytes that needs a `size` byte record.
///
/// Always room for many more records like this one and a proportional
/// share of the current size, ending on a page boundary.
pub fn expand_adjust(map_size: u64, size: u64) -> u64 {
    let top_size = if size > SMALL_RECORD {
        map_size + size * 2
    } else {
        map_size + size * 100
    };
    let grown = if map_size > LARGE_FILE {
        map_size + map_size / 10
    } else {
        map_size + map_size / 4
    };
    let new_size = grown.max(top_size);
    let new_size = (new_size + NTDB_PGSIZE - 1) & !(NTDB_PGSIZE - 1);
    new_size - map_size
}

impl Ntdb {
    /// Grow the file so that at least `size` more payload bytes are free.
    ///
    /// Does nothing if another handle grew it while we waited for the lock.
    pub fn expand(&self, size: u64) -> Result<()> {
        let (old_size, wanted) = {
            let _lock = self.lock_region_guard(Region::Expansion, LockType::Write, LockFlags::WAIT)?;
            let before = self.map_size();
            if self.io().refresh()? {
                debug!("file grew from {} to {} elsewhere", before, self.map_size());
                return Ok(());
            }
            let size = adjust_size(0, USED_RECORD_SIZE + size);
            let wanted = expand_adjust(before, size);
            self.grow_backing_file(before + wanted)?;
            Counters::bump(&self.stats.expands);
            debug!("expanded file from {} by {}", before, wanted);
            (before, wanted)
        };
        // The expansion lock must be dropped before touching free buckets.
        self.add_free_record(Offset::new(old_size), wanted, LockFlags::WAIT, true)
    }
}
