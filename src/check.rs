//! Consistency checking and free-list introspection.

use log::{debug, error};
use std::collections::HashMap;

use crate::constants::{LockFlags, HEADER_SIZE, NTDB_FREE_BUCKETS, USED_RECORD_SIZE};
use crate::env::Ntdb;
use crate::error::{Error, Result};
use crate::record::{size_to_bucket, Record};
use crate::types::{LockType, Offset};

/// What [`Ntdb::check`] found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub used_records: u64,
    pub used_bytes: u64,
    pub free_records: u64,
    pub free_bytes: u64,
    /// Free records immediately followed by another free record
    pub adjacent_free: u64,
}

impl Ntdb {
    /// Walk one bucket list, checking its links. Returns entries in order.
    fn walk_bucket(&self, table: usize, bucket: usize) -> Result<Vec<Offset>> {
        let b_off = self.bucket_off(table, bucket)?;
        let head = self.first_in_free(b_off)?;
        let limit = self.map_size() / USED_RECORD_SIZE;
        let mut entries = Vec::new();
        let mut prev = Offset::NONE;
        let mut off = head;
        while !off.is_none() {
            if entries.len() as u64 > limit {
                return Err(Error::corrupt(format!("table {} bucket {} loops", table, bucket)));
            }
            let rec = self.read_free(off)?;
            if rec.ftable as usize != table {
                return Err(Error::corrupt(format!(
                    "free record {} in table {} claims table {}",
                    off, table, rec.ftable
                )));
            }
            if size_to_bucket(rec.len) != bucket {
                return Err(Error::corrupt(format!(
                    "free record {} len {} in bucket {}",
                    off, rec.len, bucket
                )));
            }
            if !prev.is_none() && rec.prev != prev {
                return Err(Error::corrupt(format!("free record {} prev {} not {}", off, rec.prev, prev)));
            }
            entries.push(off);
            prev = off;
            off = rec.next;
        }
        if !head.is_none() && self.read_free(head)?.prev != prev {
            return Err(Error::corrupt(format!("bucket {} head {} does not point at tail {}", b_off, head, prev)));
        }
        Ok(entries)
    }

    /// Where every listed free record lives, as (table, bucket).
    fn listed_free(&self) -> Result<HashMap<Offset, (usize, usize)>> {
        let mut listed = HashMap::new();
        for table in 0..self.ftables.len() {
            for bucket in 0..NTDB_FREE_BUCKETS {
                for off in self.walk_bucket(table, bucket)? {
                    if listed.insert(off, (table, bucket)).is_some() {
                        return Err(Error::corrupt(format!("free record {} is on two lists", off)));
                    }
                }
            }
        }
        Ok(listed)
    }

    /// Verify the free lists and that records tile the file.
    ///
    /// Takes a read lock on all records, so the handle must hold no record
    /// locks of its own.
    pub fn check(&self) -> Result<CheckReport> {
        let _all = self.all_records_guard(LockType::Read, LockFlags::WAIT)?;
        let listed = self.listed_free()?;
        let size = self.map_size();
        let mut report = CheckReport::default();
        let mut prev_free = false;
        let mut off = Offset::new(HEADER_SIZE);

        while off.get() < size {
            let rec = self.read_record(off)?;
            let len = rec.total_len();
            if len < USED_RECORD_SIZE || off.get() + len > size {
                return Err(Error::corrupt(format!("record {} of length {} overruns file", off, len)));
            }
            match rec {
                Record::Free(_) => {
                    if !listed.contains_key(&off) {
                        return Err(Error::corrupt(format!("free record {} is on no list", off)));
                    }
                    if prev_free {
                        report.adjacent_free += 1;
                    }
                    report.free_records += 1;
                    report.free_bytes += len;
                    prev_free = true;
                }
                Record::Used(_) => {
                    report.used_records += 1;
                    report.used_bytes += len;
                    prev_free = false;
                }
            }
            off = off + len;
        }
        if report.free_records != listed.len() as u64 {
            error!("{} listed free records, {} found in file", listed.len(), report.free_records);
            return Err(Error::corrupt("free lists name records that are not in the file"));
        }
        debug!("check: {:?}", report);
        Ok(report)
    }

    /// The (table, bucket) whose list holds a free record at `off`.
    pub fn find_free(&self, off: Offset) -> Result<Option<(usize, usize)>> {
        let _all = self.all_records_guard(LockType::Read, LockFlags::WAIT)?;
        Ok(self.listed_free()?.get(&off).copied())
    }

    /// The records on one bucket list, head first.
    pub fn bucket_entries(&self, table: usize, bucket: usize) -> Result<Vec<Offset>> {
        let region = self.free_bucket_region(table, bucket)?;
        let _lock = self.lock_region_guard(region, LockType::Write, LockFlags::WAIT)?;
        self.walk_bucket(table, bucket)
    }
}

#[cfg(test)]
mod tests {
    use crate::env::Config;

    #[test]
    fn fresh_database_checks_clean() {
        let db = Config::new().open_internal().unwrap();
        let report = db.check().unwrap();
        assert_eq!(report.free_records, 0);
        // Hash table and one free table.
        assert_eq!(report.used_records, 2);
    }

    #[test]
    fn allocations_tile_the_file() {
        let db = Config::new().open_internal().unwrap();
        for len in [8, 100, 1000, 5] {
            db.allocate(0, len, false).unwrap();
        }
        let report = db.check().unwrap();
        assert_eq!(report.used_records, 2 + 4);
        assert_eq!(report.free_records, 1);
        assert_eq!(report.used_bytes + report.free_bytes + 128, db.map_size());
    }
}
