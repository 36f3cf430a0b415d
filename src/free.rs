//! Free-list engine.
//!
//! Each free table holds one list per size class. A bucket's head word keeps
//! the first record's offset in its low bits and an insertion counter in the
//! stolen top byte. The head's `prev` points at the tail, so insertion at the
//! head and removal anywhere are O(1).

use log::{debug, trace};
use std::sync::atomic::Ordering;

use crate::constants::{
    LockFlags, COALESCE_HOUSEKEEPING_LIMIT, COALESCE_MERGE_STEPS, COALESCE_MERGE_STEPS_MAX,
    FREE_RECORD_SIZE, FTABLE_BUCKETS_OFFSET, HEADER_SIZE, NTDB_FREE_BUCKETS, NTDB_FTABLE_NONE,
    NTDB_OFF_MASK, NTDB_OFF_UPPER_STEAL, NTDB_USED_MAGIC, USED_RECORD_SIZE,
};
use crate::env::Ntdb;
use crate::error::{Error, Result};
use crate::record::{adjust_size, size_to_bucket, FreeRecord, UsedRecord};
use crate::stats::Counters;
use crate::types::{Offset, Region};

const COUNTER_SHIFT: u32 = 64 - NTDB_OFF_UPPER_STEAL;

/// Outcome of trying to merge a free record with what follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Coalesced {
    /// Nothing free follows it
    Nothing,
    /// Merged; the record now has this payload length
    Merged(u64),
    /// Merged, but the result could not be re-listed without dropping the
    /// bucket lock. The record at `off` spanning `len` bytes is off every list.
    Deferred { off: Offset, len: u64 },
}

/// Space left after carving a record out of `total_len` payload bytes, or
/// zero when it cannot hold a free record.
fn record_leftover(key_len: u64, data_len: u64, want_extra: bool, total_len: u64) -> u64 {
    let data_len = if want_extra { data_len + data_len / 2 } else { data_len };
    let leftover = total_len.saturating_sub(adjust_size(key_len, data_len));
    if leftover < FREE_RECORD_SIZE {
        0
    } else {
        leftover
    }
}

impl Ntdb {
    /// Offset of the head word of `bucket` in free table `table`.
    pub(crate) fn bucket_off(&self, table: usize, bucket: usize) -> Result<Offset> {
        let ftable = self
            .ftables
            .get(table)
            .ok_or_else(|| Error::corrupt(format!("free table {} does not exist", table)))?;
        Ok(*ftable + FTABLE_BUCKETS_OFFSET + 8 * bucket as u64)
    }

    /// Lock region guarding `bucket` of free table `table`.
    pub fn free_bucket_region(&self, table: usize, bucket: usize) -> Result<Region> {
        if bucket >= NTDB_FREE_BUCKETS {
            return Err(Error::Invalid(format!("no free bucket {}", bucket)));
        }
        Ok(Region::FreeBucket(self.bucket_off(table, bucket)?))
    }

    /// Bucket a listed free record belongs in.
    fn home_bucket(&self, rec: &FreeRecord) -> Result<Offset> {
        self.bucket_off(rec.ftable as usize, size_to_bucket(rec.len))
    }

    pub(crate) fn first_in_free(&self, b_off: Offset) -> Result<Offset> {
        Ok(Offset::new(self.read_u64(b_off)? & NTDB_OFF_MASK))
    }

    fn set_first_in_free(&self, b_off: Offset, head: Offset) -> Result<()> {
        let counter = self.read_u64(b_off)? & !NTDB_OFF_MASK;
        self.write_u64(b_off, counter | head.get())
    }

    /// Push a record on the head of a locked bucket. Returns true when the
    /// bucket's insertion counter wrapped.
    fn enqueue(&self, b_off: Offset, off: Offset, len: u64) -> Result<bool> {
        let table = self.current_free_table() as u8;
        let word = self.read_u64(b_off)?;
        let head = Offset::new(word & NTDB_OFF_MASK);
        let counter = ((word >> COUNTER_SHIFT) + 1) & 0xff;

        let rec = if head.is_none() {
            FreeRecord { prev: off, ftable: table, len, next: Offset::NONE }
        } else {
            let mut head_rec = self.read_free(head)?;
            let rec = FreeRecord { prev: head_rec.prev, ftable: table, len, next: head };
            head_rec.prev = off;
            self.write_free(head, &head_rec)?;
            rec
        };
        self.write_free(off, &rec)?;
        self.write_u64(b_off, (counter << COUNTER_SHIFT) | off.get())?;
        trace!("free record {} len {} listed at bucket {}", off, len, b_off);
        Ok(counter == 0)
    }

    /// Unlink `rec` at `off` from the locked bucket at `b_off`.
    pub(crate) fn remove_from_list(&self, b_off: Offset, off: Offset, rec: &FreeRecord) -> Result<()> {
        let head = self.first_in_free(b_off)?;
        if rec.prev.is_none() {
            return Err(Error::corrupt(format!("free record {} has no prev", off)));
        }

        if head == off {
            self.set_first_in_free(b_off, rec.next)?;
        } else {
            let mut prev = self.read_free(rec.prev)?;
            if prev.next != off {
                return Err(Error::corrupt(format!(
                    "remove_from_list: {} prev {} points to {}",
                    off, rec.prev, prev.next
                )));
            }
            prev.next = rec.next;
            self.write_free(rec.prev, &prev)?;
        }

        if !rec.next.is_none() {
            let mut next = self.read_free(rec.next)?;
            if next.prev != off {
                return Err(Error::corrupt(format!(
                    "remove_from_list: {} next {} points back to {}",
                    off, rec.next, next.prev
                )));
            }
            next.prev = rec.prev;
            self.write_free(rec.next, &next)?;
        } else if head != off {
            // We were the tail; the head's prev has to follow.
            let mut head_rec = self.read_free(head)?;
            if head_rec.prev != off {
                return Err(Error::corrupt(format!(
                    "remove_from_list: tail {} but head {} has prev {}",
                    off, head, head_rec.prev
                )));
            }
            head_rec.prev = rec.prev;
            self.write_free(head, &head_rec)?;
        }
        Ok(())
    }

    /// Put `len_with_header` bytes at `off` on a free list of the current table.
    pub(crate) fn add_free_record(
        &self,
        off: Offset,
        len_with_header: u64,
        flags: LockFlags,
        coalesce: bool,
    ) -> Result<()> {
        let b_off = self.free_bucket_for(len_with_header)?;
        self.lock_free_bucket(Region::FreeBucket(b_off), flags)?;
        self.insert_locked(b_off, off, len_with_header, coalesce)
    }

    fn free_bucket_for(&self, len_with_header: u64) -> Result<Offset> {
        if len_with_header < FREE_RECORD_SIZE {
            return Err(Error::corrupt(format!("free record of {} bytes is too small", len_with_header)));
        }
        self.bucket_off(self.current_free_table(), size_to_bucket(len_with_header - USED_RECORD_SIZE))
    }

    /// List a record in the bucket we hold, coalesce if asked, and release it.
    fn insert_locked(&self, b_off: Offset, off: Offset, len_with_header: u64, coalesce: bool) -> Result<()> {
        let region = Region::FreeBucket(b_off);
        let wrapped = match self.enqueue(b_off, off, len_with_header - USED_RECORD_SIZE) {
            Ok(wrapped) => wrapped,
            Err(e) => {
                self.unlock_free_bucket(region)?;
                return Err(e);
            }
        };
        if !coalesce {
            return self.unlock_free_bucket(region);
        }
        if wrapped {
            Counters::bump(&self.stats.alloc_coalesce_iterate_clash);
            debug!("housekeeping bucket {}", b_off);
            self.coalesce_list(b_off, COALESCE_HOUSEKEEPING_LIMIT, true)
        } else {
            self.coalesce_list(b_off, 1, false)
        }
    }

    /// Merge up to `limit` records from the head of a held bucket, then
    /// release it.
    fn coalesce_list(&self, b_off: Offset, limit: usize, rotate: bool) -> Result<()> {
        let walked = self.coalesce_walk(b_off, limit, rotate);
        let unlocked = self.unlock_free_bucket(Region::FreeBucket(b_off));
        match walked? {
            Some((off, len)) => {
                unlocked?;
                self.add_free_record(off, len, LockFlags::WAIT, false)
            }
            None => unlocked,
        }
    }

    fn coalesce_walk(&self, b_off: Offset, limit: usize, rotate: bool) -> Result<Option<(Offset, u64)>> {
        let mut off = self.first_in_free(b_off)?;
        let mut visited = 0;
        while !off.is_none() && visited < limit {
            let rec = self.read_free(off)?;
            let mut next = Some(rec.next);
            visited += 1;
            match self.coalesce(off, b_off, rec.len, &mut next)? {
                Coalesced::Nothing => {}
                Coalesced::Merged(len) => trace!("{} grew from {} to {}", off, rec.len, len),
                Coalesced::Deferred { off, len } => return Ok(Some((off, len))),
            }
            match next {
                Some(n) => off = n,
                // The next entry was merged away; stop here.
                None => return Ok(None),
            }
        }
        if rotate && !off.is_none() {
            self.rotate_to_head(b_off, off)?;
        }
        Ok(None)
    }

    /// Make `off` the head, moving everything before it to the tail.
    fn rotate_to_head(&self, b_off: Offset, off: Offset) -> Result<()> {
        let head = self.first_in_free(b_off)?;
        if head == off {
            return Ok(());
        }
        let head_rec = self.read_free(head)?;
        let rec = self.read_free(off)?;
        let tail = head_rec.prev;
        let new_tail = rec.prev;

        let mut tail_rec = self.read_free(tail)?;
        tail_rec.next = head;
        self.write_free(tail, &tail_rec)?;
        let mut new_tail_rec = self.read_free(new_tail)?;
        new_tail_rec.next = Offset::NONE;
        self.write_free(new_tail, &new_tail_rec)?;
        self.set_first_in_free(b_off, off)?;
        trace!("rotated bucket {} to start at {}", b_off, off);
        Ok(())
    }

    /// A listed free record at `off`, if there is one.
    fn peek_free(&self, off: Offset) -> Result<Option<FreeRecord>> {
        if off.get() + FREE_RECORD_SIZE > self.map_size() {
            return Ok(None);
        }
        let word = self.read_u64(off)?;
        if !FreeRecord::is_free_word(word) {
            return Ok(None);
        }
        let rec = self.read_free(off)?;
        if rec.ftable as u64 == NTDB_FTABLE_NONE {
            return Ok(None);
        }
        Ok(Some(rec))
    }

    fn listed_in(&self, off: Offset, b_off: Offset) -> Result<Option<FreeRecord>> {
        match self.peek_free(off)? {
            Some(rec) if self.home_bucket(&rec)? == b_off => Ok(Some(rec)),
            _ => Ok(None),
        }
    }

    /// Absorb free records that physically follow the one at `off`.
    ///
    /// `protect` is the list entry the caller visits next; it is cleared if
    /// this swallows it.
    fn coalesce(&self, off: Offset, b_off: Offset, data_len: u64, protect: &mut Option<Offset>) -> Result<Coalesced> {
        Counters::bump(&self.stats.alloc_coalesce_tried);
        let start = off + USED_RECORD_SIZE + data_len;
        let mut end = start;
        let mut budget = COALESCE_MERGE_STEPS;
        let mut merged = 0;

        while merged < budget {
            let rec = match self.peek_free(end)? {
                Some(rec) => rec,
                None => break,
            };
            let nb_off = self.home_bucket(&rec)?;
            let region = Region::FreeBucket(nb_off);
            // Out of lock order: never wait.
            match self.lock_free_bucket(region, LockFlags::NOWAIT | LockFlags::PROBE) {
                Ok(()) => {}
                Err(e) if e.is_contention() => {
                    Counters::bump(&self.stats.alloc_coalesce_lockfail);
                    break;
                }
                Err(e) => return Err(e),
            }

            // Now we have the lock, look again.
            let rec = match self.listed_in(end, nb_off) {
                Ok(Some(rec)) => rec,
                other => {
                    self.unlock_free_bucket(region)?;
                    other?;
                    Counters::bump(&self.stats.alloc_coalesce_race);
                    break;
                }
            };
            if *protect == Some(end) {
                *protect = None;
            }
            let removed = self.remove_from_list(nb_off, end, &rec);
            let unlocked = self.unlock_free_bucket(region);
            removed?;
            unlocked?;

            let before = size_to_bucket(end.get() - off.get() - USED_RECORD_SIZE);
            end = end + rec.total_len();
            merged += 1;
            Counters::bump(&self.stats.alloc_coalesce_num_merged);
            if size_to_bucket(end.get() - off.get() - USED_RECORD_SIZE) > before {
                budget = (budget + 1).min(COALESCE_MERGE_STEPS_MAX);
            }
        }
        if end == start {
            return Ok(Coalesced::Nothing);
        }

        let rec = self.read_free(off)?;
        if rec.len != data_len {
            return Err(Error::corrupt(format!(
                "coalesce: expected data len {} not {} at {}",
                data_len, rec.len, off
            )));
        }
        self.remove_from_list(b_off, off, &rec)?;
        Counters::bump(&self.stats.alloc_coalesce_succeeded);

        let total = end.get() - off.get();
        trace!("coalesced {} records into {} len {}", merged + 1, off, total);
        match self.add_free_record(off, total, LockFlags::NOWAIT | LockFlags::PROBE, false) {
            Ok(()) => Ok(Coalesced::Merged(total - USED_RECORD_SIZE)),
            Err(e) if e.is_contention() => {
                Counters::bump(&self.stats.alloc_coalesce_lockfail);
                // Keep other coalescers off it until it is listed again.
                let hidden = FreeRecord {
                    prev: Offset::NONE,
                    ftable: NTDB_FTABLE_NONE as u8,
                    len: total - USED_RECORD_SIZE,
                    next: Offset::NONE,
                };
                self.write_free(off, &hidden)?;
                Ok(Coalesced::Deferred { off, len: total })
            }
            Err(e) => Err(e),
        }
    }

    /// First non-empty bucket at or above `bucket`, or `NTDB_FREE_BUCKETS`.
    fn find_free_head(&self, table: usize, bucket: usize) -> Result<usize> {
        for b in bucket..NTDB_FREE_BUCKETS {
            if !self.first_in_free(self.bucket_off(table, b)?)?.is_none() {
                return Ok(b);
            }
        }
        Ok(NTDB_FREE_BUCKETS)
    }

    fn lock_and_alloc(
        &self,
        table: usize,
        bucket: usize,
        key_len: u64,
        data_len: u64,
        want_extra: bool,
    ) -> Result<Option<Offset>> {
        let b_off = self.bucket_off(table, bucket)?;
        let region = Region::FreeBucket(b_off);
        self.lock_free_bucket(region, LockFlags::WAIT)?;
        let found = self.alloc_locked(b_off, key_len, data_len, want_extra);
        let unlocked = self.unlock_free_bucket(region);
        let found = found?;
        unlocked?;
        Ok(found)
    }

    /// Near-best-fit search of a held bucket; fussiness drops 1% per step.
    fn alloc_locked(&self, b_off: Offset, key_len: u64, data_len: u64, want_extra: bool) -> Result<Option<Offset>> {
        let size = adjust_size(key_len, data_len);
        let mut multiplier = if want_extra { 1.5 } else { 1.0 };
        let mut best: Option<(Offset, FreeRecord)> = None;
        let max_steps = self.map_size() / FREE_RECORD_SIZE;
        let mut steps = 0;

        let mut off = self.first_in_free(b_off)?;
        while !off.is_none() {
            let rec = self.read_free(off)?;
            if rec.len >= size && best.map_or(true, |(_, b)| rec.len < b.len) {
                best = Some((off, rec));
            }
            if let Some((_, b)) = best {
                if (b.len as f64) <= size as f64 * multiplier {
                    break;
                }
            }
            multiplier *= 1.01;
            off = rec.next;
            steps += 1;
            if steps > max_steps {
                return Err(Error::corrupt(format!("free list at {} loops", b_off)));
            }
        }

        let (off, rec) = match best {
            Some(best) => best,
            None => return Ok(None),
        };
        let leftover = record_leftover(key_len, data_len, want_extra, rec.len);
        // A header that cannot be encoded leaves the candidate listed.
        let used = UsedRecord::new(NTDB_USED_MAGIC, key_len, data_len, rec.len - leftover)?;
        self.remove_from_list(b_off, off, &rec)?;

        // Mark it used before anything can see it as a coalescing neighbour.
        self.write_used(off, &used)?;
        if used.padding > 0 {
            self.write_bytes(off + USED_RECORD_SIZE + key_len + data_len, &[0])?;
        }
        if leftover > 0 {
            Counters::bump(&self.stats.alloc_subtract);
            let rest = off + (USED_RECORD_SIZE + rec.len - leftover);
            self.add_free_record(rest, leftover, LockFlags::WAIT, false)?;
        }
        Ok(Some(off))
    }

    /// Find and claim space, trying every free table once.
    fn get_free(&self, key_len: u64, data_len: u64, want_extra: bool) -> Result<Option<Offset>> {
        let start_b = if want_extra {
            size_to_bucket(adjust_size(key_len, data_len + data_len / 2))
        } else {
            size_to_bucket(adjust_size(key_len, data_len))
        };
        let tables = self.ftables.len();
        let first = self.current_free_table();
        for i in 0..tables {
            let table = (first + i) % tables;
            let mut b = self.find_free_head(table, start_b)?;
            while b < NTDB_FREE_BUCKETS {
                if let Some(off) = self.lock_and_alloc(table, b, key_len, data_len, want_extra)? {
                    if b == start_b {
                        Counters::bump(&self.stats.alloc_bucket_exact);
                    }
                    if b == NTDB_FREE_BUCKETS - 1 {
                        Counters::bump(&self.stats.alloc_bucket_max);
                    }
                    // Stick with a table that works.
                    self.ftable.store(table, Ordering::Relaxed);
                    return Ok(Some(off));
                }
                b = self.find_free_head(table, b + 1)?;
            }
        }
        Ok(None)
    }

    /// Allocate a used record for a key and data of these lengths.
    ///
    /// `growing` reserves half as much again for records expected to grow.
    /// Grows the file as often as needed; only lock, I/O and corruption
    /// errors come back.
    pub fn allocate(&self, key_len: u64, data_len: u64, growing: bool) -> Result<Offset> {
        loop {
            if let Some(off) = self.get_free(key_len, data_len, growing)? {
                Counters::bump(&self.stats.allocs);
                return Ok(off);
            }
            self.expand(adjust_size(key_len, data_len))?;
        }
    }

    /// Return `total_len` bytes at `off`, header included, to the free lists.
    ///
    /// The record is checked again under the bucket lock: one that is
    /// already free gives [`Error::NotFound`].
    pub fn free(&self, off: Offset, total_len: u64, flags: LockFlags, allow_coalesce: bool) -> Result<()> {
        if off.get() < HEADER_SIZE {
            return Err(Error::Invalid(format!("cannot free header offset {}", off)));
        }
        let b_off = self.free_bucket_for(total_len)?;
        let region = Region::FreeBucket(b_off);
        self.lock_free_bucket(region, flags)?;
        if let Err(e) = self.check_freeable(off, total_len) {
            self.unlock_free_bucket(region)?;
            return Err(e);
        }
        Counters::bump(&self.stats.frees);
        self.insert_locked(b_off, off, total_len, allow_coalesce)
    }

    fn check_freeable(&self, off: Offset, total_len: u64) -> Result<()> {
        let word = self.read_u64(off)?;
        if FreeRecord::is_free_word(word) {
            return Err(Error::NotFound);
        }
        let used = self.read_used(off)?;
        if !UsedRecord::is_used_magic(used.magic) {
            return Err(Error::corrupt(format!("free of {} with bad magic 0x{:x}", off, used.magic)));
        }
        if used.total_len() != total_len {
            return Err(Error::corrupt(format!(
                "free of {}: record is {} bytes, not {}",
                off,
                used.total_len(),
                total_len
            )));
        }
        Ok(())
    }

    /// Free the used record at `off`, whatever its size.
    pub fn free_record(&self, off: Offset, flags: LockFlags, allow_coalesce: bool) -> Result<()> {
        let word = self.read_u64(off)?;
        if FreeRecord::is_free_word(word) {
            return Err(Error::NotFound);
        }
        let used = self.read_used(off)?;
        self.free(off, used.total_len(), flags, allow_coalesce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Config;

    fn memory_db() -> Ntdb {
        Config::new().open_internal().unwrap()
    }

    fn list(db: &Ntdb, b_off: Offset) -> Vec<Offset> {
        let mut out = Vec::new();
        let mut off = db.first_in_free(b_off).unwrap();
        while !off.is_none() {
            out.push(off);
            off = db.read_free(off).unwrap().next;
        }
        out
    }

    #[test]
    fn leftover_needs_room_for_a_free_record() {
        assert_eq!(record_leftover(0, 104, false, 104), 0);
        assert_eq!(record_leftover(0, 104, false, 120), 0);
        assert_eq!(record_leftover(0, 104, false, 128), 24);
        assert_eq!(record_leftover(0, 100, false, 1000), 896);
        // Growing records keep half as much again.
        assert_eq!(record_leftover(0, 100, true, 1000), 1000 - 152);
    }

    #[test]
    fn enqueue_and_remove_keep_head_prev_on_tail() {
        let db = memory_db();
        db.grow_backing_file(db.map_size() + 4096).unwrap();
        let base = db.map_size() - 4096;
        let b_off = db.bucket_off(0, 0).unwrap();
        let offs: Vec<Offset> = (0..3).map(|i| Offset::new(base + i * 64)).collect();
        for &off in &offs {
            db.enqueue(b_off, off, 8).unwrap();
        }
        assert_eq!(list(&db, b_off), vec![offs[2], offs[1], offs[0]]);
        assert_eq!(db.read_free(offs[2]).unwrap().prev, offs[0]);

        // Remove the tail; the head must now point at the new tail.
        let tail = db.read_free(offs[0]).unwrap();
        db.remove_from_list(b_off, offs[0], &tail).unwrap();
        assert_eq!(list(&db, b_off), vec![offs[2], offs[1]]);
        assert_eq!(db.read_free(offs[2]).unwrap().prev, offs[1]);

        let head = db.read_free(offs[2]).unwrap();
        db.remove_from_list(b_off, offs[2], &head).unwrap();
        assert_eq!(list(&db, b_off), vec![offs[1]]);
        assert_eq!(db.read_free(offs[1]).unwrap().prev, offs[1]);
    }

    #[test]
    fn counter_survives_removal() {
        let db = memory_db();
        db.grow_backing_file(db.map_size() + 4096).unwrap();
        let off = Offset::new(db.map_size() - 4096);
        let b_off = db.bucket_off(0, 0).unwrap();
        db.enqueue(b_off, off, 8).unwrap();
        let rec = db.read_free(off).unwrap();
        db.remove_from_list(b_off, off, &rec).unwrap();
        assert_eq!(db.read_u64(b_off).unwrap() >> COUNTER_SHIFT, 1);
        assert!(db.first_in_free(b_off).unwrap().is_none());
    }

    #[test]
    fn counter_wraps_after_256_inserts() {
        let db = memory_db();
        db.grow_backing_file(db.map_size() + 4096).unwrap();
        let off = Offset::new(db.map_size() - 4096);
        let b_off = db.bucket_off(0, 0).unwrap();
        let mut wraps = 0;
        for _ in 0..256 {
            if db.enqueue(b_off, off, 8).unwrap() {
                wraps += 1;
            }
            let rec = db.read_free(off).unwrap();
            db.remove_from_list(b_off, off, &rec).unwrap();
        }
        assert_eq!(wraps, 1);
    }

    #[test]
    fn rotation_moves_prefix_to_tail() {
        let db = memory_db();
        db.grow_backing_file(db.map_size() + 4096).unwrap();
        let base = db.map_size() - 4096;
        let b_off = db.bucket_off(0, 0).unwrap();
        let offs: Vec<Offset> = (0..4).map(|i| Offset::new(base + i * 64)).collect();
        for &off in offs.iter().rev() {
            db.enqueue(b_off, off, 8).unwrap();
        }
        assert_eq!(list(&db, b_off), offs);

        db.rotate_to_head(b_off, offs[2]).unwrap();
        assert_eq!(list(&db, b_off), vec![offs[2], offs[3], offs[0], offs[1]]);
        assert_eq!(db.read_free(offs[2]).unwrap().prev, offs[1]);
    }

    #[test]
    fn unencodable_header_keeps_candidate_listed() {
        let db = memory_db();
        db.grow_backing_file(db.map_size() + 4096).unwrap();
        let off = Offset::new(db.map_size() - 4096);
        let b_off = db.bucket_off(0, NTDB_FREE_BUCKETS - 1).unwrap();
        // Only the header is real; the allocation fails before touching the rest.
        db.enqueue(b_off, off, 18 << 30).unwrap();

        // Growing by half of 9 GiB needs more padding than the header holds.
        let err = db.alloc_locked(b_off, 0, 9 << 30, true).unwrap_err();
        assert!(err.is_corrupt());
        assert_eq!(list(&db, b_off), vec![off]);
        assert_eq!(db.read_free(off).unwrap().len, 18 << 30);
    }

    #[test]
    fn double_free_is_not_found() {
        let db = memory_db();
        let a = db.allocate(0, 40, false).unwrap();
        let _barrier = db.allocate(0, 8, false).unwrap();
        db.free(a, 56, LockFlags::WAIT, false).unwrap();
        assert!(matches!(db.free(a, 56, LockFlags::WAIT, false), Err(Error::NotFound)));
    }

    #[test]
    fn wrong_length_is_corruption() {
        let db = memory_db();
        let a = db.allocate(0, 40, false).unwrap();
        assert!(db.free(a, 64, LockFlags::WAIT, false).unwrap_err().is_corrupt());
    }

    #[test]
    fn growing_allocation_reserves_padding() {
        let db = memory_db();
        let off = db.allocate(4, 100, true).unwrap();
        let used = db.read_used(off).unwrap();
        assert_eq!(used.key_len, 4);
        assert_eq!(used.data_len, 100);
        assert!(used.padding >= 50);
    }
}
