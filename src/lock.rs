//! Lock manager.
//!
//! Every region is one byte of the file locked with fcntl. fcntl locks are
//! neither reentrant nor per handle, so the process keeps a table of what it
//! holds: nested requests only bump a count, and a request for a lock some
//! other handle in this process holds is refused as an owner conflict.
//!
//! The all-record lock covers every hash chain and free bucket, from
//! `NTDB_HASH_LOCK_START` to the end of the file.

use log::{debug, error, trace, warn};
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::thread;
use std::time::Duration;

use crate::constants::{
    LockFlags, OpenFlags, NTDB_EXPANSION_LOCK, NTDB_FREE_LOCK_START, NTDB_HASH_LOCK_RANGE,
    NTDB_HASH_LOCK_START, UPGRADE_ATTEMPTS,
};
use crate::env::Ntdb;
use crate::error::{Error, Result};
use crate::stats::Counters;
use crate::types::{HandleId, LockType, Region};

/// One held byte lock
#[derive(Debug, Clone, Copy)]
struct LockRecord {
    off: u64,
    ltype: LockType,
    count: u32,
    owner: HandleId,
}

/// The held all-record lock
#[derive(Debug, Clone, Copy)]
struct AllRecordLock {
    ltype: LockType,
    count: u32,
    owner: HandleId,
    /// Taken for reading with the intent to upgrade
    upgradable: bool,
}

/// Locks held by this process on one file
#[derive(Debug, Default)]
pub(crate) struct LockTable {
    records: Vec<LockRecord>,
    allrecord: Option<AllRecordLock>,
    /// Process that took the locks
    locker: u32,
}

impl LockTable {
    fn is_empty(&self) -> bool {
        self.records.is_empty() && self.allrecord.is_none()
    }

    fn position(&self, off: u64) -> Option<usize> {
        self.records.iter().position(|r| r.off == off)
    }

    fn holds(&self, owner: HandleId, off: u64) -> bool {
        self.records.iter().any(|r| r.owner == owner && r.off == off)
    }
}

/// Issue one fcntl request. `len` of zero means to end of file.
fn fcntl_lock(fd: RawFd, l_type: libc::c_short, off: u64, len: u64, wait: bool) -> io::Result<()> {
    // SAFETY: flock is plain old data; all-zero is a valid value.
    let mut fl: libc::flock = unsafe { mem::zeroed() };
    fl.l_type = l_type;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = off as libc::off_t;
    fl.l_len = len as libc::off_t;
    let cmd = if wait { libc::F_SETLKW } else { libc::F_SETLK };
    loop {
        // SAFETY: fd stays open as long as the SharedFile that owns it.
        let ret = unsafe { libc::fcntl(fd, cmd, &fl as *const libc::flock) };
        if ret == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if wait && err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(err);
    }
}

fn would_block(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EACCES))
}

impl Ntdb {
    fn os_locking(&self) -> Option<RawFd> {
        if self.flags.contains(OpenFlags::NOLOCK) {
            return None;
        }
        self.file.fd
    }

    fn current_pid(&self) -> u32 {
        match self.file.pid_override.load(std::sync::atomic::Ordering::Relaxed) {
            0 => std::process::id(),
            pid => pid,
        }
    }

    /// Pretend the process is now `pid`, as after a fork.
    #[doc(hidden)]
    pub fn simulate_fork(&self, pid: u32) {
        self.file.pid_override.store(pid, std::sync::atomic::Ordering::Relaxed);
    }

    /// Take an OS lock on `len` bytes at `off`.
    fn brlock(&self, ltype: LockType, off: u64, len: u64, flags: LockFlags) -> Result<()> {
        let fd = match self.os_locking() {
            Some(fd) => fd,
            None => return Ok(()),
        };
        if ltype == LockType::Write && self.is_readonly() {
            error!("write lock at {} on a read-only database", off);
            return Err(Error::ReadOnly);
        }
        let wait = flags.contains(LockFlags::WAIT);
        if !wait {
            Counters::bump(&self.stats.lock_nonblock);
        }
        match fcntl_lock(fd, ltype.fcntl_type(), off, len, wait) {
            Ok(()) => {
                Counters::bump(&self.stats.lock_lowlevel);
                Ok(())
            }
            Err(e) if !wait && would_block(&e) => {
                Counters::bump(&self.stats.lock_nonblock_fail);
                Err(Error::Busy)
            }
            Err(e) => {
                if !flags.contains(LockFlags::PROBE) {
                    error!("{} lock at {} len {} failed: {}", ltype, off, len, e);
                }
                Err(Error::Lock(format!("{} lock at {}: {}", ltype, off, e)))
            }
        }
    }

    fn brunlock(&self, ltype: LockType, off: u64, len: u64) -> Result<()> {
        let fd = match self.os_locking() {
            Some(fd) => fd,
            None => return Ok(()),
        };
        fcntl_lock(fd, libc::F_UNLCK as libc::c_short, off, len, false).map_err(|e| {
            error!("unlock of {} lock at {} len {} failed: {}", ltype, off, len, e);
            Error::Lock(format!("unlock at {}: {}", off, e))
        })?;
        Counters::bump(&self.stats.unlock_lowlevel);
        Ok(())
    }

    fn check_lock_pid(&self, table: &LockTable, call: &str) -> Result<()> {
        let pid = self.current_pid();
        if table.is_empty() || table.locker == pid {
            return Ok(());
        }
        Err(Error::lock_use(format!(
            "{}: fork() detected after lock acquisition ({} != {})",
            call, table.locker, pid
        )))
    }

    /// Nest or take the lock at `off`. Returns true when it was the first
    /// lock this process took on the file.
    fn nest_lock_in(&self, table: &mut LockTable, off: u64, ltype: LockType, flags: LockFlags) -> Result<bool> {
        Counters::bump(&self.stats.locks);
        if let Some(idx) = table.position(off) {
            let rec = &mut table.records[idx];
            if rec.owner != self.id {
                return Err(Error::owner_conflict("nest_lock"));
            }
            if rec.ltype == LockType::Read && ltype == LockType::Write {
                return Err(Error::lock_use(format!("lock at {} held for read, write requested", off)));
            }
            rec.count += 1;
            return Ok(false);
        }

        let first = table.is_empty();
        self.brlock(ltype, off, 1, flags)?;
        if first {
            table.locker = self.current_pid();
        }
        table.records.push(LockRecord {
            off,
            ltype,
            count: 1,
            owner: self.id,
        });
        trace!("locked {} at {}", ltype, off);
        Ok(first)
    }

    fn nest_lock(&self, off: u64, ltype: LockType, flags: LockFlags) -> Result<()> {
        let mut table = self.file.locks();
        self.check_lock_pid(&table, "nest_lock")?;
        self.nest_lock_in(&mut table, off, ltype, flags).map(|_| ())
    }

    fn nest_unlock(&self, off: u64, ltype: LockType) -> Result<()> {
        let mut table = self.file.locks();
        self.check_lock_pid(&table, "nest_unlock")?;
        let idx = table
            .position(off)
            .ok_or_else(|| Error::lock_use(format!("unlock of unheld {} lock at {}", ltype, off)))?;
        let rec = table.records[idx];
        if rec.owner != self.id {
            return Err(Error::owner_conflict("nest_unlock"));
        }
        if rec.count > 1 {
            table.records[idx].count -= 1;
            return Ok(());
        }
        table.records.swap_remove(idx);
        trace!("unlocked {} at {}", rec.ltype, off);
        self.brunlock(rec.ltype, off, 1)
    }

    /// Lock a hash chain or free bucket, deferring to a held all-record lock.
    ///
    /// Returns true when an OS lock was taken and it was the first one.
    fn lock_covered(&self, off: u64, ltype: LockType, flags: LockFlags, call: &str) -> Result<bool> {
        let mut table = self.file.locks();
        self.check_lock_pid(&table, call)?;
        if let Some(all) = table.allrecord {
            if all.owner != self.id {
                return Err(Error::owner_conflict(call));
            }
            if ltype == LockType::Write && all.ltype == LockType::Read {
                return Err(Error::lock_use(format!("{}: write lock under a read all-record lock", call)));
            }
            Counters::bump(&self.stats.locks);
            return Ok(false);
        }
        self.nest_lock_in(&mut table, off, ltype, flags)
    }

    fn unlock_covered(&self, off: u64, ltype: LockType, call: &str) -> Result<()> {
        {
            let table = self.file.locks();
            if let Some(all) = table.allrecord {
                if all.owner != self.id {
                    return Err(Error::owner_conflict(call));
                }
                if ltype == LockType::Write && all.ltype == LockType::Read {
                    return Err(Error::lock_use(format!("{}: write unlock under a read all-record lock", call)));
                }
                return Ok(());
            }
        }
        self.nest_unlock(off, ltype)
    }

    fn lock_hash(&self, off: u64, ltype: LockType, flags: LockFlags) -> Result<()> {
        {
            let table = self.file.locks();
            if table.records.iter().any(|r| r.owner == self.id && r.off >= NTDB_FREE_LOCK_START) {
                return Err(Error::lock_use("hash lock requested while holding a free bucket lock"));
            }
            if table.holds(self.id, NTDB_EXPANSION_LOCK) {
                return Err(Error::lock_use("hash lock requested while holding the expansion lock"));
            }
        }
        let first = self.lock_covered(off, ltype, flags, "lock_hash")?;
        if !first || flags.contains(LockFlags::NOCHECK) {
            return Ok(());
        }

        // First lock of the session: a writer may have died mid-commit.
        let needed = match self.recovery.needs_recovery(self) {
            Ok(needed) => needed,
            Err(e) => {
                self.nest_unlock(off, ltype)?;
                return Err(e);
            }
        };
        if !needed {
            return Ok(());
        }
        self.nest_unlock(off, ltype)?;
        self.lock_and_recover()?;
        self.lock_covered(off, ltype, flags | LockFlags::NOCHECK, "lock_hash")
            .map(|_| ())
    }

    /// Free buckets are only ever locked for writing.
    pub(crate) fn lock_free_bucket(&self, region: Region, flags: LockFlags) -> Result<()> {
        if self.file.locks().holds(self.id, NTDB_EXPANSION_LOCK) {
            return Err(Error::lock_use("free bucket lock requested while holding the expansion lock"));
        }
        self.lock_covered(region.lock_offset(), LockType::Write, flags, "lock_free_bucket")
            .map(|_| ())
    }

    pub(crate) fn unlock_free_bucket(&self, region: Region) -> Result<()> {
        self.unlock_covered(region.lock_offset(), LockType::Write, "unlock_free_bucket")
    }

    /// Lock a region for this handle.
    ///
    /// Without `LockFlags::WAIT` a contended lock returns [`Error::Busy`].
    pub fn lock_region(&self, region: Region, ltype: LockType, flags: LockFlags) -> Result<()> {
        match region {
            Region::Hash(_) => self.lock_hash(region.lock_offset(), ltype, flags),
            Region::FreeBucket(_) => {
                if ltype == LockType::Read {
                    return Err(Error::lock_use("free buckets are only locked for writing"));
                }
                self.lock_free_bucket(region, flags)
            }
            _ => self.nest_lock(region.lock_offset(), ltype, flags),
        }
    }

    pub fn unlock_region(&self, region: Region, ltype: LockType) -> Result<()> {
        match region {
            Region::Hash(_) => self.unlock_covered(region.lock_offset(), ltype, "unlock_hash"),
            Region::FreeBucket(_) => self.unlock_free_bucket(region),
            _ => self.nest_unlock(region.lock_offset(), ltype),
        }
    }

    /// Lock a region until the guard is dropped.
    pub fn lock_region_guard(&self, region: Region, ltype: LockType, flags: LockFlags) -> Result<LockGuard<'_>> {
        self.lock_region(region, ltype, flags)?;
        Ok(LockGuard { db: self, region, ltype })
    }

    /// Whether this handle holds `region`, directly or through the all-record lock.
    pub fn is_locked(&self, region: Region) -> bool {
        let table = self.file.locks();
        let off = region.lock_offset();
        if off >= NTDB_HASH_LOCK_START {
            if let Some(all) = table.allrecord {
                return all.owner == self.id;
            }
        }
        table.holds(self.id, off)
    }

    /// The all-record lock this handle holds, if any.
    pub fn all_records_locked(&self) -> Option<LockType> {
        self.file
            .locks()
            .allrecord
            .filter(|all| all.owner == self.id)
            .map(|all| all.ltype)
    }

    /// Lock `len` bytes at `off`, bisecting the range while it is contended.
    fn lock_gradual(&self, ltype: LockType, flags: LockFlags, off: u64, len: u64) -> Result<()> {
        if len <= 1 {
            return self.brlock(ltype, off, len, flags);
        }
        match self.brlock(ltype, off, len, flags - LockFlags::WAIT) {
            Err(Error::Busy) => {}
            other => return other,
        }
        if !flags.contains(LockFlags::WAIT) {
            return Err(Error::Busy);
        }
        let half = len / 2;
        self.lock_gradual(ltype, flags, off, half)?;
        if let Err(e) = self.lock_gradual(ltype, flags, off + half, len - half) {
            self.brunlock(ltype, off, half)?;
            return Err(e);
        }
        Ok(())
    }

    /// Lock every hash chain and free bucket.
    ///
    /// An `upgradable` read lock may later be turned into a write lock with
    /// [`Ntdb::upgrade_all_records`].
    pub fn lock_all_records(&self, ltype: LockType, flags: LockFlags, upgradable: bool) -> Result<()> {
        if upgradable && ltype != LockType::Read {
            return Err(Error::Invalid("only read all-record locks are upgradable".into()));
        }
        loop {
            {
                let mut table = self.file.locks();
                self.check_lock_pid(&table, "lock_all_records")?;
                Counters::bump(&self.stats.locks);
                if let Some(all) = table.allrecord.as_mut() {
                    if all.owner != self.id {
                        return Err(Error::owner_conflict("lock_all_records"));
                    }
                    if ltype == LockType::Read || all.ltype == LockType::Write {
                        all.count += 1;
                        return Ok(());
                    }
                    return Err(Error::lock_use(format!(
                        "lock_all_records: already hold a {} lock",
                        all.ltype
                    )));
                }
                if let Some(rec) = table.records.iter().find(|r| r.off >= NTDB_HASH_LOCK_START) {
                    if rec.owner != self.id {
                        return Err(Error::owner_conflict("lock_all_records"));
                    }
                    return Err(Error::lock_use("lock_all_records: holding record locks"));
                }

                // Only the hash range starves; take it gradually, then the rest.
                self.lock_gradual(ltype, flags | LockFlags::PROBE, NTDB_HASH_LOCK_START, NTDB_HASH_LOCK_RANGE)?;
                if let Err(e) = self.brlock(ltype, NTDB_HASH_LOCK_START, 0, flags) {
                    self.brunlock(ltype, NTDB_HASH_LOCK_START, NTDB_HASH_LOCK_RANGE)?;
                    return Err(e);
                }
                if table.is_empty() {
                    table.locker = self.current_pid();
                }
                table.allrecord = Some(AllRecordLock {
                    ltype,
                    count: 1,
                    owner: self.id,
                    upgradable,
                });
                debug!("all-record {} lock taken", ltype);
            }

            if flags.contains(LockFlags::NOCHECK) || !self.recovery.needs_recovery(self)? {
                return Ok(());
            }
            self.unlock_all_records(ltype)?;
            self.lock_and_recover()?;
        }
    }

    pub fn unlock_all_records(&self, ltype: LockType) -> Result<()> {
        let mut table = self.file.locks();
        self.check_lock_pid(&table, "unlock_all_records")?;
        let all = table
            .allrecord
            .ok_or_else(|| Error::lock_use("unlock_all_records: not locked"))?;
        if all.owner != self.id {
            return Err(Error::owner_conflict("unlock_all_records"));
        }
        if all.ltype != ltype && ltype != LockType::Read {
            return Err(Error::lock_use(format!("unlock_all_records: hold a {} lock", all.ltype)));
        }
        if all.count > 1 {
            if let Some(all) = table.allrecord.as_mut() {
                all.count -= 1;
            }
            return Ok(());
        }
        table.allrecord = None;
        debug!("all-record {} lock released", all.ltype);
        self.brunlock(all.ltype, NTDB_HASH_LOCK_START, 0)
    }

    /// Turn a singly-held read all-record lock into a write lock.
    ///
    /// The lock must have been taken with `upgradable` set.
    pub fn upgrade_all_records(&self) -> Result<()> {
        let mut table = self.file.locks();
        self.check_lock_pid(&table, "upgrade_all_records")?;
        let all = table
            .allrecord
            .ok_or_else(|| Error::lock_use("upgrade_all_records: not locked"))?;
        if all.owner != self.id {
            return Err(Error::owner_conflict("upgrade_all_records"));
        }
        if all.count != 1 {
            return Err(Error::lock_use(format!("upgrade_all_records: count {} too high", all.count)));
        }
        if all.ltype == LockType::Write {
            return Err(Error::lock_use("upgrade_all_records: already a write lock"));
        }
        if !all.upgradable {
            return Err(Error::lock_use("upgrade_all_records: lock was not taken as upgradable"));
        }

        let fd = self.os_locking();
        let mut attempts = 0;
        let result = loop {
            let err = match fd {
                None => break Ok(()),
                Some(fd) => match fcntl_lock(fd, LockType::Write.fcntl_type(), NTDB_HASH_LOCK_START, 0, true) {
                    Ok(()) => break Ok(()),
                    Err(e) => e,
                },
            };
            attempts += 1;
            // Some kernels report a deadlock against our own read lock.
            if err.raw_os_error() != Some(libc::EDEADLK) || attempts >= UPGRADE_ATTEMPTS {
                break Err(err);
            }
            thread::sleep(Duration::from_micros(1));
        };
        match result {
            Ok(()) => {
                Counters::bump(&self.stats.lock_lowlevel);
                table.allrecord = Some(AllRecordLock {
                    ltype: LockType::Write,
                    upgradable: false,
                    ..all
                });
                debug!("all-record lock upgraded after {} retries", attempts);
                Ok(())
            }
            Err(e) => {
                error!("upgrade_all_records failed after {} attempts: {}", attempts, e);
                Err(Error::Lock(format!("upgrade failed: {}", e)))
            }
        }
    }

    /// Lock every record until the guard is dropped.
    pub fn all_records_guard(&self, ltype: LockType, flags: LockFlags) -> Result<AllRecordGuard<'_>> {
        self.lock_all_records(ltype, flags, ltype == LockType::Read)?;
        Ok(AllRecordGuard { db: self, ltype })
    }

    /// Lock everything and run recovery if it is still needed.
    fn lock_and_recover(&self) -> Result<()> {
        self.lock_all_records(LockType::Write, LockFlags::WAIT | LockFlags::NOCHECK, false)?;
        let result = self.recover_locked();
        let unlocked = self.unlock_all_records(LockType::Write);
        result.and(unlocked)
    }

    fn recover_locked(&self) -> Result<()> {
        let _open = self.lock_region_guard(Region::Open, LockType::Write, LockFlags::WAIT | LockFlags::NOCHECK)?;
        if self.recovery.needs_recovery(self)? {
            self.recovery.recover(self)?;
        }
        Ok(())
    }

    /// Drop every lock this handle still holds.
    pub(crate) fn release_locks(&self) -> Result<()> {
        let mut table = self.file.locks();
        if table.is_empty() {
            return Ok(());
        }
        // After a fork the OS locks belong to the parent.
        let forked = table.locker != self.current_pid();
        let mut result = Ok(());
        if let Some(all) = table.allrecord.filter(|all| all.owner == self.id) {
            warn!("closing with the all-record {} lock held", all.ltype);
            table.allrecord = None;
            if !forked {
                result = self.brunlock(all.ltype, NTDB_HASH_LOCK_START, 0);
            }
        }
        let (mine, others): (Vec<_>, Vec<_>) = table.records.drain(..).partition(|r| r.owner == self.id);
        table.records = others;
        for rec in mine {
            warn!("closing with {} lock at {} held", rec.ltype, rec.off);
            if !forked {
                result = result.and(self.brunlock(rec.ltype, rec.off, 1));
            }
        }
        result
    }
}

/// Releases a region lock on drop.
#[must_use = "the lock is released when the guard is dropped"]
#[derive(Debug)]
pub struct LockGuard<'a> {
    db: &'a Ntdb,
    region: Region,
    ltype: LockType,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.db.unlock_region(self.region, self.ltype) {
            warn!("unlocking {:?}: {}", self.region, e);
        }
    }
}

/// Releases the all-record lock on drop.
#[must_use = "the lock is released when the guard is dropped"]
#[derive(Debug)]
pub struct AllRecordGuard<'a> {
    db: &'a Ntdb,
    ltype: LockType,
}

impl AllRecordGuard<'_> {
    pub fn upgrade(&mut self) -> Result<()> {
        self.db.upgrade_all_records()?;
        self.ltype = LockType::Write;
        Ok(())
    }

    pub fn lock_type(&self) -> LockType {
        self.ltype
    }
}

impl Drop for AllRecordGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.db.unlock_all_records(self.ltype) {
            warn!("unlocking all records: {}", e);
        }
    }
}
