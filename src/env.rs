use lazy_static::lazy_static;
use log::{debug, warn};
use parking_lot::{Mutex, MutexGuard};
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::fs::OpenOptions;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::constants::{
    LockFlags, OpenFlags, DEFAULT_FREE_TABLES, DEFAULT_HASH_BITS, MAX_FREE_TABLES, MAX_HASH_BITS,
};
use crate::error::{Error, Result};
use crate::header::{free_table_chain, new_database, Header};
use crate::io::Backing;
use crate::lock::LockTable;
use crate::record::{FreeRecord, Record, UsedRecord};
use crate::recovery::{HeaderRecovery, RecoveryLog};
use crate::stats::{Counters, Stats};
use crate::types::{HandleId, LockType, Offset, Region};

lazy_static! {
    /// Files open in this process, keyed by (device, inode).
    ///
    /// fcntl locks belong to the process and are dropped when any descriptor
    /// for the file closes, so every handle on a file shares one descriptor.
    static ref OPEN_FILES: Mutex<HashMap<(u64, u64), Weak<SharedFile>>> = Mutex::new(HashMap::new());
}

/// State shared by every handle on the same file in this process
#[derive(Debug)]
pub(crate) struct SharedFile {
    /// Backing bytes
    io: Mutex<Backing>,
    /// Nested lock records and the all-record lock
    locks: Mutex<LockTable>,
    /// Descriptor used for fcntl locks
    pub(crate) fd: Option<RawFd>,
    /// Whether the descriptor was opened for writing
    writable: bool,
    /// Stand-in process id, zero when unset
    pub(crate) pid_override: AtomicU32,
}

impl SharedFile {
    fn new(io: Backing, writable: bool) -> Self {
        let fd = io.file().map(|f| f.as_raw_fd());
        SharedFile {
            io: Mutex::new(io),
            locks: Mutex::new(LockTable::default()),
            fd,
            writable,
            pid_override: AtomicU32::new(0),
        }
    }

    pub(crate) fn locks(&self) -> MutexGuard<'_, LockTable> {
        self.locks.lock()
    }
}

/// Options for opening a database
#[derive(Clone)]
pub struct Config {
    /// Open flags
    flags: OpenFlags,
    /// Free tables created in a new file
    free_tables: usize,
    /// Hash table size of a new file, as log2 of the bucket count
    hash_bits: u32,
    /// Recovery collaborator
    recovery: Arc<dyn RecoveryLog>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Config")
            .field("flags", &self.flags)
            .field("free_tables", &self.free_tables)
            .field("hash_bits", &self.hash_bits)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn new() -> Self {
        Config {
            flags: OpenFlags::empty(),
            free_tables: DEFAULT_FREE_TABLES,
            hash_bits: DEFAULT_HASH_BITS,
            recovery: Arc::new(HeaderRecovery),
        }
    }

    pub fn set_flags(&mut self, flags: OpenFlags) {
        self.flags = flags;
    }

    /// Set the number of free tables a new database is created with.
    ///
    /// Has no effect on an existing file.
    pub fn set_free_tables(&mut self, tables: usize) -> Result<()> {
        if tables == 0 || tables > MAX_FREE_TABLES {
            return Err(Error::Invalid(format!(
                "free tables must be 1..={}, got {}",
                MAX_FREE_TABLES, tables
            )));
        }
        self.free_tables = tables;
        Ok(())
    }

    pub fn set_hash_bits(&mut self, bits: u32) -> Result<()> {
        if bits == 0 || bits > MAX_HASH_BITS {
            return Err(Error::Invalid(format!("hash bits must be 1..={}, got {}", MAX_HASH_BITS, bits)));
        }
        self.hash_bits = bits;
        Ok(())
    }

    pub fn set_recovery(&mut self, recovery: Arc<dyn RecoveryLog>) {
        self.recovery = recovery;
    }

    /// Open or create the database file at `path`.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<Ntdb> {
        if self.flags.contains(OpenFlags::INTERNAL) {
            return self.open_internal();
        }
        let path = path.as_ref();
        let file = shared_file(path, self.flags)?;
        let db = Ntdb::with_file(Some(path.to_path_buf()), self, file);
        db.load(self)
    }

    /// Create a database that lives only in memory.
    pub fn open_internal(&self) -> Result<Ntdb> {
        let file = Arc::new(SharedFile::new(Backing::Memory(Vec::new()), true));
        let mut config = self.clone();
        config.flags |= OpenFlags::INTERNAL | OpenFlags::NOLOCK;
        config.flags.remove(OpenFlags::RDONLY);
        let db = Ntdb::with_file(None, &config, file);
        db.load(&config)
    }
}

/// Find this file among the ones already open in the process, or open it.
fn shared_file(path: &Path, flags: OpenFlags) -> Result<Arc<SharedFile>> {
    let mut files = OPEN_FILES.lock();
    files.retain(|_, file| file.strong_count() > 0);

    let rdonly = flags.contains(OpenFlags::RDONLY);
    // Look before opening: closing a second descriptor would drop our locks.
    if let Ok(meta) = std::fs::metadata(path) {
        if let Some(file) = files.get(&(meta.dev(), meta.ino())).and_then(Weak::upgrade) {
            if !rdonly && !file.writable {
                return Err(Error::Invalid(format!(
                    "{} is already open read-only in this process",
                    path.display()
                )));
            }
            debug!("sharing open file {}", path.display());
            return Ok(file);
        }
    }

    let file = OpenOptions::new()
        .read(true)
        .write(!rdonly)
        .create(!rdonly)
        .open(path)?;
    let meta = file.metadata()?;
    let io = if flags.intersects(OpenFlags::NOMMAP | OpenFlags::RDONLY) {
        Backing::direct(file)?
    } else {
        Backing::mapped(file)?
    };
    let shared = Arc::new(SharedFile::new(io, !rdonly));
    files.insert((meta.dev(), meta.ino()), Arc::downgrade(&shared));
    Ok(shared)
}

/// An open database handle.
///
/// Handles on the same file in one process share the descriptor and lock
/// table but lock independently: a lock held by one is a conflict for the
/// other.
pub struct Ntdb {
    /// Path given to open, none for internal databases
    pub(crate) path: Option<PathBuf>,
    /// Open flags
    pub(crate) flags: OpenFlags,
    /// Identity used as lock owner
    pub(crate) id: HandleId,
    /// Shared file state
    pub(crate) file: Arc<SharedFile>,
    /// Header as read at open
    pub(crate) header: Header,
    /// Free table offsets in chain order
    pub(crate) ftables: Vec<Offset>,
    /// Free table this handle prefers
    pub(crate) ftable: AtomicUsize,
    /// Recovery collaborator
    pub(crate) recovery: Arc<dyn RecoveryLog>,
    /// Operation counters
    pub(crate) stats: Counters,
}

impl fmt::Debug for Ntdb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Ntdb")
            .field("path", &self.path)
            .field("flags", &self.flags)
            .field("id", &self.id)
            .field("ftables", &self.ftables)
            .field("ftable", &self.ftable.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Ntdb {
    /// Open or create a database with default settings.
    pub fn open<P: AsRef<Path>>(path: P, flags: OpenFlags) -> Result<Self> {
        let mut config = Config::new();
        config.set_flags(flags);
        config.open(path)
    }

    fn with_file(path: Option<PathBuf>, config: &Config, file: Arc<SharedFile>) -> Self {
        Ntdb {
            path,
            flags: config.flags,
            id: HandleId::next(),
            file,
            header: Header::default(),
            ftables: Vec::new(),
            ftable: AtomicUsize::new(0),
            recovery: Arc::clone(&config.recovery),
            stats: Counters::default(),
        }
    }

    /// Create the file if it is empty, then read its header and free tables.
    fn load(mut self, config: &Config) -> Result<Self> {
        let ltype = if self.is_readonly() { LockType::Read } else { LockType::Write };
        let (header, ftables) = {
            let _open = self.lock_region_guard(Region::Open, ltype, LockFlags::WAIT | LockFlags::NOCHECK)?;
            let mut io = self.io();
            io.refresh()?;
            if io.size() == 0 {
                if self.is_readonly() {
                    return Err(Error::Invalid("cannot create a database read-only".into()));
                }
                let (_, image) = new_database(config.hash_bits, config.free_tables, rand::random())?;
                io.grow(image.len() as u64)?;
                io.write(0, &image)?;
                debug!(
                    "created database: {} free tables, {} hash bits",
                    config.free_tables, config.hash_bits
                );
            }
            let header = Header::read(&mut io)?;
            let ftables = free_table_chain(&mut io, &header)?;
            (header, ftables)
        };
        self.header = header;
        self.ftables = ftables;
        self.pick_free_table();
        Ok(self)
    }

    /// Choose a preferred free table uniformly at random.
    fn pick_free_table(&self) {
        let mut rng = rand::thread_rng();
        let mut chosen = 0;
        for seen in 0..self.ftables.len() {
            if rng.gen_range(0..=seen) == 0 {
                chosen = seen;
            }
        }
        self.ftable.store(chosen, Ordering::Relaxed);
    }

    pub(crate) fn io(&self) -> MutexGuard<'_, Backing> {
        self.file.io.lock()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn is_readonly(&self) -> bool {
        self.flags.contains(OpenFlags::RDONLY)
    }

    pub fn hash_bits(&self) -> u32 {
        self.header.hash_bits
    }

    pub fn free_table_count(&self) -> usize {
        self.ftables.len()
    }

    /// Index of the free table this handle allocates from first.
    pub fn current_free_table(&self) -> usize {
        self.ftable.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> Stats {
        self.stats.snapshot()
    }

    /// File size as currently mapped.
    pub fn map_size(&self) -> u64 {
        self.io().size()
    }

    pub fn read_bytes(&self, off: Offset, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.io().read(off.get(), &mut buf)?;
        Ok(buf)
    }

    pub fn write_bytes(&self, off: Offset, data: &[u8]) -> Result<()> {
        if self.is_readonly() {
            return Err(Error::ReadOnly);
        }
        self.io().write(off.get(), data)
    }

    pub(crate) fn read_u64(&self, off: Offset) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.io().read(off.get(), &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub(crate) fn write_u64(&self, off: Offset, val: u64) -> Result<()> {
        self.write_bytes(off, &val.to_le_bytes())
    }

    /// Grow the file to `new_size` bytes.
    pub(crate) fn grow_backing_file(&self, new_size: u64) -> Result<()> {
        if self.is_readonly() {
            return Err(Error::ReadOnly);
        }
        self.io().grow(new_size)
    }

    /// Decode whatever record starts at `off`.
    pub fn read_record(&self, off: Offset) -> Result<Record> {
        let mut buf = [0u8; FreeRecord::SIZE];
        let mut io = self.io();
        let avail = io.size().saturating_sub(off.get()).min(FreeRecord::SIZE as u64) as usize;
        io.read(off.get(), &mut buf[..avail])?;
        Record::decode(&buf[..avail])
    }

    pub(crate) fn read_free(&self, off: Offset) -> Result<FreeRecord> {
        let mut buf = [0u8; FreeRecord::SIZE];
        self.io().read(off.get(), &mut buf)?;
        FreeRecord::decode(&buf)
    }

    pub(crate) fn write_free(&self, off: Offset, rec: &FreeRecord) -> Result<()> {
        self.write_bytes(off, &rec.encode()?)
    }

    pub(crate) fn read_used(&self, off: Offset) -> Result<UsedRecord> {
        let mut buf = [0u8; UsedRecord::SIZE];
        self.io().read(off.get(), &mut buf)?;
        UsedRecord::decode(&buf)
    }

    pub(crate) fn write_used(&self, off: Offset, rec: &UsedRecord) -> Result<()> {
        self.write_bytes(off, &rec.encode()?)
    }

    /// Flush written data to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.io().sync()
    }
}

impl Drop for Ntdb {
    fn drop(&mut self) {
        if let Err(e) = self.release_locks() {
            warn!("releasing locks on close: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_database_has_free_tables() {
        let mut config = Config::new();
        config.set_free_tables(4).unwrap();
        let db = config.open_internal().unwrap();
        assert_eq!(db.free_table_count(), 4);
        assert!(db.current_free_table() < 4);
        assert!(db.flags().contains(OpenFlags::NOLOCK));
        assert!(db.map_size() > 0);
    }

    #[test]
    fn config_rejects_bad_values() {
        let mut config = Config::new();
        assert!(config.set_free_tables(0).is_err());
        assert!(config.set_free_tables(MAX_FREE_TABLES + 1).is_err());
        assert!(config.set_hash_bits(0).is_err());
        assert!(config.set_hash_bits(MAX_HASH_BITS + 1).is_err());
    }

    #[test]
    fn reopen_reads_existing_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layout.ntdb");
        let mut config = Config::new();
        config.set_free_tables(3).unwrap();
        config.set_hash_bits(6).unwrap();
        let size = {
            let db = config.open(&path).unwrap();
            db.map_size()
        };

        // Defaults differ, but the file decides.
        let db = Ntdb::open(&path, OpenFlags::empty()).unwrap();
        assert_eq!(db.free_table_count(), 3);
        assert_eq!(db.hash_bits(), 6);
        assert_eq!(db.map_size(), size);
    }

    #[test]
    fn handles_on_one_file_share_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.ntdb");
        let a = Ntdb::open(&path, OpenFlags::empty()).unwrap();
        let b = Ntdb::open(&path, OpenFlags::empty()).unwrap();
        assert!(Arc::ptr_eq(&a.file, &b.file));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn writable_open_refuses_shared_read_only_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modes.ntdb");
        drop(Ntdb::open(&path, OpenFlags::empty()).unwrap());

        let reader = Ntdb::open(&path, OpenFlags::RDONLY).unwrap();
        assert!(matches!(Ntdb::open(&path, OpenFlags::empty()), Err(Error::Invalid(_))));
        // Another reader is fine.
        let second = Ntdb::open(&path, OpenFlags::RDONLY).unwrap();
        assert!(Arc::ptr_eq(&reader.file, &second.file));
        drop((reader, second));

        // Once the read-only descriptor is gone, a writer opens its own.
        let writer = Ntdb::open(&path, OpenFlags::empty()).unwrap();
        assert!(writer.file.writable);
        let off = writer.allocate(0, 8, false).unwrap();
        writer.free_record(off, LockFlags::WAIT, false).unwrap();

        // A reader may share a writable descriptor.
        let reader = Ntdb::open(&path, OpenFlags::RDONLY).unwrap();
        assert!(Arc::ptr_eq(&reader.file, &writer.file));
    }

    #[test]
    fn foreign_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage");
        std::fs::write(&path, vec![0xAAu8; 4096]).unwrap();
        assert!(matches!(Ntdb::open(&path, OpenFlags::empty()), Err(Error::Invalid(_))));
    }
}
