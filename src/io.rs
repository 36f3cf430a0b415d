//! Byte-level access to the backing store.
//!
//! The file is normally memory mapped; `NOMMAP` falls back to positional
//! reads and writes, and `INTERNAL` databases live in a plain buffer. All
//! access is by copy so nothing keeps a reference into the mapping across a
//! remap.

use std::fs::File;
use std::os::unix::fs::FileExt;

use log::debug;
use memmap2::{MmapMut, MmapOptions};

use crate::error::{Error, Result};

#[derive(Debug)]
pub(crate) enum Backing {
    Memory(Vec<u8>),
    Mapped {
        file: File,
        map: Option<MmapMut>,
        size: u64,
    },
    Direct {
        file: File,
        size: u64,
    },
}

impl Backing {
    pub(crate) fn mapped(file: File) -> Result<Self> {
        let mut backing = Backing::Mapped {
            file,
            map: None,
            size: 0,
        };
        backing.refresh()?;
        Ok(backing)
    }

    pub(crate) fn direct(file: File) -> Result<Self> {
        let size = file.metadata()?.len();
        Ok(Backing::Direct { file, size })
    }

    pub(crate) fn file(&self) -> Option<&File> {
        match self {
            Backing::Memory(_) => None,
            Backing::Mapped { file, .. } | Backing::Direct { file, .. } => Some(file),
        }
    }

    /// Size as currently seen by this process.
    pub(crate) fn size(&self) -> u64 {
        match self {
            Backing::Memory(buf) => buf.len() as u64,
            Backing::Mapped { size, .. } | Backing::Direct { size, .. } => *size,
        }
    }

    /// Pick up growth done by another process. Returns true if the size changed.
    pub(crate) fn refresh(&mut self) -> Result<bool> {
        match self {
            Backing::Memory(_) => Ok(false),
            Backing::Direct { file, size } => {
                let len = file.metadata()?.len();
                let changed = len != *size;
                *size = len;
                Ok(changed)
            }
            Backing::Mapped { file, map, size } => {
                let len = file.metadata()?.len();
                if len == *size && (map.is_some() || len == 0) {
                    return Ok(false);
                }
                *map = if len == 0 {
                    None
                } else {
                    let len = usize::try_from(len)
                        .map_err(|_| Error::Invalid(format!("file of {} bytes cannot be mapped", len)))?;
                    // SAFETY: the file stays open for the life of the mapping and every
                    // access goes through bounds-checked copies.
                    Some(unsafe { MmapOptions::new().len(len).map_mut(&*file)? })
                };
                debug!("remapped database: {} -> {} bytes", size, len);
                let changed = len != *size;
                *size = len;
                Ok(changed)
            }
        }
    }

    fn check_bounds(&mut self, off: u64, len: usize) -> Result<()> {
        let end = off
            .checked_add(len as u64)
            .ok_or_else(|| Error::corrupt(format!("access at {} overflows", off)))?;
        if end <= self.size() {
            return Ok(());
        }
        self.refresh()?;
        if end > self.size() {
            return Err(Error::corrupt(format!(
                "access {}+{} beyond end of file {}",
                off,
                len,
                self.size()
            )));
        }
        Ok(())
    }

    pub(crate) fn read(&mut self, off: u64, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(off, buf.len())?;
        let start = off as usize;
        match self {
            Backing::Memory(mem) => buf.copy_from_slice(&mem[start..start + buf.len()]),
            Backing::Mapped { map: Some(map), .. } => {
                buf.copy_from_slice(&map[start..start + buf.len()])
            }
            Backing::Mapped { map: None, .. } => {}
            Backing::Direct { file, .. } => file.read_exact_at(buf, off)?,
        }
        Ok(())
    }

    pub(crate) fn write(&mut self, off: u64, data: &[u8]) -> Result<()> {
        self.check_bounds(off, data.len())?;
        let start = off as usize;
        match self {
            Backing::Memory(mem) => mem[start..start + data.len()].copy_from_slice(data),
            Backing::Mapped { map: Some(map), .. } => {
                map[start..start + data.len()].copy_from_slice(data)
            }
            Backing::Mapped { map: None, .. } => {}
            Backing::Direct { file, .. } => file.write_all_at(data, off)?,
        }
        Ok(())
    }

    /// Grow the store to `new_size` bytes. New space reads as zeroes.
    pub(crate) fn grow(&mut self, new_size: u64) -> Result<()> {
        if new_size <= self.size() {
            return Ok(());
        }
        match self {
            Backing::Memory(mem) => {
                let len = usize::try_from(new_size)
                    .map_err(|_| Error::Invalid(format!("cannot hold {} bytes in memory", new_size)))?;
                mem.resize(len, 0);
            }
            Backing::Mapped { file, .. } => {
                file.set_len(new_size)?;
                self.refresh()?;
            }
            Backing::Direct { file, size } => {
                file.set_len(new_size)?;
                *size = new_size;
            }
        }
        Ok(())
    }

    pub(crate) fn sync(&self) -> Result<()> {
        match self {
            Backing::Memory(_) => {}
            Backing::Mapped { map: Some(map), .. } => map.flush()?,
            Backing::Mapped { file, .. } | Backing::Direct { file, .. } => file.sync_data()?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    fn temp_file(dir: &tempfile::TempDir) -> File {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.path().join("io.ntdb"))
            .unwrap()
    }

    #[test]
    fn memory_grows_zeroed() {
        let mut io = Backing::Memory(vec![1; 16]);
        io.grow(32).unwrap();
        let mut buf = [9u8; 16];
        io.read(16, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);
        assert!(io.read(24, &mut buf).unwrap_err().is_corrupt());
    }

    #[test]
    fn mapped_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut io = Backing::mapped(temp_file(&dir)).unwrap();
        assert_eq!(io.size(), 0);
        io.grow(4096).unwrap();
        io.write(100, b"hello").unwrap();
        let mut buf = [0u8; 5];
        io.read(100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn mapped_sees_growth_from_elsewhere() {
        let dir = tempfile::tempdir().unwrap();
        let mut io = Backing::mapped(temp_file(&dir)).unwrap();
        io.grow(4096).unwrap();

        let other = temp_file(&dir);
        other.set_len(8192).unwrap();
        other.write_all_at(b"x", 8000).unwrap();

        let mut buf = [0u8; 1];
        io.read(8000, &mut buf).unwrap();
        assert_eq!(&buf, b"x");
        assert_eq!(io.size(), 8192);
    }

    #[test]
    fn direct_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut io = Backing::direct(temp_file(&dir)).unwrap();
        io.grow(64).unwrap();
        io.write(8, &7u64.to_le_bytes()).unwrap();
        let mut buf = [0u8; 8];
        io.read(8, &mut buf).unwrap();
        assert_eq!(u64::from_le_bytes(buf), 7);
    }
}
