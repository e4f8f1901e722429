//! Block storage behind the buffer pool.
//!
//! A space is a named byte-addressable keyspace; the buffer pool reads and
//! writes whole pages at byte addresses inside it.

use crate::Result;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

pub trait SpaceManager: Send + Sync {
    /// Fills `buf` from `address` in `space`. Bytes past the end of the
    /// space read as zero. Returns the number of bytes that came from
    /// storage.
    fn read(&self, space: &str, address: u64, buf: &mut [u8]) -> Result<usize>;

    /// Writes all of `buf` at `address`, growing the space if needed.
    fn write(&self, space: &str, address: u64, buf: &[u8]) -> Result<usize>;

    /// Makes earlier writes to `space` durable.
    fn sync(&self, _space: &str) -> Result<()> {
        Ok(())
    }
}

/// Maps each space to a file. Space names are file paths, optionally
/// resolved against a base directory.
pub struct FileSpaceManager {
    base_dir: Option<PathBuf>,
    /// Open file handles keyed by space name.
    files: Mutex<HashMap<String, File>>,
}

impl FileSpaceManager {
    pub fn new() -> Self {
        Self {
            base_dir: None,
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
            files: Mutex::new(HashMap::new()),
        }
    }

    fn file_path(&self, space: &str) -> PathBuf {
        match &self.base_dir {
            Some(dir) => dir.join(space),
            None => PathBuf::from(space),
        }
    }

    fn with_file<T>(&self, space: &str, f: impl FnOnce(&mut File) -> Result<T>) -> Result<T> {
        let mut files = self.files.lock();

        let file = match files.entry(space.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let path = self.file_path(space);
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)?;
                log::debug!("opened space {} at {}", space, path.display());
                entry.insert(file)
            }
        };
        f(file)
    }
}

impl Default for FileSpaceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SpaceManager for FileSpaceManager {
    fn read(&self, space: &str, address: u64, buf: &mut [u8]) -> Result<usize> {
        self.with_file(space, |file| {
            file.seek(SeekFrom::Start(address))?;

            let mut filled = 0;
            while filled < buf.len() {
                match file.read(&mut buf[filled..]) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            buf[filled..].fill(0);

            log::trace!("space {}: read {} bytes at {}", space, filled, address);
            Ok(filled)
        })
    }

    fn write(&self, space: &str, address: u64, buf: &[u8]) -> Result<usize> {
        self.with_file(space, |file| {
            file.seek(SeekFrom::Start(address))?;
            file.write_all(buf)?;
            log::trace!("space {}: wrote {} bytes at {}", space, buf.len(), address);
            Ok(buf.len())
        })
    }

    fn sync(&self, space: &str) -> Result<()> {
        self.with_file(space, |file| {
            file.sync_all()?;
            Ok(())
        })
    }
}

/// Volatile spaces kept in memory. Counts writes, which makes it handy for
/// observing buffer pool write-back.
#[derive(Default)]
pub struct MemorySpaceManager {
    spaces: Mutex<HashMap<String, Vec<u8>>>,
    writes: AtomicUsize,
}

impl MemorySpaceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `write` calls served so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }
}

impl SpaceManager for MemorySpaceManager {
    fn read(&self, space: &str, address: u64, buf: &mut [u8]) -> Result<usize> {
        let spaces = self.spaces.lock();
        let data = spaces.get(space).map(Vec::as_slice).unwrap_or(&[]);

        let start = (address as usize).min(data.len());
        let end = (start + buf.len()).min(data.len());
        let filled = end - start;
        buf[..filled].copy_from_slice(&data[start..end]);
        buf[filled..].fill(0);
        Ok(filled)
    }

    fn write(&self, space: &str, address: u64, buf: &[u8]) -> Result<usize> {
        let mut spaces = self.spaces.lock();
        let data = spaces.entry(space.to_string()).or_default();

        let start = address as usize;
        if data.len() < start + buf.len() {
            data.resize(start + buf.len(), 0);
        }
        data[start..start + buf.len()].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(buf.len())
    }
}
