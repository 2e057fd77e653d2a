//! # Durable Regions
//!
//! A [`Region`] owns one file mapped read/write into memory. It is the only
//! place in the crate that touches raw pointers: every other module goes
//! through the bounds-checked accessors below.
//!
//! ## Durability
//!
//! Writes become visible to other threads immediately but are only
//! guaranteed to survive a crash after [`Region::flush`] returned for a
//! range covering them. Flushing a range that fits into one cache line is
//! treated as atomic by the protocols built on top; longer ranges can be
//! torn by a crash.
//!
//! ## Exclusivity
//!
//! The backing file is locked with `flock(LOCK_EX)` for the lifetime of the
//! region, so a second holder of the same file fails to open instead of
//! silently aliasing it.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64};

use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, error};

use crate::error::{Result, RuntimeError};
use crate::layout::page_size;

/// A memory-mapped, file-backed byte region.
pub struct Region {
    /// Keeps the mapping alive; unmapped on drop.
    mmap: MmapMut,
    /// Start of the mapping. Stable for the lifetime of `mmap`.
    base: *mut u8,
    /// Mapped length in bytes.
    len: u64,
    /// Locked backing file.
    file: File,
    /// Path of the backing file.
    path: PathBuf,
}

// SAFETY: the mapping is owned by `mmap` and outlives every pointer derived
// from `base`. Shared writes go through `&self` on purpose: non-atomic byte
// writes to overlapping ranges must be serialised by the caller (the
// allocator holds its mutex, the CAS path uses the atomic views).
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Create (or recreate) the file at `path` with `size` zero bytes and map it.
    pub fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if size == 0 {
            return Err(RuntimeError::InvalidConfig(format!(
                "region {} must not be empty",
                path.display()
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| RuntimeError::io(&path, e))?;
        lock_exclusive(&file, &path)?;

        // Truncate only once the lock is held, so a live holder is never
        // pulled out from under its mapping.
        file.set_len(0).map_err(|e| RuntimeError::io(&path, e))?;
        file.set_len(size).map_err(|e| RuntimeError::io(&path, e))?;

        let region = Self::map(file, path, size)?;
        debug!(
            path = %region.path.display(),
            size,
            pages = size.div_ceil(page_size() as u64),
            "created region"
        );
        Ok(region)
    }

    /// Open an existing file at `path` and map its first `size` bytes.
    pub fn open(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| RuntimeError::io(&path, e))?;
        lock_exclusive(&file, &path)?;

        let actual = file
            .metadata()
            .map_err(|e| RuntimeError::io(&path, e))?
            .len();
        if actual < size {
            return Err(RuntimeError::InvalidConfig(format!(
                "{} holds {} bytes, expected at least {}",
                path.display(),
                actual,
                size
            )));
        }

        let region = Self::map(file, path, size)?;
        debug!(path = %region.path.display(), size, "opened region");
        Ok(region)
    }

    /// Open when `create` is false, otherwise create.
    pub fn open_or_create(path: impl AsRef<Path>, size: u64, create: bool) -> Result<Self> {
        if create {
            Self::create(path, size)
        } else {
            Self::open(path, size)
        }
    }

    fn map(file: File, path: PathBuf, size: u64) -> Result<Self> {
        let len = usize::try_from(size)
            .map_err(|_| RuntimeError::InvalidConfig(format!("region size {size} too large")))?;
        // SAFETY: the file is locked exclusively, so no other holder resizes
        // or remaps it while the mapping exists.
        let mut mmap = unsafe {
            MmapOptions::new()
                .len(len)
                .map_mut(&file)
                .map_err(|e| RuntimeError::io(&path, e))?
        };
        let base = mmap.as_mut_ptr();
        Ok(Self {
            mmap,
            base,
            len: size,
            file,
            path,
        })
    }

    /// Size of the region in bytes.
    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the region has zero length.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Validate `[offset, offset + len)` and return `offset` as a native index.
    fn check(&self, offset: u64, len: u64) -> Result<usize> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(offset as usize),
            _ => Err(RuntimeError::OutOfBounds {
                offset,
                len,
                size: self.len,
            }),
        }
    }

    /// Copy `buf.len()` bytes starting at `offset` into `buf`.
    pub fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = self.check(offset, buf.len() as u64)?;
        // SAFETY: bounds checked above; `buf` is a distinct allocation.
        unsafe { ptr::copy_nonoverlapping(self.base.add(start), buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    /// Read `len` bytes starting at `offset`.
    pub fn read_bytes(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_into(offset, &mut buf)?;
        Ok(buf)
    }

    /// Read one byte.
    pub fn read_u8(&self, offset: u64) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_into(offset, &mut buf)?;
        Ok(buf[0])
    }

    /// Read a little-endian `u16`.
    pub fn read_u16(&self, offset: u64) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_into(offset, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Read a little-endian `u64` with a plain (non-atomic) load.
    pub fn read_u64(&self, offset: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_into(offset, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Write `data` starting at `offset`. Not durable until flushed.
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let start = self.check(offset, data.len() as u64)?;
        // SAFETY: bounds checked above; `data` cannot alias the mapping
        // because no slice of the mapping is ever handed out.
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), self.base.add(start), data.len()) };
        Ok(())
    }

    /// Write one byte.
    pub fn write_u8(&self, offset: u64, value: u8) -> Result<()> {
        self.write_bytes(offset, &[value])
    }

    /// Write a little-endian `u16`.
    pub fn write_u16(&self, offset: u64, value: u16) -> Result<()> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    /// Write a little-endian `u64` with a plain (non-atomic) store.
    pub fn write_u64(&self, offset: u64, value: u64) -> Result<()> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    /// Atomic view of the 8 bytes at `offset`.
    pub fn atomic_u64(&self, offset: u64) -> Result<&AtomicU64> {
        let start = self.check_aligned(offset, 8)?;
        // SAFETY: in bounds, 8-byte aligned (the mapping is page aligned),
        // and valid for the lifetime of `&self`.
        Ok(unsafe { &*(self.base.add(start) as *const AtomicU64) })
    }

    /// Atomic view of the 4 bytes at `offset`.
    pub fn atomic_u32(&self, offset: u64) -> Result<&AtomicU32> {
        let start = self.check_aligned(offset, 4)?;
        // SAFETY: as for `atomic_u64`, with 4-byte alignment.
        Ok(unsafe { &*(self.base.add(start) as *const AtomicU32) })
    }

    fn check_aligned(&self, offset: u64, width: u64) -> Result<usize> {
        let start = self.check(offset, width)?;
        if (self.base as usize + start) % width as usize != 0 {
            return Err(RuntimeError::MisalignedRegister {
                offset,
                align: width,
            });
        }
        Ok(start)
    }

    /// Make every write in `[offset, offset + len)` durable.
    pub fn flush(&self, offset: u64, len: u64) -> Result<()> {
        let start = self.check(offset, len)?;
        if len == 0 {
            return Ok(());
        }
        self.mmap
            .flush_range(start, len as usize)
            .map_err(|e| RuntimeError::io(&self.path, e))
    }

    /// Make the whole region durable.
    pub fn flush_all(&self) -> Result<()> {
        self.mmap.flush().map_err(|e| RuntimeError::io(&self.path, e))
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // The mapping itself is released by `MmapMut`; only the lock needs
        // explicit handling. Never panic here.
        // SAFETY: the descriptor is owned by `self.file` and still open.
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            error!(
                path = %self.path.display(),
                error = %std::io::Error::last_os_error(),
                "failed to unlock region file"
            );
        }
    }
}

fn lock_exclusive(file: &File, path: &Path) -> Result<()> {
    // SAFETY: the descriptor is valid for the duration of the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        return Err(RuntimeError::io(path, std::io::Error::last_os_error()));
    }
    Ok(())
}
