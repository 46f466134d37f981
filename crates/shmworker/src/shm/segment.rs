//! Named POSIX shared memory segments.

use std::ffi::CString;
use std::io;
use std::ptr::NonNull;

use rustix::fd::OwnedFd;
use rustix::fs::{fstat, ftruncate};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::shm::{Mode, ShmOFlags, shm_open, shm_unlink};

use super::{Result, ShmError};

const SHM_PREFIX: &str = "/shmworker_";
const MAX_NAME_LEN: usize = 255 - SHM_PREFIX.len();

/// A mapped, named shared memory segment.
///
/// The segment can grow after creation. Either side may call [`resize`]
/// and the other side picks the new length up with [`refresh`].
///
/// [`resize`]: ShmSegment::resize
/// [`refresh`]: ShmSegment::refresh
pub struct ShmSegment {
    fd: OwnedFd,
    addr: NonNull<u8>,
    len: usize,
    name: String,
    is_owner: bool,
}

// SAFETY: the mapping is only touched through raw copies or atomics placed
// inside it; cross-party access is serialised by the caller.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Create a segment of `len` bytes, zero initialised.
    ///
    /// A stale segment left behind under the same name is reused and
    /// truncated to the requested length.
    pub fn create(name: &str, len: usize) -> Result<Self> {
        let c_name = shm_path(name)?;

        let fd = match shm_open(
            c_name.as_c_str(),
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        ) {
            Ok(fd) => fd,
            Err(_) => {
                tracing::debug!(name, "Reusing existing shared memory segment");
                shm_open(c_name.as_c_str(), ShmOFlags::RDWR, Mode::empty()).map_err(|e| {
                    ShmError::Create {
                        name: name.to_string(),
                        source: e.into(),
                    }
                })?
            }
        };

        let len = len.max(1);
        truncate(&fd, name, len)?;
        let addr = map(&fd, name, len)?;

        // SAFETY: `addr` points at a fresh mapping of exactly `len` bytes.
        unsafe {
            std::ptr::write_bytes(addr.as_ptr(), 0, len);
        }

        Ok(Self {
            fd,
            addr,
            len,
            name: name.to_string(),
            is_owner: true,
        })
    }

    /// Open a segment created by another party.
    pub fn open(name: &str) -> Result<Self> {
        let c_name = shm_path(name)?;

        let fd = shm_open(c_name.as_c_str(), ShmOFlags::RDWR, Mode::empty()).map_err(|e| {
            ShmError::Open {
                name: name.to_string(),
                source: e.into(),
            }
        })?;

        let len = current_len(&fd, name)?;
        if len == 0 {
            return Err(ShmError::Unsized {
                name: name.to_string(),
            });
        }
        let addr = map(&fd, name, len)?;

        Ok(Self {
            fd,
            addr,
            len,
            name: name.to_string(),
            is_owner: false,
        })
    }

    /// Resize the backing object to `len` bytes and remap it.
    pub fn resize(&mut self, len: usize) -> Result<()> {
        let len = len.max(1);
        truncate(&self.fd, &self.name, len)?;
        self.remap(len)
    }

    /// Remap if the other party resized the segment. Returns the current length.
    pub fn refresh(&mut self) -> Result<usize> {
        let len = current_len(&self.fd, &self.name)?;
        if len != self.len && len > 0 {
            self.remap(len)?;
        }
        Ok(self.len)
    }

    /// Copy `data` to the start of the segment and zero the remainder.
    ///
    /// Writes are clipped to the current mapping length.
    pub fn write_padded(&mut self, data: &[u8]) {
        let n = data.len().min(self.len);
        // SAFETY: both ranges lie inside the mapping and do not overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.addr.as_ptr(), n);
            std::ptr::write_bytes(self.addr.as_ptr().add(n), 0, self.len - n);
        }
    }

    /// Copy the whole mapping out.
    pub fn read_all(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len];
        // SAFETY: `out` has exactly `len` bytes and the mapping is `len` long.
        unsafe {
            std::ptr::copy_nonoverlapping(self.addr.as_ptr(), out.as_mut_ptr(), self.len);
        }
        out
    }

    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    #[inline(always)]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline(always)]
    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    fn remap(&mut self, len: usize) -> Result<()> {
        let addr = map(&self.fd, &self.name, len)?;
        // SAFETY: the old mapping is no longer referenced once replaced.
        unsafe {
            let _ = munmap(self.addr.as_ptr().cast(), self.len);
        }
        tracing::trace!(name = %self.name, old_len = self.len, new_len = len, "Remapped segment");
        self.addr = addr;
        self.len = len;
        Ok(())
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        // SAFETY: the mapping is owned by this handle.
        unsafe {
            let _ = munmap(self.addr.as_ptr().cast(), self.len);
        }

        if self.is_owner
            && let Ok(c_name) = CString::new(format!("{SHM_PREFIX}{}", self.name))
        {
            let _ = shm_unlink(c_name.as_c_str());
        }
    }
}

impl std::fmt::Debug for ShmSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmSegment")
            .field("name", &self.name)
            .field("len", &self.len)
            .field("is_owner", &self.is_owner)
            .finish()
    }
}

fn shm_path(name: &str) -> Result<CString> {
    if name.len() > MAX_NAME_LEN {
        return Err(ShmError::NameTooLong {
            max: MAX_NAME_LEN,
            got: name.len(),
        });
    }
    if name.is_empty() || name.contains('/') {
        return Err(ShmError::InvalidName {
            name: name.to_string(),
        });
    }
    CString::new(format!("{SHM_PREFIX}{name}")).map_err(|_| ShmError::InvalidName {
        name: name.to_string(),
    })
}

fn truncate(fd: &OwnedFd, name: &str, len: usize) -> Result<()> {
    ftruncate(fd, len as u64).map_err(|e| ShmError::Truncate {
        name: name.to_string(),
        len,
        source: e.into(),
    })
}

fn current_len(fd: &OwnedFd, name: &str) -> Result<usize> {
    let stat = fstat(fd).map_err(|e| ShmError::Open {
        name: name.to_string(),
        source: e.into(),
    })?;
    Ok(usize::try_from(stat.st_size).unwrap_or(0))
}

fn map(fd: &OwnedFd, name: &str, len: usize) -> Result<NonNull<u8>> {
    // SAFETY: a fresh shared mapping of an fd we hold open.
    let addr = unsafe {
        mmap(
            std::ptr::null_mut(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
        .map_err(|e| ShmError::Map {
            name: name.to_string(),
            source: e.into(),
        })?
    };

    NonNull::new(addr.cast::<u8>()).ok_or_else(|| ShmError::Map {
        name: name.to_string(),
        source: io::Error::other("mmap returned null"),
    })
}
