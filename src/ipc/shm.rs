//! SysV shared-memory region used as the transport medium.
//!
//! Layout: `[u32 LE payload length][payload bytes ...]`. The key is derived
//! once with `ftok` and never changes; the id changes whenever the region is
//! grown, so every peer caches the id and re-resolves it from the key when an
//! attach fails.
//!
//! The low-level functions operate on raw ids. [`SharedRegion`] wraps them
//! with the attach/detach discipline and stale-id recovery.

use std::ffi::CString;
use std::fmt;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::defaults::HEADER_BYTES;

/// Stable identifier of a region, derived from a path and a discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionKey(pub libc::key_t);

/// Current OS handle of a region's allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionId(pub i32);

impl fmt::Display for RegionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised by the shared-memory region.
#[derive(Error, Debug)]
pub enum RegionError {
    #[error("could not derive region key from {path:?}: {source}")]
    Key {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not create region for key {key}: {source}")]
    Create {
        key: RegionKey,
        #[source]
        source: io::Error,
    },

    #[error("no region registered for key {key}: {source}")]
    Lookup {
        key: RegionKey,
        #[source]
        source: io::Error,
    },

    #[error("could not attach region {id}: {source}")]
    Attach {
        id: RegionId,
        #[source]
        source: io::Error,
    },

    #[error("could not detach region {id}: {source}")]
    Detach {
        id: RegionId,
        #[source]
        source: io::Error,
    },

    #[error("region for key {key} unavailable after re-resolving its id: {source}")]
    Unavailable {
        key: RegionKey,
        #[source]
        source: Box<RegionError>,
    },

    #[error("could not grow region {id} (old region destroyed: {destroyed}): {source}")]
    Grow {
        id: RegionId,
        destroyed: bool,
        #[source]
        source: io::Error,
    },

    #[error("could not destroy region {id}: {source}")]
    Destroy {
        id: RegionId,
        #[source]
        source: io::Error,
    },

    #[error("could not query region {id}: {source}")]
    Stat {
        id: RegionId,
        #[source]
        source: io::Error,
    },

    #[error("payload of {len} bytes exceeds region capacity of {capacity} bytes")]
    PayloadTooLarge { len: usize, capacity: usize },

    #[error("region header claims {len} bytes but capacity is {capacity} bytes")]
    CorruptHeader { len: usize, capacity: usize },
}

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

/// Derive the stable key for `(path, discriminant)`. `path` must exist.
pub fn derive_key(path: &Path, discriminant: i32) -> Result<RegionKey, RegionError> {
    let to_key_error = |source| RegionError::Key {
        path: path.to_path_buf(),
        source,
    };
    let name = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| to_key_error(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

    let key = unsafe { libc::ftok(name.as_ptr(), discriminant) };
    if key == -1 {
        return Err(to_key_error(io::Error::last_os_error()));
    }
    Ok(RegionKey(key))
}

fn shmget_create(key: RegionKey, size: usize) -> io::Result<RegionId> {
    let total = size
        .checked_add(HEADER_BYTES)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "region size overflow"))?;
    let id = unsafe { libc::shmget(key.0, total, 0o666 | libc::IPC_CREAT) };
    if id == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(RegionId(id))
}

/// Derive the key and allocate a region holding up to `size` payload bytes.
///
/// An existing region under the same key is reused when large enough. One
/// that is too small is left over from an earlier session and gets replaced.
pub fn create(
    path: &Path,
    discriminant: i32,
    size: usize,
) -> Result<(RegionKey, RegionId), RegionError> {
    let key = derive_key(path, discriminant)?;

    let id = match shmget_create(key, size) {
        Ok(id) => id,
        Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
            log::debug!("Replacing undersized region left under key {}", key);
            let stale = lookup(key)?;
            destroy(stale)?;
            shmget_create(key, size).map_err(|source| RegionError::Create { key, source })?
        }
        Err(source) => return Err(RegionError::Create { key, source }),
    };

    Ok((key, id))
}

/// Resolve the current id registered for `key`.
pub fn lookup(key: RegionKey) -> Result<RegionId, RegionError> {
    let id = unsafe { libc::shmget(key.0, 0, 0) };
    if id == -1 {
        return Err(RegionError::Lookup {
            key,
            source: io::Error::last_os_error(),
        });
    }
    Ok(RegionId(id))
}

fn segment_size(id: RegionId) -> Result<usize, RegionError> {
    let mut info: libc::shmid_ds = unsafe { std::mem::zeroed() };
    if unsafe { libc::shmctl(id.0, libc::IPC_STAT, &mut info) } == -1 {
        return Err(RegionError::Stat {
            id,
            source: io::Error::last_os_error(),
        });
    }
    Ok(info.shm_segsz as usize)
}

/// Usable payload size of the region (segment size minus header).
pub fn capacity(id: RegionId) -> Result<usize, RegionError> {
    Ok(segment_size(id)?.saturating_sub(HEADER_BYTES))
}

/// Attach, write the length header and `bytes`, detach.
pub fn write(id: RegionId, bytes: &[u8]) -> Result<(), RegionError> {
    let mut segment = Segment::attach(id)?;
    segment.write_payload(bytes)?;
    segment.detach()
}

/// Attach and keep the region attached; the caller detaches by dropping or
/// closing the returned segment.
pub fn read(id: RegionId) -> Result<Segment, RegionError> {
    let segment = Segment::attach(id)?;
    segment.payload()?;
    Ok(segment)
}

/// Release the region's system resources.
///
/// The segment disappears once the last attached process detaches.
pub fn destroy(id: RegionId) -> Result<(), RegionError> {
    if unsafe { libc::shmctl(id.0, libc::IPC_RMID, std::ptr::null_mut()) } == -1 {
        return Err(RegionError::Destroy {
            id,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Destroy the region at `old_id` and create a larger one under the same key.
///
/// If destruction fails, the old region is untouched and its id still valid.
pub fn grow(key: RegionKey, old_id: RegionId, new_size: usize) -> Result<RegionId, RegionError> {
    if let Err(err) = destroy(old_id) {
        let source = match err {
            RegionError::Destroy { source, .. } => source,
            other => io::Error::other(other.to_string()),
        };
        return Err(RegionError::Grow {
            id: old_id,
            destroyed: false,
            source,
        });
    }

    shmget_create(key, new_size).map_err(|source| RegionError::Grow {
        id: old_id,
        destroyed: true,
        source,
    })
}

// ---------------------------------------------------------------------------
// Attached segment
// ---------------------------------------------------------------------------

/// A region mapped into this process. Detaches on drop.
pub struct Segment {
    addr: NonNull<u8>,
    size: usize,
    id: RegionId,
    attached: bool,
}

impl Segment {
    /// Map region `id` into this process.
    pub fn attach(id: RegionId) -> Result<Self, RegionError> {
        let ptr = unsafe { libc::shmat(id.0, std::ptr::null(), 0) };
        if ptr as isize == -1 {
            return Err(RegionError::Attach {
                id,
                source: io::Error::last_os_error(),
            });
        }
        let addr = NonNull::new(ptr as *mut u8).ok_or_else(|| RegionError::Attach {
            id,
            source: io::Error::other("shmat returned a null mapping"),
        })?;

        let mut segment = Self {
            addr,
            size: 0,
            id,
            attached: true,
        };

        // The mapping may not be touched beyond its real size; learn it first.
        segment.size = segment_size(id)?;
        if segment.size < HEADER_BYTES {
            return Err(RegionError::Attach {
                id,
                source: io::Error::new(io::ErrorKind::InvalidData, "segment smaller than header"),
            });
        }

        Ok(segment)
    }

    pub fn id(&self) -> RegionId {
        self.id
    }

    /// Usable payload size of this mapping.
    pub fn capacity(&self) -> usize {
        self.size - HEADER_BYTES
    }

    /// Length stored in the header, unchecked against capacity.
    pub fn header_len(&self) -> usize {
        let mut header = [0u8; HEADER_BYTES];
        unsafe {
            std::ptr::copy_nonoverlapping(self.addr.as_ptr(), header.as_mut_ptr(), HEADER_BYTES);
        }
        u32::from_le_bytes(header) as usize
    }

    /// View over the payload bytes the header announces.
    pub fn payload(&self) -> Result<&[u8], RegionError> {
        let len = self.header_len();
        if len > self.capacity() {
            return Err(RegionError::CorruptHeader {
                len,
                capacity: self.capacity(),
            });
        }
        // SAFETY: the mapping is `size` bytes long and `HEADER_BYTES + len <= size`.
        // Peers only mutate the region while it is their turn in the cycle.
        Ok(unsafe { std::slice::from_raw_parts(self.addr.as_ptr().add(HEADER_BYTES), len) })
    }

    /// Overwrite the header and payload in place.
    pub fn write_payload(&mut self, bytes: &[u8]) -> Result<(), RegionError> {
        let capacity = self.capacity();
        let len = u32::try_from(bytes.len())
            .ok()
            .filter(|&len| len as usize <= capacity)
            .ok_or(RegionError::PayloadTooLarge {
                len: bytes.len(),
                capacity,
            })?;

        unsafe {
            let base = self.addr.as_ptr();
            std::ptr::copy_nonoverlapping(len.to_le_bytes().as_ptr(), base, HEADER_BYTES);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(HEADER_BYTES), bytes.len());
        }
        Ok(())
    }

    #[cfg(test)]
    fn write_header(&mut self, len: u32) {
        unsafe {
            std::ptr::copy_nonoverlapping(len.to_le_bytes().as_ptr(), self.addr.as_ptr(), HEADER_BYTES);
        }
    }

    fn release(&mut self) -> io::Result<()> {
        if !self.attached {
            return Ok(());
        }
        self.attached = false;
        if unsafe { libc::shmdt(self.addr.as_ptr() as *const libc::c_void) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Detach now, reporting failure instead of swallowing it in `Drop`.
    pub fn detach(mut self) -> Result<(), RegionError> {
        let id = self.id;
        self.release()
            .map_err(|source| RegionError::Detach { id, source })
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("Failed to detach region {}: {}", self.id, e);
        }
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("size", &self.size)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Region handle with stale-id recovery
// ---------------------------------------------------------------------------

/// Where a [`SharedRegion`] handle stands with respect to its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    /// Id believed valid, nothing mapped.
    Detached(RegionId),
    /// Id mapped by a live [`Attachment`].
    Attached(RegionId),
    /// Last id is known dead; only the key remains.
    Invalid,
}

impl fmt::Display for RegionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Detached(id) => write!(f, "DETACHED({})", id),
            Self::Attached(id) => write!(f, "ATTACHED({})", id),
            Self::Invalid => write!(f, "INVALID"),
        }
    }
}

/// One peer's handle to the session region.
///
/// An attach that fails is treated as a stale id: the id is re-resolved from
/// the key and the attach retried exactly once.
#[derive(Debug)]
pub struct SharedRegion {
    key: RegionKey,
    state: RegionState,
}

impl SharedRegion {
    /// Create (or reuse) the region for `(path, discriminant)`.
    pub fn create(path: &Path, discriminant: i32, size: usize) -> Result<Self, RegionError> {
        let (key, id) = create(path, discriminant, size)?;
        log::debug!("Created region key={} id={} capacity={}", key, id, size);
        Ok(Self::open(key, id))
    }

    /// Adopt a region created by the peer.
    pub fn open(key: RegionKey, id: RegionId) -> Self {
        Self {
            key,
            state: RegionState::Detached(id),
        }
    }

    /// Adopt a region knowing only its key.
    pub fn open_by_key(key: RegionKey) -> Result<Self, RegionError> {
        let id = lookup(key)?;
        Ok(Self::open(key, id))
    }

    pub fn key(&self) -> RegionKey {
        self.key
    }

    pub fn state(&self) -> RegionState {
        self.state
    }

    /// Cached id, if the handle is not invalid.
    pub fn id(&self) -> Option<RegionId> {
        match self.state {
            RegionState::Detached(id) | RegionState::Attached(id) => Some(id),
            RegionState::Invalid => None,
        }
    }

    /// Re-resolve the id from the key.
    pub fn refresh(&mut self) -> Result<RegionId, RegionError> {
        match lookup(self.key) {
            Ok(id) => {
                self.state = RegionState::Detached(id);
                Ok(id)
            }
            Err(e) => {
                self.state = RegionState::Invalid;
                Err(e)
            }
        }
    }

    /// Map the region, recovering from a stale id once.
    pub fn attach(&mut self) -> Result<Attachment<'_>, RegionError> {
        let first = match self.id() {
            Some(id) => Segment::attach(id),
            None => Err(RegionError::Lookup {
                key: self.key,
                source: io::Error::from(io::ErrorKind::NotFound),
            }),
        };

        let segment = match first {
            Ok(segment) => segment,
            Err(err) => {
                log::debug!("Attach failed ({}); re-resolving id for key {}", err, self.key);
                let key = self.key;
                let unavailable = |source| RegionError::Unavailable {
                    key,
                    source: Box::new(source),
                };
                let id = self.refresh().map_err(unavailable)?;
                match Segment::attach(id) {
                    Ok(segment) => segment,
                    Err(err) => {
                        self.state = RegionState::Invalid;
                        return Err(unavailable(err));
                    }
                }
            }
        };

        self.state = RegionState::Attached(segment.id());
        Ok(Attachment {
            segment,
            state: &mut self.state,
        })
    }

    /// Attach and validate the header. The payload stays mapped until the
    /// returned attachment is closed or dropped.
    pub fn read(&mut self) -> Result<Attachment<'_>, RegionError> {
        let attachment = self.attach()?;
        attachment.payload()?;
        Ok(attachment)
    }

    /// Attach, write `bytes`, detach.
    ///
    /// `bytes` must fit the current capacity; this handle never grows the
    /// region on its own.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), RegionError> {
        let mut attachment = self.attach()?;
        attachment.write_in_place(bytes)?;
        attachment.close()
    }

    /// Replace the region with one holding `new_size` payload bytes.
    ///
    /// Any attachment must be gone (the borrow checker enforces it for this
    /// handle; the peer must have detached by protocol).
    pub fn grow(&mut self, new_size: usize) -> Result<RegionId, RegionError> {
        let old_id = match self.id() {
            Some(id) => id,
            None => self.refresh()?,
        };

        match grow(self.key, old_id, new_size) {
            Ok(new_id) => {
                log::info!(
                    "Grew region key={} from id {} to id {} ({} bytes)",
                    self.key,
                    old_id,
                    new_id,
                    new_size
                );
                self.state = RegionState::Detached(new_id);
                Ok(new_id)
            }
            Err(err) => {
                if matches!(err, RegionError::Grow { destroyed: true, .. }) {
                    self.state = RegionState::Invalid;
                }
                Err(err)
            }
        }
    }

    /// Current usable payload size.
    pub fn capacity(&mut self) -> Result<usize, RegionError> {
        if let Some(id) = self.id() {
            if let Ok(capacity) = capacity(id) {
                return Ok(capacity);
            }
        }
        let id = self.refresh()?;
        capacity(id)
    }

    /// Remove the region from the system.
    pub fn destroy(self) -> Result<(), RegionError> {
        let id = match self.id() {
            Some(id) => id,
            None => lookup(self.key)?,
        };
        destroy(id)
    }
}

/// A live mapping obtained through [`SharedRegion::attach`].
///
/// While it exists the handle reports [`RegionState::Attached`]; dropping or
/// closing it detaches and returns the handle to `Detached`.
#[derive(Debug)]
pub struct Attachment<'a> {
    segment: Segment,
    state: &'a mut RegionState,
}

impl Attachment<'_> {
    pub fn id(&self) -> RegionId {
        self.segment.id()
    }

    pub fn capacity(&self) -> usize {
        self.segment.capacity()
    }

    pub fn payload(&self) -> Result<&[u8], RegionError> {
        self.segment.payload()
    }

    /// Overwrite header and payload through this mapping.
    pub fn write_in_place(&mut self, bytes: &[u8]) -> Result<(), RegionError> {
        self.segment.write_payload(bytes)
    }

    /// Detach, reporting failure.
    pub fn close(mut self) -> Result<(), RegionError> {
        let id = self.segment.id();
        self.segment
            .release()
            .map_err(|source| RegionError::Detach { id, source })
    }
}

impl Drop for Attachment<'_> {
    fn drop(&mut self) {
        *self.state = RegionState::Detached(self.segment.id());
    }
}
