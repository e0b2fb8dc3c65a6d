//! Memory backing for the transport rings.
//!
//! A region is either private to the process (anonymous `mmap` or an aligned
//! heap block) or backed by a named file so that an engine process and its
//! host can map the same bytes. The unsafe surface stays inside this module
//! and the ring that lays its header over it.

use crate::{TransportError, TransportResult};
use std::alloc::{alloc, alloc_zeroed, dealloc, Layout};
#[cfg(not(target_arch = "wasm32"))]
use std::fs::{self, OpenOptions};
#[cfg(not(target_arch = "wasm32"))]
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};

/// Specifies how memory in a [`SharedRegion`] should be initialised.
#[derive(Clone, Copy, Debug)]
pub enum RegionInit {
    /// Zero the entire region after allocation.
    Zeroed,
    /// Leave the region uninitialised.
    Uninitialized,
}

#[derive(Debug)]
enum Backing {
    #[cfg(not(target_arch = "wasm32"))]
    Anonymous(memmap2::MmapMut),
    #[cfg(not(target_arch = "wasm32"))]
    File {
        map: memmap2::MmapMut,
        path: PathBuf,
        unlink_on_drop: bool,
    },
    Owned {
        ptr: NonNull<u8>,
        layout: Layout,
    },
}

impl Backing {
    fn as_ptr(&self) -> *mut u8 {
        match self {
            #[cfg(not(target_arch = "wasm32"))]
            Backing::Anonymous(map) => map.as_ptr() as *mut u8,
            #[cfg(not(target_arch = "wasm32"))]
            Backing::File { map, .. } => map.as_ptr() as *mut u8,
            Backing::Owned { ptr, .. } => ptr.as_ptr(),
        }
    }
}

/// Contiguous memory shared between the two ends of a ring.
///
/// Anonymous regions prefer `mmap` and fall back to the heap when the mapping
/// is not suitably aligned. Named regions are always file mappings and are
/// page aligned.
#[derive(Debug)]
pub struct SharedRegion {
    len: usize,
    alignment: usize,
    backing: Backing,
}

// SAFETY: the region owns its mapping or allocation outright. Concurrent access
// to the bytes is coordinated by the atomics stored inside the region itself.
unsafe impl Send for SharedRegion {}
// SAFETY: see above; `&SharedRegion` only hands out raw pointers.
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Allocates a new process-private region of `len` bytes aligned to `alignment`.
    pub fn new_aligned(len: usize, alignment: usize, init: RegionInit) -> TransportResult<Self> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(TransportError::AllocationFailed {
                size: len,
                alignment,
            });
        }

        #[cfg(not(target_arch = "wasm32"))]
        {
            if let Some(backing) = Self::mmap_backed(len, alignment, init)? {
                return Ok(Self {
                    len,
                    alignment,
                    backing,
                });
            }
        }

        Self::heap_backed(len, alignment, init)
    }

    /// Creates a zeroed, file-backed region at `path`.
    ///
    /// The file must not exist yet. It is removed again when the region is
    /// dropped.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn create_file(path: &Path, len: usize) -> TransportResult<Self> {
        let io_err = |op, source| TransportError::Io {
            op,
            path: path.to_path_buf(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| io_err("create", e))?;
        file.set_len(len as u64).map_err(|e| io_err("resize", e))?;
        // SAFETY: the file was just created by us and sized to `len`; peers only
        // touch it through the same ring protocol.
        let map = unsafe { memmap2::MmapMut::map_mut(&file) }.map_err(|e| io_err("map", e))?;
        Ok(Self {
            len,
            alignment: page_alignment(),
            backing: Backing::File {
                map,
                path: path.to_path_buf(),
                unlink_on_drop: true,
            },
        })
    }

    /// Maps an existing file-backed region created by another process.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn open_file(path: &Path) -> TransportResult<Self> {
        let io_err = |op, source| TransportError::Io {
            op,
            path: path.to_path_buf(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| io_err("open", e))?;
        let len = file.metadata().map_err(|e| io_err("stat", e))?.len() as usize;
        // SAFETY: the creator sized the file before publishing it under `path`.
        let map = unsafe { memmap2::MmapMut::map_mut(&file) }.map_err(|e| io_err("map", e))?;
        Ok(Self {
            len,
            alignment: page_alignment(),
            backing: Backing::File {
                map,
                path: path.to_path_buf(),
                unlink_on_drop: false,
            },
        })
    }

    /// Atomically moves a file-backed region to `target` so attachers never
    /// observe a half-initialised layout.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn publish(&mut self, target: &Path) -> TransportResult<()> {
        if let Backing::File { path, .. } = &mut self.backing {
            fs::rename(&*path, target).map_err(|source| TransportError::Io {
                op: "publish",
                path: target.to_path_buf(),
                source,
            })?;
            *path = target.to_path_buf();
        }
        Ok(())
    }

    /// Path of the backing file, if any.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::File { path, .. } => Some(path),
            _ => None,
        }
    }

    fn heap_backed(len: usize, alignment: usize, init: RegionInit) -> TransportResult<Self> {
        let layout = Layout::from_size_align(len, alignment).map_err(|_| {
            TransportError::AllocationFailed {
                size: len,
                alignment,
            }
        })?;

        let ptr = unsafe {
            match init {
                RegionInit::Zeroed => alloc_zeroed(layout),
                RegionInit::Uninitialized => alloc(layout),
            }
        };

        let ptr = NonNull::new(ptr).ok_or(TransportError::AllocationFailed {
            size: len,
            alignment,
        })?;
        Ok(Self {
            len,
            alignment,
            backing: Backing::Owned { ptr, layout },
        })
    }

    #[cfg(not(target_arch = "wasm32"))]
    fn mmap_backed(
        len: usize,
        alignment: usize,
        init: RegionInit,
    ) -> Result<Option<Backing>, TransportError> {
        let mut map = memmap2::MmapOptions::new()
            .len(len)
            .map_anon()
            .map_err(|_| TransportError::AllocationFailed {
                size: len,
                alignment,
            })?;

        let ptr = map.as_mut_ptr();
        if ptr as usize % alignment != 0 {
            return Ok(None);
        }

        if matches!(init, RegionInit::Zeroed) {
            unsafe {
                // SAFETY: the anonymous mapping exposes `len` bytes that can be zeroed here.
                ptr::write_bytes(ptr, 0, len)
            };
        }

        Ok(Some(Backing::Anonymous(map)))
    }

    /// Total number of bytes managed by this region.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true when the region has zero length.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the alignment the region was allocated with.
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Base pointer of the region.
    ///
    /// Writes through this pointer must follow the protocol of whatever
    /// structure is laid over the region; the region itself does no locking.
    pub fn as_ptr(&self) -> *mut u8 {
        self.backing.as_ptr()
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        match &self.backing {
            Backing::Owned { ptr, layout } => unsafe {
                dealloc(ptr.as_ptr(), *layout);
            },
            #[cfg(not(target_arch = "wasm32"))]
            Backing::File {
                path,
                unlink_on_drop: true,
                ..
            } => {
                let _ = fs::remove_file(path);
            }
            #[cfg(not(target_arch = "wasm32"))]
            _ => {}
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn page_alignment() -> usize {
    4096
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;

    /// A second mapping of the same file observes bytes written through the first.
    #[test]
    fn file_regions_share_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("region");
        let owner = SharedRegion::create_file(&path, 4096).expect("create");
        let peer = SharedRegion::open_file(&path).expect("open");
        assert_eq!(peer.len(), 4096);

        unsafe { owner.as_ptr().add(17).write(0x5A) };
        assert_eq!(unsafe { peer.as_ptr().add(17).read() }, 0x5A);
    }

    /// Publishing renames the file; dropping the owner removes it.
    #[test]
    fn publish_then_drop_unlinks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let staging = dir.path().join("region.tmp");
        let target = dir.path().join("region");
        let mut owner = SharedRegion::create_file(&staging, 1024).expect("create");
        owner.publish(&target).expect("publish");
        assert!(!staging.exists());
        assert!(target.exists());
        drop(owner);
        assert!(!target.exists());
    }

    /// Creating over an existing file fails instead of clobbering a live region.
    #[test]
    fn create_refuses_existing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("region");
        let _owner = SharedRegion::create_file(&path, 1024).expect("create");
        let err = SharedRegion::create_file(&path, 1024).expect_err("second create");
        assert!(matches!(err, TransportError::Io { op: "create", .. }));
    }
}
