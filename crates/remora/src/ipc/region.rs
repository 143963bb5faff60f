//! Byte regions backing the channels.

use std::sync::atomic::AtomicU64;

/// Memory shared with the peer. The start must be 8-byte aligned.
///
/// # Safety
///
/// `as_ptr` must stay valid for `len` bytes for the lifetime of the region and
/// the memory must tolerate concurrent access from the peer.
pub unsafe trait SharedRegion: Send + Sync {
    fn as_ptr(&self) -> *mut u8;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Zeroed in-process region. Two channels over one `HeapRegion` talk to each
/// other the same way the host and the controller do.
pub struct HeapRegion {
    words: Box<[AtomicU64]>,
}

impl HeapRegion {
    pub fn new(len: usize) -> Self {
        Self {
            words: (0..len.div_ceil(8)).map(|_| AtomicU64::new(0)).collect(),
        }
    }
}

// SAFETY: the words live as long as the region and sit behind atomics, so
// writes through the pointer are interior mutation.
unsafe impl SharedRegion for HeapRegion {
    fn as_ptr(&self) -> *mut u8 {
        self.words.as_ptr() as *mut u8
    }

    fn len(&self) -> usize {
        self.words.len() * 8
    }
}

#[cfg(target_os = "windows")]
pub use windows_impl::NamedRegion;

#[cfg(target_os = "windows")]
mod windows_impl {
    use tracing::warn;
    use windows::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
    use windows::Win32::System::Memory::{
        CreateFileMappingW, FILE_MAP_ALL_ACCESS, MEMORY_MAPPED_VIEW_ADDRESS, MapViewOfFile,
        PAGE_READWRITE, UnmapViewOfFile,
    };
    use windows::core::HSTRING;

    use super::SharedRegion;
    use crate::error::{Error, Result};

    /// Pagefile-backed mapping opened by name, shared with the target.
    pub struct NamedRegion {
        name: String,
        mapping: HANDLE,
        view: MEMORY_MAPPED_VIEW_ADDRESS,
        len: usize,
    }

    // SAFETY: the view is plain shared memory; access is synchronized by the
    // channel protocol.
    unsafe impl Send for NamedRegion {}
    unsafe impl Sync for NamedRegion {}

    impl NamedRegion {
        /// Create the mapping, or open it when the controller created it first.
        pub fn create(name: &str, len: usize) -> Result<Self> {
            let size = len as u64;
            // SAFETY: pagefile-backed mapping, no file handle involved
            let mapping = unsafe {
                CreateFileMappingW(
                    INVALID_HANDLE_VALUE,
                    None,
                    PAGE_READWRITE,
                    (size >> 32) as u32,
                    size as u32,
                    &HSTRING::from(name),
                )
            }
            .map_err(|e| Error::Channel(format!("Failed to create mapping {name}: {e}")))?;

            // SAFETY: mapping is a live section handle of at least `len` bytes
            let view = unsafe { MapViewOfFile(mapping, FILE_MAP_ALL_ACCESS, 0, 0, len) };
            if view.Value.is_null() {
                let e = windows::core::Error::from_win32();
                // SAFETY: handle returned above
                unsafe {
                    let _ = CloseHandle(mapping);
                }
                return Err(Error::Channel(format!("Failed to map view of {name}: {e}")));
            }

            Ok(Self {
                name: name.to_string(),
                mapping,
                view,
                len,
            })
        }

        pub fn name(&self) -> &str {
            &self.name
        }
    }

    // SAFETY: the view stays mapped until drop
    unsafe impl SharedRegion for NamedRegion {
        fn as_ptr(&self) -> *mut u8 {
            self.view.Value as *mut u8
        }

        fn len(&self) -> usize {
            self.len
        }
    }

    impl Drop for NamedRegion {
        fn drop(&mut self) {
            // SAFETY: view and handle are owned by this region
            unsafe {
                if let Err(e) = UnmapViewOfFile(self.view) {
                    warn!("Failed to unmap {}: {}", self.name, e);
                }
                let _ = CloseHandle(self.mapping);
            }
        }
    }
}
