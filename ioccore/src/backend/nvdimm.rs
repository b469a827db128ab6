//! Memory backend mapping slices of a growing file on a persistent memory
//! mount. The file is created with `mkstemp` and unlinked right away so it
//! disappears with the process. It only ever grows forward: the first
//! allocation sizes the file at eight times the request, each exhaustion
//! doubles it up to a 32 GiB cap rounded up to a multiple of the current
//! request. Allocations hand out successive page aligned slices via shared
//! mappings; this never truncates a file with live mappings.

use crate::backend::MemoryBackend;
use crate::debug;
use crate::logging::{self, Logger};
use crate::net::domain::FabricDomain;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::unistd::ftruncate;
use std::fs::File;
use std::num::NonZeroUsize;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// The file starts at eight times the first request.
const INITIAL_FACTOR: u64 = 8;
/// Growth cap per step.
const INCREASE_LIMIT: u64 = 32 * 1024 * 1024 * 1024;

struct NvdimmState {
    file: Option<File>,
    file_size: u64,
    file_offset: u64,
    chunks: usize,
}

pub struct NvdimmBackend {
    domain: Option<Arc<FabricDomain>>,
    directory: PathBuf,
    state: Mutex<NvdimmState>,
    log: Logger,
}

impl NvdimmBackend {
    /// Backend storing segment data in `directory`, typically a FSDAX
    /// mount point.
    pub fn new<'a, P: Into<PathBuf>, L: Into<Option<&'a Logger>>>(
        domain: Option<Arc<FabricDomain>>,
        directory: P,
        log: L,
    ) -> NvdimmBackend {
        NvdimmBackend {
            domain,
            directory: directory.into(),
            state: Mutex::new(NvdimmState {
                file: None,
                file_size: 0,
                file_offset: 0,
                chunks: 0,
            }),
            log: logging::child(log),
        }
    }

    /// Current size of the backing file, exposed for tests.
    pub fn file_size(&self) -> u64 {
        self.state.lock().expect("Nvdimm lock poisoned").file_size
    }

    /// Number of live allocations, exposed for tests.
    pub fn chunks(&self) -> usize {
        self.state.lock().expect("Nvdimm lock poisoned").chunks
    }

    fn open_new_file(&self, state: &mut NvdimmState, request: u64) {
        let next_size = if state.file_size == 0 {
            request * INITIAL_FACTOR
        } else {
            let mut next_size = state.file_size * 2;
            if next_size > INCREASE_LIMIT {
                next_size = INCREASE_LIMIT;
            }
            if next_size % request != 0 {
                next_size += request - next_size % request;
            }
            next_size
        };

        let template = self.directory.join("iocatcher-nvdimm-file-XXXXXX");
        let (fd, path) = match nix::unistd::mkstemp(&template) {
            Ok(created) => created,
            Err(error) => debug::fatal(&format!(
                "Failed to create the nvdimm file '{}': {}",
                template.display(),
                error
            )),
        };

        logging::debug!(self.log, "opened nvdimm file";
                        "path" => %path.display(), "size" => next_size);

        // Unlink so the file vanishes on exit. The old file, if any, closes
        // here but its live mappings stay valid.
        if let Err(error) = nix::unistd::unlink(&path) {
            debug::fatal(&format!(
                "Failed to unlink the nvdimm file '{}': {}",
                path.display(),
                error
            ));
        }

        if let Err(error) = ftruncate(fd, next_size as i64) {
            debug::fatal(&format!(
                "Failed to size the nvdimm file to {} bytes: {}",
                next_size, error
            ));
        }

        state.file = Some(unsafe { File::from_raw_fd(fd) });
        state.file_size = next_size;
        state.file_offset = 0;
    }
}

impl MemoryBackend for NvdimmBackend {
    fn allocate(&self, size: usize) -> *mut u8 {
        assert!(size > 0);
        assert!(size % 4096 == 0, "Nvdimm allocations must be page multiples");

        let mut state = self.state.lock().expect("Nvdimm lock poisoned");

        if state.file_offset + size as u64 > state.file_size {
            self.open_new_file(&mut state, size as u64);
        }

        let offset = state.file_offset;
        state.file_offset += size as u64;
        assert!(state.file_offset <= state.file_size);

        let fd = state
            .file
            .as_ref()
            .expect("Nvdimm backend has no open file")
            .as_raw_fd();

        let length = NonZeroUsize::new(size).expect("Zero sized mapping");
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                offset as i64,
            )
        };

        let ptr = match ptr {
            Ok(ptr) => ptr as *mut u8,
            Err(error) => debug::fatal(&format!(
                "Failed to map an nvdimm slice of {} bytes: {}",
                size, error
            )),
        };

        if let Some(domain) = &self.domain {
            domain.register_segment(ptr, size, true, true, true);
        }

        state.chunks += 1;
        ptr
    }

    fn deallocate(&self, ptr: *mut u8, size: usize) {
        assert!(!ptr.is_null());
        assert!(size > 0);
        assert!(size % 4096 == 0);

        if let Some(domain) = &self.domain {
            domain.unregister_segment(ptr, size);
        }

        if let Err(error) = unsafe { munmap(ptr as *mut _, size) } {
            debug::fatal(&format!("Failed to unmap an nvdimm slice: {}", error));
        }

        let mut state = self.state.lock().expect("Nvdimm lock poisoned");
        assert!(state.chunks > 0);
        state.chunks -= 1;
    }
}

impl Drop for NvdimmBackend {
    fn drop(&mut self) {
        let state = self.state.lock().expect("Nvdimm lock poisoned");
        if state.chunks != 0 {
            logging::warn!(self.log, "nvdimm backend dropped with live chunks";
                           "chunks" => state.chunks);
        }
        // The file closes with its handle.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_and_content() {
        let dir = tempfile::tempdir().unwrap();
        let backend = NvdimmBackend::new(None, dir.path(), None);

        let ptr = backend.allocate(4096);
        assert_eq!(backend.chunks(), 1);

        unsafe {
            std::ptr::write_bytes(ptr, 0xab, 4096);
            assert_eq!(*ptr, 0xab);
            assert_eq!(*ptr.add(4095), 0xab);
        }

        backend.deallocate(ptr, 4096);
        assert_eq!(backend.chunks(), 0);
    }

    #[test]
    fn test_file_growth_policy() {
        let dir = tempfile::tempdir().unwrap();
        let backend = NvdimmBackend::new(None, dir.path(), None);

        // First allocation sizes the file at eight times the request.
        let first = backend.allocate(4096);
        assert_eq!(backend.file_size(), 8 * 4096);

        // Requests fitting the current file do not grow it.
        let mut slices = vec![first];
        for _ in 0..7 {
            slices.push(backend.allocate(4096));
        }
        assert_eq!(backend.file_size(), 8 * 4096);

        // The next allocation doubles the file.
        slices.push(backend.allocate(4096));
        assert_eq!(backend.file_size(), 16 * 4096);

        for ptr in slices {
            backend.deallocate(ptr, 4096);
        }
    }

    #[test]
    fn test_slices_are_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let backend = NvdimmBackend::new(None, dir.path(), None);

        let first = backend.allocate(8192);
        let second = backend.allocate(8192);

        unsafe {
            std::ptr::write_bytes(first, 0x11, 8192);
            std::ptr::write_bytes(second, 0x22, 8192);
            assert_eq!(*first, 0x11);
            assert_eq!(*second, 0x22);
        }

        backend.deallocate(first, 8192);
        backend.deallocate(second, 8192);
    }
}
