//! Memory backend delegating to the platform allocator.

use crate::backend::MemoryBackend;
use crate::net::domain::FabricDomain;
use std::alloc::{self, Layout};
use std::sync::Arc;

/// Buffers come out page aligned so they can serve as mapping targets.
const BUFFER_ALIGN: usize = 4096;

pub struct MallocBackend {
    domain: Option<Arc<FabricDomain>>,
}

impl MallocBackend {
    /// Backend allocating from the heap. Without a domain the buffers are
    /// not registered, which is only useful in unit tests.
    pub fn new(domain: Option<Arc<FabricDomain>>) -> MallocBackend {
        MallocBackend { domain }
    }

    fn layout(size: usize) -> Layout {
        Layout::from_size_align(size, BUFFER_ALIGN).expect("Invalid allocation layout")
    }
}

impl MemoryBackend for MallocBackend {
    fn allocate(&self, size: usize) -> *mut u8 {
        assert!(size > 0);

        let ptr = unsafe { alloc::alloc_zeroed(Self::layout(size)) };
        if ptr.is_null() {
            alloc::handle_alloc_error(Self::layout(size));
        }

        if let Some(domain) = &self.domain {
            domain.register_segment(ptr, size, true, true, false);
        }

        ptr
    }

    fn deallocate(&self, ptr: *mut u8, size: usize) {
        assert!(!ptr.is_null());
        assert!(size > 0);

        if let Some(domain) = &self.domain {
            domain.unregister_segment(ptr, size);
        }

        unsafe { alloc::dealloc(ptr, Self::layout(size)) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_deallocate() {
        let backend = MallocBackend::new(None);

        let ptr = backend.allocate(8192);
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % BUFFER_ALIGN, 0);

        // Zeroed on arrival and writable.
        unsafe {
            assert_eq!(*ptr, 0);
            *ptr = 42;
            assert_eq!(*ptr, 42);
        }

        backend.deallocate(ptr, 8192);
    }

    #[test]
    fn test_registers_with_domain() {
        let domain = Arc::new(FabricDomain::new("127.0.0.1", 0, true, None));
        let backend = MallocBackend::new(Some(domain.clone()));

        let ptr = backend.allocate(4096);
        let region = domain.lookup_segment(ptr, 4096).expect("Buffer not registered");
        assert_eq!(region.addr, ptr as u64);

        backend.deallocate(ptr, 4096);
        assert!(domain.lookup_segment(ptr, 4096).is_none());
    }
}
