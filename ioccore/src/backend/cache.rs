//! Decorator keeping a size keyed free list in front of another backend, so
//! the nvdimm backend's grow-only file allocator gets its memory back.

use crate::backend::MemoryBackend;
use crate::logging::{self, Logger};
use hashbrown::HashMap;
use std::sync::Mutex;

struct CacheState {
    free_lists: HashMap<usize, Vec<usize>>,
    ranges: HashMap<usize, usize>,
}

pub struct CacheBackend {
    backend: Box<dyn MemoryBackend>,
    state: Mutex<CacheState>,
    log: Logger,
}

impl CacheBackend {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        backend: Box<dyn MemoryBackend>,
        log: L,
    ) -> CacheBackend {
        CacheBackend {
            backend,
            state: Mutex::new(CacheState {
                free_lists: HashMap::new(),
                ranges: HashMap::new(),
            }),
            log: logging::child(log),
        }
    }

    /// Whether the given buffer was issued through this cache.
    pub fn is_local_memory(&self, ptr: *mut u8, size: usize) -> bool {
        let state = self.state.lock().expect("Cache lock poisoned");
        match state.ranges.get(&(ptr as usize)) {
            Some(&tracked) => {
                assert_eq!(tracked, size);
                true
            }
            None => false,
        }
    }
}

impl MemoryBackend for CacheBackend {
    fn allocate(&self, size: usize) -> *mut u8 {
        assert!(size > 0);

        {
            let mut state = self.state.lock().expect("Cache lock poisoned");
            if let Some(free_list) = state.free_lists.get_mut(&size) {
                if let Some(ptr) = free_list.pop() {
                    return ptr as *mut u8;
                }
            }
        }

        let ptr = self.backend.allocate(size);

        let mut state = self.state.lock().expect("Cache lock poisoned");
        state.ranges.insert(ptr as usize, size);

        ptr
    }

    fn deallocate(&self, ptr: *mut u8, size: usize) {
        assert!(!ptr.is_null());
        assert!(size > 0);
        assert!(self.is_local_memory(ptr, size));

        let mut state = self.state.lock().expect("Cache lock poisoned");
        state
            .free_lists
            .entry(size)
            .or_insert_with(Vec::new)
            .push(ptr as usize);
    }
}

impl Drop for CacheBackend {
    fn drop(&mut self) {
        let mut state = self.state.lock().expect("Cache lock poisoned");

        let cached: usize = state.free_lists.values().map(|list| list.len()).sum();
        if cached != state.ranges.len() {
            logging::warn!(self.log, "cache dropped with buffers still in use";
                           "cached" => cached, "issued" => state.ranges.len());
        }

        for (&ptr, &size) in state.ranges.iter() {
            self.backend.deallocate(ptr as *mut u8, size);
        }

        state.ranges.clear();
        state.free_lists.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MallocBackend;

    #[test]
    fn test_reuses_freed_buffers() {
        let cache = CacheBackend::new(Box::new(MallocBackend::new(None)), None);

        let first = cache.allocate(4096);
        cache.deallocate(first, 4096);

        // Same size class pops the cached buffer.
        let second = cache.allocate(4096);
        assert_eq!(first, second);

        // A different size class allocates fresh.
        let third = cache.allocate(8192);
        assert_ne!(second, third);

        cache.deallocate(second, 4096);
        cache.deallocate(third, 8192);
    }

    #[test]
    fn test_is_local_memory() {
        let cache = CacheBackend::new(Box::new(MallocBackend::new(None)), None);
        let mut foreign = vec![0u8; 64];

        let ptr = cache.allocate(4096);

        assert!(cache.is_local_memory(ptr, 4096));
        assert!(!cache.is_local_memory(foreign.as_mut_ptr(), 64));

        cache.deallocate(ptr, 4096);
    }
}
