//! Dispatcher balancing allocations over several child backends, routing
//! each request to the child with the least bytes currently in use.

use crate::backend::MemoryBackend;
use hashbrown::HashMap;
use std::sync::Mutex;

struct BalanceState {
    in_use: Vec<usize>,
    owner: HashMap<usize, usize>,
}

pub struct BalanceBackend {
    backends: Vec<Box<dyn MemoryBackend>>,
    state: Mutex<BalanceState>,
}

impl BalanceBackend {
    pub fn new() -> BalanceBackend {
        BalanceBackend {
            backends: Vec::new(),
            state: Mutex::new(BalanceState {
                in_use: Vec::new(),
                owner: HashMap::new(),
            }),
        }
    }

    /// Add a child backend. Children are fixed once allocation starts.
    pub fn register_backend(&mut self, backend: Box<dyn MemoryBackend>) {
        self.backends.push(backend);
        self.state
            .lock()
            .expect("Balance lock poisoned")
            .in_use
            .push(0);
    }

    /// Bytes currently in use on the given child, exposed for tests.
    pub fn in_use(&self, id: usize) -> usize {
        self.state.lock().expect("Balance lock poisoned").in_use[id]
    }
}

impl MemoryBackend for BalanceBackend {
    fn allocate(&self, size: usize) -> *mut u8 {
        assert!(!self.backends.is_empty());

        let id = {
            let state = self.state.lock().expect("Balance lock poisoned");
            let mut id = 0;
            for candidate in 1..state.in_use.len() {
                if state.in_use[candidate] < state.in_use[id] {
                    id = candidate;
                }
            }
            id
        };

        let ptr = self.backends[id].allocate(size);

        let mut state = self.state.lock().expect("Balance lock poisoned");
        state.in_use[id] += size;
        state.owner.insert(ptr as usize, id);

        ptr
    }

    fn deallocate(&self, ptr: *mut u8, size: usize) {
        assert!(!ptr.is_null());
        assert!(size > 0);

        let id = {
            let mut state = self.state.lock().expect("Balance lock poisoned");
            let id = state
                .owner
                .remove(&(ptr as usize))
                .unwrap_or_else(|| panic!("No backend owns the buffer {:p}", ptr));
            assert!(state.in_use[id] >= size);
            state.in_use[id] -= size;
            id
        };

        self.backends[id].deallocate(ptr, size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MallocBackend;

    fn balance_of(children: usize) -> BalanceBackend {
        let mut balance = BalanceBackend::new();
        for _ in 0..children {
            balance.register_backend(Box::new(MallocBackend::new(None)));
        }
        balance
    }

    #[test]
    fn test_routes_to_least_used() {
        let balance = balance_of(2);

        let first = balance.allocate(8192);
        assert_eq!(balance.in_use(0), 8192);
        assert_eq!(balance.in_use(1), 0);

        // The second request lands on the idle child.
        let second = balance.allocate(4096);
        assert_eq!(balance.in_use(1), 4096);

        // And the third on the now least used one.
        let third = balance.allocate(4096);
        assert_eq!(balance.in_use(1), 8192);

        balance.deallocate(first, 8192);
        balance.deallocate(second, 4096);
        balance.deallocate(third, 4096);
    }

    #[test]
    fn test_deallocate_routes_to_owner() {
        let balance = balance_of(3);

        let buffers: Vec<_> = (0..6).map(|_| balance.allocate(4096)).collect();
        assert_eq!(balance.in_use(0), 2 * 4096);
        assert_eq!(balance.in_use(1), 2 * 4096);
        assert_eq!(balance.in_use(2), 2 * 4096);

        for ptr in buffers {
            balance.deallocate(ptr, 4096);
        }

        assert_eq!(balance.in_use(0), 0);
        assert_eq!(balance.in_use(1), 0);
        assert_eq!(balance.in_use(2), 0);
    }

    #[test]
    #[should_panic(expected = "No backend owns the buffer")]
    fn test_foreign_buffer_panics() {
        let balance = balance_of(1);
        let mut foreign = vec![0u8; 64];

        balance.deallocate(foreign.as_mut_ptr(), 64);
    }
}
