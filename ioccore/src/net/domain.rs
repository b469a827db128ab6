//! The fabric domain owns the provider level resources shared by
//! connections and memory backends: the registered memory region table used
//! to resolve one sided operations, and the pool of send message buffers.

use crate::logging::{self, Logger};
use crate::net::proto::Iov;
use hashbrown::HashMap;
use std::sync::Mutex;

/// Metadata kept for one registered memory segment.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryRegion {
    pub addr: u64,
    pub size: usize,
    pub key: u64,
}

impl MemoryRegion {
    /// Description a peer needs to target this region with RDMA.
    #[inline]
    pub fn iov(&self) -> Iov {
        Iov {
            addr: self.addr,
            key: self.key,
        }
    }
}

#[derive(Debug, Copy, Clone)]
struct RegionEntry {
    addr: u64,
    size: usize,
    read: bool,
    write: bool,
    pmem: bool,
}

struct RegionTable {
    regions: HashMap<u64, RegionEntry>,
    next_key: u64,
}

struct BufferPool {
    buffers: Vec<Vec<u8>>,
}

/// Domain state: addressing information plus the two provider tables. Both
/// tables sit behind mutexes, registration is thread callable while the rest
/// of the fabric runs on the network thread.
pub struct FabricDomain {
    ip: String,
    port: u16,
    is_server: bool,
    msg_buffer_size: Mutex<usize>,
    regions: Mutex<RegionTable>,
    pool: Mutex<BufferPool>,
    log: Logger,
}

impl FabricDomain {
    pub const DEFAULT_MSG_BUFFER_SIZE: usize = 1024 * 1024;

    /// Create a domain. For a server `(ip, port)` is the listen address, for
    /// a client it is the server address to join.
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        ip: &str,
        port: u16,
        is_server: bool,
        log: L,
    ) -> FabricDomain {
        FabricDomain {
            ip: ip.to_string(),
            port,
            is_server,
            msg_buffer_size: Mutex::new(Self::DEFAULT_MSG_BUFFER_SIZE),
            regions: Mutex::new(RegionTable {
                regions: HashMap::new(),
                next_key: 1,
            }),
            pool: Mutex::new(BufferPool {
                buffers: Vec::new(),
            }),
            log: logging::child(log),
        }
    }

    #[inline]
    pub fn ip(&self) -> &str {
        &self.ip
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[inline]
    pub fn is_server(&self) -> bool {
        self.is_server
    }

    /// Size of the pooled message buffers. Must be set before the first
    /// buffer is taken.
    pub fn set_msg_buffer_size(&self, size: usize) {
        let mut msg_buffer_size = self.msg_buffer_size.lock().expect("Domain lock poisoned");
        *msg_buffer_size = size;
    }

    pub fn msg_buffer_size(&self) -> usize {
        *self.msg_buffer_size.lock().expect("Domain lock poisoned")
    }

    /// Register a memory segment for remote access and return its region
    /// descriptor carrying the freshly assigned key.
    pub fn register_segment(
        &self,
        ptr: *mut u8,
        size: usize,
        read: bool,
        write: bool,
        pmem: bool,
    ) -> MemoryRegion {
        let mut table = self.regions.lock().expect("Domain lock poisoned");
        let key = table.next_key;
        table.next_key += 1;

        let entry = RegionEntry {
            addr: ptr as u64,
            size,
            read,
            write,
            pmem,
        };
        table.regions.insert(key, entry);

        logging::trace!(self.log, "registered segment";
                        "addr" => entry.addr, "size" => size, "key" => key, "pmem" => pmem);

        MemoryRegion {
            addr: entry.addr,
            size,
            key,
        }
    }

    /// Remove the registration covering the given segment. The segment must
    /// have been registered with exactly this base address and size.
    pub fn unregister_segment(&self, ptr: *mut u8, size: usize) {
        let mut table = self.regions.lock().expect("Domain lock poisoned");
        let addr = ptr as u64;

        let key = table
            .regions
            .iter()
            .find(|(_, entry)| entry.addr == addr && entry.size == size)
            .map(|(key, _)| *key);

        match key {
            Some(key) => {
                table.regions.remove(&key);
                logging::trace!(self.log, "unregistered segment"; "addr" => addr, "key" => key);
            }
            None => panic!(
                "Unregistering a segment that was never registered: {:#x} ({} B)",
                addr, size
            ),
        }
    }

    /// Region descriptor for an already registered segment.
    pub fn lookup_segment(&self, ptr: *const u8, size: usize) -> Option<MemoryRegion> {
        let table = self.regions.lock().expect("Domain lock poisoned");
        let addr = ptr as u64;

        table
            .regions
            .iter()
            .find(|(_, entry)| entry.addr == addr && entry.size == size)
            .map(|(key, entry)| MemoryRegion {
                addr: entry.addr,
                size: entry.size,
                key: *key,
            })
    }

    /// Resolve a remote operation target to a local pointer. The key must
    /// exist, the range must sit inside the registration and the requested
    /// access must have been granted.
    pub fn resolve(&self, addr: u64, key: u64, len: usize, write: bool) -> Option<*mut u8> {
        let table = self.regions.lock().expect("Domain lock poisoned");
        let entry = table.regions.get(&key)?;

        if addr < entry.addr || addr + len as u64 > entry.addr + entry.size as u64 {
            return None;
        }
        if write && !entry.write {
            return None;
        }
        if !write && !entry.read {
            return None;
        }

        Some(addr as *mut u8)
    }

    /// Take a pooled message buffer, allocating one when the pool is empty.
    pub fn get_msg_buffer(&self) -> Vec<u8> {
        let size = self.msg_buffer_size();
        let mut pool = self.pool.lock().expect("Domain lock poisoned");

        match pool.buffers.pop() {
            Some(buffer) => buffer,
            None => vec![0u8; size],
        }
    }

    /// Return a message buffer to the pool.
    pub fn ret_msg_buffer(&self, buffer: Vec<u8>) {
        let mut pool = self.pool.lock().expect("Domain lock poisoned");
        pool.buffers.push(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_resolve_unregister() {
        let domain = FabricDomain::new("127.0.0.1", 0, true, None);
        let mut storage = vec![0u8; 4096];
        let ptr = storage.as_mut_ptr();

        let region = domain.register_segment(ptr, storage.len(), true, true, false);
        assert_eq!(region.addr, ptr as u64);
        assert_eq!(region.iov().key, region.key);

        // Resolution works anywhere inside the registration.
        assert_eq!(domain.resolve(region.addr, region.key, 16, true), Some(ptr));
        assert_eq!(
            domain.resolve(region.addr + 100, region.key, 16, false),
            Some(unsafe { ptr.add(100) })
        );

        // Crossing the end or using a bogus key fails.
        assert!(domain.resolve(region.addr + 4090, region.key, 16, false).is_none());
        assert!(domain.resolve(region.addr, region.key + 10, 16, false).is_none());

        domain.unregister_segment(ptr, storage.len());
        assert!(domain.resolve(region.addr, region.key, 16, false).is_none());
    }

    #[test]
    fn test_access_bits() {
        let domain = FabricDomain::new("127.0.0.1", 0, true, None);
        let mut storage = vec![0u8; 4096];
        let ptr = storage.as_mut_ptr();

        let region = domain.register_segment(ptr, storage.len(), true, false, false);

        assert!(domain.resolve(region.addr, region.key, 8, false).is_some());
        assert!(domain.resolve(region.addr, region.key, 8, true).is_none());

        domain.unregister_segment(ptr, storage.len());
    }

    #[test]
    fn test_msg_buffer_pool_reuse() {
        let domain = FabricDomain::new("127.0.0.1", 0, true, None);
        domain.set_msg_buffer_size(1024);

        let buffer = domain.get_msg_buffer();
        assert_eq!(buffer.len(), 1024);
        let first_ptr = buffer.as_ptr();

        domain.ret_msg_buffer(buffer);
        let buffer = domain.get_msg_buffer();
        assert_eq!(buffer.as_ptr(), first_ptr);
    }

    #[test]
    fn test_keys_are_unique() {
        let domain = FabricDomain::new("127.0.0.1", 0, true, None);
        let mut first = vec![0u8; 64];
        let mut second = vec![0u8; 64];

        let region_a = domain.register_segment(first.as_mut_ptr(), 64, true, true, false);
        let region_b = domain.register_segment(second.as_mut_ptr(), 64, true, true, false);

        assert_ne!(region_a.key, region_b.key);

        domain.unregister_segment(first.as_mut_ptr(), 64);
        domain.unregister_segment(second.as_mut_ptr(), 64);
    }
}
