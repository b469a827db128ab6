//! IO statistics counters, written by the request hooks and drained once a
//! second by the statistics thread.

use std::sync::atomic::{AtomicU64, Ordering};

pub struct ServerStats {
    read_bytes: AtomicU64,
    write_bytes: AtomicU64,
}

impl ServerStats {
    pub fn new() -> ServerStats {
        ServerStats {
            read_bytes: AtomicU64::new(0),
            write_bytes: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn add_read(&self, bytes: u64) {
        self.read_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_write(&self, bytes: u64) {
        self.write_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Drain the read counter.
    #[inline]
    pub fn take_read(&self) -> u64 {
        self.read_bytes.swap(0, Ordering::Relaxed)
    }

    /// Drain the write counter.
    #[inline]
    pub fn take_write(&self) -> u64 {
        self.write_bytes.swap(0, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate_and_drain() {
        let stats = ServerStats::new();

        stats.add_read(100);
        stats.add_read(50);
        stats.add_write(7);

        assert_eq!(stats.take_read(), 150);
        assert_eq!(stats.take_read(), 0);
        assert_eq!(stats.take_write(), 7);
    }
}
