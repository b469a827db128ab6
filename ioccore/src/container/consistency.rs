//! Per object tracking of the mapping ranges registered by clients. It
//! enforces the single writer / many readers discipline across clients and
//! sweeps the ranges of a client when its TCP connection drops.

use std::sync::Mutex;

/// Access mode of a mapping range. Write ranges are exclusive, read ranges
/// can overlap each other freely.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConsistencyAccessMode {
    Read,
    Write,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct ConsistencyRange {
    tcp_client_id: u64,
    id: i32,
    offset: u64,
    size: u64,
    access_mode: ConsistencyAccessMode,
}

struct TrackerState {
    ranges: Vec<ConsistencyRange>,
    next_id: i32,
}

/// The tracker itself. The mutex protects it from the concurrent accesses
/// of the network thread (register, unregister) and the TCP thread (sweep
/// on disconnect).
pub struct ConsistencyTracker {
    state: Mutex<TrackerState>,
}

impl ConsistencyTracker {
    pub fn new() -> ConsistencyTracker {
        ConsistencyTracker {
            state: Mutex::new(TrackerState {
                ranges: Vec::new(),
                next_id: 1,
            }),
        }
    }

    /// Register a mapping range. Returns the assigned range id, or -1 when
    /// the range collides with an already registered one.
    pub fn register_range(
        &self,
        tcp_client_id: u64,
        offset: u64,
        size: u64,
        access_mode: ConsistencyAccessMode,
    ) -> i32 {
        let mut state = self.state.lock().expect("Tracker lock poisoned");

        if Self::collides(&state.ranges, offset, size, access_mode) {
            return -1;
        }

        let id = state.next_id;
        state.next_id += 1;
        state.ranges.push(ConsistencyRange {
            tcp_client_id,
            id,
            offset,
            size,
            access_mode,
        });

        id
    }

    /// Check whether a range would collide without registering it.
    pub fn has_collision(&self, offset: u64, size: u64, access_mode: ConsistencyAccessMode) -> bool {
        let state = self.state.lock().expect("Tracker lock poisoned");
        Self::collides(&state.ranges, offset, size, access_mode)
    }

    /// Remove a range. All five fields must match the registration.
    pub fn unregister_range(
        &self,
        tcp_client_id: u64,
        id: i32,
        offset: u64,
        size: u64,
        access_mode: ConsistencyAccessMode,
    ) -> bool {
        let mut state = self.state.lock().expect("Tracker lock poisoned");

        let position = state.ranges.iter().position(|range| {
            range.tcp_client_id == tcp_client_id
                && range.id == id
                && range.offset == offset
                && range.size == size
                && range.access_mode == access_mode
        });

        match position {
            Some(position) => {
                state.ranges.remove(position);
                true
            }
            None => false,
        }
    }

    /// Drop every range owned by the given client.
    pub fn client_disconnect(&self, tcp_client_id: u64) {
        let mut state = self.state.lock().expect("Tracker lock poisoned");
        state.ranges.retain(|range| range.tcp_client_id != tcp_client_id);
    }

    /// Number of tracked ranges.
    pub fn len(&self) -> usize {
        self.state.lock().expect("Tracker lock poisoned").ranges.len()
    }

    #[inline]
    pub fn overlap(offset1: u64, size1: u64, offset2: u64, size2: u64) -> bool {
        if offset1 >= offset2 && offset1 < offset2 + size2 {
            return true;
        }
        if offset2 >= offset1 && offset2 < offset1 + size1 {
            return true;
        }
        false
    }

    fn collides(
        ranges: &[ConsistencyRange],
        offset: u64,
        size: u64,
        access_mode: ConsistencyAccessMode,
    ) -> bool {
        ranges.iter().any(|range| {
            Self::overlap(offset, size, range.offset, range.size)
                && (access_mode != range.access_mode
                    || range.access_mode == ConsistencyAccessMode::Write)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConsistencyAccessMode::{Read, Write};

    #[test]
    fn test_ids_start_at_one() {
        let tracker = ConsistencyTracker::new();

        assert_eq!(tracker.register_range(1, 0, 100, Write), 1);
        assert_eq!(tracker.register_range(1, 100, 100, Write), 2);
    }

    #[test]
    fn test_write_ranges_are_exclusive() {
        let tracker = ConsistencyTracker::new();

        assert_eq!(tracker.register_range(1, 200, 100, Write), 1);
        // Another writer on the same span is rejected.
        assert_eq!(tracker.register_range(2, 200, 100, Write), -1);
        // A reader over a writer is rejected too.
        assert_eq!(tracker.register_range(2, 250, 10, Read), -1);

        // After unregistration the span is free and ids keep increasing.
        assert!(tracker.unregister_range(1, 1, 200, 100, Write));
        assert_eq!(tracker.register_range(2, 200, 100, Write), 2);
    }

    #[test]
    fn test_readers_overlap_freely() {
        let tracker = ConsistencyTracker::new();

        assert_eq!(tracker.register_range(1, 0, 100, Read), 1);
        assert_eq!(tracker.register_range(2, 50, 100, Read), 2);
        // A writer crossing a read range is rejected.
        assert_eq!(tracker.register_range(3, 80, 10, Write), -1);
        // Disjoint writer passes.
        assert_eq!(tracker.register_range(3, 200, 10, Write), 3);
    }

    #[test]
    fn test_unregister_requires_exact_match() {
        let tracker = ConsistencyTracker::new();

        let id = tracker.register_range(1, 0, 100, Write);

        assert!(!tracker.unregister_range(2, id, 0, 100, Write));
        assert!(!tracker.unregister_range(1, id + 1, 0, 100, Write));
        assert!(!tracker.unregister_range(1, id, 0, 50, Write));
        assert!(!tracker.unregister_range(1, id, 0, 100, Read));
        assert!(tracker.unregister_range(1, id, 0, 100, Write));
        // Only once.
        assert!(!tracker.unregister_range(1, id, 0, 100, Write));
    }

    #[test]
    fn test_client_disconnect_sweeps() {
        let tracker = ConsistencyTracker::new();

        tracker.register_range(7, 0, 100, Write);
        tracker.register_range(7, 1000, 100, Read);
        tracker.register_range(8, 2000, 100, Write);

        tracker.client_disconnect(7);

        assert_eq!(tracker.len(), 1);
        assert!(!tracker.has_collision(0, 100, Write));
        assert!(!tracker.has_collision(1000, 100, Write));
        assert!(tracker.has_collision(2000, 100, Write));

        // The swept spans can be taken over by another client.
        assert!(tracker.register_range(9, 0, 100, Write) > 0);
    }

    #[test]
    fn test_overlap_predicate() {
        assert!(ConsistencyTracker::overlap(0, 10, 5, 10));
        assert!(ConsistencyTracker::overlap(5, 10, 0, 10));
        assert!(ConsistencyTracker::overlap(0, 10, 0, 10));
        assert!(!ConsistencyTracker::overlap(0, 10, 10, 10));
        assert!(!ConsistencyTracker::overlap(10, 10, 0, 10));
    }
}
