//! The in-memory object cache: containers map object ids to objects, each
//! object owns a sorted map of segments, each segment a reference counted
//! memory buffer with a dirty flag.

pub mod consistency;
#[allow(clippy::module_inception)]
pub mod container;
pub mod object;
pub mod segment;

pub use consistency::{ConsistencyAccessMode, ConsistencyTracker};
pub use container::Container;
pub use object::{build_iov, copy_from_segments, copy_into_segments, AccessMode, Object};
pub use segment::{ObjectSegment, ObjectSegmentMemory, SegmentDescr};
