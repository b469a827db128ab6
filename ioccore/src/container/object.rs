//! One cached object: a sorted map of segments plus the logic to fault
//! ranges in from storage, track dirty spans, flush them back and perform
//! full or ranged copy on write.

use crate::backend::{MemoryBackend, StorageBackend, StorageError, StorageResult};
use crate::container::consistency::ConsistencyTracker;
use crate::container::segment::{ObjectSegment, SegmentDescr};
use crate::net::connection::LocalIov;
use crate::net::proto::ObjectId;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Declared intent of a `get_buffers` access. Write intent materializes
/// copy on write aliases.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AccessMode {
    Read,
    Write,
}

pub struct Object {
    object_id: ObjectId,
    segment_map: BTreeMap<u64, ObjectSegment>,
    alignment: u64,
    consistency_tracker: ConsistencyTracker,
    storage: Arc<dyn StorageBackend>,
    memory: Arc<dyn MemoryBackend>,
}

impl Object {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        memory: Arc<dyn MemoryBackend>,
        object_id: ObjectId,
        alignment: u64,
    ) -> Object {
        Object {
            object_id,
            segment_map: BTreeMap::new(),
            alignment,
            consistency_tracker: ConsistencyTracker::new(),
            storage,
            memory,
        }
    }

    #[inline]
    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    #[inline]
    pub fn consistency_tracker(&self) -> &ConsistencyTracker {
        &self.consistency_tracker
    }

    #[inline]
    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    /// Change the segment alignment. Only allowed before the first access.
    pub fn force_alignment(&mut self, alignment: u64) {
        assert!(
            self.segment_map.is_empty(),
            "Cannot change the alignment after accessing the object"
        );
        self.alignment = alignment;
    }

    /// Collect the segments covering `[base, base+size)`, faulting missing
    /// ranges in. The range is first snapped outward to the alignment, so
    /// the first returned segment can start below `base`. Write intent
    /// (mode or `for_write`) materializes shared segments so every returned
    /// segment is privately owned.
    pub fn get_buffers(
        &mut self,
        base: u64,
        size: u64,
        mode: AccessMode,
        load: bool,
        for_write: bool,
    ) -> StorageResult<Vec<SegmentDescr>> {
        let (base, size) = self.align_range(base, size);

        // Find the holes between the segments already present.
        let mut holes: Vec<(u64, u64)> = Vec::new();
        let mut last_offset = base;
        for segment in self.segment_map.values() {
            if !segment.overlap(base, size) {
                continue;
            }
            if segment.offset() > last_offset {
                holes.push((last_offset, segment.offset() - last_offset));
            }
            last_offset = last_offset.max(segment.offset() + segment.size() as u64);
        }
        if last_offset < base + size {
            holes.push((last_offset, base + size - last_offset));
        }

        for (hole_offset, hole_size) in holes {
            self.load_segment(hole_offset, hole_size, load, false)?;
        }

        // Collect in offset order, materializing aliases on write intent.
        let write_intent = mode == AccessMode::Write || for_write;
        let offsets: Vec<u64> = self
            .segment_map
            .iter()
            .filter(|(_, segment)| segment.overlap(base, size))
            .map(|(offset, _)| *offset)
            .collect();

        let mut result = Vec::with_capacity(offsets.len());
        for offset in offsets {
            if write_intent {
                let needs_copy = self
                    .segment_map
                    .get(&offset)
                    .expect("Segment vanished during collection")
                    .is_cow();
                if needs_copy {
                    let segment = self
                        .segment_map
                        .get_mut(&offset)
                        .expect("Segment vanished during collection");
                    let buffer = self.memory.allocate(segment.size());
                    segment.apply_cow(buffer, self.memory.clone());
                }
            }

            result.push(
                self.segment_map
                    .get(&offset)
                    .expect("Segment vanished during collection")
                    .descr(),
            );
        }

        Ok(result)
    }

    /// Single segment variant: the range must resolve to exactly one
    /// segment fully covering it.
    pub fn get_uniq_buffer(
        &mut self,
        base: u64,
        size: u64,
        mode: AccessMode,
        load: bool,
    ) -> StorageResult<SegmentDescr> {
        let descrs = self.get_buffers(base, size, mode, load, false)?;

        if descrs.len() != 1 {
            return Err(StorageError::BackendFailure(format!(
                "Range {}..{} resolves to {} segments",
                base,
                base + size,
                descrs.len()
            )));
        }

        Ok(descrs[0])
    }

    /// Mark every segment overlapping the range dirty. Tracking granularity
    /// is the segment.
    pub fn mark_dirty(&mut self, base: u64, size: u64) {
        for segment in self.segment_map.values_mut() {
            if segment.overlap(base, size) {
                segment.set_dirty(true);
            }
        }
    }

    /// Flush the dirty segments overlapping the range back to storage, the
    /// whole object when `size` is zero. Returns the wire status: zero on
    /// full success, negative when at least one write failed. Failed
    /// segments stay dirty.
    pub fn flush(&mut self, offset: u64, size: u64) -> i32 {
        let mut status = 0;

        for segment in self.segment_map.values_mut() {
            if !segment.is_dirty() {
                continue;
            }
            if size != 0 && !segment.overlap(offset, size) {
                continue;
            }

            let written = self
                .storage
                .pwrite(self.object_id, segment.memory().bytes(), segment.offset());
            match written {
                Ok(count) if count == segment.size() => segment.set_dirty(false),
                _ => status = -1,
            }
        }

        status
    }

    /// Create the object on the storage backend.
    pub fn create(&mut self) -> StorageResult<()> {
        self.storage.create(self.object_id)
    }

    /// Build the target object of a full copy on write. Clean segments
    /// share their memory with this object and are duplicated server side
    /// on storage; dirty segments get a private copy so their bytes reach
    /// storage under the new id.
    pub fn make_full_copy_on_write(&self, target_id: ObjectId) -> StorageResult<Object> {
        self.storage.create(target_id)?;

        let mut target = Object::new(
            self.storage.clone(),
            self.memory.clone(),
            target_id,
            self.alignment,
        );

        for (offset, segment) in self.segment_map.iter() {
            if segment.is_dirty() {
                let buffer = self.memory.allocate(segment.size());
                let mut copy =
                    ObjectSegment::new(*offset, segment.size(), buffer, self.memory.clone());
                unsafe {
                    copy.memory()
                        .bytes_mut()
                        .copy_from_slice(segment.memory().bytes());
                }
                copy.set_dirty(true);
                target.segment_map.insert(*offset, copy);
            } else {
                target
                    .segment_map
                    .insert(*offset, ObjectSegment::make_cow_of(segment));
                self.storage.make_cow_segment(
                    self.object_id,
                    target_id,
                    *offset,
                    segment.size() as u64,
                )?;
            }
        }

        Ok(target)
    }

    /// Ranged copy on write from `orig` into this object. Source segments
    /// fully inside the range are installed as aliases when this object has
    /// no conflicting segment; everything else is copied privately.
    pub fn range_copy_on_write(&mut self, orig: &Object, offset: u64, size: u64) -> StorageResult<()> {
        let source_offsets: Vec<u64> = orig
            .segment_map
            .iter()
            .filter(|(_, segment)| segment.overlap(offset, size))
            .map(|(source_offset, _)| *source_offset)
            .collect();

        for source_offset in source_offsets {
            let source = orig
                .segment_map
                .get(&source_offset)
                .expect("Source segment vanished");
            let source_end = source.offset() + source.size() as u64;
            let fully_inside = source.offset() >= offset && source_end <= offset + size;

            if fully_inside && self.can_alias(source.offset(), source.size()) {
                if !source.is_dirty() {
                    self.storage.make_cow_segment(
                        orig.object_id,
                        self.object_id,
                        source.offset(),
                        source.size() as u64,
                    )?;
                }
                self.segment_map
                    .insert(source.offset(), ObjectSegment::make_cow_of(source));
                continue;
            }

            // Partial overlap: copy the intersection into private segments.
            let inter_base = source.offset().max(offset);
            let inter_end = source_end.min(offset + size);
            let inter_size = inter_end - inter_base;
            let skip = (inter_base - source.offset()) as usize;
            let bytes = &source.memory().bytes()[skip..skip + inter_size as usize];

            let descrs = self.get_buffers(inter_base, inter_size, AccessMode::Write, false, true)?;
            copy_into_segments(&descrs, inter_base, bytes);
            self.mark_dirty(inter_base, inter_size);
        }

        Ok(())
    }

    /// Fill the range with a byte value, creating unloaded segments where
    /// needed. Test and demo helper.
    pub fn fill_buffer(&mut self, offset: u64, size: u64, value: u8) -> StorageResult<()> {
        let descrs = self.get_buffers(offset, size, AccessMode::Write, false, true)?;
        for entry in build_iov(&descrs, offset, size) {
            unsafe {
                std::ptr::write_bytes(entry.addr as *mut u8, value, entry.len);
            }
        }
        Ok(())
    }

    /// Check the range contains only the given byte value.
    pub fn check_buffer(&mut self, offset: u64, size: u64, value: u8) -> bool {
        let descrs = match self.get_buffers(offset, size, AccessMode::Read, false, false) {
            Ok(descrs) => descrs,
            Err(_) => return false,
        };

        build_iov(&descrs, offset, size).iter().all(|entry| {
            let slice = unsafe { std::slice::from_raw_parts(entry.addr as *const u8, entry.len) };
            slice.iter().all(|&byte| byte == value)
        })
    }

    /// Whether every segment overlapping the range owns its memory alone.
    pub fn check_uniq(&self, offset: u64, size: u64) -> bool {
        self.segment_map
            .values()
            .filter(|segment| segment.overlap(offset, size))
            .all(|segment| !segment.is_cow())
    }

    /// Number of segments, for tests.
    pub fn segment_count(&self) -> usize {
        self.segment_map.len()
    }

    /// Direct segment access, for tests.
    pub fn segment(&self, offset: u64) -> Option<&ObjectSegment> {
        self.segment_map.get(&offset)
    }

    /// Sweep the consistency tracker on a client disconnect.
    pub fn on_client_disconnect(&self, tcp_client_id: u64) {
        self.consistency_tracker.client_disconnect(tcp_client_id);
    }

    fn align_range(&self, mut base: u64, mut size: u64) -> (u64, u64) {
        if self.alignment > 0 {
            size += base % self.alignment;
            base -= base % self.alignment;
            if size % self.alignment != 0 {
                size += self.alignment - size % self.alignment;
            }
        }
        (base, size)
    }

    /// An alias can replace the span only when the object has no segment
    /// there, or exactly one segment with matching bounds.
    fn can_alias(&self, offset: u64, size: usize) -> bool {
        let overlaps: Vec<&ObjectSegment> = self
            .segment_map
            .values()
            .filter(|segment| segment.overlap(offset, size as u64))
            .collect();

        match overlaps.len() {
            0 => true,
            1 => overlaps[0].offset() == offset && overlaps[0].size() == size,
            _ => false,
        }
    }

    fn load_segment(
        &mut self,
        offset: u64,
        size: u64,
        load: bool,
        accept_load_fail: bool,
    ) -> StorageResult<()> {
        let buffer = self.memory.allocate(size as usize);
        let segment = ObjectSegment::new(offset, size as usize, buffer, self.memory.clone());

        if load {
            let slice = unsafe { segment.memory().bytes_mut() };
            match self.storage.pread(self.object_id, slice, offset) {
                Ok(count) if count == size as usize => {}
                Ok(count) => {
                    if !accept_load_fail {
                        return Err(StorageError::ShortRead {
                            expected: size as usize,
                            got: count,
                        });
                    }
                }
                Err(error) => {
                    if !accept_load_fail {
                        return Err(error);
                    }
                }
            }
        }

        self.segment_map.insert(offset, segment);
        Ok(())
    }
}

/// Clip the segment list to `[offset, offset+size)` and turn it into an IO
/// vector for the fabric.
pub fn build_iov(segments: &[SegmentDescr], offset: u64, size: u64) -> Vec<LocalIov> {
    let end = offset + size;
    let mut iov = Vec::with_capacity(segments.len());

    for descr in segments {
        let descr_end = descr.offset + descr.size as u64;
        let base = descr.offset.max(offset);
        let stop = descr_end.min(end);
        if stop <= base {
            continue;
        }

        iov.push(LocalIov {
            addr: descr.ptr as usize + (base - descr.offset) as usize,
            len: (stop - base) as usize,
        });
    }

    iov
}

/// Scatter `data`, whose first byte sits at object offset `range_base`,
/// into the overlapping parts of the segment list.
pub fn copy_into_segments(segments: &[SegmentDescr], range_base: u64, data: &[u8]) {
    let range_end = range_base + data.len() as u64;

    for descr in segments {
        let descr_end = descr.offset + descr.size as u64;
        let base = descr.offset.max(range_base);
        let stop = descr_end.min(range_end);
        if stop <= base {
            continue;
        }

        let count = (stop - base) as usize;
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr().add((base - range_base) as usize),
                descr.ptr.add((base - descr.offset) as usize),
                count,
            );
        }
    }
}

/// Gather the range `[range_base, range_base+out.len())` out of the segment
/// list into a contiguous buffer.
pub fn copy_from_segments(segments: &[SegmentDescr], range_base: u64, out: &mut [u8]) {
    let range_end = range_base + out.len() as u64;

    for descr in segments {
        let descr_end = descr.offset + descr.size as u64;
        let base = descr.offset.max(range_base);
        let stop = descr_end.min(range_end);
        if stop <= base {
            continue;
        }

        let count = (stop - base) as usize;
        unsafe {
            std::ptr::copy_nonoverlapping(
                descr.ptr.add((base - descr.offset) as usize) as *const u8,
                out.as_mut_ptr().add((base - range_base) as usize),
                count,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MallocBackend, MemoryStorage, StorageOpKind};

    fn make_object(id: ObjectId, alignment: u64) -> (Object, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let memory: Arc<dyn MemoryBackend> = Arc::new(MallocBackend::new(None));
        let object = Object::new(storage.clone(), memory, id, alignment);
        (object, storage)
    }

    #[test]
    fn test_get_buffers_aligns_and_loads() {
        let (mut object, storage) = make_object(ObjectId::new(10, 20), 1024);

        let descrs = object
            .get_buffers(10, 100, AccessMode::Read, true, false)
            .unwrap();

        // One aligned segment, loaded with a single read.
        assert_eq!(descrs.len(), 1);
        assert_eq!(descrs[0].offset, 0);
        assert_eq!(descrs[0].size, 1024);

        let reads = storage.ops_of(StorageOpKind::Pread);
        assert_eq!(reads.len(), 1);
        assert_eq!(reads[0].offset, 0);
        assert_eq!(reads[0].size, 1024);
    }

    #[test]
    fn test_get_buffers_fills_holes_without_overlap() {
        let (mut object, _storage) = make_object(ObjectId::new(10, 20), 0);

        object.get_buffers(0, 100, AccessMode::Read, true, false).unwrap();
        object.get_buffers(300, 100, AccessMode::Read, true, false).unwrap();

        // Spanning request fills the hole between the two segments.
        let descrs = object
            .get_buffers(0, 400, AccessMode::Read, true, false)
            .unwrap();

        assert_eq!(descrs.len(), 3);
        assert_eq!(descrs[0].offset, 0);
        assert_eq!(descrs[1].offset, 100);
        assert_eq!(descrs[1].size, 200);
        assert_eq!(descrs[2].offset, 300);

        // Segments never overlap.
        let mut last_end = 0u64;
        for descr in descrs {
            assert!(descr.offset >= last_end);
            last_end = descr.offset + descr.size as u64;
        }
    }

    #[test]
    fn test_loaded_content_comes_from_storage() {
        let (mut object, storage) = make_object(ObjectId::new(10, 20), 0);
        storage.pwrite(ObjectId::new(10, 20), &[5u8; 64], 0).unwrap();
        storage.clear_ops();

        let descrs = object
            .get_buffers(0, 64, AccessMode::Read, true, false)
            .unwrap();

        let mut content = vec![0u8; 64];
        copy_from_segments(&descrs, 0, &mut content);
        assert_eq!(content, vec![5u8; 64]);
    }

    #[test]
    fn test_flush_writes_dirty_and_clears() {
        let (mut object, storage) = make_object(ObjectId::new(10, 20), 1024);

        object.fill_buffer(64, 32, 0x01).unwrap();
        object.mark_dirty(64, 32);
        storage.clear_ops();

        assert_eq!(object.flush(0, 0), 0);

        let writes = storage.ops_of(StorageOpKind::Pwrite);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].offset, 0);
        assert_eq!(writes[0].size, 1024);

        // Nothing dirty anymore, a second flush writes nothing.
        storage.clear_ops();
        assert_eq!(object.flush(0, 0), 0);
        assert!(storage.ops_of(StorageOpKind::Pwrite).is_empty());
    }

    #[test]
    fn test_flush_range_only_touches_overlap() {
        let (mut object, storage) = make_object(ObjectId::new(10, 20), 0);

        object.fill_buffer(0, 100, 1).unwrap();
        object.fill_buffer(1000, 100, 2).unwrap();
        object.mark_dirty(0, 100);
        object.mark_dirty(1000, 100);
        storage.clear_ops();

        assert_eq!(object.flush(1000, 100), 0);

        let writes = storage.ops_of(StorageOpKind::Pwrite);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].offset, 1000);

        // The first segment is still dirty.
        assert!(object.segment(0).unwrap().is_dirty());
        assert!(!object.segment(1000).unwrap().is_dirty());
    }

    #[test]
    fn test_write_intent_materializes_aliases() {
        let (mut object, _storage) = make_object(ObjectId::new(10, 20), 0);

        object.fill_buffer(0, 512, 0xaa).unwrap();

        let target = object.make_full_copy_on_write(ObjectId::new(10, 21)).unwrap();
        assert!(object.segment(0).unwrap().is_cow());

        // A write access re-owns the segment.
        let descrs = object
            .get_buffers(0, 512, AccessMode::Write, false, false)
            .unwrap();
        assert_eq!(descrs.len(), 1);
        assert!(object.check_uniq(0, 512));

        // The copy kept the original content.
        drop(target);
        assert!(object.check_buffer(0, 512, 0xaa));
    }

    #[test]
    fn test_full_cow_shares_clean_and_copies_dirty() {
        let (mut object, storage) = make_object(ObjectId::new(10, 20), 0);

        // A clean segment at 1000 and a dirty one at 2000, 500 bytes each.
        object.fill_buffer(1000, 500, 0x01).unwrap();
        object.fill_buffer(2000, 500, 0x02).unwrap();
        object.mark_dirty(2000, 500);
        storage.clear_ops();

        let mut target = object.make_full_copy_on_write(ObjectId::new(10, 21)).unwrap();

        // Clean segment shares memory, dirty one got a private copy.
        let clean_src = object.segment(1000).unwrap();
        let clean_dst = target.segment(1000).unwrap();
        assert!(Arc::ptr_eq(clean_src.memory(), clean_dst.memory()));

        let dirty_src = object.segment(2000).unwrap();
        let dirty_dst = target.segment(2000).unwrap();
        assert!(!Arc::ptr_eq(dirty_src.memory(), dirty_dst.memory()));
        assert!(dirty_dst.is_dirty());

        // The clean span was duplicated on storage under the new id.
        let cows = storage.ops_of(StorageOpKind::CowSegment);
        assert_eq!(cows.len(), 1);
        assert_eq!(cows[0].offset, 1000);
        assert_eq!(cows[0].object_id, ObjectId::new(10, 21));

        // Both segments carry the same bytes as the source.
        assert!(target.check_buffer(1000, 500, 0x01));
        assert!(target.check_buffer(2000, 500, 0x02));

        // Mutating the source afterwards leaves the target unchanged.
        object.fill_buffer(1000, 500, 0x09).unwrap();
        assert!(object.check_buffer(1000, 500, 0x09));
        assert!(target.check_buffer(1000, 500, 0x01));
    }

    #[test]
    fn test_range_cow_aliases_inner_segments() {
        let (mut source, _storage) = make_object(ObjectId::new(10, 20), 0);
        let (mut target, _target_storage) = make_object(ObjectId::new(10, 22), 0);

        source.fill_buffer(0, 100, 0x03).unwrap();
        source.mark_dirty(0, 100);

        target.range_copy_on_write(&source, 0, 100).unwrap();

        // Fully covered segment is aliased.
        assert!(Arc::ptr_eq(
            source.segment(0).unwrap().memory(),
            target.segment(0).unwrap().memory()
        ));
        assert!(target.check_buffer(0, 100, 0x03));

        // A write to the source materializes, the target keeps the bytes.
        source.fill_buffer(0, 100, 0x04).unwrap();
        assert!(source.check_buffer(0, 100, 0x04));
        assert!(target.check_buffer(0, 100, 0x03));
    }

    #[test]
    fn test_range_cow_copies_partial_overlap() {
        let (mut source, _storage) = make_object(ObjectId::new(10, 20), 0);
        let (mut target, _target_storage) = make_object(ObjectId::new(10, 23), 0);

        source.fill_buffer(0, 200, 0x05).unwrap();

        // Range covers only half of the source segment.
        target.range_copy_on_write(&source, 100, 100).unwrap();

        // No sharing, a private copy of the intersection instead.
        assert!(target.segment(0).is_none());
        assert!(target.check_uniq(100, 100));
        assert!(target.check_buffer(100, 100, 0x05));
    }

    #[test]
    fn test_get_uniq_buffer() {
        let (mut object, _storage) = make_object(ObjectId::new(10, 20), 1024);

        // An aligned range is a single segment.
        let descr = object
            .get_uniq_buffer(0, 1024, AccessMode::Read, false)
            .unwrap();
        assert_eq!(descr.offset, 0);
        assert_eq!(descr.size, 1024);

        // A range crossing two segments is rejected.
        object.get_buffers(4096, 1024, AccessMode::Read, false, false).unwrap();
        let result = object.get_uniq_buffer(0, 8192, AccessMode::Read, false);
        assert!(result.is_err());
    }

    #[test]
    fn test_force_alignment_before_first_access() {
        let (mut object, _storage) = make_object(ObjectId::new(10, 20), 0);

        object.force_alignment(4096);
        assert_eq!(object.alignment(), 4096);

        let descrs = object
            .get_buffers(10, 10, AccessMode::Read, false, false)
            .unwrap();
        assert_eq!(descrs[0].size, 4096);
    }

    #[test]
    #[should_panic(expected = "Cannot change the alignment")]
    fn test_force_alignment_after_access_panics() {
        let (mut object, _storage) = make_object(ObjectId::new(10, 20), 0);

        object.fill_buffer(0, 16, 0).unwrap();
        object.force_alignment(4096);
    }

    #[test]
    fn test_short_read_fails_get_buffers() {
        struct ShortStorage;
        impl StorageBackend for ShortStorage {
            fn pread(&self, _id: ObjectId, buffer: &mut [u8], _offset: u64) -> StorageResult<usize> {
                Ok(buffer.len() / 2)
            }
            fn pwrite(&self, _id: ObjectId, buffer: &[u8], _offset: u64) -> StorageResult<usize> {
                Ok(buffer.len())
            }
            fn create(&self, _id: ObjectId) -> StorageResult<()> {
                Ok(())
            }
        }

        let memory: Arc<dyn MemoryBackend> = Arc::new(MallocBackend::new(None));
        let mut object = Object::new(Arc::new(ShortStorage), memory, ObjectId::new(1, 1), 0);

        let result = object.get_buffers(0, 64, AccessMode::Read, true, false);
        assert_eq!(
            result.unwrap_err(),
            StorageError::ShortRead {
                expected: 64,
                got: 32
            }
        );
    }

    #[test]
    fn test_build_iov_clips_to_range() {
        let mut first = vec![0u8; 100];
        let mut second = vec![0u8; 100];
        let segments = [
            SegmentDescr {
                ptr: first.as_mut_ptr(),
                offset: 0,
                size: 100,
            },
            SegmentDescr {
                ptr: second.as_mut_ptr(),
                offset: 100,
                size: 100,
            },
        ];

        let iov = build_iov(&segments, 50, 100);

        assert_eq!(iov.len(), 2);
        assert_eq!(iov[0].addr, first.as_ptr() as usize + 50);
        assert_eq!(iov[0].len, 50);
        assert_eq!(iov[1].addr, second.as_ptr() as usize);
        assert_eq!(iov[1].len, 50);
    }
}
