//! The container aggregates every cached object and is the entry point for
//! lookups, copy on write between objects and disconnect sweeps.

use crate::backend::{MemoryBackend, StorageBackend, StorageResult};
use crate::container::object::Object;
use crate::net::proto::ObjectId;
use hashbrown::HashMap;
use std::sync::Arc;

pub struct Container {
    objects: HashMap<ObjectId, Object>,
    storage: Arc<dyn StorageBackend>,
    memory: Arc<dyn MemoryBackend>,
    alignment: u64,
}

impl Container {
    /// Container using the given backends. `alignment` forces a minimal
    /// segment granularity on every object; zero disables it.
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        memory: Arc<dyn MemoryBackend>,
        alignment: u64,
    ) -> Container {
        Container {
            objects: HashMap::new(),
            storage,
            memory,
            alignment,
        }
    }

    /// Look the object up, lazily creating an empty one on first access.
    pub fn get_object(&mut self, object_id: ObjectId) -> &mut Object {
        let storage = &self.storage;
        let memory = &self.memory;
        let alignment = self.alignment;

        self.objects.entry(object_id).or_insert_with(|| {
            Object::new(storage.clone(), memory.clone(), object_id, alignment)
        })
    }

    /// Non creating lookup.
    pub fn has_object(&self, object_id: ObjectId) -> bool {
        self.objects.contains_key(&object_id)
    }

    /// Change the alignment applied to objects created from now on.
    pub fn set_alignment(&mut self, alignment: u64) {
        self.alignment = alignment;
    }

    /// Full copy on write of `source` under `dest`. Fails when the source
    /// is unknown, or when the destination exists and `allow_exist` is not
    /// set.
    pub fn make_object_full_cow(
        &mut self,
        source: ObjectId,
        dest: ObjectId,
        allow_exist: bool,
    ) -> StorageResult<bool> {
        if self.objects.contains_key(&dest) && !allow_exist {
            return Ok(false);
        }

        let target = match self.objects.get(&source) {
            Some(source_object) => source_object.make_full_copy_on_write(dest)?,
            None => return Ok(false),
        };

        self.objects.insert(dest, target);
        Ok(true)
    }

    /// Ranged copy on write of `[offset, offset+size)` from `source` into
    /// `dest`, which is created when absent.
    pub fn make_object_range_cow(
        &mut self,
        source: ObjectId,
        dest: ObjectId,
        offset: u64,
        size: u64,
    ) -> StorageResult<bool> {
        if !self.objects.contains_key(&source) {
            return Ok(false);
        }

        // Take the destination out so source and destination can be
        // borrowed at the same time.
        let mut target = match self.objects.remove(&dest) {
            Some(target) => target,
            None => Object::new(
                self.storage.clone(),
                self.memory.clone(),
                dest,
                self.alignment,
            ),
        };

        let source_object = self
            .objects
            .get(&source)
            .expect("Source object vanished during range cow");
        let result = target.range_copy_on_write(source_object, offset, size);

        self.objects.insert(dest, target);
        result.map(|()| true)
    }

    /// Sweep the consistency trackers of every object after a TCP client
    /// disconnect.
    pub fn on_client_disconnect(&self, tcp_client_id: u64) {
        for object in self.objects.values() {
            object.on_client_disconnect(tcp_client_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MallocBackend, MemoryStorage};
    use crate::container::consistency::ConsistencyAccessMode;

    fn make_container() -> Container {
        let storage = Arc::new(MemoryStorage::new());
        let memory: Arc<dyn MemoryBackend> = Arc::new(MallocBackend::new(None));
        Container::new(storage, memory, 0)
    }

    #[test]
    fn test_get_object_creates_lazily() {
        let mut container = make_container();
        let id = ObjectId::new(10, 20);

        assert!(!container.has_object(id));

        let object = container.get_object(id);
        assert_eq!(object.object_id(), id);

        assert!(container.has_object(id));
        assert!(!container.has_object(ObjectId::new(10, 21)));
    }

    #[test]
    fn test_full_cow_respects_allow_exist() {
        let mut container = make_container();
        let source = ObjectId::new(10, 20);
        let dest = ObjectId::new(10, 21);

        container.get_object(source).fill_buffer(0, 100, 1).unwrap();
        container.get_object(dest);

        // Existing destination is rejected unless allowed.
        assert!(!container.make_object_full_cow(source, dest, false).unwrap());
        assert!(container.make_object_full_cow(source, dest, true).unwrap());

        assert!(container.get_object(dest).check_buffer(0, 100, 1));
    }

    #[test]
    fn test_full_cow_requires_source() {
        let mut container = make_container();

        let copied = container
            .make_object_full_cow(ObjectId::new(1, 1), ObjectId::new(1, 2), true)
            .unwrap();

        assert!(!copied);
    }

    #[test]
    fn test_range_cow_creates_destination() {
        let mut container = make_container();
        let source = ObjectId::new(10, 20);
        let dest = ObjectId::new(10, 25);

        container.get_object(source).fill_buffer(0, 128, 7).unwrap();

        assert!(container
            .make_object_range_cow(source, dest, 0, 128)
            .unwrap());

        assert!(container.has_object(dest));
        assert!(container.get_object(dest).check_buffer(0, 128, 7));
    }

    #[test]
    fn test_set_alignment_applies_to_new_objects() {
        let mut container = make_container();

        container.set_alignment(4096);

        let object = container.get_object(ObjectId::new(5, 5));
        assert_eq!(object.alignment(), 4096);
    }

    #[test]
    fn test_disconnect_sweeps_all_objects() {
        let mut container = make_container();
        let first = ObjectId::new(1, 1);
        let second = ObjectId::new(2, 2);

        container
            .get_object(first)
            .consistency_tracker()
            .register_range(42, 0, 100, ConsistencyAccessMode::Write);
        container
            .get_object(second)
            .consistency_tracker()
            .register_range(42, 0, 100, ConsistencyAccessMode::Read);

        container.on_client_disconnect(42);

        assert_eq!(container.get_object(first).consistency_tracker().len(), 0);
        assert_eq!(container.get_object(second).consistency_tracker().len(), 0);
    }
}
