//! The storage backend seam: the four operations the object cache needs
//! from the object store, plus an in-memory implementation serving demos
//! and tests.

use crate::net::proto::ObjectId;
use hashbrown::HashMap;
use std::sync::Mutex;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum StorageError {
    ShortRead { expected: usize, got: usize },
    ShortWrite { expected: usize, got: usize },
    BackendFailure(String),
}

/// Moves object bytes between the cache and the object store. The COW
/// duplication has a portable default built from `pread` and `pwrite`;
/// backends with server side duplication override it.
pub trait StorageBackend: Send + Sync {
    /// Read a range of the object into the buffer, returning the number of
    /// bytes read. Unknown ranges read as zeroes on backends that support
    /// sparse objects.
    fn pread(&self, object_id: ObjectId, buffer: &mut [u8], offset: u64) -> StorageResult<usize>;

    /// Write the buffer at the given object offset, returning the number of
    /// bytes written.
    fn pwrite(&self, object_id: ObjectId, buffer: &[u8], offset: u64) -> StorageResult<usize>;

    /// Create the object before first access.
    fn create(&self, object_id: ObjectId) -> StorageResult<()>;

    /// Duplicate an object range under another id, used for the clean spans
    /// of a copy on write.
    fn make_cow_segment(
        &self,
        source: ObjectId,
        dest: ObjectId,
        offset: u64,
        size: u64,
    ) -> StorageResult<usize> {
        let mut scratch = vec![0u8; size as usize];

        let got = self.pread(source, &mut scratch, offset)?;
        if got != size as usize {
            return Err(StorageError::ShortRead {
                expected: size as usize,
                got,
            });
        }

        let put = self.pwrite(dest, &scratch, offset)?;
        if put != size as usize {
            return Err(StorageError::ShortWrite {
                expected: size as usize,
                got: put,
            });
        }

        Ok(size as usize)
    }
}

/// Operation kinds recorded by [`MemoryStorage`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StorageOpKind {
    Pread,
    Pwrite,
    Create,
    CowSegment,
}

/// One recorded operation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct StorageOp {
    pub kind: StorageOpKind,
    pub object_id: ObjectId,
    pub offset: u64,
    pub size: usize,
}

struct MemoryStorageState {
    objects: HashMap<ObjectId, Vec<u8>>,
    ops: Vec<StorageOp>,
}

/// In-memory storage: per object byte vectors plus an operation journal so
/// tests can pin the traffic the cache generates.
pub struct MemoryStorage {
    state: Mutex<MemoryStorageState>,
}

impl MemoryStorage {
    pub fn new() -> MemoryStorage {
        MemoryStorage {
            state: Mutex::new(MemoryStorageState {
                objects: HashMap::new(),
                ops: Vec::new(),
            }),
        }
    }

    /// Snapshot of the recorded operations.
    pub fn ops(&self) -> Vec<StorageOp> {
        self.state.lock().expect("Storage lock poisoned").ops.clone()
    }

    /// Recorded operations of one kind.
    pub fn ops_of(&self, kind: StorageOpKind) -> Vec<StorageOp> {
        self.ops().into_iter().filter(|op| op.kind == kind).collect()
    }

    /// Forget the recorded operations.
    pub fn clear_ops(&self) {
        self.state.lock().expect("Storage lock poisoned").ops.clear();
    }

    /// Whether the object was created or written.
    pub fn has_object(&self, object_id: ObjectId) -> bool {
        self.state
            .lock()
            .expect("Storage lock poisoned")
            .objects
            .contains_key(&object_id)
    }

    /// Raw content snapshot of an object.
    pub fn content(&self, object_id: ObjectId) -> Vec<u8> {
        self.state
            .lock()
            .expect("Storage lock poisoned")
            .objects
            .get(&object_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl StorageBackend for MemoryStorage {
    fn pread(&self, object_id: ObjectId, buffer: &mut [u8], offset: u64) -> StorageResult<usize> {
        let mut state = self.state.lock().expect("Storage lock poisoned");
        state.ops.push(StorageOp {
            kind: StorageOpKind::Pread,
            object_id,
            offset,
            size: buffer.len(),
        });

        // Sparse semantics: unwritten ranges read as zeroes.
        for byte in buffer.iter_mut() {
            *byte = 0;
        }

        if let Some(content) = state.objects.get(&object_id) {
            let offset = offset as usize;
            if offset < content.len() {
                let count = buffer.len().min(content.len() - offset);
                buffer[..count].copy_from_slice(&content[offset..offset + count]);
            }
        }

        Ok(buffer.len())
    }

    fn pwrite(&self, object_id: ObjectId, buffer: &[u8], offset: u64) -> StorageResult<usize> {
        let mut state = self.state.lock().expect("Storage lock poisoned");
        state.ops.push(StorageOp {
            kind: StorageOpKind::Pwrite,
            object_id,
            offset,
            size: buffer.len(),
        });

        let end = offset as usize + buffer.len();
        let content = state.objects.entry(object_id).or_insert_with(Vec::new);
        if content.len() < end {
            content.resize(end, 0);
        }
        content[offset as usize..end].copy_from_slice(buffer);

        Ok(buffer.len())
    }

    fn create(&self, object_id: ObjectId) -> StorageResult<()> {
        let mut state = self.state.lock().expect("Storage lock poisoned");
        state.ops.push(StorageOp {
            kind: StorageOpKind::Create,
            object_id,
            offset: 0,
            size: 0,
        });

        state.objects.entry(object_id).or_insert_with(Vec::new);
        Ok(())
    }

    fn make_cow_segment(
        &self,
        source: ObjectId,
        dest: ObjectId,
        offset: u64,
        size: u64,
    ) -> StorageResult<usize> {
        let mut state = self.state.lock().expect("Storage lock poisoned");
        state.ops.push(StorageOp {
            kind: StorageOpKind::CowSegment,
            object_id: dest,
            offset,
            size: size as usize,
        });

        let span = {
            let content = state.objects.get(&source);
            let mut span = vec![0u8; size as usize];
            if let Some(content) = content {
                let offset = offset as usize;
                if offset < content.len() {
                    let count = span.len().min(content.len() - offset);
                    span[..count].copy_from_slice(&content[offset..offset + count]);
                }
            }
            span
        };

        let end = offset as usize + size as usize;
        let content = state.objects.entry(dest).or_insert_with(Vec::new);
        if content.len() < end {
            content.resize(end, 0);
        }
        content[offset as usize..end].copy_from_slice(&span);

        Ok(size as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let storage = MemoryStorage::new();
        let id = ObjectId::new(10, 20);

        storage.pwrite(id, &[1, 2, 3, 4], 100).unwrap();

        let mut buffer = [0u8; 8];
        let count = storage.pread(id, &mut buffer, 100).unwrap();

        assert_eq!(count, 8);
        assert_eq!(&buffer[..4], &[1, 2, 3, 4]);
        assert_eq!(&buffer[4..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_unknown_object_reads_zero() {
        let storage = MemoryStorage::new();

        let mut buffer = [0xffu8; 16];
        storage.pread(ObjectId::new(1, 1), &mut buffer, 0).unwrap();

        assert_eq!(buffer, [0u8; 16]);
    }

    #[test]
    fn test_ops_journal() {
        let storage = MemoryStorage::new();
        let id = ObjectId::new(10, 20);

        storage.create(id).unwrap();
        storage.pwrite(id, &[0u8; 32], 64).unwrap();
        let mut buffer = [0u8; 32];
        storage.pread(id, &mut buffer, 64).unwrap();

        let ops = storage.ops();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0].kind, StorageOpKind::Create);
        assert_eq!(ops[1].kind, StorageOpKind::Pwrite);
        assert_eq!(ops[1].offset, 64);
        assert_eq!(ops[2].kind, StorageOpKind::Pread);
    }

    #[test]
    fn test_cow_segment_copies_bytes() {
        let storage = MemoryStorage::new();
        let source = ObjectId::new(10, 20);
        let dest = ObjectId::new(10, 21);

        storage.pwrite(source, &[9u8; 64], 0).unwrap();
        storage.make_cow_segment(source, dest, 0, 64).unwrap();

        assert_eq!(storage.content(dest), vec![9u8; 64]);
    }
}
