use std::collections::HashMap;

/// Opaque reference to a byte buffer held by a [`BlobStore`].
///
/// Handles stand in for the revocable object URLs of the original client:
/// each one has exactly one owning record, release is called exactly once by
/// that owner, and read-only consumers (the comparison overlay) copy the
/// handle but never release it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobHandle(u64);

/// In-memory registry of display/download buffers with explicit lifetimes.
///
/// `live()` exists so tests can assert that every acquire was matched by a
/// release when records are removed.
#[derive(Debug, Default)]
pub struct BlobStore {
    next_id: u64,
    slots: HashMap<u64, Vec<u8>>,
}

impl BlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&mut self, bytes: Vec<u8>) -> BlobHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.slots.insert(id, bytes);
        BlobHandle(id)
    }

    pub fn bytes(&self, handle: BlobHandle) -> Option<&[u8]> {
        self.slots.get(&handle.0).map(Vec::as_slice)
    }

    pub fn is_live(&self, handle: BlobHandle) -> bool {
        self.slots.contains_key(&handle.0)
    }

    /// Releases the buffer behind `handle`. Returns false when the handle
    /// was already released, which indicates an ownership bug upstream.
    pub fn release(&mut self, handle: BlobHandle) -> bool {
        self.slots.remove(&handle.0).is_some()
    }

    pub fn live(&self) -> usize {
        self.slots.len()
    }
}
