//! In-memory object store.

use std::{
    collections::HashMap,
    io,
    sync::{
        RwLock,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;

use super::object::ObjectStore;

/// In-memory object store.
///
/// Useful for development and tests.
/// Data is lost on restart.
pub struct MemoryStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
    puts: AtomicUsize,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            puts: AtomicUsize::new(0),
        }
    }

    /// Snapshot of an object's current contents.
    #[must_use]
    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.read().ok()?.get(key).cloned()
    }

    /// Number of successful writes so far.
    #[must_use]
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned(e: impl std::fmt::Display) -> io::Error {
    io::Error::other(e.to_string())
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.objects.read().map_err(poisoned)?.get(key).cloned())
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> io::Result<()> {
        self.objects
            .write()
            .map_err(poisoned)?
            .insert(key.to_string(), body);
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
