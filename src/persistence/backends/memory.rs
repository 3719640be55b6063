// Copyright © 2024 Pathway

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{Error, PersistenceBackend};

/// Key-value storage held in memory. Clones share their contents, so the
/// caller can keep a handle and pass the same storage to a later run.
#[derive(Debug, Default, Clone)]
#[allow(clippy::module_name_repetitions)]
pub struct MemoryKVStorage {
    objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryKVStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces a stored object in place, bypassing the writers.
    pub fn overwrite(&self, key: &str, value: Vec<u8>) {
        self.objects.lock().unwrap().insert(key.to_string(), value);
    }
}

impl PersistenceBackend for MemoryKVStorage {
    fn list_keys(&self) -> Result<Vec<String>, Error> {
        Ok(self.objects.lock().unwrap().keys().cloned().collect())
    }

    fn get_value(&self, key: &str) -> Result<Vec<u8>, Error> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NoSuchKey(key.to_string()))
    }

    fn put_value(&mut self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        self.objects.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }
}
