// Copyright © 2024 Pathway

use log::warn;

use crate::engine::{Key, Value};
use crate::persistence::config::SharedBackend;
use crate::persistence::{PersistenceError, PersistentId};

/// Results of an external function stored by the hash of its arguments.
pub struct UdfCache {
    backend: SharedBackend,
    persistent_id: PersistentId,
}

impl UdfCache {
    pub fn new(backend: SharedBackend, persistent_id: PersistentId) -> Self {
        Self {
            backend,
            persistent_id,
        }
    }

    fn object_key(&self, args: &[Value]) -> String {
        let hash = Key::for_values(args).0;
        format!("udf-cache/{}/{hash:032x}", self.persistent_id)
    }

    /// A cached result, `None` if absent. An entry that can't be decoded is
    /// treated as absent and recomputed.
    pub fn get(&self, args: &[Value]) -> Option<Value> {
        let key = self.object_key(args);
        let bytes = self.backend.lock().unwrap().get_value(&key).ok()?;
        match bincode::deserialize(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("ignoring unreadable cached result {key:?}: {e}");
                None
            }
        }
    }

    pub fn put(&self, args: &[Value], value: &Value) -> Result<(), PersistenceError> {
        let key = self.object_key(args);
        let bytes =
            bincode::serialize(value).map_err(|e| PersistenceError::Serialization(e.to_string()))?;
        self.backend.lock().unwrap().put_value(&key, bytes)?;
        Ok(())
    }
}
