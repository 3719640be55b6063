// Copyright © 2024 Pathway

use std::fs;
use std::path::{Path, PathBuf};

use glob::Pattern;
use log::warn;

use crate::fs_helpers::ensure_directory;

use super::{Error, PersistenceBackend};

const PARTIAL_SUFFIX: &str = ".partial";

/// One file per key below `root`. A value is written next to its target
/// and renamed into place, so readers never observe half of it.
#[derive(Debug)]
pub struct FilesystemKVStorage {
    root: PathBuf,
    everything_below_root: Pattern,
}

impl FilesystemKVStorage {
    pub fn new(root: &Path) -> Result<Self, Error> {
        let root_str = root.to_str().ok_or(Error::PathIsNotUtf8)?;
        let everything_below_root = Pattern::new(&format!("{root_str}/**/*"))?;
        ensure_directory(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            everything_below_root,
        })
    }

    fn key_of(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let Some(key) = relative.to_str() else {
            warn!("skipping a stored object with a non UTF-8 path: {path:?}");
            return None;
        };
        (!key.ends_with(PARTIAL_SUFFIX)).then(|| key.to_string())
    }
}

impl PersistenceBackend for FilesystemKVStorage {
    fn list_keys(&self) -> Result<Vec<String>, Error> {
        let mut keys = Vec::new();
        for path in glob::glob(self.everything_below_root.as_str())?.flatten() {
            if path.is_file() {
                keys.extend(self.key_of(&path));
            }
        }
        Ok(keys)
    }

    fn get_value(&self, key: &str) -> Result<Vec<u8>, Error> {
        let path = self.root.join(key);
        if !path.is_file() {
            return Err(Error::NoSuchKey(key.to_string()));
        }
        Ok(fs::read(path)?)
    }

    fn put_value(&mut self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        let target = self.root.join(key);
        if let Some(parent) = target.parent() {
            ensure_directory(parent)?;
        }
        let partial = self.root.join(format!("{key}{PARTIAL_SUFFIX}"));
        fs::write(&partial, value)?;
        fs::rename(&partial, &target)?;
        Ok(())
    }
}
