// Copyright © 2024 Pathway

use std::fs;
use std::io;
use std::path::Path;

/// Creates `path` with its parents. An existing directory is fine, an
/// existing file is an error.
pub fn ensure_directory(path: &Path) -> io::Result<()> {
    if path.exists() && !path.is_dir() {
        return Err(io::Error::other(format!(
            "{} exists and is not a directory",
            path.display()
        )));
    }
    fs::create_dir_all(path)
}
