// Copyright © 2024 Pathway

use std::any::type_name;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::Utf8Error;
use std::sync::{Arc, Mutex};

use crate::connectors::data_format::{Formatted, FormatterError};

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum WriteError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Utf8(#[from] Utf8Error),

    #[error(transparent)]
    Formatter(#[from] FormatterError),
}

/// How rows arrive from a source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectorMode {
    /// Everything is known upfront and lands at one time.
    Static,
    /// Rows keep coming until the source is closed.
    Streaming,
}

/// Destination for formatted lines. `flush` runs at the end of every time,
/// with `forced` set once the dataflow finishes.
pub trait Writer: Send {
    fn write(&mut self, data: Formatted) -> Result<(), WriteError>;

    fn flush(&mut self, _forced: bool) -> Result<(), WriteError> {
        Ok(())
    }

    fn name(&self) -> String {
        let full = type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full).to_string()
    }
}

pub struct FileWriter {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl FileWriter {
    pub fn create(path: &Path) -> Result<Self, WriteError> {
        Ok(Self {
            writer: BufWriter::new(File::create(path)?),
            path: path.to_path_buf(),
        })
    }
}

impl Writer for FileWriter {
    fn write(&mut self, data: Formatted) -> Result<(), WriteError> {
        for line in data.lines {
            self.writer.write_all(&line)?;
            self.writer.write_all(b"\n")?;
        }
        Ok(())
    }

    fn flush(&mut self, _forced: bool) -> Result<(), WriteError> {
        Ok(self.writer.flush()?)
    }

    fn name(&self) -> String {
        format!("File({})", self.path.display())
    }
}

/// Keeps the written lines, readable through any clone of the writer.
#[derive(Debug, Clone, Default)]
pub struct MemoryWriter {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl Writer for MemoryWriter {
    fn write(&mut self, data: Formatted) -> Result<(), WriteError> {
        let decoded = data
            .lines
            .into_iter()
            .map(|line| String::from_utf8(line).map_err(|e| e.utf8_error()))
            .collect::<Result<Vec<_>, _>>()?;
        self.lines.lock().unwrap().extend(decoded);
        Ok(())
    }
}
