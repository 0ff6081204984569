//! Append-only JSON Lines output shared by concurrent writers.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// One JSON value per line; each call writes whole lines and flushes before
/// releasing the lock, so lines from different tasks never interleave.
#[derive(Debug)]
pub struct JsonlWriter {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlWriter {
    /// Open `path` for appending, creating it and its parent directory.
    pub fn append(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write<T: Serialize>(&self, value: &T) -> io::Result<()> {
        self.write_all(std::slice::from_ref(value))
    }

    pub fn write_all<T: Serialize>(&self, values: &[T]) -> io::Result<()> {
        let mut buf = Vec::new();
        for value in values {
            serde_json::to_writer(&mut buf, value)?;
            buf.push(b'\n');
        }
        let mut file = self.file.lock();
        file.write_all(&buf)?;
        file.flush()
    }
}

/// Read every parseable line of a JSONL file.
///
/// A torn final line (from an interrupted run) is skipped with a warning
/// rather than failing the whole read.
pub fn read_lines<T: DeserializeOwned>(path: &Path) -> io::Result<Vec<T>> {
    let reader = BufReader::new(File::open(path)?);
    let mut out = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(v) => out.push(v),
            Err(e) => {
                tracing::warn!(path = %path.display(), line = idx + 1, error = %e, "skipping malformed JSONL line")
            }
        }
    }
    Ok(out)
}
