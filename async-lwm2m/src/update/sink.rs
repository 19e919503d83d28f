// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Destinations for downloaded or pushed package bytes.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Failure to store package bytes.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The package does not fit.
    #[error("not enough space for package")]
    NotEnoughSpace,

    /// A buffer for the package could not be allocated.
    #[error("out of memory")]
    OutOfMemory,

    /// The backing file failed.
    #[error("package storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage for the bytes of one package.
pub trait PackageSink: Send + std::fmt::Debug {
    /// Prepares for writing. Content beyond `resume_offset` is discarded;
    /// returns the length kept, which may be less than `resume_offset`.
    fn open(&mut self, resume_offset: u64) -> Result<u64, SinkError>;

    /// Appends bytes.
    fn write(&mut self, data: &[u8]) -> Result<(), SinkError>;

    /// Bytes stored so far.
    fn len(&self) -> u64;

    /// True when nothing is stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The whole package.
    fn read_all(&mut self) -> Result<Vec<u8>, SinkError>;

    /// Drops the stored bytes.
    fn discard(&mut self) -> Result<(), SinkError>;

    /// Stores later packages at `path`. Returns false for sinks that are
    /// not backed by a file.
    fn relocate(&mut self, _path: &Path) -> bool {
        false
    }
}

/// A package stored in a file.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: Option<File>,
    len: u64,
    capacity: Option<u64>,
}

impl FileSink {
    /// Creates a sink writing to `path`.
    pub fn new<P: Into<PathBuf>>(path: P) -> FileSink {
        let path = path.into();
        let len = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        FileSink {
            path,
            file: None,
            len,
            capacity: None,
        }
    }

    /// Limits the package size; longer packages fail with
    /// [`SinkError::NotEnoughSpace`].
    pub fn with_capacity(mut self, capacity: u64) -> FileSink {
        self.capacity = Some(capacity);
        self
    }

    /// The backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Moves storage to another file. Bytes already stored stay in the old
    /// one.
    pub fn set_path<P: Into<PathBuf>>(&mut self, path: P) {
        self.file = None;
        self.path = path.into();
        self.len = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
    }
}

impl PackageSink for FileSink {
    fn open(&mut self, resume_offset: u64) -> Result<u64, SinkError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        let keep = file.metadata()?.len().min(resume_offset);
        file.set_len(keep)?;
        file.seek(SeekFrom::End(0))?;
        self.file = Some(file);
        self.len = keep;
        Ok(keep)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), SinkError> {
        if let Some(capacity) = self.capacity {
            if self.len + data.len() as u64 > capacity {
                return Err(SinkError::NotEnoughSpace);
            }
        }
        if self.file.is_none() {
            self.open(self.len)?;
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(data)?;
            self.len += data.len() as u64;
        }
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn read_all(&mut self) -> Result<Vec<u8>, SinkError> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        let mut out = Vec::new();
        match File::open(&self.path) {
            Ok(mut file) => {
                file.read_to_end(&mut out)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
            Err(e) => return Err(e.into()),
        }
        Ok(out)
    }

    fn discard(&mut self) -> Result<(), SinkError> {
        self.file = None;
        self.len = 0;
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn relocate(&mut self, path: &Path) -> bool {
        self.set_path(path);
        true
    }
}

/// A package kept in memory. Clones share the buffer, so a package survives
/// a simulated restart.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    data: Arc<Mutex<Vec<u8>>>,
    capacity: Option<usize>,
}

impl MemorySink {
    /// Creates an empty unbounded sink.
    pub fn new() -> MemorySink {
        Default::default()
    }

    /// Creates an empty sink holding at most `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> MemorySink {
        MemorySink {
            capacity: Some(capacity),
            ..Default::default()
        }
    }

    fn with_data<T, F: FnOnce(&mut Vec<u8>) -> T>(&self, f: F) -> Result<T, SinkError> {
        self.data
            .lock()
            .map(|mut data| f(&mut data))
            .map_err(|_| SinkError::OutOfMemory)
    }
}

impl PackageSink for MemorySink {
    fn open(&mut self, resume_offset: u64) -> Result<u64, SinkError> {
        self.with_data(|data| {
            data.truncate(resume_offset.min(data.len() as u64) as usize);
            data.len() as u64
        })
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), SinkError> {
        let capacity = self.capacity;
        self.with_data(|data| match capacity {
            Some(capacity) if data.len() + chunk.len() > capacity => {
                Err(SinkError::NotEnoughSpace)
            }
            _ => {
                data.extend_from_slice(chunk);
                Ok(())
            }
        })?
    }

    fn len(&self) -> u64 {
        self.with_data(|data| data.len() as u64).unwrap_or(0)
    }

    fn read_all(&mut self) -> Result<Vec<u8>, SinkError> {
        self.with_data(|data| data.clone())
    }

    fn discard(&mut self) -> Result<(), SinkError> {
        self.with_data(|data| data.clear())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_sink_resume_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::new(dir.path().join("pkg"));
        assert_eq!(0, sink.open(0).unwrap());
        sink.write(b"hello ").unwrap();
        sink.write(b"world").unwrap();
        assert_eq!(11, sink.len());

        let mut reopened = FileSink::new(dir.path().join("pkg"));
        assert_eq!(11, reopened.len());
        assert_eq!(6, reopened.open(6).unwrap());
        reopened.write(b"there").unwrap();
        assert_eq!(b"hello there".to_vec(), reopened.read_all().unwrap());

        assert_eq!(11, reopened.open(100).unwrap());

        reopened.discard().unwrap();
        assert_eq!(0, reopened.len());
        assert!(reopened.read_all().unwrap().is_empty());
    }

    #[test]
    fn capacity() {
        let mut sink = MemorySink::with_capacity(4);
        sink.write(b"abc").unwrap();
        assert!(matches!(sink.write(b"de"), Err(SinkError::NotEnoughSpace)));
        assert_eq!(3, sink.len());

        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::new(dir.path().join("pkg")).with_capacity(2);
        sink.open(0).unwrap();
        assert!(matches!(sink.write(b"abc"), Err(SinkError::NotEnoughSpace)));
    }

    #[test]
    fn memory_sink_is_shared() {
        let mut sink = MemorySink::new();
        let mut other = sink.clone();
        sink.write(b"abc").unwrap();
        assert_eq!(2, other.open(2).unwrap());
        assert_eq!(b"ab".to_vec(), sink.read_all().unwrap());
    }
}
