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

//! Persistence of update state across process restarts.
//!
//! Each state machine serializes a flat record with [`RecordWriter`] and
//! reads it back with [`RecordReader`]. Readers ignore trailing bytes and
//! treat missing trailing fields as defaults, so records may grow by
//! appending fields.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Failure to load or store persisted state.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// The backing file could not be read or written.
    #[error("persistence I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The record is shorter than its mandatory fields.
    #[error("corrupt persisted state")]
    Corrupt,

    /// The record was written by an incompatible format.
    #[error("unsupported persisted state format {0}")]
    UnsupportedFormat(u8),
}

/// Storage for one state record.
pub trait StateStore: Send + std::fmt::Debug {
    /// The stored record, if any.
    fn load(&self) -> Result<Option<Vec<u8>>, PersistError>;

    /// Replaces the stored record. Readers see either the old or the new
    /// record, never a mix.
    fn store(&mut self, record: &[u8]) -> Result<(), PersistError>;

    /// Removes the stored record.
    fn clear(&mut self) -> Result<(), PersistError>;
}

/// A record in a file, replaced atomically by writing a temporary file in
/// the same directory and renaming it over the old one.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Creates a store backed by `path`.
    pub fn new<P: Into<PathBuf>>(path: P) -> FileStore {
        FileStore { path: path.into() }
    }

    /// The backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for FileStore {
    fn load(&self) -> Result<Option<Vec<u8>>, PersistError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&mut self, record: &[u8]) -> Result<(), PersistError> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut file = tempfile::NamedTempFile::new_in(&dir)?;
        file.write_all(record)?;
        file.as_file().sync_all()?;
        file.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    fn clear(&mut self) -> Result<(), PersistError> {
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// An in-memory record. Clones share the record, which lets tests model a
/// restart by handing a clone to a fresh state machine.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    record: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> MemoryStore {
        Default::default()
    }
}

impl StateStore for MemoryStore {
    fn load(&self) -> Result<Option<Vec<u8>>, PersistError> {
        Ok(self.record.lock().map(|r| r.clone()).unwrap_or(None))
    }

    fn store(&mut self, record: &[u8]) -> Result<(), PersistError> {
        if let Ok(mut slot) = self.record.lock() {
            *slot = Some(record.to_vec());
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<(), PersistError> {
        if let Ok(mut slot) = self.record.lock() {
            *slot = None;
        }
        Ok(())
    }
}

/// Serializes a record.
#[derive(Debug, Default)]
pub struct RecordWriter {
    buf: Vec<u8>,
}

// Writes into a Vec cannot fail, hence the discarded results below.
impl RecordWriter {
    /// Starts a record of the given format.
    pub fn new(format: u8) -> RecordWriter {
        RecordWriter { buf: vec![format] }
    }

    /// Appends a byte.
    pub fn u8(&mut self, x: u8) -> &mut Self {
        self.buf.push(x);
        self
    }

    /// Appends a boolean.
    pub fn bool(&mut self, x: bool) -> &mut Self {
        self.u8(x as u8)
    }

    /// Appends a big-endian `u32`.
    pub fn u32(&mut self, x: u32) -> &mut Self {
        let _ = self.buf.write_u32::<BigEndian>(x);
        self
    }

    /// Appends a big-endian `u64`.
    pub fn u64(&mut self, x: u64) -> &mut Self {
        let _ = self.buf.write_u64::<BigEndian>(x);
        self
    }

    /// Appends a big-endian `i64`.
    pub fn i64(&mut self, x: i64) -> &mut Self {
        let _ = self.buf.write_i64::<BigEndian>(x);
        self
    }

    /// Appends length-prefixed bytes.
    pub fn bytes(&mut self, x: &[u8]) -> &mut Self {
        let _ = self.buf.write_u16::<BigEndian>(x.len() as u16);
        self.buf.extend_from_slice(x);
        self
    }

    /// Appends a length-prefixed list of big-endian `u16`.
    pub fn u16s(&mut self, x: &[u16]) -> &mut Self {
        let _ = self.buf.write_u16::<BigEndian>(x.len() as u16);
        for value in x {
            let _ = self.buf.write_u16::<BigEndian>(*value);
        }
        self
    }

    /// Appends a length-prefixed string.
    pub fn str(&mut self, x: &str) -> &mut Self {
        self.bytes(x.as_bytes())
    }

    /// Appends an optional byte string.
    pub fn opt_bytes(&mut self, x: Option<&[u8]>) -> &mut Self {
        self.bool(x.is_some());
        if let Some(x) = x {
            self.bytes(x);
        }
        self
    }

    /// The record.
    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// Deserializes a record.
#[derive(Debug)]
pub struct RecordReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> RecordReader<'a> {
    /// Reads the format byte, which must be `format`.
    pub fn new(record: &'a [u8], format: u8) -> Result<RecordReader<'a>, PersistError> {
        let mut cursor = Cursor::new(record);
        let found = cursor.read_u8().map_err(|_| PersistError::Corrupt)?;
        if found != format {
            return Err(PersistError::UnsupportedFormat(found));
        }
        Ok(RecordReader { cursor })
    }

    fn remaining(&self) -> usize {
        let len = self.cursor.get_ref().len() as u64;
        (len - self.cursor.position().min(len)) as usize
    }

    /// True once every byte has been consumed.
    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    /// Reads a mandatory byte.
    pub fn u8(&mut self) -> Result<u8, PersistError> {
        self.cursor.read_u8().map_err(|_| PersistError::Corrupt)
    }

    /// Reads a mandatory boolean.
    pub fn bool(&mut self) -> Result<bool, PersistError> {
        Ok(self.u8()? != 0)
    }

    /// Reads a mandatory `u32`.
    pub fn u32(&mut self) -> Result<u32, PersistError> {
        self.cursor
            .read_u32::<BigEndian>()
            .map_err(|_| PersistError::Corrupt)
    }

    /// Reads a mandatory `u64`.
    pub fn u64(&mut self) -> Result<u64, PersistError> {
        self.cursor
            .read_u64::<BigEndian>()
            .map_err(|_| PersistError::Corrupt)
    }

    /// Reads a mandatory `i64`.
    pub fn i64(&mut self) -> Result<i64, PersistError> {
        self.cursor
            .read_i64::<BigEndian>()
            .map_err(|_| PersistError::Corrupt)
    }

    /// Reads mandatory length-prefixed bytes.
    pub fn bytes(&mut self) -> Result<Vec<u8>, PersistError> {
        let len = self
            .cursor
            .read_u16::<BigEndian>()
            .map_err(|_| PersistError::Corrupt)? as usize;
        let mut out = vec![0u8; len];
        self.cursor
            .read_exact(&mut out)
            .map_err(|_| PersistError::Corrupt)?;
        Ok(out)
    }

    /// Reads a mandatory length-prefixed list of `u16`.
    pub fn u16s(&mut self) -> Result<Vec<u16>, PersistError> {
        let len = self
            .cursor
            .read_u16::<BigEndian>()
            .map_err(|_| PersistError::Corrupt)?;
        (0..len)
            .map(|_| {
                self.cursor
                    .read_u16::<BigEndian>()
                    .map_err(|_| PersistError::Corrupt)
            })
            .collect()
    }

    /// Reads a mandatory length-prefixed string.
    pub fn str(&mut self) -> Result<String, PersistError> {
        String::from_utf8(self.bytes()?).map_err(|_| PersistError::Corrupt)
    }

    /// Reads an optional byte string.
    pub fn opt_bytes(&mut self) -> Result<Option<Vec<u8>>, PersistError> {
        if self.bool()? {
            self.bytes().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Runs `read` if the record continues, otherwise yields `default`.
    /// For fields appended by later formats.
    pub fn or<T, F>(&mut self, default: T, read: F) -> Result<T, PersistError>
    where
        F: FnOnce(&mut Self) -> Result<T, PersistError>,
    {
        if self.is_exhausted() {
            Ok(default)
        } else {
            read(self)
        }
    }
}

/// Writes `record` to `store`, logging rather than propagating a failure:
/// a state machine keeps running on a read-only disk.
pub fn store_logged(store: &mut dyn StateStore, record: &[u8]) {
    if let Err(e) = store.store(record) {
        error!("unable to persist update state: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        RecordWriter::new(1)
            .u8(2)
            .str("coap://127.0.0.1/fw")
            .u64(512)
            .opt_bytes(Some(b"tag"))
            .finish()
    }

    #[test]
    fn round_trip_and_growth() {
        let mut record = sample();
        record.extend_from_slice(&[0xAA, 0xBB]);

        let mut reader = RecordReader::new(&record, 1).unwrap();
        assert_eq!(2, reader.u8().unwrap());
        assert_eq!("coap://127.0.0.1/fw", reader.str().unwrap());
        assert_eq!(512, reader.u64().unwrap());
        assert_eq!(Some(b"tag".to_vec()), reader.opt_bytes().unwrap());
        assert!(!reader.is_exhausted());

        let short = sample();
        let mut reader = RecordReader::new(&short, 1).unwrap();
        reader.u8().unwrap();
        reader.str().unwrap();
        reader.u64().unwrap();
        reader.opt_bytes().unwrap();
        assert_eq!(7, reader.or(7u32, |r| r.u32()).unwrap());
    }

    #[test]
    fn corrupt() {
        assert!(matches!(
            RecordReader::new(&[9], 1),
            Err(PersistError::UnsupportedFormat(9))
        ));
        let mut reader = RecordReader::new(&[1, 0], 1).unwrap();
        assert!(matches!(reader.u32(), Err(PersistError::Corrupt)));
    }

    #[test]
    fn file_store_replaces_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::new(dir.path().join("fw.state"));
        assert!(store.load().unwrap().is_none());

        store.store(b"first").unwrap();
        store.store(b"second").unwrap();
        assert_eq!(Some(b"second".to_vec()), store.load().unwrap());

        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(1, leftovers);

        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
        store.clear().unwrap();
    }

    #[test]
    fn memory_store_is_shared() {
        let mut store = MemoryStore::new();
        let other = store.clone();
        store.store(b"x").unwrap();
        assert_eq!(Some(b"x".to_vec()), other.load().unwrap());
    }
}
