use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use super::{Directory, IndexOutput, Lock};
use crate::error::{Result, TesseraError};

/// In-memory directory for testing and small indexes.
///
/// Clones share the same files and locks. The directory counts every
/// `open_input` call so tests can bound how many file reads an operation
/// performs.
#[derive(Default, Clone)]
pub struct RamDirectory {
    files: Arc<RwLock<BTreeMap<String, Bytes>>>,
    locks: Arc<Mutex<HashSet<String>>>,
    inputs_opened: Arc<AtomicU64>,
}

impl RamDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `open_input` calls so far
    pub fn inputs_opened(&self) -> u64 {
        self.inputs_opened.load(Ordering::SeqCst)
    }

    /// Total bytes held
    pub fn size_in_bytes(&self) -> u64 {
        self.files.read().values().map(|b| b.len() as u64).sum()
    }
}

impl fmt::Debug for RamDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RamDirectory")
            .field("files", &self.files.read().len())
            .finish()
    }
}

impl Directory for RamDirectory {
    fn list_all(&self) -> io::Result<Vec<String>> {
        Ok(self.files.read().keys().cloned().collect())
    }

    fn file_exists(&self, name: &str) -> bool {
        self.files.read().contains_key(name)
    }

    fn file_length(&self, name: &str) -> io::Result<u64> {
        self.files
            .read()
            .get(name)
            .map(|data| data.len() as u64)
            .ok_or_else(|| not_found(name))
    }

    fn open_input(&self, name: &str) -> io::Result<Bytes> {
        let data = self.files.read().get(name).cloned().ok_or_else(|| not_found(name))?;
        self.inputs_opened.fetch_add(1, Ordering::SeqCst);
        Ok(data)
    }

    fn create_output(&self, name: &str) -> io::Result<Box<dyn IndexOutput>> {
        if self.files.read().contains_key(name) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("File already exists: {}", name),
            ));
        }
        Ok(Box::new(RamOutput {
            name: name.to_string(),
            buffer: Vec::new(),
            files: Arc::clone(&self.files),
        }))
    }

    fn delete_file(&self, name: &str) -> io::Result<()> {
        self.files
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found(name))
    }

    fn rename_file(&self, source: &str, dest: &str) -> io::Result<()> {
        let mut files = self.files.write();
        let data = files.remove(source).ok_or_else(|| not_found(source))?;
        files.insert(dest.to_string(), data);
        Ok(())
    }

    fn sync(&self, names: &[String]) -> io::Result<()> {
        let files = self.files.read();
        match names.iter().find(|name| !files.contains_key(name.as_str())) {
            Some(missing) => Err(not_found(missing)),
            None => Ok(()),
        }
    }

    fn sync_meta_data(&self) -> io::Result<()> {
        Ok(())
    }

    fn obtain_lock(&self, name: &str) -> Result<Box<dyn Lock>> {
        let mut locks = self.locks.lock();
        if !locks.insert(name.to_string()) {
            return Err(TesseraError::LockHeld(name.to_string()));
        }
        Ok(Box::new(RamLock {
            name: name.to_string(),
            locks: Arc::clone(&self.locks),
        }))
    }
}

struct RamOutput {
    name: String,
    buffer: Vec<u8>,
    files: Arc<RwLock<BTreeMap<String, Bytes>>>,
}

impl Write for RamOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl IndexOutput for RamOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn bytes_written(&self) -> u64 {
        self.buffer.len() as u64
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        let RamOutput { name, buffer, files } = *self;
        files.write().insert(name, Bytes::from(buffer));
        Ok(())
    }
}

#[derive(Debug)]
struct RamLock {
    name: String,
    locks: Arc<Mutex<HashSet<String>>>,
}

impl Lock for RamLock {
    fn ensure_valid(&self) -> io::Result<()> {
        if self.locks.lock().contains(&self.name) {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Other,
                format!("Lock {} was released", self.name),
            ))
        }
    }
}

impl Drop for RamLock {
    fn drop(&mut self) {
        self.locks.lock().remove(&self.name);
    }
}

fn not_found(name: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("File not found: {}", name))
}
