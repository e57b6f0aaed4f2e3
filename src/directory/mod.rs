//! Directory abstraction: named, renamable, lockable byte blobs
//!
//! All segment and commit I/O goes through [`Directory`]. The index never
//! assumes anything about physical layout beyond:
//! - files are written once through an [`IndexOutput`] and never modified
//! - `rename_file` is atomic
//! - `sync` makes written bytes durable
//! - at most one holder of a named lock exists at a time

mod fs;
mod ram;

use std::fmt;
use std::io::{self, Write};

use bytes::Bytes;

use crate::error::Result;

pub use fs::FsDirectory;
pub use ram::RamDirectory;

/// Name of the lock file held by an open index writer
pub const WRITE_LOCK_NAME: &str = "write.lock";

/// A file being written. Bytes become visible to readers on `close`.
pub trait IndexOutput: Write + Send {
    /// Name of the file being written
    fn name(&self) -> &str;

    /// Bytes written so far
    fn bytes_written(&self) -> u64;

    /// Finalize the file
    fn close(self: Box<Self>) -> io::Result<()>;
}

/// An obtained lock; dropping it releases the lock.
pub trait Lock: Send + fmt::Debug {
    /// Verify the lock is still held
    fn ensure_valid(&self) -> io::Result<()>;
}

/// Durable file storage used by the index
pub trait Directory: Send + Sync + fmt::Debug {
    /// All file names, sorted
    fn list_all(&self) -> io::Result<Vec<String>>;

    fn file_exists(&self, name: &str) -> bool;

    fn file_length(&self, name: &str) -> io::Result<u64>;

    /// Read the whole file. The returned bytes stay valid after the file
    /// is deleted from the directory.
    fn open_input(&self, name: &str) -> io::Result<Bytes>;

    /// Create a new file. Fails if the file already exists.
    fn create_output(&self, name: &str) -> io::Result<Box<dyn IndexOutput>>;

    fn delete_file(&self, name: &str) -> io::Result<()>;

    /// Atomically replace `dest` with `source`
    fn rename_file(&self, source: &str, dest: &str) -> io::Result<()>;

    /// Make the content of the named files durable
    fn sync(&self, names: &[String]) -> io::Result<()>;

    /// Make renames and deletions durable
    fn sync_meta_data(&self) -> io::Result<()>;

    /// Obtain the named lock, failing immediately with `LockHeld` if it is
    /// already held. There is no waiting or retry.
    fn obtain_lock(&self, name: &str) -> Result<Box<dyn Lock>>;
}

/// Write a whole file in one call
pub fn write_file(dir: &dyn Directory, name: &str, data: &[u8]) -> io::Result<()> {
    let mut out = dir.create_output(name)?;
    out.write_all(data)?;
    out.close()
}

/// Delete every file whose name starts with `prefix`, ignoring failures.
/// Returns the names that were removed.
pub fn delete_with_prefix(dir: &dyn Directory, prefix: &str) -> Vec<String> {
    let names = match dir.list_all() {
        Ok(names) => names,
        Err(_) => return Vec::new(),
    };
    names
        .into_iter()
        .filter(|name| name.starts_with(prefix))
        .filter(|name| dir.delete_file(name).is_ok())
        .collect()
}
