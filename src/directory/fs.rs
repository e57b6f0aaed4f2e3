use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::{debug, warn};

use super::{Directory, IndexOutput, Lock};
use crate::error::{Result, TesseraError};

/// Filesystem directory rooted at a path.
///
/// Locks are lock files created with `create_new`, so a lock left behind
/// by a crashed process must be removed by the operator.
#[derive(Debug, Clone)]
pub struct FsDirectory {
    root: PathBuf,
}

impl FsDirectory {
    /// Open (creating if needed) a directory
    pub fn open(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl Directory for FsDirectory {
    fn list_all(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn file_exists(&self, name: &str) -> bool {
        self.resolve(name).is_file()
    }

    fn file_length(&self, name: &str) -> io::Result<u64> {
        Ok(fs::metadata(self.resolve(name))?.len())
    }

    fn open_input(&self, name: &str) -> io::Result<Bytes> {
        Ok(Bytes::from(fs::read(self.resolve(name))?))
    }

    fn create_output(&self, name: &str) -> io::Result<Box<dyn IndexOutput>> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.resolve(name))?;
        Ok(Box::new(FsOutput {
            name: name.to_string(),
            writer: BufWriter::new(file),
            written: 0,
        }))
    }

    fn delete_file(&self, name: &str) -> io::Result<()> {
        fs::remove_file(self.resolve(name))
    }

    fn rename_file(&self, source: &str, dest: &str) -> io::Result<()> {
        fs::rename(self.resolve(source), self.resolve(dest))
    }

    fn sync(&self, names: &[String]) -> io::Result<()> {
        for name in names {
            File::open(self.resolve(name))?.sync_all()?;
        }
        Ok(())
    }

    fn sync_meta_data(&self) -> io::Result<()> {
        // Directory fsync is not supported everywhere
        if let Err(e) = File::open(&self.root).and_then(|dir| dir.sync_all()) {
            debug!(error = %e, "Directory metadata sync unavailable");
        }
        Ok(())
    }

    fn obtain_lock(&self, name: &str) -> Result<Box<dyn Lock>> {
        let path = self.resolve(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Box::new(FsLock { path })),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                warn!(lock = %path.display(), "Lock already held");
                Err(TesseraError::LockHeld(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

struct FsOutput {
    name: String,
    writer: BufWriter<File>,
    written: u64,
}

impl Write for FsOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.writer.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl IndexOutput for FsOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn bytes_written(&self) -> u64 {
        self.written
    }

    fn close(mut self: Box<Self>) -> io::Result<()> {
        self.writer.flush()
    }
}

#[derive(Debug)]
struct FsLock {
    path: PathBuf,
}

impl Lock for FsLock {
    fn ensure_valid(&self) -> io::Result<()> {
        if self.path.is_file() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("Lock file {} disappeared", self.path.display()),
            ))
        }
    }
}

impl Drop for FsLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), error = %e, "Failed to release lock");
        }
    }
}
