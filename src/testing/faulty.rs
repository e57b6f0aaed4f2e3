//! A directory wrapper that injects I/O failures

use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::directory::{Directory, IndexOutput, Lock};
use crate::error::Result;

#[derive(Debug, Default)]
struct Faults {
    /// Outputs still allowed to close before every further one fails
    outputs_left: Option<u64>,
    /// Outputs whose name contains this fail on close
    matching: Option<String>,
    sync: bool,
    rename: bool,
}

/// Wraps a directory and fails chosen writes.
///
/// A failing output accepts bytes but fails on `close`, so the file never
/// becomes complete; with a filesystem directory a partial file is left
/// behind, as after a crash. Clones share the same fault settings.
#[derive(Clone)]
pub struct FaultyDirectory {
    inner: Arc<dyn Directory>,
    faults: Arc<Mutex<Faults>>,
    injected: Arc<AtomicU64>,
}

impl FaultyDirectory {
    pub fn new(inner: Arc<dyn Directory>) -> Self {
        Self {
            inner,
            faults: Arc::new(Mutex::new(Faults::default())),
            injected: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Let `n` more outputs succeed, then fail all of them
    pub fn fail_outputs_after(&self, n: u64) {
        self.faults.lock().outputs_left = Some(n);
    }

    /// Fail every output whose name contains `pattern`
    pub fn fail_outputs_matching(&self, pattern: &str) {
        self.faults.lock().matching = Some(pattern.to_string());
    }

    pub fn fail_sync(&self, fail: bool) {
        self.faults.lock().sync = fail;
    }

    pub fn fail_rename(&self, fail: bool) {
        self.faults.lock().rename = fail;
    }

    /// Stop injecting failures
    pub fn heal(&self) {
        *self.faults.lock() = Faults::default();
    }

    /// Number of failures injected so far
    pub fn injected(&self) -> u64 {
        self.injected.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &Arc<dyn Directory> {
        &self.inner
    }

    fn output_fails(&self, name: &str) -> bool {
        let mut faults = self.faults.lock();
        if faults.matching.as_deref().map_or(false, |p| name.contains(p)) {
            return true;
        }
        match faults.outputs_left.as_mut() {
            Some(0) => true,
            Some(left) => {
                *left -= 1;
                false
            }
            None => false,
        }
    }

    fn injected_error(&self, what: &str) -> io::Error {
        self.injected.fetch_add(1, Ordering::SeqCst);
        io::Error::new(io::ErrorKind::Other, format!("injected fault: {}", what))
    }
}

impl fmt::Debug for FaultyDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultyDirectory")
            .field("inner", &self.inner)
            .field("faults", &*self.faults.lock())
            .finish()
    }
}

impl Directory for FaultyDirectory {
    fn list_all(&self) -> io::Result<Vec<String>> {
        self.inner.list_all()
    }

    fn file_exists(&self, name: &str) -> bool {
        self.inner.file_exists(name)
    }

    fn file_length(&self, name: &str) -> io::Result<u64> {
        self.inner.file_length(name)
    }

    fn open_input(&self, name: &str) -> io::Result<Bytes> {
        self.inner.open_input(name)
    }

    fn create_output(&self, name: &str) -> io::Result<Box<dyn IndexOutput>> {
        let out = self.inner.create_output(name)?;
        if self.output_fails(name) {
            return Ok(Box::new(FailingOutput {
                inner: Some(out),
                error: Some(self.injected_error(name)),
            }));
        }
        Ok(out)
    }

    fn delete_file(&self, name: &str) -> io::Result<()> {
        self.inner.delete_file(name)
    }

    fn rename_file(&self, source: &str, dest: &str) -> io::Result<()> {
        if self.faults.lock().rename {
            return Err(self.injected_error("rename"));
        }
        self.inner.rename_file(source, dest)
    }

    fn sync(&self, names: &[String]) -> io::Result<()> {
        if self.faults.lock().sync {
            return Err(self.injected_error("sync"));
        }
        self.inner.sync(names)
    }

    fn sync_meta_data(&self) -> io::Result<()> {
        self.inner.sync_meta_data()
    }

    fn obtain_lock(&self, name: &str) -> Result<Box<dyn Lock>> {
        self.inner.obtain_lock(name)
    }
}

struct FailingOutput {
    inner: Option<Box<dyn IndexOutput>>,
    error: Option<io::Error>,
}

impl Write for FailingOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.inner.as_mut() {
            Some(out) => out.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl IndexOutput for FailingOutput {
    fn name(&self) -> &str {
        self.inner.as_ref().map_or("", |out| out.name())
    }

    fn bytes_written(&self) -> u64 {
        self.inner.as_ref().map_or(0, |out| out.bytes_written())
    }

    fn close(mut self: Box<Self>) -> io::Result<()> {
        // The inner output is dropped unfinished
        self.inner.take();
        Err(self
            .error
            .take()
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "injected fault")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{write_file, RamDirectory};

    #[test]
    fn test_fail_outputs_after() {
        let ram = RamDirectory::new();
        let dir = FaultyDirectory::new(Arc::new(ram.clone()));
        dir.fail_outputs_after(1);

        write_file(&dir, "_0.tim", b"ok").unwrap();
        assert!(write_file(&dir, "_1.tim", b"broken").is_err());
        assert!(!ram.file_exists("_1.tim"));
        assert_eq!(dir.injected(), 1);

        dir.heal();
        write_file(&dir, "_2.tim", b"ok").unwrap();
    }

    #[test]
    fn test_fail_matching_and_sync() {
        let dir = FaultyDirectory::new(Arc::new(RamDirectory::new()));
        dir.fail_outputs_matching(".liv");
        assert!(write_file(&dir, "_0_1.liv", b"x").is_err());
        write_file(&dir, "_0.tim", b"x").unwrap();

        dir.fail_sync(true);
        assert!(dir.sync(&["_0.tim".to_string()]).is_err());
        dir.fail_rename(true);
        assert!(dir.rename_file("_0.tim", "_1.tim").is_err());
        assert_eq!(dir.injected(), 3);
    }
}
