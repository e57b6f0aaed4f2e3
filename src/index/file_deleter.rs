//! Reference-counted deletion of index files
//!
//! Every retained commit, the writer's current segment list and every
//! open near-real-time reader hold one reference to each file they use.
//! A file whose count drops to zero is deleted. Deletions that fail are
//! retried at the next checkpoint.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, warn};

use super::deletion_policy::{CommitPoint, IndexDeletionPolicy};
use super::file_names::{is_index_file, last_commit_generation, parse_generation};
use super::segment_infos::SegmentInfos;
use crate::directory::{Directory, WRITE_LOCK_NAME};
use crate::error::Result;

pub struct IndexFileDeleter {
    dir: Arc<dyn Directory>,
    policy: Arc<dyn IndexDeletionPolicy>,
    ref_counts: HashMap<String, usize>,
    /// Retained commits, oldest first
    commits: Vec<CommitPoint>,
    /// Files of the last checkpointed in-memory segment list
    last_files: BTreeSet<String>,
    pending_deletes: BTreeSet<String>,
}

impl IndexFileDeleter {
    /// Load every commit in the directory, let the policy drop old ones,
    /// and delete files nothing references
    pub fn open(
        dir: Arc<dyn Directory>,
        policy: Arc<dyn IndexDeletionPolicy>,
        current: &SegmentInfos,
    ) -> Result<Self> {
        let mut deleter = Self {
            dir,
            policy,
            ref_counts: HashMap::new(),
            commits: Vec::new(),
            last_files: BTreeSet::new(),
            pending_deletes: BTreeSet::new(),
        };

        let files = deleter.dir.list_all()?;
        let latest = last_commit_generation(&files);
        let mut generations: Vec<u64> = files.iter().filter_map(|f| parse_generation(f)).collect();
        generations.sort_unstable();
        for generation in generations {
            let name = super::file_names::segments_file_name(generation);
            match SegmentInfos::read(deleter.dir.as_ref(), &name) {
                Ok(infos) => {
                    if let Some(point) = CommitPoint::from_infos(&infos) {
                        deleter.incref(point.files.iter());
                        deleter.commits.push(point);
                    }
                }
                // An unreadable older commit is garbage; the latest one must load
                Err(e) if Some(generation) != latest => {
                    warn!(file = %name, error = %e, "Skipping unreadable commit");
                }
                Err(e) => return Err(e),
            }
        }

        let doomed = deleter.policy.on_init(&deleter.commits);
        deleter.delete_commits(&doomed);

        deleter.last_files = current.files(false);
        let last: Vec<String> = deleter.last_files.iter().cloned().collect();
        deleter.incref(last.iter());

        deleter.refresh();
        Ok(deleter)
    }

    /// Record a new state of the writer's segment list. With `is_commit`
    /// the state was just committed and the deletion policy runs.
    pub fn checkpoint(&mut self, infos: &SegmentInfos, is_commit: bool) {
        let files = infos.files(false);
        self.incref(files.iter());
        let previous = std::mem::replace(&mut self.last_files, files);
        self.decref(previous.iter());

        if is_commit {
            self.add_commit(infos);
        }
        self.retry_pending();
    }

    /// Register a commit that just landed and let the policy drop older
    /// ones. `committed` may lag behind the last checkpointed infos.
    pub fn add_commit(&mut self, committed: &SegmentInfos) {
        if let Some(point) = CommitPoint::from_infos(committed) {
            self.incref(point.files.iter());
            self.commits.push(point);
            let doomed = self.policy.on_commit(&self.commits);
            self.delete_commits(&doomed);
        }
    }

    fn delete_commits(&mut self, generations: &[u64]) {
        let newest = self.commits.last().map(|c| c.generation);
        let mut kept = Vec::with_capacity(self.commits.len());
        for point in std::mem::take(&mut self.commits) {
            if generations.contains(&point.generation) && Some(point.generation) != newest {
                debug!(generation = point.generation, "Dropping commit");
                self.decref(point.files.iter());
            } else {
                kept.push(point);
            }
        }
        self.commits = kept;
    }

    pub fn incref<'a>(&mut self, files: impl Iterator<Item = &'a String>) {
        for file in files {
            *self.ref_counts.entry(file.clone()).or_insert(0) += 1;
        }
    }

    pub fn decref<'a>(&mut self, files: impl Iterator<Item = &'a String>) {
        for file in files {
            let zero = match self.ref_counts.get_mut(file) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    *count == 0
                }
                None => false,
            };
            if zero {
                self.ref_counts.remove(file);
                self.delete_file(file);
            }
        }
    }

    pub fn ref_count(&self, file: &str) -> usize {
        self.ref_counts.get(file).copied().unwrap_or(0)
    }

    /// Retained commits, oldest first
    pub fn commits(&self) -> &[CommitPoint] {
        &self.commits
    }

    /// Delete every index file nothing references: crash leftovers,
    /// abandoned pending commits and outputs of failed merges
    pub fn refresh(&mut self) {
        let files = match self.dir.list_all() {
            Ok(files) => files,
            Err(e) => {
                warn!(error = %e, "Cannot list directory for cleanup");
                return;
            }
        };
        for file in files {
            if file != WRITE_LOCK_NAME && is_index_file(&file) && !self.ref_counts.contains_key(&file) {
                self.delete_file(&file);
            }
        }
        self.retry_pending();
    }

    fn delete_file(&mut self, file: &str) {
        match self.dir.delete_file(file) {
            Ok(()) => {
                debug!(file, "Deleted index file");
                self.pending_deletes.remove(file);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.pending_deletes.remove(file);
            }
            Err(e) => {
                debug!(file, error = %e, "Delete failed, will retry");
                self.pending_deletes.insert(file.to_string());
            }
        }
    }

    fn retry_pending(&mut self) {
        let pending: Vec<String> = self.pending_deletes.iter().cloned().collect();
        for file in pending {
            if !self.ref_counts.contains_key(&file) {
                self.delete_file(&file);
            } else {
                self.pending_deletes.remove(&file);
            }
        }
    }
}

impl std::fmt::Debug for IndexFileDeleter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexFileDeleter")
            .field("files", &self.ref_counts.len())
            .field("commits", &self.commits.len())
            .field("pending_deletes", &self.pending_deletes.len())
            .finish()
    }
}
