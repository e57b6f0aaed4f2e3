//! Commit metadata: the ordered list of segments making up the index
//!
//! Commit protocol:
//! 1. Segment and live docs files are written and synced
//! 2. `pending_segments_N` is written and synced
//! 3. It is renamed to `segments_N` and the directory metadata synced
//!
//! A crash before step 3 leaves the previous `segments_N` as the latest
//! commit; the pending file is an orphan removed by the next writer.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::file_names::{
    last_commit_generation, parse_generation, pending_segments_file_name, segment_name,
    segments_file_name,
};
use super::segment_info::SegmentCommitInfo;
use crate::codec::format::{check_file, ChecksumOutput};
use crate::directory::Directory;
use crate::error::{Result, TesseraError};

const CODEC: &str = "TesseraSegments";
const VERSION: u32 = 1;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfos {
    /// Bumped on every in-memory change to the segment list
    pub version: u64,
    /// Generation of the commit these infos were read from or last
    /// written as; 0 before the first commit
    #[serde(skip)]
    pub generation: u64,
    /// Source of fresh segment names
    pub counter: u64,
    pub segments: Vec<SegmentCommitInfo>,
    pub user_data: BTreeMap<String, String>,
}

impl SegmentInfos {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a name for a new segment
    pub fn next_segment_name(&mut self) -> String {
        let name = segment_name(self.counter);
        self.counter += 1;
        name
    }

    /// Record an in-memory change
    pub fn changed(&mut self) {
        self.version += 1;
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SegmentCommitInfo> {
        self.segments.iter()
    }

    pub fn get(&self, name: &str) -> Option<&SegmentCommitInfo> {
        self.segments.iter().find(|s| s.name() == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut SegmentCommitInfo> {
        self.segments.iter_mut().find(|s| s.name() == name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.segments.iter().position(|s| s.name() == name)
    }

    /// Sum of max_doc over all segments
    pub fn total_max_doc(&self) -> u64 {
        self.segments.iter().map(|s| s.max_doc() as u64).sum()
    }

    pub fn total_num_docs(&self) -> u64 {
        self.segments.iter().map(|s| s.num_docs() as u64).sum()
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.size_bytes()).sum()
    }

    /// Name of the commit file these infos were loaded from or written as
    pub fn segments_file_name(&self) -> Option<String> {
        if self.generation == 0 {
            None
        } else {
            Some(segments_file_name(self.generation))
        }
    }

    /// Every file referenced, optionally with the commit file itself
    pub fn files(&self, include_segments_file: bool) -> BTreeSet<String> {
        let mut files: BTreeSet<String> = self.segments.iter().flat_map(|s| s.files()).collect();
        if include_segments_file {
            files.extend(self.segments_file_name());
        }
        files
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Phase one of a commit: write and sync `pending_segments_N` for the
    /// given generation. Referenced files must already be synced.
    pub fn write_pending(&self, dir: &dyn Directory, generation: u64) -> Result<String> {
        let name = pending_segments_file_name(generation);
        let body = self.encode()?;
        let write = || -> io::Result<()> {
            let mut out = ChecksumOutput::create(dir.create_output(&name)?, CODEC, VERSION)?;
            io::Write::write_all(&mut out, &body)?;
            out.finish()?;
            dir.sync(&[name.clone()])
        };
        if let Err(e) = write() {
            let _ = dir.delete_file(&name);
            return Err(TesseraError::durability("prepare commit", e));
        }
        Ok(name)
    }

    /// Phase two: publish the pending file as `segments_N`
    pub fn finish_commit(dir: &dyn Directory, generation: u64) -> Result<String> {
        let pending = pending_segments_file_name(generation);
        let name = segments_file_name(generation);
        dir.rename_file(&pending, &name)
            .map_err(|e| TesseraError::durability("commit", e))?;
        dir.sync_meta_data()
            .map_err(|e| TesseraError::durability("commit", e))?;
        Ok(name)
    }

    /// Read a specific commit file
    pub fn read(dir: &dyn Directory, file_name: &str) -> Result<Self> {
        let generation = parse_generation(file_name).ok_or_else(|| {
            TesseraError::InvalidArgument(format!("{} is not a commit file", file_name))
        })?;
        let data = dir.open_input(file_name)?;
        let corrupt = |reason: String| TesseraError::CorruptCommit {
            file: file_name.to_string(),
            reason,
        };
        let body = check_file(&data, CODEC, VERSION).map_err(corrupt)?;
        let mut infos: SegmentInfos =
            bincode::deserialize(&body).map_err(|e| corrupt(e.to_string()))?;
        infos.generation = generation;
        Ok(infos)
    }

    /// Read the latest commit
    pub fn read_latest(dir: &dyn Directory) -> Result<Self> {
        Self::run_with_latest(dir, Ok)
    }

    /// Run `body` against the latest commit. If a file disappears while
    /// doing so because a concurrent commit superseded the one being
    /// read, retry as long as a newer generation keeps appearing.
    pub fn run_with_latest<T>(
        dir: &dyn Directory,
        mut body: impl FnMut(SegmentInfos) -> Result<T>,
    ) -> Result<T> {
        let mut last_tried: Option<u64> = None;
        loop {
            let files = dir.list_all()?;
            let generation = last_commit_generation(&files)
                .ok_or_else(|| TesseraError::IndexNotFound(format!("{:?}", dir)))?;

            let result = Self::read(dir, &segments_file_name(generation)).and_then(&mut body);
            match result {
                Err(e) if e.is_file_not_found() && last_tried.map_or(true, |g| generation > g) => {
                    debug!(generation, error = %e, "Commit vanished while opening, retrying");
                    last_tried = Some(generation);
                }
                other => return other,
            }
        }
    }

    /// Generations of every commit in the directory, oldest first
    pub fn list_generations(dir: &dyn Directory) -> Result<Vec<u64>> {
        let mut generations: Vec<u64> = dir
            .list_all()?
            .iter()
            .filter_map(|f| parse_generation(f))
            .collect();
        generations.sort_unstable();
        Ok(generations)
    }
}

/// Thread-safe holder of a segment list snapshot with atomic replacement
pub struct SegmentInfosHolder {
    inner: ArcSwap<SegmentInfos>,
}

impl SegmentInfosHolder {
    pub fn new(infos: SegmentInfos) -> Self {
        Self {
            inner: ArcSwap::from_pointee(infos),
        }
    }

    pub fn load(&self) -> Arc<SegmentInfos> {
        self.inner.load_full()
    }

    pub fn snapshot(&self) -> SegmentInfos {
        (**self.inner.load()).clone()
    }

    pub fn store(&self, infos: SegmentInfos) {
        self.inner.store(Arc::new(infos));
    }

    pub fn generation(&self) -> u64 {
        self.inner.load().generation
    }
}

impl Default for SegmentInfosHolder {
    fn default() -> Self {
        Self::new(SegmentInfos::new())
    }
}

impl std::fmt::Debug for SegmentInfosHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentInfosHolder")
            .field("generation", &self.generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::RamDirectory;
    use crate::index::segment_info::SegmentInfo;

    fn sample() -> SegmentInfos {
        let mut infos = SegmentInfos::new();
        for docs in [10u32, 20] {
            let name = infos.next_segment_name();
            infos.segments.push(SegmentCommitInfo::new(SegmentInfo {
                files: vec![format!("{}.tim", name)],
                name,
                max_doc: docs,
                codec: "Tessera10".to_string(),
                size_bytes: docs as u64 * 10,
                diagnostics: BTreeMap::new(),
            }));
        }
        infos.user_data.insert("checkpoint".to_string(), "42".to_string());
        infos.changed();
        infos
    }

    fn commit(dir: &RamDirectory, infos: &SegmentInfos, generation: u64) {
        infos.write_pending(dir, generation).unwrap();
        SegmentInfos::finish_commit(dir, generation).unwrap();
    }

    #[test]
    fn test_two_phase_commit() {
        let dir = RamDirectory::new();
        let infos = sample();

        infos.write_pending(&dir, 1).unwrap();
        assert!(dir.file_exists("pending_segments_1"));
        assert!(matches!(
            SegmentInfos::read_latest(&dir),
            Err(TesseraError::IndexNotFound(_))
        ));

        SegmentInfos::finish_commit(&dir, 1).unwrap();
        assert!(!dir.file_exists("pending_segments_1"));

        let read = SegmentInfos::read_latest(&dir).unwrap();
        assert_eq!(read.generation, 1);
        assert_eq!(read.segments, infos.segments);
        assert_eq!(read.user_data.get("checkpoint").map(String::as_str), Some("42"));
        assert_eq!(read.counter, 2);
        assert_eq!(read.total_max_doc(), 30);
        assert!(read.files(true).contains("segments_1"));
    }

    #[test]
    fn test_latest_generation_wins() {
        let dir = RamDirectory::new();
        let mut infos = sample();
        commit(&dir, &infos, 1);
        infos.segments.pop();
        commit(&dir, &infos, 2);

        assert_eq!(SegmentInfos::read_latest(&dir).unwrap().len(), 1);
        assert_eq!(SegmentInfos::list_generations(&dir).unwrap(), vec![1, 2]);
        assert_eq!(SegmentInfos::read(&dir, "segments_1").unwrap().len(), 2);
    }

    #[test]
    fn test_corrupt_commit() {
        let dir = RamDirectory::new();
        commit(&dir, &sample(), 1);
        let mut data = dir.open_input("segments_1").unwrap().to_vec();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        dir.delete_file("segments_1").unwrap();
        crate::directory::write_file(&dir, "segments_1", &data).unwrap();

        match SegmentInfos::read_latest(&dir) {
            Err(TesseraError::CorruptCommit { file, .. }) => assert_eq!(file, "segments_1"),
            other => panic!("expected CorruptCommit, got {:?}", other),
        }
    }

    #[test]
    fn test_holder() {
        let holder = SegmentInfosHolder::default();
        assert_eq!(holder.generation(), 0);
        let mut infos = sample();
        infos.generation = 3;
        holder.store(infos);
        assert_eq!(holder.generation(), 3);
        assert_eq!(holder.load().len(), 2);
    }
}
