//! Point-in-time readers over a commit or a live writer

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::Arc;

use tracing::debug;

use super::composite::CompositeReader;
use super::deletion_policy::CommitPoint;
use super::file_names::{last_commit_generation, segments_file_name};
use super::segment_infos::SegmentInfos;
use super::segment_reader::{LeafReader, SegmentReader};
use super::writer::WriterLink;
use crate::directory::Directory;
use crate::error::Result;

/// Composite reader over every segment of one commit, or of a writer's
/// in-memory segment list for near-real-time readers.
///
/// The view never changes; use [`DirectoryReader::open_if_changed`] to
/// get a newer one.
pub struct DirectoryReader {
    composite: CompositeReader,
    dir: Arc<dyn Directory>,
    infos: SegmentInfos,
    writer: Option<WriterLink>,
}

impl DirectoryReader {
    /// Open the latest commit
    pub fn open(dir: Arc<dyn Directory>) -> Result<Self> {
        SegmentInfos::run_with_latest(dir.as_ref(), |infos| Self::open_infos(dir.clone(), infos))
    }

    /// Open a specific, still existing commit
    pub fn open_commit(dir: Arc<dyn Directory>, commit: &CommitPoint) -> Result<Self> {
        let infos = SegmentInfos::read(dir.as_ref(), &commit.segments_file)?;
        Self::open_infos(dir, infos)
    }

    /// Every readable commit in the directory, oldest first
    pub fn list_commits(dir: &dyn Directory) -> Result<Vec<CommitPoint>> {
        let mut commits = Vec::new();
        for generation in SegmentInfos::list_generations(dir)? {
            match SegmentInfos::read(dir, &segments_file_name(generation)) {
                Ok(infos) => commits.extend(CommitPoint::from_infos(&infos)),
                // Deleted by a writer since listing
                Err(e) if e.is_file_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(commits)
    }

    fn open_infos(dir: Arc<dyn Directory>, infos: SegmentInfos) -> Result<Self> {
        let mut leaves: Vec<Arc<dyn LeafReader>> = Vec::with_capacity(infos.len());
        for info in infos.iter() {
            leaves.push(Arc::new(SegmentReader::open(dir.as_ref(), info)?));
        }
        let composite = CompositeReader::new(leaves)?;
        debug!(
            generation = infos.generation,
            segments = infos.len(),
            max_doc = composite.max_doc(),
            "Opened reader"
        );
        Ok(Self {
            composite,
            dir,
            infos,
            writer: None,
        })
    }

    pub(crate) fn from_writer(
        dir: Arc<dyn Directory>,
        infos: SegmentInfos,
        leaves: Vec<Arc<dyn LeafReader>>,
        link: WriterLink,
    ) -> Result<Self> {
        let composite = CompositeReader::new(leaves)?;
        debug!(segments = infos.len(), max_doc = composite.max_doc(), "Opened near-real-time reader");
        Ok(Self {
            composite,
            dir,
            infos,
            writer: Some(link),
        })
    }

    /// A reader over the current state if it differs from this one
    pub fn open_if_changed(&self) -> Result<Option<Self>> {
        if let Some(link) = &self.writer {
            match link.is_current() {
                Some(true) => return Ok(None),
                Some(false) => {
                    if let Some(reader) = link.reopen() {
                        return reader.map(Some);
                    }
                }
                None => {}
            }
        }
        if self.is_current_commit()? {
            return Ok(None);
        }
        Self::open(self.dir.clone()).map(Some)
    }

    /// True when nothing changed since this reader was opened: for a
    /// near-real-time reader, nothing in the writer; otherwise no newer
    /// commit
    pub fn is_current(&self) -> Result<bool> {
        if let Some(current) = self.writer.as_ref().and_then(|link| link.is_current()) {
            return Ok(current);
        }
        self.is_current_commit()
    }

    fn is_current_commit(&self) -> Result<bool> {
        let files = self.dir.list_all()?;
        Ok(last_commit_generation(&files) == Some(self.infos.generation))
    }

    /// Generation of the commit this reader sees; for a near-real-time
    /// reader, the writer's last commit
    pub fn generation(&self) -> u64 {
        self.infos.generation
    }

    pub fn user_data(&self) -> &BTreeMap<String, String> {
        &self.infos.user_data
    }

    pub fn segment_infos(&self) -> &SegmentInfos {
        &self.infos
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.dir
    }

    pub fn is_near_real_time(&self) -> bool {
        self.writer.is_some()
    }
}

impl Deref for DirectoryReader {
    type Target = CompositeReader;

    fn deref(&self) -> &CompositeReader {
        &self.composite
    }
}

impl std::fmt::Debug for DirectoryReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryReader")
            .field("generation", &self.infos.generation)
            .field("segments", &self.infos.len())
            .field("max_doc", &self.composite.max_doc())
            .field("near_real_time", &self.writer.is_some())
            .finish()
    }
}
