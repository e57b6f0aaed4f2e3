//! Read access to a single segment with its deletions and doc values
//! updates applied

use std::io;
use std::sync::Arc;

use roaring::RoaringBitmap;

use super::segment_info::SegmentCommitInfo;
use crate::codec::{self, DocValuesUpdates, SegmentSource};
use crate::directory::Directory;
use crate::error::{Result, TesseraError};
use crate::models::StoredDocument;

/// One leaf of a composite view
pub trait LeafReader: Send + Sync {
    fn name(&self) -> &str;

    /// Documents in the leaf, deleted ones included
    fn max_doc(&self) -> u32;

    fn num_docs(&self) -> u32;

    /// Deleted docs, `None` when there are none
    fn deleted_docs(&self) -> Option<&Arc<RoaringBitmap>>;

    /// Indexed data of the leaf, ignoring deletions
    fn source(&self) -> &dyn SegmentSource;

    fn is_deleted(&self, doc: u32) -> bool {
        self.deleted_docs().map_or(false, |d| d.contains(doc))
    }
}

/// A segment as seen at one point in time
pub struct SegmentReader {
    info: SegmentCommitInfo,
    core: Arc<dyn SegmentSource>,
    deleted: Option<Arc<RoaringBitmap>>,
}

/// What a commit records for one segment, loaded: the codec's core,
/// the deleted docs and the doc values updates
pub(crate) struct SegmentParts {
    pub base: Arc<dyn SegmentSource>,
    pub deleted: Option<Arc<RoaringBitmap>>,
    pub updates: Arc<DocValuesUpdates>,
}

impl SegmentParts {
    pub fn open(dir: &dyn Directory, info: &SegmentCommitInfo) -> Result<Self> {
        let codec = codec::lookup(&info.info.codec).ok_or_else(|| TesseraError::CorruptSegment {
            segment: info.name().to_string(),
            reason: format!("unknown codec {}", info.info.codec),
        })?;
        let base = codec.open_segment(dir, info.name(), info.max_doc())?;
        let deleted = if info.del_gen > 0 {
            let deleted = codec.read_live_docs(dir, info.name(), info.del_gen, info.max_doc())?;
            if deleted.len() != info.del_count as u64 {
                return Err(TesseraError::CorruptSegment {
                    segment: info.name().to_string(),
                    reason: format!(
                        "live docs hold {} deletions, commit records {}",
                        deleted.len(),
                        info.del_count
                    ),
                });
            }
            Some(Arc::new(deleted))
        } else {
            None
        };
        let updates = if info.dv_gen > 0 {
            codec.read_doc_values_updates(dir, info.name(), info.dv_gen, info.max_doc())?
        } else {
            DocValuesUpdates::new()
        };
        Ok(Self {
            base,
            deleted,
            updates: Arc::new(updates),
        })
    }

    /// The core with the updates layered over it
    pub fn source(&self) -> Arc<dyn SegmentSource> {
        codec::with_updates(self.base.clone(), &self.updates)
    }
}

impl SegmentReader {
    /// Open a committed segment with its live docs and doc values updates
    pub fn open(dir: &dyn Directory, info: &SegmentCommitInfo) -> Result<Self> {
        let parts = SegmentParts::open(dir, info)?;
        Ok(Self::new(info.clone(), parts.source(), parts.deleted))
    }

    pub fn new(
        info: SegmentCommitInfo,
        core: Arc<dyn SegmentSource>,
        deleted: Option<Arc<RoaringBitmap>>,
    ) -> Self {
        let deleted = deleted.filter(|d| !d.is_empty());
        Self { info, core, deleted }
    }

    pub fn info(&self) -> &SegmentCommitInfo {
        &self.info
    }

    pub fn core(&self) -> &Arc<dyn SegmentSource> {
        &self.core
    }

    pub fn document(&self, doc: u32) -> io::Result<StoredDocument> {
        self.core.stored_document(doc)
    }
}

impl LeafReader for SegmentReader {
    fn name(&self) -> &str {
        self.info.name()
    }

    fn max_doc(&self) -> u32 {
        self.core.max_doc()
    }

    fn num_docs(&self) -> u32 {
        let deleted = self.deleted.as_ref().map_or(0, |d| d.len() as u32);
        self.core.max_doc() - deleted
    }

    fn deleted_docs(&self) -> Option<&Arc<RoaringBitmap>> {
        self.deleted.as_ref()
    }

    fn source(&self) -> &dyn SegmentSource {
        self.core.as_ref()
    }
}

impl std::fmt::Debug for SegmentReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentReader")
            .field("name", &self.info.name())
            .field("max_doc", &self.max_doc())
            .field("num_docs", &self.num_docs())
            .finish()
    }
}
