//! Leaf readers without data, for exercising doc id arithmetic at sizes
//! no real segment in a test could reach

use std::io;
use std::sync::Arc;

use roaring::RoaringBitmap;

use crate::codec::{FieldInfos, FieldStats, SegmentSource, TermsEnum};
use crate::index::LeafReader;
use crate::models::StoredDocument;

/// A leaf of `max_doc` empty documents
#[derive(Debug, Clone)]
pub struct StubLeaf {
    name: String,
    max_doc: u32,
    deleted: Option<Arc<RoaringBitmap>>,
    field_infos: FieldInfos,
}

impl StubLeaf {
    pub fn new(name: &str, max_doc: u32) -> Self {
        Self {
            name: name.to_string(),
            max_doc,
            deleted: None,
            field_infos: FieldInfos::new(),
        }
    }

    pub fn with_deleted(mut self, docs: impl IntoIterator<Item = u32>) -> Self {
        let deleted: RoaringBitmap = docs.into_iter().filter(|&d| d < self.max_doc).collect();
        self.deleted = Some(Arc::new(deleted)).filter(|d| !d.is_empty());
        self
    }
}

impl SegmentSource for StubLeaf {
    fn max_doc(&self) -> u32 {
        self.max_doc
    }

    fn field_infos(&self) -> &FieldInfos {
        &self.field_infos
    }

    fn terms(&self, _field: &str) -> io::Result<Option<Box<dyn TermsEnum + '_>>> {
        Ok(None)
    }

    fn field_stats(&self, _field: &str) -> Option<FieldStats> {
        None
    }

    fn stored_document(&self, doc: u32) -> io::Result<StoredDocument> {
        if doc >= self.max_doc {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("doc {} out of range (max_doc {})", doc, self.max_doc),
            ));
        }
        Ok(StoredDocument::new())
    }

    fn numeric_value(&self, _field: &str, _doc: u32) -> Option<i64> {
        None
    }

    fn binary_value(&self, _field: &str, _doc: u32) -> Option<Vec<u8>> {
        None
    }
}

impl LeafReader for StubLeaf {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_doc(&self) -> u32 {
        self.max_doc
    }

    fn num_docs(&self) -> u32 {
        self.max_doc - self.deleted.as_ref().map_or(0, |d| d.len() as u32)
    }

    fn deleted_docs(&self) -> Option<&Arc<RoaringBitmap>> {
        self.deleted.as_ref()
    }

    fn source(&self) -> &dyn SegmentSource {
        self
    }
}
