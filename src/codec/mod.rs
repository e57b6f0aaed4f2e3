//! Codec abstraction
//!
//! The index core never touches segment bytes directly. A [`Codec`]
//! turns any [`SegmentSource`] (the in-memory buffer at flush, or a
//! compacting view over several segments at merge) into segment files,
//! and opens those files back as a [`SegmentSource`].
//!
//! # Architecture
//!
//! - `format`: header and crc32 footer shared by every file
//! - `postings`: block-encoded doc/freq/position lists
//! - `term_dict`: FST term dictionary with per-term stats
//! - `stored`: random-access stored fields
//! - `docvalues`: numeric and binary per-document columns
//! - `live_docs`: deleted-doc bitmaps, one file per deletion generation
//! - `updates`: doc values updates, one file per update generation
//! - `tessera10`: the default codec tying the formats together

pub mod format;
mod docvalues;
mod live_docs;
mod postings;
mod stored;
mod tessera10;
mod term_dict;
mod updates;

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::Arc;

use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use crate::directory::Directory;
use crate::error::Result;
use crate::models::{DocValuesType, FieldOptions, IndexOptions, StoredDocument};

pub use docvalues::{BinaryColumn, NumericColumn};
pub use postings::{decode_vbyte, encode_vbyte, BlockPostingsEnum, PostingsWriter, BLOCK_SIZE};
pub use tessera10::Tessera10Codec;
pub use term_dict::{FieldTerms, TermDictionaryBuilder, TermMeta};
pub use updates::{with_updates, DocValueUpdate, DocValuesUpdates, UpdatedSource};

/// Name of the codec new segments are written with unless configured
pub const DEFAULT_CODEC: &str = "Tessera10";

/// One document's occurrence of a term
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Posting {
    pub doc: u32,
    /// Occurrences in the document; 1 when frequencies are not indexed
    pub freq: u32,
    /// Empty unless positions are indexed
    pub positions: Vec<u32>,
    /// (start, end) byte offsets, parallel to `positions` when indexed
    pub offsets: Vec<(u32, u32)>,
}

impl Posting {
    pub fn new(doc: u32, freq: u32) -> Self {
        Self {
            doc,
            freq,
            positions: Vec::new(),
            offsets: Vec::new(),
        }
    }
}

/// Per-term statistics. Both counts include deleted documents.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermStats {
    pub doc_freq: u32,
    pub total_term_freq: u64,
}

impl TermStats {
    pub fn add(&mut self, other: TermStats) {
        self.doc_freq += other.doc_freq;
        self.total_term_freq += other.total_term_freq;
    }
}

/// Per-field statistics, summable across segments
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldStats {
    /// Documents with at least one term in the field
    pub doc_count: u32,
    pub sum_doc_freq: u64,
    pub sum_total_term_freq: u64,
    pub term_count: u64,
}

impl FieldStats {
    pub fn add(&mut self, other: FieldStats) {
        self.doc_count += other.doc_count;
        self.sum_doc_freq += other.sum_doc_freq;
        self.sum_total_term_freq += other.sum_total_term_freq;
        self.term_count += other.term_count;
    }
}

/// Schema of one field within a segment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    pub index_options: Option<IndexOptions>,
    pub doc_values: Option<DocValuesType>,
    pub stored: bool,
}

/// All fields seen by a segment, keyed by name
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfos {
    fields: BTreeMap<String, FieldInfo>,
}

impl FieldInfos {
    pub fn new() -> Self {
        Self {
            fields: BTreeMap::new(),
        }
    }

    /// Register a field occurrence. When two occurrences index a field
    /// differently the poorer index options win, so every posting written
    /// for the field can honor them. A doc values type, once set, cannot
    /// change.
    pub fn add(&mut self, name: &str, options: &FieldOptions) -> std::result::Result<(), String> {
        let info = self.fields.entry(name.to_string()).or_insert_with(|| FieldInfo {
            name: name.to_string(),
            index_options: None,
            doc_values: None,
            stored: false,
        });
        info.index_options = narrow(info.index_options, options.index_options);
        info.stored |= options.stored;
        match (info.doc_values, options.doc_values) {
            (Some(existing), Some(requested)) if existing != requested => {
                return Err(format!(
                    "field {} has doc values {:?}, cannot add {:?}",
                    name, existing, requested
                ));
            }
            (None, requested) => info.doc_values = requested,
            _ => {}
        }
        Ok(())
    }

    /// Union with another segment's field infos
    pub fn merge(&mut self, other: &FieldInfos) {
        for (name, info) in &other.fields {
            let entry = self.fields.entry(name.clone()).or_insert_with(|| info.clone());
            entry.index_options = narrow(entry.index_options, info.index_options);
            entry.stored |= info.stored;
            if entry.doc_values.is_none() {
                entry.doc_values = info.doc_values;
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldInfo> {
        self.fields.values()
    }

    /// Names of fields with an inverted index, in name order
    pub fn indexed_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .values()
            .filter(|f| f.index_options.is_some())
            .map(|f| f.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

fn narrow(a: Option<IndexOptions>, b: Option<IndexOptions>) -> Option<IndexOptions> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Postings of the current term, in increasing doc order
pub trait PostingsEnum {
    fn next(&mut self) -> io::Result<Option<Posting>>;

    /// First posting with doc >= target
    fn advance(&mut self, target: u32) -> io::Result<Option<Posting>> {
        while let Some(posting) = self.next()? {
            if posting.doc >= target {
                return Ok(Some(posting));
            }
        }
        Ok(None)
    }
}

/// Sorted enumeration of a field's terms.
///
/// The enum starts before the first term. After `seek_exact`, whether the
/// term was found or not, `next` moves to the first term greater than the
/// sought one.
pub trait TermsEnum {
    fn next(&mut self) -> io::Result<bool>;

    /// Current term; only valid after `next` or a successful `seek_exact`
    fn term(&self) -> &[u8];

    fn stats(&self) -> TermStats;

    fn seek_exact(&mut self, term: &[u8]) -> io::Result<bool>;

    fn postings(&self) -> io::Result<Box<dyn PostingsEnum + '_>>;
}

/// Read side of a segment's indexed data, ignoring deletions
pub trait SegmentSource: Send + Sync {
    /// Documents in the segment, deleted ones included
    fn max_doc(&self) -> u32;

    fn field_infos(&self) -> &FieldInfos;

    /// Terms of a field, or `None` if the field has no indexed terms
    fn terms(&self, field: &str) -> io::Result<Option<Box<dyn TermsEnum + '_>>>;

    fn field_stats(&self, field: &str) -> Option<FieldStats>;

    fn stored_document(&self, doc: u32) -> io::Result<StoredDocument>;

    fn numeric_value(&self, field: &str, doc: u32) -> Option<i64>;

    fn binary_value(&self, field: &str, doc: u32) -> Option<Vec<u8>>;
}

/// Files produced by writing one segment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WrittenSegment {
    pub max_doc: u32,
    pub files: Vec<String>,
    pub size_bytes: u64,
}

/// Segment file format
pub trait Codec: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Write every document of `source` as segment `segment`. On error,
    /// files written so far are left for the caller to discard.
    fn write_segment(
        &self,
        dir: &dyn Directory,
        segment: &str,
        source: &dyn SegmentSource,
    ) -> io::Result<WrittenSegment>;

    /// Open a segment, verifying checksums of all its files
    fn open_segment(
        &self,
        dir: &dyn Directory,
        segment: &str,
        max_doc: u32,
    ) -> Result<Arc<dyn SegmentSource>>;

    /// Persist the deleted docs of a segment as deletion generation
    /// `del_gen`, returning the file name
    fn write_live_docs(
        &self,
        dir: &dyn Directory,
        segment: &str,
        del_gen: u64,
        deleted: &RoaringBitmap,
    ) -> io::Result<String> {
        live_docs::write_live_docs(dir, segment, del_gen, deleted)
    }

    fn read_live_docs(
        &self,
        dir: &dyn Directory,
        segment: &str,
        del_gen: u64,
        max_doc: u32,
    ) -> Result<RoaringBitmap> {
        live_docs::read_live_docs(dir, segment, del_gen, max_doc)
    }

    /// Persist every doc values update of a segment as update generation
    /// `dv_gen`, returning the file name
    fn write_doc_values_updates(
        &self,
        dir: &dyn Directory,
        segment: &str,
        dv_gen: u64,
        updates: &DocValuesUpdates,
    ) -> io::Result<String> {
        updates::write_doc_values_updates(dir, segment, dv_gen, updates)
    }

    fn read_doc_values_updates(
        &self,
        dir: &dyn Directory,
        segment: &str,
        dv_gen: u64,
        max_doc: u32,
    ) -> Result<DocValuesUpdates> {
        updates::read_doc_values_updates(dir, segment, dv_gen, max_doc)
    }
}

/// Find a codec by the name recorded in segment metadata
pub fn lookup(name: &str) -> Option<Arc<dyn Codec>> {
    match name {
        DEFAULT_CODEC => Some(Arc::new(Tessera10Codec)),
        _ => None,
    }
}
