//! Doc values updates
//!
//! Updated doc values never touch a segment's own `.dvd` file. They are
//! kept per segment and written as update generations: `_N_G.dvd` holds
//! every update of segment `_N` made up to generation `G`. A reader
//! layers the latest generation over the segment with [`UpdatedSource`].

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::format::{check_file, ChecksumOutput};
use super::{FieldInfos, FieldStats, SegmentSource, TermsEnum};
use crate::directory::Directory;
use crate::error::{Result, TesseraError};
use crate::index::file_names::doc_values_updates_file_name;
use crate::models::{DocValuesType, FieldOptions, StoredDocument};

const CODEC: &str = "TesseraDocValuesUpdates";
const VERSION: u32 = 1;

/// New doc value for the documents an update selects
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocValueUpdate {
    Numeric(i64),
    Binary(Vec<u8>),
}

impl DocValueUpdate {
    pub fn doc_values_type(&self) -> DocValuesType {
        match self {
            DocValueUpdate::Numeric(_) => DocValuesType::Numeric,
            DocValueUpdate::Binary(_) => DocValuesType::Binary,
        }
    }
}

/// Updated values of one segment, by field then doc id
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocValuesUpdates {
    fields: BTreeMap<String, BTreeMap<u32, DocValueUpdate>>,
}

impl DocValuesUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the value of `field` for `doc`, replacing an earlier update
    pub fn set(&mut self, field: &str, doc: u32, value: DocValueUpdate) {
        self.fields
            .entry(field.to_string())
            .or_default()
            .insert(doc, value);
    }

    pub fn get(&self, field: &str, doc: u32) -> Option<&DocValueUpdate> {
        self.fields.get(field)?.get(&doc)
    }

    /// Apply every update of `other` on top of these
    pub fn apply(&mut self, other: &DocValuesUpdates) {
        for (field, doc, value) in other.iter() {
            self.set(field, doc, value.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.values().all(BTreeMap::is_empty)
    }

    /// Number of (field, doc) values held
    pub fn len(&self) -> usize {
        self.fields.values().map(BTreeMap::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32, &DocValueUpdate)> {
        self.fields.iter().flat_map(|(field, docs)| {
            docs.iter()
                .map(move |(doc, value)| (field.as_str(), *doc, value))
        })
    }

    /// Updated fields with the type of their values
    pub fn field_types(&self) -> impl Iterator<Item = (&str, DocValuesType)> {
        self.fields.iter().filter_map(|(field, docs)| {
            let first = docs.values().next()?;
            Some((field.as_str(), first.doc_values_type()))
        })
    }

    fn max_doc_id(&self) -> Option<u32> {
        self.fields
            .values()
            .filter_map(|docs| docs.keys().next_back().copied())
            .max()
    }
}

/// `base` with `updates` layered over it, or `base` itself when there is
/// nothing to layer
pub fn with_updates(
    base: Arc<dyn SegmentSource>,
    updates: &Arc<DocValuesUpdates>,
) -> Arc<dyn SegmentSource> {
    if updates.is_empty() {
        base
    } else {
        Arc::new(UpdatedSource::new(base, updates.clone()))
    }
}

/// A segment seen through its doc values updates
pub struct UpdatedSource {
    base: Arc<dyn SegmentSource>,
    updates: Arc<DocValuesUpdates>,
    field_infos: FieldInfos,
}

impl UpdatedSource {
    pub fn new(base: Arc<dyn SegmentSource>, updates: Arc<DocValuesUpdates>) -> Self {
        let mut field_infos = base.field_infos().clone();
        for (field, kind) in updates.field_types() {
            let options = FieldOptions {
                stored: false,
                index_options: None,
                tokenized: false,
                doc_values: Some(kind),
            };
            // Update types are checked against the index when issued
            let _ = field_infos.add(field, &options);
        }
        Self {
            base,
            updates,
            field_infos,
        }
    }

    pub fn base(&self) -> &Arc<dyn SegmentSource> {
        &self.base
    }

    pub fn updates(&self) -> &Arc<DocValuesUpdates> {
        &self.updates
    }
}

impl SegmentSource for UpdatedSource {
    fn max_doc(&self) -> u32 {
        self.base.max_doc()
    }

    fn field_infos(&self) -> &FieldInfos {
        &self.field_infos
    }

    fn terms(&self, field: &str) -> io::Result<Option<Box<dyn TermsEnum + '_>>> {
        self.base.terms(field)
    }

    fn field_stats(&self, field: &str) -> Option<FieldStats> {
        self.base.field_stats(field)
    }

    fn stored_document(&self, doc: u32) -> io::Result<StoredDocument> {
        self.base.stored_document(doc)
    }

    fn numeric_value(&self, field: &str, doc: u32) -> Option<i64> {
        match self.updates.get(field, doc) {
            Some(DocValueUpdate::Numeric(value)) => Some(*value),
            Some(DocValueUpdate::Binary(_)) => None,
            None => self.base.numeric_value(field, doc),
        }
    }

    fn binary_value(&self, field: &str, doc: u32) -> Option<Vec<u8>> {
        match self.updates.get(field, doc) {
            Some(DocValueUpdate::Binary(value)) => Some(value.clone()),
            Some(DocValueUpdate::Numeric(_)) => None,
            None => self.base.binary_value(field, doc),
        }
    }
}

pub(super) fn write_doc_values_updates(
    dir: &dyn Directory,
    segment: &str,
    dv_gen: u64,
    updates: &DocValuesUpdates,
) -> io::Result<String> {
    let name = doc_values_updates_file_name(segment, dv_gen);
    let body = bincode::serialize(updates).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut out = ChecksumOutput::create(dir.create_output(&name)?, CODEC, VERSION)?;
    out.write_all(&body)?;
    out.finish()?;
    Ok(name)
}

pub(super) fn read_doc_values_updates(
    dir: &dyn Directory,
    segment: &str,
    dv_gen: u64,
    max_doc: u32,
) -> Result<DocValuesUpdates> {
    let name = doc_values_updates_file_name(segment, dv_gen);
    let data = dir.open_input(&name)?;
    let corrupt = |reason: String| TesseraError::CorruptSegment {
        segment: segment.to_string(),
        reason: format!("{}: {}", name, reason),
    };
    let body = check_file(&data, CODEC, VERSION).map_err(corrupt)?;
    let updates: DocValuesUpdates = bincode::deserialize(&body[..]).map_err(|e| corrupt(e.to_string()))?;
    if let Some(doc) = updates.max_doc_id() {
        if doc >= max_doc {
            return Err(corrupt(format!("update of doc {} beyond max_doc {}", doc, max_doc)));
        }
    }
    Ok(updates)
}
