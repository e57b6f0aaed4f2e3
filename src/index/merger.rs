//! Merge execution: compacting several segments into one
//!
//! Live documents of the inputs are renumbered into a contiguous id space
//! in segment order. Deleted documents get no id in the output. The codec
//! writes the merged segment straight from a [`MergeSource`], which
//! exposes the inputs through that renumbering; terms come from a k-way
//! merge over the inputs' term enumerations.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use roaring::RoaringBitmap;
use tracing::{debug, info};

use super::multi_terms::{DocMapping, MultiTermsEnum, DROPPED};
use crate::codec::{Codec, FieldInfos, FieldStats, SegmentSource, TermsEnum, WrittenSegment};
use crate::directory::{delete_with_prefix, Directory};
use crate::error::{Result, TesseraError};
use crate::models::StoredDocument;

/// One segment feeding a merge, with the deletions seen when it started
#[derive(Clone)]
pub struct MergeInput {
    pub name: String,
    pub core: Arc<dyn SegmentSource>,
    pub deleted: Arc<RoaringBitmap>,
}

impl std::fmt::Debug for MergeInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeInput")
            .field("name", &self.name)
            .field("max_doc", &self.core.max_doc())
            .field("deleted", &self.deleted.len())
            .finish()
    }
}

/// Old doc id to new doc id for one input; [`DROPPED`] for deleted docs
pub type DocMap = Arc<Vec<u32>>;

/// Compacting view of the merge inputs
pub struct MergeSource {
    inputs: Vec<MergeInput>,
    doc_maps: Vec<DocMap>,
    /// Live local doc ids per input, in order
    live: Vec<Vec<u32>>,
    /// First new doc id of each input
    bases: Vec<u32>,
    max_doc: u32,
    field_infos: FieldInfos,
}

impl MergeSource {
    pub fn new(inputs: Vec<MergeInput>) -> Self {
        let mut doc_maps = Vec::with_capacity(inputs.len());
        let mut live = Vec::with_capacity(inputs.len());
        let mut bases = Vec::with_capacity(inputs.len());
        let mut field_infos = FieldInfos::new();
        let mut next = 0u32;

        for input in &inputs {
            bases.push(next);
            field_infos.merge(input.core.field_infos());
            let max_doc = input.core.max_doc();
            let mut map = Vec::with_capacity(max_doc as usize);
            let mut docs = Vec::with_capacity(max_doc as usize);
            for doc in 0..max_doc {
                if input.deleted.contains(doc) {
                    map.push(DROPPED);
                } else {
                    map.push(next);
                    docs.push(doc);
                    next += 1;
                }
            }
            doc_maps.push(Arc::new(map));
            live.push(docs);
        }

        Self {
            inputs,
            doc_maps,
            live,
            bases,
            max_doc: next,
            field_infos,
        }
    }

    pub fn doc_maps(&self) -> &[DocMap] {
        &self.doc_maps
    }

    /// Input and local doc id behind a new doc id
    fn locate(&self, doc: u32) -> Option<(&MergeInput, u32)> {
        if doc >= self.max_doc {
            return None;
        }
        // Inputs without live docs share their base with the next input
        let idx = self.bases.partition_point(|&base| base <= doc).checked_sub(1)?;
        let local = *self.live[idx].get((doc - self.bases[idx]) as usize)?;
        Some((&self.inputs[idx], local))
    }
}

impl SegmentSource for MergeSource {
    fn max_doc(&self) -> u32 {
        self.max_doc
    }

    fn field_infos(&self) -> &FieldInfos {
        &self.field_infos
    }

    fn terms(&self, field: &str) -> io::Result<Option<Box<dyn TermsEnum + '_>>> {
        let mut subs = Vec::new();
        for (input, map) in self.inputs.iter().zip(&self.doc_maps) {
            if let Some(terms) = input.core.terms(field)? {
                subs.push((terms, DocMapping::Compact { map: map.clone() }));
            }
        }
        if subs.is_empty() {
            return Ok(None);
        }
        Ok(Some(Box::new(MultiTermsEnum::new(subs))))
    }

    /// Unknown until written; the codec counts while it writes
    fn field_stats(&self, _field: &str) -> Option<FieldStats> {
        None
    }

    fn stored_document(&self, doc: u32) -> io::Result<StoredDocument> {
        let (input, local) = self.locate(doc).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("doc {} out of range (max_doc {})", doc, self.max_doc),
            )
        })?;
        input.core.stored_document(local)
    }

    fn numeric_value(&self, field: &str, doc: u32) -> Option<i64> {
        let (input, local) = self.locate(doc)?;
        input.core.numeric_value(field, local)
    }

    fn binary_value(&self, field: &str, doc: u32) -> Option<Vec<u8>> {
        let (input, local) = self.locate(doc)?;
        input.core.binary_value(field, local)
    }
}

/// A written and reopened merge result
pub struct MergedSegment {
    pub written: WrittenSegment,
    pub core: Arc<dyn SegmentSource>,
    pub doc_maps: Vec<DocMap>,
}

/// Write the merge of `inputs` as segment `segment` and open it.
///
/// On failure every file of the new segment is removed; the inputs are
/// never touched.
pub fn merge_segments(
    dir: &dyn Directory,
    codec: &dyn Codec,
    segment: &str,
    inputs: Vec<MergeInput>,
) -> Result<MergedSegment> {
    let start = Instant::now();
    let input_docs: u64 = inputs.iter().map(|i| i.core.max_doc() as u64).sum();
    let source = MergeSource::new(inputs);
    debug!(segment, inputs = source.inputs.len(), live_docs = source.max_doc, "Merging");

    let discard = |e: io::Error| {
        let removed = delete_with_prefix(dir, &format!("{}.", segment));
        debug!(segment, removed = removed.len(), "Discarded partial merge output");
        TesseraError::durability("merge", e)
    };

    let written = codec.write_segment(dir, segment, &source).map_err(discard)?;
    let core = match codec.open_segment(dir, segment, written.max_doc) {
        Ok(core) => core,
        Err(e) => {
            delete_with_prefix(dir, &format!("{}.", segment));
            return Err(e);
        }
    };

    info!(
        segment,
        input_docs,
        output_docs = written.max_doc,
        bytes = written.size_bytes,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Merge complete"
    );

    Ok(MergedSegment {
        written,
        core,
        doc_maps: source.doc_maps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{lookup, PostingsEnum, DEFAULT_CODEC};
    use crate::config::TokenizerConfig;
    use crate::directory::RamDirectory;
    use crate::index::DocumentsBuffer;
    use crate::models::Document;
    use crate::tokenizer::StandardAnalyzer;

    fn input(name: &str, docs: &[(&str, i64)], deleted: &[u32]) -> MergeInput {
        let mut buffer =
            DocumentsBuffer::new(Arc::new(StandardAnalyzer::new(&TokenizerConfig::default())));
        for (text, year) in docs {
            let mut doc = Document::new();
            doc.add_text("body", text);
            doc.add_int("year", *year);
            buffer.add_document(&doc).unwrap();
        }
        MergeInput {
            name: name.to_string(),
            core: Arc::new(buffer),
            deleted: Arc::new(deleted.iter().copied().collect()),
        }
    }

    fn postings(source: &dyn SegmentSource, field: &str, term: &str) -> Vec<(u32, u32)> {
        let mut terms = source.terms(field).unwrap().unwrap();
        if !terms.seek_exact(term.as_bytes()).unwrap() {
            return Vec::new();
        }
        let mut postings = terms.postings().unwrap();
        let mut out = Vec::new();
        while let Some(p) = postings.next().unwrap() {
            out.push((p.doc, p.freq));
        }
        out
    }

    #[test]
    fn test_compacts_deleted_docs() {
        let source = MergeSource::new(vec![
            input("_0", &[("red fox", 1), ("blue fox", 2), ("red red hen", 3)], &[1]),
            input("_1", &[("gone", 4)], &[0]),
            input("_2", &[("red cow", 5)], &[]),
        ]);

        assert_eq!(source.max_doc(), 3);
        assert_eq!(source.doc_maps()[0].as_slice(), &[0, DROPPED, 1]);
        assert_eq!(source.doc_maps()[1].as_slice(), &[DROPPED]);
        assert_eq!(source.doc_maps()[2].as_slice(), &[2]);

        assert_eq!(postings(&source, "body", "red"), vec![(0, 1), (1, 2), (2, 1)]);
        assert_eq!(postings(&source, "body", "blue"), Vec::<(u32, u32)>::new());
        assert_eq!(source.numeric_value("year", 2), Some(5));
        assert_eq!(source.numeric_value("year", 3), None);
        assert!(source.stored_document(3).is_err());

        assert!(source.field_stats("body").is_none());
    }

    #[test]
    fn test_merge_segments_writes_compacted_segment() {
        let dir = RamDirectory::new();
        let codec = lookup(DEFAULT_CODEC).unwrap();
        let merged = merge_segments(
            &dir,
            codec.as_ref(),
            "_5",
            vec![
                input("_0", &[("alpha beta", 1), ("beta", 2)], &[0]),
                input("_1", &[("beta gamma", 3)], &[]),
            ],
        )
        .unwrap();

        assert_eq!(merged.written.max_doc, 2);
        assert_eq!(merged.core.max_doc(), 2);
        assert_eq!(postings(merged.core.as_ref(), "body", "beta"), vec![(0, 1), (1, 1)]);
        // Terms whose docs were all deleted are not written
        let mut terms = merged.core.terms("body").unwrap().unwrap();
        assert!(!terms.seek_exact(b"alpha").unwrap());
        assert_eq!(merged.core.numeric_value("year", 1), Some(3));

        // Stats cover only the surviving docs
        let stats = merged.core.field_stats("body").unwrap();
        assert_eq!(stats.doc_count, 2);
        // beta x2, gamma
        assert_eq!(stats.sum_total_term_freq, 3);
        assert_eq!(stats.term_count, 2);
    }
}
