//! In-memory buffer for documents added since the last flush
//!
//! Documents are analyzed on arrival into per-field term maps. The buffer
//! is itself a [`SegmentSource`], so a flush hands it straight to the
//! codec. Docs deleted while still buffered keep their postings and are
//! recorded in the initial live docs of the flushed segment.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::mem;
use std::sync::Arc;

use roaring::RoaringBitmap;

use crate::codec::{FieldInfos, FieldStats, Posting, PostingsEnum, SegmentSource, TermStats, TermsEnum};
use crate::error::{Result, TesseraError};
use crate::models::{DocValuesType, Document, FieldValue, StoredDocument};
use crate::tokenizer::{Analyzer, Token};

/// Per-document working state of one field
#[derive(Default)]
struct FieldState {
    /// Position of the last token, -1 before the first
    position: i64,
    offset_base: u32,
    terms: HashMap<Vec<u8>, Posting>,
}

/// Buffered documents, indexed but not yet written as a segment
pub struct DocumentsBuffer {
    analyzer: Arc<dyn Analyzer>,
    field_infos: FieldInfos,
    /// Field to term to postings, in doc order
    postings: HashMap<String, HashMap<Vec<u8>, Vec<Posting>>>,
    stored: Vec<StoredDocument>,
    numeric: HashMap<String, BTreeMap<u32, i64>>,
    binary: HashMap<String, BTreeMap<u32, Vec<u8>>>,
    deleted: RoaringBitmap,
    ram_bytes: usize,
}

impl DocumentsBuffer {
    pub fn new(analyzer: Arc<dyn Analyzer>) -> Self {
        Self {
            analyzer,
            field_infos: FieldInfos::new(),
            postings: HashMap::new(),
            stored: Vec::new(),
            numeric: HashMap::new(),
            binary: HashMap::new(),
            deleted: RoaringBitmap::new(),
            ram_bytes: 0,
        }
    }

    /// Index a document into the buffer
    ///
    /// Returns the buffer-local doc id. A document whose doc values clash
    /// with earlier documents is rejected without changing the buffer.
    pub fn add_document(&mut self, doc: &Document) -> Result<u32> {
        self.validate(doc)?;

        let doc_id = self.stored.len() as u32;
        let mut fields: HashMap<&str, FieldState> = HashMap::new();
        let mut stored = StoredDocument::new();

        for field in doc.fields() {
            let options = field.options;
            self.field_infos
                .add(&field.name, &options)
                .map_err(TesseraError::InvalidArgument)?;

            if options.stored {
                self.ram_bytes += field.name.len() + value_size(&field.value);
                stored.push(&field.name, field.value.clone());
            }

            match options.doc_values {
                Some(DocValuesType::Numeric) => {
                    if let Some(value) = field.value.as_int() {
                        self.numeric
                            .entry(field.name.clone())
                            .or_default()
                            .insert(doc_id, value);
                        self.ram_bytes += mem::size_of::<(u32, i64)>();
                    }
                }
                Some(DocValuesType::Binary) => {
                    let value = field.value.to_bytes();
                    self.ram_bytes += value.len() + mem::size_of::<u32>();
                    self.binary
                        .entry(field.name.clone())
                        .or_default()
                        .insert(doc_id, value);
                }
                None => {}
            }

            if options.index_options.is_none() {
                continue;
            }
            let tokens = match (&field.value, options.tokenized) {
                (FieldValue::Text(text), true) => self.analyzer.analyze(&field.name, text),
                (value, _) => {
                    let term = value.to_bytes();
                    let end = term.len() as u32;
                    vec![Token {
                        term,
                        position_increment: 1,
                        start_offset: 0,
                        end_offset: end,
                    }]
                }
            };

            let state = fields.entry(field.name.as_str()).or_insert_with(|| FieldState {
                position: -1,
                ..FieldState::default()
            });
            let mut last_end = 0;
            for token in tokens {
                state.position += token.position_increment as i64;
                let position = state.position.max(0) as u32;
                let start = state.offset_base + token.start_offset;
                let end = state.offset_base + token.end_offset;
                last_end = last_end.max(token.end_offset);

                let posting = state
                    .terms
                    .entry(token.term)
                    .or_insert_with(|| Posting::new(doc_id, 0));
                posting.freq += 1;
                posting.positions.push(position);
                posting.offsets.push((start, end));
            }
            state.offset_base += match &field.value {
                FieldValue::Text(text) => text.len() as u32,
                _ => last_end,
            };
        }

        for (name, state) in fields {
            let field_postings = self.postings.entry(name.to_string()).or_default();
            for (term, posting) in state.terms {
                self.ram_bytes += mem::size_of::<Posting>()
                    + posting.positions.len() * mem::size_of::<u32>()
                    + posting.offsets.len() * mem::size_of::<(u32, u32)>();
                match field_postings.get_mut(&term) {
                    Some(list) => list.push(posting),
                    None => {
                        self.ram_bytes += term.len() + mem::size_of::<Vec<Posting>>();
                        field_postings.insert(term, vec![posting]);
                    }
                }
            }
        }

        self.ram_bytes += mem::size_of::<StoredDocument>();
        self.stored.push(stored);
        Ok(doc_id)
    }

    /// Reject documents that would leave the field infos inconsistent
    fn validate(&self, doc: &Document) -> Result<()> {
        let mut doc_values: HashMap<&str, DocValuesType> = HashMap::new();
        for field in doc.fields() {
            let requested = match field.options.doc_values {
                Some(kind) => kind,
                None => continue,
            };
            if doc_values.insert(&field.name, requested).is_some() {
                return Err(TesseraError::InvalidArgument(format!(
                    "field {} has more than one doc value in a document",
                    field.name
                )));
            }
            if requested == DocValuesType::Numeric && field.value.as_int().is_none() {
                return Err(TesseraError::InvalidArgument(format!(
                    "numeric doc values field {} needs an integer value",
                    field.name
                )));
            }
            if let Some(existing) = self.field_infos.get(&field.name).and_then(|f| f.doc_values) {
                if existing != requested {
                    return Err(TesseraError::InvalidArgument(format!(
                        "field {} has doc values {:?}, cannot add {:?}",
                        field.name, existing, requested
                    )));
                }
            }
        }
        Ok(())
    }

    /// Mark a buffered doc as deleted. Returns false if it already was.
    pub fn delete(&mut self, doc: u32) -> bool {
        doc < self.max_doc() && self.deleted.insert(doc)
    }

    pub fn deleted_docs(&self) -> &RoaringBitmap {
        &self.deleted
    }

    /// Buffered docs not marked deleted; `max_doc` is the doc id bound
    pub fn num_docs(&self) -> u32 {
        self.max_doc() - self.deleted.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.stored.is_empty()
    }

    /// Estimated heap usage of the buffered documents
    pub fn ram_bytes_used(&self) -> usize {
        self.ram_bytes
    }

    /// Drop everything, keeping the analyzer
    pub fn clear(&mut self) {
        *self = Self::new(self.analyzer.clone());
    }
}

fn value_size(value: &FieldValue) -> usize {
    match value {
        FieldValue::Text(text) => text.len(),
        FieldValue::Int(_) => mem::size_of::<i64>(),
        FieldValue::Bytes(bytes) => bytes.len(),
    }
}

impl SegmentSource for DocumentsBuffer {
    fn max_doc(&self) -> u32 {
        self.stored.len() as u32
    }

    fn field_infos(&self) -> &FieldInfos {
        &self.field_infos
    }

    fn terms(&self, field: &str) -> io::Result<Option<Box<dyn TermsEnum + '_>>> {
        let terms = match self.postings.get(field) {
            Some(terms) if !terms.is_empty() => terms,
            _ => return Ok(None),
        };
        let mut sorted: Vec<(&[u8], &[Posting])> = terms
            .iter()
            .map(|(term, postings)| (term.as_slice(), postings.as_slice()))
            .collect();
        sorted.sort_unstable_by(|a, b| a.0.cmp(b.0));
        Ok(Some(Box::new(BufferTermsEnum {
            terms: sorted,
            current: None,
            next: 0,
        })))
    }

    fn field_stats(&self, field: &str) -> Option<FieldStats> {
        let terms = self.postings.get(field)?;
        let mut docs = RoaringBitmap::new();
        let mut stats = FieldStats::default();
        for postings in terms.values() {
            stats.term_count += 1;
            stats.sum_doc_freq += postings.len() as u64;
            for posting in postings {
                docs.insert(posting.doc);
                stats.sum_total_term_freq += posting.freq as u64;
            }
        }
        stats.doc_count = docs.len() as u32;
        Some(stats)
    }

    fn stored_document(&self, doc: u32) -> io::Result<StoredDocument> {
        self.stored.get(doc as usize).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("doc {} out of range (max_doc {})", doc, self.stored.len()),
            )
        })
    }

    fn numeric_value(&self, field: &str, doc: u32) -> Option<i64> {
        self.numeric.get(field)?.get(&doc).copied()
    }

    fn binary_value(&self, field: &str, doc: u32) -> Option<Vec<u8>> {
        self.binary.get(field)?.get(&doc).cloned()
    }
}

struct BufferTermsEnum<'a> {
    terms: Vec<(&'a [u8], &'a [Posting])>,
    current: Option<usize>,
    /// Index `next` moves to
    next: usize,
}

impl<'a> TermsEnum for BufferTermsEnum<'a> {
    fn next(&mut self) -> io::Result<bool> {
        if self.next < self.terms.len() {
            self.current = Some(self.next);
            self.next += 1;
            Ok(true)
        } else {
            self.current = None;
            Ok(false)
        }
    }

    fn term(&self) -> &[u8] {
        self.current.map_or(&[][..], |i| self.terms[i].0)
    }

    fn stats(&self) -> TermStats {
        let postings = match self.current {
            Some(i) => self.terms[i].1,
            None => return TermStats::default(),
        };
        TermStats {
            doc_freq: postings.len() as u32,
            total_term_freq: postings.iter().map(|p| p.freq as u64).sum(),
        }
    }

    fn seek_exact(&mut self, term: &[u8]) -> io::Result<bool> {
        match self.terms.binary_search_by(|(t, _)| (*t).cmp(term)) {
            Ok(i) => {
                self.current = Some(i);
                self.next = i + 1;
                Ok(true)
            }
            Err(i) => {
                self.current = None;
                self.next = i;
                Ok(false)
            }
        }
    }

    fn postings(&self) -> io::Result<Box<dyn PostingsEnum + '_>> {
        let postings = self.current.map_or(&[][..], |i| self.terms[i].1);
        Ok(Box::new(BufferPostingsEnum { postings, next: 0 }))
    }
}

struct BufferPostingsEnum<'a> {
    postings: &'a [Posting],
    next: usize,
}

impl<'a> PostingsEnum for BufferPostingsEnum<'a> {
    fn next(&mut self) -> io::Result<Option<Posting>> {
        let posting = self.postings.get(self.next).cloned();
        self.next += 1;
        Ok(posting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenizerConfig;
    use crate::models::{Field, FieldOptions};
    use crate::tokenizer::StandardAnalyzer;

    fn buffer() -> DocumentsBuffer {
        DocumentsBuffer::new(Arc::new(StandardAnalyzer::new(&TokenizerConfig::default())))
    }

    fn postings_of(buffer: &DocumentsBuffer, field: &str, term: &str) -> Vec<Posting> {
        let mut terms = match buffer.terms(field).unwrap() {
            Some(terms) => terms,
            None => return Vec::new(),
        };
        if !terms.seek_exact(term.as_bytes()).unwrap() {
            return Vec::new();
        }
        let mut postings = terms.postings().unwrap();
        let mut out = Vec::new();
        while let Some(p) = postings.next().unwrap() {
            out.push(p);
        }
        out
    }

    #[test]
    fn test_positions_and_offsets() {
        let mut buffer = buffer();
        let mut doc = Document::new();
        doc.add_text("body", "red fish blue fish");
        buffer.add_document(&doc).unwrap();

        let fish = postings_of(&buffer, "body", "fish");
        assert_eq!(fish.len(), 1);
        assert_eq!(fish[0].freq, 2);
        assert_eq!(fish[0].positions, vec![1, 3]);
        assert_eq!(fish[0].offsets, vec![(4, 8), (14, 18)]);
    }

    #[test]
    fn test_multi_valued_field_continues_positions() {
        let mut buffer = buffer();
        let mut doc = Document::new();
        doc.add_text("body", "alpha beta").add_text("body", "alpha");
        buffer.add_document(&doc).unwrap();

        let alpha = postings_of(&buffer, "body", "alpha");
        assert_eq!(alpha[0].positions, vec![0, 2]);
        assert_eq!(alpha[0].offsets[1], (10, 15));
    }

    #[test]
    fn test_terms_sorted_and_seek() {
        let mut buffer = buffer();
        for text in ["delta alpha", "charlie bravo"] {
            let mut doc = Document::new();
            doc.add_text("body", text);
            buffer.add_document(&doc).unwrap();
        }

        let mut terms = buffer.terms("body").unwrap().unwrap();
        let mut seen = Vec::new();
        while terms.next().unwrap() {
            seen.push(String::from_utf8(terms.term().to_vec()).unwrap());
        }
        assert_eq!(seen, vec!["alpha", "bravo", "charlie", "delta"]);

        assert!(!terms.seek_exact(b"beta").unwrap());
        assert!(terms.next().unwrap());
        assert_eq!(terms.term(), b"bravo");
    }

    #[test]
    fn test_doc_values_and_stored() {
        let mut buffer = buffer();
        let mut doc = Document::new();
        doc.add_keyword("id", "a").add_int("year", 1999).add_binary("blob", vec![1, 2]);
        buffer.add_document(&doc).unwrap();
        buffer.add_document(&Document::new()).unwrap();

        assert_eq!(buffer.max_doc(), 2);
        assert_eq!(buffer.numeric_value("year", 0), Some(1999));
        assert_eq!(buffer.numeric_value("year", 1), None);
        assert_eq!(buffer.binary_value("blob", 0), Some(vec![1, 2]));
        assert_eq!(buffer.stored_document(0).unwrap().get_text("id"), Some("a"));
        assert_eq!(postings_of(&buffer, "year", "").len(), 0);
        assert_eq!(
            postings_of(&buffer, "id", "a"),
            vec![Posting {
                doc: 0,
                freq: 1,
                positions: vec![0],
                offsets: vec![(0, 1)],
            }]
        );
    }

    #[test]
    fn test_rejects_conflicting_doc_values() {
        let mut buffer = buffer();
        let mut doc = Document::new();
        doc.add_int("price", 10);
        buffer.add_document(&doc).unwrap();

        let mut bad = Document::new();
        bad.add_keyword("id", "x").add(Field::new(
            "price",
            FieldValue::Bytes(vec![1]),
            FieldOptions::binary_doc_values(),
        ));
        assert!(matches!(
            buffer.add_document(&bad),
            Err(TesseraError::InvalidArgument(_))
        ));
        // Nothing of the rejected doc was indexed
        assert_eq!(buffer.max_doc(), 1);
        assert!(buffer.field_infos().get("id").is_none());

        let mut twice = Document::new();
        twice.add_int("price", 1).add_int("price", 2);
        assert!(buffer.add_document(&twice).is_err());
    }

    #[test]
    fn test_deletes_and_stats() {
        let mut buffer = buffer();
        for text in ["a b", "b c", "c"] {
            let mut doc = Document::new();
            doc.add_text("body", text);
            buffer.add_document(&doc).unwrap();
        }
        assert!(buffer.delete(1));
        assert!(!buffer.delete(1));
        assert!(!buffer.delete(7));
        assert_eq!(buffer.num_docs(), 2);
        assert_eq!(buffer.max_doc(), 3);

        // Stats still count the deleted doc
        let stats = buffer.field_stats("body").unwrap();
        assert_eq!(stats.doc_count, 3);
        assert_eq!(stats.sum_doc_freq, 5);
        assert!(buffer.ram_bytes_used() > 0);

        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.ram_bytes_used(), 0);
    }
}
