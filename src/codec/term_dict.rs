//! Term dictionary using FST (Finite State Transducer)
//!
//! One FST per field maps term bytes to an index into a parallel array of
//! [`TermMeta`] (stats plus the location of the term's postings).

use std::io;

use bytes::Bytes;
use fst::{IntoStreamer, Map, MapBuilder, Streamer};
use serde::{Deserialize, Serialize};

use super::postings::BlockPostingsEnum;
use super::{FieldStats, PostingsEnum, TermStats, TermsEnum};
use crate::models::IndexOptions;

/// Per-term metadata: stats and postings location
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermMeta {
    pub doc_freq: u32,
    pub total_term_freq: u64,
    /// Offset of the postings in the postings file body
    pub offset: u64,
    pub length: u64,
}

impl TermMeta {
    pub fn stats(&self) -> TermStats {
        TermStats {
            doc_freq: self.doc_freq,
            total_term_freq: self.total_term_freq,
        }
    }
}

/// Serialized form of one field's dictionary
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldTermsData {
    pub field: String,
    pub fst: Vec<u8>,
    pub metas: Vec<TermMeta>,
    pub stats: FieldStats,
}

/// Term dictionary of one field
pub struct FieldTerms {
    fst: Map<Vec<u8>>,
    metas: Vec<TermMeta>,
    stats: FieldStats,
    options: IndexOptions,
}

impl FieldTerms {
    pub fn new(data: FieldTermsData, options: IndexOptions) -> io::Result<Self> {
        let fst = Map::new(data.fst).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if fst.len() != data.metas.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "term dictionary of {} has {} terms but {} metadata entries",
                    data.field,
                    fst.len(),
                    data.metas.len()
                ),
            ));
        }
        Ok(Self {
            fst,
            metas: data.metas,
            stats: data.stats,
            options,
        })
    }

    /// Look up a term's metadata
    pub fn get(&self, term: &[u8]) -> Option<&TermMeta> {
        self.fst
            .get(term)
            .and_then(|idx| self.metas.get(idx as usize))
    }

    pub fn len(&self) -> usize {
        self.metas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metas.is_empty()
    }

    pub fn stats(&self) -> FieldStats {
        self.stats
    }

    pub fn options(&self) -> IndexOptions {
        self.options
    }

    /// Enumerate terms, reading postings out of `postings`
    pub fn terms_enum<'a>(&'a self, postings: &'a Bytes) -> SegmentTermsEnum<'a> {
        SegmentTermsEnum {
            terms: self,
            postings,
            stream: self.fst.stream(),
            current: Vec::new(),
            meta: None,
        }
    }
}

/// Streaming builder; terms must arrive in sorted order
pub struct TermDictionaryBuilder {
    field: String,
    builder: MapBuilder<Vec<u8>>,
    metas: Vec<TermMeta>,
}

impl TermDictionaryBuilder {
    pub fn new(field: &str) -> Self {
        Self {
            field: field.to_string(),
            builder: MapBuilder::memory(),
            metas: Vec::new(),
        }
    }

    /// Add a term with its metadata
    pub fn add(&mut self, term: &[u8], meta: TermMeta) -> io::Result<()> {
        self.builder
            .insert(term, self.metas.len() as u64)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        self.metas.push(meta);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.metas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metas.is_empty()
    }

    pub fn finish(self, stats: FieldStats) -> io::Result<FieldTermsData> {
        let fst = self
            .builder
            .into_inner()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(FieldTermsData {
            field: self.field,
            fst,
            metas: self.metas,
            stats,
        })
    }
}

/// Terms enumeration over one field of an on-disk segment
pub struct SegmentTermsEnum<'a> {
    terms: &'a FieldTerms,
    postings: &'a Bytes,
    stream: fst::map::Stream<'a>,
    current: Vec<u8>,
    meta: Option<TermMeta>,
}

impl<'a> TermsEnum for SegmentTermsEnum<'a> {
    fn next(&mut self) -> io::Result<bool> {
        match self.stream.next() {
            Some((term, idx)) => {
                self.current.clear();
                self.current.extend_from_slice(term);
                self.meta = self.terms.metas.get(idx as usize).copied();
                Ok(self.meta.is_some())
            }
            None => {
                self.current.clear();
                self.meta = None;
                Ok(false)
            }
        }
    }

    fn term(&self) -> &[u8] {
        &self.current
    }

    fn stats(&self) -> TermStats {
        self.meta.map(|m| m.stats()).unwrap_or_default()
    }

    fn seek_exact(&mut self, term: &[u8]) -> io::Result<bool> {
        self.stream = self.terms.fst.range().gt(term).into_stream();
        match self.terms.get(term) {
            Some(meta) => {
                self.current.clear();
                self.current.extend_from_slice(term);
                self.meta = Some(*meta);
                Ok(true)
            }
            None => {
                self.current.clear();
                self.meta = None;
                Ok(false)
            }
        }
    }

    fn postings(&self) -> io::Result<Box<dyn PostingsEnum + '_>> {
        let meta = self.meta.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "terms enum is not positioned")
        })?;
        Ok(Box::new(BlockPostingsEnum::for_term(
            self.postings,
            &meta,
            self.terms.options,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(terms: &[&str]) -> FieldTerms {
        let mut builder = TermDictionaryBuilder::new("body");
        for (i, term) in terms.iter().enumerate() {
            let meta = TermMeta {
                doc_freq: i as u32 + 1,
                total_term_freq: (i as u64 + 1) * 2,
                offset: 0,
                length: 0,
            };
            builder.add(term.as_bytes(), meta).unwrap();
        }
        let data = builder.finish(FieldStats::default()).unwrap();
        FieldTerms::new(data, IndexOptions::DocsAndFreqs).unwrap()
    }

    #[test]
    fn test_lookup() {
        let dict = build(&["apple", "banana", "cherry"]);
        assert_eq!(dict.len(), 3);
        assert_eq!(dict.get(b"banana").unwrap().doc_freq, 2);
        assert!(dict.get(b"durian").is_none());
    }

    #[test]
    fn test_builder_rejects_unsorted() {
        let mut builder = TermDictionaryBuilder::new("body");
        builder.add(b"b", TermMeta::default()).unwrap();
        assert!(builder.add(b"a", TermMeta::default()).is_err());
    }

    #[test]
    fn test_enum_and_seek() {
        let dict = build(&["apple", "banana", "cherry", "date"]);
        let postings = Bytes::new();
        let mut terms = dict.terms_enum(&postings);

        assert!(terms.next().unwrap());
        assert_eq!(terms.term(), b"apple");
        assert_eq!(terms.stats().doc_freq, 1);

        assert!(terms.seek_exact(b"banana").unwrap());
        assert_eq!(terms.stats().total_term_freq, 4);
        assert!(terms.next().unwrap());
        assert_eq!(terms.term(), b"cherry");

        // A miss still positions next() after the sought term
        assert!(!terms.seek_exact(b"coconut").unwrap());
        assert!(terms.next().unwrap());
        assert_eq!(terms.term(), b"date");
        assert!(!terms.next().unwrap());
    }
}
