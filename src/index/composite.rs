//! Composite view over several leaves with a global doc id space

use std::io;
use std::sync::Arc;

use super::multi_terms::{DocMapping, MultiTermsEnum};
use super::segment_reader::LeafReader;
use super::types::{DocId, MAX_DOCS};
use crate::codec::{FieldStats, Posting, PostingsEnum, TermStats, TermsEnum};
use crate::error::{Result, TesseraError};
use crate::models::{StoredDocument, Term};

/// A leaf and where its docs start in the global id space
#[derive(Clone)]
pub struct LeafContext {
    pub reader: Arc<dyn LeafReader>,
    pub doc_base: DocId,
    /// Position among the leaves
    pub ord: usize,
}

impl std::fmt::Debug for LeafContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafContext")
            .field("name", &self.reader.name())
            .field("doc_base", &self.doc_base)
            .field("max_doc", &self.reader.max_doc())
            .finish()
    }
}

/// Immutable view of several leaves as one index
#[derive(Debug)]
pub struct CompositeReader {
    leaves: Vec<LeafContext>,
    max_doc: DocId,
    num_docs: DocId,
}

impl CompositeReader {
    /// Build the view, failing with `CapacityExceeded` if the leaves
    /// together hold more than [`MAX_DOCS`] documents
    pub fn new(readers: Vec<Arc<dyn LeafReader>>) -> Result<Self> {
        let total: u64 = readers.iter().map(|r| r.max_doc() as u64).sum();
        if total > MAX_DOCS as u64 {
            return Err(TesseraError::CapacityExceeded {
                requested: total,
                limit: MAX_DOCS,
            });
        }

        let mut leaves = Vec::with_capacity(readers.len());
        let mut doc_base = 0u32;
        let mut num_docs = 0u32;
        for (ord, reader) in readers.into_iter().enumerate() {
            let max_doc = reader.max_doc();
            num_docs += reader.num_docs();
            leaves.push(LeafContext {
                reader,
                doc_base,
                ord,
            });
            doc_base += max_doc;
        }

        Ok(Self {
            leaves,
            max_doc: doc_base,
            num_docs,
        })
    }

    pub fn leaves(&self) -> &[LeafContext] {
        &self.leaves
    }

    pub fn max_doc(&self) -> DocId {
        self.max_doc
    }

    pub fn num_docs(&self) -> DocId {
        self.num_docs
    }

    pub fn has_deletions(&self) -> bool {
        self.num_docs < self.max_doc
    }

    /// Leaf holding a global doc id, with the doc's local id
    pub fn leaf_for(&self, doc: DocId) -> Option<(&LeafContext, DocId)> {
        if doc >= self.max_doc {
            return None;
        }
        let idx = self.leaves.partition_point(|leaf| leaf.doc_base <= doc) - 1;
        let leaf = &self.leaves[idx];
        Some((leaf, doc - leaf.doc_base))
    }

    fn locate(&self, doc: DocId) -> io::Result<(&LeafContext, DocId)> {
        self.leaf_for(doc).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("doc {} out of range (max_doc {})", doc, self.max_doc),
            )
        })
    }

    pub fn is_deleted(&self, doc: DocId) -> bool {
        match self.leaf_for(doc) {
            Some((leaf, local)) => leaf.reader.is_deleted(local),
            None => false,
        }
    }

    /// Stored fields of a document
    pub fn document(&self, doc: DocId) -> Result<StoredDocument> {
        let (leaf, local) = self.locate(doc)?;
        Ok(leaf.reader.source().stored_document(local)?)
    }

    pub fn numeric_value(&self, field: &str, doc: DocId) -> Option<i64> {
        let (leaf, local) = self.leaf_for(doc)?;
        leaf.reader.source().numeric_value(field, local)
    }

    pub fn binary_value(&self, field: &str, doc: DocId) -> Option<Vec<u8>> {
        let (leaf, local) = self.leaf_for(doc)?;
        leaf.reader.source().binary_value(field, local)
    }

    /// Merged terms of a field across all leaves, or `None` if no leaf
    /// indexes it
    pub fn terms(&self, field: &str) -> Result<Option<MultiTermsEnum<'_>>> {
        let mut subs = Vec::new();
        for leaf in &self.leaves {
            if let Some(terms) = leaf.reader.source().terms(field)? {
                let mapping = DocMapping::Rebase {
                    base: leaf.doc_base,
                    deleted: leaf.reader.deleted_docs().cloned(),
                };
                subs.push((terms, mapping));
            }
        }
        if subs.is_empty() {
            Ok(None)
        } else {
            Ok(Some(MultiTermsEnum::new(subs)))
        }
    }

    /// Live postings of a term with global doc ids
    pub fn postings(&self, term: &Term) -> Result<Vec<Posting>> {
        let mut out = Vec::new();
        let mut terms = match self.terms(&term.field)? {
            Some(terms) => terms,
            None => return Ok(out),
        };
        if terms.seek_exact(&term.bytes)? {
            let mut postings = terms.live_postings()?;
            while let Some(posting) = postings.next()? {
                out.push(posting);
            }
        }
        Ok(out)
    }

    /// Statistics of a term summed over the leaves; deleted docs count
    pub fn term_stats(&self, term: &Term) -> Result<TermStats> {
        if let Some(mut terms) = self.terms(&term.field)? {
            if terms.seek_exact(&term.bytes)? {
                return Ok(terms.stats());
            }
        }
        Ok(TermStats::default())
    }

    pub fn doc_freq(&self, term: &Term) -> Result<u32> {
        Ok(self.term_stats(term)?.doc_freq)
    }

    pub fn total_term_freq(&self, term: &Term) -> Result<u64> {
        Ok(self.term_stats(term)?.total_term_freq)
    }

    /// Field statistics summed over the leaves
    pub fn field_stats(&self, field: &str) -> Option<FieldStats> {
        let mut total: Option<FieldStats> = None;
        for leaf in &self.leaves {
            if let Some(stats) = leaf.reader.source().field_stats(field) {
                total.get_or_insert_with(FieldStats::default).add(stats);
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubLeaf;

    fn stubs(sizes: &[u32]) -> Vec<Arc<dyn LeafReader>> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, &n)| Arc::new(StubLeaf::new(&format!("_{}", i), n)) as Arc<dyn LeafReader>)
            .collect()
    }

    #[test]
    fn test_doc_bases() {
        let reader = CompositeReader::new(stubs(&[3, 0, 5, 2])).unwrap();
        assert_eq!(reader.max_doc(), 10);
        let bases: Vec<_> = reader.leaves().iter().map(|l| l.doc_base).collect();
        assert_eq!(bases, vec![0, 3, 3, 8]);

        let (leaf, local) = reader.leaf_for(3).unwrap();
        assert_eq!((leaf.ord, local), (2, 0));
        let (leaf, local) = reader.leaf_for(9).unwrap();
        assert_eq!((leaf.ord, local), (3, 1));
        assert!(reader.leaf_for(10).is_none());
    }

    #[test]
    fn test_empty_reader() {
        let reader = CompositeReader::new(Vec::new()).unwrap();
        assert_eq!(reader.max_doc(), 0);
        assert!(reader.leaf_for(0).is_none());
        assert!(reader.terms("body").unwrap().is_none());
        assert!(reader.field_stats("body").is_none());
    }

    #[test]
    fn test_rejects_overflow() {
        match CompositeReader::new(stubs(&[MAX_DOCS, 1])) {
            Err(TesseraError::CapacityExceeded { requested, limit }) => {
                assert_eq!(requested, 1u64 << 31);
                assert_eq!(limit, MAX_DOCS);
            }
            other => panic!("expected CapacityExceeded, got {:?}", other.map(|r| r.max_doc())),
        }
        assert_eq!(CompositeReader::new(stubs(&[MAX_DOCS])).unwrap().max_doc(), MAX_DOCS);
    }
}
