//! Buffered deletes and doc values updates, and the queries that select
//! the documents they apply to

use std::fmt;
use std::io;
use std::sync::Arc;

use roaring::RoaringBitmap;

use crate::codec::{DocValueUpdate, DocValuesUpdates, SegmentSource};
use crate::models::Term;

/// Selects the documents of a segment to delete
pub trait DeleteQuery: Send + Sync + fmt::Debug {
    /// Matching docs among all of `source`, deleted ones included
    fn matching_docs(&self, source: &dyn SegmentSource) -> io::Result<RoaringBitmap>;
}

/// Matches documents containing any of the terms
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TermsQuery {
    terms: Vec<Term>,
}

impl TermsQuery {
    pub fn new(terms: Vec<Term>) -> Self {
        Self { terms }
    }

    pub fn single(term: Term) -> Self {
        Self { terms: vec![term] }
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }
}

impl DeleteQuery for TermsQuery {
    fn matching_docs(&self, source: &dyn SegmentSource) -> io::Result<RoaringBitmap> {
        let mut docs = RoaringBitmap::new();
        for term in &self.terms {
            term_docs(source, term, &mut docs)?;
        }
        Ok(docs)
    }
}

fn term_docs(source: &dyn SegmentSource, term: &Term, docs: &mut RoaringBitmap) -> io::Result<()> {
    let mut terms = match source.terms(&term.field)? {
        Some(terms) => terms,
        None => return Ok(()),
    };
    if !terms.seek_exact(&term.bytes)? {
        return Ok(());
    }
    let mut postings = terms.postings()?;
    while let Some(posting) = postings.next()? {
        docs.insert(posting.doc);
    }
    Ok(())
}

/// Matches documents whose numeric doc value lies in `[min, max]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NumericRangeQuery {
    pub field: String,
    pub min: i64,
    pub max: i64,
}

impl NumericRangeQuery {
    pub fn new(field: &str, min: i64, max: i64) -> Self {
        Self {
            field: field.to_string(),
            min,
            max,
        }
    }
}

impl DeleteQuery for NumericRangeQuery {
    fn matching_docs(&self, source: &dyn SegmentSource) -> io::Result<RoaringBitmap> {
        let mut docs = RoaringBitmap::new();
        if self.min > self.max || source.field_infos().get(&self.field).is_none() {
            return Ok(docs);
        }
        for doc in 0..source.max_doc() {
            if let Some(value) = source.numeric_value(&self.field, doc) {
                if value >= self.min && value <= self.max {
                    docs.insert(doc);
                }
            }
        }
        Ok(docs)
    }
}

/// Deletes waiting for the next flush.
///
/// Each entry remembers how many documents were buffered when it was
/// issued; against the buffer it only applies to those. Against flushed
/// segments it applies to every document.
#[derive(Debug, Default)]
pub struct BufferedDeletes {
    queries: Vec<(Arc<dyn DeleteQuery>, u32)>,
}

impl BufferedDeletes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, query: Arc<dyn DeleteQuery>, upto: u32) {
        self.queries.push((query, upto));
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn clear(&mut self) {
        self.queries.clear();
    }

    /// Buffered docs selected by the deletes, honoring each `upto`
    pub fn buffered_matches(&self, buffer: &dyn SegmentSource) -> io::Result<RoaringBitmap> {
        let mut docs = RoaringBitmap::new();
        for (query, upto) in &self.queries {
            if *upto == 0 {
                continue;
            }
            let mut matches = query.matching_docs(buffer)?;
            matches.remove_range(*upto..);
            docs |= matches;
        }
        Ok(docs)
    }

    /// Docs of a flushed segment selected by any of the deletes
    pub fn segment_matches(&self, source: &dyn SegmentSource) -> io::Result<RoaringBitmap> {
        let mut docs = RoaringBitmap::new();
        for (query, _) in &self.queries {
            docs |= query.matching_docs(source)?;
        }
        Ok(docs)
    }
}

#[derive(Debug)]
struct BufferedUpdate {
    term: Term,
    field: String,
    value: DocValueUpdate,
    upto: u32,
}

/// Doc values updates waiting for the next flush, in the order issued.
///
/// Like deletes, each update only applies to the documents buffered
/// before it, and to every document of flushed segments.
#[derive(Debug, Default)]
pub struct BufferedUpdates {
    updates: Vec<BufferedUpdate>,
}

impl BufferedUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, term: Term, field: &str, value: DocValueUpdate, upto: u32) {
        self.updates.push(BufferedUpdate {
            term,
            field: field.to_string(),
            value,
            upto,
        });
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn clear(&mut self) {
        self.updates.clear();
    }

    /// Values for the buffered docs, honoring each `upto`
    pub fn buffered_updates(&self, buffer: &dyn SegmentSource) -> io::Result<DocValuesUpdates> {
        self.resolve(buffer, true)
    }

    /// Values for the docs of a flushed segment
    pub fn segment_updates(&self, source: &dyn SegmentSource) -> io::Result<DocValuesUpdates> {
        self.resolve(source, false)
    }

    fn resolve(&self, source: &dyn SegmentSource, limited: bool) -> io::Result<DocValuesUpdates> {
        let mut resolved = DocValuesUpdates::new();
        for update in &self.updates {
            let mut docs = RoaringBitmap::new();
            term_docs(source, &update.term, &mut docs)?;
            if limited {
                docs.remove_range(update.upto..);
            }
            for doc in docs.iter() {
                resolved.set(&update.field, doc, update.value.clone());
            }
        }
        Ok(resolved)
    }
}
