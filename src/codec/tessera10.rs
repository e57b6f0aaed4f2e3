//! Default segment format
//!
//! A segment `_N` is written as five files, each with the common header
//! and checksum footer:
//!
//! - `_N.fnm`: field infos
//! - `_N.tim`: one FST term dictionary per indexed field, with term and
//!   field statistics
//! - `_N.pst`: postings of every term, addressed by the dictionary
//! - `_N.fdt`: stored fields
//! - `_N.dvd`: numeric and binary doc values columns

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::Arc;

use bytes::Bytes;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::docvalues::{BinaryColumn, NumericColumn};
use super::format::{check_file, ChecksumOutput};
use super::postings::PostingsWriter;
use super::stored::{StoredFieldsReader, StoredFieldsWriter};
use super::term_dict::{FieldTerms, FieldTermsData, TermDictionaryBuilder};
use super::{
    Codec, FieldInfos, FieldStats, SegmentSource, TermStats, TermsEnum, WrittenSegment,
    DEFAULT_CODEC,
};
use crate::directory::Directory;
use crate::error::{Result, TesseraError};
use crate::index::file_names::segment_file_name;
use crate::models::{DocValuesType, StoredDocument};

const VERSION: u32 = 1;

const FIELD_INFOS_EXTENSION: &str = "fnm";
const TERMS_EXTENSION: &str = "tim";
const POSTINGS_EXTENSION: &str = "pst";
const STORED_EXTENSION: &str = "fdt";
const DOC_VALUES_EXTENSION: &str = "dvd";

#[derive(Serialize, Deserialize)]
struct DocValuesEntry {
    field: String,
    kind: DocValuesType,
    data: Vec<u8>,
}

/// The default codec
#[derive(Clone, Copy, Debug, Default)]
pub struct Tessera10Codec;

impl Codec for Tessera10Codec {
    fn name(&self) -> &'static str {
        DEFAULT_CODEC
    }

    fn write_segment(
        &self,
        dir: &dyn Directory,
        segment: &str,
        source: &dyn SegmentSource,
    ) -> io::Result<WrittenSegment> {
        let max_doc = source.max_doc();
        let field_infos = source.field_infos().clone();
        let mut files = Vec::with_capacity(5);
        let mut size_bytes = 0;

        let mut add_file = |name: String, length: u64| {
            size_bytes += length;
            files.push(name);
        };

        let name = segment_file_name(segment, FIELD_INFOS_EXTENSION);
        let mut out = ChecksumOutput::create(dir.create_output(&name)?, DEFAULT_CODEC, VERSION)?;
        bincode::serialize_into(&mut out, &field_infos).map_err(invalid_data)?;
        add_file(name, out.finish()?);

        let (terms, postings_length) = write_postings(dir, segment, source, &field_infos)?;
        add_file(segment_file_name(segment, POSTINGS_EXTENSION), postings_length);

        let name = segment_file_name(segment, TERMS_EXTENSION);
        let mut out = ChecksumOutput::create(dir.create_output(&name)?, DEFAULT_CODEC, VERSION)?;
        bincode::serialize_into(&mut out, &terms).map_err(invalid_data)?;
        add_file(name, out.finish()?);

        let mut stored = StoredFieldsWriter::new();
        for doc in 0..max_doc {
            stored.add(&source.stored_document(doc)?)?;
        }
        let name = segment_file_name(segment, STORED_EXTENSION);
        let mut out = ChecksumOutput::create(dir.create_output(&name)?, DEFAULT_CODEC, VERSION)?;
        out.write_all(&stored.finish())?;
        add_file(name, out.finish()?);

        let mut columns = Vec::new();
        for info in field_infos.iter() {
            let kind = match info.doc_values {
                Some(kind) => kind,
                None => continue,
            };
            let data = match kind {
                DocValuesType::Numeric => {
                    let mut column = NumericColumn::with_capacity(max_doc as usize);
                    for doc in 0..max_doc {
                        column.add(source.numeric_value(&info.name, doc));
                    }
                    column.serialize()?
                }
                DocValuesType::Binary => {
                    let mut column = BinaryColumn::new();
                    for doc in 0..max_doc {
                        column.add(source.binary_value(&info.name, doc));
                    }
                    column.serialize()?
                }
            };
            columns.push(DocValuesEntry {
                field: info.name.clone(),
                kind,
                data,
            });
        }
        let name = segment_file_name(segment, DOC_VALUES_EXTENSION);
        let mut out = ChecksumOutput::create(dir.create_output(&name)?, DEFAULT_CODEC, VERSION)?;
        bincode::serialize_into(&mut out, &columns).map_err(invalid_data)?;
        add_file(name, out.finish()?);

        debug!(
            segment,
            max_doc,
            fields = field_infos.len(),
            size_bytes,
            "Wrote segment"
        );

        Ok(WrittenSegment {
            max_doc,
            files,
            size_bytes,
        })
    }

    fn open_segment(
        &self,
        dir: &dyn Directory,
        segment: &str,
        max_doc: u32,
    ) -> Result<Arc<dyn SegmentSource>> {
        Ok(Arc::new(Tessera10Segment::open(dir, segment, max_doc)?))
    }
}

/// Write the postings file, returning the term dictionaries and the
/// postings file length
fn write_postings(
    dir: &dyn Directory,
    segment: &str,
    source: &dyn SegmentSource,
    field_infos: &FieldInfos,
) -> io::Result<(Vec<FieldTermsData>, u64)> {
    let name = segment_file_name(segment, POSTINGS_EXTENSION);
    let out = ChecksumOutput::create(dir.create_output(&name)?, DEFAULT_CODEC, VERSION)?;
    let mut writer = PostingsWriter::new(out);
    let mut dictionaries = Vec::new();

    for info in field_infos.iter() {
        let options = match info.index_options {
            Some(options) => options,
            None => continue,
        };
        let mut terms = match source.terms(&info.name)? {
            Some(terms) => terms,
            None => continue,
        };

        let mut dict = TermDictionaryBuilder::new(&info.name);
        let mut field_stats = FieldStats::default();
        let mut docs_with_field = RoaringBitmap::new();

        while terms.next()? {
            writer.start_term(options);
            let mut stats = TermStats::default();
            {
                let mut postings = terms.postings()?;
                while let Some(posting) = postings.next()? {
                    writer.add(&posting)?;
                    docs_with_field.insert(posting.doc);
                    stats.doc_freq += 1;
                    stats.total_term_freq += if options.has_freqs() {
                        posting.freq.max(1) as u64
                    } else {
                        1
                    };
                }
            }
            // Terms whose documents were all dropped by a merge
            if stats.doc_freq == 0 {
                writer.abandon_term();
                continue;
            }
            let meta = writer.finish_term(stats)?;
            dict.add(terms.term(), meta)?;
            field_stats.sum_doc_freq += stats.doc_freq as u64;
            field_stats.sum_total_term_freq += stats.total_term_freq;
            field_stats.term_count += 1;
        }

        if dict.is_empty() {
            continue;
        }
        field_stats.doc_count = docs_with_field.len() as u32;
        dictionaries.push(dict.finish(field_stats)?);
    }

    let length = writer.into_inner().finish()?;
    Ok((dictionaries, length))
}

fn invalid_data(e: bincode::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// An opened segment. All files are read and verified up front.
pub struct Tessera10Segment {
    name: String,
    max_doc: u32,
    field_infos: FieldInfos,
    terms: BTreeMap<String, FieldTerms>,
    postings: Bytes,
    stored: StoredFieldsReader,
    numeric: BTreeMap<String, NumericColumn>,
    binary: BTreeMap<String, BinaryColumn>,
}

impl Tessera10Segment {
    pub fn open(dir: &dyn Directory, segment: &str, max_doc: u32) -> Result<Self> {
        let corrupt = |reason: String| TesseraError::CorruptSegment {
            segment: segment.to_string(),
            reason,
        };
        let read = |extension: &str| -> Result<Bytes> {
            let name = segment_file_name(segment, extension);
            let data = dir.open_input(&name)?;
            check_file(&data, DEFAULT_CODEC, VERSION).map_err(|reason| TesseraError::CorruptSegment {
                segment: segment.to_string(),
                reason: format!("{}: {}", name, reason),
            })
        };

        let field_infos: FieldInfos = bincode::deserialize(&read(FIELD_INFOS_EXTENSION)?)
            .map_err(|e| corrupt(format!("field infos: {}", e)))?;

        let postings = read(POSTINGS_EXTENSION)?;
        let dictionaries: Vec<FieldTermsData> = bincode::deserialize(&read(TERMS_EXTENSION)?)
            .map_err(|e| corrupt(format!("term dictionary: {}", e)))?;
        let mut terms = BTreeMap::new();
        for data in dictionaries {
            let options = field_infos
                .get(&data.field)
                .and_then(|info| info.index_options)
                .ok_or_else(|| corrupt(format!("terms for unindexed field {}", data.field)))?;
            let field = data.field.clone();
            let dict = FieldTerms::new(data, options).map_err(|e| corrupt(e.to_string()))?;
            terms.insert(field, dict);
        }

        let stored =
            StoredFieldsReader::open(read(STORED_EXTENSION)?).map_err(|e| corrupt(e.to_string()))?;
        if stored.len() != max_doc as usize {
            return Err(corrupt(format!(
                "stored fields hold {} docs, expected {}",
                stored.len(),
                max_doc
            )));
        }

        let columns: Vec<DocValuesEntry> = bincode::deserialize(&read(DOC_VALUES_EXTENSION)?)
            .map_err(|e| corrupt(format!("doc values: {}", e)))?;
        let mut numeric = BTreeMap::new();
        let mut binary = BTreeMap::new();
        for entry in columns {
            match entry.kind {
                DocValuesType::Numeric => {
                    let column = NumericColumn::deserialize(&entry.data)
                        .map_err(|e| corrupt(format!("doc values of {}: {}", entry.field, e)))?;
                    numeric.insert(entry.field, column);
                }
                DocValuesType::Binary => {
                    let column = BinaryColumn::deserialize(&entry.data)
                        .map_err(|e| corrupt(format!("doc values of {}: {}", entry.field, e)))?;
                    binary.insert(entry.field, column);
                }
            }
        }

        Ok(Self {
            name: segment.to_string(),
            max_doc,
            field_infos,
            terms,
            postings,
            stored,
            numeric,
            binary,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl SegmentSource for Tessera10Segment {
    fn max_doc(&self) -> u32 {
        self.max_doc
    }

    fn field_infos(&self) -> &FieldInfos {
        &self.field_infos
    }

    fn terms(&self, field: &str) -> io::Result<Option<Box<dyn TermsEnum + '_>>> {
        Ok(self
            .terms
            .get(field)
            .map(|dict| Box::new(dict.terms_enum(&self.postings)) as Box<dyn TermsEnum + '_>))
    }

    fn field_stats(&self, field: &str) -> Option<FieldStats> {
        self.terms.get(field).map(FieldTerms::stats)
    }

    fn stored_document(&self, doc: u32) -> io::Result<StoredDocument> {
        self.stored.document(doc)
    }

    fn numeric_value(&self, field: &str, doc: u32) -> Option<i64> {
        self.numeric.get(field).and_then(|column| column.get(doc))
    }

    fn binary_value(&self, field: &str, doc: u32) -> Option<Vec<u8>> {
        self.binary
            .get(field)
            .and_then(|column| column.get(doc))
            .map(<[u8]>::to_vec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::RamDirectory;
    use crate::index::DocumentsBuffer;
    use crate::models::{Document, FieldOptions, FieldValue};
    use crate::config::TokenizerConfig;
    use crate::tokenizer::StandardAnalyzer;

    fn sample_buffer() -> DocumentsBuffer {
        let analyzer = Arc::new(StandardAnalyzer::new(&TokenizerConfig::default()));
        let mut buffer = DocumentsBuffer::new(analyzer);
        let texts = ["the quick brown fox", "the lazy dog", "quick quick fox"];
        for (i, text) in texts.iter().enumerate() {
            let mut doc = Document::new();
            doc.add_keyword("id", &format!("doc-{}", i))
                .add_text("body", text)
                .add_int("year", 2000 + i as i64)
                .add_stored("note", FieldValue::Text(format!("note {}", i)));
            buffer.add_document(&doc).unwrap();
        }
        buffer
    }

    fn collect_docs(source: &dyn SegmentSource, field: &str, term: &str) -> Vec<(u32, u32)> {
        let mut terms = source.terms(field).unwrap().unwrap();
        assert!(terms.seek_exact(term.as_bytes()).unwrap());
        let mut postings = terms.postings().unwrap();
        let mut out = Vec::new();
        while let Some(p) = postings.next().unwrap() {
            out.push((p.doc, p.freq));
        }
        out
    }

    #[test]
    fn test_write_and_open() {
        let dir = RamDirectory::new();
        let buffer = sample_buffer();
        let written = Tessera10Codec.write_segment(&dir, "_0", &buffer).unwrap();
        assert_eq!(written.max_doc, 3);
        assert_eq!(
            written.files,
            vec!["_0.fnm", "_0.pst", "_0.tim", "_0.fdt", "_0.dvd"]
        );
        assert_eq!(written.size_bytes, dir.size_in_bytes());

        let segment = Tessera10Codec.open_segment(&dir, "_0", 3).unwrap();
        assert_eq!(segment.max_doc(), 3);
        assert_eq!(collect_docs(&*segment, "body", "quick"), vec![(0, 1), (2, 2)]);
        assert_eq!(collect_docs(&*segment, "id", "doc-1"), vec![(1, 1)]);

        let mut terms = segment.terms("body").unwrap().unwrap();
        assert!(terms.seek_exact(b"the").unwrap());
        assert_eq!(terms.stats(), TermStats { doc_freq: 2, total_term_freq: 2 });

        let stats = segment.field_stats("body").unwrap();
        assert_eq!(stats.doc_count, 3);
        assert_eq!(stats.sum_total_term_freq, 10);

        assert_eq!(segment.numeric_value("year", 2), Some(2002));
        assert_eq!(segment.stored_document(1).unwrap().get_text("note"), Some("note 1"));
        assert!(segment.terms("note").unwrap().is_none());
    }

    #[test]
    fn test_detects_corruption() {
        let dir = RamDirectory::new();
        Tessera10Codec.write_segment(&dir, "_0", &sample_buffer()).unwrap();

        let mut data = dir.open_input("_0.pst").unwrap().to_vec();
        let middle = data.len() / 2;
        data[middle] ^= 0x40;
        dir.delete_file("_0.pst").unwrap();
        crate::directory::write_file(&dir, "_0.pst", &data).unwrap();

        match Tessera10Codec.open_segment(&dir, "_0", 3) {
            Err(TesseraError::CorruptSegment { segment, reason }) => {
                assert_eq!(segment, "_0");
                assert!(reason.contains("_0.pst"), "{}", reason);
            }
            Err(other) => panic!("expected CorruptSegment, got {:?}", other),
            Ok(_) => panic!("corruption went unnoticed"),
        }
    }

    #[test]
    fn test_max_doc_mismatch() {
        let dir = RamDirectory::new();
        Tessera10Codec.write_segment(&dir, "_0", &sample_buffer()).unwrap();
        assert!(matches!(
            Tessera10Codec.open_segment(&dir, "_0", 4),
            Err(TesseraError::CorruptSegment { .. })
        ));
    }

    #[test]
    fn test_docs_only_field_counts_one_per_doc() {
        let analyzer = Arc::new(StandardAnalyzer::new(&TokenizerConfig::default()));
        let mut buffer = DocumentsBuffer::new(analyzer);
        let options = FieldOptions::text().with_index_options(Some(crate::models::IndexOptions::Docs));
        let mut doc = Document::new();
        doc.add(crate::models::Field::new(
            "tags",
            FieldValue::Text("red red red".to_string()),
            options,
        ));
        buffer.add_document(&doc).unwrap();

        let dir = RamDirectory::new();
        Tessera10Codec.write_segment(&dir, "_1", &buffer).unwrap();
        let segment = Tessera10Codec.open_segment(&dir, "_1", 1).unwrap();
        assert_eq!(collect_docs(&*segment, "tags", "red"), vec![(0, 1)]);
        let stats = segment.field_stats("tags").unwrap();
        assert_eq!(stats.sum_total_term_freq, 1);
    }
}
