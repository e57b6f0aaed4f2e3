use serde::{Deserialize, Serialize};

/// How much of a field's postings is recorded in the inverted index.
///
/// Variants are ordered by how much they record. When two occurrences of
/// a field disagree, the lesser option wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IndexOptions {
    Docs,
    DocsAndFreqs,
    DocsAndFreqsAndPositions,
    DocsAndFreqsAndPositionsAndOffsets,
}

impl IndexOptions {
    pub fn has_freqs(self) -> bool {
        self >= IndexOptions::DocsAndFreqs
    }

    pub fn has_positions(self) -> bool {
        self >= IndexOptions::DocsAndFreqsAndPositions
    }

    pub fn has_offsets(self) -> bool {
        self == IndexOptions::DocsAndFreqsAndPositionsAndOffsets
    }
}

/// Per-document value column type
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocValuesType {
    Numeric,
    Binary,
}

/// Field value as provided by the caller
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Text(String),
    Int(i64),
    Bytes(Vec<u8>),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Raw bytes used when the value is indexed as a single term or
    /// stored as a binary doc value.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            FieldValue::Text(s) => s.as_bytes().to_vec(),
            FieldValue::Int(v) => encode_sortable_i64(*v).to_vec(),
            FieldValue::Bytes(b) => b.clone(),
        }
    }
}

/// Encode an i64 so that byte order matches numeric order
pub fn encode_sortable_i64(value: i64) -> [u8; 8] {
    ((value as u64) ^ (1 << 63)).to_be_bytes()
}

/// Inverse of [`encode_sortable_i64`]
pub fn decode_sortable_i64(bytes: [u8; 8]) -> i64 {
    (u64::from_be_bytes(bytes) ^ (1 << 63)) as i64
}

/// Declares what the index does with a field
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldOptions {
    pub stored: bool,
    pub index_options: Option<IndexOptions>,
    pub tokenized: bool,
    pub doc_values: Option<DocValuesType>,
}

impl FieldOptions {
    /// Analyzed full text with positions and offsets, stored
    pub fn text() -> Self {
        Self {
            stored: true,
            index_options: Some(IndexOptions::DocsAndFreqsAndPositionsAndOffsets),
            tokenized: true,
            doc_values: None,
        }
    }

    /// Single untokenized term, stored; suitable for primary keys
    pub fn keyword() -> Self {
        Self {
            stored: true,
            index_options: Some(IndexOptions::DocsAndFreqs),
            tokenized: false,
            doc_values: None,
        }
    }

    /// Integer indexed as a sortable term with a numeric doc value
    pub fn numeric() -> Self {
        Self {
            stored: true,
            index_options: Some(IndexOptions::Docs),
            tokenized: false,
            doc_values: Some(DocValuesType::Numeric),
        }
    }

    pub fn stored_only() -> Self {
        Self {
            stored: true,
            index_options: None,
            tokenized: false,
            doc_values: None,
        }
    }

    pub fn binary_doc_values() -> Self {
        Self {
            stored: false,
            index_options: None,
            tokenized: false,
            doc_values: Some(DocValuesType::Binary),
        }
    }

    pub fn with_stored(mut self, stored: bool) -> Self {
        self.stored = stored;
        self
    }

    pub fn with_index_options(mut self, options: Option<IndexOptions>) -> Self {
        self.index_options = options;
        self
    }

    pub fn is_indexed(&self) -> bool {
        self.index_options.is_some()
    }
}

/// One (name, value, options) tuple of a document
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub value: FieldValue,
    pub options: FieldOptions,
}

impl Field {
    pub fn new(name: impl Into<String>, value: FieldValue, options: FieldOptions) -> Self {
        Self {
            name: name.into(),
            value,
            options,
        }
    }
}

/// Document to be indexed: an ordered list of fields
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    fields: Vec<Field>,
}

impl Document {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: Vec::with_capacity(capacity),
        }
    }

    pub fn add(&mut self, field: Field) -> &mut Self {
        self.fields.push(field);
        self
    }

    pub fn add_text(&mut self, name: &str, text: &str) -> &mut Self {
        self.add(Field::new(name, FieldValue::Text(text.to_string()), FieldOptions::text()))
    }

    pub fn add_keyword(&mut self, name: &str, value: &str) -> &mut Self {
        self.add(Field::new(name, FieldValue::Text(value.to_string()), FieldOptions::keyword()))
    }

    pub fn add_int(&mut self, name: &str, value: i64) -> &mut Self {
        self.add(Field::new(name, FieldValue::Int(value), FieldOptions::numeric()))
    }

    pub fn add_stored(&mut self, name: &str, value: FieldValue) -> &mut Self {
        self.add(Field::new(name, value, FieldOptions::stored_only()))
    }

    pub fn add_binary(&mut self, name: &str, value: Vec<u8>) -> &mut Self {
        self.add(Field::new(name, FieldValue::Bytes(value), FieldOptions::binary_doc_values()))
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// First field with the given name
    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Field as read back from the stored-fields store
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredField {
    pub name: String,
    pub value: FieldValue,
}

/// Stored fields of one document, in indexing order
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub fields: Vec<StoredField>,
}

impl StoredDocument {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    pub fn push(&mut self, name: &str, value: FieldValue) {
        self.fields.push(StoredField {
            name: name.to_string(),
            value,
        });
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.value)
    }

    pub fn get_text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(FieldValue::as_text)
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(FieldValue::as_int)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
