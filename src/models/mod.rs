pub mod document;
pub mod term;

pub use document::{
    decode_sortable_i64, encode_sortable_i64, DocValuesType, Document, Field, FieldOptions,
    FieldValue, IndexOptions, StoredDocument, StoredField,
};
pub use term::Term;
