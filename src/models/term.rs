use serde::{Deserialize, Serialize};
use std::fmt;

use super::document::encode_sortable_i64;

/// A (field, term bytes) pair.
///
/// Ordering compares the field name first, then the term bytes
/// lexicographically, which is the order terms are enumerated in.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Term {
    pub field: String,
    pub bytes: Vec<u8>,
}

impl Term {
    pub fn new(field: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            field: field.into(),
            bytes: bytes.into(),
        }
    }

    /// Term for a textual value
    pub fn text(field: &str, text: &str) -> Self {
        Self::new(field, text.as_bytes().to_vec())
    }

    /// Term for an integer indexed by a numeric field
    pub fn int(field: &str, value: i64) -> Self {
        Self::new(field, encode_sortable_i64(value).to_vec())
    }

    /// Term bytes as UTF-8, if they are valid
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Some(s) => write!(f, "{}:{}", self.field, s),
            None => write!(f, "{}:{:?}", self.field, self.bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_ordering() {
        let mut terms = vec![
            Term::text("title", "alpha"),
            Term::text("body", "zebra"),
            Term::text("body", "apple"),
            Term::text("body", "app"),
        ];
        terms.sort();

        let rendered: Vec<_> = terms.iter().map(|t| t.to_string()).collect();
        assert_eq!(rendered, vec!["body:app", "body:apple", "body:zebra", "title:alpha"]);
    }

    #[test]
    fn test_int_terms_sort_numerically() {
        assert!(Term::int("n", -5) < Term::int("n", 3));
        assert!(Term::int("n", 3) < Term::int("n", 300));
    }
}
