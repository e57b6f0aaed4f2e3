//! Text analysis
//!
//! The indexer only depends on the [`Analyzer`] trait: a restartable
//! sequence of (term bytes, position increment, offsets) per field value.

mod analyzer;

pub use analyzer::{Analyzer, StandardAnalyzer, Token};
