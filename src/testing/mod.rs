//! Testing infrastructure for correctness verification
//!
//! This module provides:
//! - [`FaultyDirectory`], injecting I/O failures into any directory
//! - [`StubLeaf`], a data-free leaf for doc id arithmetic at large sizes
//! - seeded random documents and indexes
//! - an invariant checking framework over [`DirectoryReader`](crate::index::DirectoryReader)
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use tessera::testing::prelude::*;
//!
//! let live = build_random_index(&writer, &mut StdRng::seed_from_u64(7), &RandomIndexOptions::default())?;
//! writer.commit()?;
//!
//! let reader = DirectoryReader::open(dir)?;
//! let violations = check_all_invariants(&reader, &default_invariants());
//! assert!(violations.is_empty());
//! ```
//!
//! # Invariants
//!
//! - **DocBasesMonotonic**: leaves tile the global doc id space in order
//! - **NumDocsWithinMaxDoc**: live docs plus deletions equal max_doc
//! - **StatsMatchRecount**: term and field stats equal a postings recount
//! - **CommitFilesExist**: nothing the commit references is missing

pub mod faulty;
pub mod invariants;
pub mod random;
pub mod stub;

pub use faulty::FaultyDirectory;
pub use invariants::{
    check_all_invariants, default_invariants, CommitFilesExist, DocBasesMonotonic, Invariant,
    NumDocsWithinMaxDoc, StatsMatchRecount, Violation,
};
pub use random::{build_random_index, random_document, RandomIndexOptions, ID_FIELD, WORDS};
pub use stub::StubLeaf;

/// Prelude for easy imports
pub mod prelude {
    pub use super::faulty::FaultyDirectory;
    pub use super::invariants::{check_all_invariants, default_invariants, Invariant, Violation};
    pub use super::random::{build_random_index, random_document, RandomIndexOptions};
}
