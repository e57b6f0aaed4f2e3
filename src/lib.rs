pub mod codec;
pub mod config;
pub mod directory;
pub mod error;
pub mod index;
pub mod models;
pub mod testing;
pub mod tokenizer;

pub use config::{
    BufferConfig, IndexWriterConfig, MergeSchedulerConfig, OpenMode, TokenizerConfig,
};
pub use directory::{Directory, FsDirectory, RamDirectory};
pub use error::{Result, TesseraError};
pub use index::{
    check_index, DirectoryReader, IndexWriter, LogByteSizeMergePolicy, LogDocMergePolicy,
    TieredMergePolicy, WriterState, MAX_DOCS,
};
pub use models::*;
pub use tokenizer::{Analyzer, StandardAnalyzer};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
