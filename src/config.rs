use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::codec::DEFAULT_CODEC;
use crate::index::{
    IndexDeletionPolicy, KeepOnlyLastCommit, MergePolicy, TieredMergePolicy,
};
use crate::tokenizer::{Analyzer, StandardAnalyzer};

/// Tokenizer configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenizerConfig {
    pub lowercase: bool,
    pub remove_stopwords: bool,
    pub stem: bool,
    pub min_token_length: usize,
    pub max_token_length: usize,
    pub language: String,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            lowercase: true,
            remove_stopwords: false,
            stem: false,
            min_token_length: 1,
            max_token_length: 255,
            language: "english".to_string(),
        }
    }
}

/// Flush triggers for the in-memory document buffer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Flush once this many documents are buffered
    pub max_buffered_docs: usize,
    /// Flush once the estimated buffer size exceeds this (bytes)
    pub ram_buffer_bytes: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_buffered_docs: 10_000,
            // 16MB
            ram_buffer_bytes: 16 * 1024 * 1024,
        }
    }
}

/// What to do with an existing index when a writer opens
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenMode {
    /// Start a new empty index; existing commits are superseded
    Create,
    /// Open the latest commit; fail if there is none
    Append,
    /// Append if an index exists, create otherwise
    CreateOrAppend,
}

/// Where merges run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeSchedulerConfig {
    /// Merges run on the thread that triggered them
    Serial,
    /// Merges run on a pool of background threads
    Concurrent { max_threads: usize },
}

impl MergeSchedulerConfig {
    pub fn concurrent() -> Self {
        MergeSchedulerConfig::Concurrent {
            max_threads: (num_cpus::get() / 2).clamp(1, 4),
        }
    }

    pub fn max_threads(&self) -> usize {
        match self {
            MergeSchedulerConfig::Serial => 1,
            MergeSchedulerConfig::Concurrent { max_threads } => (*max_threads).max(1),
        }
    }
}

impl Default for MergeSchedulerConfig {
    fn default() -> Self {
        Self::concurrent()
    }
}

/// Index writer configuration
#[derive(Clone)]
pub struct IndexWriterConfig {
    pub open_mode: OpenMode,
    pub buffer: BufferConfig,
    pub merge_policy: Arc<dyn MergePolicy>,
    pub merge_scheduler: MergeSchedulerConfig,
    pub deletion_policy: Arc<dyn IndexDeletionPolicy>,
    pub codec: String,
    pub analyzer: Arc<dyn Analyzer>,
    pub commit_on_close: bool,
}

impl Default for IndexWriterConfig {
    fn default() -> Self {
        Self {
            open_mode: OpenMode::CreateOrAppend,
            buffer: BufferConfig::default(),
            merge_policy: Arc::new(TieredMergePolicy::default()),
            merge_scheduler: MergeSchedulerConfig::default(),
            deletion_policy: Arc::new(KeepOnlyLastCommit),
            codec: DEFAULT_CODEC.to_string(),
            analyzer: Arc::new(StandardAnalyzer::default()),
            commit_on_close: true,
        }
    }
}

impl IndexWriterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_open_mode(mut self, mode: OpenMode) -> Self {
        self.open_mode = mode;
        self
    }

    /// Set the buffered document count flush trigger
    pub fn with_max_buffered_docs(mut self, docs: usize) -> Self {
        self.buffer.max_buffered_docs = docs.max(1);
        self
    }

    /// Set the RAM flush trigger in bytes
    pub fn with_ram_buffer_bytes(mut self, bytes: usize) -> Self {
        self.buffer.ram_buffer_bytes = bytes;
        self
    }

    pub fn with_merge_policy(mut self, policy: Arc<dyn MergePolicy>) -> Self {
        self.merge_policy = policy;
        self
    }

    pub fn with_merge_scheduler(mut self, scheduler: MergeSchedulerConfig) -> Self {
        self.merge_scheduler = scheduler;
        self
    }

    pub fn with_deletion_policy(mut self, policy: Arc<dyn IndexDeletionPolicy>) -> Self {
        self.deletion_policy = policy;
        self
    }

    pub fn with_codec(mut self, codec: &str) -> Self {
        self.codec = codec.to_string();
        self
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    /// Build a [`StandardAnalyzer`] from tokenizer settings
    pub fn with_tokenizer(mut self, config: &TokenizerConfig) -> Self {
        self.analyzer = Arc::new(StandardAnalyzer::new(config));
        self
    }

    pub fn with_commit_on_close(mut self, commit: bool) -> Self {
        self.commit_on_close = commit;
        self
    }
}

impl fmt::Debug for IndexWriterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexWriterConfig")
            .field("open_mode", &self.open_mode)
            .field("buffer", &self.buffer)
            .field("merge_policy", &self.merge_policy)
            .field("merge_scheduler", &self.merge_scheduler)
            .field("deletion_policy", &self.deletion_policy)
            .field("codec", &self.codec)
            .field("commit_on_close", &self.commit_on_close)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::NoMergePolicy;

    #[test]
    fn test_default_configs() {
        let tokenizer = TokenizerConfig::default();
        assert!(tokenizer.lowercase);
        assert!(!tokenizer.remove_stopwords);

        let buffer = BufferConfig::default();
        assert_eq!(buffer.max_buffered_docs, 10_000);

        let config = IndexWriterConfig::default();
        assert_eq!(config.open_mode, OpenMode::CreateOrAppend);
        assert_eq!(config.codec, DEFAULT_CODEC);
        assert!(config.commit_on_close);
    }

    #[test]
    fn test_writer_config_builder() {
        let config = IndexWriterConfig::new()
            .with_open_mode(OpenMode::Create)
            .with_max_buffered_docs(2)
            .with_merge_policy(Arc::new(NoMergePolicy))
            .with_merge_scheduler(MergeSchedulerConfig::Serial)
            .with_commit_on_close(false);

        assert_eq!(config.open_mode, OpenMode::Create);
        assert_eq!(config.buffer.max_buffered_docs, 2);
        assert_eq!(config.merge_scheduler.max_threads(), 1);
        assert!(!config.commit_on_close);
    }

    #[test]
    fn test_max_buffered_docs_floor() {
        let config = IndexWriterConfig::new().with_max_buffered_docs(0);
        assert_eq!(config.buffer.max_buffered_docs, 1);
    }

    #[test]
    fn test_concurrent_scheduler_threads() {
        let scheduler = MergeSchedulerConfig::Concurrent { max_threads: 0 };
        assert_eq!(scheduler.max_threads(), 1);
        assert!(MergeSchedulerConfig::concurrent().max_threads() >= 1);
    }

    #[test]
    fn test_tokenizer_config_json() {
        let json = r#"{"lowercase":false,"remove_stopwords":true,"stem":true,
            "min_token_length":2,"max_token_length":40,"language":"french"}"#;
        let config: TokenizerConfig = serde_json::from_str(json).unwrap();
        assert!(!config.lowercase);
        assert_eq!(config.language, "french");
    }
}
