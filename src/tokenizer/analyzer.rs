use rust_stemmers::{Algorithm, Stemmer};
use std::collections::HashSet;
use std::fmt;
use stop_words::{get, LANGUAGE};
use tracing::warn;
use unicode_segmentation::UnicodeSegmentation;

use crate::config::TokenizerConfig;

/// One analyzed token of a field value
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    /// Term bytes as they go into the term dictionary
    pub term: Vec<u8>,
    /// Distance from the previous emitted token (1 for adjacent words)
    pub position_increment: u32,
    /// Byte offset of the token start in the original text
    pub start_offset: u32,
    /// Byte offset one past the token end in the original text
    pub end_offset: u32,
}

/// Produces the term stream for a text field.
///
/// Calling `analyze` twice on the same input yields the same tokens, so
/// the stream is restartable.
pub trait Analyzer: Send + Sync + fmt::Debug {
    fn analyze(&self, field: &str, text: &str) -> Vec<Token>;
}

/// Unicode word segmentation with optional lowercasing, stop word removal
/// and stemming.
pub struct StandardAnalyzer {
    config: TokenizerConfig,
    stemmer: Option<Stemmer>,
    stopwords: HashSet<String>,
}

impl StandardAnalyzer {
    /// Create a new analyzer from configuration
    pub fn new(config: &TokenizerConfig) -> Self {
        let (algorithm, language) = resolve_language(&config.language);

        let stemmer = if config.stem {
            Some(Stemmer::create(algorithm))
        } else {
            None
        };

        let stopwords = if config.remove_stopwords {
            get(language).into_iter().map(|s| s.to_lowercase()).collect()
        } else {
            HashSet::new()
        };

        Self {
            config: config.clone(),
            stemmer,
            stopwords,
        }
    }

    pub fn config(&self) -> &TokenizerConfig {
        &self.config
    }
}

impl Default for StandardAnalyzer {
    fn default() -> Self {
        Self::new(&TokenizerConfig::default())
    }
}

impl fmt::Debug for StandardAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StandardAnalyzer")
            .field("config", &self.config)
            .field("stopwords", &self.stopwords.len())
            .finish()
    }
}

impl Analyzer for StandardAnalyzer {
    /// Filtered words (too short, too long, stop words) still advance the
    /// position, so the next emitted token carries a larger increment.
    fn analyze(&self, _field: &str, text: &str) -> Vec<Token> {
        let mut tokens = Vec::new();
        let mut pending_increment = 0u32;

        for (start, word) in text.unicode_word_indices() {
            pending_increment += 1;

            let mut token = if self.config.lowercase {
                word.to_lowercase()
            } else {
                word.to_string()
            };

            let len = token.chars().count();
            if len < self.config.min_token_length || len > self.config.max_token_length {
                continue;
            }

            if self.stopwords.contains(&token) {
                continue;
            }

            if let Some(stemmer) = &self.stemmer {
                token = stemmer.stem(&token).to_string();
            }

            tokens.push(Token {
                term: token.into_bytes(),
                position_increment: pending_increment,
                start_offset: start as u32,
                end_offset: (start + word.len()) as u32,
            });
            pending_increment = 0;
        }

        tokens
    }
}

fn resolve_language(language: &str) -> (Algorithm, LANGUAGE) {
    match language.to_lowercase().as_str() {
        "english" | "en" => (Algorithm::English, LANGUAGE::English),
        "french" | "fr" => (Algorithm::French, LANGUAGE::French),
        "german" | "de" => (Algorithm::German, LANGUAGE::German),
        "spanish" | "es" => (Algorithm::Spanish, LANGUAGE::Spanish),
        "italian" | "it" => (Algorithm::Italian, LANGUAGE::Italian),
        "portuguese" | "pt" => (Algorithm::Portuguese, LANGUAGE::Portuguese),
        "russian" | "ru" => (Algorithm::Russian, LANGUAGE::Russian),
        other => {
            warn!(language = other, "Unknown analyzer language, using english");
            (Algorithm::English, LANGUAGE::English)
        }
    }
}
