use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tessera::index::{DirectoryReader, IndexWriter, TieredMergePolicy, TieredMergePolicyConfig};
use tessera::{
    check_index, Directory, Document, FieldValue, FsDirectory, IndexWriterConfig,
    MergeSchedulerConfig, OpenMode, Term, TokenizerConfig,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "tessera")]
#[command(about = "Inspect and maintain segment-structured indexes", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Verify every segment of the latest commit
    Check {
        /// Index directory
        path: PathBuf,
    },

    /// Print the commits and segments of an index
    Info {
        /// Index directory
        path: PathBuf,
    },

    /// Merge an index down to at most N segments and commit
    ForceMerge {
        /// Index directory
        path: PathBuf,

        /// Maximum number of segments to leave
        #[arg(long, env = "TESSERA_MAX_SEGMENTS", default_value = "1")]
        max_segments: usize,

        /// JSON file with tiered merge policy settings
        #[arg(long, env = "TESSERA_POLICY_CONFIG")]
        policy_config: Option<PathBuf>,
    },

    /// Copy the live documents of other indexes into an index and commit
    AddIndexes {
        /// Index directory
        path: PathBuf,

        /// Indexes to copy from; no writer may be open on them
        #[arg(required = true)]
        sources: Vec<PathBuf>,
    },

    /// Add documents from a JSON lines file, one object per line
    Index {
        /// Index directory
        path: PathBuf,

        /// JSON lines input
        input: PathBuf,

        /// Fields indexed as a single untokenized term
        #[arg(long, value_delimiter = ',')]
        keyword: Vec<String>,

        /// Field whose value identifies a document; re-indexing replaces it
        #[arg(long)]
        id_field: Option<String>,

        /// Buffered documents per flushed segment
        #[arg(long, env = "TESSERA_MAX_BUFFERED_DOCS", default_value = "10000")]
        max_buffered_docs: usize,

        /// Remove English stop words
        #[arg(long)]
        stopwords: bool,

        /// Stem English text
        #[arg(long)]
        stem: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    info!("Tessera v{}", tessera::VERSION);

    match args.command {
        Command::Check { path } => check(&path),
        Command::Info { path } => print_info(&path),
        Command::ForceMerge {
            path,
            max_segments,
            policy_config,
        } => force_merge(&path, max_segments, policy_config.as_deref()),
        Command::AddIndexes { path, sources } => add_indexes(&path, &sources),
        Command::Index {
            path,
            input,
            keyword,
            id_field,
            max_buffered_docs,
            stopwords,
            stem,
        } => {
            let tokenizer = TokenizerConfig {
                remove_stopwords: stopwords,
                stem,
                ..Default::default()
            };
            let config = IndexWriterConfig::new()
                .with_open_mode(OpenMode::CreateOrAppend)
                .with_max_buffered_docs(max_buffered_docs)
                .with_tokenizer(&tokenizer);
            index_file(&path, &input, &keyword, id_field.as_deref(), config)
        }
    }
}

fn open_dir(path: &Path) -> Result<Arc<dyn Directory>> {
    let dir = FsDirectory::open(path)
        .with_context(|| format!("cannot open index directory {}", path.display()))?;
    Ok(Arc::new(dir))
}

fn check(path: &Path) -> Result<()> {
    let dir = open_dir(path)?;
    let report = check_index(dir.as_ref()).context("cannot read the latest commit")?;
    println!("{}", report);
    if !report.is_clean() {
        bail!("index at {} is broken", path.display());
    }
    Ok(())
}

fn print_info(path: &Path) -> Result<()> {
    let dir = open_dir(path)?;
    let commits = DirectoryReader::list_commits(dir.as_ref())?;
    if commits.is_empty() {
        bail!("no index found at {}", path.display());
    }
    for commit in &commits {
        println!(
            "{}: {} segment(s), {} file(s)",
            commit.segments_file,
            commit.segment_count,
            commit.files.len()
        );
        for (key, value) in &commit.user_data {
            println!("  {} = {}", key, value);
        }
    }

    let reader = DirectoryReader::open(dir)?;
    println!(
        "latest generation {}: maxDoc={} numDocs={}",
        reader.generation(),
        reader.max_doc(),
        reader.num_docs()
    );
    for info in reader.segment_infos().iter() {
        println!(
            "  {} maxDoc={} numDocs={} delGen={} dvGen={} size={}B source={}",
            info.name(),
            info.max_doc(),
            info.num_docs(),
            info.del_gen,
            info.dv_gen,
            info.size_bytes(),
            info.info.source().unwrap_or("unknown")
        );
    }
    Ok(())
}

fn force_merge(path: &Path, max_segments: usize, policy_config: Option<&Path>) -> Result<()> {
    let policy = match policy_config {
        Some(file) => {
            let text = std::fs::read_to_string(file)
                .with_context(|| format!("cannot read {}", file.display()))?;
            let config: TieredMergePolicyConfig = serde_json::from_str(&text)
                .with_context(|| format!("invalid merge policy settings in {}", file.display()))?;
            TieredMergePolicy::new(config)
        }
        None => TieredMergePolicy::default(),
    };

    let config = IndexWriterConfig::new()
        .with_open_mode(OpenMode::Append)
        .with_merge_policy(Arc::new(policy))
        .with_merge_scheduler(MergeSchedulerConfig::concurrent());
    let writer = IndexWriter::open(open_dir(path)?, config)?;
    let before = writer.segment_count();
    writer.force_merge(max_segments)?;
    let after = writer.segment_count();
    writer.close()?;

    info!(before, after, "Force merge finished");
    println!("{} segment(s) merged into {}", before, after);
    Ok(())
}

fn add_indexes(path: &Path, sources: &[PathBuf]) -> Result<()> {
    let dirs = sources
        .iter()
        .map(|source| open_dir(source))
        .collect::<Result<Vec<_>>>()?;
    let config = IndexWriterConfig::new().with_open_mode(OpenMode::CreateOrAppend);
    let writer = IndexWriter::open(open_dir(path)?, config)?;
    let before = writer.num_docs();
    writer
        .add_indexes(&dirs)
        .with_context(|| format!("cannot add indexes to {}", path.display()))?;
    writer.commit()?;
    let after = writer.num_docs();
    writer.close()?;

    info!(sources = sources.len(), added = after - before, "Add indexes finished");
    println!("added {} document(s) from {} index(es)", after - before, sources.len());
    Ok(())
}

fn index_file(
    path: &Path,
    input: &Path,
    keywords: &[String],
    id_field: Option<&str>,
    config: IndexWriterConfig,
) -> Result<()> {
    let file = File::open(input).with_context(|| format!("cannot open {}", input.display()))?;
    let writer = IndexWriter::open(open_dir(path)?, config)?;

    let mut added = 0u64;
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("cannot read {}", input.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(&line)
            .with_context(|| format!("line {}: invalid JSON", number + 1))?;
        let doc = match to_document(&value, keywords, id_field) {
            Some(doc) => doc,
            None => {
                warn!(line = number + 1, "Skipping line that is not a JSON object");
                continue;
            }
        };

        let id = id_field.and_then(|field| doc.get(field)).map(|f| f.value.clone());
        match (id_field, id) {
            (Some(field), Some(FieldValue::Text(id))) => {
                writer.update_document(Term::text(field, &id), &doc)?
            }
            (Some(field), Some(FieldValue::Int(id))) => {
                writer.update_document(Term::int(field, id), &doc)?
            }
            _ => writer.add_document(&doc)?,
        }
        added += 1;
    }

    writer.commit()?;
    let docs = writer.num_docs();
    writer.close()?;
    info!(added, docs, "Indexing finished");
    println!("indexed {} document(s), {} in index", added, docs);
    Ok(())
}

/// Strings become text fields (keywords for `keywords` and the id field),
/// integers numeric fields; other values are stored as JSON
fn to_document(value: &Value, keywords: &[String], id_field: Option<&str>) -> Option<Document> {
    let object = value.as_object()?;
    let mut doc = Document::with_capacity(object.len());
    for (name, value) in object {
        match value {
            Value::String(text) if keywords.contains(name) || id_field == Some(name.as_str()) => {
                doc.add_keyword(name, text);
            }
            Value::String(text) => {
                doc.add_text(name, text);
            }
            Value::Number(n) if n.is_i64() => {
                doc.add_int(name, n.as_i64().unwrap_or_default());
            }
            Value::Null => {}
            other => {
                doc.add_stored(name, FieldValue::Text(other.to_string()));
            }
        }
    }
    Some(doc)
}
