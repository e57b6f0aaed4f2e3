//! Seeded random documents and indexes

use std::collections::BTreeSet;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::Result;
use crate::index::IndexWriter;
use crate::models::{Document, Term};

/// Vocabulary of random documents
pub const WORDS: &[&str] = &[
    "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel", "india", "juliet",
    "kilo", "lima", "mike", "november", "oscar", "papa", "quebec", "romeo", "sierra", "tango",
    "uniform", "victor", "whiskey", "xray", "yankee", "zulu", "amber", "basalt", "cobalt",
    "dune", "ember", "fjord", "granite", "harbor", "island", "jasper",
];

/// Field holding the unique id of random documents
pub const ID_FIELD: &str = "id";

/// A document with keyword `id`, a `body` of 1 to 12 random words,
/// a numeric `n` and a `tag` keyword
pub fn random_document(rng: &mut impl Rng, id: u64) -> Document {
    let words = rng.gen_range(1..=12);
    let body: Vec<&str> = (0..words)
        .filter_map(|_| WORDS.choose(rng).copied())
        .collect();
    let mut doc = Document::with_capacity(4);
    doc.add_keyword(ID_FIELD, &id.to_string());
    doc.add_text("body", &body.join(" "));
    doc.add_int("n", id as i64);
    doc.add_keyword("tag", if id % 3 == 0 { "even3" } else { "other" });
    doc
}

/// Knobs for [`build_random_index`]
#[derive(Clone, Debug)]
pub struct RandomIndexOptions {
    pub docs: u64,
    /// Chance, after each add, of deleting a random live document
    pub delete_probability: f64,
    /// Chance, after each add, of replacing a random live document
    pub update_probability: f64,
    /// Chance, after each add, of an explicit flush
    pub flush_probability: f64,
}

impl Default for RandomIndexOptions {
    fn default() -> Self {
        Self {
            docs: 500,
            delete_probability: 0.1,
            update_probability: 0.05,
            flush_probability: 0.02,
        }
    }
}

/// Feed random documents, deletes, updates and flushes to `writer`.
/// Returns the ids that are expected to be live afterwards.
pub fn build_random_index(
    writer: &IndexWriter,
    rng: &mut impl Rng,
    options: &RandomIndexOptions,
) -> Result<BTreeSet<u64>> {
    let mut live = BTreeSet::new();
    let mut ids: Vec<u64> = Vec::new();

    for id in 0..options.docs {
        writer.add_document(&random_document(rng, id))?;
        live.insert(id);
        ids.push(id);

        if rng.gen_bool(options.delete_probability) {
            if let Some(&victim) = ids.choose(rng) {
                writer.delete_documents(Term::text(ID_FIELD, &victim.to_string()))?;
                live.remove(&victim);
            }
        }
        if rng.gen_bool(options.update_probability) {
            if let Some(&target) = ids.choose(rng) {
                writer.update_document(
                    Term::text(ID_FIELD, &target.to_string()),
                    &random_document(rng, target),
                )?;
                live.insert(target);
            }
        }
        if rng.gen_bool(options.flush_probability) {
            writer.flush()?;
        }
    }
    Ok(live)
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn test_random_document_is_reproducible() {
        let a = random_document(&mut StdRng::seed_from_u64(7), 42);
        let b = random_document(&mut StdRng::seed_from_u64(7), 42);
        assert_eq!(a.fields().len(), 4);
        assert_eq!(
            a.get("body").and_then(|f| f.value.as_text()),
            b.get("body").and_then(|f| f.value.as_text())
        );
    }
}
