//! Semantic relevance index over capability descriptions.
//! Default implementation: cosine similarity over TF-IDF embeddings.
//! Queries never touch the vocabulary, so a built index is read-only.

use std::collections::{HashMap, HashSet};

use crate::error::DexResult;

/// A registry key with its similarity to the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredKey {
    pub key: usize,
    pub score: f32,
}

/// Index answering "which documents are closest to this text".
///
/// Implementations backed by an external embedding service can fail; callers
/// treat an error as "no relevant capabilities".
pub trait SemanticIndex: Send + Sync {
    /// Add a document under `key`. Called only during startup.
    fn insert(&mut self, key: usize, text: &str);

    /// Up to `k` keys with positive similarity, most similar first.
    fn query(&self, text: &str, k: usize) -> DexResult<Vec<ScoredKey>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── Tokenizer ───────────────────────────────────────────────────────────────

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "get", "i", "in", "is", "it",
    "me", "my", "of", "on", "or", "the", "this", "to", "use", "user", "when", "with", "you",
    "your", "wants",
];

/// Split on anything that is not alphanumeric (snake_case names split on `_`),
/// lowercase, drop stop words and fold simple plurals.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .filter(|w| w.len() > 1 && !STOP_WORDS.contains(&w.as_str()))
        .map(fold_plural)
        .collect()
}

fn fold_plural(word: String) -> String {
    if word.len() > 3 && word.ends_with('s') && !word.ends_with("ss") {
        word[..word.len() - 1].to_string()
    } else {
        word
    }
}

// ─── Embedding ───────────────────────────────────────────────────────────────

/// An embedding vector
#[derive(Debug, Clone)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub magnitude: f32,
}

impl Embedding {
    pub fn new(vector: Vec<f32>) -> Self {
        let magnitude = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        Self { vector, magnitude }
    }

    /// Cosine similarity between two embeddings
    pub fn cosine_similarity(&self, other: &Embedding) -> f32 {
        if self.magnitude == 0.0 || other.magnitude == 0.0 {
            return 0.0;
        }
        let dot: f32 = self
            .vector
            .iter()
            .zip(other.vector.iter())
            .map(|(a, b)| a * b)
            .sum();
        dot / (self.magnitude * other.magnitude)
    }
}

// ─── TF-IDF Index ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct IndexedDoc {
    key: usize,
    frequencies: HashMap<u32, usize>,
    token_count: usize,
    embedding: Embedding,
}

/// In-memory TF-IDF index.
pub struct TfIdfIndex {
    vocab: HashMap<String, u32>,
    doc_freq: HashMap<u32, f32>,
    docs: Vec<IndexedDoc>,
}

impl TfIdfIndex {
    pub fn new() -> Self {
        Self {
            vocab: HashMap::new(),
            doc_freq: HashMap::new(),
            docs: Vec::new(),
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    /// Term frequencies for already-known tokens only.
    fn frequencies(&self, tokens: &[String]) -> HashMap<u32, usize> {
        let mut freqs = HashMap::new();
        for token in tokens {
            if let Some(&id) = self.vocab.get(token) {
                *freqs.entry(id).or_insert(0) += 1;
            }
        }
        freqs
    }

    fn embed(&self, frequencies: &HashMap<u32, usize>, token_count: usize) -> Embedding {
        let vocab_size = self.vocab.len().max(1);
        let mut tfidf = vec![0.0f32; vocab_size];
        if token_count == 0 {
            return Embedding::new(tfidf);
        }

        let total_docs = self.docs.len().max(1) as f32;
        for (&id, &count) in frequencies {
            let tf = count as f32 / token_count as f32;
            let df = self.doc_freq.get(&id).copied().unwrap_or(1.0);
            let idf = (total_docs / df).ln() + 1.0;
            if let Some(slot) = tfidf.get_mut(id as usize) {
                *slot = tf * idf;
            }
        }
        Embedding::new(tfidf)
    }

    /// Recompute all embeddings with current IDF values
    fn reindex(&mut self) {
        let embeddings: Vec<Embedding> = self
            .docs
            .iter()
            .map(|d| self.embed(&d.frequencies, d.token_count))
            .collect();
        for (doc, embedding) in self.docs.iter_mut().zip(embeddings) {
            doc.embedding = embedding;
        }
    }
}

impl Default for TfIdfIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl SemanticIndex for TfIdfIndex {
    fn insert(&mut self, key: usize, text: &str) {
        let tokens = tokenize(text);
        for token in &tokens {
            if !self.vocab.contains_key(token) {
                let id = self.vocab.len() as u32;
                self.vocab.insert(token.clone(), id);
            }
        }

        let frequencies = self.frequencies(&tokens);
        let unique: HashSet<u32> = frequencies.keys().copied().collect();
        for id in unique {
            *self.doc_freq.entry(id).or_insert(0.0) += 1.0;
        }

        self.docs.push(IndexedDoc {
            key,
            frequencies,
            token_count: tokens.len(),
            embedding: Embedding::new(Vec::new()),
        });
        // Vocabulary and IDF both moved; every vector has to be rebuilt.
        self.reindex();
    }

    fn query(&self, text: &str, k: usize) -> DexResult<Vec<ScoredKey>> {
        let tokens = tokenize(text);
        let query_embedding = self.embed(&self.frequencies(&tokens), tokens.len());

        let mut scored: Vec<ScoredKey> = self
            .docs
            .iter()
            .map(|doc| ScoredKey {
                key: doc.key,
                score: query_embedding.cosine_similarity(&doc.embedding),
            })
            .filter(|s| s.score > 0.0)
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.key.cmp(&b.key))
        });
        scored.truncate(k);
        Ok(scored)
    }

    fn len(&self) -> usize {
        self.docs.len()
    }
}
