//! In-process BM25 scoring over a small candidate pool.
//!
//! The index is rebuilt per query from the dense leg's candidates, so IDF is
//! computed over that pool and not the whole corpus.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

/// One token per CJK glyph, otherwise maximal runs of letters and digits.
static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"[\p{Han}\p{Hiragana}\p{Katakana}]|[\p{L}\p{N}&&[^\p{Han}\p{Hiragana}\p{Katakana}]]+",
    )
    .expect("valid token regex")
});

/// Lowercased Chinese/English-aware tokenization.
pub fn tokenize(text: &str) -> Vec<String> {
    TOKEN_RE
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

/// BM25 free parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bm25Params {
    pub k1: f32,
    pub b: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.5, b: 0.75 }
    }
}

struct IndexedDoc {
    term_freqs: HashMap<String, usize>,
    length: usize,
}

/// A document's position in the pool and its BM25 score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredIndex {
    pub index: usize,
    pub score: f32,
}

/// BM25 index over an ordered pool of texts.
pub struct Bm25Index {
    docs: Vec<IndexedDoc>,
    doc_freqs: HashMap<String, usize>,
    avg_len: f32,
    params: Bm25Params,
}

impl Bm25Index {
    pub fn build<'a>(texts: impl IntoIterator<Item = &'a str>, params: Bm25Params) -> Self {
        let mut docs = Vec::new();
        let mut doc_freqs: HashMap<String, usize> = HashMap::new();

        for text in texts {
            let tokens = tokenize(text);
            let mut term_freqs: HashMap<String, usize> = HashMap::new();
            for token in &tokens {
                *term_freqs.entry(token.clone()).or_insert(0) += 1;
            }
            for term in term_freqs.keys() {
                *doc_freqs.entry(term.clone()).or_insert(0) += 1;
            }
            docs.push(IndexedDoc {
                term_freqs,
                length: tokens.len(),
            });
        }

        let total: usize = docs.iter().map(|d| d.length).sum();
        let avg_len = if docs.is_empty() {
            0.0
        } else {
            total as f32 / docs.len() as f32
        };

        Self {
            docs,
            doc_freqs,
            avg_len,
            params,
        }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// `ln((N - df + 0.5) / (df + 0.5) + 1)`, always positive.
    pub fn idf(&self, term: &str) -> f32 {
        let n = self.docs.len() as f32;
        let df = self.doc_freqs.get(term).copied().unwrap_or(0) as f32;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    /// BM25 score of every document in pool order.
    pub fn scores(&self, query: &str) -> Vec<f32> {
        let mut seen = HashSet::new();
        let terms: Vec<String> = tokenize(query)
            .into_iter()
            .filter(|t| seen.insert(t.clone()))
            .collect();
        let Bm25Params { k1, b } = self.params;

        self.docs
            .iter()
            .map(|doc| {
                let len_norm = if self.avg_len > 0.0 {
                    doc.length as f32 / self.avg_len
                } else {
                    0.0
                };
                terms
                    .iter()
                    .filter_map(|term| {
                        let tf = *doc.term_freqs.get(term)? as f32;
                        let denom = tf + k1 * (1.0 - b + b * len_norm);
                        Some(self.idf(term) * tf * (k1 + 1.0) / denom)
                    })
                    .sum()
            })
            .collect()
    }

    /// Documents with a positive score, best first. Ties keep pool order.
    pub fn rank(&self, query: &str) -> Vec<ScoredIndex> {
        let mut ranked: Vec<ScoredIndex> = self
            .scores(query)
            .into_iter()
            .enumerate()
            .filter(|(_, score)| *score > 0.0)
            .map(|(index, score)| ScoredIndex { index, score })
            .collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked
    }
}
