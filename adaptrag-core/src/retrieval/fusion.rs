//! Reciprocal Rank Fusion: score = Σ weight / (k + rank + 1)
//!
//! Merges the dense and lexical rankings without normalising their raw
//! scores against each other. Only rank positions matter.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::types::{DocumentSource, RetrievedDocument};

/// Metadata keys recording where a fused document ranked in each leg.
pub const DENSE_RANK_KEY: &str = "dense_rank";
pub const SPARSE_RANK_KEY: &str = "sparse_rank";
pub const SPARSE_SCORE_KEY: &str = "bm25_score";

/// Fusion constants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RrfConfig {
    /// Smoothing constant. Higher values flatten the advantage of top ranks.
    pub k: f32,
    pub dense_weight: f32,
    pub sparse_weight: f32,
}

impl Default for RrfConfig {
    fn default() -> Self {
        Self {
            k: 60.0,
            dense_weight: 0.6,
            sparse_weight: 0.4,
        }
    }
}

impl RrfConfig {
    /// Contribution of a zero-based rank position.
    pub fn contribution(&self, weight: f32, rank: usize) -> f32 {
        weight / (self.k + rank as f32 + 1.0)
    }
}

/// Fuse a dense and a sparse ranking, truncating to `top_k`.
///
/// A document id appearing in both legs is merged into one `Hybrid` entry.
/// Within a leg only the first (best-ranked) occurrence of an id counts.
/// Ties keep first-seen order, dense leg first, so fusing a dense ranking
/// with an empty sparse ranking reproduces the dense order.
pub fn reciprocal_rank_fusion(
    dense: &[RetrievedDocument],
    sparse: &[RetrievedDocument],
    config: &RrfConfig,
    top_k: usize,
) -> Vec<RetrievedDocument> {
    let mut fused: Vec<RetrievedDocument> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    let legs = [
        (dense, config.dense_weight, DENSE_RANK_KEY),
        (sparse, config.sparse_weight, SPARSE_RANK_KEY),
    ];

    for (leg, weight, rank_key) in legs {
        let mut seen_in_leg = HashSet::new();
        let mut rank = 0usize;
        for doc in leg {
            if !seen_in_leg.insert(doc.id.as_str()) {
                continue;
            }
            let contribution = config.contribution(weight, rank);
            match positions.get(&doc.id) {
                Some(&pos) => {
                    let existing = &mut fused[pos];
                    existing.score += contribution;
                    existing.source = DocumentSource::Hybrid;
                    existing
                        .metadata
                        .insert(rank_key.to_string(), serde_json::json!(rank));
                    if rank_key == SPARSE_RANK_KEY {
                        existing
                            .metadata
                            .insert(SPARSE_SCORE_KEY.to_string(), serde_json::json!(doc.score));
                    }
                }
                None => {
                    let mut entry = doc.clone();
                    if rank_key == SPARSE_RANK_KEY {
                        entry
                            .metadata
                            .insert(SPARSE_SCORE_KEY.to_string(), serde_json::json!(doc.score));
                    }
                    entry.score = contribution;
                    entry
                        .metadata
                        .insert(rank_key.to_string(), serde_json::json!(rank));
                    positions.insert(doc.id.clone(), fused.len());
                    fused.push(entry);
                }
            }
            rank += 1;
        }
    }

    // stable: equal scores keep first-seen order
    fused.sort_by(|a, b| b.score.total_cmp(&a.score));
    fused.truncate(top_k);
    fused
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn doc(id: &str, score: f32, source: DocumentSource) -> RetrievedDocument {
        RetrievedDocument::new(id, format!("text {id}"), score, source)
    }

    fn ids(docs: &[RetrievedDocument]) -> Vec<&str> {
        docs.iter().map(|d| d.id.as_str()).collect()
    }

    #[test]
    fn test_dense_only_keeps_dense_order() {
        let dense = vec![
            doc("a", 0.9, DocumentSource::Dense),
            doc("b", 0.8, DocumentSource::Dense),
            doc("c", 0.7, DocumentSource::Dense),
        ];
        let fused = reciprocal_rank_fusion(&dense, &[], &RrfConfig::default(), 10);
        assert_eq!(ids(&fused), vec!["a", "b", "c"]);
        assert!(fused.iter().all(|d| d.source == DocumentSource::Dense));
    }

    #[test]
    fn test_scores_follow_formula() {
        let dense = vec![doc("a", 0.9, DocumentSource::Dense)];
        let sparse = vec![
            doc("b", 4.0, DocumentSource::Sparse),
            doc("a", 2.0, DocumentSource::Sparse),
        ];
        let cfg = RrfConfig::default();
        let fused = reciprocal_rank_fusion(&dense, &sparse, &cfg, 10);

        let a = fused.iter().find(|d| d.id == "a").unwrap();
        let expected_a = 0.6 / 61.0 + 0.4 / 62.0;
        assert!((a.score - expected_a).abs() < 1e-6);
        assert_eq!(a.source, DocumentSource::Hybrid);
        assert_eq!(a.metadata[SPARSE_RANK_KEY], serde_json::json!(1));

        let b = fused.iter().find(|d| d.id == "b").unwrap();
        assert!((b.score - 0.4 / 61.0).abs() < 1e-6);
        assert_eq!(b.source, DocumentSource::Sparse);
    }

    #[test]
    fn test_cross_leg_duplicates_merged() {
        let dense = vec![
            doc("a", 0.9, DocumentSource::Dense),
            doc("b", 0.8, DocumentSource::Dense),
        ];
        let sparse = vec![
            doc("b", 3.0, DocumentSource::Sparse),
            doc("a", 1.0, DocumentSource::Sparse),
        ];
        let fused = reciprocal_rank_fusion(&dense, &sparse, &RrfConfig::default(), 10);
        assert_eq!(fused.len(), 2);
        assert!(fused.iter().all(|d| d.source == DocumentSource::Hybrid));
    }

    #[test]
    fn test_within_leg_duplicates_count_once() {
        let dense = vec![
            doc("a", 0.9, DocumentSource::Dense),
            doc("a", 0.9, DocumentSource::Dense),
            doc("b", 0.5, DocumentSource::Dense),
        ];
        let fused = reciprocal_rank_fusion(&dense, &[], &RrfConfig::default(), 10);
        assert_eq!(ids(&fused), vec!["a", "b"]);
        // b takes rank 1, not 2
        assert!((fused[1].score - 0.6 / 62.0).abs() < 1e-6);
    }

    #[test]
    fn test_sparse_can_promote_document() {
        let dense = vec![
            doc("a", 0.9, DocumentSource::Dense),
            doc("b", 0.8, DocumentSource::Dense),
        ];
        let sparse = vec![doc("b", 5.0, DocumentSource::Sparse)];
        let fused = reciprocal_rank_fusion(&dense, &sparse, &RrfConfig::default(), 10);
        assert_eq!(ids(&fused), vec!["b", "a"]);
    }

    #[test]
    fn test_truncates_to_top_k() {
        let dense: Vec<_> = (0..8)
            .map(|i| doc(&format!("d{i}"), 1.0 - i as f32 * 0.1, DocumentSource::Dense))
            .collect();
        let fused = reciprocal_rank_fusion(&dense, &[], &RrfConfig::default(), 3);
        assert_eq!(ids(&fused), vec!["d0", "d1", "d2"]);
    }

    #[test]
    fn test_empty_inputs() {
        assert!(reciprocal_rank_fusion(&[], &[], &RrfConfig::default(), 5).is_empty());
    }
}
