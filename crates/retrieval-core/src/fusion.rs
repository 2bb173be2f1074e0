//! Reciprocal Rank Fusion: `score = Σ_source 1 / (k_const + rank_in_source)`.
//!
//! Combines the vector and keyword rankings into one list without
//! normalizing their incompatible raw scores. A source that does not
//! contain an id contributes nothing. Items both backends agree on rise
//! above items only one backend found, and an empty backend simply leaves
//! the other's order intact.
//!
//! # Ordering
//!
//! 1. `fused_score` descending.
//! 2. Best individual rank across sources ascending.
//! 3. `chunk_id` ascending (byte-wise).
//!
//! The result is fully determined by the two input lists.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::models::{FusedResult, HitSource, RetrievalHit};

/// Smoothing constant used when none is configured.
pub const DEFAULT_K_CONST: u32 = 60;

/// Contribution of a single rank.
pub fn rrf_contribution(k_const: u32, rank: usize) -> f64 {
    1.0 / (k_const as f64 + rank as f64)
}

/// Highest fused score attainable: rank 1 in each of `sources` lists.
pub fn max_fused_score(k_const: u32, sources: usize) -> f64 {
    sources as f64 * rrf_contribution(k_const, 1)
}

struct Accumulator {
    ranks: [Option<usize>; 2],
}

fn slot(source: HitSource) -> usize {
    match source {
        HitSource::Vector => 0,
        HitSource::Keyword => 1,
    }
}

/// Fuse the vector and keyword rankings.
///
/// Each hit's `rank` is taken as its 1-based position in its source list.
/// If an id appears more than once in one list, its best rank is used.
pub fn fuse(
    vector_hits: &[RetrievalHit],
    keyword_hits: &[RetrievalHit],
    k_const: u32,
) -> Vec<FusedResult> {
    let mut by_id: HashMap<&str, Accumulator> = HashMap::new();

    for (source, hits) in [
        (HitSource::Vector, vector_hits),
        (HitSource::Keyword, keyword_hits),
    ] {
        for hit in hits {
            let entry = by_id
                .entry(hit.chunk_id.as_str())
                .or_insert(Accumulator { ranks: [None; 2] });
            let rank = &mut entry.ranks[slot(source)];
            *rank = Some(rank.map_or(hit.rank, |r| r.min(hit.rank)));
        }
    }

    let mut fused: Vec<FusedResult> = by_id
        .into_iter()
        .map(|(chunk_id, acc)| {
            let mut fused_score = 0.0;
            let mut contributing_sources = Vec::with_capacity(2);
            let mut best_rank = usize::MAX;
            for source in [HitSource::Vector, HitSource::Keyword] {
                if let Some(rank) = acc.ranks[slot(source)] {
                    fused_score += rrf_contribution(k_const, rank);
                    contributing_sources.push(source);
                    best_rank = best_rank.min(rank);
                }
            }
            FusedResult {
                chunk_id: chunk_id.to_string(),
                fused_score,
                contributing_sources,
                best_rank,
            }
        })
        .collect();

    fused.sort_by(compare_fused);
    fused
}

fn compare_fused(a: &FusedResult, b: &FusedResult) -> Ordering {
    b.fused_score
        .partial_cmp(&a.fused_score)
        .unwrap_or(Ordering::Equal)
        .then(a.best_rank.cmp(&b.best_rank))
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hits(source: HitSource, ids: &[&str]) -> Vec<RetrievalHit> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| RetrievalHit {
                chunk_id: id.to_string(),
                rank: i + 1,
                raw_score: 1.0 - i as f64 * 0.1,
                source,
            })
            .collect()
    }

    fn ids(fused: &[FusedResult]) -> Vec<&str> {
        fused.iter().map(|f| f.chunk_id.as_str()).collect()
    }

    #[test]
    fn test_reference_example() {
        let vector = hits(HitSource::Vector, &["A", "B", "C"]);
        let keyword = hits(HitSource::Keyword, &["B", "A", "D"]);
        let fused = fuse(&vector, &keyword, 60);

        // A and B tie exactly and both hold a rank 1; C and D are both rank 3
        // in a single list. Each tie falls through to the id.
        assert_eq!(ids(&fused), vec!["A", "B", "C", "D"]);

        let expected_ab = 1.0 / 61.0 + 1.0 / 62.0;
        assert!((fused[0].fused_score - expected_ab).abs() < 1e-12);
        assert_eq!(fused[0].fused_score, fused[1].fused_score);
        assert_eq!(fused[2].fused_score, 1.0 / 63.0);
        assert_eq!(fused[3].fused_score, 1.0 / 63.0);

        assert_eq!(fused[0].best_rank, 1);
        assert_eq!(fused[1].best_rank, 1);
        assert_eq!(
            fused[0].contributing_sources,
            vec![HitSource::Vector, HitSource::Keyword]
        );
        assert_eq!(fused[2].contributing_sources, vec![HitSource::Vector]);
        assert_eq!(fused[3].contributing_sources, vec![HitSource::Keyword]);
    }

    #[test]
    fn test_fusion_is_deterministic_across_runs() {
        let vector = hits(HitSource::Vector, &["x", "y", "z", "w"]);
        let keyword = hits(HitSource::Keyword, &["w", "z", "y", "x"]);
        let first = fuse(&vector, &keyword, 60);
        for _ in 0..20 {
            assert_eq!(fuse(&vector, &keyword, 60), first);
        }
        // Symmetric rankings tie on score; tie-break falls to best rank, then id.
        assert_eq!(ids(&first), vec!["w", "x", "y", "z"]);
    }

    #[test]
    fn test_best_rank_breaks_score_ties_before_id() {
        // k=0 keeps the arithmetic exact: "z" and "s" score 1/1, "a" scores 1/2 + 1/2.
        let vector = hits(HitSource::Vector, &["z", "a"]);
        let keyword = hits(HitSource::Keyword, &["s", "a"]);
        let fused = fuse(&vector, &keyword, 0);
        assert!(fused.iter().all(|f| f.fused_score == 1.0));
        assert_eq!(ids(&fused), vec!["s", "z", "a"]);
    }

    #[test]
    fn test_empty_backend_preserves_other_order() {
        let keyword = hits(HitSource::Keyword, &["k3", "k1", "k2"]);
        let fused = fuse(&[], &keyword, 60);
        assert_eq!(ids(&fused), vec!["k3", "k1", "k2"]);
        assert!(fused
            .iter()
            .all(|f| f.contributing_sources == vec![HitSource::Keyword]));
    }

    #[test]
    fn test_both_empty() {
        assert!(fuse(&[], &[], 60).is_empty());
    }

    #[test]
    fn test_agreement_beats_single_source() {
        let vector = hits(HitSource::Vector, &["solo", "both"]);
        let keyword = hits(HitSource::Keyword, &["other", "both"]);
        let fused = fuse(&vector, &keyword, 60);
        assert_eq!(fused[0].chunk_id, "both");
    }

    #[test]
    fn test_duplicate_ids_within_a_list_use_best_rank() {
        let mut vector = hits(HitSource::Vector, &["a", "b"]);
        vector.push(RetrievalHit {
            chunk_id: "a".into(),
            rank: 3,
            raw_score: 0.1,
            source: HitSource::Vector,
        });
        let fused = fuse(&vector, &[], 60);
        assert_eq!(fused.len(), 2);
        assert!((fused[0].fused_score - 1.0 / 61.0).abs() < 1e-12);
    }

    #[test]
    fn test_max_fused_score() {
        assert!((max_fused_score(60, 2) - 2.0 / 61.0).abs() < 1e-12);
    }
}
