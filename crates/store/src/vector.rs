//! Similarity scoring and rank fusion over passages.

use std::collections::HashMap;

use routeqa_core::Passage;

/// Standard RRF damping constant.
pub const RRF_K: u32 = 60;

/// Cosine similarity in [-1, 1]. Mismatched, empty, or zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let (dot, norm_a, norm_b) = a.iter().zip(b).fold((0.0f64, 0.0f64, 0.0f64), |acc, (x, y)| {
        let (x, y) = (*x as f64, *y as f64);
        (acc.0 + x * y, acc.1 + x * x, acc.2 + y * y)
    });

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }
    (dot / denom) as f32
}

/// Passages carrying an embedding, ranked by similarity to `query_embedding`.
pub fn rank_by_similarity(passages: &[Passage], query_embedding: &[f32], limit: usize) -> Vec<Passage> {
    let mut scored: Vec<Passage> = passages
        .iter()
        .filter_map(|p| {
            let emb = p.embedding.as_ref()?;
            let mut hit = p.clone();
            hit.score = cosine_similarity(emb, query_embedding);
            Some(hit)
        })
        .collect();

    sort_by_score(&mut scored);
    scored.truncate(limit);
    scored
}

/// Merge ranked lists with Reciprocal Rank Fusion.
///
/// A passage at zero-based rank `r` in a list contributes `1 / (k + r + 1)`.
/// Contributions add up across lists; the result is deduplicated by id.
pub fn reciprocal_rank_fusion(lists: &[Vec<Passage>], k: u32, limit: usize) -> Vec<Passage> {
    let k = k as f32;
    let mut fused: HashMap<String, Passage> = HashMap::new();

    for list in lists {
        for (rank, passage) in list.iter().enumerate() {
            let contribution = 1.0 / (k + rank as f32 + 1.0);
            fused
                .entry(passage.id.clone())
                .and_modify(|p| p.score += contribution)
                .or_insert_with(|| {
                    let mut p = passage.clone();
                    p.score = contribution;
                    p
                });
        }
    }

    let mut results: Vec<Passage> = fused.into_values().collect();
    sort_by_score(&mut results);
    results.truncate(limit);
    results
}

/// Descending score, ties broken by id so output is deterministic.
pub(crate) fn sort_by_score(passages: &mut [Passage]) {
    passages.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
}
