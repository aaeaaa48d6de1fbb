//! Vector similarity helpers shared by the store backends.

use std::cmp::Ordering;

use super::types::ScoredFact;

/// Cosine similarity in [-1, 1]. Mismatched lengths or zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Descending score, then most recent `created_at`, then highest sequence
pub fn rank(results: &mut [ScoredFact]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.fact.created_at.cmp(&a.fact.created_at))
            .then_with(|| b.fact.sequence.cmp(&a.fact.sequence))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::Fact;

    #[test]
    fn test_cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_rank_breaks_ties_by_recency() {
        let mut older = Fact::new("u", "User likes tea", "");
        older.created_at = 1_000;
        let mut newer = Fact::new("u", "User hates tea", "");
        newer.created_at = 2_000;
        let mut best = Fact::new("u", "User drinks coffee", "");
        best.created_at = 500;

        let mut results = vec![
            ScoredFact { fact: older, score: 0.5 },
            ScoredFact { fact: best, score: 0.9 },
            ScoredFact { fact: newer, score: 0.5 },
        ];
        rank(&mut results);

        let texts: Vec<_> = results.iter().map(|r| r.fact.text.as_str()).collect();
        assert_eq!(texts, ["User drinks coffee", "User hates tea", "User likes tea"]);
    }
}
