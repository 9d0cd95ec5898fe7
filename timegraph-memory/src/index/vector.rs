//! Exact vector similarity

use std::cmp::Ordering;

/// Calculate cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Score every item against `query` and keep the `limit` most similar.
///
/// Items without a vector are skipped; scores below `min_score` are dropped.
/// Equal scores keep their input order.
pub fn top_k_by_similarity<T, F>(
    items: impl IntoIterator<Item = T>,
    query: &[f32],
    vector_of: F,
    min_score: f32,
    limit: usize,
) -> Vec<(T, f32)>
where
    F: Fn(&T) -> Option<&[f32]>,
{
    let mut scored: Vec<(T, f32)> = items
        .into_iter()
        .filter_map(|item| {
            let score = cosine_similarity(query, vector_of(&item)?);
            (score >= min_score).then_some((item, score))
        })
        .collect();

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    scored.truncate(limit);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 0.001);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![-1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 0.001);
    }

    #[test]
    fn test_cosine_similarity_mismatched_or_zero() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_top_k_orders_and_filters() {
        let items = vec![
            ("x", Some(vec![1.0_f32, 0.0])),
            ("none", None),
            ("diag", Some(vec![1.0, 1.0])),
            ("y", Some(vec![0.0, 1.0])),
        ];
        let hits = top_k_by_similarity(
            items.iter(),
            &[1.0, 0.0],
            |(_, v)| v.as_deref(),
            0.5,
            10,
        );
        let names: Vec<_> = hits.iter().map(|(item, _)| item.0).collect();
        assert_eq!(names, vec!["x", "diag"]);
    }
}
