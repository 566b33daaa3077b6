use recall_core::types::SimilarityMetric;

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let norm_a = dot(a, a).sqrt();
    let norm_b = dot(b, b).sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot(a, b) / (norm_a * norm_b)
}

/// Negated L2 distance, so higher still means closer.
pub fn neg_euclidean(a: &[f32], b: &[f32]) -> f32 {
    -a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum::<f32>().sqrt()
}

pub fn similarity(metric: SimilarityMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        SimilarityMetric::Cosine => cosine(a, b),
        SimilarityMetric::Dot => dot(a, b),
        SimilarityMetric::Euclidean => neg_euclidean(a, b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_bounds() {
        assert!((cosine(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!((cosine(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn euclidean_prefers_closer() {
        let q = [0.0, 0.0];
        assert!(neg_euclidean(&q, &[1.0, 0.0]) > neg_euclidean(&q, &[3.0, 4.0]));
        assert_eq!(similarity(SimilarityMetric::Euclidean, &q, &[3.0, 4.0]), -5.0);
    }

    #[test]
    fn dot_is_unnormalized() {
        assert_eq!(similarity(SimilarityMetric::Dot, &[2.0, 1.0], &[3.0, 4.0]), 10.0);
    }
}
