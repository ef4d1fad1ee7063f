//! Cosine similarity between embedding vectors.

/// Errors raised by similarity computation.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SimilarityError {
    #[error("Dimension mismatch: left has {left}, right has {right}")]
    DimensionMismatch { left: usize, right: usize },
}

/// Compute cosine similarity of two vectors of equal length.
///
/// A zero vector (the fallback for a failed embedding) scores 0 against
/// everything, itself included.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32, SimilarityError> {
    if a.len() != b.len() {
        return Err(SimilarityError::DimensionMismatch {
            left: a.len(),
            right: b.len(),
        });
    }

    let mut dot_product = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot_product += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let norm_a = norm_a.sqrt();
    let norm_b = norm_b.sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }

    Ok(dot_product / (norm_a * norm_b))
}

/// Compute L2 norm of a vector.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}
