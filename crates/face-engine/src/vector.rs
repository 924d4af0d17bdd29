//! Pure vector primitives used by every clustering and matching path.
//!
//! Accumulation happens in `f64`; 512-D dot products in `f32` drift enough to
//! flip decisions that sit exactly on a threshold.

use crate::error::{EngineError, Result};

fn check_dims(a: &[f32], b: &[f32]) -> Result<()> {
    if a.len() != b.len() {
        return Err(EngineError::DimensionMismatch {
            expected: a.len(),
            got: b.len(),
        });
    }
    Ok(())
}

/// Cosine similarity in [-1, 1]; 0 when either vector has zero norm
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    check_dims(a, b)?;

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }

    let sim = dot / (norm_a.sqrt() * norm_b.sqrt());
    Ok(sim.clamp(-1.0, 1.0) as f32)
}

pub fn cosine_distance(a: &[f32], b: &[f32]) -> Result<f32> {
    Ok(1.0 - cosine_similarity(a, b)?)
}

/// Element-wise arithmetic mean
pub fn mean_vector<V: AsRef<[f32]>>(vectors: &[V]) -> Result<Vec<f32>> {
    let first = vectors
        .first()
        .ok_or(EngineError::EmptyInput("mean of zero vectors"))?
        .as_ref();

    let mut sums = vec![0.0f64; first.len()];
    for v in vectors {
        let v = v.as_ref();
        check_dims(first, v)?;
        for (sum, x) in sums.iter_mut().zip(v) {
            *sum += f64::from(*x);
        }
    }

    let n = vectors.len() as f64;
    Ok(sums.into_iter().map(|s| (s / n) as f32).collect())
}

/// L2 normalization; a zero vector is returned unchanged
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let norm = v
        .iter()
        .map(|x| f64::from(*x) * f64::from(*x))
        .sum::<f64>()
        .sqrt();
    if norm == 0.0 {
        return v.to_vec();
    }
    v.iter().map(|x| (f64::from(*x) / norm) as f32).collect()
}

/// Best candidate at or above `threshold`; the first of equal scores wins
pub fn find_most_similar<'a, K>(
    query: &[f32],
    candidates: &'a [(K, Vec<f32>)],
    threshold: f32,
) -> Result<Option<(&'a K, f32)>> {
    let mut best: Option<(&K, f32)> = None;
    for (key, embedding) in candidates {
        let sim = cosine_similarity(query, embedding)?;
        if sim < threshold {
            continue;
        }
        if best.map_or(true, |(_, b)| sim > b) {
            best = Some((key, sim));
        }
    }
    Ok(best)
}

/// All candidates at or above `threshold`, most similar first, at most `limit`
pub fn find_similar<'a, K>(
    query: &[f32],
    candidates: &'a [(K, Vec<f32>)],
    threshold: f32,
    limit: usize,
) -> Result<Vec<(&'a K, f32)>> {
    let mut matches = Vec::new();
    for (key, embedding) in candidates {
        let sim = cosine_similarity(query, embedding)?;
        if sim >= threshold {
            matches.push((key, sim));
        }
    }
    // stable sort keeps input order among equal scores
    matches.sort_by(|a, b| b.1.total_cmp(&a.1));
    matches.truncate(limit);
    Ok(matches)
}
