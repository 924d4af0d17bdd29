use crate::error::Result;
use crate::vector::cosine_similarity;
use common::{ClusterId, Embedding, IdentityId};
use serde::{Deserialize, Serialize};

/// One confirmed cluster centroid standing in for its identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityCandidate {
    pub identity_id: IdentityId,
    pub cluster_id: ClusterId,
    pub centroid: Embedding,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recognition {
    pub identity_id: Option<IdentityId>,
    /// Cluster whose centroid produced the match
    pub cluster_id: Option<ClusterId>,
    pub confidence: Option<f32>,
    pub is_stranger: bool,
}

impl Recognition {
    pub fn stranger() -> Self {
        Self {
            identity_id: None,
            cluster_id: None,
            confidence: None,
            is_stranger: true,
        }
    }
}

/// Nearest confirmed identity at or above `threshold`.
///
/// Every linked cluster of every identity is a candidate; a later candidate
/// replaces the current best only on a strictly higher similarity.
pub fn recognize(
    embedding: &[f32],
    candidates: &[IdentityCandidate],
    threshold: f32,
) -> Result<Recognition> {
    let mut best: Option<(&IdentityCandidate, f32)> = None;

    for candidate in candidates {
        let similarity = cosine_similarity(embedding, &candidate.centroid)?;
        if similarity < threshold {
            continue;
        }
        if best.map_or(true, |(_, b)| similarity > b) {
            best = Some((candidate, similarity));
        }
    }

    Ok(match best {
        Some((candidate, similarity)) => Recognition {
            identity_id: Some(candidate.identity_id.clone()),
            cluster_id: Some(candidate.cluster_id.clone()),
            confidence: Some(similarity),
            is_stranger: false,
        },
        None => Recognition::stranger(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(cos: f32) -> Vec<f32> {
        vec![cos, (1.0 - cos * cos).sqrt()]
    }

    fn candidate(identity: &str, cluster: &str, centroid: Vec<f32>) -> IdentityCandidate {
        IdentityCandidate {
            identity_id: identity.to_string(),
            cluster_id: cluster.to_string(),
            centroid,
        }
    }

    #[test]
    fn test_best_identity_above_threshold() {
        let candidates = vec![
            candidate("bob", "c-bob", unit(0.55)),
            candidate("alice", "c-alice", unit(0.65)),
        ];
        let result = recognize(&[1.0, 0.0], &candidates, 0.6).unwrap();
        assert!(!result.is_stranger);
        assert_eq!(result.identity_id.as_deref(), Some("alice"));
        assert_eq!(result.cluster_id.as_deref(), Some("c-alice"));
        assert!((result.confidence.unwrap() - 0.65).abs() < 1e-5);
    }

    #[test]
    fn test_stranger_below_threshold() {
        let candidates = vec![candidate("alice", "c1", unit(0.4))];
        let result = recognize(&[1.0, 0.0], &candidates, 0.6).unwrap();
        assert_eq!(result, Recognition::stranger());
    }

    #[test]
    fn test_no_candidates_is_stranger() {
        assert!(recognize(&[1.0, 0.0], &[], 0.6).unwrap().is_stranger);
    }

    #[test]
    fn test_tie_keeps_first_candidate() {
        let candidates = vec![
            candidate("alice", "c1", vec![1.0, 0.0]),
            candidate("bob", "c2", vec![2.0, 0.0]),
        ];
        let result = recognize(&[1.0, 0.0], &candidates, 0.6).unwrap();
        assert_eq!(result.identity_id.as_deref(), Some("alice"));
    }

    #[test]
    fn test_identity_with_several_clusters() {
        let candidates = vec![
            candidate("alice", "c1", unit(0.3)),
            candidate("bob", "c2", unit(0.7)),
            candidate("alice", "c3", unit(0.9)),
        ];
        let result = recognize(&[1.0, 0.0], &candidates, 0.6).unwrap();
        assert_eq!(result.identity_id.as_deref(), Some("alice"));
        assert_eq!(result.cluster_id.as_deref(), Some("c3"));
    }

    #[test]
    fn test_dimension_mismatch() {
        let candidates = vec![candidate("alice", "c1", vec![1.0, 0.0, 0.0])];
        assert!(recognize(&[1.0, 0.0], &candidates, 0.6).is_err());
    }
}
