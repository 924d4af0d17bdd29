//! Offline grouping of a closed set of embeddings.
//!
//! Nothing here touches the store: inputs are `{id, embedding}` records and
//! outputs are transient groups the caller may persist as clusters.

mod dbscan;
mod hierarchical;

pub use dbscan::dbscan;
pub use hierarchical::hierarchical;

use crate::error::{EngineError, Result};
use crate::vector::cosine_similarity;
use common::{Embedding, Face, FaceId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupInput {
    pub id: FaceId,
    pub embedding: Embedding,
}

impl GroupInput {
    /// Embedded faces only; faces without an embedding never take part in grouping
    pub fn from_faces(faces: &[Face]) -> Vec<Self> {
        faces
            .iter()
            .filter(|f| f.has_embedding())
            .filter_map(|f| {
                f.embedding.as_ref().map(|e| Self {
                    id: f.id.clone(),
                    embedding: e.clone(),
                })
            })
            .collect()
    }
}

/// A transient grouping, not yet persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceGroup {
    pub id: String,
    pub face_ids: Vec<FaceId>,
    pub centroid: Embedding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GroupingMethod {
    #[default]
    Hierarchical,
    Dbscan,
}

impl std::str::FromStr for GroupingMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hierarchical" => Ok(GroupingMethod::Hierarchical),
            "dbscan" => Ok(GroupingMethod::Dbscan),
            _ => Err(format!("Invalid grouping method: {}", s)),
        }
    }
}

/// Full pairwise similarity matrix; fails on the first dimension mismatch
pub(crate) fn similarity_matrix(inputs: &[GroupInput]) -> Result<Vec<Vec<f32>>> {
    let n = inputs.len();
    if let Some(first) = inputs.first() {
        let expected = first.embedding.len();
        if let Some(bad) = inputs.iter().find(|i| i.embedding.len() != expected) {
            return Err(EngineError::DimensionMismatch {
                expected,
                got: bad.embedding.len(),
            });
        }
    }

    let mut matrix = vec![vec![0.0f32; n]; n];
    for i in 0..n {
        matrix[i][i] = cosine_similarity(&inputs[i].embedding, &inputs[i].embedding)?;
        for j in (i + 1)..n {
            let sim = cosine_similarity(&inputs[i].embedding, &inputs[j].embedding)?;
            matrix[i][j] = sim;
            matrix[j][i] = sim;
        }
    }
    Ok(matrix)
}

pub(crate) fn build_group(id: String, members: &[usize], inputs: &[GroupInput]) -> Result<FaceGroup> {
    let embeddings: Vec<&[f32]> = members
        .iter()
        .map(|&m| inputs[m].embedding.as_slice())
        .collect();
    Ok(FaceGroup {
        id,
        face_ids: members.iter().map(|&m| inputs[m].id.clone()).collect(),
        centroid: crate::vector::mean_vector(&embeddings)?,
    })
}
