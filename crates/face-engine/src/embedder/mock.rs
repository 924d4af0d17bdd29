/// Deterministic face extractor for tests and demos
use super::{Embedder, Frame};
use crate::vector::normalize;
use anyhow::Result;
use async_trait::async_trait;
use common::{BoundingBox, DetectedFace, Gender};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockEmbedderConfig {
    /// Embedding length
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,

    /// Number of distinct simulated people
    #[serde(default = "default_people")]
    pub people: usize,

    /// Faces reported per frame
    #[serde(default = "default_faces_per_frame")]
    pub faces_per_frame: usize,

    /// Largest per-frame perturbation of a person's embedding
    #[serde(default = "default_jitter")]
    pub jitter: f32,

    /// Every n-th face has a failed extraction (0 = never)
    #[serde(default)]
    pub missing_embedding_every: u64,

    /// Simulate processing delay in milliseconds
    #[serde(default)]
    pub simulated_delay_ms: u64,
}

fn default_embedding_dim() -> usize {
    512
}

fn default_people() -> usize {
    3
}

fn default_faces_per_frame() -> usize {
    1
}

fn default_jitter() -> f32 {
    0.05
}

impl Default for MockEmbedderConfig {
    fn default() -> Self {
        Self {
            embedding_dim: default_embedding_dim(),
            people: default_people(),
            faces_per_frame: default_faces_per_frame(),
            jitter: default_jitter(),
            missing_embedding_every: 0,
            simulated_delay_ms: 0,
        }
    }
}

pub struct MockEmbedder {
    config: MockEmbedderConfig,
}

impl MockEmbedder {
    pub fn new(config: MockEmbedderConfig) -> Self {
        Self { config }
    }

    /// Embedding for `person` as seen in frame `sequence`.
    ///
    /// Each person owns one axis; the jitter leaks a little into the next
    /// axis, so two frames of one person stay above 0.99 similarity while
    /// different people score at most `jitter` (given `people < embedding_dim`).
    pub fn embedding_for(&self, person: usize, sequence: u64) -> Vec<f32> {
        let dim = self.config.embedding_dim.max(2);
        let mut v = vec![0.0f32; dim];
        let axis = person % dim;
        v[axis] = 1.0;
        v[(axis + 1) % dim] = self.config.jitter * ((sequence % 7) as f32 / 7.0);
        normalize(&v)
    }

    fn person_for(&self, sequence: u64, index: usize) -> usize {
        let people = self.config.people.max(1) as u64;
        ((sequence + index as u64) % people) as usize
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new(MockEmbedderConfig::default())
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    fn id(&self) -> &'static str {
        "mock_embedder"
    }

    fn embedding_dim(&self) -> usize {
        self.config.embedding_dim.max(2)
    }

    async fn detect(&self, frame: &Frame) -> Result<Vec<DetectedFace>> {
        if self.config.simulated_delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(
                self.config.simulated_delay_ms,
            ))
            .await;
        }

        let mut faces = Vec::with_capacity(self.config.faces_per_frame);
        for i in 0..self.config.faces_per_frame {
            let person = self.person_for(frame.sequence, i);
            let ordinal = frame.sequence * self.config.faces_per_frame as u64 + i as u64 + 1;
            let failed = self.config.missing_embedding_every > 0
                && ordinal % self.config.missing_embedding_every == 0;

            let slot = frame.width as f32 / self.config.faces_per_frame.max(1) as f32;
            faces.push(DetectedFace {
                bbox: BoundingBox {
                    x: slot * i as f32,
                    y: frame.height as f32 / 4.0,
                    width: (slot * 0.8).min(200.0),
                    height: (slot * 0.8).min(200.0),
                },
                embedding: (!failed).then(|| self.embedding_for(person, frame.sequence)),
                age: Some(20.0 + (person as f32 * 7.0) % 50.0),
                gender: if person % 2 == 0 { Gender::Female } else { Gender::Male },
                emotion: Some("neutral".to_string()),
                quality_score: 0.9,
                thumbnail_path: None,
            });
        }

        tracing::debug!(
            camera_id = %frame.camera_id,
            sequence = frame.sequence,
            faces = faces.len(),
            "mock detection"
        );
        Ok(faces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::cosine_similarity;

    #[tokio::test]
    async fn test_same_person_is_stable_across_frames() {
        let embedder = MockEmbedder::new(MockEmbedderConfig {
            people: 1,
            ..Default::default()
        });
        let a = embedder.detect(&Frame::new("cam", 1)).await.unwrap();
        let b = embedder.detect(&Frame::new("cam", 5)).await.unwrap();
        let sim = cosine_similarity(
            a[0].embedding.as_ref().unwrap(),
            b[0].embedding.as_ref().unwrap(),
        )
        .unwrap();
        assert!(sim > 0.99);
    }

    #[test]
    fn test_different_people_are_orthogonal() {
        let embedder = MockEmbedder::default();
        let sim = cosine_similarity(&embedder.embedding_for(0, 0), &embedder.embedding_for(2, 0)).unwrap();
        assert!(sim.abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_missing_embeddings() {
        let embedder = MockEmbedder::new(MockEmbedderConfig {
            faces_per_frame: 2,
            missing_embedding_every: 2,
            embedding_dim: 8,
            ..Default::default()
        });
        let faces = embedder.detect(&Frame::new("cam", 0)).await.unwrap();
        assert_eq!(faces.len(), 2);
        assert!(faces[0].embedding.is_some());
        assert!(faces[1].embedding.is_none());
        assert_eq!(faces[0].embedding.as_ref().unwrap().len(), 8);
    }
}
