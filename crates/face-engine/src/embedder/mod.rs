//! Detection and feature-extraction seam.
//!
//! The engine never loads a model itself; a camera session is handed an
//! [`Embedder`] at construction and calls it once per frame.

pub mod mock;

pub use mock::{MockEmbedder, MockEmbedderConfig};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::DetectedFace;

/// One captured camera frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub camera_id: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    /// Encoded image bytes; opaque to the engine
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(camera_id: impl Into<String>, sequence: u64) -> Self {
        Self {
            camera_id: camera_id.into(),
            sequence,
            timestamp: Utc::now(),
            width: 1280,
            height: 720,
            data: Vec::new(),
        }
    }
}

/// Turns a frame into detected faces with embeddings
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Unique extractor identifier (e.g., "mock_embedder")
    fn id(&self) -> &'static str;

    /// Length of the embeddings this extractor produces
    fn embedding_dim(&self) -> usize;

    /// Detect faces; a face whose extraction failed carries `embedding: None`
    async fn detect(&self, frame: &Frame) -> Result<Vec<DetectedFace>>;

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}
