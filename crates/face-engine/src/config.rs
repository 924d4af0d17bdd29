use anyhow::{Context, Result};
use common::validation::{validate_positive_millis, validate_range};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

/// Similarity window for one deduplication cache
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DedupSettings {
    /// Cosine similarity at or above which two observations are the same appearance
    pub similarity_threshold: f32,

    /// How long an observation suppresses similar ones from the same source
    pub cooldown_ms: u64,
}

impl DedupSettings {
    /// Server-side save suppression: 10 minutes, 0.7
    pub fn save_path() -> Self {
        Self {
            similarity_threshold: 0.7,
            cooldown_ms: 600_000,
        }
    }

    /// Per-session recognition result reuse: 3 minutes, 0.5
    pub fn recognition_path() -> Self {
        Self {
            similarity_threshold: 0.5,
            cooldown_ms: 180_000,
        }
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(i64::try_from(self.cooldown_ms).unwrap_or(i64::MAX))
    }

    fn validate(&self, name: &str) -> Result<()> {
        validate_range(
            self.similarity_threshold,
            -1.0,
            1.0,
            &format!("{name}.similarity_threshold"),
        )?;
        validate_positive_millis(self.cooldown_ms, &format!("{name}.cooldown_ms"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Minimum similarity for a face to join an existing cluster
    #[serde(default = "default_clustering_threshold")]
    pub clustering_threshold: f32,

    /// Minimum centroid similarity for two pending clusters to be merged
    #[serde(default = "default_merge_threshold")]
    pub merge_threshold: f32,

    /// Minimum similarity for a face to be recognized as a confirmed identity
    #[serde(default = "default_recognition_threshold")]
    pub recognition_threshold: f32,

    #[serde(default = "DedupSettings::save_path")]
    pub save_dedup: DedupSettings,

    #[serde(default = "DedupSettings::recognition_path")]
    pub recognition_cache: DedupSettings,

    /// Expected embedding length; detections of any other length are rejected at ingest
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,

    /// L2-normalize embeddings before they are stored
    #[serde(default)]
    pub normalize_embeddings: bool,

    /// Minimum neighbour count for DBSCAN grouping
    #[serde(default = "default_dbscan_min_points")]
    pub dbscan_min_points: usize,
}

fn default_clustering_threshold() -> f32 {
    0.5
}

fn default_merge_threshold() -> f32 {
    0.7
}

fn default_recognition_threshold() -> f32 {
    0.6
}

fn default_embedding_dim() -> usize {
    512
}

fn default_dbscan_min_points() -> usize {
    2
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            clustering_threshold: default_clustering_threshold(),
            merge_threshold: default_merge_threshold(),
            recognition_threshold: default_recognition_threshold(),
            save_dedup: DedupSettings::save_path(),
            recognition_cache: DedupSettings::recognition_path(),
            embedding_dim: default_embedding_dim(),
            normalize_embeddings: false,
            dbscan_min_points: default_dbscan_min_points(),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("invalid {key}")),
        Err(_) => Ok(None),
    }
}

impl EngineConfig {
    /// Load from `FACE_*` environment variables over the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = env_parse("FACE_CLUSTERING_THRESHOLD")? {
            config.clustering_threshold = v;
        }
        if let Some(v) = env_parse("FACE_MERGE_THRESHOLD")? {
            config.merge_threshold = v;
        }
        if let Some(v) = env_parse("FACE_RECOGNITION_THRESHOLD")? {
            config.recognition_threshold = v;
        }
        if let Some(v) = env_parse("FACE_SAVE_DEDUP_THRESHOLD")? {
            config.save_dedup.similarity_threshold = v;
        }
        if let Some(v) = env_parse("FACE_SAVE_DEDUP_COOLDOWN_MS")? {
            config.save_dedup.cooldown_ms = v;
        }
        if let Some(v) = env_parse("FACE_RECOGNITION_CACHE_THRESHOLD")? {
            config.recognition_cache.similarity_threshold = v;
        }
        if let Some(v) = env_parse("FACE_RECOGNITION_CACHE_COOLDOWN_MS")? {
            config.recognition_cache.cooldown_ms = v;
        }
        if let Some(v) = env_parse("FACE_EMBEDDING_DIM")? {
            config.embedding_dim = v;
        }
        if let Some(v) = env_parse("FACE_NORMALIZE_EMBEDDINGS")? {
            config.normalize_embeddings = v;
        }
        if let Some(v) = env_parse("FACE_DBSCAN_MIN_POINTS")? {
            config.dbscan_min_points = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_range(self.clustering_threshold, -1.0, 1.0, "clustering_threshold")?;
        validate_range(self.merge_threshold, -1.0, 1.0, "merge_threshold")?;
        validate_range(self.recognition_threshold, -1.0, 1.0, "recognition_threshold")?;
        self.save_dedup.validate("save_dedup")?;
        self.recognition_cache.validate("recognition_cache")?;
        if self.embedding_dim == 0 {
            anyhow::bail!("embedding_dim must be greater than 0");
        }
        Ok(())
    }
}
