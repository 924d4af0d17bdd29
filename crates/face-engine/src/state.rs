use crate::assign::{AssignmentReport, BatchClusterer};
use crate::centroid::CentroidMaintainer;
use crate::config::EngineConfig;
use crate::dedup::{CacheLookup, DedupCache, DedupStats};
use crate::error::{EngineError, Result};
use crate::grouping::{self, FaceGroup, GroupInput, GroupingMethod};
use crate::merge::{ClusterMerger, MergeReport};
use crate::recognizer::{self, IdentityCandidate, Recognition};
use crate::store::{ClusterStore, MemoryClusterStore};
use crate::vector::{find_similar, normalize};
use chrono::{DateTime, Utc};
use common::validation::validate_id;
use common::{
    Cluster, ClusterId, ClusterStatus, DetectedFace, Face, FaceId, IdentityId, RecognitionLog,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use telemetry::metrics::{FACE_ENGINE_OPERATION_DURATION, FACE_ENGINE_RECOGNITIONS};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Result of persisting one camera detection through the save-path cache
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    Saved(Face),
    /// The same appearance was saved within the cooldown window
    Duplicate { face_id: FaceId },
    /// The same appearance is being saved right now
    InFlight,
}

#[derive(Debug, Clone, Default)]
pub struct RecognizeRequest {
    pub embedding: Vec<f32>,
    pub face_id: Option<FaceId>,
    pub camera_id: Option<String>,
    pub thumbnail_path: Option<String>,
}

/// Recognition log query; results are newest first
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogFilter {
    pub camera_id: Option<String>,
    pub identity_id: Option<IdentityId>,
    pub is_stranger: Option<bool>,
    pub since: Option<DateTime<Utc>>,
    #[serde(default = "default_log_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_log_limit() -> usize {
    50
}

impl Default for LogFilter {
    fn default() -> Self {
        Self {
            camera_id: None,
            identity_id: None,
            is_stranger: None,
            since: None,
            limit: default_log_limit(),
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecognitionStats {
    pub total: usize,
    pub identified: usize,
    pub strangers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarFace {
    pub face_id: FaceId,
    pub cluster_id: Option<ClusterId>,
    pub similarity: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FaceStats {
    pub total: usize,
    pub clustered: usize,
    pub unclustered: usize,
    pub without_embedding: usize,
}

/// Clustering and recognition engine over a [`ClusterStore`]
#[derive(Clone)]
pub struct FaceEngine {
    pub(crate) inner: Arc<FaceEngineInner>,
}

pub(crate) struct FaceEngineInner {
    pub(crate) store: Arc<dyn ClusterStore>,
    pub(crate) config: RwLock<EngineConfig>,
    pub(crate) centroids: CentroidMaintainer,
    clusterer: BatchClusterer,
    merger: ClusterMerger,
    save_dedup: DedupCache<FaceId>,
}

impl FaceEngine {
    pub fn new(store: Arc<dyn ClusterStore>, config: EngineConfig) -> Result<Self> {
        config.validate().map_err(EngineError::invalid)?;

        let centroids = CentroidMaintainer::new(store.clone());
        Ok(Self {
            inner: Arc::new(FaceEngineInner {
                clusterer: BatchClusterer::new(store.clone(), centroids.clone()),
                merger: ClusterMerger::new(store.clone(), centroids.clone()),
                save_dedup: DedupCache::new("save", config.save_dedup),
                config: RwLock::new(config),
                centroids,
                store,
            }),
        })
    }

    pub fn in_memory(config: EngineConfig) -> Result<Self> {
        Self::new(Arc::new(MemoryClusterStore::new()), config)
    }

    pub fn store(&self) -> &Arc<dyn ClusterStore> {
        &self.inner.store
    }

    pub async fn config(&self) -> EngineConfig {
        self.inner.config.read().await.clone()
    }

    /// Replace the runtime configuration; the next operation uses the new values
    pub async fn update_config(&self, config: EngineConfig) -> Result<()> {
        config.validate().map_err(EngineError::invalid)?;
        self.inner.save_dedup.set_settings(config.save_dedup).await;
        *self.inner.config.write().await = config.clone();
        info!(
            clustering_threshold = config.clustering_threshold,
            merge_threshold = config.merge_threshold,
            recognition_threshold = config.recognition_threshold,
            "engine configuration updated"
        );
        Ok(())
    }

    // ==== Ingest ====

    fn face_from_detection(
        config: &EngineConfig,
        image_id: Option<&str>,
        detection: &DetectedFace,
    ) -> Result<Face> {
        let embedding = match detection.embedding.as_deref() {
            Some(e) if !e.is_empty() => {
                if e.len() != config.embedding_dim {
                    return Err(EngineError::DimensionMismatch {
                        expected: config.embedding_dim,
                        got: e.len(),
                    });
                }
                Some(if config.normalize_embeddings {
                    normalize(e)
                } else {
                    e.to_vec()
                })
            }
            _ => None,
        };

        let mut face = Face::new(embedding).with_attributes(detection.attributes());
        if let Some(image_id) = image_id {
            face = face.with_image(image_id);
        }
        Ok(face)
    }

    /// Persist detections as unassigned faces.
    ///
    /// Every detection is checked before anything is written, so one bad
    /// embedding length rejects the whole batch.
    pub async fn register_detections(
        &self,
        image_id: Option<&str>,
        detections: &[DetectedFace],
    ) -> Result<Vec<Face>> {
        let config = self.config().await;
        let faces = detections
            .iter()
            .map(|d| Self::face_from_detection(&config, image_id, d))
            .collect::<Result<Vec<_>>>()?;

        for face in &faces {
            self.inner.store.insert_face(face.clone()).await?;
        }
        debug!(image_id = ?image_id, faces = faces.len(), "registered detections");
        Ok(faces)
    }

    /// Persist one camera detection unless the same appearance was saved recently
    pub async fn save_camera_detection(
        &self,
        camera_id: &str,
        detection: &DetectedFace,
        now: DateTime<Utc>,
    ) -> Result<SaveOutcome> {
        validate_id(camera_id, "camera_id").map_err(EngineError::invalid)?;
        let config = self.config().await;
        let face = Self::face_from_detection(&config, Some(camera_id), detection)?;

        let Some(embedding) = face.embedding.clone() else {
            // nothing to compare on; always kept
            self.inner.store.insert_face(face.clone()).await?;
            return Ok(SaveOutcome::Saved(face));
        };

        match self
            .inner
            .save_dedup
            .check_and_register(&embedding, camera_id, now)
            .await?
        {
            CacheLookup::Hit(face_id) => {
                debug!(camera_id, face_id = %face_id, "suppressed duplicate save");
                Ok(SaveOutcome::Duplicate { face_id })
            }
            CacheLookup::Pending => Ok(SaveOutcome::InFlight),
            CacheLookup::Miss(ticket) => match self.inner.store.insert_face(face.clone()).await {
                Ok(()) => {
                    self.inner.save_dedup.complete(ticket, face.id.clone()).await;
                    Ok(SaveOutcome::Saved(face))
                }
                Err(e) => {
                    self.inner.save_dedup.abandon(ticket).await;
                    Err(e)
                }
            },
        }
    }

    pub async fn save_dedup_stats(&self) -> DedupStats {
        self.inner.save_dedup.stats().await
    }

    /// Forget recent saves for one camera, e.g. when it is stopped
    pub async fn clear_save_dedup(&self, camera_id: &str) {
        self.inner.save_dedup.clear_source(camera_id).await;
    }

    // ==== Clustering ====

    async fn active_clusters(&self) -> Result<Vec<Cluster>> {
        Ok(self
            .inner
            .store
            .list_clusters(None)
            .await?
            .into_iter()
            .filter(|c| c.status != ClusterStatus::Merged)
            .collect())
    }

    /// Assign every unclustered face in the store
    pub async fn cluster_unassigned(&self) -> Result<AssignmentReport> {
        let threshold = self.inner.config.read().await.clustering_threshold;
        let pool = self.inner.store.unclustered_faces().await?;
        let active = self.active_clusters().await?;
        Ok(self
            .inner
            .clusterer
            .assign_unclustered(&pool, &active, threshold)
            .await)
    }

    /// Single-face streaming path
    pub async fn assign_face(&self, face_id: &str) -> Result<AssignmentReport> {
        let face = self
            .inner
            .store
            .get_face(face_id)
            .await?
            .ok_or_else(|| EngineError::FaceNotFound(face_id.to_string()))?;
        if face.cluster_id.is_some() {
            return Ok(AssignmentReport::default());
        }
        let threshold = self.inner.config.read().await.clustering_threshold;
        let active = self.active_clusters().await?;
        Ok(self
            .inner
            .clusterer
            .assign_unclustered(std::slice::from_ref(&face), &active, threshold)
            .await)
    }

    pub async fn recompute_cluster(&self, cluster_id: &str) -> Result<Option<Cluster>> {
        self.inner.centroids.recompute(cluster_id).await
    }

    /// One greedy merge pass over pending clusters at the configured threshold
    pub async fn merge_similar_clusters(&self) -> Result<MergeReport> {
        let threshold = self.inner.config.read().await.merge_threshold;
        let pending = self
            .inner
            .store
            .list_clusters(Some(ClusterStatus::Pending))
            .await?;
        self.inner.merger.merge_similar(&pending, threshold).await
    }

    pub async fn merge_until_stable(&self, max_rounds: usize) -> Result<MergeReport> {
        let threshold = self.inner.config.read().await.merge_threshold;
        self.inner.merger.merge_until_stable(threshold, max_rounds).await
    }

    /// Offline grouping of the unclustered pool; nothing is persisted
    pub async fn group_unclustered(&self, method: GroupingMethod) -> Result<Vec<FaceGroup>> {
        let config = self.config().await;
        let inputs = GroupInput::from_faces(&self.inner.store.unclustered_faces().await?);
        group_inputs(&inputs, method, &config)
    }

    // ==== Recognition ====

    /// Centroids of every confirmed cluster linked to an identity
    pub async fn recognition_candidates(&self) -> Result<Vec<IdentityCandidate>> {
        let mut candidates = Vec::new();
        for link in self.inner.store.all_links().await? {
            let Some(cluster) = self.inner.store.get_cluster(&link.cluster_id).await? else {
                continue;
            };
            if cluster.status != ClusterStatus::Confirmed {
                continue;
            }
            if let Some(centroid) = cluster.centroid {
                candidates.push(IdentityCandidate {
                    identity_id: link.identity_id,
                    cluster_id: cluster.id,
                    centroid,
                });
            }
        }
        Ok(candidates)
    }

    pub async fn recognize(&self, embedding: &[f32]) -> Result<Recognition> {
        let threshold = self.inner.config.read().await.recognition_threshold;
        let candidates = self.recognition_candidates().await?;
        let result = recognizer::recognize(embedding, &candidates, threshold)?;
        FACE_ENGINE_RECOGNITIONS
            .with_label_values(&[if result.is_stranger { "stranger" } else { "identified" }])
            .inc();
        Ok(result)
    }

    /// Recognize and append the outcome to the recognition log
    pub async fn recognize_and_log(
        &self,
        request: RecognizeRequest,
    ) -> Result<(Recognition, RecognitionLog)> {
        let result = self.recognize(&request.embedding).await?;
        let log = self.log_recognition(&result, request).await?;
        Ok((result, log))
    }

    /// Append an already computed recognition to the log.
    /// The request's embedding is not consulted.
    pub async fn log_recognition(
        &self,
        result: &Recognition,
        request: RecognizeRequest,
    ) -> Result<RecognitionLog> {
        let log = RecognitionLog {
            id: common::generate_id(),
            face_id: request.face_id,
            matched_identity_id: result.identity_id.clone(),
            confidence: result.confidence,
            is_stranger: result.is_stranger,
            camera_id: request.camera_id,
            thumbnail_path: request.thumbnail_path,
            timestamp: Utc::now(),
        };
        self.inner.store.append_log(log.clone()).await?;

        match &result.identity_id {
            Some(identity_id) => info!(
                identity_id = %identity_id,
                confidence = result.confidence,
                camera_id = ?log.camera_id,
                "face recognized"
            ),
            None => debug!(camera_id = ?log.camera_id, "stranger"),
        }
        Ok(log)
    }

    pub async fn recognition_logs(&self, filter: &LogFilter) -> Result<Vec<RecognitionLog>> {
        let mut logs: Vec<RecognitionLog> = self
            .inner
            .store
            .list_logs()
            .await?
            .into_iter()
            .filter(|l| {
                filter
                    .camera_id
                    .as_ref()
                    .map_or(true, |c| l.camera_id.as_ref() == Some(c))
            })
            .filter(|l| {
                filter
                    .identity_id
                    .as_ref()
                    .map_or(true, |i| l.matched_identity_id.as_ref() == Some(i))
            })
            .filter(|l| filter.is_stranger.map_or(true, |s| l.is_stranger == s))
            .filter(|l| filter.since.map_or(true, |since| l.timestamp >= since))
            .collect();

        // stable, so equal timestamps stay newest-appended first after reverse
        logs.reverse();
        logs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(logs
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .collect())
    }

    pub async fn recognition_stats(&self, since: Option<DateTime<Utc>>) -> Result<RecognitionStats> {
        let mut stats = RecognitionStats::default();
        for log in self.inner.store.list_logs().await? {
            if since.is_some_and(|s| log.timestamp < s) {
                continue;
            }
            stats.total += 1;
            if log.is_stranger {
                stats.strangers += 1;
            } else {
                stats.identified += 1;
            }
        }
        Ok(stats)
    }

    pub async fn prune_recognition_logs(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let removed = self.inner.store.prune_logs(older_than).await?;
        if removed > 0 {
            info!(removed, "pruned recognition logs");
        }
        Ok(removed)
    }

    // ==== Search and stats ====

    /// Faces most similar to `face_id`, excluding itself
    pub async fn similar_faces(
        &self,
        face_id: &str,
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<SimilarFace>> {
        let face = self
            .inner
            .store
            .get_face(face_id)
            .await?
            .ok_or_else(|| EngineError::FaceNotFound(face_id.to_string()))?;
        let query = face
            .embedding
            .filter(|e| !e.is_empty())
            .ok_or_else(|| EngineError::MissingEmbedding(face_id.to_string()))?;

        let others: Vec<((FaceId, Option<ClusterId>), Vec<f32>)> = self
            .inner
            .store
            .all_faces()
            .await?
            .into_iter()
            .filter(|f| f.id != face_id && f.has_embedding())
            .filter_map(|f| f.embedding.map(|e| ((f.id, f.cluster_id), e)))
            .collect();

        Ok(find_similar(&query, &others, threshold, limit)?
            .into_iter()
            .map(|((id, cluster_id), similarity)| SimilarFace {
                face_id: id.clone(),
                cluster_id: cluster_id.clone(),
                similarity,
            })
            .collect())
    }

    pub async fn face_stats(&self) -> Result<FaceStats> {
        let mut stats = FaceStats::default();
        for face in self.inner.store.all_faces().await? {
            stats.total += 1;
            if face.cluster_id.is_some() {
                stats.clustered += 1;
            } else {
                stats.unclustered += 1;
            }
            if !face.has_embedding() {
                stats.without_embedding += 1;
            }
        }
        Ok(stats)
    }
}

/// Run an offline grouper with thresholds taken from `config`
pub fn group_inputs(
    inputs: &[GroupInput],
    method: GroupingMethod,
    config: &EngineConfig,
) -> Result<Vec<FaceGroup>> {
    let started = Instant::now();
    let groups = match method {
        GroupingMethod::Hierarchical => grouping::hierarchical(inputs, config.clustering_threshold)?,
        GroupingMethod::Dbscan => grouping::dbscan(
            inputs,
            1.0 - config.clustering_threshold,
            config.dbscan_min_points,
        )?,
    };
    FACE_ENGINE_OPERATION_DURATION
        .with_label_values(&["group"])
        .observe(started.elapsed().as_secs_f64());
    if inputs.len() > 1000 {
        warn!(faces = inputs.len(), "offline grouping is cubic in the number of faces");
    }
    info!(faces = inputs.len(), groups = groups.len(), method = ?method, "grouping complete");
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::BoundingBox;

    fn small_config() -> EngineConfig {
        EngineConfig {
            embedding_dim: 2,
            ..Default::default()
        }
    }

    fn detection(embedding: Option<Vec<f32>>) -> DetectedFace {
        DetectedFace {
            bbox: BoundingBox::default(),
            embedding,
            age: Some(30.0),
            gender: Default::default(),
            emotion: None,
            quality_score: 0.9,
            thumbnail_path: None,
        }
    }

    #[tokio::test]
    async fn test_register_detections_rejects_wrong_dimension() {
        let engine = FaceEngine::in_memory(small_config()).unwrap();
        let err = engine
            .register_detections(None, &[detection(Some(vec![1.0, 0.0])), detection(Some(vec![1.0]))])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DimensionMismatch { expected: 2, got: 1 }));
        assert_eq!(engine.face_stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_register_detections_normalizes_when_configured() {
        let engine = FaceEngine::in_memory(EngineConfig {
            normalize_embeddings: true,
            ..small_config()
        })
        .unwrap();
        let faces = engine
            .register_detections(Some("img-1"), &[detection(Some(vec![3.0, 4.0])), detection(None)])
            .await
            .unwrap();
        let e = faces[0].embedding.as_ref().unwrap();
        assert!((e[0] - 0.6).abs() < 1e-6);
        assert_eq!(faces[0].image_id.as_deref(), Some("img-1"));
        assert_eq!(faces[0].attributes.age, Some(30.0));
        assert!(faces[1].embedding.is_none());

        let stats = engine.face_stats().await.unwrap();
        assert_eq!(stats.unclustered, 2);
        assert_eq!(stats.without_embedding, 1);
    }

    #[tokio::test]
    async fn test_update_config_validates() {
        let engine = FaceEngine::in_memory(small_config()).unwrap();
        let mut bad = small_config();
        bad.merge_threshold = 2.0;
        assert!(engine.update_config(bad).await.is_err());

        let mut good = small_config();
        good.clustering_threshold = 0.8;
        engine.update_config(good).await.unwrap();
        assert_eq!(engine.config().await.clustering_threshold, 0.8);
    }

    #[tokio::test]
    async fn test_assign_face_single_item_path() {
        let engine = FaceEngine::in_memory(small_config()).unwrap();
        let faces = engine
            .register_detections(None, &[detection(Some(vec![1.0, 0.0])), detection(Some(vec![1.0, 0.1]))])
            .await
            .unwrap();

        let first = engine.assign_face(&faces[0].id).await.unwrap();
        assert_eq!(first.new_clusters.len(), 1);
        let second = engine.assign_face(&faces[1].id).await.unwrap();
        assert_eq!(second.updated_clusters, first.new_clusters);

        // already assigned
        assert!(engine.assign_face(&faces[1].id).await.unwrap().is_noop());
    }

    #[tokio::test]
    async fn test_similar_faces_excludes_self() {
        let engine = FaceEngine::in_memory(small_config()).unwrap();
        let faces = engine
            .register_detections(
                None,
                &[
                    detection(Some(vec![1.0, 0.0])),
                    detection(Some(vec![0.9, 0.1])),
                    detection(Some(vec![0.0, 1.0])),
                    detection(None),
                ],
            )
            .await
            .unwrap();

        let similar = engine.similar_faces(&faces[0].id, 0.5, 10).await.unwrap();
        assert_eq!(similar.len(), 1);
        assert_eq!(similar[0].face_id, faces[1].id);

        assert!(matches!(
            engine.similar_faces(&faces[3].id, 0.5, 10).await,
            Err(EngineError::MissingEmbedding(_))
        ));
    }

    #[tokio::test]
    async fn test_group_unclustered_is_transient() {
        let engine = FaceEngine::in_memory(small_config()).unwrap();
        engine
            .register_detections(
                None,
                &[
                    detection(Some(vec![1.0, 0.0])),
                    detection(Some(vec![0.0, 1.0])),
                    detection(Some(vec![1.0, 0.05])),
                ],
            )
            .await
            .unwrap();

        let groups = engine
            .group_unclustered(GroupingMethod::Hierarchical)
            .await
            .unwrap();
        assert_eq!(groups.len(), 2);
        assert!(engine.store().list_clusters(None).await.unwrap().is_empty());
    }
}
