//! Per-camera streaming pipeline.
//!
//! A session turns frames into detections, suppresses repeats through its
//! recognition cache and the engine's save cache, persists and assigns new
//! faces, and logs a recognition for every fresh appearance.

use crate::dedup::{CacheLookup, DedupCache, DedupStats, Ticket};
use crate::embedder::{Embedder, Frame};
use crate::error::{EngineError, Result};
use crate::recognizer::Recognition;
use crate::state::{FaceEngine, RecognizeRequest, SaveOutcome};
use chrono::{DateTime, Utc};
use common::validation::validate_id;
use common::{DetectedFace, FaceId};
use serde::Serialize;
use std::sync::Arc;
use telemetry::metrics::FACE_ENGINE_ACTIVE_SESSIONS;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What happened to one detection
#[derive(Debug, Clone, PartialEq)]
pub enum DetectionOutcome {
    /// Fresh appearance: recognized and logged
    Processed {
        /// `None` when the save was still in flight elsewhere
        face_id: Option<FaceId>,
        /// Whether a new face record was written
        saved: bool,
        recognition: Recognition,
    },
    /// Seen within the recognition window; the earlier result is reused
    Cached(Recognition),
    /// A similar detection from this camera is still being processed
    InFlight,
    /// No embedding to work with
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub frames: u64,
    pub detections: u64,
    pub processed: u64,
    pub saved: u64,
    pub cached: u64,
    pub skipped: u64,
    pub errors: u64,
}

#[derive(Clone)]
pub struct CameraSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    camera_id: String,
    engine: FaceEngine,
    recognition_cache: DedupCache<Recognition>,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
    stats: RwLock<SessionStats>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if !self.cancel.is_cancelled() {
            self.cancel.cancel();
            FACE_ENGINE_ACTIVE_SESSIONS.dec();
        }
    }
}

impl FaceEngine {
    /// Open a streaming session for one camera
    pub async fn start_session(&self, camera_id: &str) -> Result<CameraSession> {
        validate_id(camera_id, "camera_id").map_err(EngineError::invalid)?;
        let settings = self.config().await.recognition_cache;

        FACE_ENGINE_ACTIVE_SESSIONS.inc();
        info!(camera_id, "camera session started");
        Ok(CameraSession {
            inner: Arc::new(SessionInner {
                camera_id: camera_id.to_string(),
                engine: self.clone(),
                recognition_cache: DedupCache::new("recognition", settings),
                cancel: CancellationToken::new(),
                started_at: Utc::now(),
                stats: RwLock::new(SessionStats::default()),
            }),
        })
    }
}

impl CameraSession {
    pub fn camera_id(&self) -> &str {
        &self.inner.camera_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub async fn stats(&self) -> SessionStats {
        self.inner.stats.read().await.clone()
    }

    pub async fn cache_stats(&self) -> DedupStats {
        self.inner.recognition_cache.stats().await
    }

    /// Stop the session and forget this camera's recent observations.
    /// Work already past its last cancellation check still completes.
    pub async fn stop(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();
        FACE_ENGINE_ACTIVE_SESSIONS.dec();

        self.inner.recognition_cache.clear().await;
        self.inner.engine.clear_save_dedup(&self.inner.camera_id).await;

        let stats = self.stats().await;
        info!(
            camera_id = %self.inner.camera_id,
            frames = stats.frames,
            processed = stats.processed,
            errors = stats.errors,
            "camera session stopped"
        );
    }

    /// Handle one detection observed at `now`
    pub async fn process_detection(
        &self,
        detection: &DetectedFace,
        now: DateTime<Utc>,
    ) -> Result<DetectionOutcome> {
        self.ensure_running()?;

        let Some(embedding) = detection.embedding.as_deref().filter(|e| !e.is_empty()) else {
            self.bump(|s| s.skipped += 1).await;
            return Ok(DetectionOutcome::Skipped);
        };

        self.sync_cache_settings().await;
        let ticket = match self
            .inner
            .recognition_cache
            .check_and_register(embedding, &self.inner.camera_id, now)
            .await?
        {
            CacheLookup::Hit(recognition) => {
                self.bump(|s| s.cached += 1).await;
                return Ok(DetectionOutcome::Cached(recognition));
            }
            CacheLookup::Pending => return Ok(DetectionOutcome::InFlight),
            CacheLookup::Miss(ticket) => ticket,
        };

        match self.recognize_fresh(detection, embedding, now).await {
            Ok((face_id, saved, recognition)) => {
                self.inner
                    .recognition_cache
                    .complete(ticket, recognition.clone())
                    .await;
                self.bump(|s| {
                    s.processed += 1;
                    if saved {
                        s.saved += 1;
                    }
                })
                .await;
                Ok(DetectionOutcome::Processed {
                    face_id,
                    saved,
                    recognition,
                })
            }
            Err(e) => {
                self.abandon(ticket).await;
                Err(e)
            }
        }
    }

    /// Recognition is scored before this face is saved and assigned, so a
    /// face never counts toward the centroid it is matched against.
    async fn recognize_fresh(
        &self,
        detection: &DetectedFace,
        embedding: &[f32],
        now: DateTime<Utc>,
    ) -> Result<(Option<FaceId>, bool, Recognition)> {
        // nothing is written once the session is stopped
        self.ensure_running()?;

        let engine = &self.inner.engine;
        let recognition = engine.recognize(embedding).await?;

        self.ensure_running()?;
        let (face_id, saved) = match engine
            .save_camera_detection(&self.inner.camera_id, detection, now)
            .await?
        {
            SaveOutcome::Saved(face) => {
                engine.assign_face(&face.id).await?;
                (Some(face.id), true)
            }
            SaveOutcome::Duplicate { face_id } => (Some(face_id), false),
            SaveOutcome::InFlight => (None, false),
        };

        // a stop that landed while saving leaves the face but no log entry
        self.ensure_running()?;
        engine
            .log_recognition(
                &recognition,
                RecognizeRequest {
                    face_id: face_id.clone(),
                    camera_id: Some(self.inner.camera_id.clone()),
                    thumbnail_path: detection.thumbnail_path.clone(),
                    ..Default::default()
                },
            )
            .await?;
        Ok((face_id, saved, recognition))
    }

    /// Pick up recognition cache settings changed through `update_config`
    async fn sync_cache_settings(&self) {
        let settings = self.inner.engine.inner.config.read().await.recognition_cache;
        if self.inner.recognition_cache.settings().await != settings {
            debug!(camera_id = %self.inner.camera_id, "recognition cache settings updated");
            self.inner.recognition_cache.set_settings(settings).await;
        }
    }

    async fn abandon(&self, ticket: Ticket) {
        self.inner.recognition_cache.abandon(ticket).await;
        self.bump(|s| s.errors += 1).await;
    }

    /// Detect and process every face in one frame; per-face errors are logged
    pub async fn process_frame(&self, embedder: &dyn Embedder, frame: &Frame) -> Result<Vec<DetectionOutcome>> {
        self.ensure_running()?;
        self.bump(|s| s.frames += 1).await;

        let detections = match embedder.detect(frame).await {
            Ok(d) => d,
            Err(e) => {
                self.bump(|s| s.errors += 1).await;
                warn!(
                    camera_id = %self.inner.camera_id,
                    sequence = frame.sequence,
                    embedder = embedder.id(),
                    error = %e,
                    "detection failed"
                );
                return Ok(Vec::new());
            }
        };
        self.bump(|s| s.detections += detections.len() as u64).await;

        let mut outcomes = Vec::with_capacity(detections.len());
        for detection in &detections {
            match self.process_detection(detection, frame.timestamp).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(EngineError::SessionStopped(_)) => break,
                Err(e) => warn!(
                    camera_id = %self.inner.camera_id,
                    sequence = frame.sequence,
                    error = %e,
                    "detection processing failed"
                ),
            }
        }
        debug!(
            camera_id = %self.inner.camera_id,
            sequence = frame.sequence,
            faces = outcomes.len(),
            "frame processed"
        );
        Ok(outcomes)
    }

    /// Consume frames until the channel closes or the session is stopped
    pub async fn run(&self, embedder: Arc<dyn Embedder>, mut frames: mpsc::Receiver<Frame>) -> SessionStats {
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => {
                    debug!(camera_id = %self.inner.camera_id, "session loop cancelled");
                    break;
                }
                frame = frames.recv() => {
                    let Some(frame) = frame else {
                        info!(camera_id = %self.inner.camera_id, "frame source closed");
                        break;
                    };
                    if let Err(e) = self.process_frame(embedder.as_ref(), &frame).await {
                        if matches!(e, EngineError::SessionStopped(_)) {
                            break;
                        }
                        error!(camera_id = %self.inner.camera_id, error = %e, "frame failed");
                    }
                }
            }
        }
        self.stats().await
    }

    /// Run the frame loop on its own task
    pub fn spawn(&self, embedder: Arc<dyn Embedder>, frames: mpsc::Receiver<Frame>) -> JoinHandle<SessionStats> {
        let session = self.clone();
        tokio::spawn(async move { session.run(embedder, frames).await })
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(EngineError::SessionStopped(self.inner.camera_id.clone()));
        }
        Ok(())
    }

    async fn bump(&self, f: impl FnOnce(&mut SessionStats)) {
        f(&mut *self.inner.stats.write().await);
    }
}
