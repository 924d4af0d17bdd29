use crate::centroid::CentroidMaintainer;
use crate::error::Result;
use crate::store::ClusterStore;
use crate::vector::find_most_similar;
use common::{Cluster, ClusterId, ClusterStatus, Face, FaceId};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use telemetry::metrics::{
    FACE_ENGINE_CLUSTERS, FACE_ENGINE_FACES_ASSIGNED, FACE_ENGINE_OPERATION_DURATION,
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceAssignment {
    pub face_id: FaceId,
    pub cluster_id: ClusterId,
    /// Similarity to the matched centroid; `None` when the face seeded a new cluster
    pub similarity: Option<f32>,
}

impl FaceAssignment {
    pub fn created_cluster(&self) -> bool {
        self.similarity.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssignmentFailure {
    pub face_id: FaceId,
    pub error: String,
}

/// Outcome of one assignment pass, in pool order
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AssignmentReport {
    pub assignments: Vec<FaceAssignment>,
    /// Clusters created during this pass
    pub new_clusters: Vec<ClusterId>,
    /// Clusters that existed before this pass and received at least one face
    pub updated_clusters: Vec<ClusterId>,
    pub skipped_faces: Vec<FaceId>,
    pub failures: Vec<AssignmentFailure>,
}

impl AssignmentReport {
    pub fn assigned_count(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_noop(&self) -> bool {
        self.assignments.is_empty() && self.failures.is_empty()
    }
}

/// Best-match-or-new-cluster assignment over a pool of unassigned faces
#[derive(Clone)]
pub struct BatchClusterer {
    store: Arc<dyn ClusterStore>,
    centroids: CentroidMaintainer,
}

impl BatchClusterer {
    pub fn new(store: Arc<dyn ClusterStore>, centroids: CentroidMaintainer) -> Self {
        Self { store, centroids }
    }

    /// Assign every face in `pool`, in order.
    ///
    /// A face joins the most similar active cluster whose centroid scores at
    /// least `threshold` (first of equal scores wins), otherwise it seeds a new
    /// pending cluster that later faces in the same pool can join. Faces
    /// without an embedding are skipped. A failing face is reported and the
    /// pass carries on.
    pub async fn assign_unclustered(
        &self,
        pool: &[Face],
        active_clusters: &[Cluster],
        threshold: f32,
    ) -> AssignmentReport {
        let started = Instant::now();
        let mut report = AssignmentReport::default();

        let mut candidates: Vec<(ClusterId, Vec<f32>)> = active_clusters
            .iter()
            .filter(|c| c.status != ClusterStatus::Merged)
            .filter_map(|c| c.centroid.clone().map(|centroid| (c.id.clone(), centroid)))
            .collect();
        let preexisting: HashSet<ClusterId> = candidates.iter().map(|(id, _)| id.clone()).collect();
        let mut updated: HashSet<ClusterId> = HashSet::new();

        for face in pool {
            let Some(embedding) = face.embedding.as_deref().filter(|e| !e.is_empty()) else {
                FACE_ENGINE_FACES_ASSIGNED.with_label_values(&["skipped"]).inc();
                report.skipped_faces.push(face.id.clone());
                continue;
            };

            match self.assign_one(face, embedding, &mut candidates, threshold).await {
                Ok(assignment) => {
                    if assignment.created_cluster() {
                        FACE_ENGINE_FACES_ASSIGNED.with_label_values(&["new_cluster"]).inc();
                        report.new_clusters.push(assignment.cluster_id.clone());
                    } else {
                        FACE_ENGINE_FACES_ASSIGNED.with_label_values(&["matched"]).inc();
                        if preexisting.contains(&assignment.cluster_id)
                            && updated.insert(assignment.cluster_id.clone())
                        {
                            report.updated_clusters.push(assignment.cluster_id.clone());
                        }
                    }
                    report.assignments.push(assignment);
                }
                Err(e) => {
                    FACE_ENGINE_FACES_ASSIGNED.with_label_values(&["failed"]).inc();
                    warn!(face_id = %face.id, error = %e, "face assignment failed");
                    report.failures.push(AssignmentFailure {
                        face_id: face.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        FACE_ENGINE_OPERATION_DURATION
            .with_label_values(&["assign"])
            .observe(started.elapsed().as_secs_f64());
        if !report.is_noop() {
            info!(
                assigned = report.assigned_count(),
                new_clusters = report.new_clusters.len(),
                updated_clusters = report.updated_clusters.len(),
                skipped = report.skipped_faces.len(),
                failed = report.failures.len(),
                "assignment pass complete"
            );
        }
        report
    }

    async fn assign_one(
        &self,
        face: &Face,
        embedding: &[f32],
        candidates: &mut Vec<(ClusterId, Vec<f32>)>,
        threshold: f32,
    ) -> Result<FaceAssignment> {
        let best = find_most_similar(embedding, candidates.as_slice(), threshold)?
            .map(|(id, sim)| (id.clone(), sim));

        if let Some((cluster_id, similarity)) = best {
            self.store.set_face_cluster(&face.id, Some(&cluster_id)).await?;
            let refreshed = self.centroids.recompute(&cluster_id).await?;

            // later faces in this pass compare against the refreshed centroid
            match refreshed.and_then(|c| c.centroid) {
                Some(centroid) => {
                    if let Some(slot) = candidates.iter_mut().find(|(id, _)| *id == cluster_id) {
                        slot.1 = centroid;
                    }
                }
                None => candidates.retain(|(id, _)| *id != cluster_id),
            }

            debug!(face_id = %face.id, cluster_id = %cluster_id, similarity, "face matched cluster");
            return Ok(FaceAssignment {
                face_id: face.id.clone(),
                cluster_id,
                similarity: Some(similarity),
            });
        }

        let cluster = Cluster::singleton(&face.id, embedding.to_vec());
        let cluster_id = cluster.id.clone();
        self.store.insert_cluster(cluster).await?;
        if let Err(e) = self.store.set_face_cluster(&face.id, Some(&cluster_id)).await {
            // drop the orphan; the assignment error is the one reported
            if let Err(cleanup) = self.store.delete_cluster(&cluster_id).await {
                warn!(
                    face_id = %face.id,
                    cluster_id = %cluster_id,
                    error = %cleanup,
                    "failed to drop orphan cluster"
                );
            }
            return Err(e);
        }
        candidates.push((cluster_id.clone(), embedding.to_vec()));

        FACE_ENGINE_CLUSTERS.with_label_values(&["created"]).inc();
        debug!(face_id = %face.id, cluster_id = %cluster_id, "face seeded new cluster");
        Ok(FaceAssignment {
            face_id: face.id.clone(),
            cluster_id,
            similarity: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::FaultyStore;
    use crate::store::MemoryClusterStore;
    use std::sync::atomic::Ordering;

    struct Fixture {
        store: Arc<MemoryClusterStore>,
        clusterer: BatchClusterer,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryClusterStore::new());
        let centroids = CentroidMaintainer::new(store.clone());
        Fixture {
            clusterer: BatchClusterer::new(store.clone(), centroids),
            store,
        }
    }

    async fn add_faces(store: &MemoryClusterStore, embeddings: Vec<Option<Vec<f32>>>) -> Vec<Face> {
        let mut faces = Vec::new();
        for (i, embedding) in embeddings.into_iter().enumerate() {
            let face = Face::new(embedding).with_id(format!("f{i}"));
            store.insert_face(face.clone()).await.unwrap();
            faces.push(face);
        }
        faces
    }

    #[tokio::test]
    async fn test_new_clusters_are_eligible_within_the_batch() {
        let fx = fixture();
        let pool = add_faces(
            &fx.store,
            (0..5).map(|i| Some(vec![1.0, 0.1 * i as f32, 0.0])).collect(),
        )
        .await;

        let report = fx.clusterer.assign_unclustered(&pool, &[], 0.5).await;
        assert_eq!(report.new_clusters.len(), 1);
        assert!(report.updated_clusters.is_empty());
        assert_eq!(report.assigned_count(), 5);

        let cluster = fx
            .store
            .get_cluster(&report.new_clusters[0])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cluster.face_count, 5);
    }

    #[tokio::test]
    async fn test_faces_without_embeddings_are_skipped() {
        let fx = fixture();
        let pool = add_faces(&fx.store, vec![None, Some(vec![1.0, 0.0]), Some(vec![])]).await;

        let report = fx.clusterer.assign_unclustered(&pool, &[], 0.5).await;
        assert_eq!(report.skipped_faces, vec!["f0", "f2"]);
        assert_eq!(report.new_clusters.len(), 1);
        assert!(fx.store.get_face("f0").await.unwrap().unwrap().cluster_id.is_none());
    }

    #[tokio::test]
    async fn test_tie_goes_to_first_cluster() {
        let fx = fixture();
        let first = Cluster::singleton("seed-a", vec![1.0, 0.0]);
        let second = Cluster::singleton("seed-b", vec![2.0, 0.0]);
        for c in [&first, &second] {
            fx.store.insert_cluster(c.clone()).await.unwrap();
        }
        let pool = add_faces(&fx.store, vec![Some(vec![1.0, 0.0])]).await;

        let report = fx
            .clusterer
            .assign_unclustered(&pool, &[first.clone(), second], 0.5)
            .await;
        assert_eq!(report.assignments[0].cluster_id, first.id);
        assert_eq!(report.updated_clusters, vec![first.id]);
    }

    #[tokio::test]
    async fn test_merged_clusters_are_not_candidates() {
        let fx = fixture();
        let mut merged = Cluster::singleton("old", vec![1.0, 0.0]);
        merged.status = ClusterStatus::Merged;
        fx.store.insert_cluster(merged.clone()).await.unwrap();
        let pool = add_faces(&fx.store, vec![Some(vec![1.0, 0.0])]).await;

        let report = fx.clusterer.assign_unclustered(&pool, &[merged.clone()], 0.5).await;
        assert_eq!(report.new_clusters.len(), 1);
        assert_ne!(report.assignments[0].cluster_id, merged.id);
    }

    #[tokio::test]
    async fn test_failure_is_reported_and_batch_continues() {
        let fx = fixture();
        let mut pool = add_faces(&fx.store, vec![Some(vec![1.0, 0.0])]).await;
        // never persisted, so setting its cluster fails
        pool.insert(0, Face::new(Some(vec![0.0, 1.0])).with_id("ghost"));

        let report = fx.clusterer.assign_unclustered(&pool, &[], 0.5).await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].face_id, "ghost");
        assert_eq!(report.assigned_count(), 1);
        assert_eq!(fx.store.list_clusters(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_seed_failure_drops_orphan_cluster() {
        let store = Arc::new(FaultyStore::new());
        let clusterer = BatchClusterer::new(store.clone(), CentroidMaintainer::new(store.clone()));
        let face = Face::new(Some(vec![1.0, 0.0])).with_id("f0");
        store.insert_face(face.clone()).await.unwrap();
        store.fail_set_cluster.store(true, Ordering::SeqCst);

        let report = clusterer.assign_unclustered(&[face.clone()], &[], 0.5).await;
        assert_eq!(report.failures.len(), 1);
        assert!(report.new_clusters.is_empty());
        assert!(store.list_clusters(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_orphan_cleanup_keeps_assignment_error() {
        let store = Arc::new(FaultyStore::new());
        let clusterer = BatchClusterer::new(store.clone(), CentroidMaintainer::new(store.clone()));
        let face = Face::new(Some(vec![1.0, 0.0])).with_id("f0");
        store.insert_face(face.clone()).await.unwrap();
        store.fail_set_cluster.store(true, Ordering::SeqCst);
        store.fail_delete_cluster.store(true, Ordering::SeqCst);

        let report = clusterer.assign_unclustered(&[face], &[], 0.5).await;
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].error.contains("set_face_cluster"));
        // the orphan survives but is never reported as a new cluster
        assert!(report.new_clusters.is_empty());
        assert_eq!(store.list_clusters(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_pool_is_noop() {
        let fx = fixture();
        let report = fx.clusterer.assign_unclustered(&[], &[], 0.5).await;
        assert!(report.is_noop());
        assert!(report.new_clusters.is_empty());
        assert!(report.updated_clusters.is_empty());
    }
}
