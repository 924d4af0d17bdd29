//! Operator-driven cluster edits.
//!
//! Every edit that changes membership ends with a recompute of each cluster
//! it touched, so centroids and counts never lag the faces.

use crate::error::{EngineError, Result};
use crate::grouping::FaceGroup;
use crate::state::FaceEngine;
use common::{Cluster, ClusterId, ClusterStatus, Face, FaceId, IdentityCluster};
use serde::Serialize;
use std::collections::HashSet;
use telemetry::metrics::FACE_ENGINE_CLUSTERS;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClusterStats {
    pub total: usize,
    pub pending: usize,
    pub confirmed: usize,
    pub merged: usize,
}

impl FaceEngine {
    pub async fn get_cluster(&self, cluster_id: &str) -> Result<Cluster> {
        self.inner
            .store
            .get_cluster(cluster_id)
            .await?
            .ok_or_else(|| EngineError::ClusterNotFound(cluster_id.to_string()))
    }

    pub async fn list_clusters(&self, status: Option<ClusterStatus>) -> Result<Vec<Cluster>> {
        self.inner.store.list_clusters(status).await
    }

    pub async fn cluster_faces(&self, cluster_id: &str) -> Result<Vec<Face>> {
        self.inner.store.faces_in_cluster(cluster_id).await
    }

    pub(crate) async fn set_status(&self, cluster_id: &str, status: ClusterStatus) -> Result<()> {
        let _guard = self.inner.centroids.locks().acquire(cluster_id).await;
        let mut cluster = self
            .inner
            .store
            .get_cluster(cluster_id)
            .await?
            .ok_or_else(|| EngineError::ClusterNotFound(cluster_id.to_string()))?;
        if cluster.status != status {
            cluster.status = status;
            self.inner.store.update_cluster(cluster).await?;
        }
        Ok(())
    }

    /// Faces that exist and carry an embedding, in the order given
    async fn embedded_faces(&self, face_ids: &[FaceId]) -> Result<Vec<Face>> {
        let mut faces = Vec::with_capacity(face_ids.len());
        for face_id in face_ids {
            let face = self
                .inner
                .store
                .get_face(face_id)
                .await?
                .ok_or_else(|| EngineError::FaceNotFound(face_id.clone()))?;
            if !face.has_embedding() {
                return Err(EngineError::MissingEmbedding(face_id.clone()));
            }
            faces.push(face);
        }
        Ok(faces)
    }

    /// New pending cluster from hand-picked faces, pulled out of whatever
    /// clusters they were in. The first face becomes the representative.
    pub async fn create_cluster(&self, face_ids: &[FaceId]) -> Result<Cluster> {
        if face_ids.is_empty() {
            return Err(EngineError::InvalidInput(
                "a cluster needs at least one face".to_string(),
            ));
        }
        let faces = self.embedded_faces(face_ids).await?;
        let sources: Vec<ClusterId> = distinct_clusters(&faces);

        let cluster = self.seed_cluster(&faces).await?;
        for source in sources {
            self.inner.centroids.recompute(&source).await?;
        }
        FACE_ENGINE_CLUSTERS.with_label_values(&["created"]).inc();
        info!(cluster_id = %cluster.id, faces = cluster.face_count, "cluster created");
        Ok(cluster)
    }

    async fn seed_cluster(&self, faces: &[Face]) -> Result<Cluster> {
        let mut cluster = Cluster::empty();
        cluster.representative_face_id = faces.first().map(|f| f.id.clone());
        self.inner.store.insert_cluster(cluster.clone()).await?;
        for face in faces {
            self.inner
                .store
                .set_face_cluster(&face.id, Some(&cluster.id))
                .await?;
        }
        self.inner
            .centroids
            .recompute(&cluster.id)
            .await?
            .ok_or_else(|| EngineError::EmptyCluster(cluster.id.clone()))
    }

    /// Persist offline groups as pending clusters
    pub async fn create_clusters_from_groups(&self, groups: &[FaceGroup]) -> Result<Vec<Cluster>> {
        let mut clusters = Vec::with_capacity(groups.len());
        for group in groups {
            clusters.push(self.create_cluster(&group.face_ids).await?);
        }
        Ok(clusters)
    }

    /// Fold several clusters into a new one.
    ///
    /// The sources are marked merged and keep their centroid for audit.
    /// Identity links on any source carry over to the new cluster, which is
    /// then confirmed.
    pub async fn merge_clusters(&self, cluster_ids: &[ClusterId]) -> Result<Cluster> {
        let unique: Vec<&ClusterId> = {
            let mut seen = HashSet::new();
            cluster_ids.iter().filter(|id| seen.insert(*id)).collect()
        };
        if unique.len() < 2 {
            return Err(EngineError::InvalidInput(
                "merging needs at least two clusters".to_string(),
            ));
        }

        let mut sources = Vec::with_capacity(unique.len());
        for id in &unique {
            let cluster = self.get_cluster(id).await?;
            if cluster.status == ClusterStatus::Merged {
                return Err(EngineError::InvalidInput(format!(
                    "cluster {id} has already been merged"
                )));
            }
            sources.push(cluster);
        }

        let mut target = Cluster::empty();
        target.representative_face_id = sources
            .iter()
            .find_map(|c| c.representative_face_id.clone());
        self.inner.store.insert_cluster(target.clone()).await?;

        let mut identity_ids = Vec::new();
        for source in sources {
            self.inner
                .store
                .reassign_cluster_faces(&source.id, &target.id)
                .await?;
            for link in self.inner.store.links_for_cluster(&source.id).await? {
                if !identity_ids.contains(&link.identity_id) {
                    identity_ids.push(link.identity_id);
                }
            }
            self.retire(source).await?;
        }

        for identity_id in &identity_ids {
            self.inner
                .store
                .link(IdentityCluster::new(identity_id, &target.id))
                .await?;
        }

        let mut merged = self
            .inner
            .centroids
            .recompute(&target.id)
            .await?
            .ok_or_else(|| EngineError::EmptyCluster(target.id.clone()))?;
        if !identity_ids.is_empty() {
            self.set_status(&merged.id, ClusterStatus::Confirmed).await?;
            merged.status = ClusterStatus::Confirmed;
        }

        FACE_ENGINE_CLUSTERS.with_label_values(&["merged"]).inc();
        info!(cluster_id = %merged.id, sources = unique.len(), faces = merged.face_count, "clusters merged by hand");
        Ok(merged)
    }

    /// Mark a cluster merged; it keeps its centroid but no longer counts faces
    async fn retire(&self, mut cluster: Cluster) -> Result<()> {
        let _guard = self.inner.centroids.locks().acquire(&cluster.id).await;
        cluster.status = ClusterStatus::Merged;
        cluster.face_count = 0;
        self.inner.store.update_cluster(cluster).await
    }

    /// Split a cluster into one new cluster per group.
    ///
    /// Every face in `groups` must belong to the cluster. Members named in
    /// no group are detached, and the source is retired as merged.
    pub async fn split_cluster(&self, cluster_id: &str, groups: &[Vec<FaceId>]) -> Result<Vec<Cluster>> {
        let source = self.get_cluster(cluster_id).await?;
        if source.status == ClusterStatus::Merged {
            return Err(EngineError::InvalidInput(format!(
                "cluster {cluster_id} has already been merged"
            )));
        }
        let groups: Vec<&Vec<FaceId>> = groups.iter().filter(|g| !g.is_empty()).collect();
        if groups.len() < 2 {
            return Err(EngineError::InvalidInput(
                "splitting needs at least two non-empty groups".to_string(),
            ));
        }

        let members: HashSet<FaceId> = self
            .inner
            .store
            .faces_in_cluster(cluster_id)
            .await?
            .into_iter()
            .map(|f| f.id)
            .collect();
        let mut claimed = HashSet::new();
        for face_id in groups.iter().flat_map(|g| g.iter()) {
            if !members.contains(face_id) {
                return Err(EngineError::InvalidInput(format!(
                    "face {face_id} is not in cluster {cluster_id}"
                )));
            }
            if !claimed.insert(face_id.clone()) {
                return Err(EngineError::InvalidInput(format!(
                    "face {face_id} appears in more than one group"
                )));
            }
        }

        // every group must load before anything is written
        let mut staged = Vec::with_capacity(groups.len());
        for group in groups {
            staged.push(self.embedded_faces(group).await?);
        }
        let mut created = Vec::with_capacity(staged.len());
        for faces in &staged {
            created.push(self.seed_cluster(faces).await?);
        }

        for face_id in members.difference(&claimed) {
            self.inner.store.set_face_cluster(face_id, None).await?;
        }
        self.retire(source).await?;

        FACE_ENGINE_CLUSTERS
            .with_label_values(&["created"])
            .inc_by(created.len() as u64);
        info!(cluster_id = %cluster_id, parts = created.len(), "cluster split");
        Ok(created)
    }

    /// Delete a cluster; its faces return to the unassigned pool
    pub async fn delete_cluster(&self, cluster_id: &str) -> Result<usize> {
        let _guard = self.inner.centroids.locks().acquire(cluster_id).await;
        if self.inner.store.get_cluster(cluster_id).await?.is_none() {
            return Err(EngineError::ClusterNotFound(cluster_id.to_string()));
        }
        let members = self.inner.store.faces_in_cluster(cluster_id).await?;
        for face in &members {
            self.inner.store.set_face_cluster(&face.id, None).await?;
        }
        self.inner.store.delete_cluster(cluster_id).await?;

        FACE_ENGINE_CLUSTERS.with_label_values(&["deleted"]).inc();
        info!(cluster_id = %cluster_id, detached = members.len(), "cluster deleted");
        Ok(members.len())
    }

    /// Move faces into `target_id`; returns how many changed cluster
    pub async fn move_faces(&self, face_ids: &[FaceId], target_id: &str) -> Result<usize> {
        let target = self.get_cluster(target_id).await?;
        if target.status == ClusterStatus::Merged {
            return Err(EngineError::InvalidInput(format!(
                "cluster {target_id} has been merged"
            )));
        }
        let faces = self.embedded_faces(face_ids).await?;
        let sources: Vec<ClusterId> = distinct_clusters(&faces)
            .into_iter()
            .filter(|id| id != target_id)
            .collect();

        let mut moved = 0;
        for face in &faces {
            if face.cluster_id.as_deref() != Some(target_id) {
                self.inner
                    .store
                    .set_face_cluster(&face.id, Some(target_id))
                    .await?;
                moved += 1;
            }
        }

        for source in &sources {
            self.inner.centroids.recompute(source).await?;
        }
        self.inner.centroids.recompute(target_id).await?;
        debug!(target = %target_id, moved, "faces moved");
        Ok(moved)
    }

    /// Detach a face; returns false when it had no cluster
    pub async fn remove_face_from_cluster(&self, face_id: &str) -> Result<bool> {
        let face = self
            .inner
            .store
            .get_face(face_id)
            .await?
            .ok_or_else(|| EngineError::FaceNotFound(face_id.to_string()))?;
        let Some(cluster_id) = face.cluster_id else {
            return Ok(false);
        };

        self.inner.store.set_face_cluster(face_id, None).await?;
        self.inner.centroids.recompute(&cluster_id).await?;
        Ok(true)
    }

    pub async fn set_representative_face(&self, cluster_id: &str, face_id: &str) -> Result<Cluster> {
        let _guard = self.inner.centroids.locks().acquire(cluster_id).await;
        let mut cluster = self
            .inner
            .store
            .get_cluster(cluster_id)
            .await?
            .ok_or_else(|| EngineError::ClusterNotFound(cluster_id.to_string()))?;
        let face = self
            .inner
            .store
            .get_face(face_id)
            .await?
            .ok_or_else(|| EngineError::FaceNotFound(face_id.to_string()))?;
        if face.cluster_id.as_deref() != Some(cluster_id) || !face.has_embedding() {
            return Err(EngineError::InvalidInput(format!(
                "face {face_id} is not an embedded member of cluster {cluster_id}"
            )));
        }

        cluster.representative_face_id = Some(face.id);
        self.inner.store.update_cluster(cluster.clone()).await?;
        Ok(cluster)
    }

    /// Recompute every cluster that is not merged; returns how many survived
    pub async fn recalculate_all_centroids(&self) -> Result<usize> {
        let mut updated = 0;
        for cluster in self.inner.store.list_clusters(None).await? {
            if cluster.status == ClusterStatus::Merged {
                continue;
            }
            if self.inner.centroids.recompute(&cluster.id).await?.is_some() {
                updated += 1;
            }
        }
        info!(updated, "recalculated centroids");
        Ok(updated)
    }

    pub async fn cluster_stats(&self) -> Result<ClusterStats> {
        let mut stats = ClusterStats::default();
        for cluster in self.inner.store.list_clusters(None).await? {
            stats.total += 1;
            match cluster.status {
                ClusterStatus::Pending => stats.pending += 1,
                ClusterStatus::Confirmed => stats.confirmed += 1,
                ClusterStatus::Merged => stats.merged += 1,
            }
        }
        Ok(stats)
    }
}

fn distinct_clusters(faces: &[Face]) -> Vec<ClusterId> {
    let mut ids: Vec<ClusterId> = Vec::new();
    for id in faces.iter().filter_map(|f| f.cluster_id.as_ref()) {
        if !ids.contains(id) {
            ids.push(id.clone());
        }
    }
    ids
}
