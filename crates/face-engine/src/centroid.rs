use crate::error::Result;
use crate::store::ClusterStore;
use crate::vector::mean_vector;
use common::{Cluster, ClusterId};
use std::collections::HashMap;
use std::sync::Arc;
use telemetry::metrics::FACE_ENGINE_CLUSTERS;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

/// One async mutex per cluster id; every membership recomputation runs under it
#[derive(Clone, Default)]
pub struct ClusterLocks {
    locks: Arc<Mutex<HashMap<ClusterId, Arc<Mutex<()>>>>>,
}

impl ClusterLocks {
    pub async fn acquire(&self, cluster_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(cluster_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    async fn forget(&self, cluster_id: &str) {
        self.locks.lock().await.remove(cluster_id);
    }
}

/// Keeps a cluster's centroid, member count and representative in step with
/// the faces that point at it
#[derive(Clone)]
pub struct CentroidMaintainer {
    store: Arc<dyn ClusterStore>,
    locks: ClusterLocks,
}

impl CentroidMaintainer {
    pub fn new(store: Arc<dyn ClusterStore>) -> Self {
        Self {
            store,
            locks: ClusterLocks::default(),
        }
    }

    pub fn locks(&self) -> &ClusterLocks {
        &self.locks
    }

    /// Recompute from current membership.
    ///
    /// Returns the updated cluster, or `None` when it has no members with an
    /// embedding, in which case the record is deleted and any embedding-less
    /// stragglers are detached.
    pub async fn recompute(&self, cluster_id: &str) -> Result<Option<Cluster>> {
        let guard = self.locks.acquire(cluster_id).await;

        let members = self.store.faces_in_cluster(cluster_id).await?;
        let Some(mut cluster) = self.store.get_cluster(cluster_id).await? else {
            // the record vanished under us; members go back to the unassigned pool
            for face in &members {
                self.store.set_face_cluster(&face.id, None).await?;
            }
            debug!(cluster_id = %cluster_id, detached = members.len(), "recompute on missing cluster");
            return Ok(None);
        };

        let embeddings: Vec<&[f32]> = members
            .iter()
            .filter_map(|f| f.embedding.as_deref())
            .filter(|e| !e.is_empty())
            .collect();

        if embeddings.is_empty() {
            for face in &members {
                self.store.set_face_cluster(&face.id, None).await?;
            }
            self.store.delete_cluster(cluster_id).await?;
            drop(guard);
            self.locks.forget(cluster_id).await;
            FACE_ENGINE_CLUSTERS.with_label_values(&["deleted"]).inc();
            info!(cluster_id = %cluster_id, "deleted cluster with no usable members");
            return Ok(None);
        }

        cluster.centroid = Some(mean_vector(&embeddings)?);
        cluster.face_count = embeddings.len();

        let representative_is_member = cluster.representative_face_id.as_deref().is_some_and(|rep| {
            members
                .iter()
                .any(|f| f.id == rep && f.has_embedding())
        });
        if !representative_is_member {
            cluster.representative_face_id = members
                .iter()
                .find(|f| f.has_embedding())
                .map(|f| f.id.clone());
        }

        self.store.update_cluster(cluster.clone()).await?;
        debug!(
            cluster_id = %cluster_id,
            faces = cluster.face_count,
            "recomputed centroid"
        );
        Ok(Some(cluster))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryClusterStore;
    use common::Face;

    async fn seeded(embeddings: &[Option<Vec<f32>>]) -> (Arc<MemoryClusterStore>, Cluster) {
        let store = Arc::new(MemoryClusterStore::new());
        let cluster = Cluster::empty();
        store.insert_cluster(cluster.clone()).await.unwrap();
        for (i, embedding) in embeddings.iter().enumerate() {
            let mut face = Face::new(embedding.clone()).with_id(format!("f{i}"));
            face.cluster_id = Some(cluster.id.clone());
            store.insert_face(face).await.unwrap();
        }
        (store, cluster)
    }

    #[tokio::test]
    async fn test_centroid_is_member_mean() {
        let (store, cluster) = seeded(&[
            Some(vec![1.0, 2.0, 3.0]),
            Some(vec![3.0, 2.0, 1.0]),
            None,
        ])
        .await;
        let maintainer = CentroidMaintainer::new(store.clone());

        let updated = maintainer.recompute(&cluster.id).await.unwrap().unwrap();
        assert_eq!(updated.centroid, Some(vec![2.0, 2.0, 2.0]));
        assert_eq!(updated.face_count, 2);
        assert_eq!(updated.representative_face_id.as_deref(), Some("f0"));
        assert_eq!(store.get_cluster(&cluster.id).await.unwrap(), Some(updated));
    }

    #[tokio::test]
    async fn test_last_member_removed_deletes_cluster() {
        let (store, cluster) = seeded(&[Some(vec![1.0, 0.0])]).await;
        let maintainer = CentroidMaintainer::new(store.clone());

        store.set_face_cluster("f0", None).await.unwrap();
        assert!(maintainer.recompute(&cluster.id).await.unwrap().is_none());
        assert!(store.get_cluster(&cluster.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_embeddingless_members_are_detached() {
        let (store, cluster) = seeded(&[None]).await;
        let maintainer = CentroidMaintainer::new(store.clone());

        assert!(maintainer.recompute(&cluster.id).await.unwrap().is_none());
        let face = store.get_face("f0").await.unwrap().unwrap();
        assert!(face.cluster_id.is_none());
    }

    #[tokio::test]
    async fn test_stale_representative_replaced() {
        let (store, mut cluster) = seeded(&[Some(vec![1.0, 0.0]), Some(vec![0.0, 1.0])]).await;
        cluster.representative_face_id = Some("gone".to_string());
        store.update_cluster(cluster.clone()).await.unwrap();
        let maintainer = CentroidMaintainer::new(store.clone());

        let updated = maintainer.recompute(&cluster.id).await.unwrap().unwrap();
        assert_eq!(updated.representative_face_id.as_deref(), Some("f0"));

        cluster = updated;
        cluster.representative_face_id = Some("f1".to_string());
        store.update_cluster(cluster.clone()).await.unwrap();
        let updated = maintainer.recompute(&cluster.id).await.unwrap().unwrap();
        assert_eq!(updated.representative_face_id.as_deref(), Some("f1"));
    }

    #[tokio::test]
    async fn test_concurrent_recompute_keeps_count_consistent() {
        let (store, cluster) = seeded(&[Some(vec![1.0, 0.0])]).await;
        let maintainer = CentroidMaintainer::new(store.clone());

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            let maintainer = maintainer.clone();
            let cluster_id = cluster.id.clone();
            handles.push(tokio::spawn(async move {
                let face = Face::new(Some(vec![1.0, 0.0])).with_id(format!("extra{i}"));
                store.insert_face(face).await.unwrap();
                store
                    .set_face_cluster(&format!("extra{i}"), Some(&cluster_id))
                    .await
                    .unwrap();
                maintainer.recompute(&cluster_id).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let final_cluster = store.get_cluster(&cluster.id).await.unwrap().unwrap();
        assert_eq!(final_cluster.face_count, 17);
        assert_eq!(
            final_cluster.face_count,
            store.faces_in_cluster(&cluster.id).await.unwrap().len()
        );
    }
}
