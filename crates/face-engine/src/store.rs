use crate::error::{EngineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{
    Cluster, ClusterStatus, Face, Identity, IdentityCluster, RecognitionLog,
};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Persistence collaborator for faces, clusters, identities and recognition logs.
///
/// Listing operations return records in insertion order; batch clustering
/// depends on that order for tie-breaking.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn insert_face(&self, face: Face) -> Result<()>;
    async fn get_face(&self, face_id: &str) -> Result<Option<Face>>;
    async fn faces_in_cluster(&self, cluster_id: &str) -> Result<Vec<Face>>;
    async fn unclustered_faces(&self) -> Result<Vec<Face>>;
    async fn all_faces(&self) -> Result<Vec<Face>>;
    async fn set_face_cluster(&self, face_id: &str, cluster_id: Option<&str>) -> Result<()>;
    /// Point every face of `from` at `to`; returns how many moved
    async fn reassign_cluster_faces(&self, from: &str, to: &str) -> Result<usize>;

    async fn insert_cluster(&self, cluster: Cluster) -> Result<()>;
    async fn get_cluster(&self, cluster_id: &str) -> Result<Option<Cluster>>;
    async fn update_cluster(&self, cluster: Cluster) -> Result<()>;
    /// Removes the cluster and its identity links; returns whether it existed
    async fn delete_cluster(&self, cluster_id: &str) -> Result<bool>;
    async fn list_clusters(&self, status: Option<ClusterStatus>) -> Result<Vec<Cluster>>;

    async fn insert_identity(&self, identity: Identity) -> Result<()>;
    async fn get_identity(&self, identity_id: &str) -> Result<Option<Identity>>;
    async fn update_identity(&self, identity: Identity) -> Result<()>;
    /// Removes the identity and its cluster links; returns whether it existed
    async fn delete_identity(&self, identity_id: &str) -> Result<bool>;
    async fn list_identities(&self) -> Result<Vec<Identity>>;

    async fn link(&self, link: IdentityCluster) -> Result<()>;
    async fn unlink(&self, identity_id: &str, cluster_id: &str) -> Result<bool>;
    async fn links_for_identity(&self, identity_id: &str) -> Result<Vec<IdentityCluster>>;
    async fn links_for_cluster(&self, cluster_id: &str) -> Result<Vec<IdentityCluster>>;
    async fn all_links(&self) -> Result<Vec<IdentityCluster>>;

    async fn append_log(&self, log: RecognitionLog) -> Result<()>;
    async fn list_logs(&self) -> Result<Vec<RecognitionLog>>;
    /// Drops logs stamped before `before`; returns how many were removed
    async fn prune_logs(&self, before: DateTime<Utc>) -> Result<usize>;
}

/// Keyed rows that iterate in insertion order
struct Table<T> {
    order: Vec<String>,
    rows: HashMap<String, T>,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            rows: HashMap::new(),
        }
    }
}

impl<T: Clone> Table<T> {
    fn insert(&mut self, key: String, row: T) {
        if self.rows.insert(key.clone(), row).is_none() {
            self.order.push(key);
        }
    }

    fn get(&self, key: &str) -> Option<&T> {
        self.rows.get(key)
    }

    fn get_mut(&mut self, key: &str) -> Option<&mut T> {
        self.rows.get_mut(key)
    }

    fn remove(&mut self, key: &str) -> Option<T> {
        let row = self.rows.remove(key)?;
        self.order.retain(|k| k != key);
        Some(row)
    }

    fn iter(&self) -> impl Iterator<Item = &T> {
        self.order.iter().filter_map(|k| self.rows.get(k))
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.rows.values_mut()
    }

    fn filtered(&self, pred: impl Fn(&T) -> bool) -> Vec<T> {
        self.iter().filter(|row| pred(row)).cloned().collect()
    }
}

#[derive(Default)]
struct StoreInner {
    faces: Table<Face>,
    clusters: Table<Cluster>,
    identities: Table<Identity>,
    links: Vec<IdentityCluster>,
    logs: Vec<RecognitionLog>,
}

/// In-process store; state is lost on restart
#[derive(Default)]
pub struct MemoryClusterStore {
    inner: RwLock<StoreInner>,
}

impl MemoryClusterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClusterStore for MemoryClusterStore {
    async fn insert_face(&self, face: Face) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.faces.insert(face.id.clone(), face);
        Ok(())
    }

    async fn get_face(&self, face_id: &str) -> Result<Option<Face>> {
        let inner = self.inner.read().await;
        Ok(inner.faces.get(face_id).cloned())
    }

    async fn faces_in_cluster(&self, cluster_id: &str) -> Result<Vec<Face>> {
        let inner = self.inner.read().await;
        Ok(inner
            .faces
            .filtered(|f| f.cluster_id.as_deref() == Some(cluster_id)))
    }

    async fn unclustered_faces(&self) -> Result<Vec<Face>> {
        let inner = self.inner.read().await;
        Ok(inner.faces.filtered(|f| f.cluster_id.is_none()))
    }

    async fn all_faces(&self) -> Result<Vec<Face>> {
        let inner = self.inner.read().await;
        Ok(inner.faces.iter().cloned().collect())
    }

    async fn set_face_cluster(&self, face_id: &str, cluster_id: Option<&str>) -> Result<()> {
        let mut inner = self.inner.write().await;
        let face = inner
            .faces
            .get_mut(face_id)
            .ok_or_else(|| EngineError::FaceNotFound(face_id.to_string()))?;
        face.cluster_id = cluster_id.map(str::to_string);
        Ok(())
    }

    async fn reassign_cluster_faces(&self, from: &str, to: &str) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let mut moved = 0;
        for face in inner.faces.iter_mut() {
            if face.cluster_id.as_deref() == Some(from) {
                face.cluster_id = Some(to.to_string());
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn insert_cluster(&self, cluster: Cluster) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.clusters.insert(cluster.id.clone(), cluster);
        Ok(())
    }

    async fn get_cluster(&self, cluster_id: &str) -> Result<Option<Cluster>> {
        let inner = self.inner.read().await;
        Ok(inner.clusters.get(cluster_id).cloned())
    }

    async fn update_cluster(&self, cluster: Cluster) -> Result<()> {
        let mut inner = self.inner.write().await;
        let slot = inner
            .clusters
            .get_mut(&cluster.id)
            .ok_or_else(|| EngineError::ClusterNotFound(cluster.id.clone()))?;
        *slot = cluster;
        Ok(())
    }

    async fn delete_cluster(&self, cluster_id: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let existed = inner.clusters.remove(cluster_id).is_some();
        inner.links.retain(|l| l.cluster_id != cluster_id);
        Ok(existed)
    }

    async fn list_clusters(&self, status: Option<ClusterStatus>) -> Result<Vec<Cluster>> {
        let inner = self.inner.read().await;
        Ok(inner
            .clusters
            .filtered(|c| status.map_or(true, |s| c.status == s)))
    }

    async fn insert_identity(&self, identity: Identity) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.identities.insert(identity.id.clone(), identity);
        Ok(())
    }

    async fn get_identity(&self, identity_id: &str) -> Result<Option<Identity>> {
        let inner = self.inner.read().await;
        Ok(inner.identities.get(identity_id).cloned())
    }

    async fn update_identity(&self, identity: Identity) -> Result<()> {
        let mut inner = self.inner.write().await;
        let slot = inner
            .identities
            .get_mut(&identity.id)
            .ok_or_else(|| EngineError::IdentityNotFound(identity.id.clone()))?;
        *slot = identity;
        Ok(())
    }

    async fn delete_identity(&self, identity_id: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let existed = inner.identities.remove(identity_id).is_some();
        inner.links.retain(|l| l.identity_id != identity_id);
        Ok(existed)
    }

    async fn list_identities(&self) -> Result<Vec<Identity>> {
        let inner = self.inner.read().await;
        Ok(inner.identities.iter().cloned().collect())
    }

    async fn link(&self, link: IdentityCluster) -> Result<()> {
        let mut inner = self.inner.write().await;
        let exists = inner
            .links
            .iter()
            .any(|l| l.identity_id == link.identity_id && l.cluster_id == link.cluster_id);
        if !exists {
            inner.links.push(link);
        }
        Ok(())
    }

    async fn unlink(&self, identity_id: &str, cluster_id: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let before = inner.links.len();
        inner
            .links
            .retain(|l| !(l.identity_id == identity_id && l.cluster_id == cluster_id));
        Ok(inner.links.len() != before)
    }

    async fn links_for_identity(&self, identity_id: &str) -> Result<Vec<IdentityCluster>> {
        let inner = self.inner.read().await;
        Ok(inner
            .links
            .iter()
            .filter(|l| l.identity_id == identity_id)
            .cloned()
            .collect())
    }

    async fn links_for_cluster(&self, cluster_id: &str) -> Result<Vec<IdentityCluster>> {
        let inner = self.inner.read().await;
        Ok(inner
            .links
            .iter()
            .filter(|l| l.cluster_id == cluster_id)
            .cloned()
            .collect())
    }

    async fn all_links(&self) -> Result<Vec<IdentityCluster>> {
        let inner = self.inner.read().await;
        Ok(inner.links.clone())
    }

    async fn append_log(&self, log: RecognitionLog) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.logs.push(log);
        Ok(())
    }

    async fn list_logs(&self) -> Result<Vec<RecognitionLog>> {
        let inner = self.inner.read().await;
        Ok(inner.logs.clone())
    }

    async fn prune_logs(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let count = inner.logs.len();
        inner.logs.retain(|l| l.timestamp >= before);
        Ok(count - inner.logs.len())
    }
}

/// Memory store with switchable write failures and an insert hook
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    type Hook = Box<dyn Fn() + Send + Sync>;

    #[derive(Default)]
    pub(crate) struct FaultyStore {
        inner: MemoryClusterStore,
        pub(crate) fail_set_cluster: AtomicBool,
        pub(crate) fail_delete_cluster: AtomicBool,
        on_insert_face: Mutex<Option<Hook>>,
    }

    impl FaultyStore {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        /// Runs after every successful face insert
        pub(crate) fn on_insert_face(&self, hook: impl Fn() + Send + Sync + 'static) {
            *self.on_insert_face.lock().unwrap() = Some(Box::new(hook));
        }

        fn injected(flag: &AtomicBool, op: &str) -> Result<()> {
            if flag.load(Ordering::SeqCst) {
                return Err(EngineError::store(format!("{op} unavailable")));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ClusterStore for FaultyStore {
        async fn insert_face(&self, face: Face) -> Result<()> {
            self.inner.insert_face(face).await?;
            if let Some(hook) = self.on_insert_face.lock().unwrap().as_ref() {
                hook();
            }
            // let spawned work from the hook run
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Ok(())
        }
        async fn get_face(&self, face_id: &str) -> Result<Option<Face>> {
            self.inner.get_face(face_id).await
        }
        async fn faces_in_cluster(&self, cluster_id: &str) -> Result<Vec<Face>> {
            self.inner.faces_in_cluster(cluster_id).await
        }
        async fn unclustered_faces(&self) -> Result<Vec<Face>> {
            self.inner.unclustered_faces().await
        }
        async fn all_faces(&self) -> Result<Vec<Face>> {
            self.inner.all_faces().await
        }
        async fn set_face_cluster(&self, face_id: &str, cluster_id: Option<&str>) -> Result<()> {
            Self::injected(&self.fail_set_cluster, "set_face_cluster")?;
            self.inner.set_face_cluster(face_id, cluster_id).await
        }
        async fn reassign_cluster_faces(&self, from: &str, to: &str) -> Result<usize> {
            self.inner.reassign_cluster_faces(from, to).await
        }
        async fn insert_cluster(&self, cluster: Cluster) -> Result<()> {
            self.inner.insert_cluster(cluster).await
        }
        async fn get_cluster(&self, cluster_id: &str) -> Result<Option<Cluster>> {
            self.inner.get_cluster(cluster_id).await
        }
        async fn update_cluster(&self, cluster: Cluster) -> Result<()> {
            self.inner.update_cluster(cluster).await
        }
        async fn delete_cluster(&self, cluster_id: &str) -> Result<bool> {
            Self::injected(&self.fail_delete_cluster, "delete_cluster")?;
            self.inner.delete_cluster(cluster_id).await
        }
        async fn list_clusters(&self, status: Option<ClusterStatus>) -> Result<Vec<Cluster>> {
            self.inner.list_clusters(status).await
        }
        async fn insert_identity(&self, identity: Identity) -> Result<()> {
            self.inner.insert_identity(identity).await
        }
        async fn get_identity(&self, identity_id: &str) -> Result<Option<Identity>> {
            self.inner.get_identity(identity_id).await
        }
        async fn update_identity(&self, identity: Identity) -> Result<()> {
            self.inner.update_identity(identity).await
        }
        async fn delete_identity(&self, identity_id: &str) -> Result<bool> {
            self.inner.delete_identity(identity_id).await
        }
        async fn list_identities(&self) -> Result<Vec<Identity>> {
            self.inner.list_identities().await
        }
        async fn link(&self, link: IdentityCluster) -> Result<()> {
            self.inner.link(link).await
        }
        async fn unlink(&self, identity_id: &str, cluster_id: &str) -> Result<bool> {
            self.inner.unlink(identity_id, cluster_id).await
        }
        async fn links_for_identity(&self, identity_id: &str) -> Result<Vec<IdentityCluster>> {
            self.inner.links_for_identity(identity_id).await
        }
        async fn links_for_cluster(&self, cluster_id: &str) -> Result<Vec<IdentityCluster>> {
            self.inner.links_for_cluster(cluster_id).await
        }
        async fn all_links(&self) -> Result<Vec<IdentityCluster>> {
            self.inner.all_links().await
        }
        async fn append_log(&self, log: RecognitionLog) -> Result<()> {
            self.inner.append_log(log).await
        }
        async fn list_logs(&self) -> Result<Vec<RecognitionLog>> {
            self.inner.list_logs().await
        }
        async fn prune_logs(&self, before: DateTime<Utc>) -> Result<usize> {
            self.inner.prune_logs(before).await
        }
    }
}
