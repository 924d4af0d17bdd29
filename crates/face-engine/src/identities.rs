//! Identity records and their links to clusters.
//!
//! Linking is what turns a pending cluster into a confirmed one and makes its
//! centroid a recognition candidate.

use crate::error::{EngineError, Result};
use crate::state::FaceEngine;
use chrono::Utc;
use common::validation::{validate_description, validate_name};
use common::{Cluster, ClusterStatus, Face, Identity, IdentityCluster};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Partial identity update; `None` fields are left as they are
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub avatar_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IdentityStats {
    pub total: usize,
    pub with_clusters: usize,
    pub without_clusters: usize,
}

impl FaceEngine {
    pub async fn create_identity(&self, name: &str, description: Option<&str>) -> Result<Identity> {
        validate_name(name, "name").map_err(EngineError::invalid)?;
        validate_description(description).map_err(EngineError::invalid)?;

        let identity = Identity::new(name.trim(), description.map(str::to_string));
        self.inner.store.insert_identity(identity.clone()).await?;
        info!(identity_id = %identity.id, name = %identity.name, "identity created");
        Ok(identity)
    }

    pub async fn get_identity(&self, identity_id: &str) -> Result<Identity> {
        self.inner
            .store
            .get_identity(identity_id)
            .await?
            .ok_or_else(|| EngineError::IdentityNotFound(identity_id.to_string()))
    }

    pub async fn list_identities(&self) -> Result<Vec<Identity>> {
        self.inner.store.list_identities().await
    }

    pub async fn update_identity(&self, identity_id: &str, update: IdentityUpdate) -> Result<Identity> {
        let mut identity = self.get_identity(identity_id).await?;

        if let Some(name) = update.name {
            validate_name(&name, "name").map_err(EngineError::invalid)?;
            identity.name = name.trim().to_string();
        }
        if let Some(description) = update.description {
            validate_description(Some(&description)).map_err(EngineError::invalid)?;
            identity.description = Some(description);
        }
        if update.avatar_path.is_some() {
            identity.avatar_path = update.avatar_path;
        }
        identity.updated_at = Utc::now();

        self.inner.store.update_identity(identity.clone()).await?;
        Ok(identity)
    }

    /// Delete an identity; clusters left without any link go back to pending
    pub async fn delete_identity(&self, identity_id: &str) -> Result<bool> {
        let links = self.inner.store.links_for_identity(identity_id).await?;
        if !self.inner.store.delete_identity(identity_id).await? {
            return Ok(false);
        }
        for link in links {
            self.revert_if_unlinked(&link.cluster_id).await?;
        }
        info!(identity_id = %identity_id, "identity deleted");
        Ok(true)
    }

    /// Link a cluster to an identity and confirm it.
    ///
    /// A cluster without a centroid gets one computed first; one with no
    /// embedded members cannot be linked. Linking an existing pair is a no-op
    /// that returns the existing link.
    pub async fn link_cluster(&self, identity_id: &str, cluster_id: &str) -> Result<IdentityCluster> {
        self.get_identity(identity_id).await?;
        let cluster = self.get_cluster(cluster_id).await?;
        if cluster.status == ClusterStatus::Merged {
            return Err(EngineError::InvalidInput(format!(
                "cluster {cluster_id} has been merged"
            )));
        }
        if cluster.centroid.is_none()
            && self.inner.centroids.recompute(cluster_id).await?.is_none()
        {
            return Err(EngineError::EmptyCluster(cluster_id.to_string()));
        }

        if let Some(existing) = self
            .inner
            .store
            .links_for_cluster(cluster_id)
            .await?
            .into_iter()
            .find(|l| l.identity_id == identity_id)
        {
            return Ok(existing);
        }

        let link = IdentityCluster::new(identity_id, cluster_id);
        self.inner.store.link(link.clone()).await?;
        self.set_status(cluster_id, ClusterStatus::Confirmed).await?;
        info!(identity_id = %identity_id, cluster_id = %cluster_id, "cluster linked");
        Ok(link)
    }

    /// Remove one link; the cluster returns to pending once nothing links it
    pub async fn unlink_cluster(&self, identity_id: &str, cluster_id: &str) -> Result<bool> {
        if !self.inner.store.unlink(identity_id, cluster_id).await? {
            return Ok(false);
        }
        self.revert_if_unlinked(cluster_id).await?;
        info!(identity_id = %identity_id, cluster_id = %cluster_id, "cluster unlinked");
        Ok(true)
    }

    pub async fn link_clusters(
        &self,
        identity_id: &str,
        cluster_ids: &[String],
    ) -> Result<Vec<IdentityCluster>> {
        let mut links = Vec::with_capacity(cluster_ids.len());
        for cluster_id in cluster_ids {
            links.push(self.link_cluster(identity_id, cluster_id).await?);
        }
        Ok(links)
    }

    /// Create an identity and link it to `cluster_ids` in one call.
    ///
    /// Clusters are checked before the identity is written, so an unknown id
    /// leaves nothing behind.
    pub async fn create_identity_with_clusters(
        &self,
        name: &str,
        description: Option<&str>,
        cluster_ids: &[String],
    ) -> Result<Identity> {
        for cluster_id in cluster_ids {
            self.get_cluster(cluster_id).await?;
        }
        let identity = self.create_identity(name, description).await?;
        self.link_clusters(&identity.id, cluster_ids).await?;
        Ok(identity)
    }

    pub async fn identity_clusters(&self, identity_id: &str) -> Result<Vec<Cluster>> {
        let mut clusters = Vec::new();
        for link in self.inner.store.links_for_identity(identity_id).await? {
            if let Some(cluster) = self.inner.store.get_cluster(&link.cluster_id).await? {
                clusters.push(cluster);
            }
        }
        Ok(clusters)
    }

    /// Every face in every cluster linked to the identity
    pub async fn identity_faces(&self, identity_id: &str) -> Result<Vec<Face>> {
        let mut faces = Vec::new();
        for link in self.inner.store.links_for_identity(identity_id).await? {
            faces.extend(self.inner.store.faces_in_cluster(&link.cluster_id).await?);
        }
        Ok(faces)
    }

    pub async fn identity_stats(&self) -> Result<IdentityStats> {
        let identities = self.inner.store.list_identities().await?;
        let links = self.inner.store.all_links().await?;

        let with_clusters = identities
            .iter()
            .filter(|i| links.iter().any(|l| l.identity_id == i.id))
            .count();
        Ok(IdentityStats {
            total: identities.len(),
            with_clusters,
            without_clusters: identities.len() - with_clusters,
        })
    }

    async fn revert_if_unlinked(&self, cluster_id: &str) -> Result<()> {
        if !self.inner.store.links_for_cluster(cluster_id).await?.is_empty() {
            return Ok(());
        }
        let _guard = self.inner.centroids.locks().acquire(cluster_id).await;
        if let Some(mut cluster) = self.inner.store.get_cluster(cluster_id).await? {
            if cluster.status == ClusterStatus::Confirmed {
                cluster.status = ClusterStatus::Pending;
                self.inner.store.update_cluster(cluster).await?;
            }
        }
        Ok(())
    }
}
