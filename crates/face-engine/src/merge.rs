use crate::centroid::CentroidMaintainer;
use crate::error::{EngineError, Result};
use crate::store::ClusterStore;
use crate::vector::cosine_similarity;
use common::{Cluster, ClusterId, ClusterStatus};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use telemetry::metrics::{FACE_ENGINE_CLUSTERS, FACE_ENGINE_OPERATION_DURATION};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergePair {
    pub keep: ClusterId,
    pub merged: ClusterId,
    pub similarity: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeFailure {
    pub keep: ClusterId,
    pub merged: ClusterId,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergeReport {
    pub merged_pairs: Vec<MergePair>,
    pub failures: Vec<MergeFailure>,
    /// Detection passes run; always 1 for a single pass
    pub rounds: usize,
}

impl MergeReport {
    pub fn merged_count(&self) -> usize {
        self.merged_pairs.len()
    }
}

/// Merges pending clusters whose centroids are near-duplicates
#[derive(Clone)]
pub struct ClusterMerger {
    store: Arc<dyn ClusterStore>,
    centroids: CentroidMaintainer,
}

impl ClusterMerger {
    pub fn new(store: Arc<dyn ClusterStore>, centroids: CentroidMaintainer) -> Self {
        Self { store, centroids }
    }

    /// Single greedy pass over `pending`.
    ///
    /// Pairs are found first, comparing the centroids as passed in, then
    /// applied in order: the later cluster's faces move to the earlier one,
    /// the later one is marked merged, and the keeper is recomputed. A cluster
    /// already merged away is never a merge target again, but it can still be
    /// the keeper of a later pair, so the result is not transitive. Use
    /// [`ClusterMerger::merge_until_stable`] when that matters.
    pub async fn merge_similar(&self, pending: &[Cluster], threshold: f32) -> Result<MergeReport> {
        let started = Instant::now();
        let pairs = find_pairs(pending, threshold, false)?;
        let mut report = self.apply(pairs).await;
        report.rounds = 1;

        FACE_ENGINE_OPERATION_DURATION
            .with_label_values(&["merge"])
            .observe(started.elapsed().as_secs_f64());
        info!(
            merged = report.merged_count(),
            failed = report.failures.len(),
            threshold,
            "merge pass complete"
        );
        Ok(report)
    }

    /// Repeat detection over the store's pending clusters until no pair
    /// qualifies or `max_rounds` passes have run.
    ///
    /// Unlike a single pass, each pair's keeper is resolved through earlier
    /// merges in the same round, so faces always end up in a live cluster.
    pub async fn merge_until_stable(&self, threshold: f32, max_rounds: usize) -> Result<MergeReport> {
        let started = Instant::now();
        let mut report = MergeReport::default();

        while report.rounds < max_rounds {
            let pending = self.store.list_clusters(Some(ClusterStatus::Pending)).await?;
            let pairs = find_pairs(&pending, threshold, true)?;
            report.rounds += 1;
            if pairs.is_empty() {
                break;
            }
            let round = self.apply(pairs).await;
            let progressed = !round.merged_pairs.is_empty();
            report.merged_pairs.extend(round.merged_pairs);
            report.failures.extend(round.failures);
            if !progressed {
                break;
            }
        }

        FACE_ENGINE_OPERATION_DURATION
            .with_label_values(&["merge"])
            .observe(started.elapsed().as_secs_f64());
        info!(
            merged = report.merged_count(),
            rounds = report.rounds,
            threshold,
            "transitive merge complete"
        );
        Ok(report)
    }

    async fn apply(&self, pairs: Vec<MergePair>) -> MergeReport {
        let mut report = MergeReport::default();
        for pair in pairs {
            match self.merge_pair(&pair.keep, &pair.merged).await {
                Ok(()) => {
                    FACE_ENGINE_CLUSTERS.with_label_values(&["merged"]).inc();
                    info!(
                        keep = %pair.keep,
                        merged = %pair.merged,
                        similarity = pair.similarity,
                        "merged clusters"
                    );
                    report.merged_pairs.push(pair);
                }
                Err(e) => {
                    warn!(keep = %pair.keep, merged = %pair.merged, error = %e, "cluster merge failed");
                    report.failures.push(MergeFailure {
                        keep: pair.keep,
                        merged: pair.merged,
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }

    async fn merge_pair(&self, keep: &str, merged: &str) -> Result<()> {
        let mut absorbed = self
            .store
            .get_cluster(merged)
            .await?
            .ok_or_else(|| EngineError::ClusterNotFound(merged.to_string()))?;

        let moved = self.store.reassign_cluster_faces(merged, keep).await?;
        absorbed.status = ClusterStatus::Merged;
        absorbed.face_count = 0;
        self.store.update_cluster(absorbed).await?;
        self.centroids.recompute(keep).await?;
        debug!(keep = %keep, merged = %merged, moved, "reassigned faces");
        Ok(())
    }
}

/// Candidate pairs in scan order.
///
/// With `resolve_chains` the keeper of each pair is followed through earlier
/// merges of the same scan to the cluster that finally absorbs it.
fn find_pairs(clusters: &[Cluster], threshold: f32, resolve_chains: bool) -> Result<Vec<MergePair>> {
    let eligible: Vec<(&ClusterId, &[f32])> = clusters
        .iter()
        .filter(|c| c.status == ClusterStatus::Pending)
        .filter_map(|c| c.centroid.as_deref().map(|centroid| (&c.id, centroid)))
        .collect();

    let mut merged_away: HashSet<&ClusterId> = HashSet::new();
    let mut absorbed_into: HashMap<&ClusterId, &ClusterId> = HashMap::new();
    let mut pairs = Vec::new();

    for i in 0..eligible.len() {
        for j in (i + 1)..eligible.len() {
            let (candidate, candidate_centroid) = eligible[j];
            if merged_away.contains(candidate) {
                continue;
            }
            let (base, base_centroid) = eligible[i];
            let similarity = cosine_similarity(base_centroid, candidate_centroid)?;
            if similarity < threshold {
                continue;
            }

            let mut keep = base;
            if resolve_chains {
                while let Some(&next) = absorbed_into.get(keep) {
                    keep = next;
                }
            }
            if keep == candidate {
                continue;
            }

            merged_away.insert(candidate);
            absorbed_into.insert(candidate, keep);
            pairs.push(MergePair {
                keep: keep.clone(),
                merged: candidate.clone(),
                similarity,
            });
        }
    }

    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryClusterStore;
    use common::Face;

    fn pending(id: &str, centroid: Vec<f32>) -> Cluster {
        let mut c = Cluster::empty();
        c.id = id.to_string();
        c.centroid = Some(centroid);
        c.face_count = 1;
        c
    }

    #[test]
    fn test_find_pairs_greedy() {
        let clusters = vec![
            pending("a", vec![1.0, 0.0]),
            pending("b", vec![1.0, 0.05]),
            pending("c", vec![1.0, 0.1]),
            pending("d", vec![0.0, 1.0]),
        ];
        let pairs = find_pairs(&clusters, 0.9, false).unwrap();
        let ids: Vec<(&str, &str)> = pairs
            .iter()
            .map(|p| (p.keep.as_str(), p.merged.as_str()))
            .collect();
        assert_eq!(ids, vec![("a", "b"), ("a", "c")]);
    }

    #[test]
    fn test_absorbed_cluster_can_still_keep() {
        // a~b and b~c, but a and c are too far apart
        let clusters = vec![
            pending("a", vec![1.0, 0.0]),
            pending("b", vec![1.0, 1.0]),
            pending("c", vec![0.0, 1.0]),
        ];
        let greedy = find_pairs(&clusters, 0.7, false).unwrap();
        let ids: Vec<(&str, &str)> = greedy
            .iter()
            .map(|p| (p.keep.as_str(), p.merged.as_str()))
            .collect();
        assert_eq!(ids, vec![("a", "b"), ("b", "c")]);

        let resolved = find_pairs(&clusters, 0.7, true).unwrap();
        let ids: Vec<(&str, &str)> = resolved
            .iter()
            .map(|p| (p.keep.as_str(), p.merged.as_str()))
            .collect();
        assert_eq!(ids, vec![("a", "b"), ("a", "c")]);
    }

    #[test]
    fn test_non_pending_and_centroidless_ignored() {
        let mut confirmed = pending("x", vec![1.0, 0.0]);
        confirmed.status = ClusterStatus::Confirmed;
        let mut empty = pending("y", vec![]);
        empty.centroid = None;
        let clusters = vec![confirmed, empty, pending("z", vec![1.0, 0.0])];
        assert!(find_pairs(&clusters, 0.5, false).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_merge_moves_faces_and_marks_merged() {
        let store = Arc::new(MemoryClusterStore::new());
        let centroids = CentroidMaintainer::new(store.clone());
        let merger = ClusterMerger::new(store.clone(), centroids);

        let a = pending("a", vec![1.0, 0.0, 0.0, 0.0, 0.0]);
        let b = pending("b", vec![3.0, 2.0, 1.0, 1.0, 1.0]);
        for (cluster, n) in [(&a, 2), (&b, 2)] {
            let mut c = cluster.clone();
            c.face_count = n;
            store.insert_cluster(c).await.unwrap();
            for k in 0..n {
                let mut face = Face::new(cluster.centroid.clone()).with_id(format!("{}{k}", cluster.id));
                face.cluster_id = Some(cluster.id.clone());
                store.insert_face(face).await.unwrap();
            }
        }

        let clusters = store.list_clusters(Some(ClusterStatus::Pending)).await.unwrap();
        let report = merger.merge_similar(&clusters, 0.7).await.unwrap();
        assert_eq!(report.merged_count(), 1);
        assert_eq!(report.merged_pairs[0].keep, "a");
        assert_eq!(report.merged_pairs[0].merged, "b");

        let kept = store.get_cluster("a").await.unwrap().unwrap();
        assert_eq!(kept.face_count, 4);
        let absorbed = store.get_cluster("b").await.unwrap().unwrap();
        assert_eq!(absorbed.status, ClusterStatus::Merged);
        assert!(store.faces_in_cluster("b").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_merge_until_stable_reaches_fixed_point() {
        let store = Arc::new(MemoryClusterStore::new());
        let centroids = CentroidMaintainer::new(store.clone());
        let merger = ClusterMerger::new(store.clone(), centroids);

        for (id, centroid) in [
            ("a", vec![1.0, 0.0]),
            ("b", vec![1.0, 1.0]),
            ("c", vec![0.0, 1.0]),
        ] {
            store.insert_cluster(pending(id, centroid.clone())).await.unwrap();
            let mut face = Face::new(Some(centroid)).with_id(format!("{id}-face"));
            face.cluster_id = Some(id.to_string());
            store.insert_face(face).await.unwrap();
        }

        let report = merger.merge_until_stable(0.7, 5).await.unwrap();
        assert_eq!(report.merged_count(), 2);
        assert_eq!(report.rounds, 2);

        let live = store.list_clusters(Some(ClusterStatus::Pending)).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, "a");
        assert_eq!(live[0].face_count, 3);
    }
}
