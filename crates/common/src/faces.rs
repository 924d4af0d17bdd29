//! Records shared between the clustering engine and its persistence layer.
//!
//! Faces point at clusters through `cluster_id` (a back-reference, never a
//! container). Clusters carry a cached centroid and member count that the
//! engine keeps in step with the faces that point at them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Face feature vector produced by the external extractor (512-D in practice)
pub type Embedding = Vec<f32>;

pub type FaceId = String;
pub type ClusterId = String;
pub type IdentityId = String;

/// Bounding box in source-image pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
    #[default]
    Unknown,
}

/// Detector output that rides along with a face but never influences clustering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FaceAttributes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub age: Option<f32>,

    #[serde(default)]
    pub gender: Gender,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotion: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_path: Option<String>,
}

/// One face as returned by the detection/extraction model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedFace {
    pub bbox: BoundingBox,

    /// `None` when extraction failed for this crop
    #[serde(default)]
    pub embedding: Option<Embedding>,

    #[serde(default)]
    pub age: Option<f32>,

    #[serde(default)]
    pub gender: Gender,

    #[serde(default)]
    pub emotion: Option<String>,

    #[serde(default)]
    pub quality_score: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_path: Option<String>,
}

impl DetectedFace {
    pub fn attributes(&self) -> FaceAttributes {
        FaceAttributes {
            bbox: Some(self.bbox),
            quality_score: Some(self.quality_score),
            age: self.age,
            gender: self.gender,
            emotion: self.emotion.clone(),
            thumbnail_path: self.thumbnail_path.clone(),
        }
    }
}

/// A persisted face observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Face {
    pub id: FaceId,

    /// Source image or camera frame record
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,

    /// Never mutated after creation; `None` excludes the face from all matching
    pub embedding: Option<Embedding>,

    pub cluster_id: Option<ClusterId>,

    #[serde(default)]
    pub attributes: FaceAttributes,

    pub created_at: DateTime<Utc>,
}

impl Face {
    pub fn new(embedding: Option<Embedding>) -> Self {
        Self {
            id: crate::generate_id(),
            image_id: None,
            embedding,
            cluster_id: None,
            attributes: FaceAttributes::default(),
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_image(mut self, image_id: impl Into<String>) -> Self {
        self.image_id = Some(image_id.into());
        self
    }

    pub fn with_attributes(mut self, attributes: FaceAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn has_embedding(&self) -> bool {
        self.embedding.as_ref().is_some_and(|e| !e.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    /// Awaiting a human label
    #[default]
    Pending,
    /// Linked to at least one identity
    Confirmed,
    /// Superseded by another cluster; terminal
    Merged,
}

impl std::fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterStatus::Pending => write!(f, "pending"),
            ClusterStatus::Confirmed => write!(f, "confirmed"),
            ClusterStatus::Merged => write!(f, "merged"),
        }
    }
}

impl std::str::FromStr for ClusterStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ClusterStatus::Pending),
            "confirmed" => Ok(ClusterStatus::Confirmed),
            "merged" => Ok(ClusterStatus::Merged),
            _ => Err(format!("Invalid cluster status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,

    /// Mean of all member embeddings; `None` only while the cluster has no usable members
    pub centroid: Option<Embedding>,

    pub face_count: usize,

    pub representative_face_id: Option<FaceId>,

    pub status: ClusterStatus,

    pub created_at: DateTime<Utc>,
}

impl Cluster {
    /// New pending cluster seeded by a single face
    pub fn singleton(face_id: &str, embedding: Embedding) -> Self {
        Self {
            id: crate::generate_id(),
            centroid: Some(embedding),
            face_count: 1,
            representative_face_id: Some(face_id.to_string()),
            status: ClusterStatus::Pending,
            created_at: Utc::now(),
        }
    }

    /// Empty pending cluster; members and centroid are filled in by recomputation
    pub fn empty() -> Self {
        Self {
            id: crate::generate_id(),
            centroid: None,
            face_count: 0,
            representative_face_id: None,
            status: ClusterStatus::Pending,
            created_at: Utc::now(),
        }
    }

    /// Eligible to receive new members: not merged and carrying a centroid
    pub fn is_active(&self) -> bool {
        self.status != ClusterStatus::Merged && self.centroid.is_some() && self.face_count > 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub name: String,
    pub description: Option<String>,
    pub avatar_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Identity {
    pub fn new(name: impl Into<String>, description: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: crate::generate_id(),
            name: name.into(),
            description,
            avatar_path: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Association between an identity and one of its clusters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityCluster {
    pub id: String,
    pub identity_id: IdentityId,
    pub cluster_id: ClusterId,
    pub created_at: DateTime<Utc>,
}

impl IdentityCluster {
    pub fn new(identity_id: &str, cluster_id: &str) -> Self {
        Self {
            id: crate::generate_id(),
            identity_id: identity_id.to_string(),
            cluster_id: cluster_id.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Append-only audit record of a recognition attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionLog {
    pub id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub face_id: Option<FaceId>,

    pub matched_identity_id: Option<IdentityId>,

    pub confidence: Option<f32>,

    pub is_stranger: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_path: Option<String>,

    pub timestamp: DateTime<Utc>,
}
