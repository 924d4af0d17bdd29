pub mod faces;
pub mod validation;

pub use faces::{
    BoundingBox, Cluster, ClusterId, ClusterStatus, DetectedFace, Embedding, Face, FaceAttributes,
    FaceId, Gender, Identity, IdentityCluster, IdentityId, RecognitionLog,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fresh random identifier for faces, clusters, identities and log records
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
