pub mod assign;
pub mod centroid;
pub mod config;
pub mod curation;
pub mod dedup;
pub mod embedder;
pub mod error;
pub mod grouping;
pub mod identities;
pub mod merge;
pub mod recognizer;
pub mod session;
pub mod state;
pub mod store;
pub mod vector;

pub use config::{DedupSettings, EngineConfig};
pub use error::{EngineError, Result};
pub use session::{CameraSession, DetectionOutcome, SessionStats};
pub use state::FaceEngine;
pub use store::{ClusterStore, MemoryClusterStore};
