//! doorman-core: identity store, face analysis and match policy.
//!
//! Faces are detected with SCRFD and encoded with ArcFace, both running via
//! ONNX Runtime on the CPU. Encodings are compared by cosine distance
//! against the trusted-identity store.

pub mod analyzer;
pub mod config;
pub mod detector;
pub mod engine;
pub mod recognizer;
pub mod store;
pub mod types;

pub use analyzer::{AnalyzerError, FaceAnalyzer, OnnxAnalyzer};
pub use config::{Config, ConfigError};
pub use engine::{EngineError, Outcome, Recognition, RecognitionEngine};
pub use store::{IdentityStore, StoreError};
pub use types::{Encoding, FaceRegion, IdentityMatch, IdentityRecord};
