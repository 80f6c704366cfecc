//! rollcall-core — Face attendance engine.
//!
//! Uses an SSD network for face detection and FaceNet for embeddings, both
//! running via ONNX Runtime for CPU inference. Matching, live enrollment and
//! cooldown-gated attendance marking sit on top and are model-agnostic.

pub mod attendance;
pub mod detector;
pub mod embedder;
pub mod enrollment;
pub mod pipeline;
pub mod recognizer;
pub mod store;
pub mod types;

pub use attendance::{AttendanceGate, AttendanceRecord, AttendanceSink, Clock, SinkError, SystemClock};
pub use detector::FaceDetector;
pub use embedder::{FaceEmbedder, TensorLayout};
pub use enrollment::{EnrollProgress, Enroller, EnrollmentConfig, RosterUpdated};
pub use pipeline::{AnnotatedFrame, FaceDetect, FaceEmbed, Pipeline, PipelineEvent, VideoSource};
pub use recognizer::Recognizer;
pub use store::{RosterError, RosterStore};
pub use types::{Embedding, FaceBox, Identity, Recognition, Roster};
