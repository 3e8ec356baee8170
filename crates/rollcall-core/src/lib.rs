//! rollcall-core: Face-recognition attendance engine.
//!
//! Model lifecycle, gallery snapshots, Euclidean identity matching and
//! attendance sessions. Detection and embedding run through the opaque
//! [`FaceAnalyzer`] capability, backed by ONNX Runtime or, in degraded
//! mode, by a simulated analyzer.

pub mod analyzer;
pub mod diagnostics;
pub mod gallery;
pub mod lifecycle;
pub mod matcher;
pub mod onnx;
pub mod session;
pub mod types;

pub use analyzer::{AnalyzerError, AnalyzerMode, FaceAnalyzer, GrayImage, SyntheticAnalyzer};
pub use diagnostics::{DiagnosticEvent, DiagnosticLog, DiagnosticSink, EventKind, Severity};
pub use gallery::{Gallery, GalleryBuilder, GalleryEntry, GalleryError};
pub use lifecycle::{
    LoadSettings, ModelHandle, ModelLoadError, ModelLoader, ModelManager, ModelState, ModelStatus,
};
pub use matcher::{EuclideanMatcher, Matcher, Threshold, ThresholdError, DEFAULT_MATCH_THRESHOLD};
pub use onnx::{ModelManifest, OnnxLoader};
pub use session::{
    CommitPolicy, ObservationOrigin, RecordStore, RecordStoreError, SessionAggregator,
    SessionError, SessionSnapshot,
};
pub use types::{
    AttendanceRecord, AttendanceStatus, BoundingBox, CaptureMethod, Detection, Embedding,
    EnrolledIdentity, IdentityId, MatchResult, SessionContext, EMBEDDING_DIM,
};
