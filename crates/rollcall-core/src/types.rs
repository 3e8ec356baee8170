use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Length of every face embedding produced or accepted by rollcall.
pub const EMBEDDING_DIM: usize = 128;

/// Stable identifier of an enrolled identity.
///
/// Matching and attendance are keyed by this id, never by display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(String);

impl IdentityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Bounding box for a detected face, in source-frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection over union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union > 0.0 { inter / union } else { 0.0 }
    }
}

/// Face embedding vector (128-dimensional).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// True when the vector has the expected length and only finite components.
    pub fn is_well_formed(&self) -> bool {
        self.values.len() == EMBEDDING_DIM && self.values.iter().all(|v| v.is_finite())
    }

    /// Euclidean distance between two embeddings.
    ///
    /// Vectors of different length are infinitely far apart.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Scale to unit length. Zero vectors are left untouched.
    pub fn l2_normalized(mut self) -> Self {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut self.values {
                *v /= norm;
            }
        }
        self
    }
}

/// An identity as owned by the identity-management collaborator.
///
/// Read-only here. One row per enrollment photo; rows sharing an id are
/// reference embeddings of the same person.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrolledIdentity {
    pub identity_id: IdentityId,
    pub display_name: String,
    pub consent: bool,
    pub embedding: Option<Embedding>,
}

impl EnrolledIdentity {
    /// Eligible iff consent was given and a well-formed embedding is present.
    pub fn is_eligible(&self) -> bool {
        self.consent && self.embedding.as_ref().is_some_and(Embedding::is_well_formed)
    }
}

/// A face found in one frame. Lives for a single pass.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
    pub captured_at: DateTime<Utc>,
    /// Produced by the degraded-mode backend rather than a real model.
    pub synthetic: bool,
}

/// Outcome of matching one detection against the gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// `None` means "unmatched".
    pub identity_id: Option<IdentityId>,
    /// Distance to the nearest reference, reported whether or not it matched.
    pub distance: f32,
    pub is_match: bool,
    /// The threshold the decision was made with.
    pub threshold: f32,
}

impl MatchResult {
    pub fn unmatched(distance: f32, threshold: f32) -> Self {
        Self {
            identity_id: None,
            distance,
            is_match: false,
            threshold,
        }
    }

    /// Display label: the identity id, or `"unmatched"`.
    pub fn label(&self) -> &str {
        match &self.identity_id {
            Some(id) if self.is_match => id.as_str(),
            _ => "unmatched",
        }
    }
}

/// The class, course or event that attendance is being taken for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionContext(String);

impl SessionContext {
    /// Returns `None` for blank input.
    pub fn new(context: impl Into<String>) -> Option<Self> {
        let context = context.into();
        if context.trim().is_empty() {
            None
        } else {
            Some(Self(context))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Present,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMethod {
    /// Recognized by the live model.
    Automatic,
    /// Produced while the model was degraded and committed by operator override.
    Simulated,
}

impl CaptureMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureMethod::Automatic => "automatic",
            CaptureMethod::Simulated => "simulated",
        }
    }
}

/// A committed attendance record handed to the record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub record_id: Uuid,
    pub identity_id: IdentityId,
    pub context: SessionContext,
    pub timestamp: DateTime<Utc>,
    pub status: AttendanceStatus,
    pub capture_method: CaptureMethod,
}
