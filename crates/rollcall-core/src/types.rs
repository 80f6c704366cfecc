use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Added to norms before dividing so zero vectors never produce NaN.
pub const NORM_EPSILON: f32 = 1e-10;

/// Enrolled identities and their raw sample embeddings, keyed by name.
///
/// Iteration order is the key order, which also decides which identity wins
/// an exact similarity tie.
pub type Roster = BTreeMap<String, Vec<Embedding>>;

/// Axis-aligned face box in pixel coordinates of the source frame.
///
/// Produced by the detector and not clamped: corners may lie outside the
/// frame. Use [`FaceBox::clamp`] before cropping.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
    pub confidence: f32,
}

/// A box clamped to frame bounds with a strictly positive area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceBox {
    /// Clamp to a `width` × `height` frame, returning `None` for empty crops.
    pub fn clamp(&self, width: u32, height: u32) -> Option<CropRect> {
        let x1 = self.x1.clamp(0, width as i32);
        let y1 = self.y1.clamp(0, height as i32);
        let x2 = self.x2.clamp(0, width as i32);
        let y2 = self.y2.clamp(0, height as i32);

        if x2 <= x1 || y2 <= y1 {
            return None;
        }

        Some(CropRect {
            x: x1 as u32,
            y: y1 as u32,
            width: (x2 - x1) as u32,
            height: (y2 - y1) as u32,
        })
    }
}

/// Face embedding vector (512-dimensional for FaceNet).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "facenet-512").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Euclidean norm of the raw values.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Copy of this embedding scaled to unit length (`v / (|v| + eps)`).
    pub fn l2_normalized(&self) -> Embedding {
        let denom = self.norm() + NORM_EPSILON;
        Embedding {
            values: self.values.iter().map(|v| v / denom).collect(),
            model_version: self.model_version.clone(),
        }
    }

    /// Cosine similarity in [-1, 1]: `a·b / (|a||b| + eps)`.
    ///
    /// Zero vectors compare as 0.0 rather than NaN.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        dot / (norm_a.sqrt() * norm_b.sqrt() + NORM_EPSILON)
    }
}

/// Outcome of matching one query against the prototype table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Known(String),
    Unknown,
}

impl Identity {
    pub fn name(&self) -> Option<&str> {
        match self {
            Identity::Known(name) => Some(name),
            Identity::Unknown => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Identity::Known(_))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Known(name) => f.write_str(name),
            Identity::Unknown => f.write_str("Unknown"),
        }
    }
}

/// Result of [`Recognizer::recognize`](crate::Recognizer::recognize).
#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub identity: Identity,
    /// Best similarity found, even when it lost to the threshold.
    pub score: f32,
}
