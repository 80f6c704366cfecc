//! SSD face detector via ONNX Runtime.
//!
//! Wraps the ResNet-10 300×300 single-shot face detector. The network sees a
//! BGR, mean-subtracted 300×300 resize of the frame and emits rows of
//! `[image_id, label, confidence, x1, y1, x2, y2]` with normalized corners.

use crate::types::FaceBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const SSD_INPUT_SIZE: u32 = 300;
/// Per-channel means in B, G, R order.
const SSD_MEAN_BGR: [f32; 3] = [104.0, 177.0, 123.0];
const SSD_ROW_LEN: usize = 7;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; place the res10 SSD ONNX export in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// SSD-based face detector.
pub struct FaceDetector {
    session: Session,
    confidence_threshold: f32,
}

impl FaceDetector {
    /// Load the SSD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded SSD face detector"
        );

        Ok(Self {
            session,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        })
    }

    /// Override the minimum confidence a detection needs to be reported.
    pub fn with_confidence(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    /// Detect faces in an RGB frame.
    ///
    /// Never fails: empty frames and inference errors both yield no boxes.
    pub fn detect(&mut self, frame: &RgbImage) -> Vec<FaceBox> {
        if frame.width() == 0 || frame.height() == 0 {
            return Vec::new();
        }

        match self.try_detect(frame) {
            Ok(boxes) => boxes,
            Err(e) => {
                tracing::warn!(error = %e, "face detection failed; treating frame as empty");
                Vec::new()
            }
        }
    }

    fn try_detect(&mut self, frame: &RgbImage) -> Result<Vec<FaceBox>, DetectorError> {
        let input = preprocess(frame);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("detections: {e}")))?;

        Ok(decode_detections(
            raw,
            frame.width(),
            frame.height(),
            self.confidence_threshold,
        ))
    }
}

/// Resize to the network input and build a mean-subtracted BGR NCHW tensor.
fn preprocess(frame: &RgbImage) -> Array4<f32> {
    let size = SSD_INPUT_SIZE as usize;
    let resized = imageops::resize(frame, SSD_INPUT_SIZE, SSD_INPUT_SIZE, FilterType::Triangle);
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for (x, y, pixel) in resized.enumerate_pixels() {
        let [r, g, b] = pixel.0;
        let (x, y) = (x as usize, y as usize);
        tensor[[0, 0, y, x]] = b as f32 - SSD_MEAN_BGR[0];
        tensor[[0, 1, y, x]] = g as f32 - SSD_MEAN_BGR[1];
        tensor[[0, 2, y, x]] = r as f32 - SSD_MEAN_BGR[2];
    }

    tensor
}

/// Decode raw SSD rows into pixel-space boxes for a `width` × `height` frame.
///
/// Coordinates are truncated toward zero and left unclamped. A trailing
/// partial row is ignored.
fn decode_detections(raw: &[f32], width: u32, height: u32, threshold: f32) -> Vec<FaceBox> {
    let (w, h) = (width as f32, height as f32);

    raw.chunks_exact(SSD_ROW_LEN)
        .filter(|row| row[2].is_finite() && row[2] > threshold)
        .map(|row| FaceBox {
            x1: (row[3] * w) as i32,
            y1: (row[4] * h) as i32,
            x2: (row[5] * w) as i32,
            y2: (row[6] * h) as i32,
            confidence: row[2],
        })
        .collect()
}
