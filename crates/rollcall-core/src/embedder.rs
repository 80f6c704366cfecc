//! FaceNet face embedder via ONNX Runtime.
//!
//! Maps a 160×160 RGB face crop to a 512-dimensional embedding. Output is
//! left unnormalized; the recognizer normalizes queries and samples itself.

use crate::types::Embedding;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

// --- Named constants (different from the SSD detector!) ---
pub const FACENET_INPUT_SIZE: u32 = 160;
const FACENET_MEAN: f32 = 127.5;
const FACENET_STD: f32 = 128.0;
pub const FACENET_EMBEDDING_DIM: usize = 512;
pub const FACENET_MODEL_VERSION: &str = "facenet-512";

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0}; place the FaceNet ONNX export in the model directory")]
    ModelNotFound(String),
    #[error("face crop must be {expected}x{expected}, got {width}x{height}")]
    InvalidInput { expected: u32, width: u32, height: u32 },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Memory layout of the network's image input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// `[1, H, W, 3]`, as exported from Keras.
    #[default]
    Nhwc,
    /// `[1, 3, H, W]`, as exported from PyTorch.
    Nchw,
}

/// FaceNet-based embedding extractor.
pub struct FaceEmbedder {
    session: Session,
    layout: TensorLayout,
}

impl FaceEmbedder {
    /// Load the FaceNet ONNX model from the given path.
    ///
    /// A missing file is a startup failure: there is no embedding without it.
    pub fn load(model_path: &str, layout: TensorLayout) -> Result<Self, EmbedderError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            ?layout,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded FaceNet model"
        );

        Ok(Self { session, layout })
    }

    /// Extract the raw embedding of a 160×160 RGB face crop.
    pub fn embed(&mut self, face: &RgbImage) -> Result<Embedding, EmbedderError> {
        if face.width() != FACENET_INPUT_SIZE || face.height() != FACENET_INPUT_SIZE {
            return Err(EmbedderError::InvalidInput {
                expected: FACENET_INPUT_SIZE,
                width: face.width(),
                height: face.height(),
            });
        }

        let input = preprocess(face, self.layout);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw_data.len() != FACENET_EMBEDDING_DIM {
            return Err(EmbedderError::InferenceFailed(format!(
                "expected {FACENET_EMBEDDING_DIM}-dim embedding, got {}",
                raw_data.len()
            )));
        }

        Ok(Embedding {
            values: raw_data.to_vec(),
            model_version: Some(FACENET_MODEL_VERSION.to_string()),
        })
    }
}

/// Normalize pixels with `(p - 127.5) / 128` into a float tensor.
fn preprocess(face: &RgbImage, layout: TensorLayout) -> Array4<f32> {
    let size = FACENET_INPUT_SIZE as usize;
    let mut tensor = match layout {
        TensorLayout::Nhwc => Array4::<f32>::zeros((1, size, size, 3)),
        TensorLayout::Nchw => Array4::<f32>::zeros((1, 3, size, size)),
    };

    for (x, y, pixel) in face.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for (c, &value) in pixel.0.iter().enumerate() {
            let normalized = (value as f32 - FACENET_MEAN) / FACENET_STD;
            match layout {
                TensorLayout::Nhwc => tensor[[0, y, x, c]] = normalized,
                TensorLayout::Nchw => tensor[[0, c, y, x]] = normalized,
            }
        }
    }

    tensor
}
