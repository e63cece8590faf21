use std::path::PathBuf;
use thiserror::Error;

/// Structured error types for the CAM visualization tool.
///
/// Each variant captures context specific to its error domain (filesystem,
/// image decoding, model inference, ROI selection), so callers can react to a
/// failure without parsing error strings. The thiserror crate generates the
/// Display implementations from the format strings.
#[derive(Error, Debug)]
pub enum SegCamError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Image error: {operation} failed (file: {path})")]
    Image {
        path: String,
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Model error: {operation} failed")]
    Model {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("pixel ({row}, {col}) lies outside the {height}x{width} image")]
    OutOfBounds {
        row: usize,
        col: usize,
        height: usize,
        width: usize,
    },

    #[error("class {class_id} does not occur in the predicted label map")]
    UnknownClass { class_id: usize },

    #[error("unrecognized ROI mode {mode} (expected 0-3)")]
    InvalidMode { mode: u8 },

    #[error("the {backend} backend does not provide {capability}")]
    Unsupported {
        backend: &'static str,
        capability: &'static str,
    },

    #[error("Validation error: {field} {reason}")]
    Validation { field: String, reason: String },
}

pub type Result<T> = std::result::Result<T, SegCamError>;

/// Fallback for I/O errors that surface without path context. Code that knows
/// the path and operation constructs `SegCamError::FileSystem` directly.
impl From<std::io::Error> for SegCamError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

/// Convert image crate errors to image errors.
impl From<image::ImageError> for SegCamError {
    fn from(err: image::ImageError) -> Self {
        Self::Image {
            path: "unknown".to_string(),
            operation: "image processing".to_string(),
            source: Box::new(err),
        }
    }
}

/// Convert ONNX Runtime errors to model errors.
impl From<ort::Error> for SegCamError {
    fn from(err: ort::Error) -> Self {
        Self::Model {
            operation: "ort operation".to_string(),
            source: Box::new(err),
        }
    }
}

/// Shape errors occur during tensor plumbing around inference, so they are
/// categorized as model errors rather than a separate tensor error type.
impl From<ndarray::ShapeError> for SegCamError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Model {
            operation: "tensor shape conversion".to_string(),
            source: Box::new(err),
        }
    }
}
