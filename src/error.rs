//! Error types with actionable diagnostics.
//!
//! All errors include contextual information to help users resolve issues
//! without needing to consult external documentation. Convergence-delta
//! violations are deliberately *not* errors; they are surfaced as warnings
//! so the caller can inspect the deltas and decide whether to trust the
//! result.

use thiserror::Error;

/// Result type alias for atribuir operations.
pub type Result<T> = std::result::Result<T, AtribuirError>;

/// Errors that can occur while computing attributions.
#[derive(Error, Debug)]
pub enum AtribuirError {
    /// The model contains a layer the rescale rule is not defined for.
    #[error("Unsupported layer for DeepLIFT/SHAP: {layer}\n  → Remove max-pooling layers or use a black-box attributor for this model")]
    UnsupportedLayer { layer: String },

    /// Two paired tensors disagree in shape.
    #[error("Tensor shape mismatch in {context}: expected {expected:?}, got {actual:?}\n  → Check that inputs, baselines and references share the (batch, alphabet, length) layout")]
    ShapeMismatch { context: String, expected: Vec<usize>, actual: Vec<usize> },

    /// A sequence position is not a valid one-hot column.
    #[error("Example {example} is not one-hot encoded at position {position}\n  → Every position must have exactly one active character")]
    InvalidOneHot { example: usize, position: usize },

    /// A model with zero layers was supplied.
    #[error("Model has no layers\n  → Construct the model with at least one layer before attributing")]
    EmptyModel,

    /// The requested compute device is not available to this model.
    #[error("Unsupported device: {device}\n  → This model only runs on the CPU backend")]
    UnsupportedDevice { device: String },

    /// A configuration value is invalid.
    #[error("Invalid configuration value for '{field}': {message}")]
    Config { field: String, message: String },

    /// Generic error for unexpected conditions.
    #[error("Internal error: {message}\n  → Please report this bug")]
    Internal { message: String },
}

impl AtribuirError {
    /// Shape-mismatch constructor that copies shapes out of ndarray views.
    pub fn shape(context: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Check if this error is user-recoverable.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedLayer { .. }
                | Self::ShapeMismatch { .. }
                | Self::InvalidOneHot { .. }
                | Self::EmptyModel
                | Self::UnsupportedDevice { .. }
                | Self::Config { .. }
        )
    }

    /// Get the error code for structured output.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedLayer { .. } => "A001",
            Self::ShapeMismatch { .. } => "A002",
            Self::InvalidOneHot { .. } => "A003",
            Self::EmptyModel => "A004",
            Self::UnsupportedDevice { .. } => "A005",
            Self::Config { .. } => "A006",
            Self::Internal { .. } => "A999",
        }
    }
}

impl From<ndarray::ShapeError> for AtribuirError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Internal { message: format!("ndarray shape error: {err}") }
    }
}
