use thiserror::Error;

/// Errors raised while parsing, building or running a darknet graph.
///
/// Configuration problems (`Parse`, `Config`, `UnknownArc`) are detected while
/// the graph is assembled; the remaining variants surface during a forward pass.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint error: {0}")]
    Record(#[from] burn::record::RecorderError),

    #[error("cfg parse error on line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("invalid layer {layer} ({kind}): {message}")]
    Config {
        layer: usize,
        kind: String,
        message: String,
    },

    #[error("unknown architecture variant '{0}'")]
    UnknownArc(String),

    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error("layer {referenced_by} references the output of layer {layer}, which produced none")]
    MissingOutput { layer: usize, referenced_by: usize },

    #[error("model has no yolo detection heads")]
    NoDetectionHeads,
}

impl ModelError {
    pub fn config(layer: usize, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            layer,
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn shape(message: impl Into<String>) -> Self {
        Self::Shape(message.into())
    }
}

pub type Result<T> = std::result::Result<T, ModelError>;
