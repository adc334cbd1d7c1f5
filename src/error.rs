use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("Shape mismatch: tensor of shape {shape:?} has {elements} elements but data length is {len}")]
    ShapeDataMismatch {
        shape: Vec<usize>,
        elements: usize,
        len: usize,
    },

    #[error("Weight file truncated while reading {what} ({needed} bytes needed)")]
    TruncatedFile { what: &'static str, needed: usize },

    #[error("Weight file has {extra} trailing bytes after all layers were read")]
    TrailingData { extra: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

pub type Result<T> = std::result::Result<T, ConvertError>;
