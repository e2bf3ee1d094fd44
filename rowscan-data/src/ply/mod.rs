//! PLY file reading and writing

mod loader;
mod writer;

pub use loader::{load_points_from_ply, read_ply_comments};
pub use writer::{PlyEncoding, PlyWriter, UNCOLORED};

use thiserror::Error;

/// Errors raised while reading or writing PLY files.
#[derive(Debug, Error)]
pub enum PlyError {
    #[error("PLY parsing error: {0}")]
    Parse(String),

    #[error("PLY writing error: {0}")]
    Serialize(#[from] serde_ply::SerializeError),

    #[error("Missing '{property}' at vertex {index}")]
    MissingProperty { property: &'static str, index: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
