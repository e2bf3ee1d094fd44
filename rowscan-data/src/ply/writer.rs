//! PLY writing

use crate::ply::PlyError;
use crate::types::Point;
use serde::{Deserialize, Serialize};
use serde_ply::SerializeOptions;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::debug;

/// Color written for uncolored points of a cloud that has colors elsewhere.
pub const UNCOLORED: [u8; 3] = [128, 128, 128];

/// Body encoding of a written PLY file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlyEncoding {
    Ascii,
    #[default]
    BinaryLittleEndian,
}

impl PlyEncoding {
    fn options(self) -> SerializeOptions {
        match self {
            PlyEncoding::Ascii => SerializeOptions::ascii(),
            PlyEncoding::BinaryLittleEndian => SerializeOptions::binary_le(),
        }
    }
}

#[derive(Serialize)]
struct Vertex {
    x: f32,
    y: f32,
    z: f32,
}

#[derive(Serialize)]
struct ColoredVertex {
    x: f32,
    y: f32,
    z: f32,
    red: u8,
    green: u8,
    blue: u8,
}

#[derive(Serialize)]
struct VertexList<V> {
    vertex: Vec<V>,
}

/// Writes points as a PLY vertex list with `float x/y/z` and, when any point
/// carries a color, `uchar red/green/blue` properties. Uncolored points of a
/// colored cloud are written as [`UNCOLORED`].
#[derive(Debug, Clone, Default)]
pub struct PlyWriter {
    encoding: PlyEncoding,
    comments: Vec<String>,
}

impl PlyWriter {
    pub fn new(encoding: PlyEncoding) -> Self {
        Self {
            encoding,
            comments: Vec::new(),
        }
    }

    /// Add a header comment. Line breaks are flattened to spaces.
    pub fn with_comment(mut self, comment: impl AsRef<str>) -> Self {
        self.comments
            .push(comment.as_ref().replace(['\r', '\n'], " "));
        self
    }

    /// Write `points` to `writer`.
    pub fn write<W: Write>(&self, writer: W, points: &[Point]) -> Result<(), PlyError> {
        let mut out = BufWriter::new(writer);
        let options = self.encoding.options().with_comments(self.comments.clone());

        if points.iter().any(|p| p.color.is_some()) {
            let vertex = points
                .iter()
                .map(|p| {
                    let [x, y, z] = p.to_array();
                    let [red, green, blue] = p.color.unwrap_or(UNCOLORED);
                    ColoredVertex { x, y, z, red, green, blue }
                })
                .collect();
            serde_ply::to_writer(&VertexList { vertex }, options, &mut out)?;
        } else {
            let vertex = points
                .iter()
                .map(|p| {
                    let [x, y, z] = p.to_array();
                    Vertex { x, y, z }
                })
                .collect();
            serde_ply::to_writer(&VertexList { vertex }, options, &mut out)?;
        }

        out.flush()?;
        Ok(())
    }

    /// Write `points` to a new file at `path`.
    ///
    /// Fails with `AlreadyExists` instead of replacing an existing file.
    #[tracing::instrument(skip_all, fields(path = %path.as_ref().display(), points = points.len()))]
    pub fn write_new_file(&self, path: impl AsRef<Path>, points: &[Point]) -> Result<(), PlyError> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path.as_ref())?;
        self.write(file, points)?;
        debug!("Wrote {} points", points.len());
        Ok(())
    }
}
