//! PLY file loading functions

use crate::ply::PlyError;
use crate::types::Point;
use glam::Vec3;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use serde_ply::PlyReader;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{debug, info, warn};

// PLY file structure
#[derive(Deserialize, Debug)]
struct PlyFile {
    #[serde(rename = "vertex")]
    vertex: Vec<HashMap<String, JsonValue>>,
}

fn get_f32(prop: Option<&JsonValue>) -> Option<f32> {
    prop.and_then(|v| match v {
        JsonValue::Number(n) => n.as_f64().map(|f| f as f32),
        _ => None,
    })
}

fn get_u8(prop: Option<&JsonValue>) -> Option<u8> {
    prop.and_then(|v| match v {
        JsonValue::Number(n) => n
            .as_u64()
            .map(|u| u as u8)
            .or_else(|| n.as_i64().map(|i| i as u8)),
        _ => None,
    })
}

/// Load the points of a PLY file.
///
/// Colors are read from `red`/`green`/`blue` (or `r`/`g`/`b`) when present;
/// points without color properties come back uncolored.
#[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
pub fn load_points_from_ply(path: impl AsRef<Path>) -> Result<Vec<Point>, PlyError> {
    debug!("Loading PLY points");
    let file = File::open(path.as_ref())?;
    let reader = BufReader::new(file);

    let ply_data: PlyFile = serde_ply::from_reader(reader).map_err(|e| {
        warn!("Failed to parse PLY file: {}", e);
        PlyError::Parse(e.to_string())
    })?;

    info!("PLY file parsed: {} vertices", ply_data.vertex.len());

    let mut points = Vec::with_capacity(ply_data.vertex.len());

    for (index, vertex) in ply_data.vertex.iter().enumerate() {
        let coord = |property: &'static str| {
            get_f32(vertex.get(property)).ok_or(PlyError::MissingProperty { property, index })
        };
        let position = Vec3::new(coord("x")?, coord("y")?, coord("z")?);

        let color = if let (Some(r), Some(g), Some(b)) = (
            get_u8(vertex.get("red")),
            get_u8(vertex.get("green")),
            get_u8(vertex.get("blue")),
        ) {
            Some([r, g, b])
        } else if let (Some(r), Some(g), Some(b)) = (
            get_u8(vertex.get("r")),
            get_u8(vertex.get("g")),
            get_u8(vertex.get("b")),
        ) {
            Some([r, g, b])
        } else {
            None
        };

        points.push(Point { position, color });
    }

    debug!("Loaded {} points from PLY file", points.len());
    Ok(points)
}

/// Read the `comment` lines of a PLY header without parsing the body.
pub fn read_ply_comments(path: impl AsRef<Path>) -> Result<Vec<String>, PlyError> {
    let reader = BufReader::new(File::open(path.as_ref())?);
    let ply = PlyReader::from_reader(reader).map_err(|e| PlyError::Parse(e.to_string()))?;
    Ok(ply.header().comments.clone())
}
