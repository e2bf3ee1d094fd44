//! Rowscan Data Crate
//!
//! Point types and PLY reading/writing shared by the capture and fusion crates.
//! This crate knows nothing about cameras or calibration; it only deals with
//! colored points and how they are laid out on disk.

pub mod ply;
pub mod types;

pub use ply::{PlyEncoding, PlyError, PlyWriter, load_points_from_ply, read_ply_comments};
pub use types::{Bounds, Point};
