//! Core data types for point clouds.
//!
//! Positions are stored in millimeters, matching the depth units delivered by
//! the time-of-flight cameras.

use glam::Vec3;

/// A point in 3D space with an optional 8-bit RGB color.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    /// Position in the cloud's frame of reference (millimeters).
    pub position: Vec3,
    /// RGB color sampled from the color camera, if one was available.
    pub color: Option<[u8; 3]>,
}

impl Point {
    /// Create an uncolored point.
    pub fn new(position: Vec3) -> Self {
        Self {
            position,
            color: None,
        }
    }

    /// Create a colored point.
    pub fn colored(position: Vec3, color: [u8; 3]) -> Self {
        Self {
            position,
            color: Some(color),
        }
    }

    /// Return a copy of this point moved to `position`, keeping its color.
    pub fn with_position(&self, position: Vec3) -> Self {
        Self {
            position,
            color: self.color,
        }
    }

    /// Position as a plain array, the form spatial indices work with.
    pub fn to_array(&self) -> [f32; 3] {
        self.position.to_array()
    }
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: Vec3,
    pub max: Vec3,
}

impl Bounds {
    /// Compute the bounds of a set of points. Returns `None` for an empty set.
    pub fn from_points(points: &[Point]) -> Option<Self> {
        let first = points.first()?;
        let mut min = first.position;
        let mut max = first.position;

        for p in &points[1..] {
            min = min.min(p.position);
            max = max.max(p.position);
        }

        Some(Self { min, max })
    }

    /// Size of the box along each axis.
    pub fn extent(&self) -> Vec3 {
        self.max - self.min
    }

    /// Center of the box.
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Whether `position` lies inside the box (inclusive).
    pub fn contains(&self, position: Vec3) -> bool {
        position.cmpge(self.min).all() && position.cmple(self.max).all()
    }

    /// Upper bound on the number of cells of an origin-aligned grid with edge
    /// `cell` that the box can intersect.
    ///
    /// A cloud holding at most one point per occupied cell cannot exceed it.
    pub fn cell_capacity(&self, cell: f32) -> u64 {
        let extent = self.extent();
        let cells = |len: f32| (len / cell).ceil() as u64 + 1;
        cells(extent.x) * cells(extent.y) * cells(extent.z)
    }
}
