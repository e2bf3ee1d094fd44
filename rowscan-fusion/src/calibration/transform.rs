//! Rigid-body transforms

use glam::{Affine3A, Mat3, Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Rotation followed by translation. Maps points from a camera's frame into
/// the shared frame when used as extrinsics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RigidTransform {
    pub rotation: Quat,
    pub translation: Vec3,
}

impl Default for RigidTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl RigidTransform {
    pub const IDENTITY: Self = Self {
        rotation: Quat::IDENTITY,
        translation: Vec3::ZERO,
    };

    pub fn new(rotation: Quat, translation: Vec3) -> Self {
        Self {
            rotation: rotation.normalize(),
            translation,
        }
    }

    pub fn from_translation(translation: Vec3) -> Self {
        Self::new(Quat::IDENTITY, translation)
    }

    /// Build from a rotation matrix, which must be orthonormal.
    pub fn from_rotation_matrix(rotation: Mat3, translation: Vec3) -> Self {
        Self::new(Quat::from_mat3(&rotation), translation)
    }

    pub fn apply(&self, point: Vec3) -> Vec3 {
        self.rotation * point + self.translation
    }

    /// `self` applied after `first`.
    pub fn compose(&self, first: &RigidTransform) -> Self {
        Self::new(
            self.rotation * first.rotation,
            self.rotation * first.translation + self.translation,
        )
    }

    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.inverse();
        Self::new(rotation, -(rotation * self.translation))
    }

    pub fn rotation_matrix(&self) -> Mat3 {
        Mat3::from_quat(self.rotation)
    }

    pub fn to_affine(&self) -> Affine3A {
        Affine3A::from_rotation_translation(self.rotation, self.translation)
    }

    /// Rotation angle in radians.
    pub fn rotation_angle(&self) -> f32 {
        self.angle_to(&Self::IDENTITY)
    }

    /// Angle of the rotation taking `self`'s orientation to `other`'s.
    pub fn angle_to(&self, other: &RigidTransform) -> f32 {
        let delta = self.rotation.conjugate() * other.rotation;
        2.0 * delta.xyz().length().atan2(delta.w.abs())
    }

    pub fn is_finite(&self) -> bool {
        self.rotation.is_finite() && self.translation.is_finite()
    }

    pub fn approx_eq(&self, other: &RigidTransform, angle_eps: f32, translation_eps: f32) -> bool {
        self.angle_to(other) <= angle_eps
            && (self.translation - other.translation).length() <= translation_eps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    #[test]
    fn test_compose_applies_right_first() {
        let rotate = RigidTransform::new(Quat::from_rotation_z(FRAC_PI_2), Vec3::ZERO);
        let shift = RigidTransform::from_translation(Vec3::new(1.0, 0.0, 0.0));

        let p = rotate.compose(&shift).apply(Vec3::ZERO);
        assert!((p - Vec3::new(0.0, 1.0, 0.0)).length() < 1e-6);

        let q = shift.compose(&rotate).apply(Vec3::ZERO);
        assert!((q - Vec3::new(1.0, 0.0, 0.0)).length() < 1e-6);
    }

    #[test]
    fn test_inverse_round_trips_points() {
        let t = RigidTransform::new(
            Quat::from_euler(glam::EulerRot::XYZ, 0.3, -0.2, 1.1),
            Vec3::new(120.0, -40.0, 900.0),
        );
        let p = Vec3::new(5.0, 6.0, 7.0);
        assert!((t.inverse().apply(t.apply(p)) - p).length() < 1e-3);
        assert!(t.compose(&t.inverse()).approx_eq(&RigidTransform::IDENTITY, 1e-3, 1e-3));
    }

    #[test]
    fn test_affine_matches_apply() {
        let t = RigidTransform::new(Quat::from_rotation_x(0.4), Vec3::new(1.0, 2.0, 3.0));
        let p = Vec3::new(-3.0, 0.5, 2.0);
        assert!((t.to_affine().transform_point3(p) - t.apply(p)).length() < 1e-5);
    }
}
