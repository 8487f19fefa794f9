//! Affine transform: position, rotation (quaternion), scale.
//!
//! `Transform` is `Copy` and `Default`, so it embeds cheaply in instance
//! arrays and bone trees.  Call `.matrix()` for the combined model matrix,
//! or `.write_cols()` to append the column-major floats to a staging buffer
//! before upload.

use glam::{Mat4, Quat, Vec3};

/// Rigid/affine transform used for renderable instances and skeleton bones.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    /// Translation.
    pub position: Vec3,
    /// Orientation as a unit quaternion.
    pub rotation: Quat,
    /// Non-uniform scale factor.
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform {
    /// Identity transform — no translation, no rotation, uniform scale 1.
    pub const IDENTITY: Self = Self {
        position: Vec3::ZERO,
        rotation: Quat::IDENTITY,
        scale: Vec3::ONE,
    };

    /// Construct with a position, identity rotation and scale.
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    /// Construct from an axis-angle rotation around `axis` by `angle` radians.
    pub fn from_axis_angle(axis: Vec3, angle: f32) -> Self {
        Self {
            rotation: Quat::from_axis_angle(axis, angle),
            ..Default::default()
        }
    }

    /// Recover a transform from an affine matrix.
    ///
    /// Lossy for matrices carrying shear; scale/rotation/translation are
    /// taken from `glam`'s decomposition.
    pub fn from_matrix(m: &Mat4) -> Self {
        let (scale, rotation, position) = m.to_scale_rotation_translation();
        Self {
            position,
            rotation,
            scale,
        }
    }

    /// Build the TRS model matrix (`T * R * S`).
    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }

    /// Compose `self` after `parent`, as a matrix product.
    ///
    /// Used when collapsing a bone tree into model space: the result maps a
    /// child's local space through its parent chain.
    pub fn matrix_under(&self, parent: &Mat4) -> Mat4 {
        *parent * self.matrix()
    }

    /// Append the column-major matrix floats to `out`.
    ///
    /// Staging helper for contiguous instance/bone uploads; 16 floats per
    /// call, matching `mat4x4<f32>` in shader storage blocks.
    pub fn write_cols(&self, out: &mut Vec<f32>) {
        out.extend_from_slice(&self.matrix().to_cols_array());
    }

    /// Apply a translation offset.
    pub fn translate(&mut self, offset: Vec3) {
        self.position += offset;
    }

    /// Rotate by `angle` radians around the given axis.
    pub fn rotate_axis(&mut self, axis: Vec3, angle: f32) {
        self.rotation = Quat::from_axis_angle(axis, angle) * self.rotation;
    }

    /// Set uniform scale.
    pub fn set_scale_uniform(&mut self, s: f32) {
        self.scale = Vec3::splat(s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_matrix() {
        let t = Transform::default();
        assert!((t.matrix() - Mat4::IDENTITY).abs_diff_eq(Mat4::ZERO, 1e-6));
    }

    #[test]
    fn translation_only() {
        let t = Transform::from_position(Vec3::new(1.0, 2.0, 3.0));
        let (_, _, pos) = t.matrix().to_scale_rotation_translation();
        assert!((pos - Vec3::new(1.0, 2.0, 3.0)).length() < 1e-5);
    }

    #[test]
    fn compose_under_parent() {
        let parent = Transform::from_position(Vec3::new(1.0, 0.0, 0.0)).matrix();
        let child = Transform::from_position(Vec3::new(0.0, 2.0, 0.0));
        let m = child.matrix_under(&parent);
        let (_, _, pos) = m.to_scale_rotation_translation();
        assert!((pos - Vec3::new(1.0, 2.0, 0.0)).length() < 1e-5);
    }

    #[test]
    fn write_cols_appends_sixteen_floats() {
        let mut out = Vec::new();
        Transform::IDENTITY.write_cols(&mut out);
        Transform::from_position(Vec3::X).write_cols(&mut out);
        assert_eq!(out.len(), 32);
        // Identity's first column is (1, 0, 0, 0).
        assert_eq!(&out[0..4], &[1.0, 0.0, 0.0, 0.0]);
        // Second matrix carries the translation in its last column.
        assert_eq!(&out[28..32], &[1.0, 0.0, 0.0, 1.0]);
    }
}
