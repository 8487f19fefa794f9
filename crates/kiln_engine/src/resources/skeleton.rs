//! Bone trees and vertex weights.
//!
//! Bones are stored parent-before-child (`parent index < child index`), so a
//! single forward walk is a pre-order traversal.  Baking collapses each
//! bone's local transform through its parent chain into model space; an
//! incremental bake re-derives only subtrees rooted at bones whose local
//! transform changed since the last walk, bounding per-frame cost to the
//! dirty bones.
//!
//! The weight matrix is validated and row-renormalized at construction —
//! before any GPU buffering — and is immutable afterwards.

use glam::Mat4;

use kiln_core::Transform;

use crate::backend::{BufferId, RenderBackend};
use crate::error::EngineError;

/// One node of the bone tree.
#[derive(Debug, Clone, Copy)]
pub struct Bone {
    pub local: Transform,
    /// `None` only for the root (bone 0).
    pub parent: Option<usize>,
}

impl Bone {
    pub fn root(local: Transform) -> Self {
        Self {
            local,
            parent: None,
        }
    }

    pub fn child(local: Transform, parent: usize) -> Self {
        Self {
            local,
            parent: Some(parent),
        }
    }
}

/// Rooted tree of affine transforms, baked to contiguous model-space
/// matrices for shader storage.
pub struct Skeleton {
    bones: Vec<Bone>,
    baked: Vec<Mat4>,
    dirty: Vec<bool>,
    baked_once: bool,
    gpu: Option<BufferId>,
}

impl Skeleton {
    /// Bone 0 must be the single root; every other bone's parent must come
    /// before it in the array.
    pub fn new(bones: Vec<Bone>) -> Result<Self, EngineError> {
        if bones.is_empty() {
            return Err(EngineError::InvalidSkeleton("skeleton has no bones".into()));
        }
        if bones[0].parent.is_some() {
            return Err(EngineError::InvalidSkeleton("bone 0 must be the root".into()));
        }
        for (i, bone) in bones.iter().enumerate().skip(1) {
            match bone.parent {
                Some(p) if p < i => {}
                Some(p) => {
                    return Err(EngineError::InvalidSkeleton(format!(
                        "bone {i} references parent {p} that does not precede it"
                    )));
                }
                None => {
                    return Err(EngineError::InvalidSkeleton(format!(
                        "bone {i} has no parent; only bone 0 may be the root"
                    )));
                }
            }
        }
        let n = bones.len();
        Ok(Self {
            bones,
            baked: vec![Mat4::IDENTITY; n],
            dirty: vec![false; n],
            baked_once: false,
            gpu: None,
        })
    }

    pub fn bone_count(&self) -> usize {
        self.bones.len()
    }

    /// Replaces one bone's local transform and marks its subtree stale.
    pub fn set_local(&mut self, index: usize, local: Transform) -> Result<(), EngineError> {
        let bone = self.bones.get_mut(index).ok_or_else(|| {
            EngineError::InvalidSkeleton(format!("bone index {index} out of range"))
        })?;
        bone.local = local;
        self.dirty[index] = true;
        Ok(())
    }

    /// Pre-order bake.  Returns how many bones were re-derived: a bone is
    /// rebaked when its own local transform is dirty or any ancestor was
    /// rebaked this walk.
    pub fn bake(&mut self) -> usize {
        let n = self.bones.len();
        let mut rebaked = vec![false; n];
        let mut count = 0;
        for i in 0..n {
            let parent_rebaked = self.bones[i].parent.map_or(false, |p| rebaked[p]);
            if !self.baked_once || self.dirty[i] || parent_rebaked {
                let parent_m = self.bones[i]
                    .parent
                    .map(|p| self.baked[p])
                    .unwrap_or(Mat4::IDENTITY);
                self.baked[i] = self.bones[i].local.matrix_under(&parent_m);
                rebaked[i] = true;
                count += 1;
            }
            self.dirty[i] = false;
        }
        self.baked_once = true;
        count
    }

    /// Model-space matrices from the last bake.
    pub fn baked(&self) -> &[Mat4] {
        &self.baked
    }

    /// Bakes and buffers the contiguous bone matrices.  Render-thread only.
    pub fn sync(&mut self, backend: &mut dyn RenderBackend) -> Result<BufferId, EngineError> {
        let rebaked = self.bake();
        match self.gpu {
            Some(buf) => {
                if rebaked > 0 {
                    backend.write_buffer(buf, 0, bytemuck::cast_slice(&self.staging()))?;
                }
                Ok(buf)
            }
            None => {
                let buf = backend.create_storage_buffer(bytemuck::cast_slice(&self.staging()))?;
                self.gpu = Some(buf);
                Ok(buf)
            }
        }
    }

    fn staging(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.baked.len() * 16);
        for m in &self.baked {
            out.extend_from_slice(&m.to_cols_array());
        }
        out
    }

    pub fn close(&mut self, backend: &mut dyn RenderBackend) {
        if let Some(buf) = self.gpu.take() {
            backend.destroy_buffer(buf);
        }
    }
}

/// Row-normalized vertex × bone weight table.
pub struct WeightMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
    gpu: Option<BufferId>,
}

impl WeightMatrix {
    /// `data` is row-major, `rows * cols` long.  Every row must sum to a
    /// positive value and is renormalized to sum exactly 1; a zero-sum row
    /// fails construction before any GPU buffering can happen.
    pub fn new(rows: usize, cols: usize, mut data: Vec<f32>) -> Result<Self, EngineError> {
        if rows == 0 || cols == 0 {
            return Err(EngineError::InvalidSkeleton(
                "weight matrix has no rows or no columns".into(),
            ));
        }
        if data.len() != rows * cols {
            return Err(EngineError::InvalidSkeleton(format!(
                "{} weights for {rows}x{cols} matrix",
                data.len()
            )));
        }
        for (r, row) in data.chunks_exact_mut(cols).enumerate() {
            let sum: f32 = row.iter().sum();
            if !(sum > 0.0) {
                return Err(EngineError::InvalidSkeleton(format!(
                    "weight row {r} sums to {sum}; every vertex needs positive total weight"
                )));
            }
            for w in row {
                *w /= sum;
            }
        }
        Ok(Self {
            rows,
            cols,
            data,
            gpu: None,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Buffers the weights on first use.  Render-thread only.
    pub fn sync(&mut self, backend: &mut dyn RenderBackend) -> Result<BufferId, EngineError> {
        match self.gpu {
            Some(buf) => Ok(buf),
            None => {
                let buf = backend.create_storage_buffer(bytemuck::cast_slice(&self.data))?;
                self.gpu = Some(buf);
                Ok(buf)
            }
        }
    }

    pub fn close(&mut self, backend: &mut dyn RenderBackend) {
        if let Some(buf) = self.gpu.take() {
            backend.destroy_buffer(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn chain(n: usize) -> Skeleton {
        let mut bones = vec![Bone::root(Transform::IDENTITY)];
        for i in 1..n {
            bones.push(Bone::child(
                Transform::from_position(Vec3::new(1.0, 0.0, 0.0)),
                i - 1,
            ));
        }
        Skeleton::new(bones).unwrap()
    }

    #[test]
    fn rejects_forward_parent_references() {
        let bones = vec![
            Bone::root(Transform::IDENTITY),
            Bone::child(Transform::IDENTITY, 2),
            Bone::child(Transform::IDENTITY, 0),
        ];
        assert!(matches!(
            Skeleton::new(bones),
            Err(EngineError::InvalidSkeleton(_))
        ));
    }

    #[test]
    fn bake_composes_through_parent_chain() {
        let mut skel = chain(3);
        skel.bake();
        let (_, _, tip) = skel.baked()[2].to_scale_rotation_translation();
        assert!((tip - Vec3::new(2.0, 0.0, 0.0)).length() < 1e-5);
    }

    #[test]
    fn incremental_bake_touches_only_dirty_subtree() {
        // Root with two independent chains: 0 → (1 → 2) and (3 → 4).
        let bones = vec![
            Bone::root(Transform::IDENTITY),
            Bone::child(Transform::from_position(Vec3::X), 0),
            Bone::child(Transform::from_position(Vec3::X), 1),
            Bone::child(Transform::from_position(Vec3::Y), 0),
            Bone::child(Transform::from_position(Vec3::Y), 3),
        ];
        let mut skel = Skeleton::new(bones).unwrap();
        assert_eq!(skel.bake(), 5, "first bake walks everything");
        assert_eq!(skel.bake(), 0, "clean skeleton rebakes nothing");

        skel.set_local(3, Transform::from_position(Vec3::Z)).unwrap();
        assert_eq!(skel.bake(), 2, "only bone 3 and its descendant rebake");
        let (_, _, tip) = skel.baked()[4].to_scale_rotation_translation();
        assert!((tip - Vec3::new(0.0, 1.0, 1.0)).length() < 1e-5);
    }

    #[test]
    fn zero_sum_weight_row_fails_construction() {
        let err = WeightMatrix::new(2, 2, vec![0.5, 0.5, 0.0, 0.0]);
        assert!(matches!(err, Err(EngineError::InvalidSkeleton(_))));
    }

    #[test]
    fn rows_are_renormalized() {
        let w = WeightMatrix::new(1, 3, vec![2.0, 2.0, 4.0]).unwrap();
        assert_eq!(w.data, vec![0.25, 0.25, 0.5]);
    }

    #[test]
    fn weight_shape_must_match_payload() {
        assert!(WeightMatrix::new(2, 3, vec![1.0; 5]).is_err());
    }
}
