//! The engine-level drawable unit: a mesh, a texture-unit array, instance
//! transforms, an optional skeleton with weights, and the program it is
//! currently assigned to.
//!
//! The program field is a back-reference used only for rendering-map
//! bookkeeping — the manager decides which program is live, never the
//! renderable.  Skeleton validity (weight columns == bone count, weight rows
//! == mesh vertex count) is re-checked at every render; a violation detaches
//! the skeleton silently instead of failing the draw.

use kiln_core::Transform;

use crate::backend::{BufferId, DrawSkin, RenderBackend};
use crate::error::EngineError;
use crate::resources::skeleton::{Skeleton, WeightMatrix};

pub struct Renderable {
    mesh: u32,
    /// One slot per hardware texture unit.
    textures: Vec<Option<u32>>,
    instances: Vec<Transform>,
    instances_dirty: bool,
    skeleton: Option<Skeleton>,
    weights: Option<WeightMatrix>,
    program: Option<u32>,
    instance_buf: Option<BufferId>,
    instance_capacity: u32,
    closed: bool,
}

impl Renderable {
    /// At least one instance transform is required.
    pub fn new(
        mesh: u32,
        instances: Vec<Transform>,
        max_texture_units: u32,
    ) -> Result<Self, EngineError> {
        if instances.is_empty() {
            return Err(EngineError::InvalidRenderable(
                "a renderable needs at least one instance".into(),
            ));
        }
        Ok(Self {
            mesh,
            textures: vec![None; max_texture_units as usize],
            instances,
            instances_dirty: true,
            skeleton: None,
            weights: None,
            program: None,
            instance_buf: None,
            instance_capacity: 0,
            closed: false,
        })
    }

    pub fn mesh(&self) -> u32 {
        self.mesh
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Program this renderable is filed under in the rendering map.
    pub fn program(&self) -> Option<u32> {
        self.program
    }

    pub fn set_program(&mut self, program: Option<u32>) {
        self.program = program;
    }

    pub fn instance_count(&self) -> u32 {
        self.instances.len() as u32
    }

    pub fn has_skeleton(&self) -> bool {
        self.skeleton.is_some()
    }

    fn check_open(&self) -> Result<(), EngineError> {
        if self.closed {
            return Err(EngineError::ObjectClosed);
        }
        Ok(())
    }

    /// Assigns `texture` (an id, or `None` to clear) to a texture unit.
    pub fn set_texture(&mut self, unit: u32, texture: Option<u32>) -> Result<(), EngineError> {
        self.check_open()?;
        let unit_count = self.textures.len();
        let slot = self.textures.get_mut(unit as usize).ok_or_else(|| {
            EngineError::InvalidRenderable(format!(
                "texture unit {unit} out of range ({unit_count} units)"
            ))
        })?;
        *slot = texture;
        Ok(())
    }

    /// Occupied (unit, texture id) pairs.
    pub fn texture_units(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.textures
            .iter()
            .enumerate()
            .filter_map(|(unit, t)| t.map(|id| (unit as u32, id)))
    }

    /// Drops every slot referencing `texture`.  Used when a texture closes.
    pub fn clear_texture_refs(&mut self, texture: u32) {
        for slot in &mut self.textures {
            if *slot == Some(texture) {
                *slot = None;
            }
        }
    }

    pub fn set_instances(&mut self, instances: Vec<Transform>) -> Result<(), EngineError> {
        self.check_open()?;
        if instances.is_empty() {
            return Err(EngineError::InvalidRenderable(
                "a renderable needs at least one instance".into(),
            ));
        }
        self.instances = instances;
        self.instances_dirty = true;
        Ok(())
    }

    /// Attaches a skeleton and its weight matrix.  Dimension agreement with
    /// the mesh is deliberately not checked here — the render path checks it
    /// every frame and detaches on mismatch.
    pub fn attach_skeleton(
        &mut self,
        skeleton: Skeleton,
        weights: WeightMatrix,
    ) -> Result<(), EngineError> {
        self.check_open()?;
        self.skeleton = Some(skeleton);
        self.weights = Some(weights);
        Ok(())
    }

    /// Updates one bone's local transform.  Requires an attached skeleton.
    pub fn set_bone_local(&mut self, bone: usize, local: Transform) -> Result<(), EngineError> {
        self.check_open()?;
        match &mut self.skeleton {
            Some(skel) => skel.set_local(bone, local),
            None => Err(EngineError::InvalidRenderable(
                "no skeleton attached".into(),
            )),
        }
    }

    /// Whether the attached skeleton agrees with the mesh's vertex count.
    /// Vacuously true without a skeleton.
    pub fn skeleton_ok(&self, mesh_vertex_count: usize) -> bool {
        match (&self.skeleton, &self.weights) {
            (Some(skel), Some(w)) => {
                w.cols() == skel.bone_count() && w.rows() == mesh_vertex_count
            }
            (None, None) => true,
            // Half-attached state never survives a render call.
            _ => false,
        }
    }

    /// Releases skeleton + weights and their buffers.
    pub fn detach_skeleton(&mut self, backend: &mut dyn RenderBackend) {
        if let Some(mut skel) = self.skeleton.take() {
            skel.close(backend);
        }
        if let Some(mut w) = self.weights.take() {
            w.close(backend);
        }
    }

    /// Buffers skeleton + weights, returning the skinning inputs for this
    /// draw, or `None` for an unskinned renderable.  Render-thread only.
    pub fn sync_skin(
        &mut self,
        backend: &mut dyn RenderBackend,
    ) -> Result<Option<DrawSkin>, EngineError> {
        let (skel, weights) = match (&mut self.skeleton, &mut self.weights) {
            (Some(s), Some(w)) => (s, w),
            _ => return Ok(None),
        };
        let skeleton_buf = skel.sync(backend)?;
        let weights_buf = weights.sync(backend)?;
        Ok(Some(DrawSkin {
            skeleton: skeleton_buf,
            weights: weights_buf,
            bone_count: skel.bone_count() as u32,
        }))
    }

    /// Buffers the contiguous instance matrices.  Render-thread only.
    pub fn sync_instances(&mut self, backend: &mut dyn RenderBackend) -> Result<BufferId, EngineError> {
        self.check_open()?;
        let count = self.instances.len() as u32;
        let needs_alloc = match self.instance_buf {
            None => true,
            Some(_) => count > self.instance_capacity,
        };
        if needs_alloc {
            if let Some(old) = self.instance_buf.take() {
                backend.destroy_buffer(old);
            }
            let buf = backend.create_storage_buffer(bytemuck::cast_slice(&self.staging()))?;
            self.instance_buf = Some(buf);
            self.instance_capacity = count;
            self.instances_dirty = false;
            return Ok(buf);
        }
        let buf = self.instance_buf.ok_or(EngineError::ObjectClosed)?;
        if self.instances_dirty {
            backend.write_buffer(buf, 0, bytemuck::cast_slice(&self.staging()))?;
            self.instances_dirty = false;
        }
        Ok(buf)
    }

    fn staging(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.instances.len() * 16);
        for t in &self.instances {
            t.write_cols(&mut out);
        }
        out
    }

    /// Releases every GPU buffer and marks the renderable closed.  Idempotent.
    pub fn close(&mut self, backend: &mut dyn RenderBackend) {
        self.detach_skeleton(backend);
        if let Some(buf) = self.instance_buf.take() {
            backend.destroy_buffer(buf);
        }
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::resources::skeleton::Bone;

    fn renderable() -> Renderable {
        Renderable::new(0, vec![Transform::IDENTITY], 4).unwrap()
    }

    #[test]
    fn needs_at_least_one_instance() {
        assert!(matches!(
            Renderable::new(0, vec![], 4),
            Err(EngineError::InvalidRenderable(_))
        ));
        let mut r = renderable();
        assert!(r.set_instances(vec![]).is_err());
    }

    #[test]
    fn texture_unit_bounds_are_enforced() {
        let mut r = renderable();
        r.set_texture(3, Some(7)).unwrap();
        assert!(r.set_texture(4, Some(7)).is_err());
        assert_eq!(r.texture_units().collect::<Vec<_>>(), vec![(3, 7)]);
        r.clear_texture_refs(7);
        assert_eq!(r.texture_units().count(), 0);
    }

    #[test]
    fn mismatched_weights_flagged_for_detach() {
        let mut r = renderable();
        let skel = Skeleton::new(vec![Bone::root(Transform::IDENTITY)]).unwrap();
        // 2 rows for a mesh that will report 4 vertices.
        let weights = WeightMatrix::new(2, 1, vec![1.0, 1.0]).unwrap();
        r.attach_skeleton(skel, weights).unwrap();
        assert!(!r.skeleton_ok(4));
        assert!(r.skeleton_ok(2));
    }

    #[test]
    fn instance_updates_reuse_the_buffer_until_growth() {
        let mut backend = HeadlessBackend::new();
        let stats = backend.stats();
        let mut r = renderable();

        r.sync_instances(&mut backend).unwrap();
        assert_eq!(stats.lock().buffers_created, 1);

        r.set_instances(vec![Transform::IDENTITY]).unwrap();
        r.sync_instances(&mut backend).unwrap();
        assert_eq!(stats.lock().buffers_created, 1, "same count rewrites in place");
        assert_eq!(stats.lock().buffer_writes, 1);

        r.set_instances(vec![Transform::IDENTITY; 3]).unwrap();
        r.sync_instances(&mut backend).unwrap();
        assert_eq!(stats.lock().buffers_created, 2, "growth reallocates");
    }
}
