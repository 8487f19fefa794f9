//! Triangle mesh with per-attribute dirty tracking.
//!
//! CPU-side attribute arrays are the source of truth; the render thread
//! calls [`Mesh::sync`] before drawing, which either allocates all GPU
//! buffers (first buffering, vertex-count change, forced rebuffer) or
//! rewrites exactly the dirty attributes in place.  Triangle-index changes
//! always reallocate the index buffer.
//!
//! Every mutation validates before touching state, so a rejected update
//! leaves the previous valid data untouched.  `sync` additionally
//! cross-checks the arrays and, if they disagree, restores the last
//! snapshot that buffered successfully instead of failing the draw.

use glam::{Vec2, Vec3};

use crate::backend::{BufferId, RenderBackend, VertexStream};
use crate::error::EngineError;

/// Substitute normal for vertices whose accumulated normal is degenerate.
pub const FALLBACK_NORMAL: Vec3 = Vec3::Z;

const DEGENERATE_SQ: f32 = 1e-12;

/// Pending GPU updates, one flag per attribute.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeshDirty {
    pub positions: bool,
    pub uvs: bool,
    pub normals: bool,
    /// Triangle indices changed (content); always a full index reallocation.
    pub triangles: bool,
    /// Vertex count changed; sub-updates are impossible, reallocate.
    pub resized: bool,
    /// Full rebuffer requested explicitly or by read-only promotion.
    pub rebuffer: bool,
}

impl MeshDirty {
    fn any(&self) -> bool {
        self.positions || self.uvs || self.normals || self.triangles || self.resized || self.rebuffer
    }
}

#[derive(Debug, Clone, PartialEq)]
struct MeshData {
    positions: Vec<Vec3>,
    uvs: Vec<Vec2>,
    normals: Vec<Vec3>,
    triangles: Vec<u32>,
}

/// GPU-side buffers of a mesh that has been buffered at least once.
#[derive(Debug, Clone, Copy)]
pub struct MeshBuffers {
    pub positions: BufferId,
    pub uvs: BufferId,
    pub normals: BufferId,
    pub indices: BufferId,
    pub vertex_count: u32,
    pub index_count: u32,
}

pub struct Mesh {
    data: MeshData,
    /// Last state that passed cross-validation and buffered successfully.
    valid: MeshData,
    dirty: MeshDirty,
    read_only: bool,
    closed: bool,
    gpu: Option<MeshBuffers>,
}

impl Mesh {
    /// Builds a mesh from attribute arrays.
    ///
    /// `normals` may be `None`, in which case they are derived from the
    /// triangle faces.  Triangle indices must come in multiples of three and
    /// stay within `[0, positions.len())`.
    pub fn new(
        positions: Vec<Vec3>,
        uvs: Vec<Vec2>,
        normals: Option<Vec<Vec3>>,
        triangles: Vec<u32>,
    ) -> Result<Self, EngineError> {
        validate_arrays(&positions, &uvs, normals.as_deref(), &triangles)?;
        let normals = normals.unwrap_or_else(|| derive_normals(&positions, &triangles));
        let data = MeshData {
            positions,
            uvs,
            normals,
            triangles,
        };
        Ok(Self {
            valid: data.clone(),
            data,
            dirty: MeshDirty::default(),
            read_only: false,
            closed: false,
            gpu: None,
        })
    }

    pub fn vertex_count(&self) -> usize {
        self.data.positions.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.data.triangles.len() / 3
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn dirty(&self) -> MeshDirty {
        self.dirty
    }

    fn check_mutable(&self) -> Result<(), EngineError> {
        if self.closed {
            return Err(EngineError::ObjectClosed);
        }
        if self.read_only {
            return Err(EngineError::ReadOnly);
        }
        Ok(())
    }

    /// Replaces attribute arrays.
    ///
    /// `triangles: None` keeps the current indices (they are re-checked
    /// against the new vertex count); `normals: None` re-derives them.  On
    /// any validation failure nothing is mutated.
    pub fn set_attributes(
        &mut self,
        positions: Vec<Vec3>,
        uvs: Vec<Vec2>,
        normals: Option<Vec<Vec3>>,
        triangles: Option<Vec<u32>>,
    ) -> Result<(), EngineError> {
        self.check_mutable()?;
        let triangles_changed = triangles.is_some();
        let tri = match triangles {
            Some(t) => t,
            None => self.data.triangles.clone(),
        };
        validate_arrays(&positions, &uvs, normals.as_deref(), &tri)?;
        let normals = normals.unwrap_or_else(|| derive_normals(&positions, &tri));

        if positions.len() != self.data.positions.len() {
            self.dirty.resized = true;
        }
        self.dirty.positions = true;
        self.dirty.uvs = true;
        self.dirty.normals = true;
        self.dirty.triangles |= triangles_changed;

        self.data = MeshData {
            positions,
            uvs,
            normals,
            triangles: tri,
        };
        Ok(())
    }

    /// Re-derives vertex normals from the current triangles.
    pub fn recalculate_normals(&mut self) -> Result<(), EngineError> {
        self.check_mutable()?;
        self.data.normals = derive_normals(&self.data.positions, &self.data.triangles);
        self.dirty.normals = true;
        Ok(())
    }

    /// Forces a full reallocation on the next sync.
    pub fn force_rebuffer(&mut self) -> Result<(), EngineError> {
        self.check_mutable()?;
        self.dirty.rebuffer = true;
        Ok(())
    }

    /// Promotes the mesh to read-only.  One-way: there is no demotion, and
    /// every later mutation fails with [`EngineError::ReadOnly`].
    pub fn set_read_only(&mut self) -> Result<(), EngineError> {
        if self.closed {
            return Err(EngineError::ObjectClosed);
        }
        if !self.read_only {
            self.read_only = true;
            self.dirty.rebuffer = true;
        }
        Ok(())
    }

    /// Uploads pending changes and returns the live buffers.
    ///
    /// Render-thread only.  If the arrays are inconsistent at this point the
    /// mesh reverts to its last-known-valid snapshot and buffers that
    /// instead — the draw proceeds, the bad update is discarded.
    pub fn sync(&mut self, backend: &mut dyn RenderBackend) -> Result<MeshBuffers, EngineError> {
        if self.closed {
            return Err(EngineError::ObjectClosed);
        }
        if validate_arrays(
            &self.data.positions,
            &self.data.uvs,
            Some(&self.data.normals),
            &self.data.triangles,
        )
        .is_err()
        {
            log::warn!("mesh state invalid at render time; reverting to last valid snapshot");
            self.data = self.valid.clone();
            self.dirty.rebuffer = true;
        }

        let vertex_count = self.data.positions.len() as u32;
        let needs_full = match &self.gpu {
            None => true,
            Some(g) => g.vertex_count != vertex_count || self.dirty.resized || self.dirty.rebuffer,
        };

        if needs_full {
            self.release_buffers(backend);
            let buffers = MeshBuffers {
                positions: backend.create_vertex_buffer(
                    VertexStream::Positions,
                    bytemuck::cast_slice(&self.data.positions),
                )?,
                uvs: backend.create_vertex_buffer(
                    VertexStream::Uvs,
                    bytemuck::cast_slice(&self.data.uvs),
                )?,
                normals: backend.create_vertex_buffer(
                    VertexStream::Normals,
                    bytemuck::cast_slice(&self.data.normals),
                )?,
                indices: backend.create_index_buffer(bytemuck::cast_slice(&self.data.triangles))?,
                vertex_count,
                index_count: self.data.triangles.len() as u32,
            };
            self.gpu = Some(buffers);
        } else if self.dirty.any() {
            // Same vertex count: rewrite only the dirty attribute streams.
            let gpu = self.gpu.as_mut().ok_or(EngineError::ObjectClosed)?;
            if self.dirty.positions {
                backend.write_buffer(gpu.positions, 0, bytemuck::cast_slice(&self.data.positions))?;
            }
            if self.dirty.uvs {
                backend.write_buffer(gpu.uvs, 0, bytemuck::cast_slice(&self.data.uvs))?;
            }
            if self.dirty.normals {
                backend.write_buffer(gpu.normals, 0, bytemuck::cast_slice(&self.data.normals))?;
            }
            if self.dirty.triangles {
                // Index layout may change length; never sub-updated.
                backend.destroy_buffer(gpu.indices);
                gpu.indices =
                    backend.create_index_buffer(bytemuck::cast_slice(&self.data.triangles))?;
                gpu.index_count = self.data.triangles.len() as u32;
            }
        }

        self.valid = self.data.clone();
        self.dirty = MeshDirty::default();
        self.gpu.ok_or(EngineError::ObjectClosed)
    }

    /// Releases GPU buffers and marks the mesh closed.  Idempotent.
    pub fn close(&mut self, backend: &mut dyn RenderBackend) {
        self.release_buffers(backend);
        self.closed = true;
    }

    fn release_buffers(&mut self, backend: &mut dyn RenderBackend) {
        if let Some(g) = self.gpu.take() {
            backend.destroy_buffer(g.positions);
            backend.destroy_buffer(g.uvs);
            backend.destroy_buffer(g.normals);
            backend.destroy_buffer(g.indices);
        }
    }
}

fn validate_arrays(
    positions: &[Vec3],
    uvs: &[Vec2],
    normals: Option<&[Vec3]>,
    triangles: &[u32],
) -> Result<(), EngineError> {
    let n = positions.len();
    if n == 0 {
        return Err(EngineError::InvalidMesh("mesh has no vertices".into()));
    }
    if uvs.len() != n {
        return Err(EngineError::InvalidMesh(format!(
            "{} uv coordinates for {n} vertices",
            uvs.len()
        )));
    }
    if let Some(norms) = normals {
        if norms.len() != n {
            return Err(EngineError::InvalidMesh(format!(
                "{} normals for {n} vertices",
                norms.len()
            )));
        }
    }
    if triangles.len() % 3 != 0 {
        return Err(EngineError::InvalidMesh(format!(
            "triangle index count {} is not a multiple of 3",
            triangles.len()
        )));
    }
    if let Some(bad) = triangles.iter().find(|&&i| i as usize >= n) {
        return Err(EngineError::InvalidMesh(format!(
            "triangle index {bad} out of range for {n} vertices"
        )));
    }
    Ok(())
}

/// Area-weighted vertex normals.
///
/// Each triangle's unnormalized face normal (cross product of two edges) is
/// accumulated into its three vertices — larger triangles weigh more — then
/// every sum is normalized, substituting [`FALLBACK_NORMAL`] where the
/// accumulation is degenerate.
pub fn derive_normals(positions: &[Vec3], triangles: &[u32]) -> Vec<Vec3> {
    let mut acc = vec![Vec3::ZERO; positions.len()];
    for tri in triangles.chunks_exact(3) {
        let (a, b, c) = (tri[0] as usize, tri[1] as usize, tri[2] as usize);
        let face = (positions[b] - positions[a]).cross(positions[c] - positions[a]);
        acc[a] += face;
        acc[b] += face;
        acc[c] += face;
    }
    acc.into_iter()
        .map(|v| {
            if v.length_squared() <= DEGENERATE_SQ {
                FALLBACK_NORMAL
            } else {
                v.normalize()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;

    fn quad() -> Mesh {
        Mesh::new(
            vec![
                Vec3::new(-1.0, -1.0, 0.0),
                Vec3::new(1.0, -1.0, 0.0),
                Vec3::new(1.0, 1.0, 0.0),
                Vec3::new(-1.0, 1.0, 0.0),
            ],
            vec![
                Vec2::new(0.0, 0.0),
                Vec2::new(1.0, 0.0),
                Vec2::new(1.0, 1.0),
                Vec2::new(0.0, 1.0),
            ],
            None,
            vec![0, 1, 2, 2, 3, 0],
        )
        .unwrap()
    }

    #[test]
    fn rejects_index_count_not_multiple_of_three() {
        let err = Mesh::new(
            vec![Vec3::ZERO; 3],
            vec![Vec2::ZERO; 3],
            None,
            vec![0, 1],
        );
        assert!(matches!(err, Err(EngineError::InvalidMesh(_))));
    }

    #[test]
    fn rejects_out_of_range_index() {
        let err = Mesh::new(
            vec![Vec3::ZERO; 3],
            vec![Vec2::ZERO; 3],
            None,
            vec![0, 1, 3],
        );
        assert!(matches!(err, Err(EngineError::InvalidMesh(_))));
    }

    #[test]
    fn invalid_update_leaves_state_untouched() {
        let mut mesh = quad();
        let before = mesh.data.clone();
        // New positions drop a vertex the retained triangles still index.
        let err = mesh.set_attributes(
            vec![Vec3::ZERO; 3],
            vec![Vec2::ZERO; 3],
            None,
            None,
        );
        assert!(matches!(err, Err(EngineError::InvalidMesh(_))));
        assert_eq!(mesh.data, before);
    }

    #[test]
    fn null_triangles_preserve_existing_indices() {
        let mut mesh = quad();
        let tris = mesh.data.triangles.clone();
        mesh.set_attributes(
            vec![Vec3::X; 4],
            vec![Vec2::ONE; 4],
            Some(vec![Vec3::Y; 4]),
            None,
        )
        .unwrap();
        assert_eq!(mesh.data.triangles, tris);
        assert_eq!(mesh.data.positions, vec![Vec3::X; 4]);
    }

    #[test]
    fn read_only_is_permanent() {
        let mut mesh = quad();
        mesh.set_read_only().unwrap();
        assert!(matches!(
            mesh.recalculate_normals(),
            Err(EngineError::ReadOnly)
        ));
        assert!(matches!(mesh.force_rebuffer(), Err(EngineError::ReadOnly)));
        assert!(matches!(
            mesh.set_attributes(vec![Vec3::ZERO; 4], vec![Vec2::ZERO; 4], None, None),
            Err(EngineError::ReadOnly)
        ));
        // Still read-only after another (idempotent) promotion.
        mesh.set_read_only().unwrap();
        assert!(matches!(mesh.force_rebuffer(), Err(EngineError::ReadOnly)));
    }

    #[test]
    fn degenerate_accumulation_falls_back() {
        // All vertices collinear: every face normal is zero.
        let normals = derive_normals(
            &[Vec3::ZERO, Vec3::X, Vec3::X * 2.0],
            &[0, 1, 2],
        );
        assert!(normals.iter().all(|&n| n == FALLBACK_NORMAL));
    }

    #[test]
    fn derived_normals_are_area_weighted_and_unit_length() {
        let mesh = quad();
        for n in &mesh.data.normals {
            assert!((n.length() - 1.0).abs() < 1e-5);
            assert!((*n - Vec3::Z).length() < 1e-5);
        }
    }

    #[test]
    fn first_sync_allocates_then_partial_updates_write_in_place() {
        let mut backend = HeadlessBackend::new();
        let stats = backend.stats();
        let mut mesh = quad();

        mesh.sync(&mut backend).unwrap();
        assert_eq!(stats.lock().buffers_created, 4);

        // Same vertex count: one attribute dirty → one in-place write.
        mesh.set_attributes(
            vec![Vec3::Y; 4],
            vec![Vec2::ZERO; 4],
            Some(vec![Vec3::Z; 4]),
            None,
        )
        .unwrap();
        mesh.sync(&mut backend).unwrap();
        let s = stats.lock();
        assert_eq!(s.buffers_created, 4, "no reallocation for same-size update");
        assert_eq!(s.buffer_writes, 3, "positions, uvs, normals rewritten");
    }

    #[test]
    fn triangle_update_reallocates_index_buffer() {
        let mut backend = HeadlessBackend::new();
        let stats = backend.stats();
        let mut mesh = quad();
        mesh.sync(&mut backend).unwrap();

        mesh.set_attributes(
            vec![Vec3::ZERO; 4],
            vec![Vec2::ZERO; 4],
            Some(vec![Vec3::Z; 4]),
            Some(vec![0, 2, 1]),
        )
        .unwrap();
        let buffers = mesh.sync(&mut backend).unwrap();
        assert_eq!(buffers.index_count, 3);
        let s = stats.lock();
        assert_eq!(s.buffers_destroyed, 1, "old index buffer released");
        assert_eq!(s.buffers_created, 5, "new index buffer allocated");
    }

    #[test]
    fn vertex_count_change_forces_full_reallocation() {
        let mut backend = HeadlessBackend::new();
        let stats = backend.stats();
        let mut mesh = quad();
        mesh.sync(&mut backend).unwrap();

        mesh.set_attributes(
            vec![Vec3::ZERO; 3],
            vec![Vec2::ZERO; 3],
            None,
            Some(vec![0, 1, 2]),
        )
        .unwrap();
        mesh.sync(&mut backend).unwrap();
        let s = stats.lock();
        assert_eq!(s.buffers_destroyed, 4);
        assert_eq!(s.buffers_created, 8);
    }

    #[test]
    fn closed_mesh_fails_fast() {
        let mut backend = HeadlessBackend::new();
        let mut mesh = quad();
        mesh.close(&mut backend);
        mesh.close(&mut backend); // idempotent
        assert!(matches!(
            mesh.sync(&mut backend),
            Err(EngineError::ObjectClosed)
        ));
        assert!(matches!(
            mesh.set_read_only(),
            Err(EngineError::ObjectClosed)
        ));
    }
}
