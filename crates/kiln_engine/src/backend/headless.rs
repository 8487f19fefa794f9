//! Recording backend with no GPU behind it.
//!
//! Used for server-side runs and CI, and by the engine's own test suite: it
//! issues handles, tracks live objects, counts uploads, and records every
//! draw of the current frame.  Linking fails when a stage source is empty,
//! which is enough to exercise the failed-program migration path end to end.
//!
//! Stats are shared through an `Arc` so a test can keep a
//! [`HeadlessStats`] handle after the backend moves onto the render thread.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use kiln_core::Color;

use crate::shader_abi;

use super::{
    BackendError, BackendLimits, BufferId, ClearMode, DefaultProgram, DepthMode, DrawCall,
    GlobalUniforms, LinkedProgram, ProgramId, ProgramMode, ProgramSources, RenderBackend,
    TextureId, VertexStream,
};

/// One recorded draw call.
#[derive(Debug, Clone)]
pub struct DrawRecord {
    pub program: ProgramId,
    pub index_count: u32,
    pub instance_count: u32,
    pub texture_units: Vec<u32>,
    pub skinned: bool,
    pub depth: DepthMode,
}

/// Counters and per-frame records, shared between a test and the backend.
#[derive(Debug, Default)]
pub struct HeadlessCounters {
    pub buffers_created: usize,
    pub buffer_writes: usize,
    pub buffers_destroyed: usize,
    pub textures_created: usize,
    pub textures_destroyed: usize,
    pub programs_linked: usize,
    pub link_failures: usize,
    pub frames: u64,
    pub globals_uploads: usize,
    /// Clears issued in the current frame, in order.
    pub frame_clears: Vec<ClearMode>,
    /// Draws issued in the current frame, in order.
    pub frame_draws: Vec<DrawRecord>,
    /// Draws from the most recently completed frame.
    pub last_frame_draws: Vec<DrawRecord>,
}

/// Cloneable stats handle.
#[derive(Clone, Default)]
pub struct HeadlessStats(Arc<Mutex<HeadlessCounters>>);

impl HeadlessStats {
    pub fn lock(&self) -> MutexGuard<'_, HeadlessCounters> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct HeadlessBackend {
    limits: BackendLimits,
    next_handle: u64,
    buffers: HashMap<u64, usize>,
    textures: HashSet<u64>,
    programs: HashSet<u64>,
    stats: HeadlessStats,
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self {
            limits: BackendLimits {
                max_combined_texture_units: 16,
                max_texture_size: 8192,
            },
            next_handle: 1,
            buffers: HashMap::new(),
            textures: HashSet::new(),
            programs: HashSet::new(),
            stats: HeadlessStats::default(),
        }
    }

    /// Stats handle to keep around after the backend moves to the render
    /// thread.
    pub fn stats(&self) -> HeadlessStats {
        self.stats.clone()
    }

    fn issue(&mut self) -> u64 {
        let h = self.next_handle;
        self.next_handle += 1;
        h
    }

    fn placeholder_source(entry: &str) -> String {
        format!("fn {entry}() {{ }}\n")
    }
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderBackend for HeadlessBackend {
    fn limits(&self) -> BackendLimits {
        self.limits
    }

    fn default_program_sources(&self, which: DefaultProgram) -> ProgramSources {
        let tag = match which {
            DefaultProgram::Flat => "flat",
            DefaultProgram::Cubemap => "cubemap",
            DefaultProgram::Ui => "ui",
            DefaultProgram::Skybox => "skybox",
        };
        ProgramSources {
            vertex: Self::placeholder_source(&format!("vs_{tag}")),
            geometry: None,
            fragment: Self::placeholder_source(&format!("fs_{tag}")),
        }
    }

    fn create_vertex_buffer(
        &mut self,
        _stream: VertexStream,
        data: &[u8],
    ) -> Result<BufferId, BackendError> {
        let h = self.issue();
        self.buffers.insert(h, data.len());
        self.stats.lock().buffers_created += 1;
        Ok(BufferId(h))
    }

    fn create_index_buffer(&mut self, data: &[u8]) -> Result<BufferId, BackendError> {
        let h = self.issue();
        self.buffers.insert(h, data.len());
        self.stats.lock().buffers_created += 1;
        Ok(BufferId(h))
    }

    fn create_storage_buffer(&mut self, data: &[u8]) -> Result<BufferId, BackendError> {
        let h = self.issue();
        self.buffers.insert(h, data.len());
        self.stats.lock().buffers_created += 1;
        Ok(BufferId(h))
    }

    fn write_buffer(
        &mut self,
        buffer: BufferId,
        offset: u64,
        data: &[u8],
    ) -> Result<(), BackendError> {
        let size = *self
            .buffers
            .get(&buffer.0)
            .ok_or(BackendError::UnknownHandle("buffer"))?;
        if offset as usize + data.len() > size {
            return Err(BackendError::Device(format!(
                "write of {} bytes at {offset} overruns {size}-byte buffer",
                data.len()
            )));
        }
        self.stats.lock().buffer_writes += 1;
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        if self.buffers.remove(&buffer.0).is_some() {
            self.stats.lock().buffers_destroyed += 1;
        }
    }

    fn create_texture_2d(
        &mut self,
        width: u32,
        height: u32,
        rgba: &[u8],
    ) -> Result<TextureId, BackendError> {
        if rgba.len() != (width * height * 4) as usize {
            return Err(BackendError::Device(format!(
                "texture payload {} bytes, expected {}",
                rgba.len(),
                width * height * 4
            )));
        }
        let h = self.issue();
        self.textures.insert(h);
        self.stats.lock().textures_created += 1;
        Ok(TextureId(h))
    }

    fn create_texture_cubemap(
        &mut self,
        size: u32,
        faces: &[Vec<u8>; 6],
    ) -> Result<TextureId, BackendError> {
        let face_bytes = (size * size * 4) as usize;
        if faces.iter().any(|f| f.len() != face_bytes) {
            return Err(BackendError::Device("cubemap face size mismatch".into()));
        }
        let h = self.issue();
        self.textures.insert(h);
        self.stats.lock().textures_created += 1;
        Ok(TextureId(h))
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        if self.textures.remove(&texture.0) {
            self.stats.lock().textures_destroyed += 1;
        }
    }

    fn link_program(
        &mut self,
        sources: &ProgramSources,
        _mode: ProgramMode,
    ) -> Result<LinkedProgram, BackendError> {
        if sources.vertex.trim().is_empty() || sources.fragment.trim().is_empty() {
            self.stats.lock().link_failures += 1;
            return Err(BackendError::Link("empty stage source".into()));
        }
        let h = self.issue();
        self.programs.insert(h);
        self.stats.lock().programs_linked += 1;
        Ok(LinkedProgram {
            id: ProgramId(h),
            resources: shader_abi::standard_resource_map(),
        })
    }

    fn validate_program(&mut self, program: ProgramId) -> Result<(), BackendError> {
        if self.programs.contains(&program.0) {
            Ok(())
        } else {
            Err(BackendError::UnknownHandle("program"))
        }
    }

    fn destroy_program(&mut self, program: ProgramId) {
        self.programs.remove(&program.0);
    }

    fn begin_frame(&mut self) -> Result<(), BackendError> {
        let mut s = self.stats.lock();
        s.frame_clears.clear();
        s.frame_draws.clear();
        Ok(())
    }

    fn set_globals(&mut self, _globals: &GlobalUniforms) -> Result<(), BackendError> {
        self.stats.lock().globals_uploads += 1;
        Ok(())
    }

    fn clear(&mut self, mode: ClearMode, _color: Color) {
        self.stats.lock().frame_clears.push(mode);
    }

    fn draw(&mut self, call: &DrawCall<'_>) -> Result<(), BackendError> {
        if !self.programs.contains(&call.program.0) {
            return Err(BackendError::UnknownHandle("program"));
        }
        for id in [call.positions, call.uvs, call.normals, call.indices, call.instances] {
            if !self.buffers.contains_key(&id.0) {
                return Err(BackendError::UnknownHandle("buffer"));
            }
        }
        self.stats.lock().frame_draws.push(DrawRecord {
            program: call.program,
            index_count: call.index_count,
            instance_count: call.instance_count,
            texture_units: call.textures.iter().map(|(u, _)| *u).collect(),
            skinned: call.skin.is_some(),
            depth: call.depth,
        });
        Ok(())
    }

    fn end_frame(&mut self) {
        let mut s = self.stats.lock();
        s.frames += 1;
        let draws = std::mem::take(&mut s.frame_draws);
        s.last_frame_draws = draws;
    }
}
