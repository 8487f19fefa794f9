//! Shader stages and programs.
//!
//! A [`Shader`] is CPU-side stage source located by a logical identity plus
//! the `.vert`/`.geom`/`.frag` extension convention; actual compilation
//! happens when a [`ShaderProgram`] links on the render thread.  A program
//! that fails to link or validate is marked `failed` permanently — the
//! rendering manager reroutes its renderables to a default program and never
//! retries (closing and recreating the program is the only recovery path).

use std::collections::HashMap;

use crate::backend::{ProgramId, ProgramMode, ProgramSources, RenderBackend};
use crate::error::EngineError;
use crate::registry::Registry;

/// Pipeline stage of a shader source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Geometry,
    Fragment,
}

/// One stage's source text.
pub struct Shader {
    stage: ShaderStage,
    identity: String,
    source: String,
    closed: bool,
}

impl Shader {
    pub fn new(stage: ShaderStage, identity: String, source: String) -> Self {
        Self {
            stage,
            identity,
            source,
            closed: false,
        }
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    /// Logical identity the source was located by (also the dedup key).
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Idempotent; stage sources hold no GPU handles of their own.
    pub fn close(&mut self) {
        self.closed = true;
    }
}

/// Link state machine: attach stages, then link lazily at first render.
pub struct ShaderProgram {
    mode: ProgramMode,
    vertex: Option<u32>,
    geometry: Option<u32>,
    fragment: Option<u32>,
    linked: bool,
    validated: bool,
    read_only: bool,
    failed: bool,
    closed: bool,
    handle: Option<ProgramId>,
    resources: HashMap<String, u32>,
}

impl ShaderProgram {
    pub fn new(mode: ProgramMode) -> Self {
        Self {
            mode,
            vertex: None,
            geometry: None,
            fragment: None,
            linked: false,
            validated: false,
            read_only: false,
            failed: false,
            closed: false,
            handle: None,
            resources: HashMap::new(),
        }
    }

    pub fn mode(&self) -> ProgramMode {
        self.mode
    }

    pub fn is_linked(&self) -> bool {
        self.linked
    }

    pub fn is_validated(&self) -> bool {
        self.validated
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn handle(&self) -> Option<ProgramId> {
        self.handle
    }

    /// Resource index by interface name, populated after a successful link.
    pub fn resource_index(&self, name: &str) -> Option<u32> {
        self.resources.get(name).copied()
    }

    /// Attaches `shader_id` to the slot matching its stage.
    ///
    /// Rejected once the program is linked, read-only, failed or closed.
    pub fn attach(&mut self, stage: ShaderStage, shader_id: u32) -> Result<(), EngineError> {
        if self.closed {
            return Err(EngineError::ObjectClosed);
        }
        if self.linked || self.read_only || self.failed {
            return Err(EngineError::InvalidProgram(
                "cannot attach stages after link/read-only/failure".into(),
            ));
        }
        match stage {
            ShaderStage::Vertex => self.vertex = Some(shader_id),
            ShaderStage::Geometry => self.geometry = Some(shader_id),
            ShaderStage::Fragment => self.fragment = Some(shader_id),
        }
        Ok(())
    }

    /// Promotes to read-only.  One-way.
    pub fn set_read_only(&mut self) -> Result<(), EngineError> {
        if self.closed {
            return Err(EngineError::ObjectClosed);
        }
        self.read_only = true;
        Ok(())
    }

    /// Returns the linked handle, linking and validating first if needed.
    ///
    /// Render-thread only.  Any failure marks the program `failed`
    /// permanently and propagates the error.
    pub fn ensure_linked(
        &mut self,
        backend: &mut dyn RenderBackend,
        shaders: &Registry<Shader>,
    ) -> Result<ProgramId, EngineError> {
        if self.closed {
            return Err(EngineError::ObjectClosed);
        }
        if self.failed {
            return Err(EngineError::InvalidProgram("program previously failed".into()));
        }
        if let Some(handle) = self.handle {
            return Ok(handle);
        }

        let sources = match self.gather_sources(shaders) {
            Ok(s) => s,
            Err(e) => {
                self.failed = true;
                return Err(e);
            }
        };
        let linked = match backend.link_program(&sources, self.mode) {
            Ok(l) => l,
            Err(e) => {
                self.failed = true;
                return Err(e.into());
            }
        };
        if let Err(e) = backend.validate_program(linked.id) {
            self.failed = true;
            backend.destroy_program(linked.id);
            return Err(e.into());
        }

        self.handle = Some(linked.id);
        self.resources = linked.resources;
        self.linked = true;
        self.validated = true;
        // A linked program's stage set is frozen.
        self.read_only = true;
        Ok(linked.id)
    }

    fn gather_sources(&self, shaders: &Registry<Shader>) -> Result<ProgramSources, EngineError> {
        let fetch = |id: u32, want: ShaderStage| -> Result<String, EngineError> {
            let shader = shaders.get(id).ok_or_else(|| {
                EngineError::InvalidProgram(format!("attached shader {id} no longer registered"))
            })?;
            if shader.is_closed() {
                return Err(EngineError::ObjectClosed);
            }
            if shader.stage() != want {
                return Err(EngineError::InvalidProgram(format!(
                    "shader '{}' attached to the wrong stage slot",
                    shader.identity()
                )));
            }
            Ok(shader.source().to_owned())
        };

        let vertex = self
            .vertex
            .ok_or_else(|| EngineError::InvalidProgram("vertex stage is mandatory".into()))
            .and_then(|id| fetch(id, ShaderStage::Vertex))?;
        let fragment = self
            .fragment
            .ok_or_else(|| EngineError::InvalidProgram("fragment stage is mandatory".into()))
            .and_then(|id| fetch(id, ShaderStage::Fragment))?;
        let geometry = match self.geometry {
            Some(id) => Some(fetch(id, ShaderStage::Geometry)?),
            None => None,
        };

        Ok(ProgramSources {
            vertex,
            geometry,
            fragment,
        })
    }

    /// Releases the linked handle and marks the program closed.  Idempotent.
    pub fn close(&mut self, backend: &mut dyn RenderBackend) {
        if let Some(handle) = self.handle.take() {
            backend.destroy_program(handle);
        }
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;

    fn stage_registry() -> (Registry<Shader>, u32, u32) {
        let mut shaders = Registry::new("shaders", 16);
        let vs = shaders
            .register(
                Shader::new(ShaderStage::Vertex, "basic".into(), "fn vs_main() { }".into()),
                Some("basic.vert".into()),
            )
            .unwrap();
        let fs = shaders
            .register(
                Shader::new(ShaderStage::Fragment, "basic".into(), "fn fs_main() { }".into()),
                Some("basic.frag".into()),
            )
            .unwrap();
        (shaders, vs, fs)
    }

    #[test]
    fn link_requires_vertex_and_fragment() {
        let mut backend = HeadlessBackend::new();
        let (shaders, vs, _fs) = stage_registry();
        let mut program = ShaderProgram::new(ProgramMode::Flat);
        program.attach(ShaderStage::Vertex, vs).unwrap();
        let err = program.ensure_linked(&mut backend, &shaders);
        assert!(matches!(err, Err(EngineError::InvalidProgram(_))));
        assert!(program.is_failed());
    }

    #[test]
    fn successful_link_freezes_and_reflects() {
        let mut backend = HeadlessBackend::new();
        let (shaders, vs, fs) = stage_registry();
        let mut program = ShaderProgram::new(ProgramMode::Flat);
        program.attach(ShaderStage::Vertex, vs).unwrap();
        program.attach(ShaderStage::Fragment, fs).unwrap();

        let handle = program.ensure_linked(&mut backend, &shaders).unwrap();
        assert!(program.is_linked() && program.is_validated());
        assert_eq!(program.handle(), Some(handle));
        assert!(program.resource_index(crate::shader_abi::UNIFORM_GLOBALS).is_some());

        // Frozen after link.
        assert!(matches!(
            program.attach(ShaderStage::Vertex, vs),
            Err(EngineError::InvalidProgram(_))
        ));
        // Relink is a no-op returning the same handle.
        assert_eq!(program.ensure_linked(&mut backend, &shaders).unwrap(), handle);
    }

    #[test]
    fn empty_source_fails_link_permanently() {
        let mut backend = HeadlessBackend::new();
        let mut shaders = Registry::new("shaders", 16);
        let vs = shaders
            .register(
                Shader::new(ShaderStage::Vertex, "broken".into(), "  ".into()),
                None,
            )
            .unwrap();
        let fs = shaders
            .register(
                Shader::new(ShaderStage::Fragment, "broken".into(), "fn fs_main() { }".into()),
                None,
            )
            .unwrap();
        let mut program = ShaderProgram::new(ProgramMode::Flat);
        program.attach(ShaderStage::Vertex, vs).unwrap();
        program.attach(ShaderStage::Fragment, fs).unwrap();

        assert!(program.ensure_linked(&mut backend, &shaders).is_err());
        assert!(program.is_failed());
        // The breaker stays open: no retry even with the same inputs.
        assert!(matches!(
            program.ensure_linked(&mut backend, &shaders),
            Err(EngineError::InvalidProgram(_))
        ));
    }
}
