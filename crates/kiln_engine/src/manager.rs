//! The rendering manager: all state owned by the render thread, and the
//! fixed-period frame loop that drives it.
//!
//! Each frame: advance the clock; try-lock the message lock and, if
//! acquired, atomically drain the whole command queue (processing happens
//! after the lock is released so producers are never stalled by GPU work);
//! execute the drained commands FIFO against the selection context; refresh
//! view/projection matrices when dirty; clear; draw the skybox with depth
//! testing off; draw every (program → renderable set) entry of the rendering
//! map, linking programs lazily; reroute the renderables of failed or closed
//! programs to the mode-appropriate default program; clear depth only and
//! draw the UI set over everything; present.
//!
//! A command that panics is caught, logged and cancelled.  A panic escaping
//! the loop body itself is fatal: the engine reports `Failed` and the thread
//! exits without retry.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use glam::{Mat4, Vec2, Vec3};

use kiln_core::{Color, TimeClock, Transform};

use crate::backend::{
    BackendLimits, BufferId, ClearMode, DefaultProgram, DepthMode, DrawCall, GlobalUniforms,
    ProgramId, ProgramMode, RenderBackend,
};
use crate::command::{Command, PendingCommand};
use crate::dispatch;
use crate::engine::EngineShared;
use crate::error::EngineError;
use crate::registry::Registry;
use crate::resources::mesh::Mesh;
use crate::resources::renderable::Renderable;
use crate::resources::shader::{Shader, ShaderProgram, ShaderStage};
use crate::resources::skybox::Skybox;
use crate::resources::texture::{Texture, TextureData};

const MESH_CAPACITY: usize = 4096;
const SHADER_CAPACITY: usize = 1024;
const PROGRAM_CAPACITY: usize = 512;
const TEXTURE_CAPACITY: usize = 1024;
const RENDERABLE_CAPACITY: usize = 8192;

/// Window and projection parameters.  Resizes and projection changes arrive
/// through [`Command::SetWindowOptions`] and mark the matrices dirty.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowOptions {
    pub width: u32,
    pub height: u32,
    /// Vertical field of view in radians.
    pub fovy: f32,
    pub z_near: f32,
    pub z_far: f32,
}

impl Default for WindowOptions {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fovy: 45.0f32.to_radians(),
            z_near: 0.1,
            z_far: 100.0,
        }
    }
}

/// The "currently selected object" slots commands address implicitly.
///
/// Owned by the render state and passed explicitly through the dispatcher;
/// selections persist across frames until replaced, cleared by a close, or
/// invalidated.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Selection {
    pub mesh: Option<u32>,
    pub shader: Option<u32>,
    pub program: Option<u32>,
    pub texture: Option<u32>,
    pub renderable: Option<u32>,
}

/// Ids of the built-in objects constructed during initialization.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Defaults {
    pub quad_mesh: u32,
    pub cube_mesh: u32,
    pub inverse_cube_mesh: u32,
    pub program_flat: u32,
    pub program_cubemap: u32,
    pub program_ui: u32,
    pub program_skybox: u32,
    pub white_texture: u32,
    /// One identity matrix, shared by single-instance built-in draws.
    pub identity_instances: BufferId,
}

/// Everything the render thread owns.
pub(crate) struct RenderState {
    pub backend: Box<dyn RenderBackend>,
    pub limits: BackendLimits,
    pub meshes: Registry<Mesh>,
    pub shaders: Registry<Shader>,
    pub programs: Registry<ShaderProgram>,
    pub textures: Registry<Texture>,
    pub renderables: Registry<Renderable>,
    pub selection: Selection,
    /// shader program id → renderables currently assigned to it.  Disjoint
    /// from `ui_set`: a renderable lives in at most one of them.
    pub map: HashMap<u32, HashSet<u32>>,
    pub ui_set: HashSet<u32>,
    pub defaults: Option<Defaults>,
    pub skybox: Skybox,
    pub ui_enabled: bool,
    pub view: Transform,
    pub view_dirty: bool,
    pub window: WindowOptions,
    pub window_dirty: bool,
    pub view_matrix: Mat4,
    pub proj_matrix: Mat4,
    pub matrices_changed: bool,
    pub clear_color: Color,
}

pub(crate) struct RenderManager {
    pub state: RenderState,
    clock: TimeClock,
}

impl RenderManager {
    pub fn new(backend: Box<dyn RenderBackend>, window: WindowOptions) -> Self {
        let limits = backend.limits();
        Self {
            state: RenderState {
                backend,
                limits,
                meshes: Registry::new("meshes", MESH_CAPACITY),
                shaders: Registry::new("shaders", SHADER_CAPACITY),
                programs: Registry::new("programs", PROGRAM_CAPACITY),
                textures: Registry::new("textures", TEXTURE_CAPACITY),
                renderables: Registry::new("renderables", RENDERABLE_CAPACITY),
                selection: Selection::default(),
                map: HashMap::new(),
                ui_set: HashSet::new(),
                defaults: None,
                skybox: Skybox::new(),
                ui_enabled: true,
                view: Transform::IDENTITY,
                view_dirty: true,
                window,
                window_dirty: true,
                view_matrix: Mat4::IDENTITY,
                proj_matrix: Mat4::IDENTITY,
                matrices_changed: false,
                clear_color: Color::rgb(0.1, 0.2, 0.3),
            },
            clock: TimeClock::new(),
        }
    }

    /// Remaining sleep budget before the next frame is due.
    pub fn until_next(&self, period: Duration) -> Duration {
        self.clock.until_next(period)
    }

    /// Builds and registers the default objects: quad / cube / inverse-cube
    /// meshes, the four built-in programs (linked eagerly), the white
    /// texture, and the shared identity instance buffer.
    ///
    /// Runs through the same dispatch table as queued commands — this direct
    /// path is the render thread's re-entrant execution route.
    pub fn install_defaults(&mut self) -> Result<(), EngineError> {
        let state = &mut self.state;

        let (positions, uvs, triangles) = quad_geometry();
        let quad_mesh = run_new(
            state,
            Command::NewMesh {
                identity: Some("kiln:mesh:quad".into()),
                positions,
                uvs,
                normals: None,
                triangles,
            },
            "quad mesh",
        )?;
        let (positions, uvs, triangles) = cube_geometry(false);
        let cube_mesh = run_new(
            state,
            Command::NewMesh {
                identity: Some("kiln:mesh:cube".into()),
                positions,
                uvs,
                normals: None,
                triangles,
            },
            "cube mesh",
        )?;
        let (positions, uvs, triangles) = cube_geometry(true);
        let inverse_cube_mesh = run_new(
            state,
            Command::NewMesh {
                identity: Some("kiln:mesh:inverse-cube".into()),
                positions,
                uvs,
                normals: None,
                triangles,
            },
            "inverse cube mesh",
        )?;

        let program_flat = install_program(state, DefaultProgram::Flat, ProgramMode::Flat, "flat")?;
        let program_cubemap =
            install_program(state, DefaultProgram::Cubemap, ProgramMode::Cubemap, "cubemap")?;
        let program_ui = install_program(state, DefaultProgram::Ui, ProgramMode::Flat, "ui")?;
        let program_skybox =
            install_program(state, DefaultProgram::Skybox, ProgramMode::Cubemap, "skybox")?;

        let white_texture = run_new(
            state,
            Command::NewTexture2d {
                unit: 0,
                data: TextureData::solid([255; 4]),
                identity: Some("kiln:texture:white".into()),
            },
            "white texture",
        )?;

        // Built-in programs must be usable before the first real frame.
        {
            let RenderState {
                programs,
                backend,
                shaders,
                ..
            } = &mut *state;
            for pid in [program_flat, program_cubemap, program_ui, program_skybox] {
                let program = programs
                    .get_mut(pid)
                    .ok_or_else(|| EngineError::Init("built-in program vanished".into()))?;
                program.ensure_linked(backend.as_mut(), shaders)?;
            }
        }

        let identity_instances = state
            .backend
            .create_storage_buffer(bytemuck::cast_slice(&Mat4::IDENTITY.to_cols_array()))?;

        state.defaults = Some(Defaults {
            quad_mesh,
            cube_mesh,
            inverse_cube_mesh,
            program_flat,
            program_cubemap,
            program_ui,
            program_skybox,
            white_texture,
            identity_instances,
        });
        // Setup selections are not part of the engine's visible state.
        state.selection = Selection::default();
        Ok(())
    }

    /// One iteration of the loop.  Never panics for per-command failures;
    /// backend faults downgrade to a skipped frame.
    pub fn frame(&mut self, shared: &EngineShared) {
        self.clock.tick();

        // Non-blocking drain: a producer holding the message lock simply
        // defers these commands to a later frame.
        let drained = shared.drain_if_uncontended();
        for PendingCommand { command, ticket } in drained {
            let outcome =
                catch_unwind(AssertUnwindSafe(|| dispatch::execute(&mut self.state, command)));
            match outcome {
                Ok(Some(reply)) => ticket.complete(reply),
                Ok(None) => ticket.cancel(),
                Err(_) => {
                    log::error!("command execution panicked; cancelling its ticket");
                    ticket.cancel();
                }
            }
        }

        let state = &mut self.state;

        if state.view_dirty || state.window_dirty {
            let w = state.window;
            let aspect = w.width as f32 / w.height.max(1) as f32;
            state.proj_matrix = Mat4::perspective_rh(w.fovy, aspect, w.z_near, w.z_far);
            state.view_matrix = state.view.matrix().inverse();
            state.matrices_changed = true;
            state.view_dirty = false;
            state.window_dirty = false;
        }

        if let Err(e) = state.backend.begin_frame() {
            log::warn!("skipping frame, surface unavailable: {e}");
            return;
        }

        if state.matrices_changed {
            let globals = GlobalUniforms {
                window_size: [state.window.width as f32, state.window.height as f32],
                projection: state.proj_matrix,
                view: state.view_matrix,
            };
            if let Err(e) = state.backend.set_globals(&globals) {
                log::warn!("global uniform upload failed: {e}");
            }
        }

        state.backend.clear(ClearMode::ColorAndDepth, state.clear_color);

        let Some(defaults) = state.defaults else {
            state.backend.end_frame();
            return;
        };

        if state.skybox.is_enabled() {
            if let Some(tid) = state.skybox.texture() {
                if let Err(e) = draw_skybox(state, &defaults, tid) {
                    log::debug!("skybox pass skipped: {e}");
                }
            }
        }

        // Rendering map: one pass per program, lazy link, failure collection.
        let program_ids: Vec<u32> = state.map.keys().copied().collect();
        let mut failed: Vec<u32> = Vec::new();
        for pid in program_ids {
            let linked = {
                let RenderState {
                    programs,
                    backend,
                    shaders,
                    ..
                } = &mut *state;
                match programs.get_mut(pid) {
                    None => None,
                    Some(p) if p.is_closed() || p.is_failed() => None,
                    Some(p) => match p.ensure_linked(backend.as_mut(), shaders) {
                        Ok(handle) => Some((handle, p.mode())),
                        Err(e) => {
                            log::warn!("program {pid} failed to link: {e}");
                            None
                        }
                    },
                }
            };
            let Some((handle, mode)) = linked else {
                failed.push(pid);
                continue;
            };

            let rids: Vec<u32> = state
                .map
                .get(&pid)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default();
            for rid in rids {
                let RenderState {
                    backend,
                    meshes,
                    textures,
                    renderables,
                    ..
                } = &mut *state;
                if let Err(e) = draw_renderable(
                    backend.as_mut(),
                    meshes,
                    textures,
                    renderables,
                    rid,
                    handle,
                    mode,
                    DepthMode::Standard,
                ) {
                    log::debug!("renderable {rid} skipped: {e}");
                }
            }
        }

        // Self-healing: renderables of failed/closed programs are rerouted
        // to the mode-appropriate default, never dropped.  The breaker does
        // not reset; recreating the program is the only recovery.
        for pid in failed {
            let set = state.map.remove(&pid).unwrap_or_default();
            let mode = state
                .programs
                .get(pid)
                .map(|p| p.mode())
                .unwrap_or(ProgramMode::Flat);
            let target = match mode {
                ProgramMode::Flat => defaults.program_flat,
                ProgramMode::Cubemap => defaults.program_cubemap,
            };
            if set.is_empty() {
                continue;
            }
            if target == pid {
                log::warn!("default program {pid} unusable; {} renderables unfiled", set.len());
                for rid in set {
                    if let Some(r) = state.renderables.get_mut(rid) {
                        r.set_program(None);
                    }
                }
                continue;
            }
            log::warn!(
                "rerouting {} renderables from unusable program {pid} to default {target}",
                set.len()
            );
            for rid in set {
                if let Some(r) = state.renderables.get_mut(rid) {
                    r.set_program(Some(target));
                }
                state.map.entry(target).or_default().insert(rid);
            }
        }

        // UI overlay: depth-only clear guarantees it draws over the scene.
        if state.ui_enabled && !state.ui_set.is_empty() {
            state.backend.clear(ClearMode::DepthOnly, state.clear_color);
            let ui = state
                .programs
                .get(defaults.program_ui)
                .and_then(|p| p.handle().map(|h| (h, p.mode())));
            match ui {
                Some((handle, mode)) => {
                    let rids: Vec<u32> = state.ui_set.iter().copied().collect();
                    for rid in rids {
                        let RenderState {
                            backend,
                            meshes,
                            textures,
                            renderables,
                            ..
                        } = &mut *state;
                        if let Err(e) = draw_renderable(
                            backend.as_mut(),
                            meshes,
                            textures,
                            renderables,
                            rid,
                            handle,
                            mode,
                            DepthMode::Standard,
                        ) {
                            log::debug!("ui renderable {rid} skipped: {e}");
                        }
                    }
                }
                None => log::debug!("ui pass skipped: default ui program unusable"),
            }
        }

        state.backend.end_frame();
        state.backend.poll_events();
        state.matrices_changed = false;
    }

    /// Closes every registered object across every registry, clears the
    /// registries and the rendering map, and closes the skybox.
    pub fn shutdown(&mut self) {
        let state = &mut self.state;
        for (_, mut r) in state.renderables.drain() {
            r.close(state.backend.as_mut());
        }
        for (_, mut t) in state.textures.drain() {
            t.close(state.backend.as_mut());
        }
        for (_, mut p) in state.programs.drain() {
            p.close(state.backend.as_mut());
        }
        for (_, mut s) in state.shaders.drain() {
            s.close();
        }
        for (_, mut m) in state.meshes.drain() {
            m.close(state.backend.as_mut());
        }
        if let Some(d) = state.defaults.take() {
            state.backend.destroy_buffer(d.identity_instances);
        }
        state.map.clear();
        state.ui_set.clear();
        state.skybox.close();
        state.selection = Selection::default();
    }
}

// ── Draw helpers ─────────────────────────────────────────────────────────────

/// Draws one renderable: sync mesh, enforce skeleton validity (detaching on
/// mismatch), sync skin and instances, bind mode-compatible textures, draw.
#[allow(clippy::too_many_arguments)]
fn draw_renderable(
    backend: &mut dyn RenderBackend,
    meshes: &mut Registry<Mesh>,
    textures: &mut Registry<Texture>,
    renderables: &mut Registry<Renderable>,
    rid: u32,
    program: ProgramId,
    program_mode: ProgramMode,
    depth: DepthMode,
) -> Result<(), EngineError> {
    let Some(renderable) = renderables.get_mut(rid) else {
        return Ok(());
    };
    if renderable.is_closed() {
        return Ok(());
    }
    let (buffers, vertex_count) = match meshes.get_mut(renderable.mesh()) {
        Some(mesh) if !mesh.is_closed() => {
            let buffers = mesh.sync(backend)?;
            (buffers, mesh.vertex_count())
        }
        _ => {
            log::debug!("renderable {rid} references a missing or closed mesh");
            return Ok(());
        }
    };

    if !renderable.skeleton_ok(vertex_count) {
        log::debug!("skeleton/weight dimensions disagree with mesh; detaching from {rid}");
        renderable.detach_skeleton(backend);
    }
    let skin = renderable.sync_skin(backend)?;
    let instances = renderable.sync_instances(backend)?;

    let units: Vec<(u32, u32)> = renderable.texture_units().collect();
    let instance_count = renderable.instance_count();
    let mut binds: Vec<(u32, crate::backend::TextureId)> = Vec::with_capacity(units.len());
    for (unit, tid) in units {
        match textures.get_mut(tid) {
            Some(t) if t.is_closed() => {}
            Some(t) if t.mode() != program_mode => {
                log::debug!("texture {tid} incompatible with program mode; unit {unit} skipped");
            }
            Some(t) => binds.push((unit, t.sync(backend)?)),
            None => {}
        }
    }

    backend.draw(&DrawCall {
        program,
        positions: buffers.positions,
        uvs: buffers.uvs,
        normals: buffers.normals,
        indices: buffers.indices,
        index_count: buffers.index_count,
        instances,
        instance_count,
        textures: &binds,
        skin,
        depth,
    })?;
    Ok(())
}

/// Background pass: inverse cube, cubemap at unit 0, depth test disabled.
fn draw_skybox(state: &mut RenderState, defaults: &Defaults, tid: u32) -> Result<(), EngineError> {
    let RenderState {
        backend,
        meshes,
        textures,
        programs,
        ..
    } = state;
    let handle = programs
        .get(defaults.program_skybox)
        .and_then(|p| p.handle())
        .ok_or_else(|| EngineError::Init("skybox program not linked".into()))?;
    let buffers = meshes
        .get_mut(defaults.inverse_cube_mesh)
        .ok_or_else(|| EngineError::Init("inverse cube mesh missing".into()))?
        .sync(backend.as_mut())?;
    let texture = textures.get_mut(tid).ok_or(EngineError::ObjectClosed)?;
    if texture.is_closed() {
        return Err(EngineError::ObjectClosed);
    }
    let texture_handle = texture.sync(backend.as_mut())?;

    let binds = [(0u32, texture_handle)];
    backend.draw(&DrawCall {
        program: handle,
        positions: buffers.positions,
        uvs: buffers.uvs,
        normals: buffers.normals,
        indices: buffers.indices,
        index_count: buffers.index_count,
        instances: defaults.identity_instances,
        instance_count: 1,
        textures: &binds,
        skin: None,
        depth: DepthMode::Disabled,
    })?;
    Ok(())
}

// ── Default-object construction ──────────────────────────────────────────────

fn run(state: &mut RenderState, command: Command, what: &str) -> Result<(), EngineError> {
    dispatch::execute(state, command)
        .map(|_| ())
        .ok_or_else(|| EngineError::Init(format!("default {what} setup failed")))
}

fn run_new(state: &mut RenderState, command: Command, what: &str) -> Result<u32, EngineError> {
    dispatch::execute(state, command)
        .and_then(|reply| reply.id())
        .ok_or_else(|| EngineError::Init(format!("default {what} setup failed")))
}

fn install_program(
    state: &mut RenderState,
    which: DefaultProgram,
    mode: ProgramMode,
    tag: &str,
) -> Result<u32, EngineError> {
    let sources = state.backend.default_program_sources(which);
    let vs = run_new(
        state,
        Command::NewShader {
            stage: ShaderStage::Vertex,
            identity: format!("kiln:{tag}"),
            source: sources.vertex,
        },
        tag,
    )?;
    let fs = run_new(
        state,
        Command::NewShader {
            stage: ShaderStage::Fragment,
            identity: format!("kiln:{tag}"),
            source: sources.fragment,
        },
        tag,
    )?;
    let pid = run_new(state, Command::NewProgram { mode }, tag)?;
    run(state, Command::SelectShader { id: vs }, tag)?;
    run(state, Command::AttachShader, tag)?;
    run(state, Command::SelectShader { id: fs }, tag)?;
    run(state, Command::AttachShader, tag)?;
    Ok(pid)
}

// ── Built-in geometry ────────────────────────────────────────────────────────

fn quad_geometry() -> (Vec<Vec3>, Vec<Vec2>, Vec<u32>) {
    (
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
        vec![0, 1, 2, 2, 3, 0],
    )
}

/// Unit cube with four unique vertices per face so derived normals stay
/// flat.  `inverted` reverses the winding for the inside-out skybox cube.
fn cube_geometry(inverted: bool) -> (Vec<Vec3>, Vec<Vec2>, Vec<u32>) {
    // (face normal, u axis, v axis) with u × v == normal.
    let faces = [
        (Vec3::Z, Vec3::X, Vec3::Y),
        (Vec3::NEG_Z, Vec3::NEG_X, Vec3::Y),
        (Vec3::X, Vec3::NEG_Z, Vec3::Y),
        (Vec3::NEG_X, Vec3::Z, Vec3::Y),
        (Vec3::Y, Vec3::X, Vec3::NEG_Z),
        (Vec3::NEG_Y, Vec3::X, Vec3::Z),
    ];
    let corners = [
        (-1.0, -1.0, Vec2::new(0.0, 0.0)),
        (1.0, -1.0, Vec2::new(1.0, 0.0)),
        (1.0, 1.0, Vec2::new(1.0, 1.0)),
        (-1.0, 1.0, Vec2::new(0.0, 1.0)),
    ];
    let mut positions = Vec::with_capacity(24);
    let mut uvs = Vec::with_capacity(24);
    let mut triangles = Vec::with_capacity(36);
    for (normal, u, v) in faces {
        let base = positions.len() as u32;
        for (du, dv, uv) in corners {
            positions.push(normal + u * du + v * dv);
            uvs.push(uv);
        }
        if inverted {
            triangles.extend([base, base + 2, base + 1, base + 2, base, base + 3]);
        } else {
            triangles.extend([base, base + 1, base + 2, base + 2, base + 3, base]);
        }
    }
    (positions, uvs, triangles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::command::Reply;
    use crate::engine::{EngineOptions, EngineShared};
    use crate::resources::mesh::FALLBACK_NORMAL;

    fn manager_with_stats() -> (RenderManager, crate::backend::headless::HeadlessStats) {
        let backend = HeadlessBackend::new();
        let stats = backend.stats();
        let mut manager = RenderManager::new(Box::new(backend), WindowOptions::default());
        manager.install_defaults().unwrap();
        (manager, stats)
    }

    fn shared() -> EngineShared {
        EngineShared::new(&EngineOptions::default())
    }

    /// Runs one command synchronously through the manager's dispatch table.
    fn exec(manager: &mut RenderManager, command: Command) -> Option<Reply> {
        dispatch::execute(&mut manager.state, command)
    }

    fn new_quad(manager: &mut RenderManager, identity: Option<&str>) -> u32 {
        let (positions, uvs, triangles) = quad_geometry();
        exec(
            manager,
            Command::NewMesh {
                identity: identity.map(str::to_owned),
                positions,
                uvs,
                normals: None,
                triangles,
            },
        )
        .unwrap()
        .id()
        .unwrap()
    }

    #[test]
    fn defaults_install_and_link() {
        let (manager, stats) = manager_with_stats();
        let d = manager.state.defaults.unwrap();
        assert!(manager.state.meshes.get(d.quad_mesh).is_some());
        assert!(manager.state.meshes.get(d.inverse_cube_mesh).is_some());
        for pid in [d.program_flat, d.program_cubemap, d.program_ui, d.program_skybox] {
            assert!(manager.state.programs.get(pid).unwrap().is_linked());
        }
        assert_eq!(stats.lock().programs_linked, 4);
    }

    #[test]
    fn duplicate_identity_reuses_mesh_without_reupload() {
        let (mut manager, stats) = manager_with_stats();
        let sh = shared();
        let a = new_quad(&mut manager, Some("assets/quad"));
        let b = new_quad(&mut manager, Some("assets/quad"));
        assert_eq!(a, b);

        // Render it so it actually buffers, then re-register: still one upload.
        exec(&mut manager, Command::NewRenderable { instances: vec![Transform::IDENTITY] });
        let d = manager.state.defaults.unwrap();
        exec(&mut manager, Command::SelectProgram { id: d.program_flat });
        exec(&mut manager, Command::AssignProgram);
        manager.frame(&sh);
        let created_after_first_frame = stats.lock().buffers_created;
        let c = new_quad(&mut manager, Some("assets/quad"));
        assert_eq!(a, c);
        manager.frame(&sh);
        assert_eq!(stats.lock().buffers_created, created_after_first_frame);
    }

    #[test]
    fn closed_program_migrates_renderables_to_default() {
        let (mut manager, stats) = manager_with_stats();
        let sh = shared();
        new_quad(&mut manager, None);
        let rid = exec(&mut manager, Command::NewRenderable { instances: vec![Transform::IDENTITY] })
            .unwrap()
            .id()
            .unwrap();

        let pid = exec(&mut manager, Command::NewProgram { mode: ProgramMode::Flat })
            .unwrap()
            .id()
            .unwrap();
        // Attach the default flat stages so the program would link fine.
        let d = manager.state.defaults.unwrap();
        let vs = manager.state.shaders.find("kiln:flat.vert").unwrap();
        let fs = manager.state.shaders.find("kiln:flat.frag").unwrap();
        exec(&mut manager, Command::SelectShader { id: vs });
        exec(&mut manager, Command::AttachShader);
        exec(&mut manager, Command::SelectShader { id: fs });
        exec(&mut manager, Command::AttachShader);
        exec(&mut manager, Command::AssignProgram);

        manager.frame(&sh);
        assert!(manager.state.map.get(&pid).unwrap().contains(&rid));

        exec(&mut manager, Command::SelectProgram { id: pid });
        exec(&mut manager, Command::CloseProgram).unwrap();

        manager.frame(&sh);
        assert!(!manager.state.map.contains_key(&pid), "closed program left the map");
        assert!(
            manager.state.map.get(&d.program_flat).unwrap().contains(&rid),
            "renderable rerouted to the default flat program"
        );
        assert_eq!(manager.state.renderables.get(rid).unwrap().program(), Some(d.program_flat));

        // And it actually draws under the default program on the next frame.
        manager.frame(&sh);
        let default_handle = manager.state.programs.get(d.program_flat).unwrap().handle().unwrap();
        let drew = stats
            .lock()
            .last_frame_draws
            .iter()
            .any(|r| r.program == default_handle);
        assert!(drew);
    }

    #[test]
    fn link_failure_marks_failed_and_reroutes() {
        let (mut manager, _stats) = manager_with_stats();
        let sh = shared();
        new_quad(&mut manager, None);
        let rid = exec(&mut manager, Command::NewRenderable { instances: vec![Transform::IDENTITY] })
            .unwrap()
            .id()
            .unwrap();

        // Program with an empty vertex stage: the headless backend refuses
        // to link it.
        let vs = exec(
            &mut manager,
            Command::NewShader {
                stage: ShaderStage::Vertex,
                identity: "broken".into(),
                source: String::new(),
            },
        )
        .unwrap()
        .id()
        .unwrap();
        let fs = exec(
            &mut manager,
            Command::NewShader {
                stage: ShaderStage::Fragment,
                identity: "broken".into(),
                source: "fn fs_main() { }".into(),
            },
        )
        .unwrap()
        .id()
        .unwrap();
        let pid = exec(&mut manager, Command::NewProgram { mode: ProgramMode::Flat })
            .unwrap()
            .id()
            .unwrap();
        exec(&mut manager, Command::SelectShader { id: vs });
        exec(&mut manager, Command::AttachShader);
        exec(&mut manager, Command::SelectShader { id: fs });
        exec(&mut manager, Command::AttachShader);
        exec(&mut manager, Command::AssignProgram);

        manager.frame(&sh);
        assert!(manager.state.programs.get(pid).unwrap().is_failed());
        let d = manager.state.defaults.unwrap();
        assert!(manager.state.map.get(&d.program_flat).unwrap().contains(&rid));
    }

    #[test]
    fn skeleton_mismatch_detaches_on_render() {
        let (mut manager, stats) = manager_with_stats();
        let sh = shared();
        new_quad(&mut manager, None); // 4 vertices
        let rid = exec(&mut manager, Command::NewRenderable { instances: vec![Transform::IDENTITY] })
            .unwrap()
            .id()
            .unwrap();
        let d = manager.state.defaults.unwrap();
        exec(&mut manager, Command::SelectProgram { id: d.program_flat });
        exec(&mut manager, Command::AssignProgram);

        // One bone, two weight rows — mesh has four vertices.
        let attached = exec(
            &mut manager,
            Command::AttachSkeleton {
                bones: vec![crate::resources::skeleton::Bone::root(Transform::IDENTITY)],
                weights: vec![1.0, 1.0],
            },
        );
        assert!(attached.is_some(), "attachment itself succeeds");
        assert!(manager.state.renderables.get(rid).unwrap().has_skeleton());

        manager.frame(&sh);
        assert!(
            !manager.state.renderables.get(rid).unwrap().has_skeleton(),
            "mismatched skeleton detached by the render call"
        );
        assert!(
            stats.lock().last_frame_draws.iter().all(|r| !r.skinned),
            "the draw went out unskinned"
        );
    }

    #[test]
    fn skybox_draws_first_with_depth_disabled() {
        let (mut manager, stats) = manager_with_stats();
        let sh = shared();
        let face = TextureData::solid([0, 0, 255, 255]);
        exec(
            &mut manager,
            Command::NewCubemap {
                unit: 0,
                faces: Box::new([
                    face.clone(),
                    face.clone(),
                    face.clone(),
                    face.clone(),
                    face.clone(),
                    face,
                ]),
                identity: None,
            },
        )
        .unwrap();
        exec(&mut manager, Command::SetSkyboxTexture).unwrap();

        manager.frame(&sh);
        let s = stats.lock();
        let first = s.last_frame_draws.first().expect("skybox drew");
        assert_eq!(first.depth, DepthMode::Disabled);
    }

    #[test]
    fn ui_set_renders_after_depth_only_clear() {
        let (mut manager, stats) = manager_with_stats();
        let sh = shared();
        new_quad(&mut manager, None);
        exec(&mut manager, Command::NewRenderable { instances: vec![Transform::IDENTITY] }).unwrap();
        exec(&mut manager, Command::AssignUi).unwrap();

        manager.frame(&sh);
        let s = stats.lock();
        assert_eq!(
            s.frame_clears,
            vec![ClearMode::ColorAndDepth, ClearMode::DepthOnly]
        );
        assert_eq!(s.last_frame_draws.len(), 1);
    }

    #[test]
    fn globals_upload_only_when_matrices_change() {
        let (mut manager, stats) = manager_with_stats();
        let sh = shared();
        manager.frame(&sh); // initial dirtiness flushes once
        let after_first = stats.lock().globals_uploads;
        manager.frame(&sh);
        manager.frame(&sh);
        assert_eq!(stats.lock().globals_uploads, after_first);

        exec(
            &mut manager,
            Command::SetViewTransform {
                view: Transform::from_position(Vec3::new(0.0, 2.0, 5.0)),
            },
        )
        .unwrap();
        manager.frame(&sh);
        assert_eq!(stats.lock().globals_uploads, after_first + 1);
    }

    #[test]
    fn shutdown_clears_every_registry() {
        let (mut manager, _stats) = manager_with_stats();
        new_quad(&mut manager, None);
        exec(&mut manager, Command::NewRenderable { instances: vec![Transform::IDENTITY] }).unwrap();
        manager.shutdown();
        assert!(manager.state.meshes.is_empty());
        assert!(manager.state.shaders.is_empty());
        assert!(manager.state.programs.is_empty());
        assert!(manager.state.textures.is_empty());
        assert!(manager.state.renderables.is_empty());
        assert!(manager.state.map.is_empty());
    }

    #[test]
    fn fallback_normal_constant_is_nonzero() {
        assert!(FALLBACK_NORMAL.length() > 0.0);
    }
}
