//! The command interpreter.
//!
//! Each [`Command`] names one transition against the selection context
//! threaded through every function here.  Returning `Some(Reply)` completes
//! the caller's ticket; returning `None` cancels it.  Unmet preconditions —
//! missing or wrong-typed selection, out-of-range arguments, invalid data —
//! are expected outcomes, answered with `None` and at most a `debug!` line,
//! never with an error escaping to the frame loop.
//!
//! The render thread's own setup code calls [`execute`] directly instead of
//! round-tripping through the queue; that direct path is what keeps
//! re-entrant submissions from deadlocking on the queue bound.

use crate::command::{Command, Reply};
use crate::manager::RenderState;
use crate::resources::mesh::Mesh;
use crate::resources::renderable::Renderable;
use crate::resources::shader::{Shader, ShaderProgram};
use crate::resources::skeleton::{Skeleton, WeightMatrix};
use crate::resources::texture::{Texture, Texture2d, TextureCubemap};
use crate::shader_abi;

/// Executes one command against the engine state.  Render-thread only.
pub(crate) fn execute(state: &mut RenderState, command: Command) -> Option<Reply> {
    match command {
        // ── Meshes ───────────────────────────────────────────────────────
        Command::NewMesh {
            identity,
            positions,
            uvs,
            normals,
            triangles,
        } => {
            if let Some(key) = identity.as_deref() {
                if let Some(id) = state.meshes.find(key) {
                    state.selection.mesh = Some(id);
                    return Some(Reply::Id(id));
                }
            }
            let mesh = match Mesh::new(positions, uvs, normals, triangles) {
                Ok(m) => m,
                Err(e) => {
                    log::debug!("new mesh rejected: {e}");
                    return None;
                }
            };
            let id = register_or_cancel(state.meshes.register(mesh, identity))?;
            state.selection.mesh = Some(id);
            Some(Reply::Id(id))
        }
        Command::SelectMesh { id } => {
            state.meshes.get(id)?;
            state.selection.mesh = Some(id);
            Some(Reply::Done)
        }
        Command::SetMeshAttributes {
            positions,
            uvs,
            normals,
            triangles,
        } => {
            let mesh = selected_mesh(state)?;
            soft(mesh.set_attributes(positions, uvs, normals, triangles))
        }
        Command::RecalculateNormals => {
            let mesh = selected_mesh(state)?;
            soft(mesh.recalculate_normals())
        }
        Command::ForceRebuffer => {
            let mesh = selected_mesh(state)?;
            soft(mesh.force_rebuffer())
        }
        Command::SetMeshReadOnly => {
            let mesh = selected_mesh(state)?;
            soft(mesh.set_read_only())
        }
        Command::CloseMesh => {
            let id = state.selection.mesh.take()?;
            let mesh = state.meshes.get_mut(id)?;
            mesh.close(state.backend.as_mut());
            Some(Reply::Done)
        }

        // ── Shaders & programs ───────────────────────────────────────────
        Command::NewShader {
            stage,
            identity,
            source,
        } => {
            // Stage-qualified key: one identity may carry all three stages.
            let key = format!("{identity}.{}", shader_abi::stage_extension(stage));
            if let Some(id) = state.shaders.find(&key) {
                state.selection.shader = Some(id);
                return Some(Reply::Id(id));
            }
            let shader = Shader::new(stage, identity, source);
            let id = register_or_cancel(state.shaders.register(shader, Some(key)))?;
            state.selection.shader = Some(id);
            Some(Reply::Id(id))
        }
        Command::SelectShader { id } => {
            state.shaders.get(id)?;
            state.selection.shader = Some(id);
            Some(Reply::Done)
        }
        Command::CloseShader => {
            let id = state.selection.shader.take()?;
            state.shaders.get_mut(id)?.close();
            Some(Reply::Done)
        }
        Command::NewProgram { mode } => {
            let id = register_or_cancel(state.programs.register(ShaderProgram::new(mode), None))?;
            state.selection.program = Some(id);
            Some(Reply::Id(id))
        }
        Command::SelectProgram { id } => {
            state.programs.get(id)?;
            state.selection.program = Some(id);
            Some(Reply::Done)
        }
        Command::AttachShader => {
            let shader_id = state.selection.shader?;
            let program_id = state.selection.program?;
            let stage = {
                let shader = state.shaders.get(shader_id)?;
                if shader.is_closed() {
                    return None;
                }
                shader.stage()
            };
            let program = state.programs.get_mut(program_id)?;
            soft(program.attach(stage, shader_id))
        }
        Command::SetProgramReadOnly => {
            let id = state.selection.program?;
            let program = state.programs.get_mut(id)?;
            soft(program.set_read_only())
        }
        Command::CloseProgram => {
            let id = state.selection.program.take()?;
            let program = state.programs.get_mut(id)?;
            program.close(state.backend.as_mut());
            // The rendering map still lists it; the next frame's sweep
            // migrates its renderables to the default program.
            Some(Reply::Done)
        }

        // ── Textures ─────────────────────────────────────────────────────
        Command::NewTexture2d {
            unit,
            data,
            identity,
        } => {
            if let Some(id) = find_texture(state, identity.as_deref()) {
                state.selection.texture = Some(id);
                return Some(Reply::Id(id));
            }
            let max = state.limits.max_combined_texture_units;
            let texture = match Texture2d::new(unit, data, identity.clone(), max) {
                Ok(t) => Texture::Flat(t),
                Err(e) => {
                    log::debug!("new 2d texture rejected: {e}");
                    return None;
                }
            };
            let id = register_or_cancel(state.textures.register(texture, identity))?;
            state.selection.texture = Some(id);
            Some(Reply::Id(id))
        }
        Command::NewCubemap {
            unit,
            faces,
            identity,
        } => {
            if let Some(id) = find_texture(state, identity.as_deref()) {
                state.selection.texture = Some(id);
                return Some(Reply::Id(id));
            }
            let max = state.limits.max_combined_texture_units;
            let texture = match TextureCubemap::from_faces(unit, faces, identity.clone(), max) {
                Ok(t) => Texture::Cube(t),
                Err(e) => {
                    log::debug!("new cubemap rejected: {e}");
                    return None;
                }
            };
            let id = register_or_cancel(state.textures.register(texture, identity))?;
            state.selection.texture = Some(id);
            Some(Reply::Id(id))
        }
        Command::NewCubemapPacked {
            unit,
            image,
            identity,
        } => {
            if let Some(id) = find_texture(state, identity.as_deref()) {
                state.selection.texture = Some(id);
                return Some(Reply::Id(id));
            }
            let max = state.limits.max_combined_texture_units;
            let texture = match TextureCubemap::from_packed(unit, &image, identity.clone(), max) {
                Ok(t) => Texture::Cube(t),
                Err(e) => {
                    log::debug!("packed cubemap rejected: {e}");
                    return None;
                }
            };
            let id = register_or_cancel(state.textures.register(texture, identity))?;
            state.selection.texture = Some(id);
            Some(Reply::Id(id))
        }
        Command::SelectTexture { id } => {
            state.textures.get(id)?;
            state.selection.texture = Some(id);
            Some(Reply::Done)
        }
        Command::CloseTexture => {
            let id = state.selection.texture.take()?;
            let texture = state.textures.get_mut(id)?;
            texture.close(state.backend.as_mut());
            // Detach every live reference so nothing dangles.
            for rid in state.renderables.ids() {
                if let Some(r) = state.renderables.get_mut(rid) {
                    r.clear_texture_refs(id);
                }
            }
            state.skybox.clear_texture_ref(id);
            Some(Reply::Done)
        }

        // ── Renderables ──────────────────────────────────────────────────
        Command::NewRenderable { instances } => {
            let mesh_id = state.selection.mesh?;
            state.meshes.get(mesh_id)?;
            let max = state.limits.max_combined_texture_units;
            let renderable = match Renderable::new(mesh_id, instances, max) {
                Ok(r) => r,
                Err(e) => {
                    log::debug!("new renderable rejected: {e}");
                    return None;
                }
            };
            let id = register_or_cancel(state.renderables.register(renderable, None))?;
            state.selection.renderable = Some(id);
            Some(Reply::Id(id))
        }
        Command::SelectRenderable { id } => {
            state.renderables.get(id)?;
            state.selection.renderable = Some(id);
            Some(Reply::Done)
        }
        Command::SetRenderableTexture { unit } => {
            let rid = state.selection.renderable?;
            let tid = state.selection.texture?;
            state.textures.get(tid)?;
            let renderable = state.renderables.get_mut(rid)?;
            soft(renderable.set_texture(unit, Some(tid)))
        }
        Command::ClearRenderableTexture { unit } => {
            let rid = state.selection.renderable?;
            let renderable = state.renderables.get_mut(rid)?;
            soft(renderable.set_texture(unit, None))
        }
        Command::SetInstances { instances } => {
            let rid = state.selection.renderable?;
            let renderable = state.renderables.get_mut(rid)?;
            soft(renderable.set_instances(instances))
        }
        Command::AttachSkeleton { bones, weights } => {
            let rid = state.selection.renderable?;
            let cols = bones.len();
            if cols == 0 || weights.is_empty() || weights.len() % cols != 0 {
                log::debug!("skeleton attachment with ill-shaped weight table");
                return None;
            }
            let rows = weights.len() / cols;
            let skeleton = match Skeleton::new(bones) {
                Ok(s) => s,
                Err(e) => {
                    log::debug!("skeleton rejected: {e}");
                    return None;
                }
            };
            let weights = match WeightMatrix::new(rows, cols, weights) {
                Ok(w) => w,
                Err(e) => {
                    log::debug!("weight matrix rejected: {e}");
                    return None;
                }
            };
            let renderable = state.renderables.get_mut(rid)?;
            soft(renderable.attach_skeleton(skeleton, weights))
        }
        Command::DetachSkeleton => {
            let rid = state.selection.renderable?;
            let renderable = state.renderables.get_mut(rid)?;
            renderable.detach_skeleton(state.backend.as_mut());
            Some(Reply::Done)
        }
        Command::SetBoneTransform { bone, local } => {
            let rid = state.selection.renderable?;
            let renderable = state.renderables.get_mut(rid)?;
            soft(renderable.set_bone_local(bone, local))
        }
        Command::AssignProgram => {
            let rid = state.selection.renderable?;
            let pid = state.selection.program?;
            let program = state.programs.get(pid)?;
            if program.is_closed() {
                return None;
            }
            state.renderables.get(rid)?;
            unfile_renderable(state, rid);
            state.map.entry(pid).or_default().insert(rid);
            if let Some(r) = state.renderables.get_mut(rid) {
                r.set_program(Some(pid));
            }
            Some(Reply::Done)
        }
        Command::AssignUi => {
            let rid = state.selection.renderable?;
            state.renderables.get(rid)?;
            unfile_renderable(state, rid);
            state.ui_set.insert(rid);
            if let Some(r) = state.renderables.get_mut(rid) {
                r.set_program(None);
            }
            Some(Reply::Done)
        }
        Command::CloseRenderable => {
            let id = state.selection.renderable.take()?;
            unfile_renderable(state, id);
            let renderable = state.renderables.get_mut(id)?;
            renderable.close(state.backend.as_mut());
            Some(Reply::Done)
        }

        // ── Skybox / frame state ─────────────────────────────────────────
        Command::SetSkyboxTexture => {
            let tid = state.selection.texture?;
            let texture = state.textures.get(tid)?;
            if !matches!(texture, Texture::Cube(_)) || texture.is_closed() {
                log::debug!("skybox requires an open cubemap texture");
                return None;
            }
            state.skybox.set_texture(Some(tid));
            Some(Reply::Done)
        }
        Command::EnableSkybox { enabled } => {
            state.skybox.set_enabled(enabled);
            Some(Reply::Done)
        }
        Command::EnableUi { enabled } => {
            state.ui_enabled = enabled;
            Some(Reply::Done)
        }
        Command::SetViewTransform { view } => {
            state.view = view;
            state.view_dirty = true;
            Some(Reply::Done)
        }
        Command::SetWindowOptions { options } => {
            if options.width == 0 || options.height == 0 || !(options.z_near > 0.0) {
                log::debug!("window options rejected: {options:?}");
                return None;
            }
            state
                .backend
                .resize_surface(options.width, options.height);
            state.window = options;
            state.window_dirty = true;
            Some(Reply::Done)
        }
    }
}

/// Removes a renderable from the rendering map and the UI set.
fn unfile_renderable(state: &mut RenderState, rid: u32) {
    for set in state.map.values_mut() {
        set.remove(&rid);
    }
    state.map.retain(|_, set| !set.is_empty());
    state.ui_set.remove(&rid);
}

fn selected_mesh(state: &mut RenderState) -> Option<&mut Mesh> {
    let id = state.selection.mesh?;
    state.meshes.get_mut(id)
}

/// Maps a resource-level rejection to a soft cancellation.
fn soft(result: Result<(), crate::error::EngineError>) -> Option<Reply> {
    match result {
        Ok(()) => Some(Reply::Done),
        Err(e) => {
            log::debug!("command rejected: {e}");
            None
        }
    }
}

/// Registration errors are resource exhaustion — louder than a precondition
/// failure, but still only the one caller's problem.
fn register_or_cancel(result: Result<u32, crate::error::EngineError>) -> Option<u32> {
    match result {
        Ok(id) => Some(id),
        Err(e) => {
            log::error!("registration failed: {e}");
            None
        }
    }
}

fn find_texture(state: &RenderState, identity: Option<&str>) -> Option<u32> {
    identity.and_then(|key| state.textures.find(key))
}
