//! The public engine facade.
//!
//! [`Engine::init`] spawns the dedicated render thread (the only thread that
//! ever touches the backend) and returns immediately; [`Engine::wait_ready`]
//! blocks on the init latch, which is released even when initialization
//! fails — failure is visible through [`Engine::status`], never as a panic
//! bubbled to waiters.
//!
//! Commands are issued through [`MessageBatch`], acquired with
//! [`Engine::batch`].  The batch guard holds the coarse message lock, so one
//! caller's multi-command sequence enqueues atomically with respect to other
//! producers; the render thread only ever *try*-locks it, so a slow producer
//! defers command processing to a later frame instead of stalling the loop.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, TryLockError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use glam::{Vec2, Vec3};

use kiln_core::Transform;

use crate::backend::{BackendError, BackendLimits, ProgramMode, RenderBackend};
use crate::command::{
    Command, CommandQueue, PendingCommand, Reply, Ticket, DEFAULT_TICKET_WAIT,
};
use crate::error::EngineError;
use crate::manager::{RenderManager, WindowOptions};
use crate::resources::shader::ShaderStage;
use crate::resources::skeleton::Bone;
use crate::resources::texture::TextureData;
use crate::shader_abi;

/// Engine lifecycle state, readable from any thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Uninitialized,
    Initializing,
    Running,
    Closing,
    Closed,
    /// Fatal error: init failure or a panic escaping the frame loop.
    Failed,
}

impl EngineStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Uninitialized,
            1 => Self::Initializing,
            2 => Self::Running,
            3 => Self::Closing,
            4 => Self::Closed,
            _ => Self::Failed,
        }
    }
}

/// Construction-time tunables.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Bound of the command queue.
    pub queue_capacity: usize,
    /// How long a producer blocks on a full queue before its command is
    /// dropped and its ticket cancelled.
    pub enqueue_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            enqueue_timeout: DEFAULT_TICKET_WAIT,
        }
    }
}

// ── Shared state ─────────────────────────────────────────────────────────────

pub(crate) struct EngineShared {
    queue: CommandQueue,
    message_lock: Mutex<()>,
    status: AtomicU8,
    running: AtomicBool,
    latch: (Mutex<bool>, Condvar),
    render_thread: OnceLock<ThreadId>,
    limits: OnceLock<BackendLimits>,
    enqueue_timeout: Duration,
}

impl EngineShared {
    pub(crate) fn new(options: &EngineOptions) -> Self {
        Self {
            queue: CommandQueue::new(options.queue_capacity),
            message_lock: Mutex::new(()),
            status: AtomicU8::new(EngineStatus::Uninitialized as u8),
            running: AtomicBool::new(false),
            latch: (Mutex::new(false), Condvar::new()),
            render_thread: OnceLock::new(),
            limits: OnceLock::new(),
            enqueue_timeout: options.enqueue_timeout,
        }
    }

    pub(crate) fn status(&self) -> EngineStatus {
        EngineStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn set_status(&self, status: EngineStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    /// Atomically moves `from → to`; false when the current status is not in
    /// `from`.
    fn transition(&self, from: &[EngineStatus], to: EngineStatus) -> bool {
        let mut current = self.status.load(Ordering::SeqCst);
        loop {
            if !from.contains(&EngineStatus::from_u8(current)) {
                return false;
            }
            match self.status.compare_exchange(
                current,
                to as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn accepts_commands(&self) -> bool {
        matches!(
            self.status(),
            EngineStatus::Initializing | EngineStatus::Running
        )
    }

    fn is_render_thread(&self) -> bool {
        self.render_thread.get() == Some(&thread::current().id())
    }

    fn lock_messages(&self) -> MutexGuard<'_, ()> {
        self.message_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The render thread's drain: try-lock, never block.  Contention simply
    /// defers the pending commands to a later frame.
    pub(crate) fn drain_if_uncontended(&self) -> Vec<PendingCommand> {
        match self.message_lock.try_lock() {
            Ok(_guard) => self.queue.drain(),
            Err(TryLockError::WouldBlock) => Vec::new(),
            Err(TryLockError::Poisoned(_)) => self.queue.drain(),
        }
    }

    /// Enqueues with the message lock already held by the caller.
    pub(crate) fn submit_locked(&self, command: Command) -> Ticket {
        let ticket = Ticket::new();
        if !self.accepts_commands() {
            ticket.cancel();
            return ticket;
        }
        let pending = PendingCommand {
            command,
            ticket: ticket.clone(),
        };
        if self.is_render_thread() {
            // The render thread must never block on its own queue.
            self.queue.push_unbounded(pending);
        } else if let Err(e) = self.queue.push_timeout(pending, self.enqueue_timeout) {
            log::debug!("enqueue failed ({e}); cancelling the command");
            ticket.cancel();
        }
        ticket
    }

    /// One-off enqueue taking the message lock for the single command.
    pub(crate) fn submit(&self, command: Command) -> Ticket {
        let _guard = self.lock_messages();
        self.submit_locked(command)
    }

    /// Enqueues a sequence atomically with respect to other producers.
    pub(crate) fn submit_seq(&self, commands: Vec<Command>) -> Vec<Ticket> {
        let _guard = self.lock_messages();
        commands
            .into_iter()
            .map(|c| self.submit_locked(c))
            .collect()
    }

    fn release_latch(&self) {
        let (lock, cond) = &self.latch;
        let mut released = lock.lock().unwrap_or_else(|e| e.into_inner());
        *released = true;
        cond.notify_all();
    }

    fn wait_latch(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (lock, cond) = &self.latch;
        let mut released = lock.lock().unwrap_or_else(|e| e.into_inner());
        while !*released {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = cond
                .wait_timeout(released, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            released = next;
        }
        true
    }

    fn cancel_all_pending(&self) {
        for pending in self.queue.drain() {
            pending.ticket.cancel();
        }
    }
}

// ── Render thread entry ──────────────────────────────────────────────────────

fn run_render_thread<F>(
    shared: Arc<EngineShared>,
    window: WindowOptions,
    period: Duration,
    factory: F,
) where
    F: FnOnce() -> Result<Box<dyn RenderBackend>, BackendError>,
{
    let _ = shared.render_thread.set(thread::current().id());

    let built = catch_unwind(AssertUnwindSafe(|| -> Result<RenderManager, EngineError> {
        let backend = factory()?;
        let mut manager = RenderManager::new(backend, window);
        manager.install_defaults()?;
        Ok(manager)
    }));
    let mut manager = match built {
        Ok(Ok(manager)) => manager,
        Ok(Err(e)) => {
            log::error!("render thread initialization failed: {e}");
            shared.set_status(EngineStatus::Failed);
            shared.cancel_all_pending();
            shared.release_latch();
            return;
        }
        Err(_) => {
            log::error!("render thread initialization panicked");
            shared.set_status(EngineStatus::Failed);
            shared.cancel_all_pending();
            shared.release_latch();
            return;
        }
    };

    let _ = shared.limits.set(manager.state.limits);
    shared.transition(&[EngineStatus::Initializing], EngineStatus::Running);
    // Released on every path, success or not, so waiters never deadlock.
    shared.release_latch();

    let looped = catch_unwind(AssertUnwindSafe(|| {
        while shared.is_running() {
            manager.frame(&shared);
            let budget = manager.until_next(period);
            if !budget.is_zero() {
                thread::sleep(budget);
            }
        }
    }));

    match looped {
        Ok(()) => {
            manager.shutdown();
            shared.cancel_all_pending();
            shared.set_status(EngineStatus::Closed);
        }
        Err(_) => {
            log::error!("frame loop panicked; engine failed");
            shared.cancel_all_pending();
            shared.set_status(EngineStatus::Failed);
        }
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// Handle to the engine.  Cheap to share by reference; producers issue
/// commands through [`Engine::batch`].
pub struct Engine {
    shared: Arc<EngineShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(options: EngineOptions) -> Self {
        Self {
            shared: Arc::new(EngineShared::new(&options)),
            thread: Mutex::new(None),
        }
    }

    /// Spawns the render thread: backend construction (context acquisition),
    /// hardware-limit query, default objects, then the frame loop at
    /// `loop_period` (best effort).  Idempotent — a second call is a no-op.
    ///
    /// `factory` runs on the render thread, which is the only place a
    /// backend may be created.
    pub fn init<F>(
        &self,
        window: WindowOptions,
        loop_period: Duration,
        factory: F,
    ) -> Result<(), EngineError>
    where
        F: FnOnce() -> Result<Box<dyn RenderBackend>, BackendError> + Send + 'static,
    {
        if !self.shared.transition(
            &[EngineStatus::Uninitialized],
            EngineStatus::Initializing,
        ) {
            return Ok(());
        }
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name("kiln-render".into())
            .spawn(move || run_render_thread(shared, window, loop_period, factory));
        match spawned {
            Ok(handle) => {
                *self.thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.set_status(EngineStatus::Failed);
                self.shared.release_latch();
                Err(EngineError::Init(format!("could not spawn render thread: {e}")))
            }
        }
    }

    /// Blocks until initialization finished (either way) or `timeout`
    /// elapses, then reports whether the engine is running.
    pub fn wait_ready(&self, timeout: Duration) -> Result<(), EngineError> {
        if !self.shared.wait_latch(timeout) {
            return Err(EngineError::Timeout);
        }
        match self.status() {
            EngineStatus::Running => Ok(()),
            _ => Err(EngineError::NotRunning),
        }
    }

    pub fn status(&self) -> EngineStatus {
        self.shared.status()
    }

    /// Hardware texture-unit count, available once initialization completed.
    pub fn max_combined_texture_units(&self) -> Option<u32> {
        self.shared
            .limits
            .get()
            .map(|l| l.max_combined_texture_units)
    }

    pub fn max_texture_size(&self) -> Option<u32> {
        self.shared.limits.get().map(|l| l.max_texture_size)
    }

    /// Acquires the message lock and returns the typed command surface.
    /// All commands issued through one batch enqueue atomically with
    /// respect to other producers.
    pub fn batch(&self) -> MessageBatch<'_> {
        let guard = self.shared.lock_messages();
        MessageBatch {
            shared: &self.shared,
            _guard: guard,
        }
    }

    /// Stops the frame loop, closes every registered object on the render
    /// thread, and joins it.  Idempotent.
    pub fn close(&self) {
        if !self.shared.transition(
            &[EngineStatus::Initializing, EngineStatus::Running],
            EngineStatus::Closing,
        ) {
            return;
        }
        self.shared.running.store(false, Ordering::SeqCst);
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineOptions::default())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Typed command surface ────────────────────────────────────────────────────

/// Guard over the message lock exposing one typed method per command.
///
/// Every method enqueues and returns a [`Ticket`]; none of them block on the
/// render thread (the queue bound aside).  Check outcomes with
/// [`Ticket::wait`]/[`Ticket::try_get`] — a cancelled ticket means the
/// command's preconditions were unmet, which is a normal, expected outcome.
///
/// Drop the batch before waiting on its tickets: the render thread skips
/// draining while any producer holds the message lock, so a wait performed
/// with the guard alive can only time out.
pub struct MessageBatch<'a> {
    shared: &'a EngineShared,
    _guard: MutexGuard<'a, ()>,
}

impl MessageBatch<'_> {
    fn submit(&self, command: Command) -> Ticket {
        self.shared.submit_locked(command)
    }

    // ── Meshes ───────────────────────────────────────────────────────────

    pub fn new_mesh(
        &self,
        identity: Option<String>,
        positions: Vec<Vec3>,
        uvs: Vec<Vec2>,
        normals: Option<Vec<Vec3>>,
        triangles: Vec<u32>,
    ) -> Ticket {
        self.submit(Command::NewMesh {
            identity,
            positions,
            uvs,
            normals,
            triangles,
        })
    }

    pub fn select_mesh(&self, id: u32) -> Ticket {
        self.submit(Command::SelectMesh { id })
    }

    pub fn set_mesh_attributes(
        &self,
        positions: Vec<Vec3>,
        uvs: Vec<Vec2>,
        normals: Option<Vec<Vec3>>,
        triangles: Option<Vec<u32>>,
    ) -> Ticket {
        self.submit(Command::SetMeshAttributes {
            positions,
            uvs,
            normals,
            triangles,
        })
    }

    pub fn recalculate_normals(&self) -> Ticket {
        self.submit(Command::RecalculateNormals)
    }

    pub fn force_rebuffer(&self) -> Ticket {
        self.submit(Command::ForceRebuffer)
    }

    pub fn set_mesh_read_only(&self) -> Ticket {
        self.submit(Command::SetMeshReadOnly)
    }

    pub fn close_mesh(&self) -> Ticket {
        self.submit(Command::CloseMesh)
    }

    // ── Shaders & programs ───────────────────────────────────────────────

    pub fn new_shader(&self, stage: ShaderStage, identity: String, source: String) -> Ticket {
        self.submit(Command::NewShader {
            stage,
            identity,
            source,
        })
    }

    /// Loads stage source from `<root>/<identity>.<vert|geom|frag>`.
    pub fn new_shader_from_dir(
        &self,
        root: &Path,
        identity: &str,
        stage: ShaderStage,
    ) -> Result<Ticket, EngineError> {
        let source = std::fs::read_to_string(shader_abi::stage_path(root, identity, stage))?;
        Ok(self.new_shader(stage, identity.to_owned(), source))
    }

    pub fn select_shader(&self, id: u32) -> Ticket {
        self.submit(Command::SelectShader { id })
    }

    pub fn close_shader(&self) -> Ticket {
        self.submit(Command::CloseShader)
    }

    pub fn new_program(&self, mode: ProgramMode) -> Ticket {
        self.submit(Command::NewProgram { mode })
    }

    pub fn select_program(&self, id: u32) -> Ticket {
        self.submit(Command::SelectProgram { id })
    }

    /// Attaches the selected shader to the selected program.
    pub fn attach_shader(&self) -> Ticket {
        self.submit(Command::AttachShader)
    }

    pub fn set_program_read_only(&self) -> Ticket {
        self.submit(Command::SetProgramReadOnly)
    }

    pub fn close_program(&self) -> Ticket {
        self.submit(Command::CloseProgram)
    }

    // ── Textures ─────────────────────────────────────────────────────────

    pub fn new_texture_2d(
        &self,
        unit: u32,
        data: TextureData,
        identity: Option<String>,
    ) -> Ticket {
        self.submit(Command::NewTexture2d {
            unit,
            data,
            identity,
        })
    }

    pub fn new_cubemap(
        &self,
        unit: u32,
        faces: Box<[TextureData; 6]>,
        identity: Option<String>,
    ) -> Ticket {
        self.submit(Command::NewCubemap {
            unit,
            faces,
            identity,
        })
    }

    pub fn new_cubemap_packed(
        &self,
        unit: u32,
        image: TextureData,
        identity: Option<String>,
    ) -> Ticket {
        self.submit(Command::NewCubemapPacked {
            unit,
            image,
            identity,
        })
    }

    pub fn select_texture(&self, id: u32) -> Ticket {
        self.submit(Command::SelectTexture { id })
    }

    pub fn close_texture(&self) -> Ticket {
        self.submit(Command::CloseTexture)
    }

    // ── Renderables ──────────────────────────────────────────────────────

    /// Creates a renderable over the selected mesh.
    pub fn new_renderable(&self, instances: Vec<Transform>) -> Ticket {
        self.submit(Command::NewRenderable { instances })
    }

    pub fn select_renderable(&self, id: u32) -> Ticket {
        self.submit(Command::SelectRenderable { id })
    }

    /// Binds the selected texture to `unit` of the selected renderable.
    pub fn set_renderable_texture(&self, unit: u32) -> Ticket {
        self.submit(Command::SetRenderableTexture { unit })
    }

    pub fn clear_renderable_texture(&self, unit: u32) -> Ticket {
        self.submit(Command::ClearRenderableTexture { unit })
    }

    pub fn set_instances(&self, instances: Vec<Transform>) -> Ticket {
        self.submit(Command::SetInstances { instances })
    }

    /// `weights` is row-major with one column per bone.
    pub fn attach_skeleton(&self, bones: Vec<Bone>, weights: Vec<f32>) -> Ticket {
        self.submit(Command::AttachSkeleton { bones, weights })
    }

    pub fn detach_skeleton(&self) -> Ticket {
        self.submit(Command::DetachSkeleton)
    }

    pub fn set_bone_transform(&self, bone: usize, local: Transform) -> Ticket {
        self.submit(Command::SetBoneTransform { bone, local })
    }

    /// Files the selected renderable under the selected program.
    pub fn assign_program(&self) -> Ticket {
        self.submit(Command::AssignProgram)
    }

    /// Moves the selected renderable to the UI set.
    pub fn assign_ui(&self) -> Ticket {
        self.submit(Command::AssignUi)
    }

    pub fn close_renderable(&self) -> Ticket {
        self.submit(Command::CloseRenderable)
    }

    // ── Skybox / frame state ─────────────────────────────────────────────

    /// Uses the selected cubemap texture as the skybox.
    pub fn set_skybox_texture(&self) -> Ticket {
        self.submit(Command::SetSkyboxTexture)
    }

    pub fn enable_skybox(&self, enabled: bool) -> Ticket {
        self.submit(Command::EnableSkybox { enabled })
    }

    pub fn enable_ui(&self, enabled: bool) -> Ticket {
        self.submit(Command::EnableUi { enabled })
    }

    pub fn set_view_transform(&self, view: Transform) -> Ticket {
        self.submit(Command::SetViewTransform { view })
    }

    pub fn set_window_options(&self, options: WindowOptions) -> Ticket {
        self.submit(Command::SetWindowOptions { options })
    }
}

// ── Renderable handle ────────────────────────────────────────────────────────

/// Caller-side handle whose internal id materializes asynchronously.
///
/// Construction enqueues the creation commands and spawns an unmanaged
/// waiter thread for the resulting ticket.  Until [`RenderableHandle::has_id`]
/// turns true, mutations are silent no-ops — not errors.  A creation or wait
/// failure poisons the handle permanently ([`RenderableHandle::is_failed`]).
pub struct RenderableHandle {
    shared: Arc<EngineShared>,
    id: Arc<OnceLock<u32>>,
    failed: Arc<AtomicBool>,
}

impl RenderableHandle {
    pub fn new(engine: &Engine, mesh: u32, instances: Vec<Transform>) -> Self {
        let tickets = engine.shared.submit_seq(vec![
            Command::SelectMesh { id: mesh },
            Command::NewRenderable { instances },
        ]);
        let id = Arc::new(OnceLock::new());
        let failed = Arc::new(AtomicBool::new(false));

        let ticket = tickets.into_iter().next_back();
        let id_slot = Arc::clone(&id);
        let failed_slot = Arc::clone(&failed);
        thread::spawn(move || {
            let outcome = ticket
                .map(|t| t.wait_timeout(DEFAULT_TICKET_WAIT))
                .unwrap_or(Err(EngineError::Cancelled));
            match outcome {
                Ok(Reply::Id(new_id)) => {
                    let _ = id_slot.set(new_id);
                }
                _ => failed_slot.store(true, Ordering::SeqCst),
            }
        });

        Self {
            shared: Arc::clone(&engine.shared),
            id,
            failed,
        }
    }

    /// Whether the renderable's id has materialized.  Mutations before this
    /// point are no-ops.
    pub fn has_id(&self) -> bool {
        self.id.get().is_some()
    }

    pub fn id(&self) -> Option<u32> {
        self.id.get().copied()
    }

    /// Whether creation (or a later bounded wait) failed for this handle.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Selects the renderable, blocking up to the default bound.  A timeout
    /// or cancellation poisons the handle.
    pub fn select(&self) -> Result<(), EngineError> {
        let Some(id) = self.id() else {
            return Ok(());
        };
        let ticket = self.shared.submit(Command::SelectRenderable { id });
        match ticket.wait_timeout(DEFAULT_TICKET_WAIT) {
            Ok(_) => Ok(()),
            Err(e) => {
                self.failed.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Replaces the instance transforms.  No-op until the id materializes.
    pub fn set_instances(&self, instances: Vec<Transform>) -> Ticket {
        match self.id() {
            Some(id) => {
                let tickets = self.shared.submit_seq(vec![
                    Command::SelectRenderable { id },
                    Command::SetInstances { instances },
                ]);
                tickets.into_iter().next_back().unwrap_or_else(|| {
                    let t = Ticket::new();
                    t.cancel();
                    t
                })
            }
            None => {
                // Not materialized yet: a completed no-op, per contract.
                let t = Ticket::new();
                t.complete(Reply::Done);
                t
            }
        }
    }

    /// Binds texture `texture` to unit `unit`.  No-op until the id
    /// materializes.
    pub fn set_texture(&self, texture: u32, unit: u32) -> Ticket {
        match self.id() {
            Some(id) => {
                let tickets = self.shared.submit_seq(vec![
                    Command::SelectRenderable { id },
                    Command::SelectTexture { id: texture },
                    Command::SetRenderableTexture { unit },
                ]);
                tickets.into_iter().next_back().unwrap_or_else(|| {
                    let t = Ticket::new();
                    t.cancel();
                    t
                })
            }
            None => {
                let t = Ticket::new();
                t.complete(Reply::Done);
                t
            }
        }
    }
}
