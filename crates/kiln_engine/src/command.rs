//! Typed commands, result tickets and the bounded queue between producer
//! threads and the render thread.
//!
//! Every enqueued command carries a one-shot [`Ticket`].  The render thread
//! completes it with [`Reply::Id`] (new-object commands) or [`Reply::Done`]
//! (mutations), or cancels it.  Cancellation is the *normal* signal for an
//! unmet precondition — wrong-typed selection, out-of-range argument — and
//! callers are expected to check for it; it is also how engine-side faults
//! surface, distinguishable only through the engine status flags.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use glam::{Vec2, Vec3};

use kiln_core::Transform;

use crate::backend::ProgramMode;
use crate::error::EngineError;
use crate::manager::WindowOptions;
use crate::resources::shader::ShaderStage;
use crate::resources::skeleton::Bone;
use crate::resources::texture::TextureData;

/// Default bound for blocking waits against the render thread.
pub const DEFAULT_TICKET_WAIT: Duration = Duration::from_secs(5);

/// Successful command outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Id of a newly created (or deduplicated) object.
    Id(u32),
    /// Mutation applied.
    Done,
}

impl Reply {
    /// Convenience accessor for new-object replies.
    pub fn id(self) -> Option<u32> {
        match self {
            Reply::Id(id) => Some(id),
            Reply::Done => None,
        }
    }
}

enum TicketState {
    Pending,
    Done(Reply),
    Cancelled,
}

struct TicketShared {
    state: Mutex<TicketState>,
    cond: Condvar,
}

/// One-shot, cross-thread command result.
#[derive(Clone)]
pub struct Ticket {
    shared: Arc<TicketShared>,
}

impl Ticket {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(TicketShared {
                state: Mutex::new(TicketState::Pending),
                cond: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TicketState> {
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn complete(&self, reply: Reply) {
        let mut state = self.lock();
        if matches!(*state, TicketState::Pending) {
            *state = TicketState::Done(reply);
            self.shared.cond.notify_all();
        }
    }

    pub(crate) fn cancel(&self) {
        let mut state = self.lock();
        if matches!(*state, TicketState::Pending) {
            *state = TicketState::Cancelled;
            self.shared.cond.notify_all();
        }
    }

    /// Non-blocking poll: `None` while pending.
    pub fn try_get(&self) -> Option<Result<Reply, EngineError>> {
        match &*self.lock() {
            TicketState::Pending => None,
            TicketState::Done(r) => Some(Ok(*r)),
            TicketState::Cancelled => Some(Err(EngineError::Cancelled)),
        }
    }

    /// Whether the render thread cancelled this command.
    pub fn is_cancelled(&self) -> bool {
        matches!(*self.lock(), TicketState::Cancelled)
    }

    /// Blocks until settled or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Reply, EngineError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            match &*state {
                TicketState::Done(r) => return Ok(*r),
                TicketState::Cancelled => return Err(EngineError::Cancelled),
                TicketState::Pending => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(EngineError::Timeout);
                    }
                    let (next, _) = self
                        .shared
                        .cond
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|e| e.into_inner());
                    state = next;
                }
            }
        }
    }

    /// Blocks with the default 5-second bound.
    pub fn wait(&self) -> Result<Reply, EngineError> {
        self.wait_timeout(DEFAULT_TICKET_WAIT)
    }
}

// ── Commands ─────────────────────────────────────────────────────────────────

/// Every operation the render thread can be asked to perform.
///
/// Commands address objects implicitly through the selection context: a
/// `new_*`/`select_*` command sets a selection slot, and subsequent commands
/// in the same or a later frame read it.
pub enum Command {
    // ── Meshes ───────────────────────────────────────────────────────────
    /// Create a mesh and select it.  An identity key deduplicates against
    /// previously registered meshes.
    NewMesh {
        identity: Option<String>,
        positions: Vec<Vec3>,
        uvs: Vec<Vec2>,
        normals: Option<Vec<Vec3>>,
        triangles: Vec<u32>,
    },
    SelectMesh {
        id: u32,
    },
    /// Update the selected mesh.  `triangles: None` keeps current indices.
    SetMeshAttributes {
        positions: Vec<Vec3>,
        uvs: Vec<Vec2>,
        normals: Option<Vec<Vec3>>,
        triangles: Option<Vec<u32>>,
    },
    RecalculateNormals,
    ForceRebuffer,
    SetMeshReadOnly,
    CloseMesh,

    // ── Shaders & programs ───────────────────────────────────────────────
    /// Register stage source under `identity` and select it.
    NewShader {
        stage: ShaderStage,
        identity: String,
        source: String,
    },
    SelectShader {
        id: u32,
    },
    CloseShader,
    /// Create an empty program of `mode` and select it.
    NewProgram {
        mode: ProgramMode,
    },
    SelectProgram {
        id: u32,
    },
    /// Attach the selected shader to the selected program.
    AttachShader,
    SetProgramReadOnly,
    CloseProgram,

    // ── Textures ─────────────────────────────────────────────────────────
    NewTexture2d {
        unit: u32,
        data: TextureData,
        identity: Option<String>,
    },
    NewCubemap {
        unit: u32,
        faces: Box<[TextureData; 6]>,
        identity: Option<String>,
    },
    /// Single packed image split by its aspect ratio (6:1, 4:3, 3:4, 1:6).
    NewCubemapPacked {
        unit: u32,
        image: TextureData,
        identity: Option<String>,
    },
    SelectTexture {
        id: u32,
    },
    CloseTexture,

    // ── Renderables ──────────────────────────────────────────────────────
    /// Create a renderable over the selected mesh and select it.
    NewRenderable {
        instances: Vec<Transform>,
    },
    SelectRenderable {
        id: u32,
    },
    /// Bind the selected texture to `unit` of the selected renderable.
    SetRenderableTexture {
        unit: u32,
    },
    ClearRenderableTexture {
        unit: u32,
    },
    SetInstances {
        instances: Vec<Transform>,
    },
    /// Attach a skeleton to the selected renderable.  `weights` is row-major
    /// with one column per bone; the row count must divide evenly.
    AttachSkeleton {
        bones: Vec<Bone>,
        weights: Vec<f32>,
    },
    DetachSkeleton,
    SetBoneTransform {
        bone: usize,
        local: Transform,
    },
    /// File the selected renderable under the selected program.
    AssignProgram,
    /// Move the selected renderable to the UI set (disjoint from the map).
    AssignUi,
    CloseRenderable,

    // ── Skybox / frame state ─────────────────────────────────────────────
    /// Use the selected (cubemap) texture as the skybox.
    SetSkyboxTexture,
    EnableSkybox {
        enabled: bool,
    },
    EnableUi {
        enabled: bool,
    },
    SetViewTransform {
        view: Transform,
    },
    SetWindowOptions {
        options: WindowOptions,
    },
}

/// A command waiting in the queue, paired with its result slot.
pub struct PendingCommand {
    pub command: Command,
    pub ticket: Ticket,
}

// ── Queue ────────────────────────────────────────────────────────────────────

/// Bounded FIFO between producers and the render thread.
///
/// Producers block (bounded by a timeout) while the queue is full; the
/// render thread drains everything in one non-blocking swap.
pub struct CommandQueue {
    inner: Mutex<VecDeque<PendingCommand>>,
    space: Condvar,
    capacity: usize,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            space: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<PendingCommand>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueues, blocking up to `timeout` for space.
    pub fn push_timeout(
        &self,
        pending: PendingCommand,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.lock();
        while queue.len() >= self.capacity {
            let now = Instant::now();
            if now >= deadline {
                return Err(EngineError::QueueFull);
            }
            let (next, _) = self
                .space
                .wait_timeout(queue, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            queue = next;
        }
        queue.push_back(pending);
        Ok(())
    }

    /// Enqueues without waiting for space.  Reserved for the render thread
    /// itself, which must never block on its own queue.
    pub fn push_unbounded(&self, pending: PendingCommand) {
        self.lock().push_back(pending);
    }

    /// Atomically takes every pending command, oldest first.
    pub fn drain(&self) -> Vec<PendingCommand> {
        let drained: Vec<_> = {
            let mut queue = self.lock();
            queue.drain(..).collect()
        };
        if !drained.is_empty() {
            self.space.notify_all();
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn ticket_completes_once() {
        let t = Ticket::new();
        t.complete(Reply::Id(3));
        t.cancel(); // late cancel must not override
        assert_eq!(t.try_get().unwrap().unwrap(), Reply::Id(3));
        assert!(!t.is_cancelled());
    }

    #[test]
    fn ticket_wait_times_out() {
        let t = Ticket::new();
        let err = t.wait_timeout(Duration::from_millis(20));
        assert!(matches!(err, Err(EngineError::Timeout)));
    }

    #[test]
    fn ticket_wakes_a_blocked_waiter() {
        let t = Ticket::new();
        let t2 = t.clone();
        let waiter = thread::spawn(move || t2.wait_timeout(Duration::from_secs(2)));
        thread::sleep(Duration::from_millis(10));
        t.complete(Reply::Done);
        assert_eq!(waiter.join().unwrap().unwrap(), Reply::Done);
    }

    #[test]
    fn full_queue_blocks_until_drained() {
        let q = Arc::new(CommandQueue::new(1));
        q.push_timeout(
            PendingCommand {
                command: Command::EnableUi { enabled: true },
                ticket: Ticket::new(),
            },
            Duration::from_millis(10),
        )
        .unwrap();

        let q2 = q.clone();
        let producer = thread::spawn(move || {
            q2.push_timeout(
                PendingCommand {
                    command: Command::EnableUi { enabled: false },
                    ticket: Ticket::new(),
                },
                Duration::from_secs(2),
            )
        });

        thread::sleep(Duration::from_millis(20));
        assert_eq!(q.drain().len(), 1);
        producer.join().unwrap().unwrap();
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn full_queue_times_out_the_producer() {
        let q = CommandQueue::new(1);
        q.push_timeout(
            PendingCommand {
                command: Command::EnableUi { enabled: true },
                ticket: Ticket::new(),
            },
            Duration::from_millis(10),
        )
        .unwrap();
        let err = q.push_timeout(
            PendingCommand {
                command: Command::EnableUi { enabled: false },
                ticket: Ticket::new(),
            },
            Duration::from_millis(30),
        );
        assert!(matches!(err, Err(EngineError::QueueFull)));
    }

    #[test]
    fn drain_preserves_fifo_order() {
        let q = CommandQueue::new(8);
        for id in 0..3 {
            q.push_unbounded(PendingCommand {
                command: Command::SelectMesh { id },
                ticket: Ticket::new(),
            });
        }
        let drained = q.drain();
        let ids: Vec<u32> = drained
            .iter()
            .map(|p| match p.command {
                Command::SelectMesh { id } => id,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert!(q.is_empty());
    }
}
