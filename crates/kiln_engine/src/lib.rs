//! `kiln_engine` — single-consumer graphics command engine.
//!
//! Application threads request GPU-side object creation and mutation through
//! an asynchronous bounded command queue; one dedicated render thread owns
//! the graphics backend, drains the queue each frame, and draws.  Callers
//! get [`command::Ticket`]s that complete with an id or a done marker, or
//! are cancelled on precondition failure.
//!
//! # Module layout
//!
//! | Module       | Responsibility                                        |
//! |--------------|-------------------------------------------------------|
//! | `registry`   | id ↔ object arena with keyed dedup, capacity bound    |
//! | `backend`    | `RenderBackend` trait, handles, limits, headless impl |
//! | `resources`  | meshes, shaders, programs, textures, skeletons, …     |
//! | `command`    | typed commands, tickets, the bounded queue            |
//! | `manager`    | render-thread state and the per-frame loop            |
//! | `engine`     | public facade: init latch, message lock, `msg` surface|
//! | `shader_abi` | fixed attribute/bind-group/name contract for shaders  |
//!
//! # Example
//! ```rust,ignore
//! use std::time::Duration;
//! use kiln_engine::{Engine, EngineOptions, HeadlessBackend, WindowOptions};
//!
//! let engine = Engine::new(EngineOptions::default());
//! engine.init(WindowOptions::default(), Duration::from_millis(16), || {
//!     Ok(Box::new(HeadlessBackend::new()))
//! })?;
//! engine.wait_ready(Duration::from_secs(5))?;
//!
//! let batch = engine.batch();
//! let mesh = batch.new_mesh(None, positions, uvs, None, triangles);
//! drop(batch);
//! let id = mesh.wait()?; // Reply::Id(..)
//! ```

pub mod backend;
pub mod command;
pub mod engine;
pub mod error;
pub mod manager;
pub mod registry;
pub mod resources;
pub mod shader_abi;

mod dispatch;

pub use backend::{
    BackendError, BackendLimits, ClearMode, DepthMode, HeadlessBackend, ProgramMode,
    RenderBackend,
};
pub use command::{Reply, Ticket, DEFAULT_TICKET_WAIT};
pub use engine::{Engine, EngineOptions, EngineStatus, MessageBatch, RenderableHandle};
pub use error::EngineError;
pub use manager::WindowOptions;
pub use registry::Registry;
pub use resources::{
    Bone, CubemapLayout, Mesh, Renderable, Shader, ShaderProgram, ShaderStage, Skeleton, Skybox,
    Texture, TextureData, WeightMatrix,
};

pub use glam;
pub use kiln_core;
