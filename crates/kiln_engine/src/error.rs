//! Engine-wide error type.
//!
//! The command pipeline reports expected precondition failures to callers by
//! *cancelling* their ticket, not by returning these errors — `EngineError`
//! surfaces where a caller holds a direct handle (facade calls, ticket
//! waits, resource constructors run on the render thread).

use thiserror::Error;

use crate::backend::BackendError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Operation on an object whose GPU handles were already released.
    #[error("object is closed")]
    ObjectClosed,

    /// Mutation of a mesh that was promoted to read-only.
    #[error("mesh is read-only")]
    ReadOnly,

    /// A registry refused a registration because it is at capacity.
    #[error("registry '{name}' is at capacity ({capacity})")]
    RegistryFull { name: &'static str, capacity: usize },

    /// Mesh construction or update with inconsistent attribute arrays.
    #[error("invalid mesh data: {0}")]
    InvalidMesh(String),

    /// Texture construction with inconsistent dimensions or packing.
    #[error("invalid texture data: {0}")]
    InvalidTexture(String),

    /// Skeleton or weight-matrix construction violating its invariants.
    #[error("invalid skeleton: {0}")]
    InvalidSkeleton(String),

    /// Program assembly violating the stage contract (missing vertex or
    /// fragment stage, wrong-stage attachment, mutation after link).
    #[error("invalid shader program: {0}")]
    InvalidProgram(String),

    /// Renderable construction or mutation with bad arguments.
    #[error("invalid renderable: {0}")]
    InvalidRenderable(String),

    /// The bounded command queue stayed full past the enqueue timeout.
    #[error("command queue is full")]
    QueueFull,

    /// The render thread cancelled the command (unmet precondition or an
    /// engine-side fault — distinguish via [`crate::EngineStatus`]).
    #[error("command was cancelled")]
    Cancelled,

    /// A ticket wait exceeded its bound.
    #[error("timed out waiting for the render thread")]
    Timeout,

    /// The engine is not accepting commands (never initialized, closing,
    /// closed, or failed).
    #[error("engine is not running")]
    NotRunning,

    /// Render-thread initialization could not build the default objects.
    #[error("initialization failed: {0}")]
    Init(String),

    /// A shader source file could not be read from disk.
    #[error("shader source unreadable: {0}")]
    ShaderSource(#[from] std::io::Error),

    #[error(transparent)]
    Backend(#[from] BackendError),
}
