//! `kiln_wgpu` — wgpu 23 backend for the Kiln engine.
//!
//! | Module    | Responsibility                                      |
//! |-----------|-----------------------------------------------------|
//! | `context` | instance/adapter/device/queue bring-up              |
//! | `backend` | `RenderBackend` impl: buffers, textures, pipelines  |
//! | `shaders` | default WGSL programs honoring the engine ABI       |
//!
//! The backend must be constructed on the engine's render thread — pass a
//! constructor closure to `Engine::init`:
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use kiln_engine::{Engine, EngineOptions, WindowOptions};
//! use kiln_wgpu::WgpuBackend;
//!
//! let window: Arc<winit::window::Window> = /* created by the application */;
//! let engine = Engine::new(EngineOptions::default());
//! engine.init(WindowOptions::default(), Duration::from_millis(16), move || {
//!     Ok(Box::new(WgpuBackend::new(window)?))
//! })?;
//! ```

pub mod backend;
pub mod context;

pub use backend::{WgpuBackend, ENTRY_FRAGMENT, ENTRY_VERTEX};
pub use context::{ContextError, GpuContext};
