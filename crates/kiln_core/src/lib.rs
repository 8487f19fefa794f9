//! `kiln_core` — backend-free value types shared across the Kiln engine.
//!
//! | Module      | Responsibility                                    |
//! |-------------|---------------------------------------------------|
//! | `transform` | TRS affine transform for instances and bones      |
//! | `time`      | Frame-timing snapshots for the render loop        |
//! | `color`     | Linear RGBA color (clear values, debug tints)     |
//!
//! Everything in this crate is plain CPU data: no windowing, no GPU types.
//! Math comes from `glam`; the engine treats vectors and matrices as opaque
//! value types with known operations.

pub mod color;
pub mod time;
pub mod transform;

pub use color::Color;
pub use time::{Time, TimeClock};
pub use transform::Transform;

pub use glam;
