//! Window + runtime loop.
//!
//! Owns the `winit` EventLoop and Window, and wires them to the GPU context.

mod runtime;

pub use runtime::{Runtime, RuntimeConfig, RuntimeCtx};
