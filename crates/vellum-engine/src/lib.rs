//! Vellum engine crate.
//!
//! A batched 2D primitive renderer whose graphics backend can be swapped at
//! runtime without losing textures or render targets.

pub mod backend;
pub mod batch;
pub mod coords;
pub mod core;
pub mod error;
pub mod gpu;
pub mod logging;
pub mod paint;
pub mod time;
pub mod window;

pub use error::{Result, UsageError, VellumError};
