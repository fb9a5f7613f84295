//! Time subsystem.
//!
//! Provides stable, testable frame timing utilities without coupling to the runtime.
//! Intended usage:
//! - one `FrameClock` per window (or per render loop)
//! - call `tick()` once per presented frame to obtain `FrameTime`
//! - `Cadence` turns frame deltas into coarse periodic work (registry pruning)

mod cadence;
mod frame_clock;

pub use cadence::Cadence;
pub use frame_clock::{FrameClock, FrameTime};
