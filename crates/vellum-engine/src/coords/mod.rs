//! Coordinate and geometry types shared by batches and backends.
//!
//! Canonical CPU space:
//! - pixels, origin top-left
//! - +X right, +Y down
//!
//! Backends convert to NDC in shaders using the framebuffer size.

mod region;
mod vec2;

pub use region::Region;
pub use vec2::Vec2;
