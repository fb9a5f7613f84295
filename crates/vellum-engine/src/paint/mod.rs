//! Color model shared between batches and backends.

pub mod color;

pub use color::Color;
