//! Error types.
//!
//! All fallible engine APIs return [`Result<T>`], an alias for
//! `std::result::Result<T, VellumError>`.
//!
//! Propagation policy:
//! - usage and thread-affinity errors fail fast at the call site
//! - per-resource snapshot/restore failures are absorbed by the registry and
//!   only show up in switch reports and logs
//! - backend initialization failure always reaches the caller of the switch

use std::thread::ThreadId;

use thiserror::Error;

use crate::gpu::ResourceHandle;

/// The main error type for the engine.
#[derive(Error, Debug)]
pub enum VellumError {
    /// API misuse. Not recoverable locally.
    #[error("usage error: {0}")]
    Usage(#[from] UsageError),

    /// A GPU-touching call originated off the bound thread.
    #[error("GPU call from thread {current:?}, but the context is bound to {bound:?}")]
    ThreadAffinity {
        bound: Option<ThreadId>,
        current: ThreadId,
    },

    /// The backend failed to allocate a GPU resource.
    #[error("failed to create {what}: {reason}")]
    ResourceCreation { what: &'static str, reason: String },

    /// A resource's content could not be read back.
    #[error("snapshot failed: {reason}")]
    Snapshot { reason: String },

    /// The new backend failed to initialize during a switch (or at startup).
    #[error("backend initialization failed: {0}")]
    BackendInit(String),

    /// There is no backend to render with (a previous switch failed).
    #[error("no graphics backend is available")]
    BackendUnavailable,

    /// Backend operation failure other than resource creation.
    #[error("device error: {0}")]
    Device(String),

    #[error("image decode error: {0}")]
    ImageDecode(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// API misuse detected at the call site.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UsageError {
    #[error("draw called while the batch is closed")]
    DrawWhileClosed,

    #[error("begin called while the batch is already open")]
    BeginWhileOpen,

    #[error("end called while the batch is closed")]
    EndWhileClosed,

    #[error("a GPU context already exists in this process")]
    ContextAlreadyExists,

    #[error("the GPU context is already bound to a thread")]
    AffinityAlreadyBound,

    #[error("{open} batch(es) still open; {action} requires all batches closed")]
    BatchesOpen { open: usize, action: &'static str },

    #[error("resource {0:?} was released")]
    ResourceReleased(ResourceHandle),

    #[error("resource {0:?} is not tracked by the registry")]
    UnknownResource(ResourceHandle),

    #[error("resource {0:?} has no GPU content after a backend switch")]
    UnresolvedResource(ResourceHandle),

    #[error("resource {0:?} is not a render target")]
    NotARenderTarget(ResourceHandle),

    #[error("render target {0:?} is bound and cannot be sampled")]
    SampledWhileBound(ResourceHandle),

    #[error("region {x},{y} {width}x{height} exceeds texture bounds {tex_width}x{tex_height}")]
    RegionOutOfBounds {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        tex_width: u32,
        tex_height: u32,
    },

    #[error("expected {expected} bytes of RGBA8 pixel data, got {actual}")]
    PixelLengthMismatch { expected: usize, actual: usize },

    #[error("reservation of {vertices} vertices / {indices} indices exceeds batch capacity")]
    ReservationTooLarge { vertices: usize, indices: usize },

    #[error("texture dimensions must be non-zero (got {width}x{height})")]
    ZeroSizedTexture { width: u32, height: u32 },
}

/// Engine-wide result alias.
pub type Result<T> = std::result::Result<T, VellumError>;
