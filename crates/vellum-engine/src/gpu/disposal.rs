use crate::backend::{GpuBufferId, GraphicsBackend};
use crate::error::Result;

use super::affinity::ThreadAffinityGuard;
use super::registry::{GpuResourceRegistry, ResourceHandle};

/// A destructive GPU operation recorded off the affinity thread.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DisposalRequest {
    /// Release a registry-tracked texture or render target.
    ReleaseResource(ResourceHandle),
    /// Release a batch geometry buffer created under backend `generation`.
    ReleaseGeometry {
        buffer: GpuBufferId,
        generation: u64,
    },
}

impl DisposalRequest {
    /// Performs the release against the active backend.
    ///
    /// Failures are logged and absorbed so one request never blocks the rest
    /// of a drain.
    pub(crate) fn release(
        self,
        backend: &mut dyn GraphicsBackend,
        registry: &GpuResourceRegistry,
        generation: u64,
    ) {
        match self {
            DisposalRequest::ReleaseResource(handle) => {
                if let Err(e) = registry.release(handle, backend) {
                    log::debug!("deferred release of {handle:?} skipped: {e}");
                }
            }
            DisposalRequest::ReleaseGeometry {
                buffer,
                generation: owner,
            } => {
                if owner == generation {
                    backend.destroy_geometry(buffer);
                } else {
                    log::debug!("geometry {buffer:?} went away with backend generation {owner}");
                }
            }
        }
    }

    /// Settles the request while no backend is active.
    pub(crate) fn discard(self, registry: &GpuResourceRegistry) {
        if let DisposalRequest::ReleaseResource(handle) = self {
            if let Err(e) = registry.release_detached(handle) {
                log::debug!("deferred release of {handle:?} skipped: {e}");
            }
        }
    }
}

/// Cloneable, thread-safe producer end of the disposal queue.
///
/// Enqueuing never touches the GPU.
#[derive(Clone, Debug)]
pub struct DisposalSender {
    tx: flume::Sender<DisposalRequest>,
}

impl DisposalSender {
    pub fn enqueue(&self, request: DisposalRequest) {
        if self.tx.send(request).is_err() {
            // The context is gone and took the backend with it.
            log::debug!("disposal queue closed; {request:?} discarded");
        }
    }
}

/// Multi-producer / single-consumer bridge that moves destructive GPU calls
/// onto the affinity thread.
///
/// Any thread may [`enqueue`](Self::enqueue). Only the affinity thread may
/// [`drain_all`](Self::drain_all), once per frame before batches reopen.
#[derive(Debug)]
pub struct DeferredDisposalQueue {
    tx: flume::Sender<DisposalRequest>,
    rx: flume::Receiver<DisposalRequest>,
}

impl Default for DeferredDisposalQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DeferredDisposalQueue {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }

    pub fn sender(&self) -> DisposalSender {
        DisposalSender {
            tx: self.tx.clone(),
        }
    }

    pub fn enqueue(&self, request: DisposalRequest) {
        // Cannot fail: `self` keeps the receiver alive.
        let _ = self.tx.send(request);
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Removes every queued request and hands each to `release`.
    ///
    /// Requests are independent; `release` is expected to absorb its own
    /// per-request failures. Returns the number of requests processed.
    pub fn drain_all<F>(&self, guard: &ThreadAffinityGuard, mut release: F) -> Result<usize>
    where
        F: FnMut(DisposalRequest),
    {
        guard.check_thread()?;

        let mut count = 0;
        for request in self.rx.drain() {
            release(request);
            count += 1;
        }

        if count > 0 {
            log::debug!("drained {count} deferred disposal(s)");
        }
        Ok(count)
    }
}
