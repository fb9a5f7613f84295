use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{BackendFactory, BackendInfo, BackendKind, GraphicsBackend};
use crate::error::{Result, UsageError, VellumError};

use super::affinity::ThreadAffinityGuard;
use super::disposal::DeferredDisposalQueue;
use super::registry::{GpuResourceRegistry, RestoreReport, SnapshotReport};

/// Where the backend switch state machine currently is.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SwitchState {
    Running,
    /// A request is pending; it is observed at the next tick.
    SwitchRequested,
    Draining,
    TearingDown,
    Initializing,
    Restoring,
    /// The new backend failed to initialize. Terminal until another request.
    Failed,
}

/// A queued switch: the backend to build and how to build it.
pub struct PendingSwitch {
    pub target: BackendKind,
    factory: BackendFactory,
}

impl fmt::Debug for PendingSwitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingSwitch")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// Outcome of a completed switch.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchReport {
    pub from: Option<BackendKind>,
    pub to: BackendInfo,
    /// Disposal requests drained before teardown.
    pub drained: usize,
    pub snapshot: SnapshotReport,
    pub restore: RestoreReport,
}

struct Shared {
    state: SwitchState,
    /// `Running` or `Failed`: where a withdrawn request returns to.
    idle: SwitchState,
    pending: Option<PendingSwitch>,
}

/// Cloneable, thread-safe handle for requesting a backend switch.
///
/// Requests are only recorded here; the owning context acts on them at its
/// next tick.
#[derive(Clone)]
pub struct SwitchHandle {
    shared: Arc<Mutex<Shared>>,
}

impl SwitchHandle {
    /// Records a request to switch to `target`, built by `factory`.
    ///
    /// A newer request replaces one that has not been observed yet.
    pub fn request<F>(&self, target: BackendKind, factory: F)
    where
        F: FnOnce() -> Result<Box<dyn GraphicsBackend>> + Send + 'static,
    {
        let mut shared = self.shared.lock();
        if let Some(old) = shared.pending.replace(PendingSwitch {
            target,
            factory: Box::new(factory),
        }) {
            log::info!("backend switch to {} superseded by {target}", old.target);
        }
        if matches!(shared.state, SwitchState::Running | SwitchState::Failed) {
            shared.state = SwitchState::SwitchRequested;
        }
        log::info!("backend switch to {target} requested");
    }

    /// Cancels a request that has not started draining yet.
    ///
    /// A request queued while another switch runs can be withdrawn too; the
    /// running switch is unaffected. Returns `true` when a request was
    /// withdrawn.
    pub fn withdraw(&self) -> bool {
        let mut shared = self.shared.lock();
        let Some(p) = shared.pending.take() else {
            return false;
        };
        log::info!("backend switch to {} withdrawn", p.target);
        if shared.state == SwitchState::SwitchRequested {
            shared.state = shared.idle;
        }
        true
    }

    pub fn state(&self) -> SwitchState {
        self.shared.lock().state
    }

    pub fn is_pending(&self) -> bool {
        self.shared.lock().pending.is_some()
    }
}

/// Mutable pieces of the context a switch operates on.
pub(crate) struct SwitchParts<'a> {
    pub backend: &'a mut Option<Box<dyn GraphicsBackend>>,
    pub generation: &'a mut u64,
    pub affinity: &'a mut ThreadAffinityGuard,
    pub disposal: &'a DeferredDisposalQueue,
    pub registry: &'a GpuResourceRegistry,
}

/// Drives a full teardown and rebuild of the graphics backend.
///
/// Running → SwitchRequested → Draining → TearingDown → Initializing →
/// Restoring → Running. Once Draining has begun the switch runs to
/// completion or to [`SwitchState::Failed`].
pub struct BackendSwitchCoordinator {
    shared: Arc<Mutex<Shared>>,
}

impl Default for BackendSwitchCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendSwitchCoordinator {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                state: SwitchState::Running,
                idle: SwitchState::Running,
                pending: None,
            })),
        }
    }

    pub fn handle(&self) -> SwitchHandle {
        SwitchHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn state(&self) -> SwitchState {
        self.shared.lock().state
    }

    fn enter(&self, state: SwitchState) {
        log::debug!("backend switch: {state:?}");
        self.shared.lock().state = state;
    }

    /// Leaves a switch in `state`, unless a request arrived while it ran.
    /// That request stays pending and withdrawable.
    fn settle(&self, state: SwitchState) -> SwitchState {
        let mut shared = self.shared.lock();
        shared.idle = state;
        shared.state = if shared.pending.is_some() {
            SwitchState::SwitchRequested
        } else {
            state
        };
        log::debug!("backend switch: {:?}", shared.state);
        shared.state
    }

    /// Takes the pending request at the safe point, moving to Draining.
    ///
    /// With batches still open the request stays pending and a usage error
    /// is returned.
    pub(crate) fn begin(&self, open_batches: usize) -> Result<Option<PendingSwitch>> {
        let mut shared = self.shared.lock();
        if shared.pending.is_none() {
            return Ok(None);
        }
        if open_batches > 0 {
            return Err(UsageError::BatchesOpen {
                open: open_batches,
                action: "backend switch",
            }
            .into());
        }
        shared.state = SwitchState::Draining;
        Ok(shared.pending.take())
    }

    /// Runs a switch that [`begin`](Self::begin) has started.
    pub(crate) fn execute(&self, pending: PendingSwitch, parts: SwitchParts<'_>) -> Result<SwitchReport> {
        let SwitchParts {
            backend,
            generation,
            affinity,
            disposal,
            registry,
        } = parts;

        let from = backend.as_ref().map(|b| b.info().kind);
        log::info!(
            "switching backend {} -> {}",
            from.map_or("none", BackendKind::name),
            pending.target
        );

        // ── draining ─────────────────────────────────────────────────────
        if let Some(b) = backend.as_deref_mut() {
            b.wait_idle();
        }
        let current_generation = *generation;
        let drained = disposal.drain_all(affinity, |request| match backend.as_deref_mut() {
            Some(b) => request.release(b, registry, current_generation),
            None => request.discard(registry),
        })?;

        // ── tearing down ─────────────────────────────────────────────────
        self.enter(SwitchState::TearingDown);
        let snapshot = match backend.as_deref_mut() {
            Some(b) => {
                let report = registry.snapshot_all(b);
                registry.detach_all(b);
                report
            }
            None => SnapshotReport::default(),
        };
        if let Some(mut old) = backend.take() {
            old.wait_idle();
            drop(old);
        }
        affinity.unbind();

        // ── initializing ─────────────────────────────────────────────────
        self.enter(SwitchState::Initializing);
        let mut next = match (pending.factory)() {
            Ok(b) => b,
            Err(err) => {
                *generation += 1;
                self.settle(SwitchState::Failed);
                // Keep the thread contract so later calls report the missing
                // backend instead of an affinity error.
                affinity.bind_current_thread()?;
                log::error!("backend {} failed to initialize: {err}", pending.target);
                return Err(match err {
                    VellumError::BackendInit(reason) => VellumError::BackendInit(reason),
                    other => VellumError::BackendInit(other.to_string()),
                });
            }
        };

        // ── restoring ────────────────────────────────────────────────────
        self.enter(SwitchState::Restoring);
        *generation += 1;
        // Restore issues GPU calls, so the new owner must be bound first.
        affinity.bind_current_thread()?;
        let restore = registry.restore_all(next.as_mut());
        let to = next.info();
        *backend = Some(next);

        if self.settle(SwitchState::Running) == SwitchState::SwitchRequested {
            log::info!("another backend switch was requested meanwhile; it runs at the next tick");
        }
        log::info!(
            "backend switch complete: now on {} ({})",
            to.kind,
            to.adapter
        );

        Ok(SwitchReport {
            from,
            to,
            drained,
            snapshot,
            restore,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HeadlessBackend, HeadlessConfig};

    fn headless_factory() -> impl FnOnce() -> Result<Box<dyn GraphicsBackend>> + Send + 'static {
        || {
            let (backend, _probe) = HeadlessBackend::new(HeadlessConfig::default());
            Ok(Box::new(backend) as Box<dyn GraphicsBackend>)
        }
    }

    #[test]
    fn request_then_withdraw_returns_to_running() {
        let coordinator = BackendSwitchCoordinator::new();
        let handle = coordinator.handle();

        handle.request(BackendKind::Headless, headless_factory());
        assert_eq!(coordinator.state(), SwitchState::SwitchRequested);
        assert!(handle.withdraw());
        assert_eq!(coordinator.state(), SwitchState::Running);
        assert!(!handle.is_pending());
        assert!(coordinator.begin(0).unwrap().is_none());
    }

    #[test]
    fn withdraw_after_draining_started_is_refused() {
        let coordinator = BackendSwitchCoordinator::new();
        let handle = coordinator.handle();
        handle.request(BackendKind::Headless, headless_factory());

        let pending = coordinator.begin(0).unwrap();
        assert!(pending.is_some());
        assert_eq!(coordinator.state(), SwitchState::Draining);
        assert!(!handle.withdraw());
    }

    #[test]
    fn open_batches_keep_request_pending() {
        let coordinator = BackendSwitchCoordinator::new();
        let handle = coordinator.handle();
        handle.request(BackendKind::Headless, headless_factory());

        let err = coordinator.begin(2).unwrap_err();
        assert!(matches!(
            err,
            VellumError::Usage(UsageError::BatchesOpen { open: 2, .. })
        ));
        assert!(handle.is_pending());
        assert_eq!(coordinator.state(), SwitchState::SwitchRequested);
    }

    #[test]
    fn newer_request_supersedes_older() {
        let coordinator = BackendSwitchCoordinator::new();
        let handle = coordinator.handle();
        handle.request(BackendKind::Vulkan, headless_factory());
        handle.request(BackendKind::Headless, headless_factory());

        let pending = coordinator.begin(0).unwrap().unwrap();
        assert_eq!(pending.target, BackendKind::Headless);
    }

    #[test]
    fn handle_is_usable_from_other_threads() {
        let coordinator = BackendSwitchCoordinator::new();
        let handle = coordinator.handle();
        std::thread::spawn(move || handle.request(BackendKind::Headless, headless_factory()))
            .join()
            .unwrap();
        assert_eq!(coordinator.state(), SwitchState::SwitchRequested);
    }
}
