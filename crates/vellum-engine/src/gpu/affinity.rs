use std::thread::{self, ThreadId};

use crate::error::{Result, UsageError, VellumError};

/// Records the one thread allowed to issue GPU calls.
///
/// Bound once per backend lifetime. A backend switch unbinds the guard during
/// teardown and binds it again once the new backend is up.
#[derive(Debug, Default)]
pub struct ThreadAffinityGuard {
    owner: Option<ThreadId>,
}

impl ThreadAffinityGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the calling thread as the sole owner of the GPU context.
    pub fn bind_current_thread(&mut self) -> Result<()> {
        if self.owner.is_some() {
            return Err(UsageError::AffinityAlreadyBound.into());
        }
        let id = thread::current().id();
        log::debug!("GPU affinity bound to {id:?}");
        self.owner = Some(id);
        Ok(())
    }

    pub(crate) fn unbind(&mut self) {
        self.owner = None;
    }

    /// Fails unless the calling thread is the bound thread.
    #[inline]
    pub fn check_thread(&self) -> Result<()> {
        let current = thread::current().id();
        match self.owner {
            Some(owner) if owner == current => Ok(()),
            bound => Err(VellumError::ThreadAffinity { bound, current }),
        }
    }

    pub fn owner(&self) -> Option<ThreadId> {
        self.owner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bound_thread_passes() {
        let mut guard = ThreadAffinityGuard::new();
        guard.bind_current_thread().unwrap();
        assert!(guard.check_thread().is_ok());
    }

    #[test]
    fn unbound_guard_rejects_everyone() {
        let guard = ThreadAffinityGuard::new();
        assert!(matches!(
            guard.check_thread(),
            Err(VellumError::ThreadAffinity { bound: None, .. })
        ));
    }

    #[test]
    fn other_thread_is_rejected() {
        let mut guard = ThreadAffinityGuard::new();
        guard.bind_current_thread().unwrap();
        let owner = guard.owner();

        let result = thread::spawn(move || guard.check_thread()).join().unwrap();
        match result {
            Err(VellumError::ThreadAffinity { bound, current }) => {
                assert_eq!(bound, owner);
                assert_ne!(Some(current), owner);
            }
            other => panic!("expected affinity error, got {other:?}"),
        }
    }

    #[test]
    fn double_bind_is_usage_error() {
        let mut guard = ThreadAffinityGuard::new();
        guard.bind_current_thread().unwrap();
        assert!(matches!(
            guard.bind_current_thread(),
            Err(VellumError::Usage(UsageError::AffinityAlreadyBound))
        ));

        guard.unbind();
        assert!(guard.bind_current_thread().is_ok());
    }
}
