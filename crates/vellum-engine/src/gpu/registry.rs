use parking_lot::Mutex;
use slotmap::{SlotMap, new_key_type};

use crate::backend::{FilterMode, GpuTextureId, GraphicsBackend, TextureDesc};
use crate::error::{Result, UsageError};

new_key_type! {
    /// Stable, backend-independent handle of a tracked GPU resource.
    ///
    /// Survives backend switches; the GPU object behind it does not.
    pub struct ResourceHandle;
}

/// What a registry entry represents.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ResourceKind {
    Texture,
    RenderTarget,
}

/// Lifecycle state of a registry entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ResourceStatus {
    /// Backed by a GPU object on the current backend.
    Live,
    /// Content cached in CPU memory, waiting for a restore.
    Snapshotted,
    /// Read-back or re-creation failed during a switch; the content is gone.
    Lost,
    /// Neither a GPU object nor a snapshot exists (created inside a switch window).
    Unresolved,
    /// Explicitly released; removed by the next prune.
    Released,
}

/// Public view of one entry.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ResourceInfo {
    pub kind: ResourceKind,
    pub desc: TextureDesc,
    pub status: ResourceStatus,
}

/// Outcome of [`GpuResourceRegistry::snapshot_all`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SnapshotReport {
    pub saved: usize,
    pub failed: Vec<ResourceHandle>,
}

/// Outcome of [`GpuResourceRegistry::restore_all`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RestoreReport {
    pub restored: usize,
    /// Entries whose content could not be carried across the switch.
    pub lost: Vec<ResourceHandle>,
    /// Entries without GPU object or snapshot; a configuration error.
    pub unresolved: Vec<ResourceHandle>,
}

struct Entry {
    kind: ResourceKind,
    desc: TextureDesc,
    gpu: Option<GpuTextureId>,
    snapshot: Option<Vec<u8>>,
    status: ResourceStatus,
}

/// Arena of every texture and render target the context owns.
///
/// Each resource gets a [`ResourceHandle`] at creation. Liveness is decided
/// by explicit release only; released entries stay as tombstones (so stale
/// handles report "released" rather than "unknown") until [`prune`](Self::prune)
/// sweeps them.
///
/// The table sits behind a mutex; GPU calls made while iterating happen on
/// the affinity thread, which the owning context enforces.
#[derive(Default)]
pub struct GpuResourceRegistry {
    entries: Mutex<SlotMap<ResourceHandle, Entry>>,
}

impl GpuResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a freshly created GPU resource.
    pub fn track(&self, kind: ResourceKind, desc: TextureDesc, gpu: GpuTextureId) -> ResourceHandle {
        self.entries.lock().insert(Entry {
            kind,
            desc,
            gpu: Some(gpu),
            snapshot: None,
            status: ResourceStatus::Live,
        })
    }

    pub fn info(&self, handle: ResourceHandle) -> Result<ResourceInfo> {
        let entries = self.entries.lock();
        let e = entries
            .get(handle)
            .ok_or(UsageError::UnknownResource(handle))?;
        Ok(ResourceInfo {
            kind: e.kind,
            desc: e.desc,
            status: e.status,
        })
    }

    /// Returns the current GPU object and description of a usable resource.
    pub fn resolve(&self, handle: ResourceHandle) -> Result<(GpuTextureId, TextureDesc)> {
        let entries = self.entries.lock();
        let e = entries
            .get(handle)
            .ok_or(UsageError::UnknownResource(handle))?;
        match (e.status, e.gpu) {
            (ResourceStatus::Live, Some(id)) => Ok((id, e.desc)),
            (ResourceStatus::Released, _) => Err(UsageError::ResourceReleased(handle).into()),
            _ => Err(UsageError::UnresolvedResource(handle).into()),
        }
    }

    pub fn set_filter(&self, handle: ResourceHandle, filter: FilterMode) -> Result<()> {
        let mut entries = self.entries.lock();
        let e = entries
            .get_mut(handle)
            .ok_or(UsageError::UnknownResource(handle))?;
        if e.status == ResourceStatus::Released {
            return Err(UsageError::ResourceReleased(handle).into());
        }
        e.desc.filter = filter;
        Ok(())
    }

    /// Destroys the GPU object and leaves a tombstone.
    pub fn release(&self, handle: ResourceHandle, backend: &mut dyn GraphicsBackend) -> Result<()> {
        let mut entries = self.entries.lock();
        let e = entries
            .get_mut(handle)
            .ok_or(UsageError::UnknownResource(handle))?;
        if e.status == ResourceStatus::Released {
            return Err(UsageError::ResourceReleased(handle).into());
        }
        if let Some(id) = e.gpu.take() {
            backend.destroy_texture(id);
        }
        e.snapshot = None;
        e.status = ResourceStatus::Released;
        Ok(())
    }

    /// Tombstones an entry while no backend is active.
    ///
    /// Only valid after [`detach_all`](Self::detach_all): there is no GPU
    /// object left to destroy, just the snapshot to drop.
    pub fn release_detached(&self, handle: ResourceHandle) -> Result<()> {
        let mut entries = self.entries.lock();
        let e = entries
            .get_mut(handle)
            .ok_or(UsageError::UnknownResource(handle))?;
        if e.status == ResourceStatus::Released {
            return Err(UsageError::ResourceReleased(handle).into());
        }
        if let Some(id) = e.gpu.take() {
            log::warn!("{handle:?} released without a backend; GPU object {id:?} abandoned");
        }
        e.snapshot = None;
        e.status = ResourceStatus::Released;
        Ok(())
    }

    /// Removes tombstones. Bookkeeping only; returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.status != ResourceStatus::Released);
        let removed = before - entries.len();
        if removed > 0 {
            log::debug!("pruned {removed} released resource(s)");
        }
        removed
    }

    /// Number of entries, tombstones included.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count(&self, status: ResourceStatus) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|e| e.status == status)
            .count()
    }

    /// Downloads the content of every live resource into CPU memory.
    ///
    /// Best effort: a resource that cannot be read back is marked
    /// [`ResourceStatus::Lost`], logged, and skipped.
    pub fn snapshot_all(&self, backend: &mut dyn GraphicsBackend) -> SnapshotReport {
        let mut report = SnapshotReport::default();
        let mut entries = self.entries.lock();

        for (handle, e) in entries.iter_mut() {
            if e.status != ResourceStatus::Live {
                continue;
            }
            let Some(id) = e.gpu else { continue };

            match backend.read_texture(id) {
                Ok(pixels) => {
                    e.snapshot = Some(pixels);
                    e.status = ResourceStatus::Snapshotted;
                    report.saved += 1;
                }
                Err(err) => {
                    log::warn!("snapshot of {handle:?} failed, content will be lost: {err}");
                    e.status = ResourceStatus::Lost;
                    report.failed.push(handle);
                }
            }
        }

        log::info!(
            "snapshot: {} saved, {} failed",
            report.saved,
            report.failed.len()
        );
        report
    }

    /// Destroys every GPU object still attached, keeping snapshots.
    pub fn detach_all(&self, backend: &mut dyn GraphicsBackend) {
        let mut entries = self.entries.lock();
        for e in entries.values_mut() {
            if let Some(id) = e.gpu.take() {
                backend.destroy_texture(id);
            }
        }
    }

    /// Recreates every snapshotted resource on `backend`, uploads its cached
    /// content, and drops the cache.
    ///
    /// GPU ids still attached at this point are treated as belonging to the
    /// previous backend and are overwritten.
    pub fn restore_all(&self, backend: &mut dyn GraphicsBackend) -> RestoreReport {
        let mut report = RestoreReport::default();
        let mut entries = self.entries.lock();

        for (handle, e) in entries.iter_mut() {
            match e.status {
                ResourceStatus::Released => continue,
                ResourceStatus::Lost => {
                    report.lost.push(handle);
                    continue;
                }
                ResourceStatus::Unresolved | ResourceStatus::Live => {
                    log::error!(
                        "{handle:?} has no snapshot to restore from; leaving it unresolved"
                    );
                    e.gpu = None;
                    e.status = ResourceStatus::Unresolved;
                    report.unresolved.push(handle);
                    continue;
                }
                ResourceStatus::Snapshotted => {}
            }

            if let Some(stale) = e.gpu.take() {
                log::debug!("{handle:?}: dropping stale GPU id {stale:?}");
            }

            let Some(pixels) = e.snapshot.take() else {
                e.status = ResourceStatus::Unresolved;
                report.unresolved.push(handle);
                continue;
            };

            match backend.create_texture(&e.desc, Some(&pixels)) {
                Ok(id) => {
                    e.gpu = Some(id);
                    e.status = ResourceStatus::Live;
                    report.restored += 1;
                }
                Err(err) => {
                    log::warn!("restore of {handle:?} failed, content lost: {err}");
                    e.status = ResourceStatus::Lost;
                    report.lost.push(handle);
                }
            }
        }

        log::info!(
            "restore: {} restored, {} lost, {} unresolved",
            report.restored,
            report.lost.len(),
            report.unresolved.len()
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HeadlessBackend, HeadlessConfig};
    use crate::error::VellumError;

    fn desc(width: u32, height: u32) -> TextureDesc {
        TextureDesc {
            width,
            height,
            filter: FilterMode::Pixelated,
            mipmaps: true,
            render_target: false,
        }
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    fn create(
        registry: &GpuResourceRegistry,
        backend: &mut HeadlessBackend,
        d: TextureDesc,
        seed: u8,
    ) -> ResourceHandle {
        let id = backend.create_texture(&d, Some(&pattern(d.rgba_len(), seed))).unwrap();
        registry.track(ResourceKind::Texture, d, id)
    }

    // ── release / prune ───────────────────────────────────────────────────

    #[test]
    fn release_leaves_tombstone_until_prune() {
        let registry = GpuResourceRegistry::new();
        let (mut backend, probe) = HeadlessBackend::new(HeadlessConfig::default());
        let h = create(&registry, &mut backend, desc(2, 2), 0);

        registry.release(h, &mut backend).unwrap();
        assert_eq!(probe.live_textures(), 0);
        assert!(matches!(
            registry.resolve(h),
            Err(VellumError::Usage(UsageError::ResourceReleased(_)))
        ));

        assert_eq!(registry.prune(), 1);
        assert!(matches!(
            registry.resolve(h),
            Err(VellumError::Usage(UsageError::UnknownResource(_)))
        ));
        assert_eq!(registry.prune(), 0);
    }

    #[test]
    fn double_release_is_usage_error() {
        let registry = GpuResourceRegistry::new();
        let (mut backend, _probe) = HeadlessBackend::new(HeadlessConfig::default());
        let h = create(&registry, &mut backend, desc(1, 1), 0);

        registry.release(h, &mut backend).unwrap();
        assert!(registry.release(h, &mut backend).is_err());
    }

    #[test]
    fn detached_release_drops_snapshot() {
        let registry = GpuResourceRegistry::new();
        let (mut backend, _probe) = HeadlessBackend::new(HeadlessConfig::default());
        let h = create(&registry, &mut backend, desc(2, 2), 0);
        registry.snapshot_all(&mut backend);
        registry.detach_all(&mut backend);

        registry.release_detached(h).unwrap();
        assert_eq!(registry.count(ResourceStatus::Released), 1);
        assert_eq!(registry.restore_all(&mut backend).restored, 0);
    }

    // ── snapshot / restore ────────────────────────────────────────────────

    #[test]
    fn snapshot_then_restore_is_pixel_identical() {
        let registry = GpuResourceRegistry::new();
        let (mut old, _) = HeadlessBackend::new(HeadlessConfig::default());
        let a = create(&registry, &mut old, desc(4, 3), 1);
        let b = create(&registry, &mut old, desc(1, 7), 2);

        let snap = registry.snapshot_all(&mut old);
        assert_eq!(snap.saved, 2);
        assert!(snap.failed.is_empty());
        registry.detach_all(&mut old);
        drop(old);

        let (mut new, probe) = HeadlessBackend::new(HeadlessConfig::default());
        let report = registry.restore_all(&mut new);
        assert_eq!(report.restored, 2);
        assert!(report.lost.is_empty() && report.unresolved.is_empty());

        for (h, d, seed) in [(a, desc(4, 3), 1), (b, desc(1, 7), 2)] {
            let (id, restored_desc) = registry.resolve(h).unwrap();
            assert_eq!(restored_desc, d);
            assert_eq!(probe.texture_pixels(id).unwrap(), pattern(d.rgba_len(), seed));
            assert_eq!(probe.texture_desc(id).unwrap(), d);
        }
    }

    #[test]
    fn failed_read_back_is_skipped_and_flagged() {
        let registry = GpuResourceRegistry::new();
        let (mut old, old_probe) = HeadlessBackend::new(HeadlessConfig::default());
        let good = create(&registry, &mut old, desc(2, 2), 3);
        let bad = create(&registry, &mut old, desc(2, 2), 4);
        old_probe.fail_reads_of(registry.resolve(bad).unwrap().0);

        let snap = registry.snapshot_all(&mut old);
        assert_eq!(snap.saved, 1);
        assert_eq!(snap.failed, vec![bad]);
        registry.detach_all(&mut old);

        let (mut new, _) = HeadlessBackend::new(HeadlessConfig::default());
        let report = registry.restore_all(&mut new);
        assert_eq!(report.restored, 1);
        assert_eq!(report.lost, vec![bad]);
        assert!(registry.resolve(good).is_ok());
        assert_eq!(registry.info(bad).unwrap().status, ResourceStatus::Lost);
    }

    #[test]
    fn failed_recreation_is_absorbed() {
        let registry = GpuResourceRegistry::new();
        let (mut old, _) = HeadlessBackend::new(HeadlessConfig::default());
        let a = create(&registry, &mut old, desc(2, 2), 5);
        let b = create(&registry, &mut old, desc(2, 2), 6);
        registry.snapshot_all(&mut old);
        registry.detach_all(&mut old);

        let (mut new, probe) = HeadlessBackend::new(HeadlessConfig::default());
        probe.fail_next_creations(1);
        let report = registry.restore_all(&mut new);

        assert_eq!(report.restored, 1);
        assert_eq!(report.lost.len(), 1);
        assert!(registry.resolve(a).is_ok() ^ registry.resolve(b).is_ok());
    }

    #[test]
    fn entry_tracked_after_snapshot_is_unresolved() {
        let registry = GpuResourceRegistry::new();
        let (mut old, _) = HeadlessBackend::new(HeadlessConfig::default());
        registry.snapshot_all(&mut old);
        registry.detach_all(&mut old);

        // Tracked inside the switch window: live, but never snapshotted.
        let late = create(&registry, &mut old, desc(8, 8), 9);
        assert_eq!(registry.info(late).unwrap().status, ResourceStatus::Live);

        let (mut new, probe) = HeadlessBackend::new(HeadlessConfig::default());
        let report = registry.restore_all(&mut new);
        assert_eq!(report.unresolved, vec![late]);
        assert_eq!(probe.live_textures(), 0);
        assert!(matches!(
            registry.resolve(late),
            Err(VellumError::Usage(UsageError::UnresolvedResource(_)))
        ));
    }

    #[test]
    fn released_entries_are_not_snapshotted() {
        let registry = GpuResourceRegistry::new();
        let (mut backend, _) = HeadlessBackend::new(HeadlessConfig::default());
        let h = create(&registry, &mut backend, desc(1, 1), 0);
        registry.release(h, &mut backend).unwrap();

        assert_eq!(registry.snapshot_all(&mut backend).saved, 0);
        assert_eq!(registry.restore_all(&mut backend), RestoreReport::default());
    }

    #[test]
    fn filter_change_survives_restore() {
        let registry = GpuResourceRegistry::new();
        let (mut old, _) = HeadlessBackend::new(HeadlessConfig::default());
        let h = create(&registry, &mut old, desc(1, 1), 0);
        registry.set_filter(h, FilterMode::Smooth).unwrap();

        registry.snapshot_all(&mut old);
        registry.detach_all(&mut old);
        let (mut new, _) = HeadlessBackend::new(HeadlessConfig::default());
        registry.restore_all(&mut new);

        assert_eq!(registry.resolve(h).unwrap().1.filter, FilterMode::Smooth);
    }
}
