use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::backend::{BackendInfo, FilterMode, GpuTextureId, GraphicsBackend, Screenshot, TextureDesc};
use crate::batch::{OpenBatches, Renderer};
use crate::coords::Region;
use crate::error::{Result, UsageError, VellumError};
use crate::paint::Color;
use crate::time::Cadence;

use super::affinity::ThreadAffinityGuard;
use super::disposal::{DeferredDisposalQueue, DisposalRequest, DisposalSender};
use super::registry::{GpuResourceRegistry, ResourceHandle, ResourceKind};
use super::switch::{BackendSwitchCoordinator, SwitchHandle, SwitchParts, SwitchReport, SwitchState};

/// Set while a [`GpuContext`] is alive.
static CONTEXT_ALIVE: AtomicBool = AtomicBool::new(false);

/// Context tuning.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// How often released registry entries are swept.
    pub prune_interval: Duration,
    /// Quads per quad-batch flush.
    pub quad_capacity: usize,
    /// Lines per line-batch flush (two vertices each).
    pub line_capacity: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            prune_interval: Duration::from_secs(5),
            quad_capacity: 512,
            line_capacity: 64,
        }
    }
}

/// What one [`GpuContext::tick`] did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickReport {
    pub switch: Option<SwitchReport>,
    pub disposed: usize,
    /// Set when the prune cadence fired.
    pub pruned: Option<usize>,
}

/// The GPU context: active backend plus everything that must stay consistent
/// with it.
///
/// One instance per process. Constructing it binds the calling thread as the
/// affinity thread; every GPU-touching method checks that thread first.
pub struct GpuContext {
    backend: Option<Box<dyn GraphicsBackend>>,
    /// Bumped whenever the backend is replaced. Backend-local ids from an
    /// older generation are stale.
    generation: u64,
    affinity: ThreadAffinityGuard,
    disposal: DeferredDisposalQueue,
    registry: GpuResourceRegistry,
    switch: BackendSwitchCoordinator,
    prune: Cadence,
    open_batches: OpenBatches,
    bound_target: Option<ResourceHandle>,
    /// Applies to primitives buffered from now on.
    scissor: Option<Region>,
    screenshot_requested: bool,
    screenshot: Option<Screenshot>,
    config: ContextConfig,
}

impl GpuContext {
    /// Creates the context around an initialized backend.
    ///
    /// Fails with [`UsageError::ContextAlreadyExists`] while another context
    /// is alive.
    pub fn new(backend: Box<dyn GraphicsBackend>, config: ContextConfig) -> Result<Self> {
        if CONTEXT_ALIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(UsageError::ContextAlreadyExists.into());
        }

        let mut affinity = ThreadAffinityGuard::new();
        if let Err(e) = affinity.bind_current_thread() {
            CONTEXT_ALIVE.store(false, Ordering::Release);
            return Err(e);
        }

        let info = backend.info();
        log::info!(
            "GPU context on {} (adapter: {}, driver: {}, texture units: {})",
            info.kind,
            info.adapter,
            info.driver,
            backend.max_texture_units()
        );

        Ok(Self {
            backend: Some(backend),
            generation: 0,
            affinity,
            disposal: DeferredDisposalQueue::new(),
            registry: GpuResourceRegistry::new(),
            switch: BackendSwitchCoordinator::new(),
            prune: Cadence::new(config.prune_interval),
            open_batches: OpenBatches::default(),
            bound_target: None,
            scissor: None,
            screenshot_requested: false,
            screenshot: None,
            config,
        })
    }

    #[inline]
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn registry(&self) -> &GpuResourceRegistry {
        &self.registry
    }

    #[inline]
    pub fn check_thread(&self) -> Result<()> {
        self.affinity.check_thread()
    }

    pub fn switch_handle(&self) -> SwitchHandle {
        self.switch.handle()
    }

    pub fn switch_state(&self) -> SwitchState {
        self.switch.state()
    }

    /// Number of batches currently between `begin` and `end`.
    pub fn open_batches(&self) -> usize {
        self.open_batches.get()
    }

    /// Returns the active backend, after the affinity check.
    pub(crate) fn backend_mut(&mut self) -> Result<&mut dyn GraphicsBackend> {
        self.affinity.check_thread()?;
        match self.backend.as_deref_mut() {
            Some(backend) => Ok(backend),
            None => Err(VellumError::BackendUnavailable),
        }
    }

    pub fn backend_info(&self) -> Result<BackendInfo> {
        self.affinity.check_thread()?;
        self.backend
            .as_ref()
            .map(|b| b.info())
            .ok_or(VellumError::BackendUnavailable)
    }

    /// Texture units the active backend can sample in one draw.
    pub fn max_texture_units(&self) -> Result<u32> {
        self.affinity.check_thread()?;
        self.backend
            .as_ref()
            .map(|b| b.max_texture_units())
            .ok_or(VellumError::BackendUnavailable)
    }

    /// Builds a quad batch and a line batch sized from [`ContextConfig`].
    pub fn create_renderer(&mut self) -> Result<Renderer> {
        Renderer::new(self)
    }

    // ── frame ────────────────────────────────────────────────────────────

    /// Safe point at the start of an update tick.
    ///
    /// Runs a pending backend switch, drains deferred disposals, and prunes
    /// the registry when the prune interval has elapsed.
    pub fn tick(&mut self, dt: Duration) -> Result<TickReport> {
        self.affinity.check_thread()?;

        let switch = self.run_pending_switch()?;
        let disposed = self.drain_disposals()?;
        let pruned = self.prune.tick(dt).then(|| self.registry.prune());

        Ok(TickReport {
            switch,
            disposed,
            pruned,
        })
    }

    /// Performs every queued deferred release now.
    pub fn drain_disposals(&mut self) -> Result<usize> {
        let generation = self.generation;
        let Self {
            backend,
            affinity,
            disposal,
            registry,
            bound_target,
            ..
        } = self;

        disposal.drain_all(affinity, |request| {
            if let DisposalRequest::ReleaseResource(h) = request {
                if *bound_target == Some(h) {
                    *bound_target = None;
                }
            }
            match backend.as_deref_mut() {
                Some(b) => request.release(b, registry, generation),
                None => request.discard(registry),
            }
        })
    }

    fn run_pending_switch(&mut self) -> Result<Option<SwitchReport>> {
        let Some(pending) = self.switch.begin(self.open_batches.get())? else {
            return Ok(None);
        };

        self.bound_target = None;
        let parts = SwitchParts {
            backend: &mut self.backend,
            generation: &mut self.generation,
            affinity: &mut self.affinity,
            disposal: &self.disposal,
            registry: &self.registry,
        };
        self.switch
            .execute(pending, parts)
            .map(Some)
    }

    pub fn clear(&mut self, color: Color) -> Result<()> {
        self.backend_mut()?.clear(color)
    }

    /// Starts a frame with the scissor lifted.
    pub fn begin_scene(&mut self) -> Result<()> {
        self.scissor = None;
        self.backend_mut()?.begin_scene()
    }

    /// Ends the scene. All batches must be closed so nothing is left unflushed.
    pub fn end_scene(&mut self) -> Result<()> {
        self.affinity.check_thread()?;
        self.require_no_open_batches("end_scene")?;
        self.backend_mut()?.end_scene()
    }

    /// Shows the frame, capturing it first when a screenshot was requested.
    ///
    /// A failed capture is logged and does not stop the present.
    pub fn present(&mut self) -> Result<()> {
        if self.screenshot_requested {
            let shot = self.backend_mut()?.read_frame();
            self.screenshot_requested = false;
            match shot {
                Ok(shot) => {
                    log::info!("screenshot taken ({}x{})", shot.width, shot.height);
                    self.screenshot = Some(shot);
                }
                Err(e) => log::warn!("screenshot failed: {e}"),
            }
        }
        self.backend_mut()?.present()
    }

    /// Captures the next presented frame. Collect it with
    /// [`take_screenshot`](Self::take_screenshot) once `present` has run.
    pub fn request_screenshot(&mut self) {
        self.screenshot_requested = true;
    }

    /// The last captured frame, if any. Each capture is returned once.
    pub fn take_screenshot(&mut self) -> Option<Screenshot> {
        self.screenshot.take()
    }

    /// Clips later primitives to `scissor`, in pixels of the bound target.
    /// `None` lifts the clip; `begin_scene` does so too.
    ///
    /// Open batches flush what they buffered under the previous scissor
    /// before taking the next primitive.
    pub fn set_scissor(&mut self, scissor: Option<Region>) -> Result<()> {
        self.affinity.check_thread()?;
        self.scissor = scissor;
        Ok(())
    }

    #[inline]
    pub fn scissor(&self) -> Option<Region> {
        self.scissor
    }

    /// Forwards a framebuffer resize to the backend.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        log::debug!("framebuffer resized to {width}x{height}");
        self.backend_mut()?.resize(width, height);
        Ok(())
    }

    /// Best-effort GPU memory in use; 0 when the backend cannot tell.
    pub fn vram_usage(&self) -> Result<u64> {
        self.affinity.check_thread()?;
        Ok(self.backend.as_ref().map_or(0, |b| b.vram_usage()))
    }

    /// Best-effort total GPU memory; 0 when the backend cannot tell.
    pub fn total_vram(&self) -> Result<u64> {
        self.affinity.check_thread()?;
        Ok(self.backend.as_ref().map_or(0, |b| b.total_vram()))
    }

    // ── resources (crate) ────────────────────────────────────────────────

    pub(crate) fn disposal_sender(&self) -> DisposalSender {
        self.disposal.sender()
    }

    pub(crate) fn create_resource(
        &mut self,
        kind: ResourceKind,
        desc: TextureDesc,
        pixels: Option<&[u8]>,
    ) -> Result<ResourceHandle> {
        self.affinity.check_thread()?;
        if desc.width == 0 || desc.height == 0 {
            return Err(UsageError::ZeroSizedTexture {
                width: desc.width,
                height: desc.height,
            }
            .into());
        }
        if let Some(p) = pixels {
            check_pixel_len(desc.rgba_len(), p.len())?;
        }

        let id = self.backend_mut()?.create_texture(&desc, pixels)?;
        let handle = self.registry.track(kind, desc, id);
        log::debug!("created {kind:?} {handle:?} ({}x{})", desc.width, desc.height);
        Ok(handle)
    }

    pub(crate) fn resolve(&self, handle: ResourceHandle) -> Result<(GpuTextureId, TextureDesc)> {
        self.affinity.check_thread()?;
        self.registry.resolve(handle)
    }

    pub(crate) fn write_resource(
        &mut self,
        handle: ResourceHandle,
        region: Region,
        pixels: &[u8],
    ) -> Result<()> {
        let (id, desc) = self.resolve(handle)?;
        if !region.fits_within(desc.width, desc.height) {
            return Err(UsageError::RegionOutOfBounds {
                x: region.x,
                y: region.y,
                width: region.width,
                height: region.height,
                tex_width: desc.width,
                tex_height: desc.height,
            }
            .into());
        }
        check_pixel_len(region.rgba_len(), pixels.len())?;
        if region.is_empty() {
            return Ok(());
        }
        self.backend_mut()?.write_texture(id, region, pixels)
    }

    pub(crate) fn read_resource(&mut self, handle: ResourceHandle) -> Result<Vec<u8>> {
        let (id, _) = self.resolve(handle)?;
        self.backend_mut()?.read_texture(id)
    }

    pub(crate) fn set_resource_filter(
        &mut self,
        handle: ResourceHandle,
        filter: FilterMode,
    ) -> Result<()> {
        let (id, _) = self.resolve(handle)?;
        self.registry.set_filter(handle, filter)?;
        self.backend_mut()?.set_texture_filter(id, filter);
        Ok(())
    }

    pub(crate) fn release_resource(&mut self, handle: ResourceHandle) -> Result<()> {
        self.affinity.check_thread()?;
        if self.bound_target == Some(handle) {
            self.bound_target = None;
        }
        match self.backend.as_deref_mut() {
            Some(b) => self.registry.release(handle, b),
            None => self.registry.release_detached(handle),
        }
    }

    /// Redirects drawing to a render target, or back to the frame.
    pub(crate) fn bind_target(&mut self, target: Option<ResourceHandle>) -> Result<()> {
        self.affinity.check_thread()?;
        self.require_no_open_batches("render target change")?;

        let id = match target {
            Some(h) => {
                if self.registry.info(h)?.kind != ResourceKind::RenderTarget {
                    return Err(UsageError::NotARenderTarget(h).into());
                }
                Some(self.registry.resolve(h)?.0)
            }
            None => None,
        };
        self.backend_mut()?.set_render_target(id)?;
        self.bound_target = target;
        Ok(())
    }

    pub fn bound_target(&self) -> Option<ResourceHandle> {
        self.bound_target
    }

    // ── batches (crate) ──────────────────────────────────────────────────

    pub(crate) fn open_batch_counter(&self) -> OpenBatches {
        self.open_batches.clone()
    }

    fn require_no_open_batches(&self, action: &'static str) -> Result<()> {
        let open = self.open_batches.get();
        if open > 0 {
            return Err(UsageError::BatchesOpen { open, action }.into());
        }
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        if self.affinity.check_thread().is_ok() {
            if let Err(e) = self.drain_disposals() {
                log::warn!("final disposal drain failed: {e}");
            }
            if let Some(b) = self.backend.as_deref_mut() {
                b.wait_idle();
            }
        } else {
            log::warn!("GPU context dropped off its affinity thread; pending disposals discarded");
        }
        log::debug!("GPU context destroyed");
        CONTEXT_ALIVE.store(false, Ordering::Release);
    }
}

fn check_pixel_len(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(UsageError::PixelLengthMismatch { expected, actual }.into());
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use parking_lot::Mutex;

    use super::testing::{Fixture, fixture, fixture_with, lock};
    use super::*;
    use crate::backend::{BackendKind, HeadlessBackend, HeadlessConfig, HeadlessProbe};
    use crate::gpu::registry::ResourceStatus;
    use crate::gpu::{RenderTarget, Texture, TextureParams, TextureSource};

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed)).collect()
    }

    /// Queues a switch to a fresh headless backend; the new probe lands in `slot`.
    fn request_headless(ctx: &GpuContext, slot: &Arc<Mutex<Option<HeadlessProbe>>>) {
        let slot = Arc::clone(slot);
        ctx.switch_handle().request(BackendKind::Headless, move || {
            let (backend, probe) = HeadlessBackend::new(HeadlessConfig::default());
            *slot.lock() = Some(probe);
            Ok(Box::new(backend) as Box<dyn GraphicsBackend>)
        });
    }

    // ── construction ─────────────────────────────────────────────────────

    #[test]
    fn second_context_is_rejected() {
        let mut f = fixture();
        let (backend, _) = HeadlessBackend::new(HeadlessConfig::default());
        let err = GpuContext::new(Box::new(backend), ContextConfig::default()).err();
        assert!(matches!(
            err,
            Some(VellumError::Usage(UsageError::ContextAlreadyExists))
        ));
        // The first context is unaffected.
        assert!(f.ctx.clear(Color::BLACK).is_ok());
    }

    #[test]
    fn context_can_be_recreated_after_drop() {
        let _guard = lock();
        for _ in 0..2 {
            let (backend, _) = HeadlessBackend::new(HeadlessConfig::default());
            let ctx = GpuContext::new(Box::new(backend), ContextConfig::default()).unwrap();
            drop(ctx);
        }
    }

    #[test]
    fn gpu_calls_from_other_thread_fail() {
        let f = fixture();
        let Fixture { ctx, .. } = f;
        let ctx = Arc::new(Mutex::new(ctx));

        let remote = Arc::clone(&ctx);
        let result = thread::spawn(move || remote.lock().clear(Color::WHITE))
            .join()
            .unwrap();
        assert!(matches!(result, Err(VellumError::ThreadAffinity { .. })));
        assert!(ctx.lock().clear(Color::WHITE).is_ok());
    }

    // ── frame ────────────────────────────────────────────────────────────

    #[test]
    fn frame_calls_reach_backend_in_order() {
        let mut f = fixture();
        f.ctx.begin_scene().unwrap();
        f.ctx.clear(Color::CORNFLOWER_BLUE).unwrap();
        f.ctx.end_scene().unwrap();
        f.ctx.present().unwrap();
        f.ctx.resize(640, 480).unwrap();

        use crate::backend::HeadlessEvent as E;
        assert_eq!(
            f.probe.events(),
            vec![
                E::BeginScene,
                E::Clear {
                    target: None,
                    color: Color::CORNFLOWER_BLUE
                },
                E::EndScene,
                E::Present,
                E::Resize {
                    width: 640,
                    height: 480
                },
            ]
        );
        assert_eq!(f.probe.framebuffer_size(), (640, 480));
    }

    #[test]
    fn vram_is_reported_by_backend() {
        let mut f = fixture();
        let before = f.ctx.vram_usage().unwrap();
        let tex = Texture::empty(&mut f.ctx, 4, 4, TextureParams::default()).unwrap();
        assert_eq!(f.ctx.vram_usage().unwrap(), before + 64);
        assert_eq!(f.ctx.total_vram().unwrap(), 0);
        tex.dispose(&mut f.ctx).unwrap();
    }

    #[test]
    fn begin_scene_lifts_the_scissor() {
        let mut f = fixture();
        f.ctx.set_scissor(Some(Region::new(1, 1, 4, 4))).unwrap();
        assert_eq!(f.ctx.scissor(), Some(Region::new(1, 1, 4, 4)));
        f.ctx.begin_scene().unwrap();
        assert_eq!(f.ctx.scissor(), None);
    }

    #[test]
    fn requested_screenshot_is_captured_at_present() {
        let mut f = fixture_with(
            HeadlessConfig {
                width: 2,
                height: 2,
                ..HeadlessConfig::default()
            },
            ContextConfig::default(),
        );
        f.ctx.begin_scene().unwrap();
        f.ctx.clear(Color::RED).unwrap();
        f.ctx.end_scene().unwrap();
        f.ctx.present().unwrap();
        assert_eq!(f.ctx.take_screenshot(), None);

        f.ctx.request_screenshot();
        f.ctx.begin_scene().unwrap();
        f.ctx.clear(Color::BLUE).unwrap();
        f.ctx.end_scene().unwrap();
        assert_eq!(f.ctx.take_screenshot(), None);
        f.ctx.present().unwrap();

        let shot = f.ctx.take_screenshot().unwrap();
        assert_eq!((shot.width, shot.height), (2, 2));
        assert_eq!(shot.pixels, Color::BLUE.to_rgba8().repeat(4));
        assert_eq!(f.ctx.take_screenshot(), None);
    }

    #[test]
    fn failed_screenshot_still_presents() {
        let mut f = fixture();
        f.probe.fail_frame_reads();
        f.ctx.request_screenshot();
        f.ctx.begin_scene().unwrap();
        f.ctx.end_scene().unwrap();
        f.ctx.present().unwrap();

        assert_eq!(f.ctx.take_screenshot(), None);
        assert_eq!(f.probe.events().last(), Some(&crate::backend::HeadlessEvent::Present));

        // The request is consumed by the failed attempt.
        f.probe.clear_events();
        f.ctx.present().unwrap();
        assert_eq!(f.probe.events(), vec![crate::backend::HeadlessEvent::Present]);
    }

    // ── tick: disposal + prune ───────────────────────────────────────────

    #[test]
    fn dropped_textures_release_on_next_tick() {
        let mut f = fixture();
        let textures: Vec<_> = (0..8)
            .map(|_| Texture::white_pixel(&mut f.ctx).unwrap())
            .collect();
        assert_eq!(f.probe.live_textures(), 8);

        let workers: Vec<_> = textures
            .into_iter()
            .map(|t| thread::spawn(move || drop(t)))
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        // Nothing is released off-thread.
        assert_eq!(f.probe.live_textures(), 8);

        let report = f.ctx.tick(Duration::from_millis(16)).unwrap();
        assert_eq!(report.disposed, 8);
        assert_eq!(f.probe.live_textures(), 0);

        let me = thread::current().id();
        let releases = f.probe.texture_releases();
        assert_eq!(releases.len(), 8);
        assert!(releases.iter().all(|(_, t)| *t == me));
    }

    #[test]
    fn prune_runs_on_cadence() {
        let mut f = fixture_with(
            HeadlessConfig::default(),
            ContextConfig {
                prune_interval: Duration::from_secs(5),
                ..ContextConfig::default()
            },
        );
        let tex = Texture::white_pixel(&mut f.ctx).unwrap();
        tex.dispose(&mut f.ctx).unwrap();
        assert_eq!(f.ctx.registry().len(), 1);

        for _ in 0..4 {
            let report = f.ctx.tick(Duration::from_secs(1)).unwrap();
            assert_eq!(report.pruned, None);
        }
        let report = f.ctx.tick(Duration::from_secs(1)).unwrap();
        assert_eq!(report.pruned, Some(1));
        assert!(f.ctx.registry().is_empty());
    }

    // ── backend switch ───────────────────────────────────────────────────

    #[test]
    fn switch_preserves_texture_content() {
        let mut f = fixture();
        let pixels = pattern(5 * 3 * 4, 11);
        let tex = Texture::from_rgba(&mut f.ctx, 5, 3, &pixels, TextureParams::pixelated()).unwrap();
        let target = RenderTarget::new(&mut f.ctx, 2, 2).unwrap();
        target.bind(&mut f.ctx).unwrap();
        f.ctx.clear(Color::RED).unwrap();
        target.unbind(&mut f.ctx).unwrap();

        let next = Arc::new(Mutex::new(None));
        request_headless(&f.ctx, &next);
        assert_eq!(f.ctx.switch_state(), SwitchState::SwitchRequested);

        let report = f.ctx.tick(Duration::ZERO).unwrap();
        let switch = report.switch.expect("switch should have run");
        assert_eq!(switch.from, Some(BackendKind::Headless));
        assert_eq!(switch.snapshot.saved, 2);
        assert_eq!(switch.restore.restored, 2);
        assert_eq!(f.ctx.generation(), 1);
        assert_eq!(f.ctx.switch_state(), SwitchState::Running);

        // Old backend holds nothing; the new one has both resources.
        assert_eq!(f.probe.live_textures(), 0);
        let new_probe = next.lock().clone().unwrap();
        assert_eq!(new_probe.live_textures(), 2);

        assert_eq!(tex.get_data(&mut f.ctx).unwrap(), pixels);
        assert_eq!(
            target.texture().get_data(&mut f.ctx).unwrap(),
            [255, 0, 0, 255].repeat(4)
        );

        tex.dispose(&mut f.ctx).unwrap();
        target.dispose(&mut f.ctx).unwrap();
        assert_eq!(new_probe.live_textures(), 0);
    }

    #[test]
    fn switch_waits_for_open_batches() {
        let mut f = fixture();
        let mut renderer = f.ctx.create_renderer().unwrap();
        renderer.lines.begin(&mut f.ctx).unwrap();

        let next = Arc::new(Mutex::new(None));
        request_headless(&f.ctx, &next);

        let err = f.ctx.tick(Duration::ZERO).unwrap_err();
        assert!(matches!(
            err,
            VellumError::Usage(UsageError::BatchesOpen { open: 1, .. })
        ));
        assert!(f.ctx.switch_handle().is_pending());

        renderer.lines.end(&mut f.ctx).unwrap();
        assert!(f.ctx.tick(Duration::ZERO).unwrap().switch.is_some());
        renderer.dispose(&mut f.ctx).unwrap();
    }

    #[test]
    fn deferred_disposals_are_drained_before_teardown() {
        let mut f = fixture();
        let tex = Texture::white_pixel(&mut f.ctx).unwrap();
        thread::spawn(move || drop(tex)).join().unwrap();

        let next = Arc::new(Mutex::new(None));
        request_headless(&f.ctx, &next);
        let switch = f.ctx.tick(Duration::ZERO).unwrap().switch.unwrap();

        assert_eq!(switch.drained, 1);
        assert_eq!(switch.snapshot.saved, 0);
        assert_eq!(f.probe.texture_releases().len(), 1);
        assert_eq!(next.lock().as_ref().unwrap().live_textures(), 0);
    }

    #[test]
    fn failed_initialization_is_fatal_and_reported() {
        let mut f = fixture();
        let tex = Texture::white_pixel(&mut f.ctx).unwrap();

        f.ctx.switch_handle().request(BackendKind::Vulkan, || {
            Err(VellumError::BackendInit("no adapter".into()))
        });
        let err = f.ctx.tick(Duration::ZERO).unwrap_err();
        assert!(matches!(err, VellumError::BackendInit(ref r) if r == "no adapter"));
        assert_eq!(f.ctx.switch_state(), SwitchState::Failed);

        assert!(matches!(
            f.ctx.clear(Color::BLACK),
            Err(VellumError::BackendUnavailable)
        ));
        assert!(matches!(
            Texture::white_pixel(&mut f.ctx),
            Err(VellumError::BackendUnavailable)
        ));
        // Content survives in the snapshot cache until a backend appears.
        assert_eq!(
            f.ctx.registry().info(tex.handle()).unwrap().status,
            ResourceStatus::Snapshotted
        );

        let next = Arc::new(Mutex::new(None));
        request_headless(&f.ctx, &next);
        let switch = f.ctx.tick(Duration::ZERO).unwrap().switch.unwrap();
        assert_eq!(switch.from, None);
        assert_eq!(switch.restore.restored, 1);
        assert_eq!(tex.get_data(&mut f.ctx).unwrap(), vec![255; 4]);
        tex.dispose(&mut f.ctx).unwrap();
    }

    /// A factory that queues a follow-up headless switch while it runs.
    fn factory_requesting_again(
        handle: SwitchHandle,
        slot: &Arc<Mutex<Option<HeadlessProbe>>>,
        result: Result<()>,
    ) -> impl FnOnce() -> Result<Box<dyn GraphicsBackend>> + Send + 'static {
        let slot = Arc::clone(slot);
        move || {
            thread::spawn(move || {
                handle.request(BackendKind::Headless, move || {
                    let (backend, probe) = HeadlessBackend::new(HeadlessConfig::default());
                    *slot.lock() = Some(probe);
                    Ok(Box::new(backend) as Box<dyn GraphicsBackend>)
                });
            })
            .join()
            .unwrap();
            result?;
            let (backend, _) = HeadlessBackend::new(HeadlessConfig::default());
            Ok(Box::new(backend) as Box<dyn GraphicsBackend>)
        }
    }

    #[test]
    fn request_during_switch_stays_pending_and_withdrawable() {
        let mut f = fixture();
        let next = Arc::new(Mutex::new(None));
        let factory = factory_requesting_again(f.ctx.switch_handle(), &next, Ok(()));
        f.ctx.switch_handle().request(BackendKind::Headless, factory);

        assert!(f.ctx.tick(Duration::ZERO).unwrap().switch.is_some());
        assert_eq!(f.ctx.switch_state(), SwitchState::SwitchRequested);
        assert!(f.ctx.switch_handle().is_pending());

        assert!(f.ctx.switch_handle().withdraw());
        assert_eq!(f.ctx.switch_state(), SwitchState::Running);
        assert!(!f.ctx.switch_handle().is_pending());

        assert!(f.ctx.tick(Duration::ZERO).unwrap().switch.is_none());
        assert!(next.lock().is_none());
        assert_eq!(f.ctx.generation(), 1);
    }

    #[test]
    fn request_during_switch_runs_at_next_tick() {
        let mut f = fixture();
        let next = Arc::new(Mutex::new(None));
        let factory = factory_requesting_again(f.ctx.switch_handle(), &next, Ok(()));
        f.ctx.switch_handle().request(BackendKind::Headless, factory);

        f.ctx.tick(Duration::ZERO).unwrap();
        assert!(next.lock().is_none());

        assert!(f.ctx.tick(Duration::ZERO).unwrap().switch.is_some());
        assert!(next.lock().is_some());
        assert_eq!(f.ctx.switch_state(), SwitchState::Running);
        assert_eq!(f.ctx.generation(), 2);
    }

    #[test]
    fn request_during_failed_switch_withdraws_back_to_failed() {
        let mut f = fixture();
        let next = Arc::new(Mutex::new(None));
        let factory = factory_requesting_again(
            f.ctx.switch_handle(),
            &next,
            Err(VellumError::BackendInit("no adapter".into())),
        );
        f.ctx.switch_handle().request(BackendKind::Vulkan, factory);

        assert!(f.ctx.tick(Duration::ZERO).is_err());
        assert_eq!(f.ctx.switch_state(), SwitchState::SwitchRequested);
        assert!(f.ctx.switch_handle().withdraw());
        assert_eq!(f.ctx.switch_state(), SwitchState::Failed);
        assert!(matches!(
            f.ctx.clear(Color::BLACK),
            Err(VellumError::BackendUnavailable)
        ));
    }

    #[test]
    fn switch_withdrawn_before_tick_does_nothing() {
        let mut f = fixture();
        let next = Arc::new(Mutex::new(None));
        request_headless(&f.ctx, &next);
        assert!(f.ctx.switch_handle().withdraw());

        assert!(f.ctx.tick(Duration::ZERO).unwrap().switch.is_none());
        assert!(next.lock().is_none());
        assert_eq!(f.ctx.generation(), 0);
    }

    #[test]
    fn unreadable_texture_is_dropped_without_aborting_switch() {
        let mut f = fixture();
        let good = Texture::from_rgba(&mut f.ctx, 1, 1, &[1, 2, 3, 4], TextureParams::default()).unwrap();
        let bad = Texture::white_pixel(&mut f.ctx).unwrap();
        let (bad_id, _) = f.ctx.resolve(bad.handle()).unwrap();
        f.probe.fail_reads_of(bad_id);

        let next = Arc::new(Mutex::new(None));
        request_headless(&f.ctx, &next);
        let switch = f.ctx.tick(Duration::ZERO).unwrap().switch.unwrap();

        assert_eq!(switch.snapshot.failed, vec![bad.handle()]);
        assert_eq!(switch.restore.lost, vec![bad.handle()]);
        assert_eq!(good.get_data(&mut f.ctx).unwrap(), vec![1, 2, 3, 4]);
        assert!(matches!(
            bad.get_data(&mut f.ctx),
            Err(VellumError::Usage(UsageError::UnresolvedResource(_)))
        ));

        good.dispose(&mut f.ctx).unwrap();
        bad.dispose(&mut f.ctx).unwrap();
    }
}
