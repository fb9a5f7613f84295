use std::sync::Arc;

use anyhow::{Context, Result};
use winit::application::ApplicationHandler;
use winit::dpi::LogicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::backend::native::{GpuInit, WgpuBackend};
use crate::backend::{BackendKind, GraphicsBackend, HeadlessBackend, HeadlessConfig};
use crate::batch::Renderer;
use crate::core::{App, AppControl, FrameCtx};
use crate::error::VellumError;
use crate::gpu::{ContextConfig, GpuContext};
use crate::time::FrameClock;

/// Window/runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub title: String,
    pub initial_size: LogicalSize<f64>,
    /// Backend opened at startup.
    pub backend: BackendKind,
    pub context: ContextConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            title: "vellum".to_string(),
            initial_size: LogicalSize::new(1280.0, 720.0),
            backend: BackendKind::from_env().unwrap_or_else(BackendKind::platform_default),
            context: ContextConfig::default(),
        }
    }
}

/// Runtime context passed to the application.
///
/// Commands are buffered and applied after the current callback returns.
#[derive(Debug, Default)]
pub struct RuntimeCtx {
    commands: Vec<Command>,
}

impl RuntimeCtx {
    /// Requests a backend switch. It runs at the next frame's safe point.
    pub fn switch_backend(&mut self, kind: BackendKind) {
        self.commands.push(Command::SwitchBackend(kind));
    }

    pub fn exit(&mut self) {
        self.commands.push(Command::Exit);
    }
}

#[derive(Debug)]
enum Command {
    SwitchBackend(BackendKind),
    Exit,
}

/// Entry point for the runtime.
pub struct Runtime;

impl Runtime {
    /// Runs `app` in one window until it exits.
    ///
    /// A backend that fails to initialize, at startup or during a switch,
    /// ends the loop and is returned as the error. Usage and resource
    /// creation errors only cost the frame they happen in.
    pub fn run<A>(config: RuntimeConfig, gpu_init: GpuInit, app: A) -> Result<()>
    where
        A: 'static + App,
    {
        let event_loop = EventLoop::new().context("failed to create winit EventLoop")?;
        let mut state = AppState::new(config, gpu_init, app);

        event_loop
            .run_app(&mut state)
            .context("winit event loop terminated with error")?;

        match state.fatal.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Opens `kind` on `window`.
fn open_backend(
    kind: BackendKind,
    window: &Arc<Window>,
    init: &GpuInit,
) -> crate::error::Result<Box<dyn GraphicsBackend>> {
    match kind {
        BackendKind::Headless => {
            let size = window.inner_size();
            let (backend, _probe) = HeadlessBackend::new(HeadlessConfig {
                width: size.width,
                height: size.height,
                ..HeadlessConfig::default()
            });
            log::warn!("headless backend selected; the window will not update");
            Ok(Box::new(backend))
        }
        _ => Ok(Box::new(WgpuBackend::for_window(kind, Arc::clone(window), init)?)),
    }
}

struct WindowState {
    window: Arc<Window>,
    gpu: GpuContext,
    /// Taken on shutdown so it can be disposed before the context drops.
    renderer: Option<Renderer>,
    clock: FrameClock,
}

struct AppState<A>
where
    A: App + 'static,
{
    config: RuntimeConfig,
    gpu_init: GpuInit,
    app: A,

    window: Option<WindowState>,
    exit_requested: bool,
    fatal: Option<anyhow::Error>,
}

impl<A> AppState<A>
where
    A: App + 'static,
{
    fn new(config: RuntimeConfig, gpu_init: GpuInit, app: A) -> Self {
        Self {
            config,
            gpu_init,
            app,
            window: None,
            exit_requested: false,
            fatal: None,
        }
    }

    fn request_exit(&mut self) {
        self.exit_requested = true;
    }

    fn fail(&mut self, err: anyhow::Error) {
        log::error!("{err:#}");
        self.fatal.get_or_insert(err);
        self.request_exit();
    }

    fn create_window(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let attrs = Window::default_attributes()
            .with_title(self.config.title.clone())
            .with_inner_size(self.config.initial_size);

        let window = Arc::new(
            event_loop
                .create_window(attrs)
                .context("failed to create window")?,
        );

        let kind = self.config.backend;
        let backend = open_backend(kind, &window, &self.gpu_init)
            .with_context(|| format!("failed to open the {kind} backend"))?;
        let mut gpu = GpuContext::new(backend, self.config.context.clone())
            .context("failed to create the GPU context")?;
        let renderer = gpu.create_renderer().context("failed to create the renderer")?;

        self.app.on_start(&mut gpu).context("application start failed")?;

        window.request_redraw();
        self.window = Some(WindowState {
            window,
            gpu,
            renderer: Some(renderer),
            clock: FrameClock::default(),
        });
        Ok(())
    }

    /// Lets the app release its resources, then drops the context.
    fn shutdown(&mut self) {
        let Some(mut ws) = self.window.take() else {
            return;
        };
        self.app.on_exit(&mut ws.gpu);
        if let Some(renderer) = ws.renderer.take() {
            if let Err(e) = renderer.dispose(&mut ws.gpu) {
                log::warn!("renderer dispose failed: {e}");
            }
        }
        if let Err(e) = ws.gpu.drain_disposals() {
            log::warn!("final disposal drain failed: {e}");
        }
    }

    fn apply_commands(&mut self, event_loop: &ActiveEventLoop, ctx: RuntimeCtx) {
        for cmd in ctx.commands {
            match cmd {
                Command::SwitchBackend(kind) => self.request_switch(kind),
                Command::Exit => self.request_exit(),
            }
        }

        if self.exit_requested {
            self.shutdown();
            event_loop.exit();
        }
    }

    fn request_switch(&mut self, kind: BackendKind) {
        let Some(ws) = self.window.as_ref() else {
            return;
        };
        let window = Arc::clone(&ws.window);
        let init = self.gpu_init.clone();
        ws.gpu
            .switch_handle()
            .request(kind, move || open_backend(kind, &window, &init));
    }
}

/// Errors that abandon the current frame but leave the context usable.
fn is_recoverable(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<VellumError>(),
        Some(VellumError::Usage(_) | VellumError::ResourceCreation { .. })
    )
}

/// Closes whatever the failed frame left open so the next one starts clean.
fn abandon_frame(ws: &mut WindowState) {
    if let Some(renderer) = ws.renderer.as_mut() {
        if renderer.is_open() {
            if let Err(e) = renderer.end(&mut ws.gpu) {
                log::debug!("closing batches of the abandoned frame: {e}");
            }
        }
    }
}

/// Drives one frame: safe point, update, draw, present.
fn run_frame<A: App>(app: &mut A, ws: &mut WindowState, runtime: &mut RuntimeCtx) -> Result<AppControl> {
    let time = ws.clock.tick();
    let tick = ws.gpu.tick(time.delta).context("frame safe point failed")?;
    if let Some(report) = &tick.switch {
        log::info!(
            "now rendering with {} ({}); {} restored, {} lost",
            report.to.kind,
            report.to.adapter,
            report.restore.restored,
            report.restore.lost.len()
        );
        ws.clock.reset();
    }

    let Some(renderer) = ws.renderer.as_mut() else {
        return Ok(AppControl::Exit);
    };
    let mut ctx = FrameCtx {
        window: &ws.window,
        gpu: &mut ws.gpu,
        renderer,
        time,
        tick: &tick,
        runtime,
    };

    if app.on_update(&mut ctx) == AppControl::Exit {
        return Ok(AppControl::Exit);
    }

    ctx.gpu.begin_scene()?;
    ctx.gpu.clear(app.clear_color())?;
    ctx.renderer.begin(ctx.gpu)?;
    let control = app.on_draw(&mut ctx);
    ctx.renderer.end(ctx.gpu)?;
    ctx.gpu.end_scene()?;

    ctx.window.pre_present_notify();
    ctx.gpu.present()?;
    Ok(control)
}

impl<A> ApplicationHandler for AppState<A>
where
    A: App + 'static,
{
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        if let Err(e) = self.create_window(event_loop) {
            self.fail(e);
            event_loop.exit();
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.exit_requested {
            self.shutdown();
            event_loop.exit();
            return;
        }

        event_loop.set_control_flow(ControlFlow::Wait);

        // Continuous redraw.
        if let Some(ws) = self.window.as_ref() {
            ws.window.request_redraw();
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        if self.exit_requested {
            self.shutdown();
            event_loop.exit();
            return;
        }

        let mut runtime = RuntimeCtx::default();
        if self.app.on_window_event(&event, &mut runtime) == AppControl::Exit {
            runtime.exit();
        }

        match &event {
            WindowEvent::CloseRequested => runtime.exit(),

            WindowEvent::Resized(size) => {
                if let Some(ws) = self.window.as_mut() {
                    if let Err(e) = ws.gpu.resize(size.width, size.height) {
                        log::warn!("resize to {}x{} not applied: {e}", size.width, size.height);
                    }
                    ws.window.request_redraw();
                }
            }

            WindowEvent::ScaleFactorChanged { .. } => {
                if let Some(ws) = self.window.as_mut() {
                    let size = ws.window.inner_size();
                    if let Err(e) = ws.gpu.resize(size.width, size.height) {
                        log::warn!("resize to {}x{} not applied: {e}", size.width, size.height);
                    }
                }
            }

            WindowEvent::RedrawRequested => {
                if let Some(ws) = self.window.as_mut() {
                    match run_frame(&mut self.app, ws, &mut runtime) {
                        Ok(AppControl::Continue) => {}
                        Ok(AppControl::Exit) => runtime.exit(),
                        Err(e) if is_recoverable(&e) => {
                            log::warn!("frame dropped: {e:#}");
                            abandon_frame(ws);
                        }
                        Err(e) => self.fail(e),
                    }
                }
            }

            _ => {}
        }

        self.apply_commands(event_loop, runtime);
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.shutdown();
    }
}
