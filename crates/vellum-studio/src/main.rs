use vellum_engine::backend::BackendKind;
use vellum_engine::backend::native::GpuInit;
use vellum_engine::batch::{QuadDraw, TextureFlip};
use vellum_engine::coords::{Region, Vec2};
use vellum_engine::core::{App, AppControl, FrameCtx};
use vellum_engine::gpu::{GpuContext, Texture, TextureParams};
use vellum_engine::logging::{LoggingConfig, init_logging};
use vellum_engine::paint::Color;
use vellum_engine::window::{Runtime, RuntimeConfig, RuntimeCtx};
use winit::event::{ElementState, WindowEvent};
use winit::keyboard::{KeyCode, PhysicalKey};

const CHECKER_SIZE: u32 = 8;

/// Spinning sprites over a clipped line grid. F1..F5 switch the backend
/// live, F12 saves a screenshot.
#[derive(Default)]
struct Studio {
    white: Option<Texture>,
    checker: Option<Texture>,
    angle: f32,
    screenshot_wanted: bool,
    screenshots: u32,
}

impl Studio {
    fn checker_pixels() -> Vec<u8> {
        let mut pixels = Vec::with_capacity((CHECKER_SIZE * CHECKER_SIZE * 4) as usize);
        for y in 0..CHECKER_SIZE {
            for x in 0..CHECKER_SIZE {
                let on = (x + y) % 2 == 0;
                pixels.extend_from_slice(if on { &[240, 200, 40, 255] } else { &[30, 30, 60, 255] });
            }
        }
        pixels
    }

    fn draw_grid(ctx: &mut FrameCtx<'_>) -> vellum_engine::Result<()> {
        let (w, h) = ctx.framebuffer_size();
        let inset = Region::new(16, 16, w.saturating_sub(32), h.saturating_sub(32));
        ctx.gpu.set_scissor(Some(inset))?;
        let (w, h) = (w as f32, h as f32);
        let color = Color::new(1.0, 1.0, 1.0, 0.25);

        let mut x = 0.0;
        while x <= w {
            ctx.renderer.draw_line(ctx.gpu, Vec2::new(x, 0.0), Vec2::new(x, h), 1.0, color)?;
            x += 64.0;
        }
        let mut y = 0.0;
        while y <= h {
            ctx.renderer.draw_line(ctx.gpu, Vec2::new(0.0, y), Vec2::new(w, y), 1.0, color)?;
            y += 64.0;
        }
        ctx.gpu.set_scissor(None)
    }

    fn draw_sprites(&self, ctx: &mut FrameCtx<'_>) -> vellum_engine::Result<()> {
        let (Some(white), Some(checker)) = (self.white.as_ref(), self.checker.as_ref()) else {
            return Ok(());
        };
        let (w, h) = ctx.framebuffer_size();
        let center = Vec2::new(w as f32 / 2.0, h as f32 / 2.0);
        let half = Vec2::new(CHECKER_SIZE as f32 / 2.0, CHECKER_SIZE as f32 / 2.0);

        ctx.renderer.draw_quad(
            ctx.gpu,
            white,
            &QuadDraw::at(Vec2::new(32.0, 32.0))
                .scale(Vec2::new(160.0, 48.0))
                .color(Color::new(0.1, 0.1, 0.1, 0.8)),
        )?;

        for i in 0..12 {
            let phase = self.angle + i as f32 * std::f32::consts::TAU / 12.0;
            let offset = Vec2::new(phase.cos(), phase.sin()).scale(Vec2::new(220.0, 220.0));
            let flip = if i % 2 == 0 { TextureFlip::NONE } else { TextureFlip::HORIZONTAL };
            ctx.renderer.draw_quad(
                ctx.gpu,
                checker,
                &QuadDraw::at(center + offset)
                    .origin(half)
                    .scale(Vec2::new(6.0, 6.0))
                    .rotation(phase)
                    .flip(flip),
            )?;
        }

        ctx.renderer.draw_line(
            ctx.gpu,
            center - Vec2::new(40.0, 0.0),
            center + Vec2::new(40.0, 0.0),
            4.0,
            Color::RED,
        )?;
        Ok(())
    }
}

fn backend_for_key(code: KeyCode) -> Option<BackendKind> {
    match code {
        KeyCode::F1 => Some(BackendKind::Vulkan),
        KeyCode::F2 => Some(BackendKind::Metal),
        KeyCode::F3 => Some(BackendKind::Dx12),
        KeyCode::F4 => Some(BackendKind::Gl),
        KeyCode::F5 => Some(BackendKind::Headless),
        _ => None,
    }
}

impl App for Studio {
    fn on_start(&mut self, gpu: &mut GpuContext) -> anyhow::Result<()> {
        let info = gpu.backend_info()?;
        log::info!("started on {} ({}, {})", info.kind, info.adapter, info.driver);

        self.white = Some(Texture::white_pixel(gpu)?);
        self.checker = Some(Texture::from_rgba(
            gpu,
            CHECKER_SIZE,
            CHECKER_SIZE,
            &Self::checker_pixels(),
            TextureParams::pixelated(),
        )?);
        Ok(())
    }

    fn on_window_event(&mut self, event: &WindowEvent, runtime: &mut RuntimeCtx) -> AppControl {
        if let WindowEvent::KeyboardInput { event, .. } = event {
            if event.state != ElementState::Pressed || event.repeat {
                return AppControl::Continue;
            }
            match event.physical_key {
                PhysicalKey::Code(KeyCode::Escape) => return AppControl::Exit,
                PhysicalKey::Code(KeyCode::F12) => self.screenshot_wanted = true,
                PhysicalKey::Code(code) => {
                    if let Some(kind) = backend_for_key(code) {
                        runtime.switch_backend(kind);
                    }
                }
                PhysicalKey::Unidentified(_) => {}
            }
        }
        AppControl::Continue
    }

    fn on_update(&mut self, ctx: &mut FrameCtx<'_>) -> AppControl {
        self.angle = (self.angle + ctx.time.dt * 0.8) % std::f32::consts::TAU;

        if std::mem::take(&mut self.screenshot_wanted) {
            ctx.gpu.request_screenshot();
        }
        if let Some(shot) = ctx.gpu.take_screenshot() {
            self.screenshots += 1;
            let path = format!("vellum-studio-{}.png", self.screenshots);
            match shot.save_png(&path) {
                Ok(()) => log::info!("saved {path}"),
                Err(e) => log::warn!("could not save {path}: {e}"),
            }
        }

        if ctx.tick.switch.is_some() {
            match ctx.gpu.vram_usage() {
                Ok(bytes) => log::info!("vram after switch: {} KiB", bytes / 1024),
                Err(e) => log::warn!("vram query failed: {e}"),
            }
        }
        AppControl::Continue
    }

    fn on_draw(&mut self, ctx: &mut FrameCtx<'_>) -> AppControl {
        let drawn = Self::draw_grid(ctx).and_then(|()| self.draw_sprites(ctx));
        if let Err(e) = drawn {
            log::error!("draw failed: {e}");
            return AppControl::Exit;
        }
        AppControl::Continue
    }

    fn clear_color(&self) -> Color {
        Color::from_u8(18, 18, 28, 255)
    }

    fn on_exit(&mut self, gpu: &mut GpuContext) {
        for texture in [self.white.take(), self.checker.take()].into_iter().flatten() {
            if let Err(e) = texture.dispose(gpu) {
                log::warn!("texture dispose failed: {e}");
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    init_logging(LoggingConfig::default());

    let config = RuntimeConfig {
        title: "vellum studio".to_string(),
        ..RuntimeConfig::default()
    };
    log::info!("opening with {}; F1..F5 switch backend, F12 saves a screenshot", config.backend);

    Runtime::run(config, GpuInit::default(), Studio::default())
}
