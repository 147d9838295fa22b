//! Kiln - Main Entry Point
//!
//! Opens a window, brings up the renderer and draws one frame per redraw until
//! the window is closed or rendering fails.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, info};
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::WindowId;

use kiln_core::{EngineConfig, Timer};
use kiln_platform::Window;
use kiln_renderer::{RenderGraph, Renderer};

const FPS_LOG_INTERVAL: Duration = Duration::from_secs(1);

struct App {
    config: EngineConfig,
    // Renderer before window: it must be destroyed first.
    renderer: Option<Renderer>,
    window: Option<Window>,
    graph: RenderGraph,
    timer: Timer,
    failure: Option<anyhow::Error>,
}

impl App {
    fn new(config: EngineConfig) -> Self {
        Self {
            config,
            renderer: None,
            window: None,
            graph: RenderGraph::new(),
            timer: Timer::new(),
            failure: None,
        }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window = Window::new(event_loop, &self.config.window).context("creating window")?;
        let renderer =
            Renderer::new(&window, &self.config.renderer).context("initializing renderer")?;
        info!("Initialization complete, entering main loop");
        self.renderer = Some(renderer);
        self.window = Some(window);
        self.timer.reset();
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: anyhow::Error) {
        error!("{:#}", err);
        self.failure = Some(err);
        self.shutdown();
        event_loop.exit();
    }

    fn shutdown(&mut self) {
        if let Some(renderer) = self.renderer.take() {
            info!("Rendered {} frames", renderer.frame_count());
        }
        self.window = None;
    }

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };
        if self.window.as_ref().is_some_and(Window::is_minimized) {
            return;
        }

        if let Err(e) = renderer.render(&self.graph) {
            self.fail(event_loop, anyhow!(e).context("rendering frame"));
            return;
        }

        self.timer.tick();
        if let Some(fps) = self.timer.sample_fps(FPS_LOG_INTERVAL) {
            debug!("FPS: {:.1}", fps);
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none()
            && self.failure.is_none()
            && let Err(e) = self.init(event_loop)
        {
            self.fail(event_loop, e);
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested, shutting down");
                self.shutdown();
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(window) = self.window.as_mut() {
                    window.resize(size.width, size.height);
                }
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.resize(size.width, size.height);
                }
            }
            WindowEvent::RedrawRequested => self.redraw(event_loop),
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = self.window.as_ref() {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.shutdown();
    }
}

fn main() -> Result<()> {
    kiln_core::init_logging();
    info!("Starting Kiln");

    let config = EngineConfig::from_env().context("loading configuration")?;
    debug!("Configuration: {:?}", config);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    match app.failure.take() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
