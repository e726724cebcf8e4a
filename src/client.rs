//! Client context
//!
//! Ties the session engine to the presentation surface: pre-connect sizing,
//! post-connect surface creation, the reactor's dispatch targets and the
//! teardown that always runs when the loop ends.

use std::os::unix::io::RawFd;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, info, trace, warn};

use crate::input::InputTranslator;
use crate::pipeline::{DisplayBackend, DisplayEvent, EventSources, Reactor, Result, SessionEngine, SurfaceManager};

/// Client behaviour knobs
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub title: String,
    pub max_event_handles: usize,
    /// Failed input forwards end the session instead of being dropped
    pub strict_input: bool,
    /// Raised from outside (signals) to end the loop
    pub stop: Option<&'static AtomicBool>,
}

pub struct Client<D, E> {
    engine: E,
    surfaces: SurfaceManager<D>,
    input: InputTranslator,
    options: ClientOptions,
}

impl<D: DisplayBackend, E: SessionEngine> Client<D, E> {
    pub fn new(backend: D, engine: E, options: ClientOptions) -> Self {
        Self {
            engine,
            surfaces: SurfaceManager::new(backend, options.title.clone()),
            input: InputTranslator::new(),
            options,
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn surfaces(&self) -> &SurfaceManager<D> {
        &self.surfaces
    }

    /// Size the desktop, connect the session and create the surface.
    ///
    /// Fullscreen asks the server for the output resolution; the surface is
    /// then built at whatever size the server settled on.
    pub fn connect(&mut self) -> Result<()> {
        let settings = self.engine.settings().clone();
        let (width, height) =
            self.surfaces
                .resolve_size(settings.desktop_width, settings.desktop_height, settings.fullscreen);
        {
            let settings = self.engine.settings_mut();
            settings.desktop_width = width;
            settings.desktop_height = height;
        }

        self.engine.connect()?;

        let settings = self.engine.settings().clone();
        let Self { engine, surfaces, .. } = self;
        surfaces.on_connect(
            engine.framebuffer_mut(),
            settings.desktop_width,
            settings.desktop_height,
            settings.fullscreen,
        )
    }

    /// Close the session and release the surface; safe to repeat
    pub fn disconnect(&mut self) {
        self.engine.disconnect();
        self.surfaces.on_disconnect();
    }

    /// Connect, run the reactor until disconnect or failure, then tear down
    pub fn run_session(&mut self) -> Result<()> {
        let result = self.connect().and_then(|()| self.run_loop());
        self.disconnect();
        result
    }

    fn run_loop(&mut self) -> Result<()> {
        let mut reactor = Reactor::new(self.options.max_event_handles)?;
        reactor.run(self)
    }

    /// [`Self::run_session`] as a process exit status
    pub fn run(&mut self) -> ExitCode {
        match self.run_session() {
            Ok(()) => {
                info!("Session ended");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Session failed: {}", e);
                ExitCode::FAILURE
            }
        }
    }

    fn handle_display_event(&mut self, event: DisplayEvent) -> Result<()> {
        match event {
            DisplayEvent::FrameDone => {
                self.surfaces.on_frame_done()?;
            }
            DisplayEvent::KeyboardEnter { seat } => {
                if self.engine.settings().grab_keyboard {
                    if let Some(window) = self.surfaces.surface().map(|surface| surface.window()) {
                        self.surfaces.backend_mut().inhibit_shortcuts(window, seat)?;
                    }
                }
                self.forward_input(&event)?;
            }
            DisplayEvent::Configure { fullscreen, .. } => {
                let Self { engine, surfaces, .. } = self;
                surfaces.on_configure(engine.framebuffer_mut(), fullscreen)?;
            }
            DisplayEvent::CloseRequested => {
                info!("Window closed, disconnecting");
                self.engine.request_disconnect();
            }
            DisplayEvent::PointerEnter { .. }
            | DisplayEvent::PointerMotion { .. }
            | DisplayEvent::PointerButton { .. }
            | DisplayEvent::PointerAxis { .. }
            | DisplayEvent::Key { .. } => self.forward_input(&event)?,
        }
        Ok(())
    }

    fn forward_input(&mut self, event: &DisplayEvent) -> Result<()> {
        let (width, height) = self
            .surfaces
            .surface()
            .map(|surface| (surface.width(), surface.height()))
            .unwrap_or((0, 0));
        let Some(message) = self.input.translate(event, width, height) else {
            return Ok(());
        };

        match self.engine.send_input(message) {
            Ok(()) => Ok(()),
            Err(e) if !self.options.strict_input => {
                warn!("Dropping input event: {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl<D: DisplayBackend, E: SessionEngine> EventSources for Client<D, E> {
    fn display_fd(&self) -> RawFd {
        self.surfaces.backend().readiness_fd()
    }

    fn session_handles(&self) -> Vec<RawFd> {
        self.engine.event_handles()
    }

    fn shall_disconnect(&self) -> bool {
        self.engine.shall_disconnect() || self.options.stop.is_some_and(|stop| stop.load(Ordering::SeqCst))
    }

    fn prepare_wait(&mut self) -> Result<bool> {
        self.surfaces.backend_mut().prepare_wait()
    }

    fn dispatch_display(&mut self) -> Result<()> {
        let events = self.surfaces.backend_mut().dispatch()?;
        trace!("Dispatching {} display events", events.len());
        for event in events {
            self.handle_display_event(event)?;
        }
        Ok(())
    }

    fn dispatch_session(&mut self) -> Result<()> {
        let Self { engine, surfaces, .. } = self;
        engine.check_handles(surfaces)
    }
}
