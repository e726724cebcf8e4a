//! Surface lifecycle
//!
//! Creates, resizes and destroys the presentation surface, and routes the
//! session engine's paint callbacks through the damage manager and the gate.

use tracing::{debug, info, warn};

use super::damage::{copy_region, PixelBuffer};
use super::gate::{PresentationGate, SubmitOutcome};
use super::{
    DamageRect, DisplayBackend, PipelineError, Result, SourceFramebuffer, UpdateHandler, WindowId,
};

/// The local window plus the pixel buffer presented into it
#[derive(Debug)]
pub struct PresentationSurface {
    buffer: PixelBuffer,
    window: WindowId,
    fullscreen: bool,
}

impl PresentationSurface {
    pub fn buffer(&self) -> &PixelBuffer {
        &self.buffer
    }

    pub fn window(&self) -> WindowId {
        self.window
    }

    pub fn fullscreen(&self) -> bool {
        self.fullscreen
    }

    pub fn width(&self) -> u32 {
        self.buffer.width()
    }

    pub fn height(&self) -> u32 {
        self.buffer.height()
    }
}

/// Owns the presentation backend, the surface and its gate
pub struct SurfaceManager<D> {
    backend: D,
    surface: Option<PresentationSurface>,
    gate: PresentationGate,
    title: String,
}

impl<D: DisplayBackend> SurfaceManager<D> {
    pub fn new(backend: D, title: impl Into<String>) -> Self {
        Self {
            backend,
            surface: None,
            gate: PresentationGate::new(),
            title: title.into(),
        }
    }

    pub fn backend(&self) -> &D {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut D {
        &mut self.backend
    }

    pub fn surface(&self) -> Option<&PresentationSurface> {
        self.surface.as_ref()
    }

    pub fn gate(&self) -> &PresentationGate {
        &self.gate
    }

    /// Pick the desktop size to request: the first output's resolution
    /// when fullscreen, falling back to the requested size.
    pub fn resolve_size(&self, width: u32, height: u32, fullscreen: bool) -> (u32, u32) {
        if !fullscreen {
            return (width, height);
        }
        match self.backend.output_resolution() {
            Some((w, h)) if w > 0 && h > 0 => {
                debug!("Fullscreen: using output resolution {}x{}", w, h);
                (w, h)
            }
            _ => {
                warn!("Failed to get output resolution, keeping {}x{}", width, height);
                (width, height)
            }
        }
    }

    /// Post-connect setup: allocate the surface at the negotiated desktop
    /// size, create the window and present the initial content.
    ///
    /// The fullscreen output override belongs before the session connects
    /// (see [`Self::resolve_size`]); the size handed in here is what the
    /// server agreed to and is never replaced.
    pub fn on_connect(
        &mut self,
        source: &mut dyn SourceFramebuffer,
        width: u32,
        height: u32,
        fullscreen: bool,
    ) -> Result<()> {
        if self.surface.is_some() {
            return Err(PipelineError::InvalidState("presentation surface already exists"));
        }

        if source.width() != width || source.height() != height {
            source.resize(width, height).map_err(|e| as_resize_failure(e, width, height))?;
        }

        let buffer = PixelBuffer::new(width, height, source.format())?;
        let window = self.backend.create_window(width, height, source.format())?;
        if let Err(e) = self.setup_window(window, buffer.extent(), fullscreen) {
            self.backend.destroy_window(window);
            return Err(e);
        }

        self.surface = Some(PresentationSurface {
            buffer,
            window,
            fullscreen,
        });
        self.gate.reset();
        info!("Presentation surface {}x{} created (fullscreen={})", width, height, fullscreen);

        self.refresh(source)?;
        Ok(())
    }

    fn setup_window(&mut self, window: WindowId, extent: DamageRect, fullscreen: bool) -> Result<()> {
        self.backend.set_fullscreen(window, fullscreen)?;
        self.backend.set_title(window, &self.title)?;
        self.backend.set_opaque_region(window, extent)
    }

    /// Remote desktop resize: the source framebuffer is resized first; if
    /// that fails the surface keeps its previous, still valid state. The new
    /// buffer replaces the old one only once the window has followed.
    pub fn on_resize(&mut self, source: &mut dyn SourceFramebuffer, width: u32, height: u32) -> Result<()> {
        let Some(surface) = self.surface.as_mut() else {
            return Err(PipelineError::InvalidState("resize without a presentation surface"));
        };

        source.resize(width, height).map_err(|e| as_resize_failure(e, width, height))?;
        let buffer = PixelBuffer::new(width, height, source.format())?;

        let window = surface.window;
        self.backend.resize_window(window, width, height)?;
        self.backend.set_opaque_region(window, DamageRect::full(width, height))?;
        surface.buffer = buffer;
        info!("Presentation surface resized to {}x{}", width, height);

        self.refresh(source)?;
        Ok(())
    }

    /// Display-server configure: follow the source geometry and repaint everything
    pub fn on_configure(&mut self, source: &mut dyn SourceFramebuffer, fullscreen: Option<bool>) -> Result<()> {
        let Some(surface) = self.surface.as_mut() else {
            return Err(PipelineError::InvalidState("configure without a presentation surface"));
        };
        if let Some(fullscreen) = fullscreen {
            surface.fullscreen = fullscreen;
        }

        if surface.width() != source.width() || surface.height() != source.height() {
            let (width, height) = (source.width(), source.height());
            return self.on_resize(source, width, height);
        }
        self.refresh(source).map(|_| ())
    }

    /// Disconnect-time teardown; a no-op when there is no surface
    pub fn on_disconnect(&mut self) {
        match self.surface.take() {
            Some(surface) => {
                self.backend.destroy_window(surface.window);
                info!("Presentation surface released");
            }
            None => debug!("No presentation surface to release"),
        }
        self.gate.reset();
    }

    /// Copy one damaged rectangle and request a submission
    pub fn update_buffer(&mut self, source: &dyn SourceFramebuffer, rect: DamageRect) -> Result<SubmitOutcome> {
        self.update_regions(source, std::slice::from_ref(&rect))
    }

    /// Copy a set of damaged rectangles, then request one submission
    pub fn update_regions(&mut self, source: &dyn SourceFramebuffer, rects: &[DamageRect]) -> Result<SubmitOutcome> {
        let Some(surface) = self.surface.as_mut() else {
            return Err(PipelineError::InvalidState("paint without a presentation surface"));
        };

        for rect in rects {
            copy_region(&mut surface.buffer, source, *rect)?;
            self.backend.add_damage(surface.window, *rect)?;
        }
        self.request_submit()
    }

    /// Full-surface copy and submission request
    pub fn refresh(&mut self, source: &dyn SourceFramebuffer) -> Result<SubmitOutcome> {
        let extent = self
            .surface
            .as_ref()
            .map(|surface| surface.buffer.extent())
            .ok_or(PipelineError::InvalidState("refresh without a presentation surface"))?;
        self.update_buffer(source, extent)
    }

    /// Frame completion from the backend
    pub fn on_frame_done(&mut self) -> Result<SubmitOutcome> {
        let Self {
            backend,
            surface,
            gate,
            ..
        } = self;

        let outcome = gate.on_submission_complete(|| match surface.as_ref() {
            Some(surface) => backend.submit(surface.window, &surface.buffer),
            None => Err(PipelineError::InvalidState("catch-up submission without a surface")),
        })?;
        if outcome == SubmitOutcome::Submitted {
            debug!("Catch-up submission issued");
        }
        Ok(outcome)
    }

    fn request_submit(&mut self) -> Result<SubmitOutcome> {
        let Self {
            backend,
            surface,
            gate,
            ..
        } = self;
        let surface = surface
            .as_ref()
            .ok_or(PipelineError::InvalidState("submission without a surface"))?;

        gate.request_submit(|| backend.submit(surface.window, &surface.buffer))
    }
}

impl<D: DisplayBackend> UpdateHandler for SurfaceManager<D> {
    fn begin_paint(&mut self, source: &mut dyn SourceFramebuffer) -> Result<()> {
        source.clear_invalid();
        Ok(())
    }

    fn end_paint(&mut self, source: &mut dyn SourceFramebuffer) -> Result<()> {
        match source.invalid_region() {
            Some(rect) => self.update_buffer(source, rect).map(|_| ()),
            None => Ok(()),
        }
    }

    fn desktop_resize(&mut self, source: &mut dyn SourceFramebuffer, width: u32, height: u32) -> Result<()> {
        self.on_resize(source, width, height)
    }
}

fn as_resize_failure(err: PipelineError, width: u32, height: u32) -> PipelineError {
    match err {
        PipelineError::ResizeFailed { .. } => err,
        other => PipelineError::ResizeFailed {
            width,
            height,
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::{BackendCall, MockBackend, MockFramebuffer};
    use crate::session::raster::{Raster, MAX_DIMENSION};

    fn connected(width: u32, height: u32) -> (SurfaceManager<MockBackend>, MockFramebuffer) {
        let mut source = MockFramebuffer::patterned(width, height);
        let mut manager = SurfaceManager::new(MockBackend::default(), "test");
        manager.on_connect(&mut source, width, height, false).unwrap();
        (manager, source)
    }

    #[test]
    fn test_connect_presents_initial_content() {
        let (manager, source) = connected(1024, 768);

        let surface = manager.surface().unwrap();
        assert_eq!((surface.width(), surface.height()), (1024, 768));
        assert_eq!(surface.buffer().data(), source.data());
        assert_eq!(manager.backend().submissions(), 1);
        assert!(manager.backend().calls.contains(&BackendCall::OpaqueRegion(DamageRect::full(1024, 768))));
        assert!(manager.backend().calls.contains(&BackendCall::Fullscreen(false)));
    }

    #[test]
    fn test_resolve_size_prefers_output_when_fullscreen() {
        let manager = SurfaceManager::new(MockBackend::with_output(1920, 1080), "test");
        assert_eq!(manager.resolve_size(800, 600, true), (1920, 1080));
        assert_eq!(manager.resolve_size(800, 600, false), (800, 600));

        let headless = SurfaceManager::new(MockBackend::default(), "test");
        assert_eq!(headless.resolve_size(800, 600, true), (800, 600));
    }

    #[test]
    fn test_fullscreen_connect_keeps_negotiated_size() {
        let mut source = Raster::new(2560, 1440).unwrap();
        let mut manager = SurfaceManager::new(MockBackend::with_output(1920, 1080), "test");

        manager.on_connect(&mut source, 2560, 1440, true).unwrap();

        let surface = manager.surface().unwrap();
        assert_eq!((surface.width(), surface.height()), (2560, 1440));
        assert!(surface.fullscreen());
        assert_eq!((source.width(), source.height()), (2560, 1440));

        // Paints beyond the output extent still land on the surface
        manager.on_frame_done().unwrap();
        let rect = DamageRect::new(2000, 1200, 16, 16);
        source.paint(rect, &[0x5a; 16 * 16 * 4]).unwrap();
        assert_eq!(manager.update_buffer(&source, rect).unwrap(), SubmitOutcome::Submitted);
    }

    #[test]
    fn test_second_connect_is_invalid_state() {
        let (mut manager, mut source) = connected(64, 64);
        let err = manager.on_connect(&mut source, 64, 64, false).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidState(_)));
    }

    #[test]
    fn test_paint_without_surface_is_invalid_state() {
        let source = MockFramebuffer::patterned(16, 16);
        let mut manager = SurfaceManager::new(MockBackend::default(), "test");

        let err = manager.update_buffer(&source, DamageRect::new(0, 0, 1, 1)).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidState(_)));
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let (mut manager, _source) = connected(64, 64);

        manager.on_disconnect();
        manager.on_disconnect();

        assert!(manager.surface().is_none());
        assert_eq!(manager.backend().destroyed, 1);
        assert!(manager.gate().is_idle());

        let mut never = SurfaceManager::new(MockBackend::default(), "test");
        never.on_disconnect();
        assert_eq!(never.backend().destroyed, 0);
    }

    #[test]
    fn test_failed_resize_keeps_previous_surface() {
        let (mut manager, mut source) = connected(320, 240);
        manager.on_frame_done().unwrap();
        source.fail_resize = true;

        let err = manager.on_resize(&mut source, 640, 480).unwrap_err();
        assert!(matches!(err, PipelineError::ResizeFailed { width: 640, height: 480, .. }));

        let surface = manager.surface().unwrap();
        assert_eq!((surface.width(), surface.height()), (320, 240));
        assert_eq!(
            manager.update_buffer(&source, DamageRect::new(0, 0, 320, 240)).unwrap(),
            SubmitOutcome::Submitted
        );
    }

    #[test]
    fn test_oversized_remote_resize_fails_cleanly() {
        let mut source = Raster::new(64, 64).unwrap();
        let mut manager = SurfaceManager::new(MockBackend::default(), "test");
        manager.on_connect(&mut source, 64, 64, false).unwrap();
        manager.on_frame_done().unwrap();

        let err = manager.desktop_resize(&mut source, 1_000_000, 1_000_000).unwrap_err();
        assert!(matches!(err, PipelineError::ResizeFailed { width: 1_000_000, .. }));

        let err = manager.on_resize(&mut source, MAX_DIMENSION + 1, 64).unwrap_err();
        assert!(matches!(err, PipelineError::ResizeFailed { .. }));

        let surface = manager.surface().unwrap();
        assert_eq!((surface.width(), surface.height()), (64, 64));
        assert_eq!((source.width(), source.height()), (64, 64));
        assert!(!manager.backend().calls.iter().any(|call| matches!(call, BackendCall::ResizeWindow(..))));
        assert_eq!(manager.refresh(&source).unwrap(), SubmitOutcome::Submitted);
    }

    #[test]
    fn test_backend_resize_failure_keeps_old_buffer() {
        let (mut manager, mut source) = connected(320, 240);
        manager.backend_mut().fail_resize = true;

        let err = manager.on_resize(&mut source, 640, 480).unwrap_err();
        assert!(matches!(err, PipelineError::BackendFailure(_)));

        let surface = manager.surface().unwrap();
        assert_eq!((surface.width(), surface.height()), (320, 240));
        assert_eq!(surface.buffer().data().len(), 320 * 240 * 4);
    }

    #[test]
    fn test_end_to_end_connect_paint_resize_disconnect() {
        let mut source = MockFramebuffer::patterned(1024, 768);
        let mut manager = SurfaceManager::new(MockBackend::default(), "test");

        manager.on_connect(&mut source, 1024, 768, false).unwrap();
        let surface = manager.surface().unwrap();
        assert_eq!((surface.width(), surface.height()), (1024, 768));
        // Initial content was presented; let it complete
        manager.on_frame_done().unwrap();
        assert!(manager.gate().is_idle());

        let submissions = manager.backend().submissions();
        let outcome = manager.update_buffer(&source, DamageRect::new(0, 0, 1024, 768)).unwrap();
        assert_eq!(outcome, SubmitOutcome::Submitted);
        assert_eq!(manager.backend().submissions(), submissions + 1);

        assert_eq!(manager.on_frame_done().unwrap(), SubmitOutcome::Idle);
        assert!(manager.gate().is_idle());

        manager.on_resize(&mut source, 1280, 1024).unwrap();
        let surface = manager.surface().unwrap();
        assert_eq!((surface.width(), surface.height()), (1280, 1024));
        assert_eq!(surface.buffer().data().len(), 1280 * 1024 * 4);
        assert_eq!(manager.backend().submissions(), submissions + 2);
        assert_eq!(
            manager.backend().calls.last(),
            Some(&BackendCall::Submit(DamageRect::full(1280, 1024)))
        );

        manager.on_disconnect();
        assert!(manager.surface().is_none());
        assert_eq!(manager.backend().destroyed, 1);
        manager.on_disconnect();
        assert_eq!(manager.backend().destroyed, 1);
    }

    #[test]
    fn test_two_paints_before_completion_coalesce() {
        let (mut manager, source) = connected(200, 200);
        manager.on_frame_done().unwrap();
        let base = manager.backend().submissions();
        let rect = DamageRect::new(10, 10, 50, 50);

        assert_eq!(manager.update_buffer(&source, rect).unwrap(), SubmitOutcome::Submitted);
        let after_first = manager.surface().unwrap().buffer().clone();
        assert_eq!(manager.update_buffer(&source, rect).unwrap(), SubmitOutcome::Deferred);

        assert_eq!(manager.surface().unwrap().buffer(), &after_first);
        assert_eq!(manager.backend().submissions(), base + 1);
        assert_eq!(manager.backend().damage_calls(), 3);

        assert_eq!(manager.on_frame_done().unwrap(), SubmitOutcome::Submitted);
        assert_eq!(manager.backend().submissions(), base + 2);

        assert_eq!(manager.on_frame_done().unwrap(), SubmitOutcome::Idle);
        assert!(manager.gate().is_idle());
    }

    #[test]
    fn test_end_paint_uses_invalid_region() {
        let (mut manager, mut source) = connected(64, 64);
        manager.on_frame_done().unwrap();

        manager.begin_paint(&mut source).unwrap();
        manager.end_paint(&mut source).unwrap();
        assert!(manager.gate().is_idle(), "null invalid region paints nothing");

        source.invalid = Some(DamageRect::new(4, 4, 8, 8));
        manager.end_paint(&mut source).unwrap();
        assert!(manager.gate().inflight());
        assert_eq!(
            manager.backend().calls.iter().rev().nth(1),
            Some(&BackendCall::Damage(DamageRect::new(4, 4, 8, 8)))
        );
    }

    #[test]
    fn test_configure_repaints_full_surface() {
        let (mut manager, mut source) = connected(64, 32);
        manager.on_frame_done().unwrap();

        manager.on_configure(&mut source, Some(true)).unwrap();

        assert!(manager.surface().unwrap().fullscreen());
        assert_eq!(
            manager.backend().calls.last(),
            Some(&BackendCall::Submit(DamageRect::full(64, 32)))
        );
    }
}
