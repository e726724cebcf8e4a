//! In-memory collaborators for pipeline tests

use std::os::unix::io::RawFd;

use super::{
    DamageRect, DisplayBackend, DisplayEvent, PipelineError, PixelBuffer, PixelFormat, Result,
    SourceFramebuffer, WindowId,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BackendCall {
    CreateWindow(u32, u32),
    ResizeWindow(u32, u32),
    Fullscreen(bool),
    Title(String),
    OpaqueRegion(DamageRect),
    Damage(DamageRect),
    /// Bounding box of the damage accumulated since the previous submission
    Submit(DamageRect),
    InhibitShortcuts(u32),
}

#[derive(Debug, Default)]
pub(crate) struct MockBackend {
    pub output: Option<(u32, u32)>,
    pub calls: Vec<BackendCall>,
    pub destroyed: usize,
    pub queued: Vec<DisplayEvent>,
    pub fail_submit: bool,
    pub fail_resize: bool,
    next_window: u32,
    damage: DamageRect,
}

impl MockBackend {
    /// Backend whose first output reports `(width, height)`
    pub fn with_output(width: u32, height: u32) -> Self {
        Self {
            output: Some((width, height)),
            ..Self::default()
        }
    }

    pub fn submissions(&self) -> usize {
        self.calls
            .iter()
            .filter(|call| matches!(call, BackendCall::Submit(_)))
            .count()
    }

    pub fn damage_calls(&self) -> usize {
        self.calls
            .iter()
            .filter(|call| matches!(call, BackendCall::Damage(_)))
            .count()
    }
}

impl DisplayBackend for MockBackend {
    fn readiness_fd(&self) -> RawFd {
        -1
    }

    fn prepare_wait(&mut self) -> Result<bool> {
        Ok(!self.queued.is_empty())
    }

    fn dispatch(&mut self) -> Result<Vec<DisplayEvent>> {
        Ok(std::mem::take(&mut self.queued))
    }

    fn output_resolution(&self) -> Option<(u32, u32)> {
        self.output
    }

    fn create_window(&mut self, width: u32, height: u32, _format: PixelFormat) -> Result<WindowId> {
        self.next_window += 1;
        self.calls.push(BackendCall::CreateWindow(width, height));
        Ok(WindowId(self.next_window))
    }

    fn resize_window(&mut self, _window: WindowId, width: u32, height: u32) -> Result<()> {
        if self.fail_resize {
            return Err(PipelineError::BackendFailure("configure refused".into()));
        }
        self.calls.push(BackendCall::ResizeWindow(width, height));
        Ok(())
    }

    fn destroy_window(&mut self, _window: WindowId) {
        self.destroyed += 1;
    }

    fn set_fullscreen(&mut self, _window: WindowId, fullscreen: bool) -> Result<()> {
        self.calls.push(BackendCall::Fullscreen(fullscreen));
        Ok(())
    }

    fn set_title(&mut self, _window: WindowId, title: &str) -> Result<()> {
        self.calls.push(BackendCall::Title(title.to_string()));
        Ok(())
    }

    fn set_opaque_region(&mut self, _window: WindowId, region: DamageRect) -> Result<()> {
        self.calls.push(BackendCall::OpaqueRegion(region));
        Ok(())
    }

    fn add_damage(&mut self, _window: WindowId, rect: DamageRect) -> Result<()> {
        self.damage = self.damage.union(&rect);
        self.calls.push(BackendCall::Damage(rect));
        Ok(())
    }

    fn submit(&mut self, _window: WindowId, _buffer: &PixelBuffer) -> Result<()> {
        if self.fail_submit {
            return Err(PipelineError::BackendFailure("submit refused".into()));
        }
        let damage = std::mem::take(&mut self.damage);
        self.calls.push(BackendCall::Submit(damage));
        Ok(())
    }

    fn inhibit_shortcuts(&mut self, _window: WindowId, seat: u32) -> Result<()> {
        self.calls.push(BackendCall::InhibitShortcuts(seat));
        Ok(())
    }
}

/// Source framebuffer filled with a non-zero pattern
#[derive(Debug, Clone)]
pub(crate) struct MockFramebuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
    pub invalid: Option<DamageRect>,
    pub fail_resize: bool,
}

impl MockFramebuffer {
    pub fn patterned(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: pattern(width, height),
            invalid: None,
            fail_resize: false,
        }
    }
}

fn pattern(width: u32, height: u32) -> Vec<u8> {
    let len = width as usize * height as usize * 4;
    (0..len).map(|i| (i % 251) as u8 + 1).collect()
}

impl SourceFramebuffer for MockFramebuffer {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn format(&self) -> PixelFormat {
        PixelFormat::Bgrx32
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        if self.fail_resize {
            return Err(PipelineError::ResizeFailed {
                width,
                height,
                reason: "allocation refused".into(),
            });
        }
        self.width = width;
        self.height = height;
        self.data = pattern(width, height);
        Ok(())
    }

    fn invalid_region(&self) -> Option<DamageRect> {
        self.invalid
    }

    fn clear_invalid(&mut self) {
        self.invalid = None;
    }
}
