//! Display-update pipeline
//!
//! Takes raster damage from the remote framebuffer and presents it on a local
//! window while the presentation backend accepts only one outstanding frame.
//! Everything here runs on the reactor thread.

pub mod damage;
pub mod gate;
pub mod reactor;
pub mod surface;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::os::unix::io::RawFd;

use rview_proto::ClientMessage;
use thiserror::Error;

pub use damage::PixelBuffer;
pub use reactor::Reactor;
pub use surface::SurfaceManager;

/// Pipeline error taxonomy
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Operation on a missing or uninitialized surface/buffer
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Damage rectangle outside the buffer extents
    #[error("damage {rect} outside {width}x{height} buffer")]
    OutOfBounds {
        rect: DamageRect,
        width: u32,
        height: u32,
    },

    /// Backing-store reallocation failed; the previous surface is intact
    #[error("resize to {width}x{height} failed: {reason}")]
    ResizeFailed {
        width: u32,
        height: u32,
        reason: String,
    },

    /// Display-server or compositor call failed
    #[error("display backend failure: {0}")]
    BackendFailure(String),

    /// Wait failure or exhausted readiness handles
    #[error("reactor failure: {0}")]
    ReactorFatal(String),

    /// The session engine exposed more readiness handles than the wait set holds
    #[error("{count} readiness handles exceed the limit of {max}")]
    TooManyHandles { count: usize, max: usize },

    /// The remote-session engine cannot proceed
    #[error("session failure: {0}")]
    Session(String),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// Rectangle in buffer coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DamageRect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl DamageRect {
    pub const fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    /// Rectangle covering a whole `width` x `height` surface
    pub const fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub const fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }

    /// True when the rectangle lies inside a `width` x `height` surface
    pub fn fits(&self, width: u32, height: u32) -> bool {
        let right = self.x.checked_add(self.w);
        let bottom = self.y.checked_add(self.h);
        matches!((right, bottom), (Some(r), Some(b)) if r <= width && b <= height)
    }

    /// Smallest rectangle containing both
    pub fn union(&self, other: &Self) -> Self {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = (self.x + self.w).max(other.x + other.w);
        let bottom = (self.y + self.h).max(other.y + other.h);
        Self::new(x, y, right - x, bottom - y)
    }
}

impl fmt::Display for DamageRect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {}x{})", self.x, self.y, self.w, self.h)
    }
}

/// Fixed pixel format of both framebuffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PixelFormat {
    /// 32-bit little-endian B, G, R, unused
    #[default]
    Bgrx32,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Bgrx32 => 4,
        }
    }
}

/// Backend handle of a presentation window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowId(pub u32);

/// Scroll axis of a pointer axis event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Vertical,
    Horizontal,
}

/// Display-server events, backend neutral, delivered in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayEvent {
    /// The last submission completed; its buffer may be reused
    FrameDone,
    PointerEnter { x: i32, y: i32 },
    PointerMotion { x: i32, y: i32 },
    PointerButton {
        x: i32,
        y: i32,
        button: u8,
        pressed: bool,
    },
    /// Signed number of scroll steps
    PointerAxis { axis: Axis, steps: i32 },
    KeyboardEnter { seat: u32 },
    /// Raw display-server keycode
    Key { keycode: u8, pressed: bool },
    /// The window was resized or changed fullscreen state
    Configure {
        width: u32,
        height: u32,
        fullscreen: Option<bool>,
    },
    /// The user asked to close the window
    CloseRequested,
}

/// Presentation backend (display server / compositor side)
pub trait DisplayBackend {
    /// Pollable handle signalled when display events arrive
    fn readiness_fd(&self) -> RawFd;

    /// Flush outgoing requests; returns true if events are already queued
    /// in-process so the reactor must not block.
    fn prepare_wait(&mut self) -> Result<bool>;

    /// Read and drain every queued event, in arrival order
    fn dispatch(&mut self) -> Result<Vec<DisplayEvent>>;

    /// Resolution of the first available output
    fn output_resolution(&self) -> Option<(u32, u32)>;

    fn create_window(&mut self, width: u32, height: u32, format: PixelFormat) -> Result<WindowId>;

    fn resize_window(&mut self, window: WindowId, width: u32, height: u32) -> Result<()>;

    fn destroy_window(&mut self, window: WindowId);

    fn set_fullscreen(&mut self, window: WindowId, fullscreen: bool) -> Result<()>;

    fn set_title(&mut self, window: WindowId, title: &str) -> Result<()>;

    fn set_opaque_region(&mut self, window: WindowId, region: DamageRect) -> Result<()>;

    /// Accumulate damage for the next submission
    fn add_damage(&mut self, window: WindowId, rect: DamageRect) -> Result<()>;

    /// Hand the buffer to the compositor; completion arrives as [`DisplayEvent::FrameDone`]
    fn submit(&mut self, window: WindowId, buffer: &PixelBuffer) -> Result<()>;

    /// Stop the display server from handling its own shortcuts for `seat`
    fn inhibit_shortcuts(&mut self, window: WindowId, seat: u32) -> Result<()>;
}

/// Source framebuffer maintained by the raster layer
pub trait SourceFramebuffer {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn format(&self) -> PixelFormat;
    fn data(&self) -> &[u8];

    fn stride(&self) -> usize {
        self.width() as usize * self.format().bytes_per_pixel()
    }

    /// Reallocate the backing store; on failure the old store stays valid
    fn resize(&mut self, width: u32, height: u32) -> Result<()>;

    /// Current dirty rectangle, `None` when nothing was painted
    fn invalid_region(&self) -> Option<DamageRect>;

    /// Mark the dirty rectangle as null
    fn clear_invalid(&mut self);
}

/// Paint callbacks the session engine drives while draining its handles
pub trait UpdateHandler {
    /// A paint batch starts; no damage yet
    fn begin_paint(&mut self, source: &mut dyn SourceFramebuffer) -> Result<()>;

    /// A paint batch ends; the source's invalid region is authoritative
    fn end_paint(&mut self, source: &mut dyn SourceFramebuffer) -> Result<()>;

    /// The remote desktop changed size
    fn desktop_resize(&mut self, source: &mut dyn SourceFramebuffer, width: u32, height: u32) -> Result<()>;
}

/// Session settings snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub desktop_width: u32,
    pub desktop_height: u32,
    pub fullscreen: bool,
    pub grab_keyboard: bool,
}

/// Remote-session engine as seen by the pipeline
pub trait SessionEngine {
    fn settings(&self) -> &SessionSettings;

    fn settings_mut(&mut self) -> &mut SessionSettings;

    /// Establish the session using the current settings
    fn connect(&mut self) -> Result<()>;

    /// Close the session; safe to call more than once
    fn disconnect(&mut self);

    /// Readiness handles for the next wait
    fn event_handles(&self) -> Vec<RawFd>;

    /// Drain readiness and run paint callbacks
    fn check_handles(&mut self, handler: &mut dyn UpdateHandler) -> Result<()>;

    fn shall_disconnect(&self) -> bool;

    fn request_disconnect(&mut self);

    /// Forward one translated input message
    fn send_input(&mut self, message: ClientMessage) -> Result<()>;

    fn framebuffer(&self) -> &dyn SourceFramebuffer;

    fn framebuffer_mut(&mut self) -> &mut dyn SourceFramebuffer;
}

/// What the reactor drives each iteration
pub trait EventSources {
    fn display_fd(&self) -> RawFd;

    fn session_handles(&self) -> Vec<RawFd>;

    fn shall_disconnect(&self) -> bool;

    /// See [`DisplayBackend::prepare_wait`]
    fn prepare_wait(&mut self) -> Result<bool>;

    fn dispatch_display(&mut self) -> Result<()>;

    fn dispatch_session(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fits_rejects_overflow() {
        assert!(DamageRect::new(0, 0, 10, 10).fits(10, 10));
        assert!(!DamageRect::new(1, 0, 10, 10).fits(10, 10));
        assert!(!DamageRect::new(u32::MAX, 0, 2, 1).fits(10, 10));
    }

    #[test]
    fn test_union_ignores_empty() {
        let a = DamageRect::new(10, 10, 5, 5);
        let b = DamageRect::new(0, 12, 4, 10);
        assert_eq!(a.union(&b), DamageRect::new(0, 10, 15, 12));
        assert_eq!(a.union(&DamageRect::default()), a);
    }
}
