//! X11 presentation backend
//!
//! Each presentation window is backed by a server-side pixmap. Damaged rows
//! are uploaded with `PutImage` and the pixmap is handed to the compositor
//! with `PresentPixmap`; the matching `PresentCompleteNotify` is the frame
//! completion signal.

use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::os::unix::io::{AsRawFd, RawFd};

use anyhow::{bail, Context};
use tracing::{debug, info, trace, warn};
use x11rb::connection::{Connection, RequestConnection};
use x11rb::protocol::present::{self, ConnectionExt as _};
use x11rb::protocol::randr::ConnectionExt as _;
use x11rb::protocol::xproto::*;
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as _;
use x11rb::{CURRENT_TIME, NONE};

use super::bands;
use crate::pipeline::{
    Axis, DamageRect, DisplayBackend, DisplayEvent, PipelineError, PixelBuffer, PixelFormat, Result, WindowId,
};

/// `PutImage` request header size in bytes
const PUT_IMAGE_HEADER: usize = 24;

/// `_NET_WM_STATE` client message actions
const NET_WM_STATE_REMOVE: u32 = 0;
const NET_WM_STATE_ADD: u32 = 1;

/// Atoms the backend needs
#[derive(Debug, Clone, Copy)]
struct Atoms {
    wm_protocols: Atom,
    wm_delete_window: Atom,
    net_wm_name: Atom,
    net_wm_state: Atom,
    net_wm_state_fullscreen: Atom,
    net_wm_opaque_region: Atom,
    utf8_string: Atom,
}

impl Atoms {
    fn new(conn: &RustConnection) -> anyhow::Result<Self> {
        let intern = |name: &str| -> anyhow::Result<Atom> {
            Ok(conn
                .intern_atom(false, name.as_bytes())?
                .reply()
                .with_context(|| format!("Failed to intern {}", name))?
                .atom)
        };

        Ok(Self {
            wm_protocols: intern("WM_PROTOCOLS")?,
            wm_delete_window: intern("WM_DELETE_WINDOW")?,
            net_wm_name: intern("_NET_WM_NAME")?,
            net_wm_state: intern("_NET_WM_STATE")?,
            net_wm_state_fullscreen: intern("_NET_WM_STATE_FULLSCREEN")?,
            net_wm_opaque_region: intern("_NET_WM_OPAQUE_REGION")?,
            utf8_string: intern("UTF8_STRING")?,
        })
    }
}

/// Server-side state of one presentation window
#[derive(Debug)]
struct X11Surface {
    pixmap: Pixmap,
    gc: Gcontext,
    event_id: u32,
    width: u16,
    height: u16,
    damage: DamageRect,
    mapped: bool,
}

/// X11 connection plus its presentation windows
pub struct X11Display {
    conn: RustConnection,
    screen_num: usize,
    atoms: Atoms,
    depth: u8,
    output: Option<(u32, u32)>,
    surfaces: HashMap<Window, X11Surface>,
    queued: VecDeque<Event>,
    serial: u32,
}

impl X11Display {
    /// Connect to `display_name` (or `$DISPLAY`) and check the extensions
    pub fn open(display_name: Option<&str>) -> anyhow::Result<Self> {
        let (conn, screen_num) = x11rb::connect(display_name).context("Failed to connect to X11 server")?;

        let atoms = Atoms::new(&conn)?;
        let screen = &conn.setup().roots[screen_num];
        let depth = screen.root_depth;
        let root = screen.root;

        let bpp = conn
            .setup()
            .pixmap_formats
            .iter()
            .find(|format| format.depth == depth)
            .map(|format| format.bits_per_pixel);
        if bpp != Some(32) || depth < 24 {
            bail!("Unsupported visual: depth {} with {:?} bits per pixel", depth, bpp);
        }

        if conn
            .extension_information(present::X11_EXTENSION_NAME)
            .context("Failed to query Present extension")?
            .is_none()
        {
            bail!("X11 server lacks the Present extension");
        }
        let version = conn
            .present_query_version(1, 0)?
            .reply()
            .context("Failed to query Present version")?;
        debug!("Present extension version: {}.{}", version.major_version, version.minor_version);

        let output = first_output_resolution(&conn, root);
        match output {
            Some((w, h)) => info!("First output resolution: {}x{}", w, h),
            None => debug!("No RandR output resolution available"),
        }

        info!("Connected to X11 display (screen {}, depth {})", screen_num, depth);
        Ok(Self {
            conn,
            screen_num,
            atoms,
            depth,
            output,
            surfaces: HashMap::new(),
            queued: VecDeque::new(),
            serial: 0,
        })
    }

    fn screen(&self) -> &Screen {
        &self.conn.setup().roots[self.screen_num]
    }

    fn surface_mut(&mut self, window: WindowId) -> Result<&mut X11Surface> {
        self.surfaces
            .get_mut(&window.0)
            .ok_or_else(|| PipelineError::BackendFailure(format!("unknown window {}", window.0)))
    }

    fn create_pixmap(&self, window: Window, width: u16, height: u16) -> Result<Pixmap> {
        let pixmap = self.conn.generate_id().map_err(failure("allocate pixmap id"))?;
        self.conn
            .create_pixmap(self.depth, pixmap, window, width, height)
            .map_err(failure("create pixmap"))?;
        Ok(pixmap)
    }

    /// Upload `rect` of `buffer` into the window's pixmap
    fn upload(&self, surface: &X11Surface, buffer: &PixelBuffer, rect: DamageRect) -> Result<()> {
        let stride = buffer.stride();
        let bpp = buffer.format().bytes_per_pixel();
        let row_bytes = rect.w as usize * bpp;
        if row_bytes == 0 {
            return Ok(());
        }
        let max_rows = (self.conn.maximum_request_bytes().saturating_sub(PUT_IMAGE_HEADER) / row_bytes).max(1);

        for band in bands(rect, max_rows as u32) {
            let mut data = Vec::with_capacity(row_bytes * band.h as usize);
            for row in band.y..band.y + band.h {
                let start = row as usize * stride + band.x as usize * bpp;
                data.extend_from_slice(&buffer.data()[start..start + row_bytes]);
            }
            self.conn
                .put_image(
                    ImageFormat::Z_PIXMAP,
                    surface.pixmap,
                    surface.gc,
                    band.w as u16,
                    band.h as u16,
                    band.x as i16,
                    band.y as i16,
                    0,
                    self.depth,
                    &data,
                )
                .map_err(failure("upload image"))?;
        }
        Ok(())
    }
}

/// Map one X11 event onto the backend-neutral event set.
///
/// Geometry checks go through `surfaces`; events for unknown windows and
/// events with no pipeline meaning yield `None`.
fn translate_event(event: Event, atoms: &Atoms, surfaces: &HashMap<Window, X11Surface>) -> Option<DisplayEvent> {
    match event {
        Event::PresentCompleteNotify(ev) if ev.kind == present::CompleteKind::PIXMAP => {
            trace!("Present complete: window {} serial {}", ev.window, ev.serial);
            Some(DisplayEvent::FrameDone)
        }
        Event::EnterNotify(ev) => Some(DisplayEvent::PointerEnter {
            x: ev.event_x.into(),
            y: ev.event_y.into(),
        }),
        Event::MotionNotify(ev) => Some(DisplayEvent::PointerMotion {
            x: ev.event_x.into(),
            y: ev.event_y.into(),
        }),
        // Core protocol wheel: one notch per press, the release carries nothing
        Event::ButtonPress(ev) if (4..=7).contains(&ev.detail) => {
            let (axis, steps) = match ev.detail {
                4 => (Axis::Vertical, -1),
                5 => (Axis::Vertical, 1),
                6 => (Axis::Horizontal, -1),
                _ => (Axis::Horizontal, 1),
            };
            Some(DisplayEvent::PointerAxis { axis, steps })
        }
        Event::ButtonRelease(ev) if (4..=7).contains(&ev.detail) => None,
        Event::ButtonPress(ev) | Event::ButtonRelease(ev) => Some(DisplayEvent::PointerButton {
            x: ev.event_x.into(),
            y: ev.event_y.into(),
            button: ev.detail,
            pressed: ev.response_type & 0x7f == BUTTON_PRESS_EVENT,
        }),
        Event::KeyPress(ev) => Some(DisplayEvent::Key {
            keycode: ev.detail,
            pressed: true,
        }),
        Event::KeyRelease(ev) => Some(DisplayEvent::Key {
            keycode: ev.detail,
            pressed: false,
        }),
        Event::FocusIn(_) => Some(DisplayEvent::KeyboardEnter { seat: 0 }),
        Event::ConfigureNotify(ev) => {
            let surface = surfaces.get(&ev.window)?;
            if (surface.width, surface.height) == (ev.width, ev.height) {
                return None;
            }
            Some(DisplayEvent::Configure {
                width: ev.width.into(),
                height: ev.height.into(),
                fullscreen: None,
            })
        }
        Event::Expose(ev) if ev.count == 0 => {
            let surface = surfaces.get(&ev.window)?;
            Some(DisplayEvent::Configure {
                width: surface.width.into(),
                height: surface.height.into(),
                fullscreen: None,
            })
        }
        Event::ClientMessage(ev) if ev.type_ == atoms.wm_protocols => {
            let data = ev.data.as_data32();
            (data[0] == atoms.wm_delete_window).then_some(DisplayEvent::CloseRequested)
        }
        Event::Error(e) => {
            warn!("X11 error: {:?}", e);
            None
        }
        other => {
            trace!("Ignoring X11 event {:?}", other);
            None
        }
    }
}

impl DisplayBackend for X11Display {
    fn readiness_fd(&self) -> RawFd {
        self.conn.stream().as_raw_fd()
    }

    fn prepare_wait(&mut self) -> Result<bool> {
        self.conn.flush().map_err(failure("flush"))?;
        // Replies waited on elsewhere may have pulled events off the socket
        if let Some(event) = self.conn.poll_for_event().map_err(failure("poll for event"))? {
            self.queued.push_back(event);
        }
        Ok(!self.queued.is_empty())
    }

    fn dispatch(&mut self) -> Result<Vec<DisplayEvent>> {
        let mut events = Vec::new();
        loop {
            let event = match self.queued.pop_front() {
                Some(event) => event,
                None => match self.conn.poll_for_event().map_err(failure("poll for event"))? {
                    Some(event) => event,
                    None => break,
                },
            };
            events.extend(translate_event(event, &self.atoms, &self.surfaces));
        }
        Ok(events)
    }

    fn output_resolution(&self) -> Option<(u32, u32)> {
        self.output
    }

    fn create_window(&mut self, width: u32, height: u32, format: PixelFormat) -> Result<WindowId> {
        let (w, h) = dims(width, height)?;
        debug!("Creating {}x{} window ({:?})", w, h, format);

        let screen = self.screen();
        let (root, visual, black) = (screen.root, screen.root_visual, screen.black_pixel);

        let window = self.conn.generate_id().map_err(failure("allocate window id"))?;
        let mask = EventMask::EXPOSURE
            | EventMask::STRUCTURE_NOTIFY
            | EventMask::KEY_PRESS
            | EventMask::KEY_RELEASE
            | EventMask::BUTTON_PRESS
            | EventMask::BUTTON_RELEASE
            | EventMask::POINTER_MOTION
            | EventMask::ENTER_WINDOW
            | EventMask::FOCUS_CHANGE;
        self.conn
            .create_window(
                self.depth,
                window,
                root,
                0,
                0,
                w,
                h,
                0,
                WindowClass::INPUT_OUTPUT,
                visual,
                &CreateWindowAux::new().background_pixel(black).event_mask(mask),
            )
            .map_err(failure("create window"))?;
        self.conn
            .change_property32(
                PropMode::REPLACE,
                window,
                self.atoms.wm_protocols,
                AtomEnum::ATOM,
                &[self.atoms.wm_delete_window],
            )
            .map_err(failure("set WM_PROTOCOLS"))?;

        let pixmap = self.create_pixmap(window, w, h)?;
        let gc = self.conn.generate_id().map_err(failure("allocate gc id"))?;
        self.conn
            .create_gc(gc, pixmap, &CreateGCAux::new())
            .map_err(failure("create gc"))?;

        let event_id = self.conn.generate_id().map_err(failure("allocate event id"))?;
        self.conn
            .present_select_input(event_id, window, present::EventMask::COMPLETE_NOTIFY)
            .map_err(failure("select present input"))?;

        self.surfaces.insert(
            window,
            X11Surface {
                pixmap,
                gc,
                event_id,
                width: w,
                height: h,
                damage: DamageRect::default(),
                mapped: false,
            },
        );
        Ok(WindowId(window))
    }

    fn resize_window(&mut self, window: WindowId, width: u32, height: u32) -> Result<()> {
        let (w, h) = dims(width, height)?;
        let old = self.surface_mut(window)?.pixmap;
        let pixmap = self.create_pixmap(window.0, w, h)?;

        let configured = self
            .conn
            .configure_window(window.0, &ConfigureWindowAux::new().width(u32::from(w)).height(u32::from(h)))
            .map(drop);
        if let Err(e) = configured {
            if let Err(e) = self.conn.free_pixmap(pixmap) {
                debug!("Failed to free unused pixmap: {}", e);
            }
            return Err(failure("configure window")(e));
        }

        let surface = self.surface_mut(window)?;
        surface.pixmap = pixmap;
        surface.width = w;
        surface.height = h;
        surface.damage = DamageRect::default();
        self.conn.free_pixmap(old).map_err(failure("free pixmap"))?;
        Ok(())
    }

    fn destroy_window(&mut self, window: WindowId) {
        let Some(surface) = self.surfaces.remove(&window.0) else {
            debug!("Destroying unknown window {}", window.0);
            return;
        };
        if let Err(e) = self
            .conn
            .present_select_input(surface.event_id, window.0, present::EventMask::NO_EVENT)
        {
            debug!("Failed to stop present events for window {}: {}", window.0, e);
        }
        if let Err(e) = self.conn.free_gc(surface.gc) {
            debug!("Failed to free gc of window {}: {}", window.0, e);
        }
        if let Err(e) = self.conn.free_pixmap(surface.pixmap) {
            debug!("Failed to free pixmap of window {}: {}", window.0, e);
        }
        if let Err(e) = self.conn.destroy_window(window.0) {
            warn!("Failed to destroy window {}: {}", window.0, e);
        }
        if let Err(e) = self.conn.flush() {
            debug!("Flush after destroying window {} failed: {}", window.0, e);
        }
    }

    fn set_fullscreen(&mut self, window: WindowId, fullscreen: bool) -> Result<()> {
        let mapped = self.surface_mut(window)?.mapped;
        let atoms = self.atoms;

        if !mapped {
            // Unmapped windows carry the initial state as a property
            let state = if fullscreen {
                vec![atoms.net_wm_state_fullscreen]
            } else {
                Vec::new()
            };
            self.conn
                .change_property32(PropMode::REPLACE, window.0, atoms.net_wm_state, AtomEnum::ATOM, &state)
                .map_err(failure("set _NET_WM_STATE"))?;
            return Ok(());
        }

        let action = if fullscreen {
            NET_WM_STATE_ADD
        } else {
            NET_WM_STATE_REMOVE
        };
        let event = ClientMessageEvent::new(
            32,
            window.0,
            atoms.net_wm_state,
            [action, atoms.net_wm_state_fullscreen, 0, 1, 0],
        );
        let root = self.screen().root;
        self.conn
            .send_event(
                false,
                root,
                EventMask::SUBSTRUCTURE_REDIRECT | EventMask::SUBSTRUCTURE_NOTIFY,
                event,
            )
            .map_err(failure("send _NET_WM_STATE"))?;
        Ok(())
    }

    fn set_title(&mut self, window: WindowId, title: &str) -> Result<()> {
        self.conn
            .change_property8(PropMode::REPLACE, window.0, AtomEnum::WM_NAME, AtomEnum::STRING, title.as_bytes())
            .map_err(failure("set WM_NAME"))?;
        self.conn
            .change_property8(
                PropMode::REPLACE,
                window.0,
                self.atoms.net_wm_name,
                self.atoms.utf8_string,
                title.as_bytes(),
            )
            .map_err(failure("set _NET_WM_NAME"))?;
        Ok(())
    }

    fn set_opaque_region(&mut self, window: WindowId, region: DamageRect) -> Result<()> {
        self.conn
            .change_property32(
                PropMode::REPLACE,
                window.0,
                self.atoms.net_wm_opaque_region,
                AtomEnum::CARDINAL,
                &[region.x, region.y, region.w, region.h],
            )
            .map_err(failure("set _NET_WM_OPAQUE_REGION"))?;
        Ok(())
    }

    fn add_damage(&mut self, window: WindowId, rect: DamageRect) -> Result<()> {
        let surface = self.surface_mut(window)?;
        surface.damage = surface.damage.union(&rect);
        Ok(())
    }

    fn submit(&mut self, window: WindowId, buffer: &PixelBuffer) -> Result<()> {
        let surface = self
            .surfaces
            .get(&window.0)
            .ok_or_else(|| PipelineError::BackendFailure(format!("unknown window {}", window.0)))?;
        if (u32::from(surface.width), u32::from(surface.height)) != (buffer.width(), buffer.height()) {
            return Err(PipelineError::BackendFailure(format!(
                "{}x{} buffer does not match {}x{} window",
                buffer.width(),
                buffer.height(),
                surface.width,
                surface.height
            )));
        }

        self.upload(surface, buffer, surface.damage)?;
        let (pixmap, mapped) = (surface.pixmap, surface.mapped);

        self.serial = self.serial.wrapping_add(1);
        self.conn
            .present_pixmap(
                window.0,
                pixmap,
                self.serial,
                NONE,
                NONE,
                0,
                0,
                NONE,
                NONE,
                NONE,
                0, // PresentOptionNone
                0,
                0,
                0,
                &[],
            )
            .map_err(failure("present pixmap"))?;

        if !mapped {
            self.conn.map_window(window.0).map_err(failure("map window"))?;
        }
        let surface = self.surface_mut(window)?;
        surface.mapped = true;
        surface.damage = DamageRect::default();
        trace!("Presented window {} serial {}", window.0, self.serial);
        Ok(())
    }

    fn inhibit_shortcuts(&mut self, window: WindowId, seat: u32) -> Result<()> {
        let reply = self
            .conn
            .grab_keyboard(true, window.0, CURRENT_TIME, GrabMode::ASYNC, GrabMode::ASYNC)
            .map_err(failure("grab keyboard"))?
            .reply()
            .map_err(failure("grab keyboard"))?;
        if reply.status != GrabStatus::SUCCESS {
            warn!("Keyboard grab for seat {} refused: {:?}", seat, reply.status);
        } else {
            debug!("Keyboard grabbed for seat {}", seat);
        }
        Ok(())
    }
}

impl Drop for X11Display {
    fn drop(&mut self) {
        let windows: Vec<Window> = self.surfaces.keys().copied().collect();
        for window in windows {
            self.destroy_window(WindowId(window));
        }
    }
}

/// Resolution of the first active CRTC
fn first_output_resolution(conn: &RustConnection, root: Window) -> Option<(u32, u32)> {
    let resources = conn.randr_get_screen_resources_current(root).ok()?.reply().ok()?;
    resources.crtcs.iter().find_map(|&crtc| {
        let info = conn
            .randr_get_crtc_info(crtc, resources.config_timestamp)
            .ok()?
            .reply()
            .ok()?;
        (info.width > 0 && info.height > 0).then(|| (u32::from(info.width), u32::from(info.height)))
    })
}

/// Window dimensions as X11 sizes
fn dims(width: u32, height: u32) -> Result<(u16, u16)> {
    match (u16::try_from(width), u16::try_from(height)) {
        (Ok(w), Ok(h)) if w > 0 && h > 0 => Ok((w, h)),
        _ => Err(PipelineError::BackendFailure(format!(
            "window size {}x{} out of range",
            width, height
        ))),
    }
}

fn failure<E: Display>(what: &'static str) -> impl FnOnce(E) -> PipelineError {
    move |e| PipelineError::BackendFailure(format!("failed to {}: {}", what, e))
}
