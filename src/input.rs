//! Input translation
//!
//! Maps display-server pointer and keyboard events onto session input
//! messages: RDP-style pointer flags and Set-1 scancodes.

use rview_proto::{ClientMessage, KeyFlags, PointerFlags, WHEEL_ROTATION_MASK, WHEEL_STEP};
use tracing::{debug, trace};

use crate::pipeline::{Axis, DisplayEvent};

/// Offset between X11 keycodes and Linux evdev codes
const X11_KEYCODE_OFFSET: u8 = 8;

/// Whole notches that fit the 8-bit rotation field of one pointer message
const MAX_WHEEL_STEPS: i32 = (WHEEL_ROTATION_MASK / WHEEL_STEP) as i32;

/// Translates display events against the current surface extent
#[derive(Debug, Default)]
pub struct InputTranslator {
    last_x: u16,
    last_y: u16,
}

impl InputTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last pointer position sent to the session
    pub fn pointer_position(&self) -> (u16, u16) {
        (self.last_x, self.last_y)
    }

    /// Translate one event; `None` means nothing goes on the wire
    pub fn translate(&mut self, event: &DisplayEvent, width: u32, height: u32) -> Option<ClientMessage> {
        match *event {
            DisplayEvent::PointerEnter { x, y } | DisplayEvent::PointerMotion { x, y } => {
                self.move_to(x, y, width, height);
                Some(ClientMessage::pointer(PointerFlags::MOVE, self.last_x, self.last_y))
            }
            DisplayEvent::PointerButton {
                x,
                y,
                button,
                pressed,
            } => {
                self.move_to(x, y, width, height);
                self.button(button, pressed)
            }
            DisplayEvent::PointerAxis { axis, steps } => self.axis(axis, steps),
            DisplayEvent::Key { keycode, pressed } => key(keycode, pressed),
            DisplayEvent::KeyboardEnter { seat } => {
                debug!("Keyboard entered surface (seat {})", seat);
                None
            }
            DisplayEvent::FrameDone | DisplayEvent::Configure { .. } | DisplayEvent::CloseRequested => None,
        }
    }

    fn move_to(&mut self, x: i32, y: i32, width: u32, height: u32) {
        self.last_x = clamp(x, width);
        self.last_y = clamp(y, height);
    }

    fn button(&mut self, button: u8, pressed: bool) -> Option<ClientMessage> {
        let flags = match button {
            1 => PointerFlags::BUTTON1,
            2 => PointerFlags::BUTTON3,
            3 => PointerFlags::BUTTON2,
            // Wheel buttons reach us as axis events
            other => {
                trace!("Ignoring pointer button {}", other);
                return None;
            }
        };

        let flags = if pressed { flags | PointerFlags::DOWN } else { flags };
        Some(ClientMessage::pointer(flags, self.last_x, self.last_y))
    }

    /// Positive steps scroll down or right
    fn axis(&mut self, axis: Axis, steps: i32) -> Option<ClientMessage> {
        if steps == 0 {
            return None;
        }
        let clamped = steps.clamp(-MAX_WHEEL_STEPS, MAX_WHEEL_STEPS);
        if clamped != steps {
            debug!("Scroll of {} steps sent as {}", steps, clamped);
        }
        let rotation = clamped * i32::from(WHEEL_STEP);
        let flags = match axis {
            // Wheel-up is a positive rotation
            Axis::Vertical => PointerFlags::wheel(false, -rotation),
            Axis::Horizontal => PointerFlags::wheel(true, rotation),
        };
        Some(ClientMessage::pointer(flags, self.last_x, self.last_y))
    }
}

fn clamp(value: i32, extent: u32) -> u16 {
    let max = extent.saturating_sub(1).min(u32::from(u16::MAX)) as i32;
    value.clamp(0, max) as u16
}

fn key(keycode: u8, pressed: bool) -> Option<ClientMessage> {
    let evdev = keycode.checked_sub(X11_KEYCODE_OFFSET)?;
    let Some((code, extended)) = evdev_to_scancode(u16::from(evdev)) else {
        debug!("No scancode for keycode {}", keycode);
        return None;
    };

    let mut flags = KeyFlags::empty();
    if extended {
        flags |= KeyFlags::EXTENDED;
    }
    if !pressed {
        flags |= KeyFlags::RELEASE;
    }
    Some(ClientMessage::keyboard(flags, code))
}

/// Linux evdev code to Set-1 scancode plus extended flag.
///
/// Codes 1 through 88 (escape to F12) coincide with Set-1.
fn evdev_to_scancode(code: u16) -> Option<(u16, bool)> {
    let mapped = match code {
        1..=88 => (code, false),
        96 => (0x1c, true),  // keypad enter
        97 => (0x1d, true),  // right control
        98 => (0x35, true),  // keypad slash
        99 => (0x37, true),  // print screen
        100 => (0x38, true), // right alt
        102 => (0x47, true), // home
        103 => (0x48, true), // up
        104 => (0x49, true), // page up
        105 => (0x4b, true), // left
        106 => (0x4d, true), // right
        107 => (0x4f, true), // end
        108 => (0x50, true), // down
        109 => (0x51, true), // page down
        110 => (0x52, true), // insert
        111 => (0x53, true), // delete
        119 => (0x45, false), // pause
        125 => (0x5b, true), // left meta
        126 => (0x5c, true), // right meta
        127 => (0x5d, true), // menu
        _ => return None,
    };
    Some(mapped)
}
