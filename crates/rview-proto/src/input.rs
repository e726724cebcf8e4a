//! Input flag sets carried by client messages.
//!
//! The values follow the RDP slow-path input encoding so a server can hand
//! them to an RDP-style input stack without translation.

use bitflags::bitflags;

/// One wheel notch, in rotation units.
pub const WHEEL_STEP: u16 = 120;

bitflags! {
    /// Pointer event flags.
    ///
    /// The low 8 bits carry the wheel rotation magnitude when `WHEEL` or
    /// `HWHEEL` is set, with `WHEEL_NEGATIVE` as the sign.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PointerFlags: u16 {
        const WHEEL_NEGATIVE = 0x0100;
        const HWHEEL         = 0x0400;
        const WHEEL          = 0x0200;
        const MOVE           = 0x0800;
        const DOWN           = 0x8000;
        /// Left button
        const BUTTON1        = 0x1000;
        /// Right button
        const BUTTON2        = 0x2000;
        /// Middle button
        const BUTTON3        = 0x4000;
    }
}

bitflags! {
    /// Keyboard event flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct KeyFlags: u16 {
        const EXTENDED = 0x0100;
        const RELEASE  = 0x8000;
    }
}

/// Mask of the rotation bits inside [`PointerFlags`].
pub const WHEEL_ROTATION_MASK: u16 = 0x00ff;

impl PointerFlags {
    /// Builds wheel flags for a signed rotation.
    ///
    /// Magnitudes above the 8-bit field are saturated.
    pub fn wheel(horizontal: bool, rotation: i32) -> Self {
        let axis = if horizontal { Self::HWHEEL } else { Self::WHEEL };
        let magnitude = rotation.unsigned_abs().min(u32::from(WHEEL_ROTATION_MASK)) as u16;
        let mut flags = axis | Self::from_bits_retain(magnitude);
        if rotation < 0 {
            flags |= Self::WHEEL_NEGATIVE;
        }
        flags
    }

    /// Rotation magnitude stored in the low bits.
    pub fn rotation(self) -> u16 {
        self.bits() & WHEEL_ROTATION_MASK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wheel_flags_encode_direction_and_magnitude() {
        let up = PointerFlags::wheel(false, 120);
        assert!(up.contains(PointerFlags::WHEEL));
        assert!(!up.contains(PointerFlags::WHEEL_NEGATIVE));
        assert_eq!(up.rotation(), 120);

        let left = PointerFlags::wheel(true, -240);
        assert!(left.contains(PointerFlags::HWHEEL | PointerFlags::WHEEL_NEGATIVE));
        assert_eq!(left.rotation(), 240);
    }

    #[test]
    fn test_wheel_rotation_saturates() {
        let flags = PointerFlags::wheel(false, 10_000);
        assert_eq!(flags.rotation(), WHEEL_ROTATION_MASK);
        assert!(!flags.contains(PointerFlags::WHEEL_NEGATIVE));
    }
}
