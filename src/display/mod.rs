//! Display backends
//!
//! Concrete [`DisplayBackend`](crate::pipeline::DisplayBackend) implementations.

pub mod x11;

pub use x11::X11Display;

use crate::pipeline::DamageRect;

/// Split `rect` into horizontal bands of at most `max_rows` rows each
pub fn bands(rect: DamageRect, max_rows: u32) -> impl Iterator<Item = DamageRect> {
    let max_rows = max_rows.max(1);
    let count = if rect.is_empty() { 0 } else { rect.h.div_ceil(max_rows) };
    (0..count).map(move |i| {
        let top = rect.y + i * max_rows;
        let rows = max_rows.min(rect.y + rect.h - top);
        DamageRect::new(rect.x, top, rect.w, rows)
    })
}
