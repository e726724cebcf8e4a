//! Process signal setup
//!
//! SIGINT and SIGTERM raise a flag the client polls between reactor
//! iterations, so the session is still disconnected cleanly. The signal also
//! interrupts the reactor wait, which then returns with nothing ready.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tracing::debug;

static TERMINATE: AtomicBool = AtomicBool::new(false);

/// Install the handler; call once before the reactor starts
pub fn install() -> Result<&'static AtomicBool> {
    ctrlc::set_handler(|| {
        TERMINATE.store(true, Ordering::SeqCst);
    })
    .context("Failed to install termination handler")?;

    debug!("Signal handlers installed");
    Ok(&TERMINATE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_hands_out_lowered_flag() {
        let stop = install().unwrap();
        assert!(!stop.load(Ordering::SeqCst));
        assert!(std::ptr::eq(stop, &TERMINATE));
    }
}
