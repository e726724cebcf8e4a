//! Event reactor
//!
//! Single-threaded loop merging display-server readiness and remote-session
//! readiness. The wait set is rebuilt every iteration because the session
//! engine may change its handles between waits; handles are registered with
//! mio for one wait and deregistered right after.

use std::io::{self, ErrorKind};
use std::os::unix::io::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};
use tracing::{debug, info, trace};

use super::{EventSources, PipelineError, Result};

/// Slot 0 of every wait set
const DISPLAY_TOKEN: Token = Token(0);

/// Default cap on session readiness handles
pub const DEFAULT_MAX_HANDLES: usize = 64;

/// Handles for one wait: slot 0 is the display server, 1..N the session
#[derive(Debug)]
pub struct WaitSet {
    handles: Vec<RawFd>,
}

impl WaitSet {
    /// Build the set, rejecting an empty or oversized session handle list
    pub fn build(display_fd: RawFd, session: Vec<RawFd>, max_handles: usize) -> Result<Self> {
        if session.is_empty() {
            return Err(PipelineError::ReactorFatal(
                "session engine exposes no readiness handles".into(),
            ));
        }
        if session.len() > max_handles {
            return Err(PipelineError::TooManyHandles {
                count: session.len(),
                max: max_handles,
            });
        }

        let mut handles = Vec::with_capacity(session.len() + 1);
        handles.push(display_fd);
        handles.extend(session);
        Ok(Self { handles })
    }

    pub fn handles(&self) -> &[RawFd] {
        &self.handles
    }

    fn register(&self, registry: &Registry) -> Result<()> {
        for (slot, fd) in self.handles.iter().enumerate() {
            if let Err(e) = registry.register(&mut SourceFd(fd), Token(slot), Interest::READABLE) {
                // Undo the slots that made it in before failing
                for fd in &self.handles[..slot] {
                    let _ = registry.deregister(&mut SourceFd(fd));
                }
                return Err(PipelineError::ReactorFatal(format!(
                    "failed to register handle {} (slot {}): {}",
                    fd, slot, e
                )));
            }
        }
        Ok(())
    }

    fn deregister(&self, registry: &Registry) {
        for fd in &self.handles {
            if let Err(e) = registry.deregister(&mut SourceFd(fd)) {
                debug!("Failed to deregister handle {}: {}", fd, e);
            }
        }
    }
}

/// Which slots a wait reported
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Readiness {
    display: bool,
    session: bool,
}

/// The loop driver
pub struct Reactor {
    poll: Poll,
    events: Events,
    max_handles: usize,
}

impl Reactor {
    pub fn new(max_handles: usize) -> Result<Self> {
        let poll = Poll::new()
            .map_err(|e| PipelineError::ReactorFatal(format!("failed to create poll instance: {}", e)))?;

        Ok(Self {
            poll,
            events: Events::with_capacity(max_handles + 1),
            max_handles,
        })
    }

    /// Iterate until the session asks to disconnect or something fails
    pub fn run<S: EventSources + ?Sized>(&mut self, sources: &mut S) -> Result<()> {
        info!("Starting reactor loop");
        let mut iterations: u64 = 0;

        while !sources.shall_disconnect() {
            self.run_once(sources)?;
            iterations += 1;
        }

        info!("Disconnect requested, reactor stopped after {} iterations", iterations);
        Ok(())
    }

    /// One iteration: build the wait set, wait, dispatch
    pub fn run_once<S: EventSources + ?Sized>(&mut self, sources: &mut S) -> Result<()> {
        let wait_set = WaitSet::build(sources.display_fd(), sources.session_handles(), self.max_handles)?;
        let queued = sources.prepare_wait()?;

        let ready = self.wait(&wait_set, queued)?;
        trace!(
            "Wait returned: display={} session={} queued={}",
            ready.display,
            ready.session,
            queued
        );

        if ready.display || queued {
            sources.dispatch_display()?;
        }
        if ready.session {
            sources.dispatch_session()?;
        }
        Ok(())
    }

    fn wait(&mut self, wait_set: &WaitSet, queued: bool) -> Result<Readiness> {
        wait_set.register(self.poll.registry())?;

        // Events already queued in-process will not show up on the fd
        let timeout = queued.then_some(Duration::ZERO);
        let result = wait_outcome(self.poll.poll(&mut self.events, timeout));

        wait_set.deregister(self.poll.registry());
        let mut ready = Readiness::default();
        if !result? {
            return Ok(ready);
        }

        for event in self.events.iter() {
            if event.token() == DISPLAY_TOKEN {
                ready.display = true;
            } else {
                ready.session = true;
            }
        }
        Ok(ready)
    }
}

/// Whether a finished wait has events to read; an interrupted wait has none
fn wait_outcome(result: io::Result<()>) -> Result<bool> {
    match result {
        Ok(()) => Ok(true),
        // A signal: report nothing ready so the loop re-checks for disconnect
        Err(e) if e.kind() == ErrorKind::Interrupted => {
            debug!("Wait interrupted by a signal");
            Ok(false)
        }
        Err(e) => Err(PipelineError::ReactorFatal(format!("wait failed: {}", e))),
    }
}
