//! Presentation gate
//!
//! Single-slot flow control in front of the presentation backend: at most
//! one submission in flight, and any damage observed meanwhile collapses into
//! one pending flag that triggers a catch-up submission on completion.

use tracing::{debug, trace};

use super::Result;

/// Result of a submission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The buffer was handed to the backend
    Submitted,
    /// A submission is in flight; the request is remembered as pending
    Deferred,
    /// Nothing to do
    Idle,
}

/// Two-flag submission latch; `{pending: false, inflight: false}` is both the
/// initial and the resting state.
#[derive(Debug, Default, Clone)]
pub struct PresentationGate {
    pending: bool,
    inflight: bool,
    submissions: u64,
}

impl PresentationGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> bool {
        self.pending
    }

    pub fn inflight(&self) -> bool {
        self.inflight
    }

    /// Submissions issued since creation
    pub fn submissions(&self) -> u64 {
        self.submissions
    }

    /// True in the resting state
    pub fn is_idle(&self) -> bool {
        !self.pending && !self.inflight
    }

    /// Submit now if nothing is in flight, otherwise remember the request.
    ///
    /// If `submit` fails, `inflight` stays false and `pending` is set, so the
    /// damage is retried by the next request.
    pub fn request_submit<F>(&mut self, submit: F) -> Result<SubmitOutcome>
    where
        F: FnOnce() -> Result<()>,
    {
        if self.inflight {
            trace!("Submission in flight, marking damage pending");
            self.pending = true;
            return Ok(SubmitOutcome::Deferred);
        }

        if let Err(e) = submit() {
            self.pending = true;
            return Err(e);
        }

        self.inflight = true;
        self.pending = false;
        self.submissions += 1;
        trace!("Submission #{} issued", self.submissions);
        Ok(SubmitOutcome::Submitted)
    }

    /// Handle the backend's completion signal and run the catch-up
    /// submission when damage accrued while it was in flight.
    pub fn on_submission_complete<F>(&mut self, submit: F) -> Result<SubmitOutcome>
    where
        F: FnOnce() -> Result<()>,
    {
        if !self.inflight {
            debug!("Frame completion without an outstanding submission");
        }
        self.inflight = false;

        if self.pending {
            return self.request_submit(submit);
        }
        Ok(SubmitOutcome::Idle)
    }

    /// Return to the resting state (surface torn down)
    pub fn reset(&mut self) {
        self.pending = false;
        self.inflight = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineError;

    fn ok() -> Result<()> {
        Ok(())
    }

    #[test]
    fn test_first_request_submits() {
        let mut gate = PresentationGate::new();
        assert!(gate.is_idle());

        assert_eq!(gate.request_submit(ok).unwrap(), SubmitOutcome::Submitted);
        assert!(gate.inflight());
        assert!(!gate.pending());
    }

    #[test]
    fn test_requests_while_inflight_coalesce() {
        for n in 1..=16 {
            let mut gate = PresentationGate::new();
            let mut submitted = 0;

            gate.request_submit(|| {
                submitted += 1;
                Ok(())
            })
            .unwrap();

            for _ in 0..n {
                let outcome = gate
                    .request_submit(|| {
                        submitted += 1;
                        Ok(())
                    })
                    .unwrap();
                assert_eq!(outcome, SubmitOutcome::Deferred);
            }
            assert_eq!(submitted, 1);

            let outcome = gate
                .on_submission_complete(|| {
                    submitted += 1;
                    Ok(())
                })
                .unwrap();
            assert_eq!(outcome, SubmitOutcome::Submitted);
            assert_eq!(submitted, 2, "exactly one catch-up for n = {}", n);

            let outcome = gate
                .on_submission_complete(|| {
                    submitted += 1;
                    Ok(())
                })
                .unwrap();
            assert_eq!(outcome, SubmitOutcome::Idle);
            assert_eq!(submitted, 2);
            assert!(gate.is_idle());
        }
    }

    #[test]
    fn test_completion_without_pending_rests() {
        let mut gate = PresentationGate::new();
        gate.request_submit(ok).unwrap();

        assert_eq!(gate.on_submission_complete(ok).unwrap(), SubmitOutcome::Idle);
        assert!(gate.is_idle());
        assert_eq!(gate.submissions(), 1);
    }

    #[test]
    fn test_failed_submit_keeps_damage_pending() {
        let mut gate = PresentationGate::new();

        let err = gate
            .request_submit(|| Err(PipelineError::BackendFailure("broken pipe".into())))
            .unwrap_err();
        assert!(matches!(err, PipelineError::BackendFailure(_)));
        assert!(!gate.inflight());
        assert!(gate.pending());

        assert_eq!(gate.request_submit(ok).unwrap(), SubmitOutcome::Submitted);
        assert!(!gate.pending());
    }

    #[test]
    fn test_spurious_completion_is_harmless() {
        let mut gate = PresentationGate::new();
        assert_eq!(gate.on_submission_complete(ok).unwrap(), SubmitOutcome::Idle);
        assert!(gate.is_idle());
    }
}
