//! Run context: cooperative cancellation and progress reporting.
//!
//! A [`RunContext`] travels with every long-running operation (power
//! sequence, scan, full sequence). Cancellation is cooperative only: the
//! flag is checked once per scan point / once per power-sequence item, never
//! preempting an in-flight hardware command.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Progress update emitted while a scan runs.
///
/// `percent` is in `[0, 100]` and non-decreasing within one scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProgressEvent {
    pub percent: u8,
}

/// Shared context for one run: a stop flag plus an optional progress sink.
#[derive(Clone, Default)]
pub struct RunContext {
    cancel: Arc<AtomicBool>,
    progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a progress sink. Events are dropped if the receiver is gone;
    /// a slow consumer never stalls the scan.
    pub fn with_progress(progress: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self {
            cancel: Arc::new(AtomicBool::new(false)),
            progress: Some(progress),
        }
    }

    /// Requests a cooperative stop. The current hardware command completes;
    /// the next checkpoint observes the flag.
    pub fn request_stop(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Clone of the underlying stop flag, for wiring into signal handlers.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn report_progress(&self, percent: u8) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(ProgressEvent { percent });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_flag_round_trip() {
        let ctx = RunContext::new();
        assert!(!ctx.is_cancelled());
        ctx.request_stop();
        assert!(ctx.is_cancelled());
        // Clones observe the same flag.
        assert!(ctx.clone().is_cancelled());
    }

    #[tokio::test]
    async fn test_progress_events_delivered() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = RunContext::with_progress(tx);
        ctx.report_progress(50);
        ctx.report_progress(100);
        assert_eq!(rx.recv().await.unwrap().percent, 50);
        assert_eq!(rx.recv().await.unwrap().percent, 100);
    }

    #[test]
    fn test_progress_without_sink_is_noop() {
        let ctx = RunContext::new();
        ctx.report_progress(10);
    }
}
