//! Orchestrator-owned context shared with every component of one launch.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters and labels for one orchestrator.
///
/// Created by the orchestrator and handed to the adapter and tunnel manager
/// through an `Arc`, so nothing in the crate keeps process-wide state.
#[derive(Debug, Default)]
pub struct LaunchContext {
    label: String,
    submissions: AtomicU64,
    polls: AtomicU64,
    poll_failures: AtomicU64,
    tunnel_opens: AtomicU64,
    tunnel_failures: AtomicU64,
    cancellations: AtomicU64,
}

/// Point-in-time copy of the context counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LaunchStats {
    pub submissions: u64,
    pub polls: u64,
    pub poll_failures: u64,
    pub tunnel_opens: u64,
    pub tunnel_failures: u64,
    pub cancellations: u64,
}

impl LaunchContext {
    /// Create a context labelled `label` (used as a log field).
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Default::default()
        }
    }

    /// The label given at construction.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn record_submission(&self) {
        self.submissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll(&self, ok: bool) {
        self.polls.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.poll_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_tunnel_open(&self, ok: bool) {
        if ok {
            self.tunnel_opens.fetch_add(1, Ordering::Relaxed);
        } else {
            self.tunnel_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_cancellation(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters.
    pub fn stats(&self) -> LaunchStats {
        LaunchStats {
            submissions: self.submissions.load(Ordering::Relaxed),
            polls: self.polls.load(Ordering::Relaxed),
            poll_failures: self.poll_failures.load(Ordering::Relaxed),
            tunnel_opens: self.tunnel_opens.load(Ordering::Relaxed),
            tunnel_failures: self.tunnel_failures.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let ctx = LaunchContext::new("kernel-a");
        ctx.record_submission();
        ctx.record_poll(true);
        ctx.record_poll(false);
        ctx.record_tunnel_open(false);
        ctx.record_tunnel_open(true);
        ctx.record_cancellation();

        assert_eq!(ctx.label(), "kernel-a");
        assert_eq!(
            ctx.stats(),
            LaunchStats {
                submissions: 1,
                polls: 2,
                poll_failures: 1,
                tunnel_opens: 1,
                tunnel_failures: 1,
                cancellations: 1,
            }
        );
    }
}
