//! In-process tunnel launcher for tests.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{LaunchError, LaunchResult};
use crate::tunnel::{ForwardPlan, TunnelLauncher, TunnelProcess};

/// Launcher that records plans and hands out fake processes.
#[derive(Debug, Default)]
pub struct MockTunnelLauncher {
    plans: Mutex<Vec<ForwardPlan>>,
    failures_left: AtomicUsize,
    stops: Arc<AtomicUsize>,
    next_pid: AtomicU32,
}

impl MockTunnelLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `count` launches with a `TunnelError`.
    pub fn failing_first(self, count: usize) -> Self {
        self.failures_left.store(count, Ordering::SeqCst);
        self
    }

    /// Number of launch calls, failed ones included.
    pub fn launches(&self) -> usize {
        self.plans().len()
    }

    /// Number of `stop` calls across all processes.
    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Every plan passed to `launch`, in order.
    pub fn plans(&self) -> Vec<ForwardPlan> {
        self.plans
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl TunnelLauncher for MockTunnelLauncher {
    async fn launch(&self, plan: &ForwardPlan) -> LaunchResult<Box<dyn TunnelProcess>> {
        self.plans
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(plan.clone());

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(LaunchError::TunnelError(format!(
                "channel to {} refused",
                plan.target_node
            )));
        }

        Ok(Box::new(MockTunnelProcess {
            pid: 40_000 + self.next_pid.fetch_add(1, Ordering::SeqCst),
            alive: true,
            stops: self.stops.clone(),
        }))
    }
}

#[derive(Debug)]
struct MockTunnelProcess {
    pid: u32,
    alive: bool,
    stops: Arc<AtomicUsize>,
}

#[async_trait]
impl TunnelProcess for MockTunnelProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn is_alive(&mut self) -> bool {
        self.alive
    }

    async fn stop(&mut self) -> LaunchResult<()> {
        self.alive = false;
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
