//! Timers that drive the poll loop.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Interval, MissedTickBehavior};

/// Source of poll ticks.
#[async_trait]
pub trait Ticker: Send {
    /// Wait for the next tick. `false` means no more ticks will come.
    async fn tick(&mut self) -> bool;
}

/// Ticks on a fixed period, starting immediately.
///
/// A slow poll delays the following ticks instead of bursting to catch up.
#[derive(Debug)]
pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&mut self) -> bool {
        self.interval.tick().await;
        true
    }
}

/// Ticker driven by a [`TickDriver`], for tests and step-by-step tools.
#[derive(Debug)]
pub struct ManualTicker {
    ticks: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
    in_flight: Option<oneshot::Sender<()>>,
}

/// Handle that fires a [`ManualTicker`].
#[derive(Debug, Clone)]
pub struct TickDriver {
    ticks: mpsc::UnboundedSender<oneshot::Sender<()>>,
}

impl ManualTicker {
    /// Create a ticker and the driver that fires it.
    pub fn new() -> (Self, TickDriver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                ticks: rx,
                in_flight: None,
            },
            TickDriver { ticks: tx },
        )
    }
}

#[async_trait]
impl Ticker for ManualTicker {
    async fn tick(&mut self) -> bool {
        // Asking for the next tick means the previous one has been handled.
        if let Some(done) = self.in_flight.take() {
            let _ = done.send(());
        }
        match self.ticks.recv().await {
            Some(done) => {
                self.in_flight = Some(done);
                true
            }
            None => false,
        }
    }
}

impl TickDriver {
    /// Fire one tick and wait until the consumer has handled it.
    ///
    /// Returns `false` once the consumer has stopped, including when it stops
    /// while handling this tick.
    pub async fn tick(&self) -> bool {
        let (done_tx, done_rx) = oneshot::channel();
        if self.ticks.send(done_tx).is_err() {
            return false;
        }
        done_rx.await.is_ok()
    }

    /// Fire up to `count` ticks, stopping early when the consumer stops.
    /// Returns the number of ticks handled with the consumer still running.
    pub async fn tick_n(&self, count: usize) -> usize {
        for handled in 0..count {
            if !self.tick().await {
                return handled;
            }
        }
        count
    }
}
