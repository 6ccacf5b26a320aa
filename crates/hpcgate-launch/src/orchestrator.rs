//! Job lifecycle: submit, poll, tunnel once, cancel.
//!
//! ```text
//! Unsubmitted --submit--> Submitted --> { Pending <-> Running } --> { Completed | Vanished }
//!      |                      |                  |
//!      +------cancel----------+------cancel------+--> Cancelled
//!                                     poll budget exhausted --> Failed
//! ```
//!
//! Each submitted [`JobHandle`] owns one tokio task running the poll loop. The
//! loop is the only writer of the job snapshot; callers read it through
//! [`JobHandle::status`] and follow progress with [`JobHandle::next_event`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::{LaunchConfig, TimingConfig};
use crate::context::LaunchContext;
use crate::error::{LaunchError, LaunchResult};
use crate::job::{ForwardedPort, JobSnapshot, JobSpec, JobState};
use crate::slurm::{PollOutcome, SlurmAdapter};
use crate::ticker::{IntervalTicker, Ticker};
use crate::transport::RemoteExecutor;
use crate::tunnel::{TunnelLauncher, TunnelManager, TunnelSession};

/// Something that happened to a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    /// The job moved between states.
    StateChanged { from: JobState, to: JobState },
    /// The port forward to the compute node is up.
    TunnelOpened {
        node: String,
        ports: Vec<ForwardedPort>,
    },
    /// A tunnel attempt failed; it is retried on the next poll.
    TunnelFailed { attempt: u32, error: String },
    /// No more tunnel attempts will be made. The job keeps running.
    TunnelGaveUp { attempts: u32 },
    /// The job reached a terminal state. Sent exactly once.
    Terminal(JobSnapshot),
}

/// Launches jobs on one cluster.
pub struct Orchestrator {
    config: LaunchConfig,
    launcher: Arc<dyn TunnelLauncher>,
    context: Arc<LaunchContext>,
    adapter: Arc<SlurmAdapter>,
}

impl Orchestrator {
    /// Create an orchestrator from a configuration and its I/O seams.
    pub fn new(
        config: LaunchConfig,
        executor: Arc<dyn RemoteExecutor>,
        launcher: Arc<dyn TunnelLauncher>,
    ) -> Self {
        let context = Arc::new(LaunchContext::new(config.slurm.job_name.clone()));
        let adapter = SlurmAdapter::new(
            config.route.clone(),
            executor,
            config.timing.clone(),
            context.clone(),
        )
        .with_agent_check(config.require_agent);

        Self {
            config,
            launcher,
            context,
            adapter: Arc::new(adapter),
        }
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    /// Counters shared by every job of this orchestrator.
    pub fn context(&self) -> &Arc<LaunchContext> {
        &self.context
    }

    /// Create a handle for `spec` without submitting it.
    pub fn prepare(&self, spec: JobSpec) -> JobHandle {
        let (status_tx, status_rx) = watch::channel(JobSnapshot::unsubmitted());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        JobHandle {
            spec,
            adapter: self.adapter.clone(),
            launcher: self.launcher.clone(),
            context: self.context.clone(),
            timing: self.config.timing.clone(),
            status_tx: Arc::new(status_tx),
            status_rx,
            events_tx,
            events_rx,
            cancel: CancellationToken::new(),
            terminal_sent: Arc::new(AtomicBool::new(false)),
            terminal_seen: false,
            task: None,
        }
    }

    /// Submit `spec` and start polling it every `poll_interval_secs`.
    ///
    /// Returns once the scheduler has assigned a job id.
    pub async fn submit(&self, spec: JobSpec) -> LaunchResult<JobHandle> {
        let mut handle = self.prepare(spec);
        handle.submit().await?;
        Ok(handle)
    }

    /// Like [`Orchestrator::submit`], polling on `ticker` instead.
    pub async fn launch_with_ticker<T>(&self, spec: JobSpec, ticker: T) -> LaunchResult<JobHandle>
    where
        T: Ticker + 'static,
    {
        let mut handle = self.prepare(spec);
        handle.submit_with_ticker(ticker).await?;
        Ok(handle)
    }

    /// Cancel a job by id, e.g. one submitted by an earlier process.
    pub async fn cancel_remote(&self, job_id: u64) -> LaunchResult<()> {
        self.adapter.route().validate()?;
        self.adapter.cancel(job_id).await
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("adapter", &self.adapter)
            .finish_non_exhaustive()
    }
}

/// One job, from preparation to its terminal state.
///
/// Dropping the handle cancels the job.
pub struct JobHandle {
    spec: JobSpec,
    adapter: Arc<SlurmAdapter>,
    launcher: Arc<dyn TunnelLauncher>,
    context: Arc<LaunchContext>,
    timing: TimingConfig,
    status_tx: Arc<watch::Sender<JobSnapshot>>,
    status_rx: watch::Receiver<JobSnapshot>,
    events_tx: mpsc::UnboundedSender<JobEvent>,
    events_rx: mpsc::UnboundedReceiver<JobEvent>,
    cancel: CancellationToken,
    terminal_sent: Arc<AtomicBool>,
    terminal_seen: bool,
    task: Option<JoinHandle<()>>,
}

impl JobHandle {
    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    /// Current snapshot. Never blocks.
    pub fn status(&self) -> JobSnapshot {
        self.status_rx.borrow().clone()
    }

    /// A receiver that sees every snapshot update.
    pub fn watch_status(&self) -> watch::Receiver<JobSnapshot> {
        self.status_rx.clone()
    }

    /// Scheduler job id, once submitted.
    pub fn job_id(&self) -> Option<u64> {
        self.status_rx.borrow().job_id
    }

    /// Submit the job and start polling every `poll_interval_secs`.
    pub async fn submit(&mut self) -> LaunchResult<u64> {
        let ticker = IntervalTicker::new(self.timing.poll_interval());
        self.submit_with_ticker(ticker).await
    }

    /// Submit the job and start polling on `ticker`.
    ///
    /// Fails with `Cancelled` (without touching the network) after `cancel()`,
    /// and with `InvalidState` when the job was already submitted.
    pub async fn submit_with_ticker<T>(&mut self, ticker: T) -> LaunchResult<u64>
    where
        T: Ticker + 'static,
    {
        if self.cancel.is_cancelled() {
            return Err(LaunchError::Cancelled(
                "job was cancelled before submission".to_string(),
            ));
        }
        let found = self.status_rx.borrow().state;
        if self.task.is_some() || found != JobState::Unsubmitted {
            return Err(LaunchError::InvalidState {
                expected: JobState::Unsubmitted.to_string(),
                found: found.to_string(),
            });
        }

        let job_id = self.adapter.submit(&self.spec).await?;
        self.status_tx.send_modify(|snapshot| {
            snapshot.job_id = Some(job_id);
            snapshot.state = JobState::Submitted;
            snapshot.submitted_at = Some(Utc::now());
        });
        let _ = self.events_tx.send(JobEvent::StateChanged {
            from: JobState::Unsubmitted,
            to: JobState::Submitted,
        });

        let poll_loop = PollLoop {
            job_id,
            adapter: self.adapter.clone(),
            tunnel: TunnelManager::new(
                self.launcher.clone(),
                self.context.clone(),
                self.timing.max_tunnel_attempts,
            ),
            ports: self.spec.connection.forwarded_ports(),
            status: self.status_tx.clone(),
            events: self.events_tx.clone(),
            cancel: self.cancel.clone(),
            terminal_sent: self.terminal_sent.clone(),
            max_poll_failures: self.timing.max_poll_failures,
            consecutive_failures: 0,
            tunnel_exit_reported: false,
        };
        let span = tracing::info_span!("poll_loop", label = self.context.label(), job_id);
        self.task = Some(tokio::spawn(poll_loop.run(ticker).instrument(span)));

        Ok(job_id)
    }

    /// Stop the job. Never blocks and never fails.
    ///
    /// Before submission the handle becomes `Cancelled`. Afterwards the poll
    /// loop tears down the tunnel and cancels the remote job. Repeated calls
    /// are no-ops.
    pub fn cancel(&self) {
        self.cancel.cancel();
        if self.job_id().is_none() && !self.terminal_sent.swap(true, Ordering::SeqCst) {
            self.status_tx.send_modify(|snapshot| snapshot.state = JobState::Cancelled);
            let _ = self.events_tx.send(JobEvent::StateChanged {
                from: JobState::Unsubmitted,
                to: JobState::Cancelled,
            });
            let _ = self.events_tx.send(JobEvent::Terminal(self.status()));
            tracing::info!(job_name = %self.spec.job_name, "Job cancelled before submission");
        }
    }

    /// Cancel and wait for the poll loop to finish its teardown.
    pub async fn shutdown(&mut self) {
        self.cancel();
        self.wait().await;
    }

    /// Wait for the poll loop to stop on its own.
    pub async fn wait(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "Poll loop task failed");
            }
        }
    }

    /// Next event, or `None` once `Terminal` has been delivered.
    pub async fn next_event(&mut self) -> Option<JobEvent> {
        if self.terminal_seen {
            return None;
        }
        let event = self.events_rx.recv().await;
        self.terminal_seen = matches!(event, Some(JobEvent::Terminal(_)));
        event
    }

    /// Next event if one is already queued.
    pub fn try_next_event(&mut self) -> Option<JobEvent> {
        if self.terminal_seen {
            return None;
        }
        let event = self.events_rx.try_recv().ok();
        self.terminal_seen = matches!(event, Some(JobEvent::Terminal(_)));
        event
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("job_name", &self.spec.job_name)
            .field("status", &*self.status_rx.borrow())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// The background task behind a submitted [`JobHandle`].
struct PollLoop {
    job_id: u64,
    adapter: Arc<SlurmAdapter>,
    tunnel: TunnelManager,
    ports: BTreeSet<ForwardedPort>,
    status: Arc<watch::Sender<JobSnapshot>>,
    events: mpsc::UnboundedSender<JobEvent>,
    cancel: CancellationToken,
    terminal_sent: Arc<AtomicBool>,
    max_poll_failures: u32,
    consecutive_failures: u32,
    tunnel_exit_reported: bool,
}

impl PollLoop {
    async fn run<T: Ticker>(mut self, mut ticker: T) {
        let job_id = self.job_id;
        tracing::debug!(job_id, "Poll loop started");

        loop {
            let ticked = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                ticked = ticker.tick() => Some(ticked),
            };
            match ticked {
                None => return self.finish(JobState::Cancelled, None).await,
                Some(false) => {
                    tracing::debug!(job_id, "Ticker stopped, cancelling job");
                    return self.finish(JobState::Cancelled, None).await;
                }
                Some(true) => {}
            }

            let polled = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                result = self.adapter.poll(job_id) => Some(result),
            };
            let Some(result) = polled else {
                return self.finish(JobState::Cancelled, None).await;
            };

            if let Some((terminal, reason)) = self.observe(result).await {
                return self.finish(terminal, reason).await;
            }
        }
    }

    /// Apply one poll result. Returns the terminal state to finish with, if any,
    /// and the error that caused it.
    async fn observe(
        &mut self,
        result: LaunchResult<PollOutcome>,
    ) -> Option<(JobState, Option<LaunchError>)> {
        let job_id = self.job_id;
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                self.consecutive_failures += 1;
                self.status
                    .send_modify(|snapshot| snapshot.last_polled_at = Some(Utc::now()));
                if !err.is_retryable() || self.consecutive_failures > self.max_poll_failures {
                    tracing::error!(
                        job_id,
                        error = %err,
                        failures = self.consecutive_failures,
                        "Giving up on polling the job"
                    );
                    return Some((JobState::Failed, Some(err)));
                }
                tracing::warn!(
                    job_id,
                    error = %err,
                    failures = self.consecutive_failures,
                    "Poll failed, retrying on next tick"
                );
                return None;
            }
        };
        self.consecutive_failures = 0;

        if outcome.state.is_terminal() {
            self.status
                .send_modify(|snapshot| snapshot.last_polled_at = Some(Utc::now()));
            let reason =
                (outcome.state == JobState::Vanished).then(|| LaunchError::VanishedJob(job_id));
            return Some((outcome.state, reason));
        }

        let previous = self.status.borrow().state;
        self.status.send_modify(|snapshot| {
            snapshot.state = outcome.state;
            snapshot.last_polled_at = Some(Utc::now());
            if outcome.state == JobState::Running {
                snapshot.exec_node = outcome.node.clone();
                snapshot.estimated_start = None;
            } else {
                snapshot.exec_node = None;
                snapshot.estimated_start = outcome.eta.clone();
            }
        });
        if previous != outcome.state {
            tracing::info!(
                job_id,
                state = %outcome.state,
                node = ?outcome.node,
                eta = ?outcome.eta,
                "Job state changed"
            );
            self.emit(JobEvent::StateChanged {
                from: previous,
                to: outcome.state,
            });
        }

        if outcome.state == JobState::Running {
            if let Some(node) = outcome.node {
                self.ensure_tunnel(&node).await;
            }
        }
        None
    }

    /// Open the tunnel the first time the job is seen running on a node.
    async fn ensure_tunnel(&mut self, node: &str) {
        if self.tunnel.is_active() {
            if !self.tunnel_exit_reported && !self.tunnel.process_alive() {
                tracing::warn!(job_id = self.job_id, node, "SSH tunnel process exited");
                self.tunnel_exit_reported = true;
            }
            return;
        }
        if self.tunnel.gave_up() {
            return;
        }

        let route = self.adapter.route().clone();
        match self.tunnel.open(&route, node, self.ports.clone()).await {
            Ok(true) => {
                self.status.send_modify(|snapshot| snapshot.tunnel_active = true);
                tracing::info!(
                    job_id = self.job_id,
                    node,
                    pid = ?self.tunnel.session().and_then(TunnelSession::pid),
                    "Job is ready on compute node"
                );
                self.emit(JobEvent::TunnelOpened {
                    node: node.to_string(),
                    ports: self.ports.iter().cloned().collect(),
                });
            }
            Ok(false) => {}
            Err(err) => {
                let attempt = self.tunnel.attempts();
                tracing::warn!(job_id = self.job_id, node, attempt, error = %err, "Tunnel attempt failed");
                self.emit(JobEvent::TunnelFailed {
                    attempt,
                    error: err.to_string(),
                });
                if self.tunnel.gave_up() {
                    tracing::error!(
                        job_id = self.job_id,
                        node,
                        attempts = attempt,
                        "Giving up on the SSH tunnel; the job keeps running"
                    );
                    self.emit(JobEvent::TunnelGaveUp { attempts: attempt });
                }
            }
        }
    }

    /// Tear down and publish the terminal state.
    async fn finish(mut self, state: JobState, reason: Option<LaunchError>) {
        let job_id = self.job_id;
        self.tunnel.close().await;

        // Completed jobs are already out of the scheduler's hands.
        if state != JobState::Completed {
            if let Err(err) = self.adapter.cancel(job_id).await {
                tracing::warn!(job_id, error = %err, "Best-effort scancel failed");
            }
        }

        let previous = self.status.borrow().state;
        self.status.send_modify(|snapshot| {
            snapshot.state = state;
            snapshot.exec_node = None;
            snapshot.tunnel_active = false;
            snapshot.reason = reason.as_ref().map(ToString::to_string);
        });

        match reason {
            None => tracing::info!(job_id, state = %state, "Job finished"),
            Some(err) => {
                tracing::error!(job_id, state = %state, error = %err, "Job ended abnormally");
            }
        }

        if !self.terminal_sent.swap(true, Ordering::SeqCst) {
            if previous != state {
                self.emit(JobEvent::StateChanged {
                    from: previous,
                    to: state,
                });
            }
            let snapshot = self.status.borrow().clone();
            self.emit(JobEvent::Terminal(snapshot));
        }
    }

    fn emit(&self, event: JobEvent) {
        // The handle may already be gone; the job still runs to completion.
        let _ = self.events.send(event);
    }
}
