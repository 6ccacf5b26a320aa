//! Orchestrator Integration Tests
//!
//! These tests drive complete job lifecycles against scripted SSH executors
//! and in-process tunnel launchers. No network access or cluster is needed.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hpcgate_launch::{
    ConnectionDescriptor, ExecOutput, JUPYTER_PORT_NAMES, JobEvent, JobSpec, JobState,
    LaunchConfig, LaunchError, LaunchResult, ManualTicker, MockTunnelLauncher, Orchestrator,
    RemoteCommand, RemoteExecutor, ScriptedExecutor, ScriptedReply, SshRoute,
};

fn cluster_config() -> LaunchConfig {
    let mut config = LaunchConfig::default();
    config.route = SshRoute::new("login.cluster.edu", "alice");
    config.require_agent = false;
    config
}

/// A Jupyter connection file with five ports.
fn kernel_connection() -> ConnectionDescriptor {
    JUPYTER_PORT_NAMES
        .iter()
        .zip(50001u16..)
        .fold(ConnectionDescriptor::new(), |descriptor, (name, port)| {
            descriptor.with_port(*name, port)
        })
        .with_field("ip", "127.0.0.1")
        .with_field("transport", "tcp")
        .with_field("key", "a0436f6c-1916-498b-8eb9-e81ab9368e84")
}

fn kernel_spec() -> JobSpec {
    JobSpec::new(["python", "-m", "ipykernel_launcher", "-f", "{connection_file}"])
        .with_flag("account", "x")
        .with_flag("time", "00:10:00")
        .with_connection(kernel_connection())
}

async fn drain_events(handle: &mut hpcgate_launch::JobHandle) -> Vec<JobEvent> {
    let mut events = Vec::new();
    while let Some(event) = handle.next_event().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_kernel_launch_end_to_end() {
    let executor = Arc::new(
        ScriptedExecutor::new()
            .on("sbatch", [ScriptedReply::stdout("4821\n")])
            .on(
                "squeue",
                [
                    ScriptedReply::stdout("PENDING N/A\n"),
                    ScriptedReply::stdout("PENDING N/A\n"),
                    ScriptedReply::stdout("PENDING N/A\n"),
                    ScriptedReply::stdout("RUNNING n12\n"),
                ],
            ),
    );
    let launcher = Arc::new(MockTunnelLauncher::new());
    let orchestrator = Orchestrator::new(cluster_config(), executor.clone(), launcher.clone());

    let (ticker, driver) = ManualTicker::new();
    let mut handle = orchestrator
        .launch_with_ticker(kernel_spec(), ticker)
        .await
        .unwrap();
    assert_eq!(handle.job_id(), Some(4821));

    assert_eq!(driver.tick_n(3).await, 3);
    assert_eq!(handle.status().state, JobState::Pending);
    assert_eq!(launcher.launches(), 0);

    assert!(driver.tick().await);
    let status = handle.status();
    assert_eq!(status.state, JobState::Running);
    assert_eq!(status.exec_node.as_deref(), Some("n12"));
    assert!(status.tunnel_active);

    // The batch script went over stdin.
    let submit = &executor.calls()[0];
    assert_eq!(submit.command.argv, vec!["sbatch", "--parsable"]);
    let script = submit.command.stdin.as_deref().unwrap();
    assert!(script.contains("#SBATCH --account=x\n"));
    assert!(script.contains("#SBATCH --time=00:10:00\n"));
    assert!(script.contains("\"hb_port\":50004"));

    // One tunnel to n12 through the login host, forwarding all five ports.
    let plans = launcher.plans();
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].target_node, "n12");
    assert_eq!(plans[0].hops(), vec!["alice@login.cluster.edu"]);
    assert_eq!(plans[0].ports.len(), 5);
    let args = plans[0].ssh_args();
    for port in 50001..=50005 {
        assert!(args.contains(&format!("{port}:127.0.0.1:{port}")));
    }

    handle.shutdown().await;
    assert_eq!(handle.status().state, JobState::Cancelled);
    assert_eq!(launcher.stops(), 1);
    assert_eq!(executor.call_count("scancel"), 1);

    let events = drain_events(&mut handle).await;
    let transitions: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            JobEvent::StateChanged { to, .. } => Some(*to),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            JobState::Submitted,
            JobState::Pending,
            JobState::Running,
            JobState::Cancelled
        ]
    );
    assert!(events.iter().any(|event| matches!(
        event,
        JobEvent::TunnelOpened { node, ports } if node == "n12" && ports.len() == 5
    )));
    assert!(matches!(events.last(), Some(JobEvent::Terminal(snapshot)) if snapshot.state == JobState::Cancelled));
}

#[tokio::test]
async fn test_missing_configuration_makes_no_transport_calls() {
    let executor = Arc::new(ScriptedExecutor::new());
    let launcher = Arc::new(MockTunnelLauncher::new());

    let mut no_login = cluster_config();
    no_login.route.login_host.clear();
    let mut no_user = cluster_config();
    no_user.route.username.clear();

    let cases = [
        (cluster_config(), JobSpec::new(["python"])),
        (no_login, kernel_spec()),
        (no_user, kernel_spec()),
    ];
    for (config, spec) in cases {
        let orchestrator = Orchestrator::new(config, executor.clone(), launcher.clone());
        let result = orchestrator.submit(spec).await;
        assert!(matches!(
            result.err(),
            Some(LaunchError::ConfigurationError(_))
        ));
    }

    assert_eq!(executor.total_calls(), 0);
    assert_eq!(launcher.launches(), 0);
}

#[tokio::test]
async fn test_tunnel_opens_exactly_once() {
    let executor = Arc::new(
        ScriptedExecutor::new()
            .on("sbatch", [ScriptedReply::stdout("100")])
            .on(
                "squeue",
                [
                    ScriptedReply::stdout("PENDING"),
                    ScriptedReply::stdout("RUNNING n1"),
                    ScriptedReply::stdout("RUNNING n1"),
                ],
            ),
    );
    let launcher = Arc::new(MockTunnelLauncher::new());
    let orchestrator = Orchestrator::new(cluster_config(), executor, launcher.clone());

    let (ticker, driver) = ManualTicker::new();
    let mut handle = orchestrator
        .launch_with_ticker(kernel_spec(), ticker)
        .await
        .unwrap();
    assert_eq!(driver.tick_n(3).await, 3);

    assert_eq!(launcher.launches(), 1);
    handle.shutdown().await;
}

#[tokio::test]
async fn test_cancel_before_submit() {
    let executor = Arc::new(ScriptedExecutor::new());
    let orchestrator = Orchestrator::new(
        cluster_config(),
        executor.clone(),
        Arc::new(MockTunnelLauncher::new()),
    );

    let mut handle = orchestrator.prepare(kernel_spec());
    handle.cancel();
    handle.cancel();
    assert_eq!(handle.status().state, JobState::Cancelled);

    assert!(matches!(
        handle.submit().await,
        Err(LaunchError::Cancelled(_))
    ));
    assert_eq!(executor.total_calls(), 0);

    let events = drain_events(&mut handle).await;
    let terminals = events
        .iter()
        .filter(|event| matches!(event, JobEvent::Terminal(_)))
        .count();
    assert_eq!(terminals, 1);
}

#[tokio::test]
async fn test_cancel_after_submit_is_idempotent() {
    let executor = Arc::new(
        ScriptedExecutor::new()
            .on("sbatch", [ScriptedReply::stdout("200")])
            .on("squeue", [ScriptedReply::stdout("RUNNING n5")]),
    );
    let launcher = Arc::new(MockTunnelLauncher::new());
    let orchestrator = Orchestrator::new(cluster_config(), executor.clone(), launcher.clone());

    let (ticker, driver) = ManualTicker::new();
    let mut handle = orchestrator
        .launch_with_ticker(kernel_spec(), ticker)
        .await
        .unwrap();
    assert!(driver.tick().await);
    assert!(handle.status().tunnel_active);

    handle.cancel();
    handle.cancel();
    handle.shutdown().await;
    handle.shutdown().await;
    handle.cancel();

    assert!(!driver.tick().await);
    assert_eq!(handle.status().state, JobState::Cancelled);
    assert!(!handle.status().tunnel_active);
    assert_eq!(launcher.stops(), 1);
    assert_eq!(executor.call_count("scancel"), 1);
    assert_eq!(orchestrator.context().stats().cancellations, 1);

    let events = drain_events(&mut handle).await;
    let terminals = events
        .iter()
        .filter(|event| matches!(event, JobEvent::Terminal(_)))
        .count();
    assert_eq!(terminals, 1);
}

#[tokio::test]
async fn test_vanished_job_is_torn_down() {
    let executor = Arc::new(
        ScriptedExecutor::new()
            .on("sbatch", [ScriptedReply::stdout("300")])
            .on(
                "squeue",
                [ScriptedReply::stdout("RUNNING n9"), ScriptedReply::stdout("")],
            ),
    );
    let launcher = Arc::new(MockTunnelLauncher::new());
    let orchestrator = Orchestrator::new(cluster_config(), executor.clone(), launcher.clone());

    let (ticker, driver) = ManualTicker::new();
    let mut handle = orchestrator
        .launch_with_ticker(kernel_spec(), ticker)
        .await
        .unwrap();
    assert!(driver.tick().await);
    assert!(!driver.tick().await);
    handle.wait().await;

    let status = handle.status();
    assert_eq!(status.state, JobState::Vanished);
    assert_eq!(status.reason.as_deref(), Some("Job 300 vanished from the queue"));
    assert_eq!(status.exec_node, None);
    assert!(!status.tunnel_active);
    assert_eq!(launcher.stops(), 1);
    assert_eq!(executor.call_count("scancel"), 1);

    let events = drain_events(&mut handle).await;
    assert!(matches!(
        events.last(),
        Some(JobEvent::Terminal(snapshot)) if snapshot.state == JobState::Vanished
    ));
}

#[tokio::test]
async fn test_stopped_ticker_cancels_remote_job() {
    let executor = Arc::new(
        ScriptedExecutor::new()
            .on("sbatch", [ScriptedReply::stdout("77")])
            .on("squeue", [ScriptedReply::stdout("RUNNING n1")]),
    );
    let launcher = Arc::new(MockTunnelLauncher::new());
    let orchestrator = Orchestrator::new(cluster_config(), executor.clone(), launcher.clone());

    let (ticker, driver) = ManualTicker::new();
    let mut handle = orchestrator
        .launch_with_ticker(kernel_spec(), ticker)
        .await
        .unwrap();
    assert!(driver.tick().await);
    assert!(handle.status().tunnel_active);

    drop(driver);
    handle.wait().await;
    handle.cancel();
    handle.shutdown().await;

    let status = handle.status();
    assert_eq!(status.state, JobState::Cancelled);
    assert_eq!(status.job_id, Some(77));
    assert!(!status.tunnel_active);
    assert_eq!(executor.call_count("scancel"), 1);
    assert_eq!(launcher.stops(), 1);

    let events = drain_events(&mut handle).await;
    assert!(!events.iter().any(|event| matches!(
        event,
        JobEvent::StateChanged {
            from: JobState::Unsubmitted,
            ..
        }
    )));
    assert!(events.contains(&JobEvent::StateChanged {
        from: JobState::Running,
        to: JobState::Cancelled,
    }));
    let terminals = events
        .iter()
        .filter(|event| matches!(event, JobEvent::Terminal(_)))
        .count();
    assert_eq!(terminals, 1);
}

#[tokio::test]
async fn test_running_without_node_waits_for_next_poll() {
    let executor = Arc::new(
        ScriptedExecutor::new()
            .on("sbatch", [ScriptedReply::stdout("600")])
            .on(
                "squeue",
                [
                    ScriptedReply::stdout("RUNNING (null)"),
                    ScriptedReply::stdout("RUNNING n3"),
                ],
            ),
    );
    let launcher = Arc::new(MockTunnelLauncher::new());
    let orchestrator = Orchestrator::new(cluster_config(), executor, launcher.clone());

    let (ticker, driver) = ManualTicker::new();
    let mut handle = orchestrator
        .launch_with_ticker(kernel_spec(), ticker)
        .await
        .unwrap();

    assert!(driver.tick().await);
    let status = handle.status();
    assert_eq!(status.state, JobState::Running);
    assert_eq!(status.exec_node, None);
    assert!(!status.tunnel_active);
    assert_eq!(launcher.launches(), 0);

    assert!(driver.tick().await);
    let status = handle.status();
    assert_eq!(status.exec_node.as_deref(), Some("n3"));
    assert!(status.tunnel_active);
    let plans = launcher.plans();
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].target_node, "n3");

    handle.shutdown().await;
}

/// Login host that drops every other queue query.
struct FlakyLoginHost {
    queries: AtomicUsize,
}

#[async_trait]
impl RemoteExecutor for FlakyLoginHost {
    async fn run(
        &self,
        _route: &SshRoute,
        command: RemoteCommand,
        _timeout: Duration,
    ) -> LaunchResult<ExecOutput> {
        match command.program() {
            "sbatch" => Ok(ExecOutput::ok("Submitted batch job 400")),
            "squeue" => {
                if self.queries.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                    Err(LaunchError::TransportError(
                        "kex_exchange_identification: Connection closed by remote host".into(),
                    ))
                } else {
                    Ok(ExecOutput::ok("RUNNING n2"))
                }
            }
            _ => Ok(ExecOutput::default()),
        }
    }
}

#[tokio::test]
async fn test_transient_poll_failures_are_absorbed() {
    let executor = Arc::new(FlakyLoginHost {
        queries: AtomicUsize::new(0),
    });
    let launcher = Arc::new(MockTunnelLauncher::new());
    let mut config = cluster_config();
    config.timing.max_poll_failures = 1;
    let orchestrator = Orchestrator::new(config, executor, launcher.clone());

    let (ticker, driver) = ManualTicker::new();
    let mut handle = orchestrator
        .launch_with_ticker(kernel_spec(), ticker)
        .await
        .unwrap();
    assert_eq!(handle.job_id(), Some(400));
    assert_eq!(driver.tick_n(10).await, 10);

    let status = handle.status();
    assert_eq!(status.state, JobState::Running);
    assert!(status.tunnel_active);
    assert_eq!(launcher.launches(), 1);

    let stats = orchestrator.context().stats();
    assert_eq!(stats.polls, 10);
    assert_eq!(stats.poll_failures, 5);
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_interval_polling() {
    let executor = Arc::new(
        ScriptedExecutor::new()
            .on("sbatch", [ScriptedReply::stdout("500")])
            .on(
                "squeue",
                [ScriptedReply::stdout("PENDING"), ScriptedReply::stdout("RUNNING n7")],
            ),
    );
    let launcher = Arc::new(MockTunnelLauncher::new());
    let orchestrator = Orchestrator::new(cluster_config(), executor.clone(), launcher.clone());

    let mut handle = orchestrator.submit(kernel_spec()).await.unwrap();

    // Polls at t=0s and t=4s.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(executor.call_count("squeue"), 2);
    assert_eq!(handle.status().exec_node.as_deref(), Some("n7"));
    assert_eq!(launcher.launches(), 1);

    handle.shutdown().await;
    assert_eq!(handle.status().state, JobState::Cancelled);
}
