//! Scripted executor for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{LaunchError, LaunchResult};
use crate::transport::{ExecOutput, RemoteCommand, RemoteExecutor, SshRoute};

/// One canned reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedReply {
    /// The command ran; nonzero exit codes are classified like a real run.
    Output(ExecOutput),
    /// The call exceeded its timeout.
    Timeout,
    /// The transport could not connect.
    Unreachable(String),
}

impl ScriptedReply {
    /// Successful reply with the given stdout.
    pub fn stdout(text: impl Into<String>) -> Self {
        ScriptedReply::Output(ExecOutput::ok(text))
    }

    /// Failed reply with the given exit code and stderr.
    pub fn exit(exit_code: i32, stderr: impl Into<String>) -> Self {
        ScriptedReply::Output(ExecOutput::failed(exit_code, stderr))
    }
}

/// A call the executor received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub route: SshRoute,
    pub command: RemoteCommand,
}

#[derive(Debug, Default)]
struct Script {
    replies: HashMap<String, VecDeque<ScriptedReply>>,
    calls: Vec<RecordedCall>,
}

/// Executor that answers from per-program reply queues.
///
/// Replies are consumed in order; the last reply for a program repeats once its
/// queue is down to one entry. Programs without a script answer with empty
/// stdout.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    script: Mutex<Script>,
}

impl ScriptedExecutor {
    /// Create an executor with no scripted replies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue replies for `program` (e.g. `"sbatch"`, `"squeue"`).
    pub fn on<I>(self, program: &str, replies: I) -> Self
    where
        I: IntoIterator<Item = ScriptedReply>,
    {
        self.push(program, replies);
        self
    }

    /// Queue more replies for `program` on a shared executor.
    pub fn push<I>(&self, program: &str, replies: I)
    where
        I: IntoIterator<Item = ScriptedReply>,
    {
        let mut script = self.lock();
        script
            .replies
            .entry(program.to_string())
            .or_default()
            .extend(replies);
    }

    /// Every call received so far.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    /// Number of calls to `program`.
    pub fn call_count(&self, program: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.command.program() == program)
            .count()
    }

    /// Total number of calls.
    pub fn total_calls(&self) -> usize {
        self.lock().calls.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        // A panicking test thread must not hide the calls from the others.
        self.script
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn run(
        &self,
        route: &SshRoute,
        command: RemoteCommand,
        _timeout: Duration,
    ) -> LaunchResult<ExecOutput> {
        let reply = {
            let mut script = self.lock();
            script.calls.push(RecordedCall {
                route: route.clone(),
                command: command.clone(),
            });
            match script.replies.get_mut(command.program()) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        match reply.unwrap_or_else(|| ScriptedReply::stdout("")) {
            ScriptedReply::Output(output) => output.into_result(&command),
            ScriptedReply::Timeout => Err(LaunchError::Timeout(format!(
                "{} timed out",
                command.program()
            ))),
            ScriptedReply::Unreachable(reason) => Err(LaunchError::TransportError(reason)),
        }
    }
}
