//! Process spawning with bounded lifetimes and the three execution strategies.
//!
//! Every strategy arms its timeout when the run begins, races process exit
//! against the trigger's cancellation scope, and terminates the whole process
//! group when either fires. No process handle outlives the call that spawned it.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::exec_error::{ExecError, UNKNOWN_EXIT_CODE};
use crate::process_registry::{ProcessRegistry, RunRegistration};
use crate::stream_sink::StreamSink;

const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(250);
const CAPTURE_CHUNK_BYTES: usize = 8 * 1024;
/// Longer lines are delivered as consecutive events of at most this many bytes.
const MAX_STREAM_LINE_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Fully resolved invocation owned by a single execution.
pub struct RunRequest {
    pub program: String,
    pub args: Vec<String>,
    pub directory: Option<PathBuf>,
}

impl RunRequest {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            directory: None,
        }
    }

    pub fn with_directory(mut self, directory: Option<PathBuf>) -> Self {
        self.directory = directory;
        self
    }
}

#[derive(Debug, Clone)]
/// Cancellation-bound context for one run.
///
/// The run ends early when `cancel` fires (trigger ended or host shutdown) or
/// when `timeout` elapses, counted from the moment the run starts.
pub struct RunScope {
    handler: String,
    cancel: CancellationToken,
    timeout: Option<Duration>,
    registry: Option<ProcessRegistry>,
}

impl RunScope {
    pub fn new(cancel: CancellationToken, timeout: Option<Duration>) -> Self {
        Self {
            handler: String::new(),
            cancel,
            timeout,
            registry: None,
        }
    }

    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = handler.into();
        self
    }

    pub fn with_registry(mut self, registry: ProcessRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn handler(&self) -> &str {
        &self.handler
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[derive(Debug)]
/// Buffered output and outcome of a collected run.
pub struct CollectedRun {
    pub stdout: String,
    pub stderr: String,
    pub outcome: Result<(), ExecError>,
}

impl CollectedRun {
    fn start_failure(error: ExecError) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            outcome: Err(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// `0` on success, the OS exit code on a non-zero exit, `-1` otherwise.
    pub fn exit_code(&self) -> i32 {
        match &self.outcome {
            Ok(()) => 0,
            Err(error) => error.exit_code(),
        }
    }
}

/// Runs the process without capturing output and reports only success or failure.
pub async fn run_detached(request: &RunRequest, scope: &RunScope) -> Result<(), ExecError> {
    let deadline = RunDeadline::arm(scope.timeout);
    let mut command = build_command(request, Stdio::null(), Stdio::null());
    let mut process = RunningProcess::spawn(request, &mut command, scope)?;
    process.wait_bounded(scope, &deadline).await
}

/// Runs the process with both output channels buffered in memory.
pub async fn run_collected(request: &RunRequest, scope: &RunScope) -> CollectedRun {
    let deadline = RunDeadline::arm(scope.timeout);
    let mut command = build_command(request, Stdio::piped(), Stdio::piped());
    let mut process = match RunningProcess::spawn(request, &mut command, scope) {
        Ok(process) => process,
        Err(error) => return CollectedRun::start_failure(error),
    };

    let stop_capture = CancellationToken::new();
    let stdout = process
        .child
        .stdout
        .take()
        .map(|pipe| tokio::spawn(capture_pipe(pipe, stop_capture.clone())));
    let stderr = process
        .child
        .stderr
        .take()
        .map(|pipe| tokio::spawn(capture_pipe(pipe, stop_capture.clone())));

    let outcome = process.wait_bounded(scope, &deadline).await;

    // Descendants may keep the pipes open after the leader exits.
    let grace_timer = {
        let stop_capture = stop_capture.clone();
        tokio::spawn(async move {
            tokio::time::sleep(PIPE_DRAIN_GRACE).await;
            stop_capture.cancel();
        })
    };
    let (stdout, stderr) = tokio::join!(join_capture(stdout), join_capture(stderr));
    grace_timer.abort();

    CollectedRun {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        outcome,
    }
}

/// Runs the process and forwards each output line to `sink` as it is read.
///
/// Terminal events are emitted only after both pipe readers have finished:
/// an `error` event when the run failed, then exactly one `close` event.
pub async fn run_streamed<S>(
    request: &RunRequest,
    scope: &RunScope,
    sink: Arc<S>,
) -> Result<(), ExecError>
where
    S: StreamSink + ?Sized + 'static,
{
    let outcome = stream_process(request, scope, &sink).await;
    if let Err(error) = &outcome {
        if !matches!(error, ExecError::Transport) {
            let _ = sink.on_error(error.to_string()).await;
        }
    }
    let _ = sink.on_close().await;
    outcome
}

async fn stream_process<S>(
    request: &RunRequest,
    scope: &RunScope,
    sink: &Arc<S>,
) -> Result<(), ExecError>
where
    S: StreamSink + ?Sized + 'static,
{
    let deadline = RunDeadline::arm(scope.timeout);
    let mut command = build_command(request, Stdio::piped(), Stdio::piped());
    let mut process = RunningProcess::spawn(request, &mut command, scope)?;

    let consumer_gone = CancellationToken::new();
    let readers: Vec<JoinHandle<()>> = [
        process.child.stdout.take().map(|pipe| {
            tokio::spawn(pump_lines(
                pipe,
                OutputChannel::Stdout,
                Arc::clone(sink),
                consumer_gone.clone(),
            ))
        }),
        process.child.stderr.take().map(|pipe| {
            tokio::spawn(pump_lines(
                pipe,
                OutputChannel::Stderr,
                Arc::clone(sink),
                consumer_gone.clone(),
            ))
        }),
    ]
    .into_iter()
    .flatten()
    .collect();
    let abort_handles: Vec<AbortHandle> = readers.iter().map(JoinHandle::abort_handle).collect();
    let readers_finished = join_all(readers);
    tokio::pin!(readers_finished);

    let interrupted = tokio::select! {
        _ = &mut readers_finished => None,
        _ = scope.cancel.cancelled() => Some(ExecError::Cancelled),
        _ = deadline.elapsed() => Some(deadline.error()),
        _ = consumer_gone.cancelled() => Some(ExecError::Transport),
    };

    if let Some(error) = interrupted {
        process.terminate().await;
        if tokio::time::timeout(PIPE_DRAIN_GRACE, &mut readers_finished)
            .await
            .is_err()
        {
            abort_handles.iter().for_each(AbortHandle::abort);
            readers_finished.await;
        }
        debug!(
            handler = scope.handler(),
            program = %request.program,
            error = %error,
            "streamed command interrupted"
        );
        return Err(error);
    }

    process.wait_bounded(scope, &deadline).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputChannel {
    Stdout,
    Stderr,
}

impl OutputChannel {
    fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

async fn pump_lines<R, S>(
    pipe: R,
    channel: OutputChannel,
    sink: Arc<S>,
    consumer_gone: CancellationToken,
) where
    R: AsyncRead + Unpin,
    S: StreamSink + ?Sized,
{
    let mut reader = BufReader::new(pipe);
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = (&mut reader)
            .take(MAX_STREAM_LINE_BYTES)
            .read_until(b'\n', &mut line)
            .await;
        match read {
            Ok(0) => break,
            Ok(_) => {
                let text = decode_line(&line);
                let delivered = match channel {
                    OutputChannel::Stdout => sink.on_stdout_line(text).await,
                    OutputChannel::Stderr => sink.on_stderr_line(text).await,
                };
                if delivered.is_err() {
                    consumer_gone.cancel();
                    break;
                }
            }
            Err(error) => {
                debug!(channel = channel.as_str(), error = %error, "pipe read failed");
                break;
            }
        }
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

async fn capture_pipe<R>(mut pipe: R, stop: CancellationToken) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut captured = Vec::new();
    let mut chunk = vec![0_u8; CAPTURE_CHUNK_BYTES];
    loop {
        let read = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            read = pipe.read(&mut chunk) => read,
        };
        match read {
            Ok(0) => break,
            Ok(count) => captured.extend_from_slice(&chunk[..count]),
            Err(error) => {
                debug!(error = %error, "output capture read failed");
                break;
            }
        }
    }
    captured
}

async fn join_capture(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    match handle {
        Some(handle) => handle.await.unwrap_or_default(),
        None => Vec::new(),
    }
}

struct RunDeadline {
    at: Option<Instant>,
    timeout_ms: u64,
}

impl RunDeadline {
    fn arm(timeout: Option<Duration>) -> Self {
        Self {
            at: timeout.map(|timeout| Instant::now() + timeout),
            timeout_ms: timeout
                .map(|timeout| u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX))
                .unwrap_or(0),
        }
    }

    async fn elapsed(&self) {
        match self.at {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    }

    fn error(&self) -> ExecError {
        ExecError::TimedOut {
            timeout_ms: self.timeout_ms,
        }
    }
}

fn build_command(request: &RunRequest, stdout: Stdio, stderr: Stdio) -> Command {
    let mut command = Command::new(&request.program);
    command.args(&request.args);
    if let Some(directory) = &request.directory {
        command.current_dir(directory);
    }
    command.stdin(Stdio::null());
    command.stdout(stdout);
    command.stderr(stderr);
    command.kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);
    command
}

/// Spawned child plus the bookkeeping that guarantees it is reaped or killed.
struct RunningProcess {
    child: Child,
    process_group: Option<u32>,
    reaped: bool,
    _registration: Option<RunRegistration>,
}

impl RunningProcess {
    fn spawn(
        request: &RunRequest,
        command: &mut Command,
        scope: &RunScope,
    ) -> Result<Self, ExecError> {
        let child = command.spawn().map_err(|source| ExecError::Start {
            program: request.program.clone(),
            source,
        })?;
        let pid = child.id();
        let registration = scope
            .registry
            .as_ref()
            .map(|registry| registry.register(scope.handler(), &request.program, pid));
        debug!(
            handler = scope.handler(),
            program = %request.program,
            args = ?request.args,
            pid = ?pid,
            run_id = ?registration.as_ref().map(RunRegistration::run_id),
            "command started"
        );
        Ok(Self {
            child,
            process_group: pid,
            reaped: false,
            _registration: registration,
        })
    }

    async fn wait_bounded(
        &mut self,
        scope: &RunScope,
        deadline: &RunDeadline,
    ) -> Result<(), ExecError> {
        let status = tokio::select! {
            status = self.child.wait() => status,
            _ = scope.cancel.cancelled() => {
                self.terminate().await;
                return Err(ExecError::Cancelled);
            }
            _ = deadline.elapsed() => {
                self.terminate().await;
                return Err(deadline.error());
            }
        };
        self.reaped = true;
        let status = status.map_err(ExecError::Io)?;
        debug!(
            handler = scope.handler(),
            exit_code = status.code().unwrap_or(UNKNOWN_EXIT_CODE),
            success = status.success(),
            "command exited"
        );
        exit_status_result(status)
    }

    async fn terminate(&mut self) {
        signal_process_group(self.process_group);
        if let Err(error) = self.child.kill().await {
            debug!(error = %error, "failed to kill command");
        }
        self.reaped = true;
    }
}

impl Drop for RunningProcess {
    fn drop(&mut self) {
        if !self.reaped {
            signal_process_group(self.process_group);
        }
    }
}

fn exit_status_result(status: ExitStatus) -> Result<(), ExecError> {
    if status.success() {
        return Ok(());
    }
    if let Some(code) = status.code() {
        return Err(ExecError::Exited { code });
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Err(ExecError::Signaled { signal });
        }
    }
    Err(ExecError::Exited {
        code: UNKNOWN_EXIT_CODE,
    })
}

#[cfg(unix)]
fn signal_process_group(process_group: Option<u32>) {
    let Some(group) = process_group.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: the group id is the pid of a child spawned as its own group leader.
    let result = unsafe { libc::killpg(group, libc::SIGKILL) };
    if result != 0 {
        let error = std::io::Error::last_os_error();
        if error.raw_os_error() != Some(libc::ESRCH) {
            debug!(group, error = %error, "failed to signal process group");
        }
    }
}

#[cfg(not(unix))]
fn signal_process_group(_process_group: Option<u32>) {}
