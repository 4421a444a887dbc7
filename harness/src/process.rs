//! Process Handle
//!
//! Supervises one spawned program, local or remote. A handle is started at
//! most once; after it terminates (by `wait`, `stop`, or `kill`) its captured
//! stdout/stderr become available and never change again. Dropping a handle
//! whose process is still alive force-kills it.

use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Instant;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{HarnessError, HarnessResult};
use crate::traits::{CommandChannel, CommandSpec};

/// Output of a terminated process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, or the negated signal number when killed by a signal
    pub exit_code: Option<i32>,
}

enum ProcessState {
    Unstarted,
    Running(RunningProcess),
    Terminated,
}

struct RunningProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: JoinHandle<Vec<u8>>,
    stderr: JoinHandle<Vec<u8>>,
    started_at: Instant,
}

pub struct ProcessHandle {
    channel: Arc<dyn CommandChannel>,
    spec: CommandSpec,
    state: ProcessState,
    output: Option<CapturedOutput>,
}

impl ProcessHandle {
    pub fn new(channel: Arc<dyn CommandChannel>, spec: CommandSpec) -> Self {
        Self {
            channel,
            spec,
            state: ProcessState::Unstarted,
            output: None,
        }
    }

    /// Start a fresh handle and block until it completes
    pub async fn run(
        channel: Arc<dyn CommandChannel>,
        spec: CommandSpec,
        input: Option<&[u8]>,
    ) -> HarnessResult<CapturedOutput> {
        let mut process = Self::new(channel, spec);
        process.start()?;
        process.wait(input).await?;
        Ok(process.output.take().unwrap_or_default())
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    /// Spawn the program; legal once per handle
    pub fn start(&mut self) -> HarnessResult<()> {
        if !matches!(self.state, ProcessState::Unstarted) {
            return Err(HarnessError::fixture("cannot start again using same process handle"));
        }

        let mut command = self.channel.command(&self.spec)?;
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        debug!("starting process on {}: {:?}", self.spec.host, self.spec.argv);
        let mut child = command.spawn().map_err(|e| {
            HarnessError::fixture(format!(
                "failed to spawn {:?} on {}: {e}",
                self.spec.argv, self.spec.host
            ))
        })?;
        debug!("started process {:?} (pid {:?})", self.spec.argv, child.id());

        let stdin = child.stdin.take();
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        self.state = ProcessState::Running(RunningProcess {
            child,
            stdin,
            stdout,
            stderr,
            started_at: Instant::now(),
        });
        Ok(())
    }

    /// Block until the process completes, optionally feeding `input` on stdin
    ///
    /// # Returns
    /// The exit code. When the handle carries a timeout and the process
    /// outlives it, the process is killed and `FixtureFailed` is returned.
    pub async fn wait(&mut self, input: Option<&[u8]>) -> HarnessResult<i32> {
        let mut running = self.take_running("wait for")?;

        if let Some(mut stdin) = running.stdin.take() {
            if let Some(data) = input {
                if let Err(e) = stdin.write_all(data).await {
                    debug!("process closed stdin early: {e}");
                }
            }
        }

        debug!("waiting for process to complete: {:?}", self.spec.argv);
        let completed = match self.spec.timeout {
            Some(limit) => tokio::time::timeout(limit, running.child.wait()).await.is_ok(),
            None => true,
        };
        if !completed {
            warn!("process {:?} exceeded its timeout, killing", self.spec.argv);
            if let Err(e) = running.child.start_kill() {
                debug!("kill after timeout failed: {e}");
            }
        }

        let output = collect(running).await;
        debug!("process completed: {:?} ({:?})", self.spec.argv, output.exit_code);
        self.output = Some(output.clone());

        if !completed {
            return Err(HarnessError::fixture(format!(
                "process {:?} on {} timed out after {:?}: stdout = {}, stderr = {}",
                self.spec.argv,
                self.spec.host,
                self.spec.timeout.unwrap_or_default(),
                output.stdout,
                output.stderr
            )));
        }
        output
            .exit_code
            .ok_or_else(|| HarnessError::fixture(format!("exit status of {:?} is unknown", self.spec.argv)))
    }

    /// Request termination with `signal` and collect the output
    ///
    /// A process that already exited between the liveness check and signal
    /// delivery is not an error; output is collected either way.
    pub async fn stop(&mut self, signal: Signal) -> HarnessResult<()> {
        let mut running = self.take_running("stop")?;
        let delivery = deliver(&mut running.child, signal);
        self.output = Some(collect(running).await);
        delivery
    }

    /// Stop with SIGKILL
    pub async fn kill(&mut self) -> HarnessResult<()> {
        self.stop(Signal::SIGKILL).await
    }

    /// Non-blocking liveness probe
    pub fn is_running(&mut self) -> bool {
        match &mut self.state {
            ProcessState::Running(running) => matches!(running.child.try_wait(), Ok(None)),
            _ => false,
        }
    }

    pub fn is_started(&self) -> bool {
        !matches!(self.state, ProcessState::Unstarted)
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.state, ProcessState::Terminated)
    }

    pub fn pid(&self) -> Option<u32> {
        match &self.state {
            ProcessState::Running(running) => running.child.id(),
            _ => None,
        }
    }

    pub fn uptime(&self) -> Option<std::time::Duration> {
        match &self.state {
            ProcessState::Running(running) => Some(running.started_at.elapsed()),
            _ => None,
        }
    }

    /// Captured output, present only once the process has terminated
    pub fn output(&self) -> Option<&CapturedOutput> {
        self.output.as_ref()
    }

    fn take_running(&mut self, operation: &str) -> HarnessResult<RunningProcess> {
        match std::mem::replace(&mut self.state, ProcessState::Terminated) {
            ProcessState::Running(running) => Ok(running),
            ProcessState::Unstarted => {
                self.state = ProcessState::Unstarted;
                Err(HarnessError::fixture(format!(
                    "cannot {operation} process: it has not been started yet"
                )))
            }
            ProcessState::Terminated => Err(HarnessError::fixture(format!(
                "cannot {operation} process: it has already terminated"
            ))),
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if let ProcessState::Running(running) = &mut self.state {
            if matches!(running.child.try_wait(), Ok(None)) {
                warn!(
                    "process is still running! killing {:?} on {}",
                    self.spec.argv, self.spec.host
                );
                if let Err(e) = running.child.start_kill() {
                    warn!("failed to kill process {:?}: {e}", self.spec.argv);
                }
            }
        }
    }
}

fn deliver(child: &mut Child, signal: Signal) -> HarnessResult<()> {
    if let Ok(Some(status)) = child.try_wait() {
        debug!("process already exited ({status}) before {signal:?} was sent");
        return Ok(());
    }
    let Some(pid) = child.id() else {
        debug!("process already reaped before {signal:?} was sent");
        return Ok(());
    };

    signal_pid(pid, signal)
}

/// Send `signal` to `pid`; a process that is already gone is not an error
fn signal_pid(pid: u32, signal: Signal) -> HarnessResult<()> {
    match signal::kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) => {
            debug!("sent {signal:?} to process {pid}");
            Ok(())
        }
        Err(Errno::ESRCH) => {
            debug!("race between poll and signal detected for process {pid}");
            Ok(())
        }
        Err(e) => Err(HarnessError::fixture(format!(
            "failed to send {signal:?} to process {pid}: {e}"
        ))),
    }
}

async fn collect(mut running: RunningProcess) -> CapturedOutput {
    drop(running.stdin.take());

    let exit_code = match running.child.wait().await {
        Ok(status) => Some(exit_code_of(status)),
        Err(e) => {
            warn!("failed to reap process: {e}");
            None
        }
    };
    let stdout = running.stdout.await.unwrap_or_default();
    let stderr = running.stderr.await.unwrap_or_default();

    CapturedOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code,
    }
}

fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signo| -signo))
        .unwrap_or(-1)
}

fn drain<R>(stream: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = Vec::new();
        if let Some(mut stream) = stream {
            if let Err(e) = stream.read_to_end(&mut buffer).await {
                debug!("output stream closed with error: {e}");
            }
        }
        buffer
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::LocalChannel;
    use std::time::Duration;

    fn handle(argv: &[&str]) -> ProcessHandle {
        let spec = CommandSpec::new("localhost", argv.iter().map(|s| s.to_string()).collect());
        ProcessHandle::new(Arc::new(LocalChannel::new()), spec)
    }

    #[tokio::test]
    async fn test_wait_feeds_stdin_and_captures_output() {
        let mut process = handle(&["cat"]);
        process.start().unwrap();

        let code = process.wait(Some(b"{\"method\":\"AROW\"}")).await.unwrap();

        assert_eq!(code, 0);
        let output = process.output().unwrap();
        assert_eq!(output.stdout, "{\"method\":\"AROW\"}");
        assert_eq!(output.stderr, "");
    }

    #[tokio::test]
    async fn test_exit_code_and_stderr() {
        let mut process = handle(&["sh", "-c", "echo oops >&2; exit 3"]);
        process.start().unwrap();

        assert_eq!(process.wait(None).await.unwrap(), 3);
        assert_eq!(process.output().unwrap().stderr, "oops\n");
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let mut process = handle(&["sleep", "30"]);
        process.start().unwrap();

        let err = process.start().unwrap_err();
        assert!(matches!(err, HarnessError::FixtureFailed { .. }));
        assert!(process.is_running());

        process.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_output_absent_until_terminated() {
        let mut process = handle(&["sleep", "30"]);
        assert!(process.output().is_none());
        process.start().unwrap();
        assert!(process.output().is_none());
        assert!(process.pid().is_some());

        process.stop(Signal::SIGTERM).await.unwrap();

        let output = process.output().unwrap();
        assert_eq!(output.exit_code, Some(-(Signal::SIGTERM as i32)));
        assert!(!process.is_running());
        assert!(process.is_terminated());
    }

    #[tokio::test]
    async fn test_stop_after_process_exited_is_swallowed() {
        let mut process = handle(&["sh", "-c", "echo bye"]);
        process.start().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!process.is_running());

        process.stop(Signal::SIGTERM).await.unwrap();

        let output = process.output().unwrap();
        assert_eq!(output.stdout, "bye\n");
        assert_eq!(output.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_kill_uses_sigkill() {
        let mut process = handle(&["sh", "-c", "trap '' TERM; exec sleep 30"]);
        process.start().unwrap();

        process.kill().await.unwrap();

        assert_eq!(process.output().unwrap().exit_code, Some(-(Signal::SIGKILL as i32)));
    }

    #[tokio::test]
    async fn test_wait_is_illegal_after_stop_and_before_start() {
        let mut process = handle(&["sleep", "30"]);
        assert!(process.wait(None).await.is_err());

        process.start().unwrap();
        process.stop(Signal::SIGTERM).await.unwrap();

        let err = process.wait(None).await.unwrap_err();
        assert!(err.to_string().contains("already terminated"));
        assert!(process.stop(Signal::SIGTERM).await.is_err());
    }

    #[tokio::test]
    async fn test_timeout_kills_and_reports_output() {
        let spec = CommandSpec::new("localhost", vec!["sh".into(), "-c".into(), "echo started; exec sleep 30".into()])
            .with_timeout(Some(Duration::from_millis(200)));
        let mut process = ProcessHandle::new(Arc::new(LocalChannel::new()), spec);
        process.start().unwrap();

        let err = process.wait(None).await.unwrap_err();

        assert!(err.to_string().contains("timed out"));
        assert_eq!(process.output().unwrap().stdout, "started\n");
    }

    /// Alive and not a zombie, per procfs
    fn is_alive(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.split_whitespace().next())
                .is_some_and(|state| state != "Z"),
            Err(_) => false,
        }
    }

    #[tokio::test]
    async fn test_drop_kills_running_process() {
        let mut process = handle(&["sleep", "30"]);
        process.start().unwrap();
        let pid = process.pid().unwrap();
        assert!(is_alive(pid));

        drop(process);

        let mut alive = true;
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            alive = is_alive(pid);
            if !alive {
                break;
            }
        }
        assert!(!alive, "process {pid} survived its handle");
    }

    #[tokio::test]
    async fn test_signal_to_vanished_process_is_swallowed() {
        let mut child = tokio::process::Command::new("true").spawn().unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();

        signal_pid(pid, Signal::SIGTERM).unwrap();
        signal_pid(pid, Signal::SIGKILL).unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failure_is_fixture_error() {
        let mut process = handle(&["/nonexistent/jubaclassifier"]);
        let err = process.start().unwrap_err();
        assert!(matches!(err, HarnessError::FixtureFailed { .. }));
        assert!(!process.is_started());
    }
}
