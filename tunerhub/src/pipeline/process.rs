//! Supervision of one external capture or filter process.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use futures::StreamExt;
use log::{debug, error, info, trace, warn};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec};

use crate::error::TunerError;

/// Longest stderr line forwarded to the log.
const MAX_STDERR_LINE: usize = 4096;

/// A running external process.
///
/// The command string is split with shell quoting rules and executed
/// directly (write `sh -c '...'` for pipelines), in its own process group so
/// signals also reach anything the command starts. stdout is always piped;
/// stdin is piped only for filter stages. stderr lines are forwarded to the
/// log at debug level.
pub struct ProcessHandle {
    label: String,
    command: String,
    child: Child,
    status: Option<ExitStatus>,
    stderr_task: Option<JoinHandle<()>>,
}

impl ProcessHandle {
    /// Start `command`.
    ///
    /// A launch failure is returned as [`TunerError::Spawn`]; nothing is left
    /// running in that case.
    pub fn spawn(label: impl Into<String>, command: &str, piped_stdin: bool) -> Result<Self, TunerError> {
        let label = label.into();

        let argv = shell_words::split(command)
            .map_err(|e| TunerError::spawn(command, io::Error::new(io::ErrorKind::InvalidInput, e)))?;
        let (program, args) = argv.split_first().ok_or_else(|| {
            TunerError::spawn(command, io::Error::new(io::ErrorKind::InvalidInput, "empty command"))
        })?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(if piped_stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            error!("[{}] Failed to spawn `{}`: {}", label, command, e);
            TunerError::spawn(command, e)
        })?;

        info!(
            "[{}] Spawned pid={} `{}`",
            label,
            child.id().map(|id| id.to_string()).unwrap_or_else(|| "?".into()),
            command
        );

        let stderr_task = child.stderr.take().map(|stderr| {
            let label = label.clone();
            tokio::spawn(async move {
                let mut lines =
                    FramedRead::new(stderr, LinesCodec::new_with_max_length(MAX_STDERR_LINE));
                while let Some(line) = lines.next().await {
                    match line {
                        Ok(line) => debug!("[{}] stderr: {}", label, line),
                        Err(e) => {
                            trace!("[{}] stderr closed: {}", label, e);
                            break;
                        }
                    }
                }
            })
        });

        Ok(Self {
            label,
            command: command.to_string(),
            child,
            status: None,
            stderr_task,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// OS process id while the process has not been reaped.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    /// Exit status if the process has already exited.
    pub fn try_status(&mut self) -> Option<ExitStatus> {
        if self.status.is_none() {
            if let Ok(Some(status)) = self.child.try_wait() {
                self.status = Some(status);
            }
        }
        self.status
    }

    /// Wait up to `wait` for the process to exit on its own.
    pub async fn status_within(&mut self, wait: Duration) -> Option<ExitStatus> {
        if let Some(status) = self.try_status() {
            return Some(status);
        }
        match tokio::time::timeout(wait, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.status = Some(status);
                Some(status)
            }
            Ok(Err(e)) => {
                warn!("[{}] wait failed: {}", self.label, e);
                None
            }
            Err(_) => None,
        }
    }

    /// Stop the process: SIGTERM to its group, wait up to `timeout`, then
    /// SIGKILL. Safe to call more than once.
    pub async fn terminate(&mut self, timeout: Duration) -> Option<ExitStatus> {
        if let Some(status) = self.try_status() {
            self.finish_stderr();
            return Some(status);
        }

        debug!("[{}] Terminating pid={:?}", self.label, self.child.id());
        self.signal_terminate();

        let status = match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!("[{}] wait failed: {}", self.label, e);
                None
            }
            Err(_) => {
                warn!(
                    "[{}] Still running after {}ms, killing",
                    self.label,
                    timeout.as_millis()
                );
                self.signal_kill();
                match self.child.wait().await {
                    Ok(status) => Some(status),
                    Err(e) => {
                        error!("[{}] Failed to reap killed process: {}", self.label, e);
                        None
                    }
                }
            }
        };

        if let Some(status) = status {
            debug!("[{}] Exited with {}", self.label, status);
            self.status = Some(status);
        }
        self.finish_stderr();
        status
    }

    fn finish_stderr(&mut self) {
        // Grandchildren may still hold the pipe open.
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }

    #[cfg(unix)]
    fn signal_terminate(&mut self) {
        if !self.signal_group(nix::sys::signal::Signal::SIGTERM) {
            let _ = self.child.start_kill();
        }
    }

    #[cfg(not(unix))]
    fn signal_terminate(&mut self) {
        let _ = self.child.start_kill();
    }

    fn signal_kill(&mut self) {
        #[cfg(unix)]
        self.signal_group(nix::sys::signal::Signal::SIGKILL);
        if let Err(e) = self.child.start_kill() {
            if e.kind() != io::ErrorKind::InvalidInput {
                warn!("[{}] kill failed: {}", self.label, e);
            }
        }
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: nix::sys::signal::Signal) -> bool {
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        let Some(pid) = self.child.id() else {
            return false;
        };
        match killpg(Pid::from_raw(pid as i32), signal) {
            Ok(()) => true,
            Err(e) => {
                debug!("[{}] killpg({}, {:?}) failed: {}", self.label, pid, signal, e);
                false
            }
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.status.is_none() {
            // kill_on_drop only covers the direct child.
            #[cfg(unix)]
            self.signal_group(nix::sys::signal::Signal::SIGKILL);
        }
        self.finish_stderr();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_spawn_missing_executable() {
        let result = ProcessHandle::spawn("test", "/nonexistent/recpt1 27 - -", false);
        assert!(matches!(result, Err(TunerError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_spawn_unbalanced_quotes() {
        let result = ProcessHandle::spawn("test", "echo 'oops", false);
        assert!(matches!(result, Err(TunerError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_spawn_and_read_stdout() {
        let mut proc = ProcessHandle::spawn("test", "echo hello", false).unwrap();
        let mut stdout = proc.take_stdout().unwrap();
        let mut out = String::new();
        stdout.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello\n");

        let status = proc.status_within(Duration::from_secs(5)).await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let mut proc = ProcessHandle::spawn("test", "sleep 30", false).unwrap();
        assert!(proc.pid().is_some());
        assert!(proc.try_status().is_none());

        let first = proc.terminate(Duration::from_secs(3)).await;
        assert!(first.is_some());
        assert!(!first.unwrap().success());

        let second = proc.terminate(Duration::from_secs(3)).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        // The shell ignores SIGTERM; only SIGKILL stops it.
        let mut proc =
            ProcessHandle::spawn("test", "sh -c \"trap '' TERM; while :; do sleep 0.1; done\"", false).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        let status = proc.terminate(Duration::from_millis(300)).await;
        assert!(status.is_some());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_filter_stdin_roundtrip() {
        use tokio::io::AsyncWriteExt;

        let mut proc = ProcessHandle::spawn("test", "tr a-z A-Z", true).unwrap();
        let mut stdin = proc.take_stdin().unwrap();
        let mut stdout = proc.take_stdout().unwrap();

        stdin.write_all(b"abc").await.unwrap();
        drop(stdin);

        let mut out = String::new();
        stdout.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "ABC");
    }

    #[tokio::test]
    async fn test_exit_status_reported() {
        let mut proc = ProcessHandle::spawn("test", "sh -c 'exit 3'", false).unwrap();
        let status = proc.status_within(Duration::from_secs(5)).await.unwrap();
        assert_eq!(status.code(), Some(3));
    }
}
