//! Dev-server child process.
//!
//! The `Child` is owned by a small actor task that waits for it to exit (or
//! for a kill request) and reports the outcome on a watch channel. Output
//! lines from stdout and stderr are appended to the project's log ring.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};

use crate::errors::PreviewError;

use super::logs::SharedLogs;

/// Placeholder in argument lists replaced by the allocated port.
pub const PORT_PLACEHOLDER: &str = "{port}";

/// What to run for a preview.
#[derive(Debug, Clone)]
pub struct DevServerSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
    pub port: u16,
}

impl DevServerSpec {
    /// Arguments with [`PORT_PLACEHOLDER`] substituted.
    pub fn resolved_args(&self) -> Vec<String> {
        let port = self.port.to_string();
        self.args
            .iter()
            .map(|arg| arg.replace(PORT_PLACEHOLDER, &port))
            .collect()
    }

    pub fn display_command(&self) -> String {
        std::iter::once(self.command.clone())
            .chain(self.resolved_args())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// How a process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub description: String,
}

impl ExitInfo {
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
            description: "unknown exit status".to_string(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
            description: status.to_string(),
        }
    }
}

/// Handle to a running dev server. Dropping it kills the process.
#[derive(Debug)]
pub struct DevServerProcess {
    pid: Option<u32>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl DevServerProcess {
    /// Spawn the dev server in its own process group with `PORT` set.
    pub fn spawn(spec: &DevServerSpec, logs: SharedLogs) -> Result<Self, PreviewError> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(spec.resolved_args())
            .current_dir(&spec.cwd)
            .env("PORT", spec.port.to_string())
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|source| PreviewError::SpawnFailed {
            command: spec.display_command(),
            source,
        })?;
        Ok(Self::from_child(child, logs))
    }

    /// Take ownership of an already spawned child.
    pub fn from_child(mut child: Child, logs: SharedLogs) -> Self {
        let pid = child.id();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, logs.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, logs));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                // Fires on an explicit kill and when the handle is dropped.
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let info = match status {
                Ok(status) => ExitInfo::from(status),
                Err(e) => ExitInfo {
                    description: format!("wait failed: {e}"),
                    ..ExitInfo::unknown()
                },
            };
            let _ = exit_tx.send(Some(info));
        });

        Self {
            pid,
            exit_rx,
            kill_tx: Some(kill_tx),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit information, once the process has exited.
    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit_rx.borrow().clone()
    }

    /// A receiver that observes the exit. Outlives the handle.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit_rx.clone()
    }

    /// Wait for the process to exit on its own.
    pub async fn wait(&mut self) -> ExitInfo {
        wait_exit(&mut self.exit_rx).await
    }

    /// Stop the process: SIGTERM to its process group, then a forced kill if
    /// it is still alive after `grace`. A process that already exited is
    /// not signalled.
    pub async fn terminate(mut self, grace: Duration) -> ExitInfo {
        if let Some(info) = self.exit_info() {
            return info;
        }

        signal_group(self.pid, GroupSignal::Terminate);
        if let Ok(info) = tokio::time::timeout(grace, wait_exit(&mut self.exit_rx)).await {
            return info;
        }

        tracing::warn!(pid = ?self.pid, grace_secs = grace.as_secs(), "Process ignored SIGTERM; killing");
        signal_group(self.pid, GroupSignal::Kill);
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        tokio::time::timeout(Duration::from_secs(5), wait_exit(&mut self.exit_rx))
            .await
            .unwrap_or_else(|_| ExitInfo::unknown())
    }
}

async fn wait_exit(exit_rx: &mut watch::Receiver<Option<ExitInfo>>) -> ExitInfo {
    match exit_rx.wait_for(Option::is_some).await {
        Ok(info) => (*info).clone().unwrap_or_else(ExitInfo::unknown),
        Err(_) => ExitInfo::unknown(),
    }
}

async fn pump_lines<R: AsyncRead + Unpin>(reader: R, logs: SharedLogs) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::trace!(line = %line, "dev server output");
        logs.push(line);
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum GroupSignal {
    Terminate,
    Kill,
}

/// Signal the process group led by `pid`. Errors (typically ESRCH for a
/// group that is already gone) are ignored.
#[cfg(unix)]
pub(crate) fn signal_group(pid: Option<u32>, signal: GroupSignal) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    let signal = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    if let Err(e) = killpg(Pid::from_raw(pid), signal) {
        tracing::debug!(pid, ?signal, "killpg failed: {}", e);
    }
}

#[cfg(not(unix))]
pub(crate) fn signal_group(_pid: Option<u32>, _signal: GroupSignal) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str, port: u16) -> DevServerSpec {
        DevServerSpec {
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: vec![("GREETING".to_string(), "hello".to_string())],
            cwd: std::env::temp_dir(),
            port,
        }
    }

    async fn wait_for_lines(logs: &SharedLogs, n: usize) {
        for _ in 0..100 {
            if logs.len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[test]
    fn test_port_placeholder_substituted() {
        let spec = DevServerSpec {
            command: "npm".to_string(),
            args: vec!["run".into(), "dev".into(), "--".into(), "--port".into(), "{port}".into()],
            env: vec![],
            cwd: PathBuf::from("."),
            port: 3105,
        };
        assert_eq!(spec.display_command(), "npm run dev -- --port 3105");
    }

    #[tokio::test]
    async fn test_output_and_env_reach_log_ring() {
        let logs = SharedLogs::new(10);
        let mut process = DevServerProcess::spawn(
            &sh("echo \"$GREETING on $PORT\"; echo oops >&2", 3123),
            logs.clone(),
        )
        .unwrap();
        let info = process.wait().await;
        assert!(info.success());

        wait_for_lines(&logs, 2).await;
        let lines = logs.tail(10);
        assert!(lines.contains(&"hello on 3123".to_string()), "{lines:?}");
        assert!(lines.contains(&"oops".to_string()), "{lines:?}");
    }

    #[tokio::test]
    async fn test_terminate_stops_long_running_process() {
        let process = DevServerProcess::spawn(&sh("exec sleep 30", 3100), SharedLogs::new(10)).unwrap();
        assert!(process.pid().is_some());
        assert!(process.exit_info().is_none());

        let info = process.terminate(Duration::from_secs(5)).await;
        assert_eq!(info.signal, Some(15));
    }

    #[tokio::test]
    async fn test_terminate_escalates_when_sigterm_is_ignored() {
        let process = DevServerProcess::spawn(
            &sh("trap '' TERM; while true; do sleep 0.1; done", 3100),
            SharedLogs::new(10),
        )
        .unwrap();
        // Give the shell time to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let info = process.terminate(Duration::from_millis(300)).await;
        assert_eq!(info.signal, Some(9));
    }

    #[tokio::test]
    async fn test_terminate_after_exit_is_noop() {
        let mut process = DevServerProcess::spawn(&sh("exit 3", 3100), SharedLogs::new(10)).unwrap();
        let exited = process.wait().await;
        assert_eq!(exited.code, Some(3));

        let again = process.terminate(Duration::from_secs(1)).await;
        assert_eq!(again, exited);
    }

    #[tokio::test]
    async fn test_spawn_failure_names_command() {
        let spec = DevServerSpec {
            command: "/definitely/not/a/binary".to_string(),
            args: vec![],
            env: vec![],
            cwd: std::env::temp_dir(),
            port: 3100,
        };
        match DevServerProcess::spawn(&spec, SharedLogs::new(10)) {
            Err(PreviewError::SpawnFailed { command, .. }) => {
                assert_eq!(command, "/definitely/not/a/binary");
            }
            other => panic!("Expected SpawnFailed, got {:?}", other.map(|p| p.pid())),
        }
    }
}
