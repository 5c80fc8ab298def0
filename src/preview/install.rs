//! One-shot dependency installation (`npm install` by default).
//!
//! Runs outside the preview state machine: it never touches a project's
//! preview status and may run while the dev server is up.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::errors::PreviewError;

use super::logs::LogRing;
use super::process::{ExitInfo, GroupSignal, signal_group};

#[derive(Debug, Clone)]
pub struct InstallSpec {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub timeout: Duration,
    /// Only the last `output_lines` lines are kept.
    pub output_lines: usize,
}

/// Result of an installer run that finished within its timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    /// Tail of stdout and stderr interleaved in arrival order.
    pub output: String,
    pub duration_ms: u64,
}

/// Run the installer to completion, capturing combined output.
///
/// A run that exceeds `spec.timeout` is killed and reported as
/// [`PreviewError::InstallTimeout`] carrying whatever output was captured.
pub async fn run_install(spec: &InstallSpec) -> Result<InstallOutput, PreviewError> {
    let started = Instant::now();
    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args)
        .current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|source| PreviewError::SpawnFailed {
        command: format!("{} {}", spec.command, spec.args.join(" ")).trim().to_string(),
        source,
    })?;
    let pid = child.id();
    tracing::info!(command = %spec.command, cwd = %spec.cwd.display(), ?pid, "Installing dependencies");

    let (line_tx, mut line_rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, line_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, line_tx.clone()));
    }
    drop(line_tx);

    let mut output = LogRing::new(spec.output_lines);
    let run = async {
        // Ends once both pipes hit EOF.
        while let Some(line) = line_rx.recv().await {
            output.push(line);
        }
        child.wait().await
    };
    let result = tokio::time::timeout(spec.timeout, run).await;

    match result {
        Ok(Ok(status)) => {
            let info = ExitInfo::from(status);
            let duration_ms = started.elapsed().as_millis() as u64;
            tracing::info!(exit = %info.description, duration_ms, "Dependency install finished");
            Ok(InstallOutput {
                success: info.success(),
                exit_code: info.code,
                output: output.tail(output.len()).join("\n"),
                duration_ms,
            })
        }
        Ok(Err(e)) => Err(PreviewError::Other(
            anyhow::Error::new(e).context("Failed to wait for installer"),
        )),
        Err(_) => {
            tracing::warn!(timeout_secs = spec.timeout.as_secs(), "Dependency install timed out; killing");
            signal_group(pid, GroupSignal::Kill);
            let _ = child.kill().await;
            Err(PreviewError::InstallTimeout {
                timeout_secs: spec.timeout.as_secs(),
                output: output.tail(output.len()).join("\n"),
            })
        }
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::UnboundedSender<String>) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).is_err() {
            break;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str, timeout: Duration) -> InstallSpec {
        InstallSpec {
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: std::env::temp_dir(),
            timeout,
            output_lines: 100,
        }
    }

    #[tokio::test]
    async fn test_captures_combined_output() {
        let out = run_install(&sh(
            "echo resolving; echo 'npm WARN deprecated' >&2; echo added 12 packages",
            Duration::from_secs(10),
        ))
        .await
        .unwrap();

        assert!(out.success);
        assert_eq!(out.exit_code, Some(0));
        for expected in ["resolving", "npm WARN deprecated", "added 12 packages"] {
            assert!(out.output.contains(expected), "missing {expected:?} in {:?}", out.output);
        }
    }

    #[tokio::test]
    async fn test_output_keeps_only_the_last_lines() {
        let spec = InstallSpec {
            output_lines: 10,
            ..sh("seq 1 50", Duration::from_secs(10))
        };
        let out = run_install(&spec).await.unwrap();
        assert!(out.success);
        let lines: Vec<&str> = out.output.lines().collect();
        assert_eq!(lines.len(), 10);
        assert_eq!(lines.first(), Some(&"41"));
        assert_eq!(lines.last(), Some(&"50"));
    }

    #[tokio::test]
    async fn test_failed_install_is_reported_not_raised() {
        let out = run_install(&sh("echo 'ERESOLVE' >&2; exit 1", Duration::from_secs(10)))
            .await
            .unwrap();
        assert!(!out.success);
        assert_eq!(out.exit_code, Some(1));
        assert!(out.output.contains("ERESOLVE"));
    }

    #[tokio::test]
    async fn test_timeout_returns_partial_output() {
        let err = run_install(&sh("echo fetching; exec sleep 30", Duration::from_millis(500)))
            .await
            .unwrap_err();
        match err {
            PreviewError::InstallTimeout { output, .. } => assert!(output.contains("fetching")),
            other => panic!("Expected InstallTimeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_installer_is_spawn_failure() {
        let spec = InstallSpec {
            command: "/no/such/installer".to_string(),
            args: vec!["install".to_string()],
            cwd: std::env::temp_dir(),
            timeout: Duration::from_secs(1),
            output_lines: 100,
        };
        assert!(matches!(
            run_install(&spec).await,
            Err(PreviewError::SpawnFailed { .. })
        ));
    }
}
