//! Self-upgrade continuation
//!
//! Upgrading the tool itself cannot happen while the invocation that asked for
//! it still holds the tool lock. The job waits for the lock file to disappear,
//! runs the upgrade command, and reports through a marker file only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

use crate::config::Config;

/// Hidden CLI subcommand that runs a detached job
pub const WORKER_SUBCOMMAND: &str = "self-upgrade-worker";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum SelfUpgradeError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Could not launch self-upgrade worker: {0}")]
    Launch(#[source] io::Error),
    #[error("Invalid marker file: {0}")]
    Marker(#[from] serde_json::Error),
    #[error("Self-upgrade task panicked or was cancelled: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, SelfUpgradeError>;

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> SelfUpgradeError + '_ {
    move |source| SelfUpgradeError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Completion record written once the command finished
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfUpgradeMarker {
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub success: bool,
    /// `None` when the command was killed by a signal
    pub exit_code: Option<i32>,
}

/// A deferred upgrade command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfUpgrade {
    pub command: String,
    pub lock_path: PathBuf,
    pub log_path: PathBuf,
    pub marker_path: PathBuf,
    pub poll_interval: Duration,
}

impl SelfUpgrade {
    /// Job waiting on the configured lock, logging under the self-upgrade directory
    pub fn new(command: impl Into<String>, config: &Config) -> Self {
        Self {
            command: command.into(),
            lock_path: config.lock_path.clone(),
            log_path: config.self_upgrade_dir.join("self-upgrade.log"),
            marker_path: config.self_upgrade_dir.join("self-upgrade.json"),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Start the job on its own task
    ///
    /// Must be called from within a tokio runtime. Dropping the handle does not
    /// cancel the job.
    pub fn spawn(self) -> SelfUpgradeHandle {
        tracing::info!(command = %self.command, "Self-upgrade scheduled");
        SelfUpgradeHandle {
            task: tokio::spawn(async move { self.execute().await }),
        }
    }

    /// Wait for the lock, run the command, write the marker
    pub async fn execute(&self) -> Result<SelfUpgradeMarker> {
        self.wait_for_lock_release().await?;

        if let Some(dir) = self.log_path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(io_err(dir))?;
        }
        let mut log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await
            .map_err(io_err(&self.log_path))?;

        let started_at = Utc::now();
        let header = format!("=== {} : {}\n", started_at.to_rfc3339(), self.command);
        log.write_all(header.as_bytes())
            .await
            .map_err(io_err(&self.log_path))?;
        log.flush().await.map_err(io_err(&self.log_path))?;

        let stdout = log.into_std().await;
        let stderr = stdout.try_clone().map_err(io_err(&self.log_path))?;

        tracing::info!(command = %self.command, "Running self-upgrade");
        let status = tokio::process::Command::new("bash")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .status()
            .await
            .map_err(SelfUpgradeError::Launch)?;

        let marker = SelfUpgradeMarker {
            command: self.command.clone(),
            started_at,
            ended_at: Utc::now(),
            success: status.success(),
            exit_code: status.code(),
        };
        self.write_marker(&marker).await?;

        if marker.success {
            tracing::info!("Self-upgrade completed");
        } else {
            tracing::error!(
                exit_code = ?marker.exit_code,
                log = %self.log_path.display(),
                "Self-upgrade failed"
            );
        }
        Ok(marker)
    }

    async fn wait_for_lock_release(&self) -> Result<()> {
        let mut announced = false;
        while tokio::fs::try_exists(&self.lock_path)
            .await
            .map_err(io_err(&self.lock_path))?
        {
            if !announced {
                tracing::debug!(lock = %self.lock_path.display(), "Waiting for lock release");
                announced = true;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        Ok(())
    }

    async fn write_marker(&self, marker: &SelfUpgradeMarker) -> Result<()> {
        if let Some(dir) = self.marker_path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(io_err(dir))?;
        }
        let tmp = self.marker_path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(marker)?;
        tokio::fs::write(&tmp, body).await.map_err(io_err(&tmp))?;
        tokio::fs::rename(&tmp, &self.marker_path)
            .await
            .map_err(io_err(&self.marker_path))?;
        Ok(())
    }

    /// Last completion record, if the job ever finished
    pub fn read_marker(path: &Path) -> Result<Option<SelfUpgradeMarker>> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(SelfUpgradeError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Arguments for `<program> self-upgrade-worker ...`
    pub fn worker_args(&self) -> Vec<String> {
        vec![
            WORKER_SUBCOMMAND.to_string(),
            "--command".to_string(),
            self.command.clone(),
            "--lock-path".to_string(),
            self.lock_path.display().to_string(),
            "--log-path".to_string(),
            self.log_path.display().to_string(),
            "--marker-path".to_string(),
            self.marker_path.display().to_string(),
            "--poll-interval-ms".to_string(),
            self.poll_interval.as_millis().to_string(),
        ]
    }

    /// Hand the job to a separate worker process that outlives the caller
    ///
    /// `launcher` is prepended to the command line (e.g. `systemd-run --scope`)
    /// so the worker escapes the caller's service cgroup. Returns the pid.
    pub fn detach(&self, program: &Path, launcher: &[String]) -> Result<u32> {
        let mut command = match launcher.split_first() {
            Some((first, rest)) => {
                let mut command = std::process::Command::new(first);
                command.args(rest).arg(program);
                command
            }
            None => std::process::Command::new(program),
        };
        command
            .args(self.worker_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let child = command.spawn().map_err(SelfUpgradeError::Launch)?;
        tracing::info!(pid = child.id(), "Self-upgrade worker detached");
        Ok(child.id())
    }
}

/// Handle on a spawned self-upgrade task
#[derive(Debug)]
pub struct SelfUpgradeHandle {
    task: JoinHandle<Result<SelfUpgradeMarker>>,
}

impl SelfUpgradeHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for completion
    pub async fn wait(self) -> Result<SelfUpgradeMarker> {
        self.task.await?
    }
}
