// SPDX-License-Identifier: GPL-3.0-only

//! Low-level wrapper around the `btrfs` command-line tool.
//!
//! The tool's exit codes are not a simple success/failure boolean: `scrub
//! cancel` legitimately exits 2 when there is nothing to cancel. Every
//! invocation therefore carries an explicit allow-list of acceptable exit
//! codes instead of a bare status check.

use crate::error::{HealthError, Result};
use crate::scrub::{CancelOutcome, ScrubControl};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tracing::debug;
use which::which;

/// `scrub cancel` exit code for "no scrub running on this filesystem".
const SCRUB_CANCEL_NOT_RUNNING: i32 = 2;

/// Synchronous wrapper for `btrfs` subcommands
#[derive(Debug, Clone)]
pub struct BtrfsCli {
    /// Path to the btrfs binary
    binary: PathBuf,
}

impl BtrfsCli {
    /// Create a new wrapper, locating `btrfs` in PATH.
    pub fn new() -> Result<Self> {
        let binary = which("btrfs").map_err(|_| HealthError::ToolNotFound)?;
        debug!("found btrfs binary at {:?}", binary);
        Ok(Self { binary })
    }

    /// Use an explicit binary path instead of searching PATH.
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn run(&self, command: &'static str, args: &[&OsStr], accept: &[i32]) -> Result<Output> {
        debug!("running btrfs {command}");
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .map_err(|e| HealthError::CommandFailed {
                command: command.to_string(),
                detail: format!("failed to execute: {e}"),
            })?;

        match output.status.code() {
            Some(code) if accept.contains(&code) => Ok(output),
            code => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(HealthError::CommandFailed {
                    command: command.to_string(),
                    detail: format!("exit status {code:?}: {}", stderr.trim()),
                })
            }
        }
    }

    /// `btrfs filesystem show --mounted`, stdout only.
    ///
    /// The tool does not signal listing problems through its exit code, so
    /// any stderr output is treated as a failure.
    pub fn filesystem_show_mounted(&self) -> Result<String> {
        let output = self.run(
            "filesystem show",
            &[
                OsStr::new("filesystem"),
                OsStr::new("show"),
                OsStr::new("--mounted"),
            ],
            &[0],
        )?;
        if !output.stderr.is_empty() {
            return Err(HealthError::CommandFailed {
                command: "filesystem show".to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// `btrfs device stats <path>`, stdout only.
    pub fn device_stats(&self, path: &Path) -> Result<String> {
        let output = self.run(
            "device stats",
            &[OsStr::new("device"), OsStr::new("stats"), path.as_os_str()],
            &[0],
        )?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl ScrubControl for BtrfsCli {
    /// `btrfs scrub start <mountpoint>`. The tool detaches the actual scrub
    /// and returns quickly; progress lands in the status directory.
    fn scrub_start(&self, mount_point: &Path) -> Result<()> {
        self.run(
            "scrub start",
            &[
                OsStr::new("scrub"),
                OsStr::new("start"),
                mount_point.as_os_str(),
            ],
            &[0],
        )?;
        Ok(())
    }

    /// `btrfs scrub cancel <mountpoint>`. Exit 0 and exit 2 ("not running")
    /// are both acceptable outcomes; anything else is an error.
    fn scrub_cancel(&self, mount_point: &Path) -> Result<CancelOutcome> {
        let output = self.run(
            "scrub cancel",
            &[
                OsStr::new("scrub"),
                OsStr::new("cancel"),
                mount_point.as_os_str(),
            ],
            &[0, SCRUB_CANCEL_NOT_RUNNING],
        )?;
        match output.status.code() {
            Some(SCRUB_CANCEL_NOT_RUNNING) => Ok(CancelOutcome::NotRunning),
            _ => Ok(CancelOutcome::Canceled),
        }
    }
}
