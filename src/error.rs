// SPDX-License-Identifier: GPL-3.0-only

use thiserror::Error;
use uuid::Uuid;

/// Error types for BTRFS health operations
#[derive(Error, Debug)]
pub enum HealthError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("btrfs binary not found in PATH")]
    ToolNotFound,

    #[error("btrfs {command} failed: {detail}")]
    CommandFailed { command: String, detail: String },

    #[error("unparseable {context} line: {line:?}")]
    Parse { context: &'static str, line: String },

    #[error("volume {0} is not mounted with its root subvolume")]
    UnmountedVolume(Uuid),

    #[error("scrub cancellation requested")]
    CancellationRequested,

    #[error("scrub of volume {uuid} device {devid} was canceled by another actor")]
    ScrubConflict { uuid: Uuid, devid: u64 },
}

/// Result type alias for health operations
pub type Result<T> = std::result::Result<T, HealthError>;
