// SPDX-License-Identifier: GPL-3.0-only

//! Reader for the tool's persisted scrub-status records.
//!
//! `btrfs scrub` detaches from its invoking process and writes per-device
//! progress to `<dir>/scrub.status.<uuid>`; these files are the only way to
//! observe a running scrub. This store performs pure reads of state owned by
//! the external tool and never writes.

use crate::error::Result;
use crate::parse;
use crate::scrub::StatusSource;
use crate::types::ScrubStatusMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::{debug, trace};
use uuid::Uuid;

/// Default directory the tool persists scrub status into.
pub const DEFAULT_STATUS_DIR: &str = "/var/lib/btrfs";

const STATUS_FILE_PREFIX: &str = "scrub.status.";
const UUID_LEN: usize = 36;

/// Read-only view of the scrub-status directory
#[derive(Debug, Clone)]
pub struct ScrubStatusStore {
    dir: PathBuf,
}

impl ScrubStatusStore {
    pub fn new() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_STATUS_DIR),
        }
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Read every status file, keyed by volume UUID and devid.
    ///
    /// Only filenames of the exact form `scrub.status.<36-char-uuid>` are
    /// read; anything else (notably the tool's `_tmp` files mid-write) is a
    /// normal transient artifact and silently skipped. A missing directory
    /// means no scrub ever ran here and reads as empty.
    pub fn read_all_statuses(&self) -> Result<ScrubStatusMap> {
        let mut statuses = ScrubStatusMap::new();

        let entries = match fs::read_dir(&self.dir) {
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("status directory {:?} does not exist", self.dir);
                return Ok(statuses);
            }
            other => other?,
        };

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if status_file_uuid(name).is_none() {
                trace!("skipping non-status file {name:?}");
                continue;
            }

            let body = fs::read_to_string(entry.path())?;
            // First line is a header written by the tool.
            for line in body.lines().skip(1).filter(|line| !line.trim().is_empty()) {
                let (uuid, devid, status) = parse::parse_status_record(line)?;
                statuses.entry(uuid).or_default().insert(devid, status);
            }
        }

        debug!("read scrub status for {} volumes", statuses.len());
        Ok(statuses)
    }
}

impl Default for ScrubStatusStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusSource for ScrubStatusStore {
    fn read_all_statuses(&self) -> Result<ScrubStatusMap> {
        ScrubStatusStore::read_all_statuses(self)
    }
}

fn status_file_uuid(name: &str) -> Option<Uuid> {
    let suffix = name.strip_prefix(STATUS_FILE_PREFIX)?;
    if suffix.len() != UUID_LEN {
        return None;
    }
    Uuid::parse_str(suffix).ok()
}
