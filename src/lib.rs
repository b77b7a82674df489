// SPDX-License-Identifier: GPL-3.0-only

//! Health monitoring for mounted BTRFS filesystems.
//!
//! The `btrfs` userland tool produces output that is unstable in ordering,
//! unstable in device naming, and not accompanied by useful exit codes. This
//! library turns that text interface into something a monitoring system can
//! rely on:
//!
//! - discovery of mounted volumes and their member devices
//! - resolution of the three names a volume answers to (UUID, primary
//!   device, root-subvolume mount point)
//! - cumulative per-device I/O and checksum error counters
//! - orchestration of scrub runs over a set of volumes, with cooperative
//!   cancellation and guaranteed cancel-unwind on failure

pub mod discover;
pub mod error;
pub mod identity;
pub mod parse;
pub mod scrub;
pub mod stats;
pub mod status;
pub mod tool;
pub mod types;

// Re-export commonly used items
pub use discover::discover_mounted_volumes;
pub use error::{HealthError, Result};
pub use identity::{resolve_identities, LiveIdentity, MountTable};
pub use scrub::{CancelToken, ScrubOrchestrator};
pub use stats::collect_error_counts;
pub use status::ScrubStatusStore;
pub use tool::BtrfsCli;
pub use types::{Device, IdentityTriple, ScrubDeviceStatus, ScrubStatusMap, Volume};

use std::path::PathBuf;

impl ScrubOrchestrator<BtrfsCli, ScrubStatusStore, LiveIdentity> {
    /// Orchestrator wired to the live system: the `btrfs` binary from PATH,
    /// the default status directory, and `/proc/self/mounts`.
    pub fn with_live_system() -> Result<Self> {
        Self::with_live_system_at(PathBuf::from(status::DEFAULT_STATUS_DIR))
    }

    /// Same as [`Self::with_live_system`] with an explicit status directory.
    pub fn with_live_system_at(status_dir: PathBuf) -> Result<Self> {
        let cli = BtrfsCli::new()?;
        Ok(Self::new(
            cli.clone(),
            ScrubStatusStore::with_dir(status_dir),
            LiveIdentity::new(cli, MountTable::new()),
        ))
    }
}
