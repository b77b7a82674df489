// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// One mounted BTRFS filesystem as reported by `btrfs filesystem show`.
///
/// Snapshots are immutable: discovery produces a fresh set on every call and
/// never patches an earlier one. Device paths are only stable within the
/// discovery call that produced them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub uuid: Uuid,
    pub label: String,
    /// The `Total devices` field as printed by the tool. Carried verbatim;
    /// discovery warns if it disagrees with the parsed device lines.
    pub device_count: u64,
    /// Human-readable size string (`1.23TiB`). Opaque to this layer.
    pub bytes_used: String,
    /// Keyed by devid, so iteration is devid order, which is also the
    /// order the tool lists devices in.
    pub devices: BTreeMap<u64, Device>,
}

/// One member device of a volume, keyed by its devid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub size: String,
    pub used: String,
    pub path: PathBuf,
}

/// The three names a mounted volume answers to.
///
/// `primary_device` is the path of devid 1. `mount_point` is where the root
/// subvolume is mounted; scrub start/cancel only accept mount points.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityTriple {
    pub uuid: Uuid,
    pub primary_device: PathBuf,
    pub mount_point: PathBuf,
}

/// Progress/outcome record for one device's scrub, as persisted by the tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScrubDeviceStatus {
    pub finished: bool,
    pub canceled: bool,
    pub read_errors: u64,
    pub csum_errors: u64,
    pub verify_errors: u64,
    pub csum_discards: u64,
    pub super_errors: u64,
    pub malloc_errors: u64,
    pub uncorrectable_errors: u64,
    pub corrected_errors: u64,
}

impl ScrubDeviceStatus {
    /// Sum of the eight raw error counters. Always recomputed, never read
    /// from the record itself.
    pub fn total_errors(&self) -> u64 {
        self.read_errors
            + self.csum_errors
            + self.verify_errors
            + self.csum_discards
            + self.super_errors
            + self.malloc_errors
            + self.uncorrectable_errors
            + self.corrected_errors
    }
}

/// All persisted scrub records, keyed by volume UUID and then devid.
pub type ScrubStatusMap = BTreeMap<Uuid, BTreeMap<u64, ScrubDeviceStatus>>;
