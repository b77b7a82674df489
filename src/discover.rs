// SPDX-License-Identifier: GPL-3.0-only

//! Discovery of mounted BTRFS volumes through `btrfs filesystem show`.

use crate::error::Result;
use crate::parse;
use crate::tool::BtrfsCli;
use crate::types::Volume;
use std::collections::BTreeMap;
use tracing::{debug, warn};
use uuid::Uuid;

/// Return all currently mounted volumes, keyed by UUID.
///
/// Each call runs the listing command fresh; results are a point-in-time
/// snapshot and device paths are only valid within it.
pub fn discover_mounted_volumes(cli: &BtrfsCli) -> Result<BTreeMap<Uuid, Volume>> {
    let stdout = cli.filesystem_show_mounted()?;
    let volumes = parse::parse_volume_listing(&stdout)?;

    for volume in volumes.values() {
        if volume.device_count != volume.devices.len() as u64 {
            warn!(
                "volume {} lists {} devices but claims Total devices {}",
                volume.uuid,
                volume.devices.len(),
                volume.device_count
            );
        }
    }

    debug!("discovered {} mounted volumes", volumes.len());
    Ok(volumes)
}
