// SPDX-License-Identifier: GPL-3.0-only

//! Cumulative error counters from `btrfs device stats`.

use crate::error::Result;
use crate::parse;
use crate::tool::BtrfsCli;
use crate::types::Volume;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;
use uuid::Uuid;

/// Sum every error category for every device of the given volumes.
///
/// One stats invocation per device; categories (read/write/flush/corruption/
/// generation, plus whatever the tool grows next) are collapsed into a single
/// count per device path. Failures are surfaced, not retried — the counters
/// are cumulative, so the next successful call loses nothing.
pub fn collect_error_counts(
    cli: &BtrfsCli,
    volumes: &BTreeMap<Uuid, Volume>,
) -> Result<BTreeMap<PathBuf, u64>> {
    let mut counts = BTreeMap::new();

    for volume in volumes.values() {
        for device in volume.devices.values() {
            let stdout = cli.device_stats(&device.path)?;
            let total: u64 = parse::parse_stat_lines(&stdout)?
                .iter()
                .map(|stat| stat.count)
                .sum();
            *counts.entry(device.path.clone()).or_insert(0) += total;
        }
    }

    debug!("collected error counts for {} devices", counts.len());
    Ok(counts)
}
