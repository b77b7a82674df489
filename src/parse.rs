// SPDX-License-Identifier: GPL-3.0-only

//! Line parsers for the three text formats the `btrfs` tool produces.
//!
//! The tool has no machine-readable output mode, so these parsers treat the
//! human-oriented formats as fixed grammars. Field *values* are unstable
//! (device naming, ordering), but a line that does not match its expected
//! shape means a tool-version mismatch and is a fatal [`HealthError::Parse`]
//! rather than something to skip over.

use crate::error::{HealthError, Result};
use crate::types::{Device, ScrubDeviceStatus, Volume};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

fn malformed(context: &'static str, line: &str) -> HealthError {
    HealthError::Parse {
        context,
        line: line.to_string(),
    }
}

/// Parse the output of `btrfs filesystem show`.
///
/// Each block is a `Label:` line, a `Total devices` line, and one or more
/// `devid` lines. Blocks are separated by blank lines; end of input also
/// terminates the final block.
pub fn parse_volume_listing(input: &str) -> Result<BTreeMap<Uuid, Volume>> {
    let mut volumes = BTreeMap::new();
    let mut lines = input.lines();

    loop {
        let header = loop {
            match lines.next() {
                None => return Ok(volumes),
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => break line,
            }
        };

        let (uuid, label) = parse_label_line(header)?;

        let totals = lines.next().ok_or_else(|| malformed("volume listing", header))?;
        let (device_count, bytes_used) = parse_totals_line(totals)?;

        let mut devices = BTreeMap::new();
        loop {
            match lines.next() {
                None => break,
                Some(line) if line.trim().is_empty() => break,
                Some(line) => {
                    let (devid, device) = parse_device_line(line)?;
                    devices.insert(devid, device);
                }
            }
        }

        // A block without device lines is truncated output, not a volume.
        if devices.is_empty() {
            return Err(malformed("volume listing", header));
        }

        volumes.insert(
            uuid,
            Volume {
                uuid,
                label,
                device_count,
                bytes_used,
                devices,
            },
        );
    }
}

fn parse_label_line(line: &str) -> Result<(Uuid, String)> {
    let rest = line
        .strip_prefix("Label: ")
        .ok_or_else(|| malformed("volume label", line))?;
    let (label, uuid) = rest
        .rsplit_once("  uuid: ")
        .ok_or_else(|| malformed("volume label", line))?;
    let uuid = Uuid::parse_str(uuid.trim()).map_err(|_| malformed("volume label", line))?;
    let label = label.trim().trim_matches('\'').to_string();
    Ok((uuid, label))
}

fn parse_totals_line(line: &str) -> Result<(u64, String)> {
    let rest = line
        .strip_prefix("\tTotal devices ")
        .ok_or_else(|| malformed("volume totals", line))?;
    let (count, bytes_used) = rest
        .split_once(" FS bytes used ")
        .ok_or_else(|| malformed("volume totals", line))?;
    let device_count = count
        .parse::<u64>()
        .map_err(|_| malformed("volume totals", line))?;
    Ok((device_count, bytes_used.to_string()))
}

fn parse_device_line(line: &str) -> Result<(u64, Device)> {
    let rest = line
        .strip_prefix("\tdevid")
        .ok_or_else(|| malformed("device listing", line))?;
    let (devid, rest) = rest
        .trim_start()
        .split_once(' ')
        .ok_or_else(|| malformed("device listing", line))?;
    let devid = devid
        .parse::<u64>()
        .map_err(|_| malformed("device listing", line))?;
    let rest = rest
        .trim_start()
        .strip_prefix("size ")
        .ok_or_else(|| malformed("device listing", line))?;
    let (size, rest) = rest
        .split_once(" used ")
        .ok_or_else(|| malformed("device listing", line))?;
    let (used, path) = rest
        .split_once(" path ")
        .ok_or_else(|| malformed("device listing", line))?;

    // Sizes are opaque strings but always start with a digit (`1.00TiB`).
    if !starts_with_digit(size) || !starts_with_digit(used) || path.is_empty() {
        return Err(malformed("device listing", line));
    }

    Ok((
        devid,
        Device {
            size: size.to_string(),
            used: used.to_string(),
            path: PathBuf::from(path),
        },
    ))
}

fn starts_with_digit(value: &str) -> bool {
    value.chars().next().is_some_and(|c| c.is_ascii_digit())
}

/// One line of `btrfs device stats` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatLine {
    /// Device name as printed inside the brackets.
    pub device: String,
    /// Category token, e.g. `write_io_errs`.
    pub category: String,
    pub count: u64,
}

/// Parse `btrfs device stats` output: one `[<device>].<category>_errs <n>`
/// line per error category.
pub fn parse_stat_lines(input: &str) -> Result<Vec<StatLine>> {
    let mut stats = Vec::new();

    for line in input.lines().filter(|line| !line.trim().is_empty()) {
        let rest = line
            .strip_prefix('[')
            .ok_or_else(|| malformed("device stats", line))?;
        let (device, rest) = rest
            .rsplit_once("].")
            .ok_or_else(|| malformed("device stats", line))?;

        let mut fields = rest.split_whitespace();
        let (Some(category), Some(count), None) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(malformed("device stats", line));
        };
        if !category.ends_with("_errs") {
            return Err(malformed("device stats", line));
        }
        let count = count
            .parse::<u64>()
            .map_err(|_| malformed("device stats", line))?;

        stats.push(StatLine {
            device: device.to_string(),
            category: category.to_string(),
            count,
        });
    }

    Ok(stats)
}

/// Parse one record line of a persisted scrub-status file:
/// `<uuid>:<devid>|<key>:<value>|...`.
///
/// Keys this layer does not track (progress byte counts, timestamps, resume
/// markers) are ignored. Absent counters read as zero; old status files
/// predate some of them.
pub fn parse_status_record(line: &str) -> Result<(Uuid, u64, ScrubDeviceStatus)> {
    let mut fields = line.split('|');

    let header = fields.next().unwrap_or_default();
    let (uuid, devid) = header
        .split_once(':')
        .ok_or_else(|| malformed("scrub status", line))?;
    let uuid = Uuid::parse_str(uuid).map_err(|_| malformed("scrub status", line))?;
    let devid = devid
        .parse::<u64>()
        .map_err(|_| malformed("scrub status", line))?;

    let mut status = ScrubDeviceStatus::default();
    for field in fields {
        let (key, value) = field
            .split_once(':')
            .ok_or_else(|| malformed("scrub status", line))?;
        let counter = match key {
            "finished" => {
                status.finished = parse_flag(value, line)?;
                continue;
            }
            "canceled" => {
                status.canceled = parse_flag(value, line)?;
                continue;
            }
            "read_errors" => &mut status.read_errors,
            "csum_errors" => &mut status.csum_errors,
            "verify_errors" => &mut status.verify_errors,
            "csum_discards" => &mut status.csum_discards,
            "super_errors" => &mut status.super_errors,
            "malloc_errors" => &mut status.malloc_errors,
            "uncorrectable_errors" => &mut status.uncorrectable_errors,
            "corrected_errors" => &mut status.corrected_errors,
            _ => continue,
        };
        *counter = value
            .parse::<u64>()
            .map_err(|_| malformed("scrub status", line))?;
    }

    Ok((uuid, devid, status))
}

fn parse_flag(value: &str, line: &str) -> Result<bool> {
    let value = value
        .parse::<u64>()
        .map_err(|_| malformed("scrub status", line))?;
    Ok(value != 0)
}
