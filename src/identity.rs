// SPDX-License-Identifier: GPL-3.0-only

//! Resolution of the three names a volume answers to: UUID, primary device
//! path, and root-subvolume mount point.
//!
//! Scrub start/cancel only accept mount points, and only a mount of the root
//! subvolume counts. The mount table is re-read on every call; mounts change
//! underneath long-running processes and a cached table would go stale.

use crate::discover::discover_mounted_volumes;
use crate::error::{HealthError, Result};
use crate::scrub::MountLookup;
use crate::tool::BtrfsCli;
use crate::types::{IdentityTriple, Volume};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tracing::debug;
use uuid::Uuid;

/// Mount option marking the root subvolume of a btrfs mount.
pub const ROOT_SUBVOLUME_OPTION: &str = "subvolid=5";

const BTRFS_FSTYPE: &str = "btrfs";

/// Default mount-table path.
pub const DEFAULT_MOUNT_TABLE: &str = "/proc/self/mounts";

/// Live view of the kernel mount table
#[derive(Debug, Clone)]
pub struct MountTable {
    path: PathBuf,
}

impl MountTable {
    pub fn new() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_MOUNT_TABLE),
        }
    }

    /// Read from an explicit file instead of `/proc/self/mounts`.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Device → mount point for every btrfs filesystem mounted with its root
    /// subvolume. Reads the table fresh on every call.
    pub fn root_subvolume_mounts(&self) -> Result<BTreeMap<PathBuf, PathBuf>> {
        let table = fs::read_to_string(&self.path)?;
        parse_root_subvolume_mounts(&table)
    }
}

impl Default for MountTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a mount table (`<device> <mountpoint> <fstype> <options> ...`),
/// keeping only root-subvolume btrfs entries. The first entry for a device
/// wins; later bind mounts of the same device are ignored.
pub fn parse_root_subvolume_mounts(input: &str) -> Result<BTreeMap<PathBuf, PathBuf>> {
    let mut mounts = BTreeMap::new();

    for line in input.lines().filter(|line| !line.trim().is_empty()) {
        let mut fields = line.split_whitespace();
        let (Some(device), Some(mount_point), Some(fstype), Some(options)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(HealthError::Parse {
                context: "mount table",
                line: line.to_string(),
            });
        };

        if fstype != BTRFS_FSTYPE {
            continue;
        }
        if !options.split(',').any(|opt| opt == ROOT_SUBVOLUME_OPTION) {
            continue;
        }

        mounts
            .entry(PathBuf::from(unescape_mount_field(device)))
            .or_insert_with(|| PathBuf::from(unescape_mount_field(mount_point)));
    }

    Ok(mounts)
}

/// Resolve the identity triple for every given volume.
///
/// Fails with [`HealthError::UnmountedVolume`] if any volume's devid-1 device
/// is not in the root-subvolume mount set; such a volume cannot be addressed
/// by mount point and therefore cannot be scrubbed.
pub fn resolve_identities(
    volumes: &BTreeMap<Uuid, Volume>,
    mounts: &BTreeMap<PathBuf, PathBuf>,
) -> Result<BTreeMap<Uuid, IdentityTriple>> {
    let mut triples = BTreeMap::new();
    for (uuid, volume) in volumes {
        triples.insert(*uuid, resolve_one(volume, mounts)?);
    }
    Ok(triples)
}

fn resolve_one(volume: &Volume, mounts: &BTreeMap<PathBuf, PathBuf>) -> Result<IdentityTriple> {
    // devid 1 can be missing after a device-remove; the volume is then not
    // addressable as "primary device" either way.
    let primary = volume
        .devices
        .get(&1)
        .ok_or(HealthError::UnmountedVolume(volume.uuid))?;
    let mount_point = mounts
        .get(&primary.path)
        .ok_or(HealthError::UnmountedVolume(volume.uuid))?;
    Ok(IdentityTriple {
        uuid: volume.uuid,
        primary_device: primary.path.clone(),
        mount_point: mount_point.clone(),
    })
}

/// [`MountLookup`] over the live system: re-runs discovery and re-reads the
/// mount table on every lookup.
#[derive(Debug, Clone)]
pub struct LiveIdentity {
    cli: BtrfsCli,
    table: MountTable,
}

impl LiveIdentity {
    pub fn new(cli: BtrfsCli, table: MountTable) -> Self {
        Self { cli, table }
    }

    /// Resolve triples for all currently mounted volumes.
    pub fn resolve_all(&self) -> Result<BTreeMap<Uuid, IdentityTriple>> {
        let volumes = discover_mounted_volumes(&self.cli)?;
        let mounts = self.table.root_subvolume_mounts()?;
        resolve_identities(&volumes, &mounts)
    }
}

impl MountLookup for LiveIdentity {
    fn mount_point_of(&self, uuid: &Uuid) -> Result<PathBuf> {
        let volumes = discover_mounted_volumes(&self.cli)?;
        let volume = volumes
            .get(uuid)
            .ok_or(HealthError::UnmountedVolume(*uuid))?;
        let mounts = self.table.root_subvolume_mounts()?;
        let triple = resolve_one(volume, &mounts)?;
        debug!(
            "volume {uuid} mounted at {}",
            triple.mount_point.display()
        );
        Ok(triple.mount_point)
    }
}

// Mount table fields octal-escape whitespace (`\040` for space).
fn unescape_mount_field(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    let bytes = value.as_bytes();
    let mut index = 0;

    while index < bytes.len() {
        if bytes[index] == b'\\'
            && index + 3 < bytes.len()
            && bytes[index + 1].is_ascii_digit()
            && bytes[index + 2].is_ascii_digit()
            && bytes[index + 3].is_ascii_digit()
        {
            let octal = &value[index + 1..index + 4];
            if let Ok(num) = u8::from_str_radix(octal, 8) {
                output.push(num as char);
                index += 4;
                continue;
            }
        }

        output.push(bytes[index] as char);
        index += 1;
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Device;
    use std::path::Path;

    const MOUNTS: &str = "\
        /dev/nvme0n1p2 / btrfs rw,relatime,ssd,subvolid=5,subvol=/ 0 0\n\
        /dev/sda /srv/tank btrfs rw,relatime,subvolid=5,subvol=/ 0 0\n\
        /dev/sda /srv/snapshots btrfs rw,relatime,subvolid=257,subvol=/snapshots 0 0\n\
        proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0\n\
        /dev/sdc1 /data ext4 rw,relatime 0 0\n";

    fn volume(uuid: &str, primary_path: &str) -> Volume {
        let mut devices = std::collections::BTreeMap::new();
        devices.insert(
            1,
            Device {
                size: "1.00TiB".to_string(),
                used: "0.50TiB".to_string(),
                path: PathBuf::from(primary_path),
            },
        );
        Volume {
            uuid: Uuid::parse_str(uuid).unwrap(),
            label: "test".to_string(),
            device_count: 1,
            bytes_used: "0.50TiB".to_string(),
            devices,
        }
    }

    #[test]
    fn filters_to_root_subvolume_btrfs_mounts() {
        let mounts = parse_root_subvolume_mounts(MOUNTS).expect("table should parse");
        assert_eq!(mounts.len(), 2);
        assert_eq!(
            mounts[Path::new("/dev/sda")],
            PathBuf::from("/srv/tank"),
            "subvol mount must not shadow the root mount"
        );
        assert!(!mounts.contains_key(Path::new("/dev/sdc1")));
    }

    #[test]
    fn unescapes_mount_point_whitespace() {
        let mounts =
            parse_root_subvolume_mounts("/dev/sdb /mnt/my\\040disk btrfs rw,subvolid=5 0 0\n")
                .unwrap();
        assert_eq!(mounts[Path::new("/dev/sdb")], PathBuf::from("/mnt/my disk"));
    }

    #[test]
    fn short_mount_line_is_fatal() {
        assert!(parse_root_subvolume_mounts("/dev/sda /mnt\n").is_err());
    }

    #[test]
    fn resolves_one_triple_per_volume() {
        let mounts = parse_root_subvolume_mounts(MOUNTS).unwrap();
        let mut volumes = std::collections::BTreeMap::new();
        let v = volume("11111111-2222-3333-4444-555555555555", "/dev/sda");
        volumes.insert(v.uuid, v);

        let triples = resolve_identities(&volumes, &mounts).expect("should resolve");
        assert_eq!(triples.len(), 1);
        let triple = triples.values().next().unwrap();
        assert_eq!(triple.primary_device, PathBuf::from("/dev/sda"));
        assert_eq!(triple.mount_point, PathBuf::from("/srv/tank"));
    }

    #[test]
    fn unmounted_volume_is_reported_by_uuid() {
        let mounts = parse_root_subvolume_mounts(MOUNTS).unwrap();
        let mut volumes = std::collections::BTreeMap::new();
        let v = volume("99999999-8888-7777-6666-555555555555", "/dev/sdq");
        let uuid = v.uuid;
        volumes.insert(uuid, v);

        match resolve_identities(&volumes, &mounts) {
            Err(HealthError::UnmountedVolume(reported)) => assert_eq!(reported, uuid),
            other => panic!("expected UnmountedVolume, got {other:?}"),
        }
    }
}
