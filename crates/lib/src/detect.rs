//! Resolution of the currently booted disk, root partition and slot.

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::blockdev;
use crate::slot::{Slot, UnknownSlotError, EXPECTED_PARTITIONS};

/// Failure to resolve the live system's disk/partition topology.
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("resolving the root mount source")]
    RootMount(#[source] anyhow::Error),
    #[error("resolving {device} to its backing partition")]
    Backing {
        device: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("root device {device} has no parent disk")]
    NoParentDisk { device: String },
    #[error("disk {disk} has {found} partitions, expected {expected}")]
    UnexpectedLayout {
        disk: Utf8PathBuf,
        found: usize,
        expected: usize,
    },
    #[error(transparent)]
    UnknownSlot(#[from] UnknownSlotError),
}

/// The partition pair an update will write to.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct UpdateTarget {
    pub(crate) slot: Slot,
    pub(crate) root: Utf8PathBuf,
    pub(crate) verity: Utf8PathBuf,
}

/// Where the running system lives on disk.
#[derive(Debug)]
pub(crate) struct BootedSystem {
    /// The physical disk backing the root filesystem.
    pub(crate) disk: Utf8PathBuf,
    /// The partition the root filesystem lives on. When the root is a
    /// dm-verity mapping this is the underlying data partition, not the
    /// mapper node.
    pub(crate) root_partition: Utf8PathBuf,
    pub(crate) slot: Slot,
}

impl BootedSystem {
    /// Inspect the live system: resolve the device backing `/`, walk
    /// through any device-mapper indirection to the raw partition, and
    /// derive the disk and booted slot.
    pub(crate) fn detect() -> Result<Self, DetectionError> {
        let rootfs = ferrite_mount::inspect_filesystem(Utf8Path::new("/"))
            .map_err(DetectionError::RootMount)?;
        tracing::debug!("root is {} ({})", rootfs.source, rootfs.fstype);
        Self::from_root_source(Utf8Path::new(&rootfs.source))
    }

    fn from_root_source(source: &Utf8Path) -> Result<Self, DetectionError> {
        let backing_err = |e: anyhow::Error| DetectionError::Backing {
            device: source.to_string(),
            source: e,
        };
        let name = blockdev::kernel_name(source).map_err(backing_err)?;
        // A verity root is backed by two partitions, its data partition
        // and its hash partition; the data partition always has the lower
        // index in this layout. A plain partition resolves to itself.
        let backing = blockdev::backing_devices(&name).map_err(backing_err)?;
        let (partno, root_name) = backing
            .iter()
            .map(|name| Ok((blockdev::partition_index(name)?, name)))
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(backing_err)?
            .into_iter()
            .min()
            .map(|(partno, name)| (partno, name.clone()))
            .ok_or_else(|| DetectionError::NoParentDisk {
                device: source.to_string(),
            })?;
        let root_partition = Utf8PathBuf::from(format!("/dev/{root_name}"));

        let parents = blockdev::find_parent_devices(root_partition.as_str()).map_err(|e| {
            DetectionError::Backing {
                device: root_partition.to_string(),
                source: e,
            }
        })?;
        let disk = parents
            .into_iter()
            .next()
            .map(Utf8PathBuf::from)
            .ok_or_else(|| DetectionError::NoParentDisk {
                device: root_partition.to_string(),
            })?;

        // The updater only understands the fixed six-partition layout;
        // refuse anything else before computing a target.
        let table = blockdev::partitions_of(&disk).map_err(|e| DetectionError::Backing {
            device: disk.to_string(),
            source: e,
        })?;
        if table.partitions.len() != EXPECTED_PARTITIONS {
            return Err(DetectionError::UnexpectedLayout {
                disk,
                found: table.partitions.len(),
                expected: EXPECTED_PARTITIONS,
            });
        }

        let slot = Slot::from_root_partno(partno)?;
        Ok(Self {
            disk,
            root_partition,
            slot,
        })
    }

    /// The complementary slot and its partition pair; never overlaps the
    /// booted slot by construction.
    pub(crate) fn update_target(&self) -> UpdateTarget {
        let slot = self.slot.complement();
        UpdateTarget {
            slot,
            root: blockdev::partition_device(&self.disk, slot.root_partno()),
            verity: blockdev::partition_device(&self.disk, slot.verity_partno()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_target_sata() {
        // Booted from /dev/sda2 (slot A) on direct-suffix naming
        let booted = BootedSystem {
            disk: "/dev/sda".into(),
            root_partition: "/dev/sda2".into(),
            slot: Slot::A,
        };
        let target = booted.update_target();
        assert_eq!(
            target,
            UpdateTarget {
                slot: Slot::B,
                root: "/dev/sda4".into(),
                verity: "/dev/sda5".into(),
            }
        );
    }

    #[test]
    fn test_update_target_nvme() {
        // Booted via dm-verity over /dev/nvme0n1p4 (slot B) on p-infixed naming
        let booted = BootedSystem {
            disk: "/dev/nvme0n1".into(),
            root_partition: "/dev/nvme0n1p4".into(),
            slot: Slot::B,
        };
        let target = booted.update_target();
        assert_eq!(
            target,
            UpdateTarget {
                slot: Slot::A,
                root: "/dev/nvme0n1p2".into(),
                verity: "/dev/nvme0n1p3".into(),
            }
        );
    }

    #[test]
    fn test_target_never_overlaps_booted() {
        for slot in Slot::ALL {
            let booted = BootedSystem {
                disk: "/dev/vda".into(),
                root_partition: blockdev::partition_device(
                    Utf8Path::new("/dev/vda"),
                    slot.root_partno(),
                ),
                slot,
            };
            let target = booted.update_target();
            assert_ne!(target.root, booted.root_partition);
            assert_ne!(target.verity, booted.root_partition);
            assert_eq!(target.slot, slot.complement());
        }
    }
}
