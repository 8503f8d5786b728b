//! Updating the EFI system partition.
//!
//! The ESP carries the bootloader at a canonical path, a copy at the
//! architecture-default fallback path that firmware probes when no boot
//! entry exists, and one unified boot image per release under
//! `EFI/Linux/`. Updating the boot pointer means overwriting all three.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;
use thiserror::Error;

use crate::fetch::boot_image_artifact;
use ferrite_utils::CommandRunExt;

/// Canonical bootloader path within the ESP.
const BOOTLOADER_PATH: &str = "EFI/systemd/systemd-bootx64.efi";
/// Architecture-default fallback bootloader path.
const FALLBACK_PATH: &str = "EFI/BOOT/BOOTX64.EFI";
/// Directory of release-tagged unified boot images.
const BOOT_IMAGE_DIR: &str = "EFI/Linux";

/// Failure while re-pointing the bootloader. The rootfs partitions may
/// already carry the new release at this point, but the old slot and the
/// old boot entries still agree, so the system remains bootable.
#[derive(Debug, Error)]
pub enum BootUpdateError {
    #[error("mounting ESP {device}")]
    Mount {
        device: Utf8PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("creating {path} on ESP")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("installing {dest} on ESP")]
    Install {
        dest: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unmounting ESP")]
    Unmount(#[source] anyhow::Error),
}

/// A temporary private mount of the ESP; unmounted on drop.
pub(crate) struct EspMount {
    dir: Option<TempDir>,
}

impl EspMount {
    pub(crate) fn new(device: &Utf8Path) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("ferrite-esp.")
            .tempdir()
            .context("allocating ESP mountpoint")?;
        Command::new("mount")
            .arg(device.as_str())
            .arg(dir.path())
            .run_capture_stderr()
            .with_context(|| format!("mounting {device}"))?;
        tracing::debug!("mounted {device} at {}", dir.path().display());
        Ok(Self { dir: Some(dir) })
    }

    pub(crate) fn path(&self) -> &Path {
        // SAFETY: The option cannot be destructured until we are dropped
        self.dir.as_ref().unwrap().path()
    }

    // Shared backend for our `unmount` and `drop` implementations.
    fn impl_unmount(&mut self) -> Result<()> {
        // SAFETY: This is the only place we take the option
        let Some(dir) = self.dir.take() else {
            tracing::trace!("ESP already unmounted");
            return Ok(());
        };
        Command::new("umount")
            .arg(dir.path())
            .run_capture_stderr()?;
        dir.close().context("removing ESP mountpoint")
    }

    /// Consume this mount, unmounting the ESP.
    pub(crate) fn unmount(mut self) -> Result<()> {
        self.impl_unmount()
    }
}

impl Drop for EspMount {
    fn drop(&mut self) {
        // Best effort to unmount if we're dropped without invoking `unmount`
        let _ = self.impl_unmount();
    }
}

/// Copy the bootloader and the tagged boot image into the fixed ESP
/// paths rooted at `esp_root`, overwriting existing entries. Each copy is
/// flushed before the next starts.
pub(crate) fn install_boot_entries(
    esp_root: &Path,
    bootloader: &Utf8Path,
    boot_image: &Utf8Path,
    tag: u64,
) -> Result<(), BootUpdateError> {
    let entries = [
        (bootloader, esp_root.join(BOOTLOADER_PATH)),
        (bootloader, esp_root.join(FALLBACK_PATH)),
        (
            boot_image,
            esp_root.join(BOOT_IMAGE_DIR).join(boot_image_artifact(tag)),
        ),
    ];
    for (src, dest) in entries {
        let parent = dest.parent().expect("ESP entry paths have parents");
        std::fs::create_dir_all(parent).map_err(|source| BootUpdateError::CreateDir {
            path: parent.to_owned(),
            source,
        })?;
        let install_err = |source| BootUpdateError::Install {
            dest: dest.clone(),
            source,
        };
        std::fs::copy(src, &dest).map_err(install_err)?;
        std::fs::File::open(&dest)
            .and_then(|f| f.sync_all())
            .map_err(install_err)?;
        tracing::debug!("installed {src} as {}", dest.display());
    }
    Ok(())
}

/// Mount the ESP and install a release's boot entries.
pub(crate) fn update_esp(
    device: &Utf8Path,
    bootloader: &Utf8Path,
    boot_image: &Utf8Path,
    tag: u64,
) -> Result<(), BootUpdateError> {
    let mount = EspMount::new(device).map_err(|source| BootUpdateError::Mount {
        device: device.to_owned(),
        source,
    })?;
    install_boot_entries(mount.path(), bootloader, boot_image, tag)?;
    // Surface unmount errors rather than relying on drop; durability of
    // a FAT filesystem is only assured once it is cleanly unmounted.
    mount.unmount().map_err(BootUpdateError::Unmount)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_boot_entries() {
        let td = tempfile::tempdir().unwrap();
        let artifacts = tempfile::tempdir().unwrap();
        let bootloader = Utf8PathBuf::try_from(artifacts.path().join("systemd-bootx64.efi"))
            .unwrap();
        let uki = Utf8PathBuf::try_from(artifacts.path().join("ferrite_7.efi")).unwrap();
        std::fs::write(&bootloader, b"loader-v2").unwrap();
        std::fs::write(&uki, b"uki-build-7").unwrap();

        install_boot_entries(td.path(), &bootloader, &uki, 7).unwrap();

        let esp = td.path();
        assert_eq!(
            std::fs::read(esp.join("EFI/systemd/systemd-bootx64.efi")).unwrap(),
            b"loader-v2"
        );
        assert_eq!(
            std::fs::read(esp.join("EFI/BOOT/BOOTX64.EFI")).unwrap(),
            b"loader-v2"
        );
        assert_eq!(
            std::fs::read(esp.join("EFI/Linux/ferrite_7.efi")).unwrap(),
            b"uki-build-7"
        );
    }

    #[test]
    fn test_install_boot_entries_overwrites() {
        let td = tempfile::tempdir().unwrap();
        let artifacts = tempfile::tempdir().unwrap();
        let bootloader = Utf8PathBuf::try_from(artifacts.path().join("systemd-bootx64.efi"))
            .unwrap();
        let uki = Utf8PathBuf::try_from(artifacts.path().join("ferrite_8.efi")).unwrap();
        std::fs::write(&bootloader, b"loader-v3").unwrap();
        std::fs::write(&uki, b"uki-build-8").unwrap();

        // Pre-populate with the previous release's entries
        let canonical = td.path().join("EFI/systemd/systemd-bootx64.efi");
        std::fs::create_dir_all(canonical.parent().unwrap()).unwrap();
        std::fs::write(&canonical, b"loader-v2").unwrap();
        let old_uki = td.path().join("EFI/Linux/ferrite_7.efi");
        std::fs::create_dir_all(old_uki.parent().unwrap()).unwrap();
        std::fs::write(&old_uki, b"uki-build-7").unwrap();

        install_boot_entries(td.path(), &bootloader, &uki, 8).unwrap();

        assert_eq!(std::fs::read(&canonical).unwrap(), b"loader-v3");
        // Prior releases stay on the ESP; the new tagged image is added
        assert_eq!(std::fs::read(&old_uki).unwrap(), b"uki-build-7");
        assert_eq!(
            std::fs::read(td.path().join("EFI/Linux/ferrite_8.efi")).unwrap(),
            b"uki-build-8"
        );
    }

    #[test]
    fn test_install_boot_entries_missing_artifact() {
        let td = tempfile::tempdir().unwrap();
        let missing = Utf8PathBuf::from("/no/such/loader.efi");
        let e = install_boot_entries(td.path(), &missing, &missing, 1).unwrap_err();
        assert!(matches!(e, BootUpdateError::Install { .. }), "{e}");
    }
}
