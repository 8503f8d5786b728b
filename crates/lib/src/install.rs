//! One-shot provisioning of a bare disk.
//!
//! This is destructive and non-recoverable: any partitioning or
//! formatting failure leaves the disk in an undefined state and the
//! operator restarts from a clean disk. The partition indices written
//! here are the contract the updater's slot table depends on.

use std::os::unix::fs::FileTypeExt;
use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use thiserror::Error;

use crate::blockdev;
use crate::blockwrite::write_image;
use crate::config::Config;
use crate::esp;
use crate::fetch::{
    boot_image_artifact, FetchedRelease, ReleaseClient, BOOTLOADER_ARTIFACT, ROOT_IMAGE_ARTIFACT,
    VERITY_ARTIFACT,
};
use crate::slot::{Slot, DATA_PARTNO, ESP_PARTNO};
use ferrite_utils::CommandRunExt;

/// GPT type GUID for the EFI system partition.
pub(crate) const ESP_GUID: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";
/// GPT type GUID for x86-64 root partitions.
pub(crate) const ROOT_GUID: &str = "4F68BCE3-E8CD-4DB1-96E7-FBCAF984B709";
/// GPT type GUID for x86-64 dm-verity partitions.
pub(crate) const VERITY_GUID: &str = "2C7357ED-EBD2-46D9-AEC1-23D437EC2BF5";
/// GPT type GUID for generic Linux filesystem data.
pub(crate) const DATA_GUID: &str = "0FC63DAF-8483-4772-8E79-3D69D8477DE4";

struct PartitionSpec {
    partno: u32,
    /// None takes the rest of the disk.
    size: Option<&'static str>,
    type_guid: &'static str,
    label: &'static str,
}

/// The fixed six-partition layout. The index order is the provisioning
/// contract the slot table encodes; never reorder.
const LAYOUT: &[PartitionSpec] = &[
    PartitionSpec {
        partno: 1,
        size: Some("512M"),
        type_guid: ESP_GUID,
        label: "esp",
    },
    PartitionSpec {
        partno: 2,
        size: Some("4G"),
        type_guid: ROOT_GUID,
        label: "root-a",
    },
    PartitionSpec {
        partno: 3,
        size: Some("256M"),
        type_guid: VERITY_GUID,
        label: "verity-a",
    },
    PartitionSpec {
        partno: 4,
        size: Some("4G"),
        type_guid: ROOT_GUID,
        label: "root-b",
    },
    PartitionSpec {
        partno: 5,
        size: Some("256M"),
        type_guid: VERITY_GUID,
        label: "verity-b",
    },
    PartitionSpec {
        partno: 6,
        size: None,
        type_guid: DATA_GUID,
        label: "data",
    },
];

#[derive(Debug, clap::Args)]
pub(crate) struct InstallOpts {
    /// Target disk. All existing content will be destroyed.
    pub(crate) device: Utf8PathBuf,

    /// Install from a local artifact directory instead of downloading
    /// the latest release from the release endpoint.
    #[clap(long)]
    pub(crate) artifacts: Option<Utf8PathBuf>,
}

/// A destructive provisioning step failed. There is no partial-state
/// recovery; restart from a clean disk.
#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("{device} is not a block device")]
    NotBlockDevice { device: Utf8PathBuf },
    #[error("inspecting {device}")]
    Inspect {
        device: Utf8PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("partitioning {device}")]
    Partition {
        device: Utf8PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("formatting {device}")]
    Format {
        device: Utf8PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

/// Release artifacts staged in a local directory (`--artifacts`),
/// e.g. straight out of an image build.
#[derive(Debug)]
pub(crate) struct LocalArtifacts {
    dir: Utf8PathBuf,
    tag: u64,
}

impl LocalArtifacts {
    /// The directory must hold the three fixed-name artifacts plus
    /// exactly one tagged boot image, which supplies the release tag.
    #[context("Scanning artifact directory {dir}")]
    pub(crate) fn scan(dir: &Utf8Path) -> Result<Self> {
        for name in [BOOTLOADER_ARTIFACT, ROOT_IMAGE_ARTIFACT, VERITY_ARTIFACT] {
            let path = dir.join(name);
            if !path.try_exists()? {
                anyhow::bail!("missing artifact {path}");
            }
        }
        let pattern = regex::Regex::new(r"^ferrite_([0-9]+)\.efi$").expect("static pattern");
        let mut tags = Vec::new();
        for entry in dir
            .read_dir_utf8()
            .with_context(|| format!("reading {dir}"))?
        {
            let entry = entry?;
            if let Some(caps) = pattern.captures(entry.file_name()) {
                tags.push(caps[1].parse::<u64>().context("parsing boot image tag")?);
            }
        }
        tags.sort_unstable();
        let tag = match tags.as_slice() {
            [] => anyhow::bail!("no tagged boot image (ferrite_<tag>.efi) in {dir}"),
            [tag] => *tag,
            multiple => anyhow::bail!("multiple tagged boot images in {dir}: {multiple:?}"),
        };
        Ok(Self {
            dir: dir.to_owned(),
            tag,
        })
    }
}

/// The artifact set an install writes, wherever it came from.
#[derive(Debug)]
pub(crate) enum ReleaseArtifacts {
    Fetched(FetchedRelease),
    Local(LocalArtifacts),
}

impl ReleaseArtifacts {
    pub(crate) fn tag(&self) -> u64 {
        match self {
            ReleaseArtifacts::Fetched(f) => f.tag,
            ReleaseArtifacts::Local(l) => l.tag,
        }
    }

    pub(crate) fn bootloader(&self) -> Utf8PathBuf {
        match self {
            ReleaseArtifacts::Fetched(f) => f.bootloader(),
            ReleaseArtifacts::Local(l) => l.dir.join(BOOTLOADER_ARTIFACT),
        }
    }

    pub(crate) fn boot_image(&self) -> Utf8PathBuf {
        match self {
            ReleaseArtifacts::Fetched(f) => f.boot_image(),
            ReleaseArtifacts::Local(l) => l.dir.join(boot_image_artifact(l.tag)),
        }
    }

    pub(crate) fn root_image(&self) -> Utf8PathBuf {
        match self {
            ReleaseArtifacts::Fetched(f) => f.root_image(),
            ReleaseArtifacts::Local(l) => l.dir.join(ROOT_IMAGE_ARTIFACT),
        }
    }

    pub(crate) fn verity(&self) -> Utf8PathBuf {
        match self {
            ReleaseArtifacts::Fetched(f) => f.verity(),
            ReleaseArtifacts::Local(l) => l.dir.join(VERITY_ARTIFACT),
        }
    }
}

fn validate_target(device: &Utf8Path) -> Result<(), PartitionError> {
    let meta = std::fs::metadata(device).map_err(|e| PartitionError::Inspect {
        device: device.to_owned(),
        source: e.into(),
    })?;
    if !meta.file_type().is_block_device() {
        return Err(PartitionError::NotBlockDevice {
            device: device.to_owned(),
        });
    }
    Ok(())
}

/// The sgdisk arguments creating the fixed layout.
fn sgdisk_create_args() -> Vec<String> {
    let mut args = Vec::new();
    for spec in LAYOUT {
        let end = spec
            .size
            .map(|s| format!("+{s}"))
            .unwrap_or_else(|| "0".into());
        args.push("-n".into());
        args.push(format!("{}:0:{end}", spec.partno));
        args.push("-t".into());
        args.push(format!("{}:{}", spec.partno, spec.type_guid));
        args.push("-c".into());
        args.push(format!("{}:{}", spec.partno, spec.label));
    }
    args
}

fn partition_disk(device: &Utf8Path) -> Result<(), PartitionError> {
    let partition_err = |source: anyhow::Error| PartitionError::Partition {
        device: device.to_owned(),
        source,
    };
    Command::new("sgdisk")
        .arg("--zap-all")
        .arg(device.as_str())
        .log_debug()
        .run_capture_stderr()
        .map_err(partition_err)?;
    Command::new("sgdisk")
        .args(sgdisk_create_args())
        .arg(device.as_str())
        .log_debug()
        .run_capture_stderr()
        .map_err(partition_err)?;
    // Wait for the kernel to rediscover the partition nodes before we
    // format or write anything.
    Command::new("udevadm")
        .arg("settle")
        .run_capture_stderr()
        .map_err(partition_err)?;
    Ok(())
}

fn format_esp(device: &Utf8Path) -> Result<(), PartitionError> {
    Command::new("mkfs.fat")
        .args(["-F", "32", "-n", "ESP"])
        .arg(device.as_str())
        .log_debug()
        .run_capture_stderr()
        .map_err(|source| PartitionError::Format {
            device: device.to_owned(),
            source,
        })
}

fn format_data(device: &Utf8Path) -> Result<(), PartitionError> {
    Command::new("mkfs.ext4")
        .args(["-F", "-q", "-L", "data"])
        .arg(device.as_str())
        .log_debug()
        .run_capture_stderr()
        .map_err(|source| PartitionError::Format {
            device: device.to_owned(),
            source,
        })
}

#[context("Installing to {}", opts.device)]
pub(crate) async fn install(opts: InstallOpts) -> Result<()> {
    let device = &opts.device;
    validate_target(device)?;
    let dev = blockdev::list_dev(device).map_err(|source| PartitionError::Inspect {
        device: device.clone(),
        source,
    })?;
    println!(
        "Installing to {device} ({}, {} bytes)",
        dev.model.as_deref().unwrap_or("unknown model"),
        dev.size
    );

    // Resolve artifacts before touching the disk; a fetch failure must
    // leave the target untouched.
    let release = match &opts.artifacts {
        Some(dir) => ReleaseArtifacts::Local(LocalArtifacts::scan(dir)?),
        None => {
            let config = Config::load()?;
            let client = ReleaseClient::new(&config.releases.endpoint);
            ReleaseArtifacts::Fetched(client.fetch_latest().await?)
        }
    };
    println!("Installing release build-{}", release.tag());

    partition_disk(device)?;
    println!("Created {} partitions on {device}", LAYOUT.len());

    let esp_part = blockdev::partition_device(device, ESP_PARTNO);
    format_esp(&esp_part)?;
    let data_part = blockdev::partition_device(device, DATA_PARTNO);
    format_data(&data_part)?;

    // Only slot A is populated; slot B stays empty until the first update.
    let slot = Slot::A;
    let root_part = blockdev::partition_device(device, slot.root_partno());
    let n = write_image(&release.root_image(), &root_part)?;
    println!("Wrote root image to {root_part} ({n} bytes)");
    let verity_part = blockdev::partition_device(device, slot.verity_partno());
    let n = write_image(&release.verity(), &verity_part)?;
    println!("Wrote verity companion to {verity_part} ({n} bytes)");

    esp::update_esp(
        &esp_part,
        &release.bootloader(),
        &release.boot_image(),
        release.tag(),
    )?;
    println!(
        "Installed build-{} to slot {slot}; boot entries written to {esp_part}",
        release.tag()
    );
    Ok(())
}
