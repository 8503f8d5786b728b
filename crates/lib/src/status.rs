//! Reporting the booted slot and update target.

use anyhow::Result;
use camino::Utf8PathBuf;
use serde::Serialize;

use crate::detect::BootedSystem;
use crate::slot::Slot;

#[derive(Debug, clap::Args)]
pub(crate) struct StatusOpts {
    /// Emit machine-readable JSON instead of text.
    #[clap(long)]
    pub(crate) json: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct Status {
    disk: Utf8PathBuf,
    booted_slot: Slot,
    root_partition: Utf8PathBuf,
    target_slot: Slot,
    target_root: Utf8PathBuf,
    target_verity: Utf8PathBuf,
}

impl From<&BootedSystem> for Status {
    fn from(booted: &BootedSystem) -> Self {
        let target = booted.update_target();
        Self {
            disk: booted.disk.clone(),
            booted_slot: booted.slot,
            root_partition: booted.root_partition.clone(),
            target_slot: target.slot,
            target_root: target.root,
            target_verity: target.verity,
        }
    }
}

pub(crate) fn status(opts: StatusOpts) -> Result<()> {
    let booted = BootedSystem::detect()?;
    let status = Status::from(&booted);
    if opts.json {
        let mut stdout = std::io::stdout().lock();
        serde_json::to_writer_pretty(&mut stdout, &status)?;
        println!();
    } else {
        println!("Disk: {}", status.disk);
        println!(
            "Booted slot: {} (root {})",
            status.booted_slot, status.root_partition
        );
        println!(
            "Update target: slot {} (root {}, verity {})",
            status.target_slot, status.target_root, status.target_verity
        );
    }
    Ok(())
}
