//! The A/B update transaction.
//!
//! Ordering is the whole design: both raw writes land and flush before
//! the boot pointer moves, and nothing ever writes to the booted slot.
//! An interruption mid-transaction leaves the target slot partially
//! written and the boot entries untouched, so the system still boots
//! from the current slot and the update can simply be rerun.

use anyhow::Result;
use fn_error_context::context;

use crate::blockdev;
use crate::blockwrite::write_image;
use crate::config::Config;
use crate::detect::BootedSystem;
use crate::esp;
use crate::fetch::ReleaseClient;
use crate::slot::ESP_PARTNO;

#[derive(Debug, clap::Args)]
pub(crate) struct UpdateOpts {
    /// Reboot into the new slot after a successful update.
    #[clap(long)]
    pub(crate) apply: bool,
}

#[context("Updating")]
pub(crate) async fn update(opts: UpdateOpts) -> Result<()> {
    let config = Config::load()?;
    let booted = BootedSystem::detect()?;
    let target = booted.update_target();
    println!(
        "Booted slot {} on {} (root {})",
        booted.slot, booted.disk, booted.root_partition
    );
    // Invariant: an update never writes to the booted pair. The
    // complement computation cannot produce it; assert before the first
    // raw write regardless.
    anyhow::ensure!(
        target.root != booted.root_partition && target.verity != booted.root_partition,
        "update target {}/{} overlaps booted root {}",
        target.root,
        target.verity,
        booted.root_partition
    );

    let client = ReleaseClient::new(&config.releases.endpoint);
    let release = client.fetch_latest().await?;
    println!("Fetched release build-{}", release.tag);

    let n = write_image(&release.root_image(), &target.root)?;
    println!("Wrote root image to {} ({n} bytes)", target.root);
    let n = write_image(&release.verity(), &target.verity)?;
    println!("Wrote verity companion to {} ({n} bytes)", target.verity);

    let esp_part = blockdev::partition_device(&booted.disk, ESP_PARTNO);
    esp::update_esp(
        &esp_part,
        &release.bootloader(),
        &release.boot_image(),
        release.tag,
    )?;
    println!(
        "Boot entries now point at build-{} in slot {}",
        release.tag, target.slot
    );

    if opts.apply {
        crate::reboot::reboot()?;
    } else {
        println!("Reboot to activate slot {}.", target.slot);
    }
    Ok(())
}
