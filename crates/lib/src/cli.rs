//! Command-line surface.

use anyhow::Result;
use clap::{Parser, Subcommand};
use thiserror::Error;

use crate::install::InstallOpts;
use crate::status::StatusOpts;
use crate::update::UpdateOpts;

/// Destructive operations require full root privileges; refuse early
/// rather than failing halfway into a transaction.
#[derive(Debug, Error)]
#[error("this command requires root privileges (uid 0)")]
pub struct PrivilegeError;

/// Provision and update A/B verified-boot systems.
#[derive(Debug, Parser)]
#[clap(name = "ferrite", version)]
pub struct Cli {
    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Provision a bare disk with the A/B layout and a first release.
    Install(InstallOpts),
    /// Write the latest release to the inactive slot and re-point the
    /// bootloader.
    Update(UpdateOpts),
    /// Show the booted slot and the update target.
    Status(StatusOpts),
}

fn require_root() -> Result<(), PrivilegeError> {
    if rustix::process::getuid().is_root() {
        Ok(())
    } else {
        Err(PrivilegeError)
    }
}

/// Parse the process arguments and run the requested operation.
pub async fn run_from_iter<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    match cli.cmd {
        Cmd::Install(opts) => {
            require_root()?;
            crate::install::install(opts).await
        }
        Cmd::Update(opts) => {
            require_root()?;
            crate::update::update(opts).await
        }
        Cmd::Status(opts) => crate::status::status(opts),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_structure() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_install() {
        let cli = Cli::parse_from(["ferrite", "install", "/dev/sda"]);
        let Cmd::Install(opts) = cli.cmd else {
            panic!("expected install")
        };
        assert_eq!(opts.device, "/dev/sda");
        assert!(opts.artifacts.is_none());
        // The disk argument is required
        assert!(Cli::try_parse_from(["ferrite", "install"]).is_err());
    }

    #[test]
    fn test_parse_update_takes_no_arguments() {
        let cli = Cli::parse_from(["ferrite", "update"]);
        let Cmd::Update(opts) = cli.cmd else {
            panic!("expected update")
        };
        assert!(!opts.apply);
        let cli = Cli::parse_from(["ferrite", "update", "--apply"]);
        let Cmd::Update(opts) = cli.cmd else {
            panic!("expected update")
        };
        assert!(opts.apply);
    }

    #[test]
    fn test_parse_status() {
        let cli = Cli::parse_from(["ferrite", "status", "--json"]);
        let Cmd::Status(opts) = cli.cmd else {
            panic!("expected status")
        };
        assert!(opts.json);
    }
}
