//! Handing control back to the boot process.

use std::io::Write;
use std::process::Command;

use fn_error_context::context;

use ferrite_utils::CommandRunExt;

/// Ask systemd to reboot the machine into the freshly written slot.
/// Only returns on error; on success we stay parked until PID 1
/// terminates us, so callers never race a half-initiated shutdown.
#[context("Initiating reboot")]
pub(crate) fn reboot() -> anyhow::Result<()> {
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    Command::new("systemctl")
        .args(["reboot", "--message=Applying ferrite update"])
        .run_capture_stderr()?;
    tracing::debug!("reboot requested, waiting for SIGTERM");
    loop {
        std::thread::park();
    }
}
