#![forbid(unsafe_code)]

//! Privilege guard shared by the gateway binaries.

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// The gateway spawns external tools against attacker-supplied URLs, so it
/// refuses to start with root privileges. Run it under a dedicated service
/// account instead.
pub fn refuse_root(binary: &str) -> Result<()> {
    if Uid::current().is_root() {
        bail!("{binary} refuses to run as root; use an unprivileged service account");
    }
    Ok(())
}
