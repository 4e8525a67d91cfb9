//! `kerf console`: attach to an instance's console character device.
//!
//! Out of core per spec.md §1 ("console attachment over a character
//! device" is an external collaborator, not part of the control plane) —
//! a one-way byte-copy loop from the device to stdout, not a full duplex
//! terminal emulator.

use std::io::{Read, Write};

use anyhow::{Context, Result};

use crate::config::KerfConfig;

/// Copies bytes between stdin/stdout and `instances/<name>/console` until
/// either side closes or returns EOF.
pub fn attach(config: &KerfConfig, name: &str) -> Result<()> {
    let path = config.mount_point.join("instances").join(name).join("console");
    let mut device = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .with_context(|| format!("opening console device {path:?}"))?;

    println!("attached to '{name}' console (Ctrl-D to detach)");

    let mut buf = [0u8; 4096];
    loop {
        let read = device
            .read(&mut buf)
            .with_context(|| format!("reading from console device {path:?}"))?;
        if read == 0 {
            break;
        }
        std::io::stdout()
            .write_all(&buf[..read])
            .context("writing console output to stdout")?;
    }
    Ok(())
}
