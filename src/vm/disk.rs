//! Drive image provisioning.
//!
//! Missing images are created as qcow2 with `qemu-img create`, chained to
//! the drive's base image when one is configured. Existing images are left
//! untouched so a VM keeps its disks across runs.

use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info};

use super::resources::Drive;
use super::tools::run_tool_blocking;
use crate::error::{Result, VmError};

/// `qemu-img` arguments that create `drive`'s backing file.
pub fn create_image_args(drive: &Drive) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["create".into(), "-f".into(), "qcow2".into()];
    if let Some(base) = &drive.base_image {
        args.extend(["-b".into(), base.as_os_str().to_owned(), "-F".into(), "qcow2".into()]);
    }
    args.push(drive.file.as_os_str().to_owned());
    args.push(drive.size.clone().into());
    args
}

/// Make sure `drive`'s image exists. Returns `true` when it had to be created.
pub fn ensure_drive(drive: &Drive, qemu_img: &Path, timeout: Duration) -> Result<bool> {
    if drive.exists() {
        debug!(file = %drive.file.display(), "drive image already present");
        return Ok(false);
    }

    let args = create_image_args(drive);
    let out = run_tool_blocking(qemu_img, &args, timeout)
        .map_err(|diag| VmError::provisioning(drive.file.display(), "create", diag))?;

    info!(
        file = %drive.file.display(),
        size = %drive.size,
        base = ?drive.base_image,
        output = %out,
        "created drive image"
    );
    Ok(true)
}

/// Remove `drive`'s image. An already missing file is not an error.
pub fn delete_drive(drive: &Drive) -> Result<()> {
    match std::fs::remove_file(&drive.file) {
        Ok(()) => {
            debug!(file = %drive.file.display(), "deleted drive image");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
