//! Metadata (cloud-init seed) volume provisioning.
//!
//! The image file is the idempotency marker: if it exists the volume is
//! considered provisioned and nothing is attached, formatted or mounted.
//! The step sequence and its rollback live in
//! [`crate::state_machine::metadata_sm`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::resources::MetadataVolume;
use super::tools::VolumeTools;
use crate::error::{Result, VmError};
use crate::state_machine::metadata_sm::{ATTACH_INTERVAL, MetadataMachine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataOutcome {
    /// The image was built during this call.
    Created,
    /// The image already existed; no step was performed.
    AlreadyProvisioned,
}

/// Build `volume` unless its image already exists.
pub fn provision(volume: &MetadataVolume, tools: Arc<dyn VolumeTools>) -> Result<MetadataOutcome> {
    provision_with_interval(volume, tools, ATTACH_INTERVAL)
}

/// Like [`provision`], with a custom spacing between block-device checks.
pub fn provision_with_interval(
    volume: &MetadataVolume,
    tools: Arc<dyn VolumeTools>,
    attach_interval: Duration,
) -> Result<MetadataOutcome> {
    if volume.image.exists() {
        debug!(image = %volume.image.display(), "metadata volume already provisioned");
        return Ok(MetadataOutcome::AlreadyProvisioned);
    }

    info!(image = %volume.image.display(), "provisioning metadata volume");
    MetadataMachine::new(volume.clone(), tools)
        .with_attach_interval(attach_interval)
        .run()
        .map_err(|failure| {
            VmError::provisioning(
                volume.image.display(),
                failure.step.to_string(),
                failure.diagnostic,
            )
        })?;
    Ok(MetadataOutcome::Created)
}

/// Remove the metadata image. A missing file is not an error.
pub fn delete(volume: &MetadataVolume) -> Result<()> {
    match std::fs::remove_file(&volume.image) {
        Ok(()) => {
            debug!(image = %volume.image.display(), "deleted metadata volume");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
