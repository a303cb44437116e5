//! Metadata volume provisioning state machine.
//!
//! ```text
//! Absent → Created → Attached → Formatted → Mounted → Populated → Done
//!    └─────────┴──────────┴──────────┴──────────┴──────────┴──► Failed
//! ```
//!
//! Every `Advance` performs exactly one step. A failing step rolls back
//! whatever exists at that point (unmount, release the device handle,
//! delete the image) before entering `Failed`, so a half-built volume is
//! never left behind for a guest to boot from.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use statig::prelude::*;
use tracing::{debug, info, warn};

use crate::vm::resources::{METADATA_LABEL, MetadataVolume};
use crate::vm::tools::VolumeTools;

/// Attempts made while waiting for the attached handle to show up.
pub const ATTACH_ATTEMPTS: u32 = 10;
pub const ATTACH_INTERVAL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum MetadataEvent {
    /// Perform the next provisioning step.
    Advance,
}

/// Step names used in failures and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataStep {
    Create,
    Attach,
    Format,
    Mount,
    Copy,
    Release,
}

impl fmt::Display for MetadataStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetadataStep::Create => "create",
            MetadataStep::Attach => "attach",
            MetadataStep::Format => "format",
            MetadataStep::Mount => "mount",
            MetadataStep::Copy => "copy",
            MetadataStep::Release => "release",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionFailure {
    pub step: MetadataStep,
    pub diagnostic: String,
}

// ---------------------------------------------------------------------------
// Shared storage
// ---------------------------------------------------------------------------

pub struct MetadataMachine {
    volume: MetadataVolume,
    tools: Arc<dyn VolumeTools>,
    attach_interval: Duration,
}

impl MetadataMachine {
    pub fn new(volume: MetadataVolume, tools: Arc<dyn VolumeTools>) -> Self {
        Self {
            volume,
            tools,
            attach_interval: ATTACH_INTERVAL,
        }
    }

    pub fn with_attach_interval(mut self, interval: Duration) -> Self {
        self.attach_interval = interval;
        self
    }

    /// Drive the machine until it settles in `Done` or `Failed`.
    pub fn run(self) -> Result<(), ProvisionFailure> {
        let mut machine = self.state_machine();
        loop {
            machine.handle(&MetadataEvent::Advance);
            match machine.state() {
                State::Done {} => return Ok(()),
                State::Failed { failure } => return Err(failure.clone()),
                _ => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // Step implementations
    // ------------------------------------------------------------------

    fn create_image(&self) -> std::io::Result<()> {
        if let Some(parent) = self.volume.image.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create_new(&self.volume.image)?;
        // Written out rather than sparse so the volume is fully allocated.
        let zeros = vec![0u8; self.volume.image_size() as usize];
        file.write_all(&zeros)?;
        file.sync_all()
    }

    fn attach(&self) -> Result<PathBuf, (Option<PathBuf>, String)> {
        let device = self
            .tools
            .attach(&self.volume.image)
            .map_err(|diag| (None, diag))?;

        for attempt in 0..ATTACH_ATTEMPTS {
            if self.tools.is_block_device(&device) {
                return Ok(device);
            }
            debug!(device = %device.display(), attempt, "waiting for block device");
            std::thread::sleep(self.attach_interval);
        }

        let diag = format!(
            "{} did not become a block device after {ATTACH_ATTEMPTS} attempts",
            device.display()
        );
        Err((Some(device), diag))
    }

    fn copy_seed_files(&self) -> Result<(), String> {
        for (name, source) in self.volume.seed_files() {
            if !source.is_file() {
                debug!(source = %source.display(), "seed file absent, skipping");
                continue;
            }
            let target = self.volume.mount_point.join(name);
            std::fs::copy(source, &target)
                .map_err(|e| format!("copy {} to {}: {e}", source.display(), target.display()))?;
            debug!(source = %source.display(), target = %target.display(), "copied seed file");
        }
        Ok(())
    }

    fn release(&self, device: &Path) -> Result<(), String> {
        self.tools.unmount(device, &self.volume.mount_point)?;
        self.tools.detach(device)
    }

    /// Undo everything that may exist, then enter `Failed`.
    fn fail(
        &mut self,
        step: MetadataStep,
        diagnostic: String,
        device: Option<&Path>,
        mounted: bool,
    ) -> Outcome<State> {
        warn!(
            image = %self.volume.image.display(),
            %step,
            %diagnostic,
            "metadata provisioning failed, rolling back"
        );
        if let Some(device) = device {
            if mounted {
                if let Err(e) = self.tools.unmount(device, &self.volume.mount_point) {
                    warn!(device = %device.display(), error = %e, "rollback unmount failed");
                }
            }
            if let Err(e) = self.tools.detach(device) {
                warn!(device = %device.display(), error = %e, "rollback detach failed");
            }
        }
        match std::fs::remove_file(&self.volume.image) {
            Ok(()) => debug!(image = %self.volume.image.display(), "removed partial image"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(image = %self.volume.image.display(), error = %e, "rollback delete failed"),
        }
        Transition(State::failed(ProvisionFailure { step, diagnostic }))
    }
}

// ---------------------------------------------------------------------------
// State machine implementation
// ---------------------------------------------------------------------------

#[state_machine(initial = "State::absent()", state(derive(Debug, Clone, PartialEq)))]
impl MetadataMachine {
    /// No image file yet.
    #[state]
    fn absent(&mut self, event: &MetadataEvent) -> Outcome<State> {
        match event {
            MetadataEvent::Advance => match self.create_image() {
                Ok(()) => Transition(State::created()),
                // Someone else's file; nothing of ours to roll back.
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    Transition(State::failed(ProvisionFailure {
                        step: MetadataStep::Create,
                        diagnostic: e.to_string(),
                    }))
                }
                Err(e) => self.fail(MetadataStep::Create, e.to_string(), None, false),
            },
        }
    }

    /// Zero-filled image exists on disk.
    #[state]
    fn created(&mut self, event: &MetadataEvent) -> Outcome<State> {
        match event {
            MetadataEvent::Advance => match self.attach() {
                Ok(device) => {
                    debug!(device = %device.display(), "image attached");
                    Transition(State::attached(device))
                }
                Err((device, diag)) => {
                    self.fail(MetadataStep::Attach, diag, device.as_deref(), false)
                }
            },
        }
    }

    /// Image is bound to `device`.
    #[state]
    fn attached(&mut self, event: &MetadataEvent, device: &PathBuf) -> Outcome<State> {
        match event {
            MetadataEvent::Advance => match self.tools.format(device, METADATA_LABEL) {
                Ok(()) => Transition(State::formatted(device.clone())),
                Err(diag) => self.fail(MetadataStep::Format, diag, Some(device.as_path()), false),
            },
        }
    }

    #[state]
    fn formatted(&mut self, event: &MetadataEvent, device: &PathBuf) -> Outcome<State> {
        match event {
            MetadataEvent::Advance => {
                match self.tools.mount(device, &self.volume.mount_point) {
                    Ok(()) => Transition(State::mounted(device.clone())),
                    Err(diag) => self.fail(MetadataStep::Mount, diag, Some(device.as_path()), false),
                }
            }
        }
    }

    #[state]
    fn mounted(&mut self, event: &MetadataEvent, device: &PathBuf) -> Outcome<State> {
        match event {
            MetadataEvent::Advance => match self.copy_seed_files() {
                Ok(()) => Transition(State::populated(device.clone())),
                Err(diag) => self.fail(MetadataStep::Copy, diag, Some(device.as_path()), true),
            },
        }
    }

    /// Seed files are in place; unmount and release the handle.
    #[state]
    fn populated(&mut self, event: &MetadataEvent, device: &PathBuf) -> Outcome<State> {
        match event {
            MetadataEvent::Advance => match self.release(device) {
                Ok(()) => {
                    info!(image = %self.volume.image.display(), "metadata volume ready");
                    Transition(State::done())
                }
                Err(diag) => self.fail(MetadataStep::Release, diag, Some(device.as_path()), true),
            },
        }
    }

    #[state]
    fn done(&mut self, event: &MetadataEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }

    #[state]
    fn failed(&mut self, event: &MetadataEvent, failure: &ProvisionFailure) -> Outcome<State> {
        let _ = (event, failure);
        Handled
    }
}
