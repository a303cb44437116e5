//! VM orchestration: specification, resources, provisioning, command
//! assembly and hypervisor supervision.
//!
//! ```text
//! VirtualMachine::open(name)      specs.json → Drive / NetworkInterface / MetadataVolume
//!     └─► hypervisor_args()       full argument vector
//!     └─► provision()             disk images + metadata volume (blocking pool)
//!     └─► run(ephemeral)          supervise → optional cleanup → ExitStatus
//! ```

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{Result, VmError};
use crate::settings::Settings;

pub mod command;
pub mod disk;
pub mod lifecycle;
pub mod metadata;
pub mod resources;
pub mod spec;
pub mod tools;

pub use resources::{Drive, MetadataVolume, NetworkInterface};
pub use spec::VmSpec;
pub use tools::{HostVolumeTools, VolumeTools};

// ---------------------------------------------------------------------------
// VirtualMachine
// ---------------------------------------------------------------------------

/// One VM, resolved from `<vm_root>/<name>/specs.json`.
///
/// Concurrent orchestration of the same VM name is not guarded against;
/// callers must run at most one orchestration per VM at a time.
#[derive(Debug, Clone)]
pub struct VirtualMachine {
    pub name: String,
    /// Absolute working directory; drive images and sockets live here.
    pub dir: PathBuf,
    pub spec: VmSpec,
    /// Hypervisor binary selected by `arch`.
    pub binary: PathBuf,
    pub drives: Vec<Drive>,
    pub nics: Vec<NetworkInterface>,
    pub metadata: Option<MetadataVolume>,
    pub settings: Settings,
}

impl VirtualMachine {
    /// Load and validate the VM called `name`. Nothing is created on disk.
    pub fn open(name: &str, settings: &Settings) -> Result<Self> {
        if name.is_empty() || name.contains('/') {
            return Err(VmError::config("name", format!("invalid VM name {name:?}")));
        }
        let dir = settings.vm_dir(name)?;
        if !dir.is_dir() {
            return Err(VmError::config(
                "name",
                format!("VM directory {} doesn't exist", dir.display()),
            ));
        }

        let spec = VmSpec::load(&dir)?;
        Self::from_spec(name, dir, spec, settings)
    }

    /// Build the VM from an already loaded spec.
    pub fn from_spec(name: &str, dir: PathBuf, spec: VmSpec, settings: &Settings) -> Result<Self> {
        let binary = settings.hypervisor_dir.join(spec.arch.binary_name());
        if !binary.is_file() {
            return Err(VmError::config(
                "arch",
                format!("hypervisor binary {} not found", binary.display()),
            ));
        }

        let drives = spec
            .drives
            .iter()
            .enumerate()
            .map(|(index, d)| Drive::from_spec(d, index, &dir, settings))
            .collect::<Result<Vec<_>>>()?;

        let mut seen = HashSet::new();
        for drive in &drives {
            if !seen.insert(&drive.file) {
                return Err(VmError::config(
                    "drives",
                    format!("{} is used by more than one drive", drive.file.display()),
                ));
            }
        }

        let nics = spec
            .netdev
            .iter()
            .enumerate()
            .map(|(index, n)| NetworkInterface::from_spec(n, index))
            .collect();

        let metadata = spec
            .metadata
            .as_ref()
            .map(|m| MetadataVolume::from_spec(m, &dir, settings))
            .transpose()?;

        Ok(Self {
            name: name.to_string(),
            dir,
            spec,
            binary,
            drives,
            nics,
            metadata,
            settings: settings.clone(),
        })
    }

    /// Guest agent socket (`<dir>/<name>.agent`).
    pub fn agent_socket(&self) -> PathBuf {
        self.dir.join(format!("{}.agent", self.name))
    }

    /// Machine monitor socket (`<dir>/<name>.monitor`).
    pub fn monitor_socket(&self) -> PathBuf {
        self.dir.join(format!("{}.monitor", self.name))
    }

    pub fn hypervisor_args(&self) -> Result<Vec<String>> {
        command::build_hypervisor_args(self, &self.settings)
    }

    /// Create missing drive images and the metadata volume.
    ///
    /// Runs on the blocking pool: every step shells out and the attach poll
    /// sleeps between checks.
    pub async fn provision(&self, tools: Arc<dyn VolumeTools>) -> Result<()> {
        let vm = self.clone();
        tokio::task::spawn_blocking(move || vm.provision_blocking(tools))
            .await
            .map_err(|e| VmError::Io(std::io::Error::other(e)))?
    }

    pub fn provision_blocking(&self, tools: Arc<dyn VolumeTools>) -> Result<()> {
        let timeout = self.settings.tool_timeout();
        for drive in &self.drives {
            disk::ensure_drive(drive, &self.settings.qemu_img, timeout)?;
        }
        if let Some(volume) = &self.metadata {
            metadata::provision(volume, tools)?;
        }
        Ok(())
    }

    /// Delete the metadata volume and every drive image.
    pub fn cleanup(&self) -> Result<()> {
        if let Some(volume) = &self.metadata {
            metadata::delete(volume)?;
        }
        for drive in &self.drives {
            disk::delete_drive(drive)?;
        }
        info!(vm = %self.name, "removed VM storage");
        Ok(())
    }

    /// Provision, start and supervise the hypervisor.
    ///
    /// In ephemeral mode storage is deleted after the hypervisor is gone,
    /// whatever its exit status was.
    pub async fn run(&self, tools: Arc<dyn VolumeTools>, ephemeral: bool) -> Result<ExitStatus> {
        // Assemble first so configuration errors surface before anything is created.
        let args = self.hypervisor_args()?;
        self.provision(tools).await?;

        info!(vm = %self.name, ephemeral, "starting VM");
        let result = lifecycle::supervise(&self.binary, &args).await;

        if ephemeral {
            if let Err(e) = self.cleanup() {
                warn!(vm = %self.name, error = %e, "ephemeral cleanup failed");
            }
        }
        result
    }
}
