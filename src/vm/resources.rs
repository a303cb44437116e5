//! Resource descriptors derived from a [`VmSpec`](super::spec::VmSpec).
//!
//! These are plain values: building them touches the filesystem only to
//! resolve absolute paths and to check whether an optional base image is
//! really there.

use std::path::{Path, PathBuf};

use tracing::warn;

use super::spec::{BusType, DriveSpec, MetadataSpec, NetBackend, NicSpec};
use crate::error::Result;
use crate::settings::Settings;

/// Fixed geometry of the metadata volume: 2880 sectors of 512 bytes.
pub const METADATA_SECTOR_SIZE: u64 = 512;
pub const METADATA_SECTOR_COUNT: u64 = 2880;
/// Volume label cloud-init looks for.
pub const METADATA_LABEL: &str = "CIDATA";

// ---------------------------------------------------------------------------
// Drive
// ---------------------------------------------------------------------------

/// One disk image attached to the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Drive {
    /// Position in `drives`; doubles as the boot index.
    pub index: usize,
    /// Drive id on the hypervisor command line (the file name from the spec).
    pub id: String,
    pub bus: BusType,
    /// Absolute path of the backing image inside the VM directory.
    pub file: PathBuf,
    /// Read-only parent for copy-on-write images.
    pub base_image: Option<PathBuf>,
    pub size: String,
}

impl Drive {
    pub fn from_spec(
        spec: &DriveSpec,
        index: usize,
        vm_dir: &Path,
        settings: &Settings,
    ) -> Result<Self> {
        let base_image = match &spec.baseimage {
            Some(name) => {
                let path = settings.image_path(name)?;
                if path.is_file() {
                    Some(path)
                } else {
                    warn!(drive = %spec.file, base = %path.display(), "base image not found, creating blank image");
                    None
                }
            }
            None => None,
        };

        Ok(Self {
            index,
            id: spec.file.clone(),
            bus: spec.bustype,
            file: std::path::absolute(vm_dir.join(&spec.file))?,
            base_image,
            size: spec.size.clone(),
        })
    }

    pub fn exists(&self) -> bool {
        self.file.is_file()
    }
}

// ---------------------------------------------------------------------------
// NetworkInterface
// ---------------------------------------------------------------------------

/// One guest NIC. Without a MAC address the interface is treated as disabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    pub index: usize,
    pub model: String,
    pub backend: NetBackend,
    pub mac: Option<String>,
    pub sock: Option<String>,
    pub ifname: Option<String>,
}

impl NetworkInterface {
    pub fn from_spec(spec: &NicSpec, index: usize) -> Self {
        Self {
            index,
            model: spec.devtype.clone(),
            backend: spec.backend,
            mac: spec.mac.clone(),
            sock: spec.sock.clone(),
            ifname: spec.ifname.clone(),
        }
    }

    /// Id shared by the `-netdev` backend and the `-device` frontend.
    pub fn netdev_id(&self) -> String {
        format!("mynet{}", self.index)
    }

    pub fn is_enabled(&self) -> bool {
        self.mac.is_some()
    }

    /// Value of the `-netdev` option.
    pub fn netdev_param(&self) -> String {
        let mut out = vec![
            self.backend.as_str().to_string(),
            format!("id={}", self.netdev_id()),
        ];
        if let Some(sock) = &self.sock {
            out.push(format!("sock={sock}"));
        }
        if self.backend == NetBackend::HostBridge {
            if let Some(ifname) = &self.ifname {
                out.push(format!("ifname={ifname}"));
            }
        }
        out.join(",")
    }

    /// Value of the `-device` option.
    pub fn device_param(&self) -> String {
        let mut out = vec![self.model.clone(), format!("netdev={}", self.netdev_id())];
        if let Some(mac) = &self.mac {
            out.push(format!("mac={mac}"));
        }
        out.join(",")
    }
}

// ---------------------------------------------------------------------------
// MetadataVolume
// ---------------------------------------------------------------------------

/// Small FAT volume carrying cloud-init seed files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataVolume {
    pub image: PathBuf,
    pub meta_data: Option<PathBuf>,
    pub user_data: Option<PathBuf>,
    pub network_config: Option<PathBuf>,
    /// Where the volume is mounted while it is being populated.
    pub mount_point: PathBuf,
}

impl MetadataVolume {
    pub fn from_spec(spec: &MetadataSpec, vm_dir: &Path, settings: &Settings) -> Result<Self> {
        let resolve = |file: &Option<String>| -> Result<Option<PathBuf>> {
            file.as_ref()
                .map(|f| std::path::absolute(vm_dir.join(f)))
                .transpose()
                .map_err(Into::into)
        };

        Ok(Self {
            image: std::path::absolute(vm_dir.join(&spec.file))?,
            meta_data: resolve(&spec.meta_data)?,
            user_data: resolve(&spec.user_data)?,
            network_config: resolve(&spec.network_config)?,
            mount_point: settings.metadata_mount_point.clone(),
        })
    }

    pub fn image_size(&self) -> u64 {
        METADATA_SECTOR_SIZE * METADATA_SECTOR_COUNT
    }

    /// Configured seed files paired with their name inside the volume.
    pub fn seed_files(&self) -> Vec<(&'static str, &Path)> {
        [
            ("meta-data", self.meta_data.as_deref()),
            ("user-data", self.user_data.as_deref()),
            ("network-config", self.network_config.as_deref()),
        ]
        .into_iter()
        .filter_map(|(name, path)| path.map(|p| (name, p)))
        .collect()
    }
}
