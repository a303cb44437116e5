//! The per-VM specification document (`<vmdir>/specs.json`).
//!
//! Field names follow the on-disk format; defaults match what older
//! documents relied on when a key was left out.

use std::path::Path;

use serde::{Deserialize, Deserializer};

use crate::error::{Result, VmError};

pub const SPECS_FILE: &str = "specs.json";

/// Guest architecture, named after the hypervisor binary that runs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum Arch {
    #[default]
    #[serde(rename = "qemu-system-aarch64")]
    Aarch64,
    #[serde(rename = "qemu-system-x86_64")]
    X86_64,
}

impl Arch {
    pub fn binary_name(self) -> &'static str {
        match self {
            Arch::Aarch64 => "qemu-system-aarch64",
            Arch::X86_64 => "qemu-system-x86_64",
        }
    }
}

/// Storage bus a drive is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum BusType {
    #[default]
    #[serde(rename = "virtio-blk")]
    VirtioBlk,
    #[serde(rename = "scsi-hd")]
    ScsiHd,
    #[serde(rename = "ide-hd")]
    IdeHd,
}

impl BusType {
    /// Device model name used in the `-device` clause.
    pub fn device_model(self) -> &'static str {
        match self {
            BusType::VirtioBlk => "virtio-blk",
            BusType::ScsiHd => "scsi-hd",
            BusType::IdeHd => "ide-hd",
        }
    }
}

/// Network backend type (`-netdev <type>,…`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum NetBackend {
    /// Host-only vmnet network.
    #[default]
    #[serde(rename = "vmnet-host")]
    HostOnly,
    #[serde(rename = "vmnet-shared")]
    Shared,
    /// Bridged onto a host interface named by `ifname`.
    #[serde(rename = "vmnet-bridged")]
    HostBridge,
    #[serde(rename = "user")]
    User,
    #[serde(rename = "socket")]
    Socket,
}

impl NetBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            NetBackend::HostOnly => "vmnet-host",
            NetBackend::Shared => "vmnet-shared",
            NetBackend::HostBridge => "vmnet-bridged",
            NetBackend::User => "user",
            NetBackend::Socket => "socket",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DriveSpec {
    /// Image file name, relative to the VM directory. Also used as drive id.
    pub file: String,
    /// Optional base image, relative to the images directory.
    #[serde(default)]
    pub baseimage: Option<String>,
    #[serde(default = "default_drive_size")]
    pub size: String,
    #[serde(default)]
    pub bustype: BusType,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NicSpec {
    /// Interfaces without a MAC address are left out of the command line.
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(rename = "type", default)]
    pub backend: NetBackend,
    #[serde(default)]
    pub sock: Option<String>,
    #[serde(default = "default_nic_model")]
    pub devtype: String,
    #[serde(default)]
    pub ifname: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetadataSpec {
    #[serde(default = "default_metadata_file")]
    pub file: String,
    #[serde(rename = "meta-data", default)]
    pub meta_data: Option<String>,
    #[serde(rename = "user-data", default)]
    pub user_data: Option<String>,
    #[serde(rename = "network-config", default)]
    pub network_config: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CdromSpec {
    /// ISO file name, relative to the images directory.
    pub iso: String,
}

/// Declarative description of one VM. Loaded once, never mutated.
#[derive(Debug, Clone, Deserialize)]
pub struct VmSpec {
    #[serde(default)]
    pub arch: Arch,
    #[serde(default = "default_cpus", deserialize_with = "string_or_number")]
    pub cpus: String,
    #[serde(default = "default_ram", deserialize_with = "string_or_number")]
    pub ram: String,
    #[serde(default)]
    pub bios: Option<String>,
    /// Display device model; absent means headless.
    #[serde(default)]
    pub video: Option<String>,
    #[serde(default)]
    pub drives: Vec<DriveSpec>,
    #[serde(default)]
    pub netdev: Vec<NicSpec>,
    #[serde(default)]
    pub metadata: Option<MetadataSpec>,
    #[serde(default)]
    pub cdrom: Option<CdromSpec>,
}

impl VmSpec {
    /// Read `specs.json` from `vm_dir`.
    pub fn load(vm_dir: &Path) -> Result<Self> {
        let path = vm_dir.join(SPECS_FILE);
        if !path.is_file() {
            return Err(VmError::config(
                SPECS_FILE,
                format!("{} does not exist", path.display()),
            ));
        }
        let text = std::fs::read_to_string(&path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| VmError::config(SPECS_FILE, e.to_string()))
    }

    pub fn uefi(&self) -> bool {
        self.bios.as_deref() == Some("uefi")
    }
}

fn default_drive_size() -> String {
    "1G".to_string()
}

fn default_nic_model() -> String {
    "e1000".to_string()
}

fn default_metadata_file() -> String {
    "floppy.img".to_string()
}

fn default_cpus() -> String {
    "1".to_string()
}

fn default_ram() -> String {
    "1G".to_string()
}

/// `"cpus": 2` and `"cpus": "2"` are both accepted.
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_document_uses_defaults() {
        let spec = VmSpec::from_json("{}").unwrap();
        assert_eq!(spec.arch, Arch::Aarch64);
        assert_eq!(spec.cpus, "1");
        assert_eq!(spec.ram, "1G");
        assert!(spec.drives.is_empty());
        assert!(spec.metadata.is_none());
        assert!(!spec.uefi());
    }

    #[test]
    fn full_document_parses() {
        let spec = VmSpec::from_json(
            r#"{
                "arch": "qemu-system-x86_64",
                "cpus": 4,
                "ram": "4G",
                "bios": "uefi",
                "video": "virtio-gpu-pci",
                "drives": [
                    {"file": "root.qcow2", "baseimage": "debian.qcow2", "size": "20G", "bustype": "scsi-hd"},
                    {"file": "data.qcow2"}
                ],
                "netdev": [
                    {"mac": "52:54:00:12:34:56", "type": "vmnet-bridged", "ifname": "en0"},
                    {"type": "user"}
                ],
                "metadata": {"user-data": "user-data.yaml"},
                "cdrom": {"iso": "install.iso"}
            }"#,
        )
        .unwrap();

        assert_eq!(spec.arch, Arch::X86_64);
        assert_eq!(spec.cpus, "4");
        assert!(spec.uefi());
        assert_eq!(spec.drives[0].bustype, BusType::ScsiHd);
        assert_eq!(spec.drives[1].bustype, BusType::VirtioBlk);
        assert_eq!(spec.drives[1].size, "1G");
        assert_eq!(spec.netdev[0].backend, NetBackend::HostBridge);
        assert_eq!(spec.netdev[1].devtype, "e1000");
        assert!(spec.netdev[1].mac.is_none());
        let metadata = spec.metadata.unwrap();
        assert_eq!(metadata.file, "floppy.img");
        assert_eq!(metadata.user_data.as_deref(), Some("user-data.yaml"));
        assert_eq!(spec.cdrom.unwrap().iso, "install.iso");
    }

    #[test]
    fn unknown_arch_is_configuration_error() {
        let err = VmSpec::from_json(r#"{"arch": "qemu-system-riscv64"}"#).unwrap_err();
        assert!(matches!(err, VmError::Configuration { .. }));
    }

    #[test]
    fn drive_without_file_is_rejected() {
        assert!(VmSpec::from_json(r#"{"drives": [{"size": "1G"}]}"#).is_err());
    }
}
