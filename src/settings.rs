//! Host-level settings for vm-runner.
//!
//! Settings are looked up in this order:
//!
//! - the file passed with `--config`
//! - `$XDG_CONFIG_HOME/vm-runner/config.toml` (or `~/.config/vm-runner/config.toml`)
//! - built-in defaults
//!
//! Every field is optional in the file; missing keys fall back to the
//! platform default. On macOS the defaults follow a Homebrew QEMU install.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Result, VmError};

const APP_NAME: &str = "vm-runner";
const CONFIG_FILE: &str = "config.toml";

/// All resolved host settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory holding one sub-directory per VM (`<vm_root>/<name>/specs.json`).
    pub vm_root: PathBuf,
    /// Base images and install media are resolved relative to this directory.
    pub images_dir: PathBuf,
    /// Directory containing the `qemu-system-*` binaries.
    pub hypervisor_dir: PathBuf,
    /// Image-creation tool.
    pub qemu_img: PathBuf,
    /// Firmware passed with `-bios` on aarch64.
    pub aarch64_firmware: PathBuf,
    /// UEFI code image mapped as pflash on x86_64 when `bios = "uefi"`.
    pub x86_64_uefi_code: PathBuf,
    /// Hardware accelerator for aarch64 guests.
    pub accelerator: String,
    /// `-display` backend used when a VM asks for a video device.
    pub display_backend: String,
    /// Where the metadata volume is mounted while it is being populated.
    pub metadata_mount_point: PathBuf,
    /// Upper bound for every external tool invocation.
    pub tool_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            vm_root: PathBuf::from("."),
            images_dir: PathBuf::from("images"),
            hypervisor_dir: default_hypervisor_dir(),
            qemu_img: PathBuf::from("qemu-img"),
            aarch64_firmware: PathBuf::from("QEMU_EFI.fd"),
            x86_64_uefi_code: default_uefi_code(),
            accelerator: default_accelerator().to_string(),
            display_backend: default_display().to_string(),
            metadata_mount_point: default_mount_point(),
            tool_timeout_secs: 10,
        }
    }
}

impl Settings {
    /// Load settings from `explicit` if given, otherwise from the per-user
    /// config file when it exists, otherwise return the defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(p) => {
                if !p.is_file() {
                    return Err(VmError::config(
                        "config",
                        format!("{} does not exist", p.display()),
                    ));
                }
                Some(p.to_path_buf())
            }
            None => resolve_config_file().filter(|p| p.is_file()),
        };

        match path {
            Some(path) => {
                let text = std::fs::read_to_string(&path)?;
                let settings = Self::from_toml(&text)
                    .map_err(|e| VmError::config(path.display().to_string(), e))?;
                info!(path = %path.display(), "loaded settings");
                Ok(settings)
            }
            None => {
                debug!("no settings file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn from_toml(text: &str) -> std::result::Result<Self, String> {
        toml::from_str(text).map_err(|e| e.to_string())
    }

    /// Absolute working directory of the VM called `name`.
    pub fn vm_dir(&self, name: &str) -> Result<PathBuf> {
        Ok(std::path::absolute(self.vm_root.join(name))?)
    }

    /// Absolute path of a file inside the images directory.
    pub fn image_path(&self, file: &str) -> Result<PathBuf> {
        Ok(std::path::absolute(self.images_dir.join(file))?)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Platform defaults
// ---------------------------------------------------------------------------

fn resolve_config_file() -> Option<PathBuf> {
    let dir = if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg)
    } else {
        PathBuf::from(std::env::var("HOME").ok()?).join(".config")
    };
    Some(dir.join(APP_NAME).join(CONFIG_FILE))
}

#[cfg(target_os = "macos")]
fn default_hypervisor_dir() -> PathBuf {
    PathBuf::from("/opt/homebrew/bin")
}

#[cfg(not(target_os = "macos"))]
fn default_hypervisor_dir() -> PathBuf {
    PathBuf::from("/usr/bin")
}

#[cfg(target_os = "macos")]
fn default_uefi_code() -> PathBuf {
    PathBuf::from("/opt/homebrew/share/qemu/edk2-x86_64-code.fd")
}

#[cfg(not(target_os = "macos"))]
fn default_uefi_code() -> PathBuf {
    PathBuf::from("/usr/share/OVMF/OVMF_CODE.fd")
}

#[cfg(target_os = "macos")]
fn default_accelerator() -> &'static str {
    "hvf"
}

#[cfg(not(target_os = "macos"))]
fn default_accelerator() -> &'static str {
    "kvm"
}

#[cfg(target_os = "macos")]
fn default_display() -> &'static str {
    "cocoa"
}

#[cfg(not(target_os = "macos"))]
fn default_display() -> &'static str {
    "gtk"
}

#[cfg(target_os = "macos")]
fn default_mount_point() -> PathBuf {
    PathBuf::from("/Volumes/CIDATA")
}

#[cfg(not(target_os = "macos"))]
fn default_mount_point() -> PathBuf {
    PathBuf::from("/mnt/cidata")
}
