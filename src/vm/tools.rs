//! External host tools used while provisioning.
//!
//! Every tool runs through [`run_tool`] on `tokio::process`: stdout and
//! stderr are captured, the wait is bounded, and a non-zero exit is turned
//! into a diagnostic string that carries the tool's stderr. Synchronous
//! provisioning code goes through [`run_tool_blocking`].
//!
//! [`VolumeTools`] is the seam the metadata provisioner talks to. The host
//! implementation uses `hdiutil`/`diskutil` on macOS and
//! `losetup`/`mkfs.fat`/`mount`/`umount` elsewhere.

use std::ffi::OsStr;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

/// Diagnostic text of a failed tool run.
pub type ToolResult<T> = std::result::Result<T, String>;

/// Run `program` with `args`, wait at most `timeout`, and return trimmed stdout.
///
/// Both pipes are read while the tool runs. A tool still running at the
/// deadline is killed when its handle is dropped.
pub async fn run_tool<S: AsRef<OsStr>>(
    program: impl AsRef<OsStr>,
    args: &[S],
    timeout: Duration,
) -> ToolResult<String> {
    let program = program.as_ref();
    let label = program.to_string_lossy().into_owned();
    let printable: Vec<_> = args.iter().map(|a| a.as_ref().to_string_lossy()).collect();
    debug!(tool = %label, args = ?printable, "running tool");

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn `{label}`: {e}"))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| format!("collecting output of `{label}`: {e}"))?,
        Err(_) => {
            return Err(format!(
                "`{label}` did not finish within {}s",
                timeout.as_secs()
            ));
        }
    };
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();

    if output.status.success() {
        debug!(tool = %label, bytes = output.stdout.len(), "tool finished");
        Ok(stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(format!(
            "`{label}` failed ({}): {}",
            output.status,
            stderr.trim()
        ))
    }
}

/// [`run_tool`] for synchronous provisioning code.
///
/// Uses the ambient runtime when called from a blocking-pool thread and a
/// throwaway current-thread runtime otherwise. Must not be called from an
/// async task.
pub fn run_tool_blocking<S: AsRef<OsStr>>(
    program: impl AsRef<OsStr>,
    args: &[S],
    timeout: Duration,
) -> ToolResult<String> {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle.block_on(run_tool(program, args, timeout)),
        Err(_) => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| format!("starting tool runtime: {e}"))?
            .block_on(run_tool(program, args, timeout)),
    }
}

/// Operations needed to turn an image file into a populated FAT volume.
pub trait VolumeTools: Send + Sync {
    /// Bind `image` to a block-device handle and return the handle path.
    fn attach(&self, image: &Path) -> ToolResult<PathBuf>;

    fn is_block_device(&self, device: &Path) -> bool {
        std::fs::metadata(device)
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false)
    }

    fn format(&self, device: &Path, label: &str) -> ToolResult<()>;

    fn mount(&self, device: &Path, mount_point: &Path) -> ToolResult<()>;

    fn unmount(&self, device: &Path, mount_point: &Path) -> ToolResult<()>;

    /// Release the block-device handle. The image file stays in place.
    fn detach(&self, device: &Path) -> ToolResult<()>;
}

/// [`VolumeTools`] backed by the host's disk utilities.
#[derive(Debug, Clone)]
pub struct HostVolumeTools {
    timeout: Duration,
}

impl HostVolumeTools {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[cfg(target_os = "macos")]
impl VolumeTools for HostVolumeTools {
    fn attach(&self, image: &Path) -> ToolResult<PathBuf> {
        let out = run_tool_blocking(
            "hdiutil",
            &[OsStr::new("attach"), OsStr::new("-nomount"), image.as_os_str()],
            self.timeout,
        )?;
        first_token(&out)
    }

    fn format(&self, device: &Path, label: &str) -> ToolResult<()> {
        run_tool_blocking(
            "diskutil",
            &[
                OsStr::new("eraseVolume"),
                OsStr::new("MS-DOS"),
                OsStr::new(label),
                device.as_os_str(),
            ],
            self.timeout,
        )
        .map(drop)
    }

    fn mount(&self, device: &Path, mount_point: &Path) -> ToolResult<()> {
        run_tool_blocking(
            "diskutil",
            &[
                OsStr::new("mount"),
                OsStr::new("-mountPoint"),
                mount_point.as_os_str(),
                device.as_os_str(),
            ],
            self.timeout,
        )
        .map(drop)
    }

    fn unmount(&self, _device: &Path, mount_point: &Path) -> ToolResult<()> {
        run_tool_blocking(
            "diskutil",
            &[OsStr::new("unmount"), mount_point.as_os_str()],
            self.timeout,
        )
        .map(drop)
    }

    fn detach(&self, device: &Path) -> ToolResult<()> {
        run_tool_blocking(
            "hdiutil",
            &[OsStr::new("detach"), device.as_os_str()],
            self.timeout,
        )
        .map(drop)
    }
}

#[cfg(not(target_os = "macos"))]
impl VolumeTools for HostVolumeTools {
    fn attach(&self, image: &Path) -> ToolResult<PathBuf> {
        let out = run_tool_blocking(
            "losetup",
            &[OsStr::new("--find"), OsStr::new("--show"), image.as_os_str()],
            self.timeout,
        )?;
        first_token(&out)
    }

    fn format(&self, device: &Path, label: &str) -> ToolResult<()> {
        run_tool_blocking(
            "mkfs.fat",
            &[OsStr::new("-n"), OsStr::new(label), device.as_os_str()],
            self.timeout,
        )
        .map(drop)
    }

    fn mount(&self, device: &Path, mount_point: &Path) -> ToolResult<()> {
        std::fs::create_dir_all(mount_point)
            .map_err(|e| format!("create mount point {}: {e}", mount_point.display()))?;
        run_tool_blocking(
            "mount",
            &[device.as_os_str(), mount_point.as_os_str()],
            self.timeout,
        )
        .map(drop)
    }

    fn unmount(&self, _device: &Path, mount_point: &Path) -> ToolResult<()> {
        run_tool_blocking("umount", &[mount_point.as_os_str()], self.timeout).map(drop)
    }

    fn detach(&self, device: &Path) -> ToolResult<()> {
        run_tool_blocking(
            "losetup",
            &[OsStr::new("-d"), device.as_os_str()],
            self.timeout,
        )
        .map(drop)
    }
}

/// Attach tools print the device first, sometimes followed by partition info.
fn first_token(out: &str) -> ToolResult<PathBuf> {
    out.split_whitespace()
        .next()
        .map(PathBuf::from)
        .ok_or_else(|| "attach printed no device handle".to_string())
}
