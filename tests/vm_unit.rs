//! Unit tests for VM assembly, provisioning and ephemeral runs.
//!
//! These tests need no hypervisor, no root and no disk utilities:
//!
//! - hypervisor binaries are empty files in a temp directory (only an
//!   ephemeral run executes one, and that one is a shell script)
//! - the metadata volume is built against a recording fake `VolumeTools`
//! - drive images are pre-created so `qemu-img` is never invoked
//!
//! Tested in this file:
//! - argument assembly for drives, NICs, metadata, cdrom and control sockets
//! - configuration errors raised before anything is created
//! - metadata provisioning order, idempotency and rollback
//! - ephemeral cleanup after a failing hypervisor

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use vm_runner::error::VmError;
use vm_runner::settings::Settings;
use vm_runner::vm::VirtualMachine;
use vm_runner::vm::disk::create_image_args;
use vm_runner::vm::metadata::{MetadataOutcome, provision_with_interval};
use vm_runner::vm::resources::{METADATA_SECTOR_COUNT, METADATA_SECTOR_SIZE, MetadataVolume};
use vm_runner::vm::tools::{ToolResult, VolumeTools};

const VM: &str = "alpine";

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Temp layout: `bin/` with empty hypervisor binaries, `vms/alpine/`,
/// `images/` and `mnt/` as the metadata mount point.
struct Fixture {
    root: TempDir,
    settings: Settings,
}

impl Fixture {
    fn new(specs_json: &str) -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let bin = root.path().join("bin");
        for dir in ["bin", "vms/alpine", "images", "mnt"] {
            std::fs::create_dir_all(root.path().join(dir)).expect("create fixture dir");
        }
        for binary in ["qemu-system-aarch64", "qemu-system-x86_64"] {
            std::fs::write(bin.join(binary), b"").expect("write fake binary");
        }
        std::fs::write(root.path().join("vms/alpine/specs.json"), specs_json)
            .expect("write specs.json");

        let settings = Settings {
            vm_root: root.path().join("vms"),
            images_dir: root.path().join("images"),
            hypervisor_dir: bin,
            metadata_mount_point: root.path().join("mnt"),
            accelerator: "hvf".into(),
            ..Settings::default()
        };
        Self { root, settings }
    }

    fn vm_dir(&self) -> PathBuf {
        self.root.path().join("vms").join(VM)
    }

    fn open(&self) -> vm_runner::Result<VirtualMachine> {
        VirtualMachine::open(VM, &self.settings)
    }

    fn args(&self) -> Vec<String> {
        self.open()
            .expect("VM opens")
            .hypervisor_args()
            .expect("arguments assemble")
    }
}

/// Value following `flag` that starts with `prefix`.
fn value_after(args: &[String], flag: &str, prefix: &str) -> Option<String> {
    args.windows(2)
        .find(|w| w[0] == flag && w[1].starts_with(prefix))
        .map(|w| w[1].clone())
}

/// Fake disk utilities that record every call and can fail one step.
#[derive(Default)]
struct RecordingTools {
    calls: Mutex<Vec<&'static str>>,
    fail_at: Option<&'static str>,
    never_ready: bool,
}

impl RecordingTools {
    fn failing_at(step: &'static str) -> Self {
        Self {
            fail_at: Some(step),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: &'static str) -> ToolResult<()> {
        self.calls.lock().unwrap().push(call);
        if self.fail_at == Some(call) {
            Err(format!("{call} exploded"))
        } else {
            Ok(())
        }
    }
}

impl VolumeTools for RecordingTools {
    fn attach(&self, _image: &Path) -> ToolResult<PathBuf> {
        self.record("attach")?;
        Ok(PathBuf::from("/dev/fake0"))
    }

    fn is_block_device(&self, _device: &Path) -> bool {
        !self.never_ready
    }

    fn format(&self, _device: &Path, label: &str) -> ToolResult<()> {
        assert_eq!(label, "CIDATA");
        self.record("format")
    }

    fn mount(&self, _device: &Path, _mount_point: &Path) -> ToolResult<()> {
        self.record("mount")
    }

    fn unmount(&self, _device: &Path, _mount_point: &Path) -> ToolResult<()> {
        self.record("unmount")
    }

    fn detach(&self, _device: &Path) -> ToolResult<()> {
        self.record("detach")
    }
}

fn volume_in(dir: &Path, mount_point: &Path) -> MetadataVolume {
    MetadataVolume {
        image: dir.join("floppy.img"),
        meta_data: Some(dir.join("meta-data")),
        user_data: Some(dir.join("user-data")),
        network_config: None,
        mount_point: mount_point.to_path_buf(),
    }
}

const FAST: Duration = Duration::from_millis(1);

// ---------------------------------------------------------------------------
// Tests: command assembly
// ---------------------------------------------------------------------------

#[test]
fn ide_drive_has_no_bootindex_and_virtio_drive_does() {
    let fx = Fixture::new(
        r#"{
            "drives": [
                {"file": "boot.qcow2", "bustype": "ide-hd"},
                {"file": "data.qcow2", "bustype": "virtio-blk"}
            ]
        }"#,
    );
    let args = fx.args();
    let dir = fx.vm_dir();

    let ide = value_after(&args, "-drive", &format!("file={}", dir.join("boot.qcow2").display()))
        .expect("IDE drive clause");
    assert_eq!(
        ide,
        format!(
            "file={},if=ide,id=boot.qcow2,cache=writeback",
            dir.join("boot.qcow2").display()
        )
    );
    assert!(
        !args.iter().any(|a| a.contains("drive=boot.qcow2")),
        "IDE drive must not get a device clause, got: {args:?}"
    );

    let device = value_after(&args, "-device", "virtio-blk,").expect("virtio device clause");
    assert_eq!(device, "virtio-blk,drive=data.qcow2,bootindex=1");
}

#[test]
fn nic_without_mac_is_omitted() {
    let fx = Fixture::new(
        r#"{
            "netdev": [
                {"type": "user"},
                {"type": "vmnet-bridged", "mac": "52:54:00:12:34:56", "ifname": "en0"}
            ]
        }"#,
    );
    let args = fx.args();

    let netdevs: Vec<_> = args
        .windows(2)
        .filter(|w| w[0] == "-netdev")
        .map(|w| w[1].clone())
        .collect();
    assert_eq!(netdevs, ["vmnet-bridged,id=mynet1,ifname=en0"]);
    assert_eq!(
        value_after(&args, "-device", "e1000").as_deref(),
        Some("e1000,netdev=mynet1,mac=52:54:00:12:34:56")
    );
}

#[test]
fn control_sockets_live_in_vm_directory() {
    let fx = Fixture::new("{}");
    let vm = fx.open().unwrap();
    let args = vm.hypervisor_args().unwrap();

    assert_eq!(vm.agent_socket(), fx.vm_dir().join("alpine.agent"));
    assert_eq!(vm.monitor_socket(), fx.vm_dir().join("alpine.monitor"));
    assert!(args.contains(&format!(
        "socket,path={},server=on,wait=off,id=agent0",
        vm.agent_socket().display()
    )));
    assert!(args.contains(&format!(
        "socket,path={},server=on,wait=off,id=mon0",
        vm.monitor_socket().display()
    )));
    assert_eq!(&args[..4], ["-machine", "virt,highmem=on", "-accel", "hvf"]);
}

#[test]
fn metadata_volume_is_attached_as_raw_cdrom() {
    let fx = Fixture::new(r#"{"metadata": {"user-data": "user-data"}}"#);
    let args = fx.args();
    let expected = format!(
        "file={},if=virtio,format=raw,media=cdrom",
        fx.vm_dir().join("floppy.img").display()
    );
    assert!(args.contains(&expected), "got: {args:?}");
}

#[test]
fn x86_64_uefi_maps_firmware_as_pflash() {
    let fx = Fixture::new(r#"{"arch": "qemu-system-x86_64", "bios": "uefi", "cpus": 4, "ram": "4G"}"#);
    let args = fx.args();

    assert_eq!(&args[..2], ["-machine", "q35"]);
    assert_eq!(value_after(&args, "-smp", "").as_deref(), Some("4"));
    assert_eq!(value_after(&args, "-m", "").as_deref(), Some("4G"));
    assert!(args.iter().any(|a| a.ends_with(",if=pflash,format=raw")));
}

#[test]
fn missing_iso_is_a_configuration_error() {
    let fx = Fixture::new(r#"{"cdrom": {"iso": "alpine.iso"}}"#);
    let err = fx.open().unwrap().hypervisor_args().unwrap_err();
    assert!(
        matches!(&err, VmError::Configuration { field, .. } if field == "cdrom.iso"),
        "got: {err}"
    );

    std::fs::write(fx.root.path().join("images/alpine.iso"), b"iso").unwrap();
    let args = fx.args();
    assert!(value_after(&args, "-cdrom", "").is_some());
}

#[test]
fn missing_hypervisor_binary_is_a_configuration_error() {
    let fx = Fixture::new("{}");
    std::fs::remove_file(fx.settings.hypervisor_dir.join("qemu-system-aarch64")).unwrap();
    let err = fx.open().unwrap_err();
    assert!(matches!(err, VmError::Configuration { .. }), "got: {err}");
}

#[test]
fn unknown_vm_is_a_configuration_error() {
    let fx = Fixture::new("{}");
    let err = VirtualMachine::open("missing", &fx.settings).unwrap_err();
    assert!(matches!(err, VmError::Configuration { .. }), "got: {err}");
}

#[test]
fn copy_on_write_drive_references_existing_base_image() {
    let fx = Fixture::new(
        r#"{
            "drives": [
                {"file": "root.qcow2", "baseimage": "alpine-base.qcow2", "size": "8G"},
                {"file": "scratch.qcow2", "baseimage": "missing.qcow2"}
            ]
        }"#,
    );
    let base = fx.root.path().join("images/alpine-base.qcow2");
    std::fs::write(&base, b"base").unwrap();
    let vm = fx.open().unwrap();

    let with_base: Vec<String> = create_image_args(&vm.drives[0])
        .into_iter()
        .map(|a| a.to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        with_base,
        [
            "create".to_string(),
            "-f".into(),
            "qcow2".into(),
            "-b".into(),
            base.display().to_string(),
            "-F".into(),
            "qcow2".into(),
            vm.drives[0].file.display().to_string(),
            "8G".into(),
        ]
    );

    // Missing base image degrades to a blank image.
    assert_eq!(vm.drives[1].base_image, None);
    let blank = create_image_args(&vm.drives[1]);
    assert!(!blank.iter().any(|a| a == "-b"));
}

// ---------------------------------------------------------------------------
// Tests: metadata provisioning
// ---------------------------------------------------------------------------

#[test]
fn metadata_provisioning_runs_every_step_once() {
    let dir = tempfile::tempdir().unwrap();
    let mount = dir.path().join("mnt");
    std::fs::create_dir(&mount).unwrap();
    std::fs::write(dir.path().join("meta-data"), "instance-id: alpine\n").unwrap();
    // user-data is configured but absent; it is skipped.
    let volume = volume_in(dir.path(), &mount);
    let tools = Arc::new(RecordingTools::default());

    let outcome = provision_with_interval(&volume, tools.clone(), FAST).unwrap();

    assert_eq!(outcome, MetadataOutcome::Created);
    assert_eq!(tools.calls(), ["attach", "format", "mount", "unmount", "detach"]);
    let size = std::fs::metadata(&volume.image).unwrap().len();
    assert_eq!(size, METADATA_SECTOR_SIZE * METADATA_SECTOR_COUNT);
    assert_eq!(
        std::fs::read_to_string(mount.join("meta-data")).unwrap(),
        "instance-id: alpine\n"
    );
    assert!(!mount.join("user-data").exists());
}

#[test]
fn metadata_provisioning_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let volume = volume_in(dir.path(), dir.path());
    let tools = Arc::new(RecordingTools::default());

    provision_with_interval(&volume, tools.clone(), FAST).unwrap();
    let first = tools.calls().len();

    let outcome = provision_with_interval(&volume, tools.clone(), FAST).unwrap();
    assert_eq!(outcome, MetadataOutcome::AlreadyProvisioned);
    assert_eq!(tools.calls().len(), first, "second run must not touch the tools");
}

#[test]
fn format_failure_detaches_and_removes_image() {
    let dir = tempfile::tempdir().unwrap();
    let volume = volume_in(dir.path(), dir.path());
    let tools = Arc::new(RecordingTools::failing_at("format"));

    let err = provision_with_interval(&volume, tools.clone(), FAST).unwrap_err();

    assert!(
        matches!(&err, VmError::Provisioning { step, .. } if step == "format"),
        "got: {err}"
    );
    assert_eq!(tools.calls(), ["attach", "format", "detach"]);
    assert!(!volume.image.exists(), "partial image must be removed");
}

#[test]
fn mount_failure_detaches_without_unmounting() {
    let dir = tempfile::tempdir().unwrap();
    let volume = volume_in(dir.path(), dir.path());
    let tools = Arc::new(RecordingTools::failing_at("mount"));

    let err = provision_with_interval(&volume, tools.clone(), FAST).unwrap_err();

    assert!(err.to_string().contains("mount exploded"), "got: {err}");
    assert_eq!(tools.calls(), ["attach", "format", "mount", "detach"]);
    assert!(!volume.image.exists());
}

#[test]
fn copy_failure_unmounts_then_detaches() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("meta-data"), "x").unwrap();
    // Mount point that does not exist, so the copy cannot succeed.
    let volume = volume_in(dir.path(), &dir.path().join("not-mounted"));
    let tools = Arc::new(RecordingTools::default());

    let err = provision_with_interval(&volume, tools.clone(), FAST).unwrap_err();

    assert!(
        matches!(&err, VmError::Provisioning { step, .. } if step == "copy"),
        "got: {err}"
    );
    assert_eq!(tools.calls(), ["attach", "format", "mount", "unmount", "detach"]);
    assert!(!volume.image.exists());
}

#[test]
fn attach_timeout_releases_handle() {
    let dir = tempfile::tempdir().unwrap();
    let volume = volume_in(dir.path(), dir.path());
    let tools = Arc::new(RecordingTools {
        never_ready: true,
        ..RecordingTools::default()
    });

    let err = provision_with_interval(&volume, tools.clone(), FAST).unwrap_err();

    assert!(
        matches!(&err, VmError::Provisioning { step, .. } if step == "attach"),
        "got: {err}"
    );
    assert_eq!(tools.calls(), ["attach", "detach"]);
    assert!(!volume.image.exists());
}

// ---------------------------------------------------------------------------
// Tests: ephemeral run
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ephemeral_run_cleans_up_after_failing_hypervisor() {
    let fx = Fixture::new(
        r#"{
            "drives": [{"file": "root.qcow2"}],
            "metadata": {"file": "seed.img"}
        }"#,
    );
    let binary = fx.settings.hypervisor_dir.join("qemu-system-aarch64");
    std::fs::write(&binary, "#!/bin/sh\necho booting\necho no kvm >&2\nexit 3\n").unwrap();
    std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

    // Pre-created storage: nothing needs provisioning.
    let drive = fx.vm_dir().join("root.qcow2");
    let seed = fx.vm_dir().join("seed.img");
    std::fs::write(&drive, b"qcow").unwrap();
    std::fs::write(&seed, b"fat").unwrap();

    let vm = fx.open().unwrap();
    let tools = Arc::new(RecordingTools::default());
    let status = vm.run(tools.clone(), true).await.unwrap();

    assert_eq!(status.code(), Some(3));
    assert!(tools.calls().is_empty());
    assert!(!drive.exists(), "drive image must be deleted");
    assert!(!seed.exists(), "metadata image must be deleted");
}

#[tokio::test]
async fn configuration_error_leaves_no_storage_behind() {
    let fx = Fixture::new(
        r#"{
            "metadata": {"file": "seed.img"},
            "cdrom": {"iso": "missing.iso"}
        }"#,
    );
    let vm = fx.open().unwrap();
    let tools = Arc::new(RecordingTools::default());

    let err = vm.run(tools.clone(), false).await.unwrap_err();

    assert!(matches!(err, VmError::Configuration { .. }), "got: {err}");
    assert!(tools.calls().is_empty());
    assert!(!fx.vm_dir().join("seed.img").exists());
}
