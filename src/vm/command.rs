//! Hypervisor command-line assembly.
//!
//! [`build_hypervisor_args`] is a pure function of the VM and the host
//! settings, except for one check: install media must exist, because a
//! missing ISO is a configuration error rather than something to skip.
//!
//! Argument order:
//!
//! ```text
//! machine/accel/cpu/firmware  →  -smp -m -nodefaults  →  drives  →  nics
//!   →  metadata volume  →  UEFI pflash  →  display  →  cdrom
//!   →  boot/rtc/serial  →  agent channel  →  monitor channel
//! ```

use std::path::Path;

use super::VirtualMachine;
use super::resources::{Drive, MetadataVolume, NetworkInterface};
use super::spec::{Arch, BusType};
use crate::error::{Result, VmError};
use crate::settings::Settings;

/// Name of the guest agent port inside the guest.
pub const AGENT_PORT_NAME: &str = "org.qemu.guest_agent.0";

/// Full argument vector (without the binary itself).
pub fn build_hypervisor_args(vm: &VirtualMachine, settings: &Settings) -> Result<Vec<String>> {
    let mut args = machine_args(vm.spec.arch, settings);

    args.extend([
        "-smp".to_string(),
        vm.spec.cpus.clone(),
        "-m".to_string(),
        vm.spec.ram.clone(),
        "-nodefaults".to_string(),
    ]);

    for drive in &vm.drives {
        args.extend(drive_args(drive));
    }
    for nic in &vm.nics {
        args.extend(nic_args(nic));
    }
    if let Some(metadata) = &vm.metadata {
        args.extend(metadata_args(metadata));
    }

    if vm.spec.arch == Arch::X86_64 && vm.spec.uefi() {
        args.extend([
            "-drive".to_string(),
            format!(
                "file={},if=pflash,format=raw",
                settings.x86_64_uefi_code.display()
            ),
        ]);
    }

    args.extend(display_args(vm.spec.video.as_deref(), settings));

    if let Some(cdrom) = &vm.spec.cdrom {
        let iso = settings.image_path(&cdrom.iso)?;
        if !iso.is_file() {
            return Err(VmError::config(
                "cdrom.iso",
                format!("ISO file {} doesn't exist", iso.display()),
            ));
        }
        args.extend(["-cdrom".to_string(), iso.display().to_string()]);
    }

    args.extend(control_channel_args(&vm.agent_socket(), &vm.monitor_socket()));
    Ok(args)
}

/// Machine type, acceleration and firmware flags for `arch`.
pub fn machine_args(arch: Arch, settings: &Settings) -> Vec<String> {
    match arch {
        Arch::Aarch64 => vec![
            "-machine".into(),
            "virt,highmem=on".into(),
            "-accel".into(),
            settings.accelerator.clone(),
            "-cpu".into(),
            "host".into(),
            "-bios".into(),
            settings.aarch64_firmware.display().to_string(),
        ],
        Arch::X86_64 => vec!["-machine".into(), "q35".into()],
    }
}

/// IDE drives get one combined clause without a boot index; every other bus
/// gets a backing-store clause plus a device clause with `bootindex`.
pub fn drive_args(drive: &Drive) -> Vec<String> {
    let file = drive.file.display();
    match drive.bus {
        BusType::IdeHd => vec![
            "-drive".into(),
            format!("file={file},if=ide,id={},cache=writeback", drive.id),
        ],
        bus => {
            let mut args = Vec::with_capacity(6);
            if bus == BusType::ScsiHd {
                args.extend(["-device".to_string(), "virtio-scsi-pci".to_string()]);
            }
            args.extend([
                "-drive".to_string(),
                format!("file={file},if=none,id={},cache=writeback", drive.id),
                "-device".to_string(),
                format!(
                    "{},drive={},bootindex={}",
                    bus.device_model(),
                    drive.id,
                    drive.index
                ),
            ]);
            args
        }
    }
}

/// Interfaces without a MAC address are left out entirely.
pub fn nic_args(nic: &NetworkInterface) -> Vec<String> {
    if !nic.is_enabled() {
        return Vec::new();
    }
    vec![
        "-netdev".into(),
        nic.netdev_param(),
        "-device".into(),
        nic.device_param(),
    ]
}

pub fn metadata_args(metadata: &MetadataVolume) -> Vec<String> {
    vec![
        "-drive".into(),
        format!(
            "file={},if=virtio,format=raw,media=cdrom",
            metadata.image.display()
        ),
    ]
}

/// Headless unless a video device is configured.
pub fn display_args(video: Option<&str>, settings: &Settings) -> Vec<String> {
    match video {
        None => vec!["-nographic".into(), "-vga".into(), "none".into()],
        Some(device) => vec![
            "-display".into(),
            settings.display_backend.clone(),
            "-device".into(),
            device.to_string(),
        ],
    }
}

/// Boot order, clock, serial console and the two control sockets. Both
/// sockets are servers that do not wait for a client.
pub fn control_channel_args(agent: &Path, monitor: &Path) -> Vec<String> {
    vec![
        "-boot".into(),
        "order=c".into(),
        "-rtc".into(),
        "base=utc,clock=host".into(),
        "-device".into(),
        "virtio-serial-pci,max_ports=4".into(),
        "-chardev".into(),
        "stdio,id=console1".into(),
        "-serial".into(),
        "chardev:console1".into(),
        "-chardev".into(),
        format!("socket,path={},server=on,wait=off,id=agent0", agent.display()),
        "-device".into(),
        format!("virtserialport,chardev=agent0,name={AGENT_PORT_NAME}"),
        "-mon".into(),
        "chardev=mon0,mode=control,pretty=off".into(),
        "-chardev".into(),
        format!("socket,path={},server=on,wait=off,id=mon0", monitor.display()),
        "-device".into(),
        "pcie-root-port,id=pcie.1".into(),
    ]
}
