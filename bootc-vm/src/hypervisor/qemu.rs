//! Variant 2: the daemonized hypervisor (QEMU/KVM). State is inferred from
//! PID liveness against a PID file QEMU itself writes; the guest-facing
//! transport is a Unix stream socket.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal;
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::time::sleep;
use tracing::debug;

use crate::error::{Error, Result};
use crate::hypervisor::vfkit::{run_ssh_command, tail_lines};
use crate::hypervisor::{HypervisorDriver, HypervisorVariant, VMInfoExtra};
use crate::mac::derive_mac;
use crate::options::{SSHConfig, VMOptions, VMState};
use crate::registry::VMInfo;

const WAIT_FOR_READY_TIMEOUT: Duration = Duration::from_secs(30);
const WAIT_FOR_SSH_TIMEOUT: Duration = Duration::from_secs(120);

const UEFI_CODE_TEMPLATES: &[&str] = &[
    "/usr/share/OVMF/OVMF_CODE.fd",
    "/usr/share/edk2/ovmf/OVMF_CODE.fd",
    "/usr/share/qemu/OVMF_CODE.fd",
    "/usr/share/AAVMF/AAVMF_CODE.fd",
];

fn qemu_binary_name() -> &'static str {
    if cfg!(target_arch = "aarch64") {
        "qemu-system-aarch64"
    } else {
        "qemu-system-x86_64"
    }
}

fn resolve_qemu() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("BOOTC_VM_HYPERVISOR") {
        return Ok(PathBuf::from(p));
    }
    which::which(qemu_binary_name()).map_err(|_| {
        Error::MissingDependency(format!(
            "{} not found; install it with your distro's qemu package",
            qemu_binary_name()
        ))
    })
}

fn resolve_uefi_code() -> Result<PathBuf> {
    UEFI_CODE_TEMPLATES
        .iter()
        .map(Path::new)
        .find(|p| p.exists())
        .map(Path::to_path_buf)
        .ok_or_else(|| {
            Error::MissingDependency(
                "no UEFI firmware (OVMF/edk2) code file found; install an OVMF/edk2-ovmf package"
                    .to_string(),
            )
        })
}

fn kvm_available() -> bool {
    Path::new("/dev/kvm").exists()
}

pub struct QemuDriver {
    safe_name: String,
    serial_log_path: PathBuf,
    efi_vars_path: PathBuf,
    pid_file_path: PathBuf,
    ssh_config: Option<SSHConfig>,
}

impl QemuDriver {
    pub fn new(safe_name: &str) -> Self {
        Self {
            safe_name: safe_name.to_string(),
            serial_log_path: crate::paths::serial_log_path(safe_name),
            efi_vars_path: crate::paths::efi_vars_path(safe_name),
            pid_file_path: crate::paths::hypervisor_pid_path(safe_name),
            ssh_config: None,
        }
    }

    fn read_pid(&self) -> Option<i32> {
        std::fs::read_to_string(&self.pid_file_path).ok()?.trim().parse().ok()
    }

    fn is_alive(&self) -> bool {
        self.read_pid()
            .map(|pid| signal::kill(Pid::from_raw(pid), None).is_ok())
            .unwrap_or(false)
    }
}

#[async_trait]
impl HypervisorDriver for QemuDriver {
    fn variant(&self) -> HypervisorVariant {
        HypervisorVariant::Qemu
    }

    async fn available(&self) -> Result<()> {
        if !kvm_available() {
            return Err(Error::MissingDependency(
                "hardware virtualization (/dev/kvm) is not available on this host".to_string(),
            ));
        }
        resolve_qemu()?;
        resolve_uefi_code()?;
        Ok(())
    }

    async fn start(&mut self, opts: &VMOptions, guest_sock: &Path) -> Result<()> {
        self.available().await?;
        let binary = resolve_qemu()?;
        let uefi_code = resolve_uefi_code()?;

        if !self.efi_vars_path.exists() {
            let vars_template = PathBuf::from(
                uefi_code.to_string_lossy().replace("_CODE.fd", "_VARS.fd"),
            );
            std::fs::copy(&vars_template, &self.efi_vars_path)
                .map_err(|e| Error::io(self.efi_vars_path.clone(), e))?;
        }

        let mac = derive_mac(&opts.name);
        let mut cmd = Command::new(&binary);
        cmd.arg("-enable-kvm")
            .arg("-smp")
            .arg(opts.vcpus.to_string())
            .arg("-m")
            .arg(format!("{}M", opts.memory_mib))
            .arg("-drive")
            .arg(format!("if=pflash,format=raw,readonly=on,file={}", uefi_code.display()))
            .arg("-drive")
            .arg(format!("if=pflash,format=raw,file={}", self.efi_vars_path.display()))
            .arg("-drive")
            .arg(format!(
                "if=virtio,format=raw,file={},bootindex=0",
                opts.disk_image_path.display()
            ))
            .arg("-netdev")
            .arg(format!("stream,id=net0,addr.type=unix,addr.path={}", guest_sock.display()))
            .arg("-device")
            .arg(format!("virtio-net-pci,netdev=net0,mac={mac}"))
            .arg("-device")
            .arg("virtio-rng-pci")
            .arg("-chardev")
            .arg(format!("file,id=serial0,path={}", self.serial_log_path.display()))
            .arg("-serial")
            .arg("chardev:serial0")
            .arg("-pidfile")
            .arg(&self.pid_file_path)
            .arg("-daemonize")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        if !opts.gui {
            cmd.arg("-display").arg("none");
        }

        let status = cmd.status().await.map_err(|e| Error::StartFailed {
            what: "qemu".to_string(),
            detail: e.to_string(),
        })?;
        if !status.success() {
            return Err(Error::StartFailed {
                what: "qemu".to_string(),
                detail: format!("qemu exited with {status} before daemonizing"),
            });
        }

        self.ssh_config = Some(SSHConfig::new(
            opts.ssh_host_port,
            opts.ssh_user.clone(),
            opts.ssh_key_path.clone(),
        ));
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(pid) = self.read_pid() {
            if signal::kill(Pid::from_raw(pid), None).is_ok() {
                let _ = signal::kill(Pid::from_raw(pid), signal::Signal::SIGTERM);
                for _ in 0..30 {
                    if !self.is_alive() {
                        break;
                    }
                    sleep(Duration::from_millis(100)).await;
                }
                if self.is_alive() {
                    let _ = signal::kill(Pid::from_raw(pid), signal::Signal::SIGKILL);
                }
            }
        }
        Ok(())
    }

    async fn get_state(&mut self) -> VMState {
        match self.read_pid() {
            Some(_) if self.is_alive() => VMState::Running,
            Some(_) => VMState::Stopped,
            None => VMState::Unknown,
        }
    }

    async fn wait_for_ready(&mut self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + WAIT_FOR_READY_TIMEOUT;
        loop {
            let state = self.get_state().await;
            debug!(
                ?state,
                remaining_ms = deadline.saturating_duration_since(tokio::time::Instant::now()).as_millis(),
                "wait_for_ready poll"
            );
            match state {
                VMState::Running => return Ok(()),
                VMState::Stopped => {
                    let log = self.read_serial_log().await;
                    if log.to_lowercase().contains("error") {
                        return Err(Error::BootFailed {
                            log_excerpt: tail_lines(&log, 50),
                        });
                    }
                }
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::BootFailed {
                    log_excerpt: tail_lines(&self.read_serial_log().await, 50),
                });
            }
            sleep(Duration::from_secs(1)).await;
        }
    }

    fn ssh_config(&self) -> &SSHConfig {
        self.ssh_config.as_ref().expect("start() must be called before ssh_config()")
    }

    async fn ssh(&self, command: &str) -> Result<String> {
        run_ssh_command(self.ssh_config(), command, WAIT_FOR_SSH_TIMEOUT).await
    }

    async fn read_serial_log(&self) -> String {
        tokio::fs::read_to_string(&self.serial_log_path).await.unwrap_or_default()
    }

    async fn cleanup(&self) -> Result<()> {
        for path in [&self.pid_file_path, &self.serial_log_path, &self.efi_vars_path] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "cleanup: failed to remove artifact"),
            }
        }
        Ok(())
    }

    fn process_id(&self) -> u32 {
        self.read_pid().map(|p| p as u32).unwrap_or(0)
    }

    fn log_file_path(&self) -> &Path {
        &self.serial_log_path
    }

    fn to_vm_info(&self, name: &str, extra: VMInfoExtra) -> VMInfo {
        VMInfo {
            name: name.to_string(),
            pipeline_name: extra.pipeline_name,
            pipeline_file_path: extra.pipeline_file_path,
            image_tag: extra.image_tag,
            disk_image_path: extra.disk_image_path,
            created_at: extra.created_at,
            ssh_host: self.ssh_config().host.clone(),
            ssh_port: self.ssh_config().port,
            ssh_user: self.ssh_config().user.clone(),
            ssh_key_path: self.ssh_config().key_path.clone(),
            serial_log_path: self.serial_log_path.clone(),
            state: extra.state,
            hypervisor_variant: HypervisorVariant::Qemu,
            process_id: self.process_id(),
            proxy_sock_path: extra.proxy_sock_path,
            proxy_control_sock_path: extra.proxy_control_sock_path,
            proxy_process_id: extra.proxy_pid,
            endpoint_url: None,
            pid_file_path: Some(self.pid_file_path.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_with_no_pid_file_reports_unknown_process_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = QemuDriver::new("demo");
        driver.pid_file_path = dir.path().join("missing.pid");
        assert_eq!(driver.process_id(), 0);
    }

    #[tokio::test]
    async fn get_state_is_unknown_without_a_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = QemuDriver::new("demo");
        driver.pid_file_path = dir.path().join("missing.pid");
        assert_eq!(driver.get_state().await, VMState::Unknown);
    }

    #[tokio::test]
    async fn get_state_is_stopped_when_pid_file_references_a_dead_process() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = QemuDriver::new("demo");
        driver.pid_file_path = dir.path().join("stale.pid");
        std::fs::write(&driver.pid_file_path, i32::MAX.to_string()).unwrap();
        assert_eq!(driver.get_state().await, VMState::Stopped);
    }
}
