//! Variant 1: the foreground, self-contained hypervisor (vfkit). Used on
//! the platform with no daemonizing hypervisor available. State is queried
//! over a REST endpoint on a loopback TCP port chosen at spawn time; the
//! guest-facing transport is a Unix datagram socket.

use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use hyper::{Body, Client, Method, Request};
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};
use tracing::debug;

use crate::error::{Error, Result};
use crate::hypervisor::{HypervisorDriver, HypervisorVariant, VMInfoExtra};
use crate::mac::derive_mac;
use crate::options::{SSHConfig, VMOptions, VMState};
use crate::registry::VMInfo;

const WAIT_FOR_READY_TIMEOUT: Duration = Duration::from_secs(30);
const WAIT_FOR_SSH_TIMEOUT: Duration = Duration::from_secs(120);
const STOP_GRACE: Duration = Duration::from_secs(5);

fn resolve_vfkit() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("BOOTC_VM_VFKIT") {
        return Ok(PathBuf::from(p));
    }
    which::which("vfkit").map_err(|_| {
        Error::MissingDependency(
            "vfkit not found; install it with `brew install vfkit`".to_string(),
        )
    })
}

/// Picks a free loopback TCP port for vfkit's REST state endpoint. Races
/// with other allocations are tolerated the same way the Port Registry
/// tolerates them for SSH ports: the kernel hands back an unused port, and
/// a collision after release is vanishingly unlikely in practice.
fn pick_rest_port() -> Result<u16> {
    let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
        .map_err(|e| Error::io(PathBuf::from("loopback:0"), e))?;
    listener
        .local_addr()
        .map(|a| a.port())
        .map_err(|e| Error::io(PathBuf::from("loopback:0"), e))
}

pub struct VfkitDriver {
    safe_name: String,
    rest_port: u16,
    serial_log_path: PathBuf,
    efi_vars_path: PathBuf,
    child: Option<Child>,
    ssh_config: Option<SSHConfig>,
}

impl VfkitDriver {
    pub fn new(safe_name: &str) -> Result<Self> {
        Ok(Self {
            safe_name: safe_name.to_string(),
            rest_port: pick_rest_port()?,
            serial_log_path: crate::paths::serial_log_path(safe_name),
            efi_vars_path: crate::paths::efi_vars_path(safe_name),
            child: None,
            ssh_config: None,
        })
    }

    async fn rest_get(&self, path: &str) -> Result<(hyper::StatusCode, Vec<u8>)> {
        let client = Client::new();
        let uri: hyper::Uri = format!("http://127.0.0.1:{}{}", self.rest_port, path)
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| Error::ProxyControlError(e.to_string()))?;
        let req = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
            .map_err(|e| Error::ProxyControlError(e.to_string()))?;
        let resp = timeout(Duration::from_secs(2), client.request(req))
            .await
            .map_err(|_| Error::ProxyControlError("vfkit REST request timed out".to_string()))?
            .map_err(|e| Error::ProxyControlError(e.to_string()))?;
        let status = resp.status();
        let body = hyper::body::to_bytes(resp.into_body())
            .await
            .map_err(|e| Error::ProxyControlError(e.to_string()))?;
        Ok((status, body.to_vec()))
    }
}

#[async_trait]
impl HypervisorDriver for VfkitDriver {
    fn variant(&self) -> HypervisorVariant {
        HypervisorVariant::Vfkit
    }

    async fn available(&self) -> Result<()> {
        resolve_vfkit().map(|_| ())
    }

    async fn start(&mut self, opts: &VMOptions, guest_sock: &Path) -> Result<()> {
        let binary = resolve_vfkit()?;

        if !self.efi_vars_path.exists() {
            seed_efi_vars(&self.efi_vars_path)?;
        }

        let mac = derive_mac(&opts.name);
        let mut cmd = Command::new(&binary);
        cmd.arg("--cpus")
            .arg(opts.vcpus.to_string())
            .arg("--memory")
            .arg(opts.memory_mib.to_string())
            .arg("--bootloader")
            .arg(format!(
                "efi,variable-store={},create",
                self.efi_vars_path.display()
            ))
            .arg("--device")
            .arg(format!("virtio-blk,path={}", opts.disk_image_path.display()))
            .arg("--device")
            .arg(format!(
                "virtio-net,unixSocketPath={},mac={mac}",
                guest_sock.display()
            ))
            .arg("--device")
            .arg("virtio-rng")
            .arg("--device")
            .arg(format!("virtio-serial,logFilePath={}", self.serial_log_path.display()))
            .arg("--restful-uri")
            .arg(format!("tcp://127.0.0.1:{}", self.rest_port))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        if !opts.gui {
            cmd.arg("--gui").arg("false");
        }

        let child = cmd.spawn().map_err(|e| Error::StartFailed {
            what: "vfkit".to_string(),
            detail: e.to_string(),
        })?;
        self.child = Some(child);
        self.ssh_config = Some(SSHConfig::new(
            opts.ssh_host_port,
            opts.ssh_user.clone(),
            opts.ssh_key_path.clone(),
        ));
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            bootc_vm_common::terminate_child(&mut child, "vfkit", STOP_GRACE)
                .await
                .map_err(|e| Error::io(PathBuf::from("vfkit"), e))?;
        }
        Ok(())
    }

    async fn get_state(&mut self) -> VMState {
        if let Some(child) = self.child.as_mut() {
            if let Ok(Some(_)) = child.try_wait() {
                return VMState::Stopped;
            }
        } else {
            return VMState::Unknown;
        }

        match self.rest_get("/vm/state").await {
            Ok((status, body)) if status.is_success() => {
                let text = String::from_utf8_lossy(&body);
                if text.contains("Running") {
                    VMState::Running
                } else if text.contains("Stopped") {
                    VMState::Stopped
                } else {
                    VMState::Starting
                }
            }
            _ => VMState::Starting,
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
        remove_if_exists(&self.serial_log_path);
        remove_if_exists(&self.efi_vars_path);
        Ok(())
    }

    fn process_id(&self) -> u32 {
        self.child.as_ref().and_then(|c| c.id()).unwrap_or(0)
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
            hypervisor_variant: HypervisorVariant::Vfkit,
            process_id: self.process_id(),
            proxy_sock_path: extra.proxy_sock_path,
            proxy_control_sock_path: extra.proxy_control_sock_path,
            proxy_process_id: extra.proxy_pid,
            endpoint_url: Some(format!("http://127.0.0.1:{}", self.rest_port)),
            pid_file_path: None,
        }
    }
}

fn seed_efi_vars(dest: &Path) -> Result<()> {
    const TEMPLATES: &[&str] = &[
        "/usr/share/OVMF/OVMF_VARS.fd",
        "/usr/share/edk2/ovmf/OVMF_VARS.fd",
        "/usr/share/qemu/OVMF_VARS.fd",
        "/usr/share/AAVMF/AAVMF_VARS.fd",
    ];
    let template = TEMPLATES
        .iter()
        .map(Path::new)
        .find(|p| p.exists())
        .ok_or_else(|| {
            Error::MissingDependency(
                "no EFI variable-store template found; install an OVMF/edk2 firmware package".to_string(),
            )
        })?;
    std::fs::copy(template, dest).map_err(|e| Error::io(dest.to_path_buf(), e))?;
    Ok(())
}

fn remove_if_exists(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) | Err(_) if !path.exists() => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "cleanup: failed to remove artifact"),
        _ => {}
    }
}

pub(crate) fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

pub(crate) async fn run_ssh_command(cfg: &SSHConfig, command: &str, deadline: Duration) -> Result<String> {
    let target = format!("{}@{}", cfg.user, cfg.host);
    let output = timeout(
        deadline,
        Command::new("ssh")
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("UserKnownHostsFile=/dev/null")
            .arg("-o")
            .arg("ConnectTimeout=5")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-i")
            .arg(&cfg.key_path)
            .arg("-p")
            .arg(cfg.port.to_string())
            .arg(&target)
            .arg(command)
            .stdin(Stdio::null())
            .output(),
    )
    .await
    .map_err(|_| Error::SshUnavailable {
        diagnostics: "ssh command timed out".to_string(),
    })?
    .map_err(|e| Error::io(PathBuf::from("ssh"), e))?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    if !output.status.success() {
        return Err(Error::CheckFailed {
            check: command.to_string(),
            detail: format!("ssh exited with {}", output.status),
            output: combined,
        });
    }
    Ok(combined)
}
