//! End-to-end sequencer: allocate a port, start the proxy, start the VM,
//! wait for ready, scrape the guest IP, program forwarding, wait for SSH,
//! run boot checks, and tear everything down in reverse order regardless of
//! how the run ends.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bootc_vm_common::Deferred;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::hypervisor::{
    self, is_reboot_command, reboot_tolerant_ssh_error, HypervisorDriver, HypervisorVariant,
    QemuDriver, VMInfoExtra, VfkitDriver,
};
use crate::options::VMOptions;
use crate::port_registry::PortRegistry;
use crate::proxy::ProxyController;
use crate::registry::{VMInfo, VMRegistry};
use crate::scraper::extract_guest_ip;

const DEFAULT_WAIT_FOR_READY: Duration = Duration::from_secs(30);
const STOPPED_DEADLINE: Duration = Duration::from_secs(30);
const RUNNING_AGAIN_DEADLINE: Duration = Duration::from_secs(60);
const SSH_DIAL_TIMEOUT: Duration = Duration::from_secs(2);
const WAIT_FOR_SSH_DEADLINE: Duration = Duration::from_secs(120);

/// A validated, already-parsed pipeline description. Schema validation and
/// path resolution for the YAML this is built from is an external
/// collaborator's responsibility.
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub name: String,
    pub file_path: PathBuf,
    pub base_dir: PathBuf,
    pub boot_checks: Vec<String>,
    pub boot_timeout: Option<Duration>,
    pub gui_requested: bool,
}

#[derive(Debug, Default)]
pub struct PreflightResult {
    pub missing: Vec<String>,
}

impl PreflightResult {
    pub fn is_ready(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Checks that the built image exists and a disk-image file can be located
/// before attempting to boot.
pub async fn check_prerequisites(pipeline: &Pipeline, image_tag: &str) -> PreflightResult {
    let mut missing = Vec::new();

    if !image_exists(image_tag).await {
        missing.push(format!("image `{image_tag}` not found in local storage"));
    }
    if resolve_disk_image(&pipeline.base_dir, image_tag).is_none() {
        missing.push(format!(
            "no disk image found under {}/output/images/",
            pipeline.base_dir.display()
        ));
    }

    PreflightResult { missing }
}

async fn image_exists(tag: &str) -> bool {
    tokio::process::Command::new("podman")
        .args(["image", "exists", tag])
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Resolution order: `<sanitized-tag>.raw`, `image/disk.raw`, any `*.raw`
/// walked from the directory, `<sanitized-tag>.qcow2`, any `*.qcow2`. Raw is
/// preferred because it is the only format both hypervisor variants accept.
pub fn resolve_disk_image(base_dir: &Path, image_tag: &str) -> Option<PathBuf> {
    let images_dir = base_dir.join("output").join("images");
    let sanitized = crate::options::VMOptions::sanitize_name(image_tag);

    let candidates = [
        images_dir.join(format!("{sanitized}.raw")),
        images_dir.join("image").join("disk.raw"),
    ];
    for candidate in &candidates {
        if candidate.is_file() {
            return Some(candidate.clone());
        }
    }
    if let Some(found) = find_with_extension(&images_dir, "raw") {
        return Some(found);
    }

    let qcow2 = images_dir.join(format!("{sanitized}.qcow2"));
    if qcow2.is_file() {
        return Some(qcow2);
    }
    find_with_extension(&images_dir, "qcow2")
}

fn find_with_extension(dir: &Path, ext: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some(ext) {
            return Some(path);
        }
        if path.is_dir() {
            if let Some(found) = find_with_extension(&path, ext) {
                return Some(found);
            }
        }
    }
    None
}

fn resolve_ssh_key() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| {
        Error::MissingDependency("cannot determine home directory to locate an SSH key".to_string())
    })?;
    let ed25519 = home.join(".ssh").join("id_ed25519");
    let rsa = home.join(".ssh").join("id_rsa");
    if ed25519.is_file() {
        return Ok(ed25519);
    }
    if rsa.is_file() {
        return Ok(rsa);
    }
    Err(Error::MissingDependency(format!(
        "no SSH private key found; probed {} and {}",
        ed25519.display(),
        rsa.display()
    )))
}

fn is_headless() -> bool {
    std::env::var("DISPLAY").is_err() && std::env::var("WAYLAND_DISPLAY").is_err()
}

fn new_driver(safe_name: &str) -> Result<Box<dyn HypervisorDriver>> {
    match hypervisor::default_variant() {
        HypervisorVariant::Vfkit => Ok(Box::new(VfkitDriver::new(safe_name)?)),
        HypervisorVariant::Qemu => Ok(Box::new(QemuDriver::new(safe_name))),
    }
}

/// Runs one VM end to end. On any exit path — success, a fatal error, or
/// cancellation through `cancel` — every artifact created along the way is
/// removed before this function returns.
pub async fn execute(
    pipeline: &Pipeline,
    image_tag: &str,
    cancel: CancellationToken,
) -> Result<VMInfo> {
    let safe_name = crate::options::VMOptions::sanitize_name(&pipeline.name);
    let mut defer = Deferred::new();

    // Step 1: resolve and stage the disk image under the runtime dir so
    // concurrent runs never race on the shared source artifact.
    let source_disk = resolve_disk_image(&pipeline.base_dir, image_tag).ok_or_else(|| {
        Error::MissingDependency(format!("no disk image resolvable for tag `{image_tag}`"))
    })?;
    let temp_disk = crate::paths::temp_disk_path(&safe_name);
    if temp_disk.exists() {
        let _ = std::fs::remove_file(&temp_disk);
    }
    tokio::fs::copy(&source_disk, &temp_disk)
        .await
        .map_err(|e| Error::io(temp_disk.clone(), e))?;
    {
        let temp_disk = temp_disk.clone();
        defer.add(move || {
            let _ = std::fs::remove_file(&temp_disk);
        });
    }

    // Step 2: resolve the SSH key before touching any hypervisor resource.
    let ssh_key_path = resolve_ssh_key()?;

    // Step 3: demote GUI silently in a headless environment.
    let gui = pipeline.gui_requested && !is_headless();
    if pipeline.gui_requested && !gui {
        warn!("GUI requested but no display detected; running headless");
    }

    // Step 4: build VMOptions.
    let opts = VMOptions {
        name: pipeline.name.clone(),
        disk_image_path: temp_disk.clone(),
        vcpus: 2,
        memory_mib: 4096,
        ssh_user: "user".to_string(),
        ssh_key_path,
        ssh_host_port: 0,
        gui,
        serial_log_path: None,
        efi_vars_path: None,
    };

    // Step 5: instantiate the platform driver and check availability.
    let mut driver = new_driver(&safe_name)?;
    driver.available().await?;

    // Allocate the host SSH port before either child process spawns.
    let ports = PortRegistry::at_default_location();
    let ssh_port = ports.allocate_port().await?;
    let mut opts = opts;
    opts.ssh_host_port = ssh_port;

    // Start the proxy; its guest-facing socket must exist before the
    // hypervisor spawns.
    let mut proxy = ProxyController::new(&safe_name);
    proxy.start(&opts, driver.variant()).await?;
    let guest_sock = proxy.artifacts.guest_sock.clone();

    // Step 6: start the VM, registering cleanup before anything can fail
    // past this point.
    driver.start(&opts, &guest_sock).await?;

    // Step 7: wait for the hypervisor to report Running. The pipeline may
    // configure a longer deadline than the driver's own 30 s guardrail, but
    // never a shorter one — the driver's WaitForReady always gets to run to
    // its own completion first.
    let outer_timeout = pipeline
        .boot_timeout
        .unwrap_or(DEFAULT_WAIT_FOR_READY)
        .max(DEFAULT_WAIT_FOR_READY);
    let ready = tokio::select! {
        res = driver.wait_for_ready() => res,
        _ = tokio::time::sleep(outer_timeout), if outer_timeout > DEFAULT_WAIT_FOR_READY => {
            Err(Error::BootFailed { log_excerpt: "pipeline-configured boot timeout elapsed".to_string() })
        }
        _ = cancel.cancelled() => Err(Error::BootFailed { log_excerpt: "cancelled while waiting for boot".to_string() }),
    };
    if let Err(e) = ready {
        let log = driver.read_serial_log().await;
        warn!(excerpt = %crate::hypervisor::vfkit::tail_lines(&log, 50), "boot did not become ready");
        cleanup_all(&mut defer, &mut *driver, &mut proxy, ssh_port).await;
        return Err(e);
    }

    let created_at = chrono::Utc::now();

    // Step 8: no boot checks configured ⇒ success without SSH.
    if pipeline.boot_checks.is_empty() {
        let info = persist_vm_info(
            &pipeline.name,
            pipeline,
            image_tag,
            &source_disk,
            created_at,
            &*driver,
            &proxy,
            crate::options::VMState::Running,
        )
        .await?;
        // On the no-checks success path we still tear everything down: this
        // entry point always returns a finished run's artifacts via its
        // VMInfo snapshot, not a live handle.
        cleanup_all(&mut defer, &mut *driver, &mut proxy, ssh_port).await;
        return Ok(info);
    }

    // Step 9: wait for SSH.
    if let Err(e) = wait_for_ssh(&mut *driver, &proxy, &opts).await {
        cleanup_all(&mut defer, &mut *driver, &mut proxy, ssh_port).await;
        return Err(e);
    }

    // Step 10: run each boot check in order, tolerating reboots.
    for check in &pipeline.boot_checks {
        let result = driver.ssh(check).await;
        match result {
            Ok(_) => continue,
            Err(Error::CheckFailed { detail, output, .. })
                if is_reboot_command(check)
                    && (reboot_tolerant_ssh_error(&detail) || reboot_tolerant_ssh_error(&output)) =>
            {
                if let Err(e) = handle_reboot(&mut *driver, &proxy, &opts).await {
                    cleanup_all(&mut defer, &mut *driver, &mut proxy, ssh_port).await;
                    return Err(e);
                }
            }
            Err(e) => {
                cleanup_all(&mut defer, &mut *driver, &mut proxy, ssh_port).await;
                return Err(e);
            }
        }
    }

    let info = persist_vm_info(
        &pipeline.name,
        pipeline,
        image_tag,
        &source_disk,
        created_at,
        &*driver,
        &proxy,
        crate::options::VMState::Running,
    )
    .await?;

    cleanup_all(&mut defer, &mut *driver, &mut proxy, ssh_port).await;
    Ok(info)
}

async fn handle_reboot(
    driver: &mut dyn HypervisorDriver,
    proxy: &ProxyController,
    opts: &VMOptions,
) -> Result<()> {
    let stopped_deadline = tokio::time::Instant::now() + STOPPED_DEADLINE;
    loop {
        if driver.get_state().await == crate::options::VMState::Stopped {
            break;
        }
        if tokio::time::Instant::now() >= stopped_deadline {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    let running_deadline = tokio::time::Instant::now() + RUNNING_AGAIN_DEADLINE;
    loop {
        if driver.get_state().await == crate::options::VMState::Running {
            break;
        }
        if tokio::time::Instant::now() >= running_deadline {
            return Err(Error::BootFailed {
                log_excerpt: "did not come back up after a reboot-triggering check".to_string(),
            });
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    wait_for_ssh(driver, proxy, opts).await
}

/// Discovers the guest IP, programs the forwarding, then polls until SSH is
/// reachable. Mirrors the single-loop contract: each iteration may install
/// forwarding (once), dial TCP, and probe SSH.
async fn wait_for_ssh(
    driver: &mut dyn HypervisorDriver,
    proxy: &ProxyController,
    opts: &VMOptions,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + WAIT_FOR_SSH_DEADLINE;
    let mut forwarding_installed = false;

    loop {
        debug!(
            forwarding_installed,
            remaining_ms = deadline.saturating_duration_since(tokio::time::Instant::now()).as_millis(),
            "wait_for_ssh poll"
        );

        if !forwarding_installed {
            let log = driver.read_serial_log().await;
            let guest_ip = extract_guest_ip(&log);
            if !guest_ip.is_empty() {
                proxy.expose(opts.ssh_host_port, &guest_ip, 22).await?;
                forwarding_installed = true;
            }
        }

        if forwarding_installed {
            let addr = format!("127.0.0.1:{}", opts.ssh_host_port);
            if tokio::time::timeout(SSH_DIAL_TIMEOUT, tokio::net::TcpStream::connect(&addr))
                .await
                .map(|r| r.is_ok())
                .unwrap_or(false)
            {
                if driver.ssh("true").await.is_ok() {
                    return Ok(());
                }
            }
        }

        if tokio::time::Instant::now() >= deadline {
            let log = driver.read_serial_log().await;
            let diagnostics = ssh_diagnostics(opts, &log);
            return Err(Error::SshUnavailable { diagnostics });
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

fn ssh_diagnostics(opts: &VMOptions, log: &str) -> String {
    let mut hints = Vec::new();
    if extract_guest_ip(log).is_empty() {
        hints.push("no guest IP observed in serial log");
    }
    for marker in ["login:", "systemd", "sshd", "error"] {
        if log.contains(marker) {
            hints.push(marker);
        }
    }
    format!(
        "ssh_user={} ssh_port={} key={}\nhints: {}\n{}",
        opts.ssh_user,
        opts.ssh_host_port,
        opts.ssh_key_path.display(),
        hints.join(", "),
        crate::hypervisor::vfkit::tail_lines(log, 50)
    )
}

#[allow(clippy::too_many_arguments)]
async fn persist_vm_info(
    name: &str,
    pipeline: &Pipeline,
    image_tag: &str,
    source_disk: &Path,
    created_at: chrono::DateTime<chrono::Utc>,
    driver: &dyn HypervisorDriver,
    proxy: &ProxyController,
    state: crate::options::VMState,
) -> Result<VMInfo> {
    let info = driver.to_vm_info(
        name,
        VMInfoExtra {
            pipeline_name: pipeline.name.clone(),
            pipeline_file_path: pipeline.file_path.clone(),
            image_tag: image_tag.to_string(),
            disk_image_path: source_disk.to_path_buf(),
            created_at,
            state,
            proxy_sock_path: proxy.artifacts.guest_sock.clone(),
            proxy_control_sock_path: proxy.artifacts.control_sock.clone(),
            proxy_pid: proxy.process_id(),
        },
    );
    let registry = VMRegistry::at_default_location();
    registry.save(&info).await?;
    Ok(info)
}

/// Stops the proxy and hypervisor, asks the driver to remove its own
/// artifacts, releases the allocated SSH port, then runs the remaining
/// deferred actions (temp disk removal) in LIFO order. Best-effort:
/// individual removal failures are logged, never propagated, so a
/// partially-failed cleanup never masks the run's real error.
async fn cleanup_all(
    defer: &mut Deferred<'_>,
    driver: &mut dyn HypervisorDriver,
    proxy: &mut ProxyController,
    ssh_port: u16,
) {
    if let Err(e) = driver.stop().await {
        warn!(error = %e, "cleanup: failed to stop hypervisor");
    }
    if let Err(e) = proxy.stop().await {
        warn!(error = %e, "cleanup: failed to stop proxy");
    }
    if let Err(e) = driver.cleanup().await {
        warn!(error = %e, "cleanup: failed to remove hypervisor artifacts");
    }
    if let Err(e) = PortRegistry::at_default_location().release_port(ssh_port).await {
        warn!(error = %e, "cleanup: failed to release ssh port");
    }
    info!("vm cleanup complete");
    // Remaining actions (temp disk removal) run in LIFO order on drop.
    drop(std::mem::replace(defer, Deferred::new()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_sanitized_tag_raw_first() {
        let dir = tempfile::tempdir().unwrap();
        let images_dir = dir.path().join("output").join("images");
        std::fs::create_dir_all(&images_dir).unwrap();
        std::fs::write(images_dir.join("demo.raw"), b"x").unwrap();
        std::fs::write(images_dir.join("demo.qcow2"), b"x").unwrap();

        let found = resolve_disk_image(dir.path(), "demo").unwrap();
        assert_eq!(found, images_dir.join("demo.raw"));
    }

    #[test]
    fn falls_back_to_image_disk_raw() {
        let dir = tempfile::tempdir().unwrap();
        let images_dir = dir.path().join("output").join("images");
        std::fs::create_dir_all(images_dir.join("image")).unwrap();
        std::fs::write(images_dir.join("image").join("disk.raw"), b"x").unwrap();

        let found = resolve_disk_image(dir.path(), "demo").unwrap();
        assert_eq!(found, images_dir.join("image").join("disk.raw"));
    }

    #[test]
    fn falls_back_to_qcow2_when_no_raw_exists() {
        let dir = tempfile::tempdir().unwrap();
        let images_dir = dir.path().join("output").join("images");
        std::fs::create_dir_all(&images_dir).unwrap();
        std::fs::write(images_dir.join("demo.qcow2"), b"x").unwrap();

        let found = resolve_disk_image(dir.path(), "demo").unwrap();
        assert_eq!(found, images_dir.join("demo.qcow2"));
    }

    #[test]
    fn returns_none_when_nothing_matches() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("output").join("images")).unwrap();
        assert!(resolve_disk_image(dir.path(), "demo").is_none());
    }
}
