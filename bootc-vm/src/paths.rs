//! Well-known filesystem locations: the runtime directory (sockets, PID
//! files, logs, EFI stores), the data directory (VM Registry, Port
//! Registry), and per-VM artifact paths derived from a sanitized name.

use std::path::PathBuf;

/// Directory for ephemeral per-run artifacts: sockets, PID files, logs, EFI
/// variable stores, temp disks. Prefers `$XDG_RUNTIME_DIR`, falling back to
/// `/tmp`.
pub fn runtime_dir() -> PathBuf {
    dirs::runtime_dir().unwrap_or_else(|| PathBuf::from("/tmp"))
}

/// Directory for persistent user data: `<XDG_DATA_HOME or ~/.local/share>`.
pub fn data_dir() -> PathBuf {
    dirs::data_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// `<data-dir>/bootc-man/vms/<name>.json`.
pub fn vm_info_path(name: &str) -> PathBuf {
    data_dir().join("bootc-man").join("vms").join(format!("{name}.json"))
}

/// `<data-dir>/bootc-man/vms/`.
pub fn vm_registry_dir() -> PathBuf {
    data_dir().join("bootc-man").join("vms")
}

/// `<data-dir>/containers/podman/machine/port-alloc.dat`.
pub fn port_registry_data_path() -> PathBuf {
    data_dir()
        .join("containers")
        .join("podman")
        .join("machine")
        .join("port-alloc.dat")
}

/// `<data-dir>/containers/podman/machine/port-alloc.lck`.
pub fn port_registry_lock_path() -> PathBuf {
    data_dir()
        .join("containers")
        .join("podman")
        .join("machine")
        .join("port-alloc.lck")
}

/// Guest-facing proxy socket path for a VM, transport suffix chosen by the
/// hypervisor variant (the socket itself is plain, only the connection mode
/// used against it differs).
pub fn proxy_guest_sock_path(safe_name: &str) -> PathBuf {
    runtime_dir().join(format!("gvproxy-{safe_name}.sock"))
}

pub fn proxy_control_sock_path(safe_name: &str) -> PathBuf {
    runtime_dir().join(format!("gvproxy-{safe_name}-service.sock"))
}

pub fn proxy_pid_path(safe_name: &str) -> PathBuf {
    runtime_dir().join(format!("gvproxy-{safe_name}.pid"))
}

pub fn proxy_log_path(safe_name: &str) -> PathBuf {
    runtime_dir().join(format!("gvproxy-{safe_name}.log"))
}

pub fn serial_log_path(safe_name: &str) -> PathBuf {
    runtime_dir().join(format!("bootc-vm-{safe_name}-serial.log"))
}

pub fn efi_vars_path(safe_name: &str) -> PathBuf {
    runtime_dir().join(format!("bootc-vm-{safe_name}-efivars.fd"))
}

pub fn hypervisor_pid_path(safe_name: &str) -> PathBuf {
    runtime_dir().join(format!("bootc-vm-{safe_name}.pid"))
}

pub fn temp_disk_path(safe_name: &str) -> PathBuf {
    runtime_dir().join(format!("bootc-vm-{safe_name}-disk.raw"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_info_path_uses_sanitized_name() {
        let path = vm_info_path("demo");
        assert!(path.ends_with("bootc-man/vms/demo.json"));
    }

    #[test]
    fn proxy_paths_are_distinct_per_purpose() {
        let name = "demo";
        let sock = proxy_guest_sock_path(name);
        let ctrl = proxy_control_sock_path(name);
        let pid = proxy_pid_path(name);
        let log = proxy_log_path(name);
        let all = [&sock, &ctrl, &pid, &log];
        for (i, a) in all.iter().enumerate() {
            for (j, b) in all.iter().enumerate() {
                if i != j {
                    assert_ne!(a, b);
                }
            }
        }
    }
}
