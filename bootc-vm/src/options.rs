//! Input and derived types shared across every component: [`VMOptions`]
//! names a run, [`SSHConfig`] is what the orchestrator hands to the SSH
//! command surface, and [`VMState`] is the lifecycle state machine every
//! hypervisor driver reports through.

use std::path::PathBuf;

/// The host-side address by which a guest reaches the host through the
/// network proxy's NAT gateway.
pub const PROXY_GATEWAY_IP: &str = "192.168.127.1";

/// Input to a VM run.
#[derive(Debug, Clone)]
pub struct VMOptions {
    pub name: String,
    pub disk_image_path: PathBuf,
    pub vcpus: u32,
    pub memory_mib: u32,
    pub ssh_user: String,
    pub ssh_key_path: PathBuf,
    /// 0 means "allocate a free port".
    pub ssh_host_port: u16,
    pub gui: bool,
    pub serial_log_path: Option<PathBuf>,
    pub efi_vars_path: Option<PathBuf>,
}

impl VMOptions {
    /// Sanitize a user-chosen VM name into a safe filename component:
    /// characters outside `[A-Za-z0-9-]` become `-`, then the result is
    /// truncated to 30 bytes.
    pub fn sanitize_name(raw: &str) -> String {
        let mapped: String = raw
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
            .collect();
        mapped.chars().take(30).collect()
    }
}

/// Derived SSH connection parameters for a running VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SSHConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_path: PathBuf,
    pub gateway_ip: String,
}

impl SSHConfig {
    pub fn new(port: u16, user: impl Into<String>, key_path: PathBuf) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port,
            user: user.into(),
            key_path,
            gateway_ip: PROXY_GATEWAY_IP.to_string(),
        }
    }
}

/// Lifecycle state of a VM as reported by its hypervisor driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VMState {
    Starting,
    Running,
    Stopped,
    Error,
    Unknown,
}

impl std::fmt::Display for VMState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VMState::Starting => "starting",
            VMState::Running => "running",
            VMState::Stopped => "stopped",
            VMState::Error => "error",
            VMState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_invalid_characters() {
        assert_eq!(VMOptions::sanitize_name("my vm/name!"), "my-vm-name-");
    }

    #[test]
    fn sanitize_preserves_valid_characters() {
        assert_eq!(VMOptions::sanitize_name("demo-01"), "demo-01");
    }

    #[test]
    fn sanitize_truncates_to_thirty_characters() {
        let long = "a".repeat(50);
        let sanitized = VMOptions::sanitize_name(&long);
        assert_eq!(sanitized.len(), 30);
    }

    #[test]
    fn sanitize_handles_empty_input() {
        assert_eq!(VMOptions::sanitize_name(""), "");
    }

    #[test]
    fn ssh_config_uses_proxy_gateway() {
        let cfg = SSHConfig::new(2222, "user", PathBuf::from("/tmp/id_ed25519"));
        assert_eq!(cfg.gateway_ip, PROXY_GATEWAY_IP);
        assert_eq!(cfg.host, "127.0.0.1");
    }
}
