//! Persists per-VM metadata as one JSON file per VM in the user-local data
//! directory; the backing store for `list`/`stop`/`status` commands.

use std::path::PathBuf;

use bootc_vm_common::fsutil::write_atomic_async;
use chrono::{DateTime, Utc};
use nix::sys::signal;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hypervisor::HypervisorVariant;
use crate::options::VMState;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VMInfo {
    pub name: String,
    pub pipeline_name: String,
    pub pipeline_file_path: PathBuf,
    pub image_tag: String,
    pub disk_image_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub ssh_key_path: PathBuf,
    pub serial_log_path: PathBuf,
    pub state: VMState,
    pub hypervisor_variant: HypervisorVariant,
    pub process_id: u32,
    pub proxy_sock_path: PathBuf,
    pub proxy_control_sock_path: PathBuf,
    pub proxy_process_id: u32,
    pub endpoint_url: Option<String>,
    pub pid_file_path: Option<PathBuf>,
}

pub struct VMRegistry {
    dir: PathBuf,
}

impl VMRegistry {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn at_default_location() -> Self {
        Self::new(crate::paths::vm_registry_dir())
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    pub async fn save(&self, info: &VMInfo) -> Result<()> {
        let path = self.path_for(&info.name);
        let json = serde_json::to_vec_pretty(info)?;
        write_atomic_async(path.clone(), json)
            .await
            .map_err(|e| Error::io(path, e))
    }

    pub async fn load(&self, name: &str) -> Result<VMInfo> {
        let path = self.path_for(name);
        let bytes = tokio::fs::read(&path).await.map_err(|_| Error::NotFound {
            what: "VM",
            name: name.to_string(),
        })?;
        serde_json::from_slice(&bytes).map_err(Error::from)
    }

    pub async fn list(&self) -> Result<Vec<VMInfo>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(self.dir.clone(), e)),
        };

        let mut infos = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| Error::io(self.dir.clone(), e))? {
            if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(bytes) = tokio::fs::read(entry.path()).await {
                if let Ok(info) = serde_json::from_slice::<VMInfo>(&bytes) {
                    infos.push(info);
                }
            }
        }
        Ok(infos)
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let path = self.path_for(name);
        tokio::fs::remove_file(&path).await.map_err(|_| Error::NotFound {
            what: "VM",
            name: name.to_string(),
        })
    }

    /// Uses `process_id` if non-zero, else `proxy_process_id` as the legacy
    /// fallback, and checks liveness via signal-0 delivery.
    pub fn is_vm_running(info: &VMInfo) -> bool {
        let pid = if info.process_id != 0 {
            info.process_id
        } else {
            info.proxy_process_id
        };
        if pid == 0 {
            return false;
        }
        signal::kill(Pid::from_raw(pid as i32), None).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info(name: &str) -> VMInfo {
        VMInfo {
            name: name.to_string(),
            pipeline_name: "demo-pipeline".to_string(),
            pipeline_file_path: PathBuf::from("/pipelines/demo.yaml"),
            image_tag: "demo:latest".to_string(),
            disk_image_path: PathBuf::from("/tmp/demo.raw"),
            created_at: DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            ssh_host: "127.0.0.1".to_string(),
            ssh_port: 2222,
            ssh_user: "user".to_string(),
            ssh_key_path: PathBuf::from("/home/user/.ssh/id_ed25519"),
            serial_log_path: PathBuf::from("/tmp/demo-serial.log"),
            state: VMState::Running,
            hypervisor_variant: HypervisorVariant::Qemu,
            process_id: std::process::id(),
            proxy_sock_path: PathBuf::from("/tmp/gvproxy-demo.sock"),
            proxy_control_sock_path: PathBuf::from("/tmp/gvproxy-demo-service.sock"),
            proxy_process_id: 0,
            endpoint_url: None,
            pid_file_path: Some(PathBuf::from("/tmp/demo.pid")),
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips_every_field() {
        let dir = tempfile::tempdir().unwrap();
        let registry = VMRegistry::new(dir.path().to_path_buf());
        let info = sample_info("demo");

        registry.save(&info).await.unwrap();
        let loaded = registry.load("demo").await.unwrap();
        assert_eq!(loaded, info);
    }

    #[tokio::test]
    async fn load_missing_vm_returns_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let registry = VMRegistry::new(dir.path().to_path_buf());
        let err = registry.load("ghost").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn list_skips_undecodable_files() {
        let dir = tempfile::tempdir().unwrap();
        let registry = VMRegistry::new(dir.path().to_path_buf());
        registry.save(&sample_info("good")).await.unwrap();
        tokio::fs::write(dir.path().join("garbage.json"), b"not json")
            .await
            .unwrap();

        let infos = registry.list().await.unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].name, "good");
    }

    #[tokio::test]
    async fn delete_missing_vm_returns_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let registry = VMRegistry::new(dir.path().to_path_buf());
        let err = registry.delete("ghost").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn delete_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let registry = VMRegistry::new(dir.path().to_path_buf());
        registry.save(&sample_info("demo")).await.unwrap();
        registry.delete("demo").await.unwrap();
        assert!(registry.load("demo").await.is_err());
    }

    #[test]
    fn is_vm_running_falls_back_to_legacy_pid_when_process_id_is_zero() {
        let mut info = sample_info("demo");
        info.process_id = 0;
        info.proxy_process_id = std::process::id();
        assert!(VMRegistry::is_vm_running(&info));
    }

    #[test]
    fn is_vm_running_is_false_when_both_pids_are_zero() {
        let mut info = sample_info("demo");
        info.process_id = 0;
        info.proxy_process_id = 0;
        assert!(!VMRegistry::is_vm_running(&info));
    }
}
