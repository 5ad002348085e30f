//! File-locked allocator of host TCP ports, coexisting with a foreign
//! allocator sharing the same data file.
//!
//! The only safety net here is the advisory lock held for the entire
//! read-modify-write transaction; there is no in-process mutex because the
//! concurrency unit is cooperating processes, not cooperating tasks.

use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::path::PathBuf;

use bootc_vm_common::flock::FileLock;
use bootc_vm_common::fsutil::write_atomic_async;
use tracing::warn;

use crate::error::{Error, Result};

const MAX_RETRIES: u32 = 10_000;

pub struct PortRegistry {
    data_path: PathBuf,
    lock_path: PathBuf,
}

impl PortRegistry {
    pub fn new(data_path: PathBuf, lock_path: PathBuf) -> Self {
        Self {
            data_path,
            lock_path,
        }
    }

    pub fn at_default_location() -> Self {
        Self::new(
            crate::paths::port_registry_data_path(),
            crate::paths::port_registry_lock_path(),
        )
    }

    /// Reserve and return a host TCP port not currently in the registry,
    /// bindable at the instant of allocation.
    pub async fn allocate_port(&self) -> Result<u16> {
        let _lock = FileLock::acquire(self.lock_path.clone()).await.map_err(|e| {
            Error::io(self.lock_path.clone(), e)
        })?;

        let mut ports = self.load().await;

        let mut retries = 0u32;
        loop {
            if retries >= MAX_RETRIES {
                return Err(Error::AllocationExhausted { retries });
            }
            let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
                .map_err(|e| Error::io(PathBuf::from("loopback:0"), e))?;
            let port = listener.local_addr().map_err(|e| Error::io(PathBuf::from("loopback:0"), e))?.port();

            if ports.contains(&port) {
                retries += 1;
                drop(listener);
                continue;
            }

            ports.push(port);
            self.save(&ports).await?;
            drop(listener);
            return Ok(port);
        }
    }

    /// Remove a port from the registry. No-op for non-positive or absent
    /// values, and idempotent.
    pub async fn release_port(&self, port: u16) -> Result<()> {
        if port == 0 {
            return Ok(());
        }
        let _lock = FileLock::acquire(self.lock_path.clone()).await.map_err(|e| {
            Error::io(self.lock_path.clone(), e)
        })?;

        let mut ports = self.load().await;
        ports.retain(|p| *p != port);
        self.save(&ports).await
    }

    /// Probe by attempting a TCP listen on loopback.
    pub fn is_local_port_available(port: u16) -> bool {
        TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).is_ok()
    }

    async fn load(&self) -> Vec<u16> {
        match tokio::fs::read(&self.data_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(error = %e, path = %self.data_path.display(), "corrupt port registry, treating as empty");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        }
    }

    async fn save(&self, ports: &[u16]) -> Result<()> {
        let json = serde_json::to_vec(ports)?;
        write_atomic_async(self.data_path.clone(), json)
            .await
            .map_err(|e| Error::io(self.data_path.clone(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_in(dir: &std::path::Path) -> PortRegistry {
        PortRegistry::new(dir.join("port-alloc.dat"), dir.join("port-alloc.lck"))
    }

    #[tokio::test]
    async fn allocated_port_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry_in(dir.path());
        let port = reg.allocate_port().await.unwrap();
        assert!(port >= 1024);

        let bytes = tokio::fs::read(dir.path().join("port-alloc.dat")).await.unwrap();
        let ports: Vec<u16> = serde_json::from_slice(&bytes).unwrap();
        assert!(ports.contains(&port));
    }

    #[tokio::test]
    async fn concurrent_allocations_are_pairwise_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let data_path = dir.path().join("port-alloc.dat");
        let lock_path = dir.path().join("port-alloc.lck");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let data_path = data_path.clone();
            let lock_path = lock_path.clone();
            handles.push(tokio::spawn(async move {
                PortRegistry::new(data_path, lock_path).allocate_port().await.unwrap()
            }));
        }

        let mut ports = Vec::new();
        for h in handles {
            ports.push(h.await.unwrap());
        }
        let mut deduped = ports.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(ports.len(), deduped.len());
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry_in(dir.path());
        let port = reg.allocate_port().await.unwrap();
        reg.release_port(port).await.unwrap();
        reg.release_port(port).await.unwrap();

        let bytes = tokio::fs::read(dir.path().join("port-alloc.dat")).await.unwrap();
        let ports: Vec<u16> = serde_json::from_slice(&bytes).unwrap();
        assert!(!ports.contains(&port));
    }

    #[tokio::test]
    async fn release_of_zero_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry_in(dir.path());
        reg.release_port(0).await.unwrap();
        assert!(!dir.path().join("port-alloc.dat").exists());
    }

    #[tokio::test]
    async fn corrupt_registry_self_heals() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("port-alloc.dat"), b"not json")
            .await
            .unwrap();
        let reg = registry_in(dir.path());
        let port = reg.allocate_port().await.unwrap();
        assert!(port >= 1024);
    }

    #[tokio::test]
    async fn allocation_exhausted_when_registry_occupies_every_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry_in(dir.path());

        // Pre-seed the registry with every port a freshly bound loopback
        // listener could possibly return, forcing every retry to collide.
        let all_ports: Vec<u16> = (1024..=65535).collect();
        reg.save(&all_ports).await.unwrap();

        let result = reg.allocate_port().await;
        assert!(matches!(result, Err(Error::AllocationExhausted { .. })));
    }
}
