//! Optional `~/.config/bootc-vm/config.toml` carrying operator-tunable
//! defaults that are not per-run `VMOptions` fields: binary search path
//! overrides, timeout overrides, and a `gui` default. Pipeline-level
//! config (boot checks, per-run timeout) stays the caller's
//! responsibility; this file only ever widens the library's own
//! environment-variable override points, it never bypasses them.

use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gvproxy_path: Option<PathBuf>,
    pub hypervisor_path: Option<PathBuf>,
    pub vfkit_path: Option<PathBuf>,
    pub gui: Option<bool>,
    pub wait_for_ready_secs: Option<u64>,
    pub wait_for_ssh_secs: Option<u64>,
}

impl Config {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("bootc-vm").join("config.toml"))
    }

    /// Reads `path` if it exists; a missing file is not an error, since the
    /// config is entirely optional.
    pub async fn load(path: &std::path::Path) -> anyhow::Result<Config> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Ok(toml::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Applies the loaded overrides by setting the same environment
    /// variables the library's own binary-resolution functions already
    /// check, so a config override and an operator-set env var compose the
    /// same way: whichever is already set wins, config merely fills gaps.
    pub fn apply_to_environment(&self) {
        if let Some(p) = &self.gvproxy_path {
            set_if_absent("BOOTC_VM_GVPROXY", p);
        }
        if let Some(p) = &self.hypervisor_path {
            set_if_absent("BOOTC_VM_HYPERVISOR", p);
        }
        if let Some(p) = &self.vfkit_path {
            set_if_absent("BOOTC_VM_VFKIT", p);
        }
    }
}

fn set_if_absent(key: &str, value: &std::path::Path) {
    if std::env::var_os(key).is_none() {
        unsafe {
            std::env::set_var(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("config.toml")).await.unwrap();
        assert!(config.gvproxy_path.is_none());
        assert!(config.gui.is_none());
    }

    #[tokio::test]
    async fn parses_partial_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        tokio::fs::write(&path, "gui = true\nwait_for_ssh_secs = 90\n")
            .await
            .unwrap();

        let config = Config::load(&path).await.unwrap();
        assert_eq!(config.gui, Some(true));
        assert_eq!(config.wait_for_ssh_secs, Some(90));
        assert!(config.gvproxy_path.is_none());
    }

    #[test]
    fn apply_does_not_override_an_already_set_variable() {
        unsafe {
            std::env::set_var("BOOTC_VM_GVPROXY", "/explicit/gvproxy");
        }
        let config = Config {
            gvproxy_path: Some(PathBuf::from("/config/gvproxy")),
            ..Config::default()
        };
        config.apply_to_environment();
        assert_eq!(std::env::var("BOOTC_VM_GVPROXY").unwrap(), "/explicit/gvproxy");
        unsafe {
            std::env::remove_var("BOOTC_VM_GVPROXY");
        }
    }
}
