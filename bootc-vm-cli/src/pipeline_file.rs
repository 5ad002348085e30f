//! A minimal, intentionally thin TOML loader that produces a
//! `bootc_vm::Pipeline`. Full pipeline-schema parsing (the format a build
//! pipeline actually authors) is an external collaborator's job; this is
//! only enough to drive `bootvmctl run` from a file on disk or from bare
//! CLI flags for local testing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bootc_vm::Pipeline;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct PipelineFile {
    name: String,
    #[serde(default)]
    base_dir: Option<PathBuf>,
    #[serde(default)]
    boot_checks: Vec<String>,
    #[serde(default)]
    boot_timeout_secs: Option<u64>,
    #[serde(default)]
    gui: bool,
}

pub async fn load(path: &Path) -> anyhow::Result<Pipeline> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| anyhow::anyhow!("reading pipeline file {}: {e}", path.display()))?;
    let parsed: PipelineFile =
        toml::from_str(&text).map_err(|e| anyhow::anyhow!("parsing pipeline file {}: {e}", path.display()))?;

    let base_dir = parsed
        .base_dir
        .unwrap_or_else(|| path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(".")));

    Ok(Pipeline {
        name: parsed.name,
        file_path: path.to_path_buf(),
        base_dir,
        boot_checks: parsed.boot_checks,
        boot_timeout: parsed.boot_timeout_secs.map(Duration::from_secs),
        gui_requested: parsed.gui,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loads_a_minimal_pipeline_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        tokio::fs::write(
            &path,
            r#"
name = "demo"
boot_checks = ["bootc status", "systemctl is-system-running"]
boot_timeout_secs = 45
"#,
        )
        .await
        .unwrap();

        let pipeline = load(&path).await.unwrap();
        assert_eq!(pipeline.name, "demo");
        assert_eq!(pipeline.boot_checks.len(), 2);
        assert_eq!(pipeline.boot_timeout, Some(Duration::from_secs(45)));
        assert_eq!(pipeline.base_dir, dir.path());
        assert!(!pipeline.gui_requested);
    }

    #[tokio::test]
    async fn base_dir_override_is_honored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        tokio::fs::write(
            &path,
            r#"
name = "demo"
base_dir = "/srv/pipelines/demo"
"#,
        )
        .await
        .unwrap();

        let pipeline = load(&path).await.unwrap();
        assert_eq!(pipeline.base_dir, PathBuf::from("/srv/pipelines/demo"));
        assert!(pipeline.boot_checks.is_empty());
    }
}
