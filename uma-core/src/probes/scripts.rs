//! User-script inventory.
//!
//! Scans the configured scripts directory for subdirectories containing an
//! executable `script` file, matching the on-disk layout of the user.scripts
//! plugin (one directory per script, named after it).

use std::path::PathBuf;

use crate::error::ProbeError;
use crate::types::{ScriptInfo, ScriptInventory};

pub struct ScriptsProbe {
    scripts_dir: PathBuf,
}

impl std::fmt::Debug for ScriptsProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptsProbe")
            .field("scripts_dir", &self.scripts_dir)
            .finish()
    }
}

impl ScriptsProbe {
    pub fn new(scripts_dir: impl Into<PathBuf>) -> Self {
        Self {
            scripts_dir: scripts_dir.into(),
        }
    }

    pub async fn collect(&self) -> Result<ScriptInventory, ProbeError> {
        let mut dir = match tokio::fs::read_dir(&self.scripts_dir).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                // No plugin installed: an empty inventory, not a failure.
                return Ok(ScriptInventory::default());
            }
            Err(err) => {
                return Err(ProbeError::Command(format!(
                    "reading {}: {err}",
                    self.scripts_dir.display()
                )));
            }
        };

        let mut scripts = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|err| ProbeError::Command(err.to_string()))?
        {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let script_file = path.join("script");
            if tokio::fs::try_exists(&script_file).await.unwrap_or(false) {
                scripts.push(ScriptInfo {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    path: script_file.display().to_string(),
                });
            }
        }

        scripts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(ScriptInventory { scripts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finds_script_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("backup")).unwrap();
        std::fs::write(dir.path().join("backup/script"), "#!/bin/bash\n").unwrap();
        std::fs::create_dir(dir.path().join("empty")).unwrap();
        std::fs::write(dir.path().join("stray-file"), "").unwrap();

        let probe = ScriptsProbe::new(dir.path());
        let inventory = probe.collect().await.unwrap();

        assert_eq!(inventory.scripts.len(), 1);
        assert_eq!(inventory.scripts[0].name, "backup");
    }

    #[tokio::test]
    async fn missing_directory_is_empty_inventory() {
        let probe = ScriptsProbe::new("/nonexistent/path/to/scripts");
        let inventory = probe.collect().await.unwrap();
        assert!(inventory.scripts.is_empty());
    }
}
