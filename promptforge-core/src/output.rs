//! Run Store - Per-Run Output Directories
//!
//! Layout:
//!   <root>/<run_name>/manifest.json
//!   <root>/<run_name>/attempt-NN/prompt.txt
//!   <root>/<run_name>/attempt-NN/candidate-MM.<ext>
//!
//! Runs are never overwritten. `cleanup` is the only deletion path.

use log::info;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::assets::AssetRegistry;
use crate::controller::RunRecord;
use crate::error::OutputError;
use crate::hashing::compute_manifest_hash;

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Serialize)]
struct Manifest<'a> {
    #[serde(flatten)]
    record: &'a RunRecord,
    attempt_count: usize,
    manifest_hash: String,
}

/// Where a persisted run ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedRun {
    pub dir: PathBuf,
    pub manifest_path: PathBuf,
    pub manifest_hash: String,
}

#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_name: &str) -> Result<PathBuf, OutputError> {
        validate_run_name(run_name)?;
        Ok(self.root.join(run_name))
    }

    /// Write every attempt's prompt and candidates plus the manifest.
    /// Artifact paths are filled into `record` as they are written.
    pub fn persist(
        &self,
        record: &mut RunRecord,
        registry: &AssetRegistry,
    ) -> Result<PersistedRun, OutputError> {
        let dir = self.run_dir(&record.run_name)?;
        if dir.exists() {
            return Err(OutputError::RunExists(record.run_name.clone()));
        }

        // Check every prompt before anything touches the disk.
        for attempt in &record.attempts {
            if let Some(asset) = registry.scan_for_leaks(&attempt.prompt_text).into_iter().next() {
                return Err(OutputError::Leakage(asset));
            }
        }

        fs::create_dir_all(&dir)?;
        for attempt in &mut record.attempts {
            let attempt_dir_name = format!("attempt-{:02}", attempt.number);
            let attempt_dir = dir.join(&attempt_dir_name);
            fs::create_dir_all(&attempt_dir)?;
            fs::write(attempt_dir.join("prompt.txt"), &attempt.prompt_text)?;

            for candidate in &mut attempt.candidates {
                let file_name = format!(
                    "candidate-{:02}.{}",
                    candidate.index + 1,
                    candidate.candidate.extension()
                );
                fs::write(attempt_dir.join(&file_name), &candidate.candidate.bytes)?;
                candidate.artifact = Some(format!("{}/{}", attempt_dir_name, file_name));
            }
        }

        let record: &RunRecord = record;
        let mut manifest = Manifest {
            record,
            attempt_count: record.attempts.len(),
            manifest_hash: String::new(),
        };
        manifest.manifest_hash = compute_manifest_hash(&manifest)?;

        let manifest_path = dir.join(MANIFEST_FILE);
        fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)?;

        info!(
            run = record.run_name.as_str(),
            dir = dir.display().to_string(),
            manifest_hash = manifest.manifest_hash.as_str();
            "Run persisted"
        );

        Ok(PersistedRun { dir, manifest_path, manifest_hash: manifest.manifest_hash })
    }

    /// Remove a run directory. Returns false when there was nothing to remove.
    pub fn cleanup(&self, run_name: &str) -> Result<bool, OutputError> {
        let dir = self.run_dir(run_name)?;
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&dir)?;
        info!(run = run_name; "Run removed");
        Ok(true)
    }
}

pub fn validate_run_name(run_name: &str) -> Result<(), OutputError> {
    let valid = !run_name.is_empty()
        && run_name != "."
        && !run_name.contains("..")
        && run_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(OutputError::InvalidRunName(run_name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_name_validation() {
        assert!(validate_run_name("lakehouse-v2_final.1").is_ok());
        for bad in ["", ".", "..", "a/b", "../escape", "a b", "a\\b"] {
            assert!(validate_run_name(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_cleanup_missing_run_is_noop() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = RunStore::new(dir.path());
        assert!(!store.cleanup("never-ran").unwrap());
    }
}
