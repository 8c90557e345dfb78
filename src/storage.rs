//! Per-project storage areas.
//!
//! ```text
//! <data_dir>/projects/<project_id>/
//!     files/                 uploaded-file copies
//!     memory_index.json      persisted index artifact
//! ```
//!
//! Artifact writes go through [`write_atomic`] so a crash mid-write never
//! leaves a truncated artifact behind.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::{KbError, Result};

const FILES_DIR: &str = "files";
const ARTIFACT_FILE: &str = "memory_index.json";

#[derive(Debug, Clone)]
pub struct StorageLayout {
    projects_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(projects_dir: impl Into<PathBuf>) -> Self {
        Self {
            projects_dir: projects_dir.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.projects_dir())
    }

    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.projects_dir.join(project_id)
    }

    pub fn files_dir(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join(FILES_DIR)
    }

    pub fn artifact_path(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join(ARTIFACT_FILE)
    }

    /// Allocate the isolated area for a new project.
    pub fn create_area(&self, project_id: &str) -> Result<()> {
        let files = self.files_dir(project_id);
        std::fs::create_dir_all(&files).map_err(|e| KbError::storage(&files, e))
    }

    /// Remove a project's whole area. Missing areas are not an error.
    pub fn remove_area(&self, project_id: &str) -> Result<()> {
        let dir = self.project_dir(project_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KbError::storage(&dir, e)),
        }
    }

    /// Delete the index artifact only, keeping uploaded files.
    pub fn remove_artifact(&self, project_id: &str) -> Result<()> {
        let path = self.artifact_path(project_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KbError::storage(&path, e)),
        }
    }

    /// Size of the persisted artifact in bytes, 0 if absent.
    pub fn artifact_size(&self, project_id: &str) -> u64 {
        std::fs::metadata(self.artifact_path(project_id))
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Copy an uploaded file into the project's `files/` directory.
    pub fn store_upload(&self, project_id: &str, filename: &str, bytes: &[u8]) -> Result<PathBuf> {
        let name = sanitize_filename(filename)?;
        let dir = self.files_dir(project_id);
        std::fs::create_dir_all(&dir).map_err(|e| KbError::storage(&dir, e))?;
        let dest = dir.join(name);
        write_atomic(&dest, bytes)?;
        Ok(dest)
    }
}

/// Reduce a client-supplied filename to its final component.
pub fn sanitize_filename(filename: &str) -> Result<String> {
    let name = Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if name.is_empty() || name == "." || name == ".." {
        return Err(KbError::validation(format!("invalid filename: '{}'", filename)));
    }
    Ok(name)
}

/// Write-temp-then-rename within the destination directory.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| KbError::storage(path, "path has no parent directory"))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| KbError::storage(dir, e))?;
    tmp.write_all(bytes).map_err(|e| KbError::storage(path, e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| KbError::storage(path, e))?;
    tmp.persist(path).map_err(|e| KbError::storage(path, e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_area_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let layout = StorageLayout::new(tmp.path().join("projects"));

        layout.create_area("p1").unwrap();
        assert!(layout.files_dir("p1").is_dir());
        assert_eq!(layout.artifact_size("p1"), 0);

        write_atomic(&layout.artifact_path("p1"), b"{\"chunks\":[]}").unwrap();
        assert_eq!(layout.artifact_size("p1"), 13);

        layout.remove_artifact("p1").unwrap();
        assert_eq!(layout.artifact_size("p1"), 0);
        assert!(layout.files_dir("p1").is_dir());

        layout.remove_area("p1").unwrap();
        assert!(!layout.project_dir("p1").exists());
        // Second removal is a no-op
        layout.remove_area("p1").unwrap();
    }

    #[test]
    fn test_write_atomic_replaces() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.json");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        // No stray temp files left in the directory
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_store_upload_strips_directories() {
        let tmp = TempDir::new().unwrap();
        let layout = StorageLayout::new(tmp.path());
        layout.create_area("p1").unwrap();
        let dest = layout
            .store_upload("p1", "../../etc/notes.txt", b"hello")
            .unwrap();
        assert_eq!(dest, layout.files_dir("p1").join("notes.txt"));
        assert!(sanitize_filename("..").is_err());
        assert!(sanitize_filename("").is_err());
    }
}
