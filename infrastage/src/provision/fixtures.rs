//! Materializing stage templates into run-scoped working directories.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::identity::FamilyId;

/// Copies a named template fixture into a destination directory.
pub trait FixtureCopier: Send + Sync {
    /// Copies `fixture` to `destination`.
    ///
    /// Returns `Ok(false)` without touching anything if the destination
    /// already exists.
    fn copy(&self, fixture: &str, destination: &Path) -> io::Result<bool>;
}

/// Returns the working directory that holds all of a run's template copies.
#[must_use]
pub fn run_workspace(workspace_root: &Path, family_id: &FamilyId) -> PathBuf {
    workspace_root.join(format!("{family_id}-work"))
}

/// Returns the working directory for one stage's template copy.
#[must_use]
pub fn stage_workspace(workspace_root: &Path, family_id: &FamilyId, stage: &str) -> PathBuf {
    run_workspace(workspace_root, family_id).join(stage)
}

/// Recursive directory copier rooted at a fixtures directory.
#[derive(Debug, Clone)]
pub struct DirFixtureCopier {
    source_root: PathBuf,
}

impl DirFixtureCopier {
    /// Creates a copier reading fixtures from `source_root`.
    #[must_use]
    pub fn new(source_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
        }
    }

    /// Returns the directory fixtures are read from.
    #[must_use]
    pub fn source_root(&self) -> &Path {
        &self.source_root
    }
}

impl FixtureCopier for DirFixtureCopier {
    fn copy(&self, fixture: &str, destination: &Path) -> io::Result<bool> {
        if destination.exists() {
            debug!(destination = %destination.display(), "Using existing fixture copy");
            return Ok(false);
        }

        let source = self.source_root.join(fixture);
        if !source.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("fixture {} not found under {}", fixture, self.source_root.display()),
            ));
        }

        info!(fixture = %fixture, destination = %destination.display(), "📁 Setting up fixture");

        for entry in WalkDir::new(&source) {
            let entry = entry.map_err(io::Error::from)?;
            let relative = entry
                .path()
                .strip_prefix(&source)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            let target = destination.join(relative);

            if entry.file_type().is_dir() {
                fs::create_dir_all(&target)?;
            } else {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(entry.path(), &target)?;
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_copies_nested_fixture() {
        let fixtures = tempfile::tempdir().unwrap();
        write(&fixtures.path().join("test-networking/main.tf"), "module {}");
        write(&fixtures.path().join("test-networking/modules/vpc/vars.tf"), "variable {}");

        let work = tempfile::tempdir().unwrap();
        let destination = work.path().join("t1-work/network");
        let copier = DirFixtureCopier::new(fixtures.path());

        assert!(copier.copy("test-networking", &destination).unwrap());
        assert_eq!(fs::read_to_string(destination.join("main.tf")).unwrap(), "module {}");
        assert!(destination.join("modules/vpc/vars.tf").exists());
    }

    #[test]
    fn test_existing_destination_is_left_alone() {
        let fixtures = tempfile::tempdir().unwrap();
        write(&fixtures.path().join("test-eks/main.tf"), "new");

        let work = tempfile::tempdir().unwrap();
        let destination = work.path().join("eks");
        write(&destination.join("main.tf"), "old");

        let copier = DirFixtureCopier::new(fixtures.path());
        assert!(!copier.copy("test-eks", &destination).unwrap());
        assert_eq!(fs::read_to_string(destination.join("main.tf")).unwrap(), "old");
    }

    #[test]
    fn test_missing_fixture_is_not_found() {
        let fixtures = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let copier = DirFixtureCopier::new(fixtures.path());

        let err = copier.copy("nope", &work.path().join("x")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_workspace_paths() {
        let id = FamilyId::new("t250101120000-ab3cd");
        let path = stage_workspace(Path::new("/work"), &id, "network");
        assert_eq!(path, PathBuf::from("/work/t250101120000-ab3cd-work/network"));
    }
}
