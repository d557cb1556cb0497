use crate::types::{VegError, VegResult};
use std::path::{Path, PathBuf};
use tempfile::TempPath;

/// Output file that only becomes visible under its final name on commit.
///
/// The writer fills a hidden sibling file in the destination directory and
/// [`AtomicFile::commit`] renames it into place, so an existing artifact is
/// always complete. Dropping an uncommitted file removes the partial data.
#[derive(Debug)]
pub struct AtomicFile {
    temp: TempPath,
    target: PathBuf,
}

impl AtomicFile {
    pub fn new(target: impl AsRef<Path>) -> VegResult<Self> {
        let target = target.as_ref().to_path_buf();
        let dir = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let suffix = target
            .extension()
            .map(|ext| format!(".partial.{}", ext.to_string_lossy()))
            .unwrap_or_else(|| ".partial".to_string());
        let temp = tempfile::Builder::new()
            .prefix(".")
            .suffix(&suffix)
            .tempfile_in(&dir)?
            .into_temp_path();

        Ok(Self { temp, target })
    }

    /// Scratch path the writer should create
    pub fn path(&self) -> &Path {
        &self.temp
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Rename the finished file onto its target
    pub fn commit(self) -> VegResult<PathBuf> {
        let target = self.target;
        self.temp
            .persist(&target)
            .map_err(|e| VegError::Io(e.error))?;
        log::debug!("Committed {}", target.display());
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_commit_makes_file_visible() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("out.tif");

        let file = AtomicFile::new(&target).unwrap();
        std::fs::write(file.path(), b"payload").unwrap();
        assert!(!target.exists());

        file.commit().unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"payload");
    }

    #[test]
    fn test_drop_discards_partial_output() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("out.nc");
        let scratch;
        {
            let file = AtomicFile::new(&target).unwrap();
            scratch = file.path().to_path_buf();
            std::fs::write(&scratch, b"half").unwrap();
        }
        assert!(!scratch.exists());
        assert!(!target.exists());
    }
}
