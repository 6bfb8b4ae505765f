use crate::domain::ports::Storage;
use crate::utils::error::Result;
use std::path::{Path, PathBuf};

/// Filesystem storage rooted at a base directory. Absolute paths bypass the base.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn resolve(&self, path: &str) -> PathBuf {
        Path::new(&self.base_path).join(path)
    }
}

impl Default for LocalStorage {
    fn default() -> Self {
        Self::new(".")
    }
}

impl Storage for LocalStorage {
    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let data = tokio::fs::read(self.resolve(path)).await?;
        Ok(data)
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let full_path = self.resolve(path);

        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tokio::fs::write(full_path, data).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::error::DispatchError;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_creates_parent_dirs_and_reads_back() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path());

        storage
            .write_file("reports/march/failed.csv", b"recipient\n")
            .await
            .unwrap();
        let data = storage.read_file("reports/march/failed.csv").await.unwrap();
        assert_eq!(data, b"recipient\n");
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path());

        let err = storage.read_file("nope.csv").await.unwrap_err();
        assert!(matches!(err, DispatchError::IoError(_)));
    }

    #[test]
    fn test_absolute_path_bypasses_base() {
        let storage = LocalStorage::new("/srv/dispatch");
        assert_eq!(storage.resolve("/tmp/a.csv"), PathBuf::from("/tmp/a.csv"));
        assert_eq!(
            storage.resolve("lists/a.csv"),
            PathBuf::from("/srv/dispatch/lists/a.csv")
        );
    }
}
