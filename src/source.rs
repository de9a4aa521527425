//! Sources of raw metadata bytes consumed by the reloading resolver

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::MetadataResult;

/// Produces a serialized metadata document once per refresh.
///
/// An error means the refresh failed and the published store stays as is.
/// Implementations log their own failures.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn fetch_metadata(&self) -> MetadataResult<Vec<u8>>;
}

/// Reads metadata from a local file on every refresh.
#[derive(Debug, Clone)]
pub struct FilesystemMetadataSource {
    path: PathBuf,
}

impl FilesystemMetadataSource {
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MetadataSource for FilesystemMetadataSource {
    async fn fetch_metadata(&self) -> MetadataResult<Vec<u8>> {
        tokio::fs::read(&self.path).await.map_err(|e| {
            tracing::error!(
                path = %self.path.display(),
                error = %e,
                "Could not read metadata file"
            );
            e.into()
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use crate::error::MetadataError;

    use super::*;

    #[tokio::test]
    async fn test_reads_file_contents() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"<md:EntitiesDescriptor/>").unwrap();

        let source = FilesystemMetadataSource::new(file.path());
        assert_eq!(
            source.fetch_metadata().await.unwrap(),
            b"<md:EntitiesDescriptor/>".to_vec()
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = FilesystemMetadataSource::new(dir.path().join("missing.xml"));
        assert!(matches!(
            source.fetch_metadata().await,
            Err(MetadataError::Io(_))
        ));
    }
}
