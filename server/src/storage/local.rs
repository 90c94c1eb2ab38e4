//! Local file storage.

use std::io::ErrorKind as IoErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File};
use tokio::io::{self, AsyncRead};

use super::{Download, RemoteFile, StorageBackend};
use crate::error::{ServerError, ServerResult};

#[derive(Debug)]
pub struct LocalBackend {
    config: LocalStorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalStorageConfig {
    /// The directory to store all files under.
    pub path: PathBuf,
}

/// Reference to a file in local storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRemoteFile {
    /// Name of the file.
    pub name: String,
}

impl LocalBackend {
    pub async fn new(config: LocalStorageConfig) -> ServerResult<Self> {
        fs::create_dir_all(&config.path)
            .await
            .map_err(ServerError::storage_error)?;

        Ok(Self { config })
    }

    fn get_path(&self, p: &str) -> PathBuf {
        self.config.path.join(p)
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn upload_file(
        &self,
        name: String,
        mut stream: &mut (dyn AsyncRead + Unpin + Send),
    ) -> ServerResult<RemoteFile> {
        let mut file = File::create(self.get_path(&name))
            .await
            .map_err(ServerError::storage_error)?;

        io::copy(&mut stream, &mut file)
            .await
            .map_err(ServerError::storage_error)?;

        Ok(RemoteFile::Local(LocalRemoteFile { name }))
    }

    async fn delete_file_db(&self, file: &RemoteFile) -> ServerResult<()> {
        let RemoteFile::Local(file) = file;

        match fs::remove_file(self.get_path(&file.name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(ServerError::storage_error(e)),
        }
    }

    async fn download_file_db(&self, file: &RemoteFile) -> ServerResult<Option<Download>> {
        let RemoteFile::Local(file) = file;

        match File::open(self.get_path(&file.name)).await {
            Ok(f) => Ok(Some(Box::new(f))),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(ServerError::storage_error(e)),
        }
    }
}
