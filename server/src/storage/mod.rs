//! Export artifact storage.

mod local;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::error::ServerResult;

pub use self::local::{LocalBackend, LocalRemoteFile, LocalStorageConfig};

/// Reference to a location where an export artifact is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteFile {
    /// File in local storage.
    Local(LocalRemoteFile),
}

/// A stream of a stored file.
pub type Download = Box<dyn AsyncRead + Unpin + Send>;

/// A storage backend.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// Uploads a file.
    async fn upload_file(
        &self,
        name: String,
        stream: &mut (dyn AsyncRead + Unpin + Send),
    ) -> ServerResult<RemoteFile>;

    /// Deletes a file using a database reference.
    ///
    /// Deleting a file that no longer exists is not an error.
    async fn delete_file_db(&self, file: &RemoteFile) -> ServerResult<()>;

    /// Downloads a file using a database reference.
    ///
    /// Returns `None` if the file no longer exists.
    async fn download_file_db(&self, file: &RemoteFile) -> ServerResult<Option<Download>>;
}

impl RemoteFile {
    /// Returns the remote file ID.
    pub fn remote_file_id(&self) -> String {
        match self {
            Self::Local(f) => format!("local:{}", f.name),
        }
    }
}
