use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::SpoolError;

/// Persistent sink for accepted messages. The session engine holds a
/// `dyn Spool` so tests can observe writes without touching a filesystem.
#[async_trait]
pub trait Spool: Send + Sync {
    /// Durably persist one (message, recipient) pair, returning the
    /// written path so the caller can roll it back.
    async fn save(
        &self,
        id: &str,
        from: &str,
        to: &str,
        data: &[u8],
    ) -> Result<PathBuf, SpoolError>;

    /// Best-effort removal of a previously written file. A missing file is
    /// not an error: rollback may race with operator cleanup.
    async fn remove(&self, path: &Path) -> Result<(), SpoolError>;
}

/// Spool backed by a local directory tree:
/// `<base>/<UTC-YYYY-MM-DD>/<safe_id>_<recipient_hash>.eml`.
#[derive(Debug, Clone)]
pub struct FileSpool {
    base: PathBuf,
}

impl FileSpool {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }
}

#[async_trait]
impl Spool for FileSpool {
    async fn save(
        &self,
        id: &str,
        _from: &str,
        to: &str,
        data: &[u8],
    ) -> Result<PathBuf, SpoolError> {
        let safe_id = sanitize_component(id)?;
        let token = recipient_token(to);

        let dir = self.base.join(Utc::now().format("%Y-%m-%d").to_string());
        create_partition(&dir).await?;

        let path = dir.join(format!("{safe_id}_{token}.eml"));
        write_private(&path, data).await?;

        tracing::debug!(path = %path.display(), bytes = data.len(), "spooled message");
        Ok(path)
    }

    async fn remove(&self, path: &Path) -> Result<(), SpoolError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(not(unix))]
async fn create_partition(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await
}

#[cfg(not(unix))]
async fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    tokio::fs::write(path, data).await
}

#[cfg(unix)]
async fn create_partition(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    let dir = dir.to_path_buf();
    // DirBuilder has no async counterpart with mode support.
    tokio::task::spawn_blocking(move || {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&dir)
    })
    .await
    .map_err(|err| std::io::Error::other(err))?
}

#[cfg(unix)]
async fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;

    use tokio::io::AsyncWriteExt;

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .await?;
    file.write_all(data).await?;
    file.flush().await
}

fn sanitize_component(id: &str) -> Result<&str, SpoolError> {
    if id.contains(['/', '\\']) || id.contains("..") {
        return Err(SpoolError::InvalidId);
    }
    let id = id.trim();
    if id.is_empty() {
        return Err(SpoolError::InvalidId);
    }
    Ok(id)
}

/// First 8 bytes of SHA-256 over the lower-cased, trimmed recipient, hex
/// encoded. Keeps the address out of directory listings while staying
/// stable for a given recipient.
fn recipient_token(addr: &str) -> String {
    let digest = Sha256::digest(addr.trim().to_lowercase().as_bytes());
    hex::encode(&digest[..8])
}

/// In-memory spool recording every save, for session tests.
#[derive(Debug, Default)]
pub struct MemorySpool {
    saved: Mutex<Vec<(String, String, Vec<u8>)>>,
    fail_after: Mutex<Option<usize>>,
    removed: Mutex<Vec<PathBuf>>,
}

impl MemorySpool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `save` fail once `count` writes have succeeded.
    pub fn fail_after(&self, count: usize) {
        *self.fail_after.lock().unwrap() = Some(count);
    }

    pub fn saved(&self) -> Vec<(String, String, Vec<u8>)> {
        self.saved.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<PathBuf> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Spool for MemorySpool {
    async fn save(
        &self,
        id: &str,
        _from: &str,
        to: &str,
        data: &[u8],
    ) -> Result<PathBuf, SpoolError> {
        sanitize_component(id)?;
        let mut saved = self.saved.lock().unwrap();
        if let Some(limit) = *self.fail_after.lock().unwrap() {
            if saved.len() >= limit {
                return Err(SpoolError::Io(std::io::Error::other("spool full")));
            }
        }
        saved.push((id.to_string(), to.to_string(), data.to_vec()));
        Ok(PathBuf::from(format!("{id}_{}.eml", recipient_token(to))))
    }

    async fn remove(&self, path: &Path) -> Result<(), SpoolError> {
        self.removed.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }
}
