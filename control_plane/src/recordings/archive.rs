//! Archive stores hold copies of recordings after they leave the target.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use parking_lot::Mutex;
use rule_engine::TargetId;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt};

/// One archived copy of a recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedRecording {
    pub target: TargetId,
    pub name: String,
    pub size: u64,
    pub archived_at: DateTime<Utc>,
}

/// Storage for archived recordings, addressed by (target id, name).
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Copies the stream into the store under `name`.
    async fn store(
        &self,
        target: &TargetId,
        name: &str,
        stream: &mut (dyn AsyncRead + Send + Unpin),
    ) -> io::Result<ArchivedRecording>;

    /// Removes the copy stored under (target, name). Returns false if there
    /// was none.
    async fn delete(&self, target: &TargetId, name: &str) -> io::Result<bool>;

    /// All copies for a target, oldest first.
    async fn list_archived(&self, target: &TargetId) -> io::Result<Vec<ArchivedRecording>>;
}

fn oldest_first(archives: &mut [ArchivedRecording]) {
    archives.sort_by(|a, b| {
        a.archived_at
            .cmp(&b.archived_at)
            .then_with(|| a.name.cmp(&b.name))
    });
}

// ================================================================================================
// FILESYSTEM STORE
// ================================================================================================

/// Suffix of files still being written. They are never listed.
const PARTIAL_SUFFIX: &str = ".part";

/// Stores archives as files under `<root>/<hex(target id)>/<name>`.
///
/// Content is written to `<name>.part` and renamed once complete, so a
/// failed copy never shows up as an archive.
#[derive(Debug, Clone)]
pub struct FsArchiveStore {
    root: PathBuf,
}

impl FsArchiveStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn target_dir(&self, target: &TargetId) -> PathBuf {
        // Hex keeps arbitrary connect URLs filesystem safe and collision free.
        let encoded: String = target
            .as_str()
            .bytes()
            .map(|b| format!("{:02x}", b))
            .collect();
        self.root.join(encoded)
    }

    fn file_path(&self, target: &TargetId, name: &str) -> io::Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid archive name \"{}\"", name),
            ));
        }
        Ok(self.target_dir(target).join(name))
    }
}

#[async_trait]
impl ArchiveStore for FsArchiveStore {
    async fn store(
        &self,
        target: &TargetId,
        name: &str,
        stream: &mut (dyn AsyncRead + Send + Unpin),
    ) -> io::Result<ArchivedRecording> {
        let path = self.file_path(target, name)?;
        let partial = self.file_path(target, &format!("{}{}", name, PARTIAL_SUFFIX))?;
        tokio::fs::create_dir_all(self.target_dir(target)).await?;

        let written = async {
            let mut file = tokio::fs::File::create(&partial).await?;
            let size = tokio::io::copy(stream, &mut file).await?;
            file.sync_all().await?;
            tokio::fs::rename(&partial, &path).await?;
            Ok::<_, io::Error>(size)
        }
        .await;
        let size = match written {
            Ok(size) => size,
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                    if cleanup.kind() != io::ErrorKind::NotFound {
                        warn!("Failed to remove partial archive {}: {}", partial.display(), cleanup);
                    }
                }
                return Err(e);
            }
        };
        debug!("Archived {} bytes to {}", size, path.display());

        Ok(ArchivedRecording {
            target: target.clone(),
            name: name.to_string(),
            size,
            archived_at: Utc::now(),
        })
    }

    async fn delete(&self, target: &TargetId, name: &str) -> io::Result<bool> {
        let path = self.file_path(target, name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list_archived(&self, target: &TargetId) -> io::Result<Vec<ArchivedRecording>> {
        let mut entries = match tokio::fs::read_dir(self.target_dir(target)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut archives = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !metadata.is_file() || name.ends_with(PARTIAL_SUFFIX) {
                continue;
            }
            let archived_at = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            archives.push(ArchivedRecording {
                target: target.clone(),
                name,
                size: metadata.len(),
                archived_at,
            });
        }
        oldest_first(&mut archives);
        Ok(archives)
    }
}

// ================================================================================================
// IN-MEMORY STORE
// ================================================================================================

/// Keeps archives in memory and records every delete request.
#[derive(Debug, Default)]
pub struct MemoryArchiveStore {
    archives: Mutex<BTreeMap<(TargetId, String), (ArchivedRecording, Vec<u8>)>>,
    deletions: Mutex<Vec<(TargetId, String)>>,
}

impl MemoryArchiveStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Content of an archive, if present.
    pub fn content(&self, target: &TargetId, name: &str) -> Option<Vec<u8>> {
        self.archives
            .lock()
            .get(&(target.clone(), name.to_string()))
            .map(|(_, bytes)| bytes.clone())
    }

    /// Every (target, name) passed to `delete`, in call order.
    pub fn deletions(&self) -> Vec<(TargetId, String)> {
        self.deletions.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.archives.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ArchiveStore for MemoryArchiveStore {
    async fn store(
        &self,
        target: &TargetId,
        name: &str,
        stream: &mut (dyn AsyncRead + Send + Unpin),
    ) -> io::Result<ArchivedRecording> {
        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes).await?;
        let archived = ArchivedRecording {
            target: target.clone(),
            name: name.to_string(),
            size: bytes.len() as u64,
            archived_at: Utc::now(),
        };
        self.archives.lock().insert(
            (target.clone(), name.to_string()),
            (archived.clone(), bytes),
        );
        Ok(archived)
    }

    async fn delete(&self, target: &TargetId, name: &str) -> io::Result<bool> {
        self.deletions
            .lock()
            .push((target.clone(), name.to_string()));
        Ok(self
            .archives
            .lock()
            .remove(&(target.clone(), name.to_string()))
            .is_some())
    }

    async fn list_archived(&self, target: &TargetId) -> io::Result<Vec<ArchivedRecording>> {
        let mut archives: Vec<ArchivedRecording> = self
            .archives
            .lock()
            .iter()
            .filter(|((t, _), _)| t == target)
            .map(|(_, (archived, _))| archived.clone())
            .collect();
        oldest_first(&mut archives);
        Ok(archives)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fs_store_roundtrip_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArchiveStore::new(dir.path());
        let target = TargetId::new("service:jmx:rmi:///jndi/rmi://foo:9091/jmxrmi");

        let mut data: &[u8] = b"recording-bytes";
        let archived = store.store(&target, "foo_rec_1.jfr", &mut data).await.unwrap();
        assert_eq!(archived.size, 15);

        let listed = store.list_archived(&target).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "foo_rec_1.jfr");

        assert!(store.delete(&target, "foo_rec_1.jfr").await.unwrap());
        assert!(!store.delete(&target, "foo_rec_1.jfr").await.unwrap());
        assert!(store.list_archived(&target).await.unwrap().is_empty());
    }

    struct BrokenPipe;

    impl AsyncRead for BrokenPipe {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")))
        }
    }

    #[tokio::test]
    async fn test_fs_store_leaves_nothing_after_failed_copy() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArchiveStore::new(dir.path());
        let target = TargetId::new("t");

        let mut stream = (&b"partial"[..]).chain(BrokenPipe);
        assert!(store.store(&target, "a_r_1.jfr", &mut stream).await.is_err());
        assert!(store.list_archived(&target).await.unwrap().is_empty());

        let leftovers = std::fs::read_dir(store.target_dir(&target)).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_fs_store_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArchiveStore::new(dir.path());
        let mut data: &[u8] = b"x";
        assert!(store
            .store(&TargetId::new("t"), "../escape", &mut data)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_memory_store_records_deletions() {
        let store = MemoryArchiveStore::new();
        let target = TargetId::new("t");
        let mut data: &[u8] = b"abc";
        store.store(&target, "a.jfr", &mut data).await.unwrap();
        assert_eq!(store.content(&target, "a.jfr").unwrap(), b"abc");

        store.delete(&target, "missing").await.unwrap();
        assert_eq!(store.deletions(), vec![(target.clone(), "missing".to_string())]);
        assert_eq!(store.len(), 1);
    }
}
