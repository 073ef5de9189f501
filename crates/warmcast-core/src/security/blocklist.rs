use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{domain::SubjectId, ports::BlockListStore, store::ensure_parent, Result};

/// In-memory set of blocked subjects, optionally mirrored to a store.
///
/// Reads never wait on persistence: the set is updated first, then a snapshot
/// is written. Snapshot writes are serialized so an older one never lands last.
pub struct BlockedSubjects {
    set: RwLock<HashSet<SubjectId>>,
    store: Option<Arc<dyn BlockListStore>>,
    persist: Mutex<()>,
}

impl Default for BlockedSubjects {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl BlockedSubjects {
    pub fn in_memory() -> Self {
        Self {
            set: RwLock::new(HashSet::new()),
            store: None,
            persist: Mutex::new(()),
        }
    }

    /// Load the persisted set. A missing or unreadable store starts empty.
    pub async fn load(store: Arc<dyn BlockListStore>) -> Self {
        let initial = match store.load().await {
            Ok(ids) => ids.into_iter().collect(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to load block list, starting empty");
                HashSet::new()
            }
        };
        tracing::info!(blocked = initial.len(), "block list loaded");
        Self {
            set: RwLock::new(initial),
            store: Some(store),
            persist: Mutex::new(()),
        }
    }

    pub fn is_blocked(&self, subject: SubjectId) -> bool {
        self.set
            .read()
            .map(|s| s.contains(&subject))
            .unwrap_or_else(|poisoned| poisoned.into_inner().contains(&subject))
    }

    /// Returns `true` if the subject was not blocked before.
    pub async fn block(&self, subject: SubjectId, reason: &str) -> bool {
        let added = self.write().insert(subject);
        if added {
            tracing::warn!(subject = %subject, reason, "subject blocked");
            self.persist().await;
        }
        added
    }

    /// Returns `true` if the subject was blocked before.
    pub async fn unblock(&self, subject: SubjectId) -> bool {
        let removed = self.write().remove(&subject);
        if removed {
            tracing::info!(subject = %subject, "subject unblocked");
            self.persist().await;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted copy of the current set.
    pub fn snapshot(&self) -> Vec<SubjectId> {
        let mut ids: Vec<SubjectId> = self
            .set
            .read()
            .map(|s| s.iter().copied().collect())
            .unwrap_or_else(|poisoned| poisoned.into_inner().iter().copied().collect());
        ids.sort_unstable();
        ids
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashSet<SubjectId>> {
        self.set
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let _guard = self.persist.lock().await;
        let ids = self.snapshot();
        if let Err(e) = store.save(&ids).await {
            tracing::warn!(error = %e, "failed to persist block list");
        }
    }
}

/// Block list kept as one subject id per line.
#[derive(Clone, Debug)]
pub struct FileBlockList {
    path: PathBuf,
}

impl FileBlockList {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl BlockListStore for FileBlockList {
    async fn load(&self) -> Result<Vec<SubjectId>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(contents
            .lines()
            .filter_map(|line| line.trim().parse::<i64>().ok())
            .map(SubjectId)
            .collect())
    }

    async fn save(&self, subjects: &[SubjectId]) -> Result<()> {
        ensure_parent(&self.path).await?;
        let mut out = String::new();
        for s in subjects {
            out.push_str(&s.to_string());
            out.push('\n');
        }
        tokio::fs::write(&self.path, out).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn tmp_file(prefix: &str) -> PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or(Duration::from_secs(0))
            .as_nanos();
        let pid = std::process::id();
        PathBuf::from(format!("/tmp/{prefix}-{pid}-{ts}.txt"))
    }

    #[tokio::test]
    async fn block_and_unblock_report_changes() {
        let blocked = BlockedSubjects::in_memory();
        assert!(blocked.block(SubjectId(7), "spam").await);
        assert!(!blocked.block(SubjectId(7), "spam").await);
        assert!(blocked.is_blocked(SubjectId(7)));
        assert!(blocked.unblock(SubjectId(7)).await);
        assert!(!blocked.unblock(SubjectId(7)).await);
        assert!(blocked.is_empty());
    }

    #[tokio::test]
    async fn changes_survive_a_reload_from_file() {
        let path = tmp_file("warmcast-blocked");
        let store: Arc<dyn BlockListStore> = Arc::new(FileBlockList::new(&path));

        let blocked = BlockedSubjects::load(store.clone()).await;
        assert!(blocked.is_empty());
        blocked.block(SubjectId(3), "spam").await;
        blocked.block(SubjectId(1), "spam").await;
        blocked.unblock(SubjectId(3)).await;

        let reloaded = BlockedSubjects::load(store).await;
        assert_eq!(reloaded.snapshot(), vec![SubjectId(1)]);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn file_store_skips_garbage_lines() {
        let path = tmp_file("warmcast-blocked-garbage");
        std::fs::write(&path, "12\n\nnot-a-number\n  34 \n").unwrap();
        let ids = FileBlockList::new(&path).load().await.unwrap();
        assert_eq!(ids, vec![SubjectId(12), SubjectId(34)]);
        let _ = std::fs::remove_file(path);
    }
}
