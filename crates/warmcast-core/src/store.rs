//! Stock collaborator implementations: in-memory and plain text files.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::io::AsyncWriteExt;

use crate::{
    config::StorageConfig,
    delivery::DeliveryRecord,
    domain::RecipientId,
    ports::{DeliveryLogSink, PayloadSource, RecipientRegistry, RecipientSource},
    Result,
};

#[derive(Debug, Default)]
struct MemoryState {
    recipients: Vec<RecipientId>,
    phrases: Vec<String>,
    inactive: HashSet<RecipientId>,
    records: Vec<DeliveryRecord>,
}

/// Everything in one process-local struct. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new(recipients: Vec<RecipientId>, phrases: Vec<String>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                recipients,
                phrases,
                ..MemoryState::default()
            }),
        }
    }

    pub fn set_recipients(&self, recipients: Vec<RecipientId>) {
        self.lock().recipients = recipients;
    }

    pub fn set_phrases(&self, phrases: Vec<String>) {
        self.lock().phrases = phrases;
    }

    pub fn is_inactive(&self, recipient: RecipientId) -> bool {
        self.lock().inactive.contains(&recipient)
    }

    pub fn delivery_records(&self) -> Vec<DeliveryRecord> {
        self.lock().records.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl RecipientSource for MemoryStore {
    async fn fetch_recipients(&self) -> Result<Vec<RecipientId>> {
        let st = self.lock();
        Ok(st
            .recipients
            .iter()
            .copied()
            .filter(|r| !st.inactive.contains(r))
            .collect())
    }
}

#[async_trait]
impl PayloadSource for MemoryStore {
    async fn fetch_payload(&self) -> Result<Option<String>> {
        let st = self.lock();
        Ok(st.phrases.choose(&mut rand::thread_rng()).cloned())
    }
}

#[async_trait]
impl RecipientRegistry for MemoryStore {
    async fn mark_inactive(&self, recipient: RecipientId) -> Result<()> {
        self.lock().inactive.insert(recipient);
        Ok(())
    }
}

#[async_trait]
impl DeliveryLogSink for MemoryStore {
    async fn write(&self, record: DeliveryRecord) -> Result<()> {
        self.lock().records.push(record);
        Ok(())
    }
}

/// Text-file backed recipients, phrases and inactive list.
///
/// - recipients: one numeric id per line, `#` starts a comment
/// - phrases: one broadcast text per non-empty line
/// - inactive: ids appended as they turn unreachable, excluded on the next fetch
#[derive(Clone, Debug)]
pub struct FileStore {
    recipients_file: PathBuf,
    phrases_file: PathBuf,
    inactive_file: PathBuf,
}

impl FileStore {
    pub fn new(storage: &StorageConfig) -> Self {
        Self {
            recipients_file: storage.recipients_file.clone(),
            phrases_file: storage.phrases_file.clone(),
            inactive_file: storage.inactive_file.clone(),
        }
    }

    async fn inactive(&self) -> Result<HashSet<RecipientId>> {
        Ok(parse_ids(&read_optional(&self.inactive_file).await?)
            .into_iter()
            .collect())
    }
}

#[async_trait]
impl RecipientSource for FileStore {
    async fn fetch_recipients(&self) -> Result<Vec<RecipientId>> {
        let inactive = self.inactive().await?;
        let mut seen = HashSet::new();
        Ok(parse_ids(&read_optional(&self.recipients_file).await?)
            .into_iter()
            .filter(|r| !inactive.contains(r) && seen.insert(*r))
            .collect())
    }
}

#[async_trait]
impl PayloadSource for FileStore {
    async fn fetch_payload(&self) -> Result<Option<String>> {
        let contents = read_optional(&self.phrases_file).await?;
        let phrases: Vec<&str> = contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        Ok(phrases
            .choose(&mut rand::thread_rng())
            .map(|s| s.to_string()))
    }
}

#[async_trait]
impl RecipientRegistry for FileStore {
    async fn mark_inactive(&self, recipient: RecipientId) -> Result<()> {
        ensure_parent(&self.inactive_file).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inactive_file)
            .await?;
        file.write_all(format!("{recipient}\n").as_bytes()).await?;
        tracing::info!(recipient = %recipient, "recipient marked inactive");
        Ok(())
    }
}

async fn read_optional(path: &Path) -> Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(s) => Ok(s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

pub(crate) async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir).await?;
    }
    Ok(())
}

fn parse_ids(contents: &str) -> Vec<RecipientId> {
    contents
        .lines()
        .map(|l| l.split('#').next().unwrap_or("").trim())
        .filter_map(|l| l.parse::<i64>().ok())
        .map(RecipientId)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn tmp_dir(prefix: &str) -> PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or(Duration::from_secs(0))
            .as_nanos();
        let pid = std::process::id();
        PathBuf::from(format!("/tmp/{prefix}-{pid}-{ts}"))
    }

    #[tokio::test]
    async fn memory_store_skips_inactive_recipients() {
        let store = MemoryStore::new(
            vec![RecipientId(1), RecipientId(2)],
            vec!["hello".to_string()],
        );
        store.mark_inactive(RecipientId(1)).await.unwrap();
        assert_eq!(store.fetch_recipients().await.unwrap(), vec![RecipientId(2)]);
        assert_eq!(store.fetch_payload().await.unwrap().as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn memory_store_without_phrases_has_no_payload() {
        let store = MemoryStore::default();
        assert_eq!(store.fetch_payload().await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_store_reads_ids_and_excludes_inactive() {
        let dir = tmp_dir("warmcast-store");
        std::fs::create_dir_all(&dir).unwrap();
        let storage = StorageConfig::in_dir(&dir);
        std::fs::write(&storage.recipients_file, "10\n# comment\n20 # vip\n10\nabc\n30\n").unwrap();
        std::fs::write(&storage.phrases_file, "\n  warm wishes  \n\n").unwrap();

        let store = FileStore::new(&storage);
        assert_eq!(
            store.fetch_recipients().await.unwrap(),
            vec![RecipientId(10), RecipientId(20), RecipientId(30)]
        );
        assert_eq!(
            store.fetch_payload().await.unwrap().as_deref(),
            Some("warm wishes")
        );

        store.mark_inactive(RecipientId(20)).await.unwrap();
        assert_eq!(
            store.fetch_recipients().await.unwrap(),
            vec![RecipientId(10), RecipientId(30)]
        );
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn missing_files_mean_empty_sets() {
        let storage = StorageConfig::in_dir(tmp_dir("warmcast-store-missing"));
        let store = FileStore::new(&storage);
        assert!(store.fetch_recipients().await.unwrap().is_empty());
        assert_eq!(store.fetch_payload().await.unwrap(), None);
    }
}
