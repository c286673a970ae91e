use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::debug;

use super::{Partitions, Persistence, PersistentData};
use crate::error::PersistenceError;

/// Stores persisted data as JSON files.
///
/// In single-file mode everything lives in `path`. Otherwise each partition
/// gets its own file next to it, named `{stem}_{partition}.json`:
///
/// ```text
/// data/courier_bot_data.json
/// data/courier_chat_data.json
/// data/courier_user_data.json
/// data/courier_conversations.json
/// data/courier_update_cursor.json
/// ```
///
/// Files are replaced atomically: data is written to a temporary file that
/// is then renamed over the target.
#[derive(Debug)]
pub struct JsonFilePersistence {
    path: PathBuf,
    single_file: bool,
    /// Serializes read-modify-write cycles on the single file.
    write_lock: Mutex<()>,
}

impl JsonFilePersistence {
    /// Stores everything in the single file `path`.
    pub fn single_file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            single_file: true,
            write_lock: Mutex::new(()),
        }
    }

    /// Stores each partition in its own file derived from `path`.
    pub fn per_partition(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            single_file: false,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn partition_path(&self, partition: &str) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "courier".to_string());
        self.path.with_file_name(format!("{stem}_{partition}.json"))
    }

    async fn load_single(&self, partitions: Partitions) -> Result<PersistentData, PersistenceError> {
        let data: PersistentData = read_json(&self.path).await?.unwrap_or_default();
        Ok(data.restrict(partitions))
    }

    async fn load_split(&self, partitions: Partitions) -> Result<PersistentData, PersistenceError> {
        let mut data = PersistentData::default();
        if partitions.bot_data {
            data.bot_data = self.read_partition("bot_data").await?;
        }
        if partitions.chat_data {
            data.chat_data = self.read_partition("chat_data").await?;
        }
        if partitions.user_data {
            data.user_data = self.read_partition("user_data").await?;
        }
        if partitions.conversations {
            data.conversations = self.read_partition("conversations").await?;
        }
        if partitions.update_cursor {
            data.update_cursor = self.read_partition("update_cursor").await?;
        }
        Ok(data)
    }

    async fn read_partition<T>(&self, partition: &str) -> Result<T, PersistenceError>
    where
        T: DeserializeOwned + Default,
    {
        Ok(read_json(&self.partition_path(partition))
            .await?
            .unwrap_or_default())
    }

    async fn write_partition<T: Serialize>(
        &self,
        partition: &str,
        value: &T,
    ) -> Result<(), PersistenceError> {
        write_json(&self.partition_path(partition), value).await
    }
}

#[async_trait]
impl Persistence for JsonFilePersistence {
    async fn load(&self, partitions: Partitions) -> Result<PersistentData, PersistenceError> {
        if self.single_file {
            self.load_single(partitions).await
        } else {
            self.load_split(partitions).await
        }
    }

    async fn flush(
        &self,
        data: &PersistentData,
        partitions: Partitions,
    ) -> Result<(), PersistenceError> {
        let _guard = self.write_lock.lock().await;

        if self.single_file {
            let mut stored: PersistentData = read_json(&self.path).await?.unwrap_or_default();
            stored.merge_from(data, partitions);
            write_json(&self.path, &stored).await?;
        } else {
            if partitions.bot_data {
                self.write_partition("bot_data", &data.bot_data).await?;
            }
            if partitions.chat_data {
                self.write_partition("chat_data", &data.chat_data).await?;
            }
            if partitions.user_data {
                self.write_partition("user_data", &data.user_data).await?;
            }
            if partitions.conversations {
                self.write_partition("conversations", &data.conversations)
                    .await?;
            }
            if partitions.update_cursor {
                self.write_partition("update_cursor", &data.update_cursor)
                    .await?;
            }
        }

        debug!(path = %self.path.display(), ?partitions, "Flushed persistent data");
        Ok(())
    }
}

/// Reads and decodes `path`. A missing file reads as `None`.
async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PersistenceError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(PersistenceError::io(path, err)),
    }
}

/// Encodes `value` and atomically replaces `path` with it.
async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistenceError> {
    let bytes = serde_json::to_vec_pretty(value)?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| PersistenceError::io(parent, e))?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, &bytes)
        .await
        .map_err(|e| PersistenceError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| PersistenceError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ConversationKey;
    use crate::outcome::State;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample() -> PersistentData {
        let mut data = PersistentData::default();
        data.bot_data.insert("greeting".into(), json!("hi"));
        data.chat_data
            .entry(-100)
            .or_default()
            .insert("members".into(), json!(3));
        data.user_data
            .entry(7)
            .or_default()
            .insert("name".into(), json!("Ann"));
        data.conversations
            .entry("signup".into())
            .or_default()
            .insert(ConversationKey::from_parts(&[-100, 7]), State::from("AGE"));
        data.update_cursor = Some(99);
        data
    }

    #[tokio::test]
    async fn test_single_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        let backend = JsonFilePersistence::single_file(&path);
        backend.flush(&sample(), Partitions::ALL).await.unwrap();
        assert!(path.exists());

        let reopened = JsonFilePersistence::single_file(&path);
        let loaded = reopened.load(Partitions::ALL).await.unwrap();
        assert_eq!(loaded, sample());
    }

    #[tokio::test]
    async fn test_per_partition_files() {
        let dir = TempDir::new().unwrap();
        let backend = JsonFilePersistence::per_partition(dir.path().join("nested/courier.json"));

        backend.flush(&sample(), Partitions::ALL).await.unwrap();
        assert!(dir.path().join("nested/courier_conversations.json").exists());
        assert!(dir.path().join("nested/courier_update_cursor.json").exists());

        let convs_only = Partitions {
            conversations: true,
            ..Partitions::NONE
        };
        let loaded = backend.load(convs_only).await.unwrap();
        assert_eq!(loaded.conversations, sample().conversations);
        assert!(loaded.bot_data.is_empty());
        assert_eq!(loaded.update_cursor, None);
    }

    #[tokio::test]
    async fn test_missing_files_load_empty() {
        let dir = TempDir::new().unwrap();
        let backend = JsonFilePersistence::single_file(dir.path().join("absent.json"));
        let loaded = backend.load(Partitions::ALL).await.unwrap();
        assert_eq!(loaded, PersistentData::default());
    }

    #[tokio::test]
    async fn test_partial_flush_keeps_other_partitions() {
        let dir = TempDir::new().unwrap();
        let backend = JsonFilePersistence::single_file(dir.path().join("state.json"));
        backend.flush(&sample(), Partitions::ALL).await.unwrap();

        let cursor_only = Partitions {
            update_cursor: true,
            ..Partitions::NONE
        };
        let newer = PersistentData {
            update_cursor: Some(120),
            ..PersistentData::default()
        };
        backend.flush(&newer, cursor_only).await.unwrap();

        let loaded = backend.load(Partitions::ALL).await.unwrap();
        assert_eq!(loaded.update_cursor, Some(120));
        assert_eq!(loaded.bot_data, sample().bot_data);
    }
}
