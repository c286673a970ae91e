//! Live in-memory application data.
//!
//! [`DataStore`] holds what handlers read and write while the application
//! runs: `bot_data`, per-chat and per-user maps, conversation states and the
//! update cursor. Persistence backends only see it through
//! [`DataStore::snapshot`] and [`DataStore::populate`], at checkpoints.
//!
//! Every mutation bumps a per-partition revision counter, so the application
//! can tell which partitions changed since the last successful flush.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::conversation::ConversationKey;
use crate::outcome::State;
use crate::persistence::{Partitions, PersistentData};

/// A JSON object of user data.
pub type DataMap = Map<String, Value>;

#[derive(Debug, Clone, Copy)]
enum Partition {
    Bot = 0,
    Chat = 1,
    User = 2,
    Conversations = 3,
    Cursor = 4,
}

/// Revision counters, one per partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Revisions([u64; 5]);

impl Revisions {
    /// Partitions whose revision differs from `older`.
    pub fn dirty_since(&self, older: &Revisions) -> Partitions {
        let changed = |p: Partition| self.0[p as usize] != older.0[p as usize];
        Partitions {
            bot_data: changed(Partition::Bot),
            chat_data: changed(Partition::Chat),
            user_data: changed(Partition::User),
            conversations: changed(Partition::Conversations),
            update_cursor: changed(Partition::Cursor),
        }
    }
}

type SharedMap = Arc<Mutex<DataMap>>;

/// A handle to one data map.
///
/// Handles are cheap to clone and stay valid while other chats and users
/// are being modified. Writes through a handle mark its partition dirty.
#[derive(Clone)]
pub struct DataHandle {
    map: SharedMap,
    revision: Arc<AtomicU64>,
}

impl DataHandle {
    fn new(map: SharedMap, revision: Arc<AtomicU64>) -> Self {
        Self { map, revision }
    }

    fn touch(&self) {
        self.revision.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns the value at `key` decoded as `T`.
    ///
    /// Returns `None` if the key is absent or does not decode.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.map.lock().get(key).cloned()?;
        serde_json::from_value(value).ok()
    }

    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.map.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.lock().contains_key(key)
    }

    /// Stores `value` at `key`.
    pub fn set<T: Serialize>(&self, key: impl Into<String>, value: T) -> serde_json::Result<()> {
        let value = serde_json::to_value(value)?;
        self.map.lock().insert(key.into(), value);
        self.touch();
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        let removed = self.map.lock().remove(key);
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    /// Runs `f` with exclusive access to the whole map.
    pub fn update<R>(&self, f: impl FnOnce(&mut DataMap) -> R) -> R {
        let result = f(&mut self.map.lock());
        self.touch();
        result
    }

    pub fn clear(&self) {
        self.map.lock().clear();
        self.touch();
    }

    /// Returns a copy of the map.
    pub fn snapshot(&self) -> DataMap {
        self.map.lock().clone()
    }
}

impl std::fmt::Debug for DataHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.map.lock().iter()).finish()
    }
}

/// The live data of one application.
#[derive(Debug, Default)]
pub struct DataStore {
    bot_data: SharedMap,
    chat_data: RwLock<HashMap<i64, SharedMap>>,
    user_data: RwLock<HashMap<i64, SharedMap>>,
    conversations: RwLock<BTreeMap<String, BTreeMap<ConversationKey, State>>>,
    cursor: Mutex<Option<i64>>,
    revisions: [Arc<AtomicU64>; 5],
}

impl DataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn revision(&self, partition: Partition) -> &Arc<AtomicU64> {
        &self.revisions[partition as usize]
    }

    fn touch(&self, partition: Partition) {
        self.revision(partition).fetch_add(1, Ordering::SeqCst);
    }

    /// Returns the current revision of every partition.
    pub fn revisions(&self) -> Revisions {
        Revisions(std::array::from_fn(|i| {
            self.revisions[i].load(Ordering::SeqCst)
        }))
    }

    // =========================================================================
    // User data
    // =========================================================================

    pub fn bot_data(&self) -> DataHandle {
        DataHandle::new(
            Arc::clone(&self.bot_data),
            Arc::clone(self.revision(Partition::Bot)),
        )
    }

    /// Returns the data of `chat_id`, creating an empty map on first use.
    pub fn chat_data(&self, chat_id: i64) -> DataHandle {
        let map = get_or_create(&self.chat_data, chat_id);
        DataHandle::new(map, Arc::clone(self.revision(Partition::Chat)))
    }

    /// Returns the data of `user_id`, creating an empty map on first use.
    pub fn user_data(&self, user_id: i64) -> DataHandle {
        let map = get_or_create(&self.user_data, user_id);
        DataHandle::new(map, Arc::clone(self.revision(Partition::User)))
    }

    /// Forgets everything stored for `chat_id`.
    pub fn drop_chat_data(&self, chat_id: i64) -> bool {
        let removed = self.chat_data.write().remove(&chat_id).is_some();
        if removed {
            self.touch(Partition::Chat);
        }
        removed
    }

    /// Forgets everything stored for `user_id`.
    pub fn drop_user_data(&self, user_id: i64) -> bool {
        let removed = self.user_data.write().remove(&user_id).is_some();
        if removed {
            self.touch(Partition::User);
        }
        removed
    }

    /// Moves the data of a group that was upgraded to a supergroup.
    ///
    /// Existing keys of `new_chat_id` win over the migrated ones.
    pub fn migrate_chat_data(&self, old_chat_id: i64, new_chat_id: i64) {
        let mut chats = self.chat_data.write();
        let Some(old) = chats.remove(&old_chat_id) else {
            return;
        };
        let old = std::mem::take(&mut *old.lock());
        let target = chats
            .entry(new_chat_id)
            .or_insert_with(|| Arc::new(Mutex::new(DataMap::new())));
        let mut target = target.lock();
        for (key, value) in old {
            target.entry(key).or_insert(value);
        }
        drop(target);
        drop(chats);
        self.touch(Partition::Chat);
    }

    // =========================================================================
    // Conversations
    // =========================================================================

    /// Records the state of a named conversation. `None` removes the record.
    pub fn set_conversation(&self, name: &str, key: &ConversationKey, state: Option<&State>) {
        let mut conversations = self.conversations.write();
        match state {
            Some(state) => {
                conversations
                    .entry(name.to_string())
                    .or_default()
                    .insert(key.clone(), state.clone());
            }
            None => {
                let Some(states) = conversations.get_mut(name) else {
                    return;
                };
                if states.remove(key).is_none() {
                    return;
                }
                if states.is_empty() {
                    conversations.remove(name);
                }
            }
        }
        drop(conversations);
        self.touch(Partition::Conversations);
    }

    /// Returns the recorded states of a named conversation.
    pub fn conversations(&self, name: &str) -> BTreeMap<ConversationKey, State> {
        self.conversations
            .read()
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    // =========================================================================
    // Cursor
    // =========================================================================

    /// Records the last acknowledged `update_id`.
    pub fn set_cursor(&self, cursor: i64) {
        let mut current = self.cursor.lock();
        if *current != Some(cursor) {
            *current = Some(cursor);
            drop(current);
            self.touch(Partition::Cursor);
        }
    }

    pub fn cursor(&self) -> Option<i64> {
        *self.cursor.lock()
    }

    // =========================================================================
    // Checkpoints
    // =========================================================================

    /// Copies the listed partitions out of the store.
    pub fn snapshot(&self, partitions: Partitions) -> PersistentData {
        let mut data = PersistentData::default();
        if partitions.bot_data {
            data.bot_data = self.bot_data.lock().clone();
        }
        if partitions.chat_data {
            data.chat_data = snapshot_maps(&self.chat_data);
        }
        if partitions.user_data {
            data.user_data = snapshot_maps(&self.user_data);
        }
        if partitions.conversations {
            data.conversations = self.conversations.read().clone();
        }
        if partitions.update_cursor {
            data.update_cursor = self.cursor();
        }
        data
    }

    /// Replaces the listed partitions with `data`.
    ///
    /// Loading does not mark anything dirty.
    pub fn populate(&self, data: PersistentData, partitions: Partitions) {
        if partitions.bot_data {
            *self.bot_data.lock() = data.bot_data;
        }
        if partitions.chat_data {
            *self.chat_data.write() = wrap_maps(data.chat_data);
        }
        if partitions.user_data {
            *self.user_data.write() = wrap_maps(data.user_data);
        }
        if partitions.conversations {
            *self.conversations.write() = data.conversations;
        }
        if partitions.update_cursor {
            *self.cursor.lock() = data.update_cursor;
        }
    }
}

fn get_or_create(maps: &RwLock<HashMap<i64, SharedMap>>, id: i64) -> SharedMap {
    if let Some(map) = maps.read().get(&id) {
        return Arc::clone(map);
    }
    Arc::clone(maps.write().entry(id).or_default())
}

fn snapshot_maps(maps: &RwLock<HashMap<i64, SharedMap>>) -> BTreeMap<i64, DataMap> {
    maps.read()
        .iter()
        .map(|(id, map)| (*id, map.lock().clone()))
        .filter(|(_, map)| !map.is_empty())
        .collect()
}

fn wrap_maps(maps: BTreeMap<i64, DataMap>) -> HashMap<i64, SharedMap> {
    maps.into_iter()
        .map(|(id, map)| (id, Arc::new(Mutex::new(map))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_handles_share_state() {
        let store = DataStore::new();
        store.chat_data(1).set("count", 3).unwrap();
        assert_eq!(store.chat_data(1).get::<i32>("count"), Some(3));
        assert_eq!(store.chat_data(2).get::<i32>("count"), None);

        let handle = store.user_data(9);
        handle.update(|map| map.insert("name".into(), json!("Ann")));
        assert_eq!(store.user_data(9).get::<String>("name").as_deref(), Some("Ann"));
    }

    #[test]
    fn test_revisions_track_partitions() {
        let store = DataStore::new();
        let before = store.revisions();

        store.bot_data().set("x", 1).unwrap();
        store.set_conversation("conv", &ConversationKey::from_parts(&[1]), Some(&State::from("A")));

        let dirty = store.revisions().dirty_since(&before);
        assert!(dirty.bot_data);
        assert!(dirty.conversations);
        assert!(!dirty.chat_data);
        assert!(!dirty.user_data);
        assert!(!dirty.update_cursor);
    }

    #[test]
    fn test_migrate_chat_data() {
        let store = DataStore::new();
        store.chat_data(-1).set("a", 1).unwrap();
        store.chat_data(-1).set("b", 1).unwrap();
        store.chat_data(-100).set("b", 2).unwrap();

        store.migrate_chat_data(-1, -100);

        let new = store.chat_data(-100);
        assert_eq!(new.get::<i32>("a"), Some(1));
        assert_eq!(new.get::<i32>("b"), Some(2));
        assert!(!store.snapshot(Partitions::ALL).chat_data.contains_key(&-1));
    }

    #[test]
    fn test_snapshot_and_populate() {
        let store = DataStore::new();
        store.chat_data(5).set("k", "v").unwrap();
        store.user_data(6).set("k", true).unwrap();
        store.set_cursor(41);

        let data = store.snapshot(Partitions::ALL);
        assert_eq!(data.update_cursor, Some(41));

        let restored = DataStore::new();
        let before = restored.revisions();
        restored.populate(data.clone(), Partitions::ALL);
        assert_eq!(restored.snapshot(Partitions::ALL), data);
        assert_eq!(restored.revisions(), before);
    }

    #[test]
    fn test_drop_and_clear_conversation() {
        let store = DataStore::new();
        let key = ConversationKey::from_parts(&[1, 2]);
        store.set_conversation("c", &key, Some(&State::from("A")));
        store.set_conversation("c", &key, None);
        assert!(store.conversations("c").is_empty());

        store.chat_data(3).set("k", 1).unwrap();
        assert!(store.drop_chat_data(3));
        assert!(!store.drop_chat_data(3));
    }
}
