//! Persistence contract and backends.
//!
//! A [`Persistence`] backend loads a [`PersistentData`] bundle at startup and
//! receives snapshots of the live [`DataStore`](crate::DataStore) at
//! checkpoints. Each partition can be loaded and flushed on its own; a
//! backend only touches the partitions it is asked about.
//!
//! Backends:
//!
//! | Type | Storage |
//! |------|---------|
//! | [`MemoryPersistence`] | In memory, can be seeded from and exported to JSON |
//! | [`JsonFilePersistence`] | One JSON file, or one file per partition |

mod json_file;
mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::conversation::ConversationKey;
use crate::error::PersistenceError;
use crate::outcome::State;
use crate::store::DataMap;

pub use json_file::JsonFilePersistence;
pub use memory::MemoryPersistence;

/// Selects the partitions of [`PersistentData`] an operation covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Partitions {
    pub bot_data: bool,
    pub chat_data: bool,
    pub user_data: bool,
    pub conversations: bool,
    pub update_cursor: bool,
}

impl Default for Partitions {
    fn default() -> Self {
        Self::ALL
    }
}

impl Partitions {
    pub const ALL: Partitions = Partitions {
        bot_data: true,
        chat_data: true,
        user_data: true,
        conversations: true,
        update_cursor: true,
    };

    pub const NONE: Partitions = Partitions {
        bot_data: false,
        chat_data: false,
        user_data: false,
        conversations: false,
        update_cursor: false,
    };

    /// Partitions selected in both `self` and `other`.
    pub fn intersect(self, other: Partitions) -> Partitions {
        Partitions {
            bot_data: self.bot_data && other.bot_data,
            chat_data: self.chat_data && other.chat_data,
            user_data: self.user_data && other.user_data,
            conversations: self.conversations && other.conversations,
            update_cursor: self.update_cursor && other.update_cursor,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::NONE
    }
}

/// Everything an application persists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentData {
    pub bot_data: DataMap,
    pub chat_data: BTreeMap<i64, DataMap>,
    pub user_data: BTreeMap<i64, DataMap>,
    /// Conversation name, then key, then state.
    pub conversations: BTreeMap<String, BTreeMap<ConversationKey, State>>,
    /// Last acknowledged `update_id`.
    pub update_cursor: Option<i64>,
}

impl PersistentData {
    /// Returns a copy holding only the listed partitions.
    pub fn restrict(&self, partitions: Partitions) -> PersistentData {
        let mut out = PersistentData::default();
        out.merge_from(self, partitions);
        out
    }

    /// Overwrites the listed partitions with those of `other`.
    pub fn merge_from(&mut self, other: &PersistentData, partitions: Partitions) {
        if partitions.bot_data {
            self.bot_data = other.bot_data.clone();
        }
        if partitions.chat_data {
            self.chat_data = other.chat_data.clone();
        }
        if partitions.user_data {
            self.user_data = other.user_data.clone();
        }
        if partitions.conversations {
            self.conversations = other.conversations.clone();
        }
        if partitions.update_cursor {
            self.update_cursor = other.update_cursor;
        }
    }
}

/// A storage backend for [`PersistentData`].
#[async_trait]
pub trait Persistence: Send + Sync + 'static {
    /// Reads the listed partitions. Missing data loads as empty.
    async fn load(&self, partitions: Partitions) -> Result<PersistentData, PersistenceError>;

    /// Writes the listed partitions of `data`, leaving others untouched.
    async fn flush(
        &self,
        data: &PersistentData,
        partitions: Partitions,
    ) -> Result<(), PersistenceError>;
}
