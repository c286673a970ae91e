use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::{Partitions, Persistence, PersistentData};
use crate::error::PersistenceError;

/// Keeps persisted data in memory.
///
/// Useful in tests and for handing state between two application instances
/// in the same process. The content can be seeded from and exported to JSON.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    data: Mutex<PersistentData>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend pre-filled with `data`.
    pub fn with_data(data: PersistentData) -> Self {
        Self {
            data: Mutex::new(data),
        }
    }

    /// Creates a backend from a JSON document shaped like [`PersistentData`].
    pub fn from_json(value: Value) -> Result<Self, PersistenceError> {
        Ok(Self::with_data(serde_json::from_value(value)?))
    }

    /// Exports the stored data as JSON.
    pub fn to_json(&self) -> Result<Value, PersistenceError> {
        Ok(serde_json::to_value(&*self.data.lock())?)
    }

    /// Returns a copy of the stored data.
    pub fn data(&self) -> PersistentData {
        self.data.lock().clone()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn load(&self, partitions: Partitions) -> Result<PersistentData, PersistenceError> {
        Ok(self.data.lock().restrict(partitions))
    }

    async fn flush(
        &self,
        data: &PersistentData,
        partitions: Partitions,
    ) -> Result<(), PersistenceError> {
        self.data.lock().merge_from(data, partitions);
        Ok(())
    }
}
