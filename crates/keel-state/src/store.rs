//! StateStore — redb-backed state persistence for Keel.
//!
//! Provides typed operations over the desired spec, the framework identity,
//! and executor slots. All values are JSON-serialized into redb's `&[u8]`
//! value columns. The store supports both on-disk and in-memory backends
//! (the latter for testing).

use std::path::Path;
use std::sync::Arc;
#[cfg(feature = "fault-injection")]
use std::sync::atomic::{AtomicBool, Ordering};

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Everything read back from the store at startup.
#[derive(Debug, Clone, Default)]
pub struct PersistedState {
    pub desired: Option<DesiredSpec>,
    pub framework: Option<FrameworkIdentity>,
    /// Slots in slot-id order.
    pub slots: Vec<ExecutorSlot>,
    /// Highest generation any removed slot reached.
    pub generation_floor: Generation,
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    /// When set, every write transaction fails. Shared by all clones.
    #[cfg(feature = "fault-injection")]
    write_fault: Arc<AtomicBool>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> Self {
        Self {
            db: Arc::new(db),
            #[cfg(feature = "fault-injection")]
            write_fault: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make every subsequent write fail (or succeed again) on this store and
    /// all of its clones.
    #[cfg(feature = "fault-injection")]
    pub fn set_write_fault(&self, failing: bool) {
        self.write_fault.store(failing, Ordering::SeqCst);
    }

    #[cfg(feature = "fault-injection")]
    fn check_write_fault(&self) -> StateResult<()> {
        if self.write_fault.load(Ordering::SeqCst) {
            return Err(StateError::Transaction("injected write fault".to_string()));
        }
        Ok(())
    }

    #[cfg(not(feature = "fault-injection"))]
    fn check_write_fault(&self) -> StateResult<()> {
        Ok(())
    }

    fn begin_write(&self) -> StateResult<WriteTransaction> {
        self.check_write_fault()?;
        self.db.begin_write().map_err(map_err!(Transaction))
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.begin_write()?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.open_table(SLOTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Commit a heartbeat record to check the store still accepts writes.
    pub fn ping(&self) -> StateResult<()> {
        self.put_meta(HEARTBEAT_KEY, &epoch_millis())
    }

    /// Read the desired spec, framework identity, and every slot.
    pub fn load(&self) -> StateResult<PersistedState> {
        let state = PersistedState {
            desired: self.get_desired()?,
            framework: self.get_framework()?,
            slots: self.list_slots()?,
            generation_floor: self.get_generation_floor()?,
        };
        debug!(
            slots = state.slots.len(),
            has_desired = state.desired.is_some(),
            "state loaded"
        );
        Ok(state)
    }

    // ── Meta records ───────────────────────────────────────────────

    /// Insert or replace the desired spec.
    pub fn put_desired(&self, spec: &DesiredSpec) -> StateResult<()> {
        self.put_meta(DESIRED_KEY, spec)?;
        debug!(count = spec.count, "desired spec stored");
        Ok(())
    }

    /// Get the desired spec, if one was ever stored.
    pub fn get_desired(&self) -> StateResult<Option<DesiredSpec>> {
        self.get_meta(DESIRED_KEY)
    }

    /// Insert or replace the framework identity.
    pub fn put_framework(&self, identity: &FrameworkIdentity) -> StateResult<()> {
        self.put_meta(FRAMEWORK_KEY, identity)?;
        debug!(framework_id = %identity.framework_id, "framework identity stored");
        Ok(())
    }

    /// Get the framework identity, if one was ever stored.
    pub fn get_framework(&self) -> StateResult<Option<FrameworkIdentity>> {
        self.get_meta(FRAMEWORK_KEY)
    }

    /// Record the highest generation a removed slot reached.
    pub fn put_generation_floor(&self, floor: Generation) -> StateResult<()> {
        self.put_meta(GENERATION_FLOOR_KEY, &floor)?;
        debug!(floor, "generation floor stored");
        Ok(())
    }

    /// Highest generation of any removed slot; 0 when none was ever removed.
    pub fn get_generation_floor(&self) -> StateResult<Generation> {
        Ok(self.get_meta(GENERATION_FLOOR_KEY)?.unwrap_or(0))
    }

    fn put_meta<T: Serialize>(&self, key: &str, value: &T) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.begin_write()?;
        {
            let mut table = txn.open_table(META).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_meta<T: DeserializeOwned>(&self, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(META).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    // ── Slots ──────────────────────────────────────────────────────

    /// Insert or update a slot record.
    pub fn put_slot(&self, slot: &ExecutorSlot) -> StateResult<()> {
        let key = slot.table_key();
        let value = serde_json::to_vec(slot).map_err(map_err!(Serialize))?;
        let txn = self.begin_write()?;
        {
            let mut table = txn.open_table(SLOTS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Insert several slot records in one transaction.
    pub fn put_slots(&self, slots: &[ExecutorSlot]) -> StateResult<()> {
        let txn = self.begin_write()?;
        {
            let mut table = txn.open_table(SLOTS).map_err(map_err!(Table))?;
            for slot in slots {
                let value = serde_json::to_vec(slot).map_err(map_err!(Serialize))?;
                table
                    .insert(slot.table_key().as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a slot by id.
    pub fn get_slot(&self, slot_id: SlotId) -> StateResult<Option<ExecutorSlot>> {
        let key = slot_key(slot_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SLOTS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let slot: ExecutorSlot =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(slot))
            }
            None => Ok(None),
        }
    }

    /// List all slots in slot-id order.
    pub fn list_slots(&self) -> StateResult<Vec<ExecutorSlot>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SLOTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let slot: ExecutorSlot =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(slot);
        }
        Ok(results)
    }

    /// Delete several slots in one transaction. Returns the number removed.
    pub fn delete_slots(&self, slot_ids: &[SlotId]) -> StateResult<u32> {
        let txn = self.begin_write()?;
        let mut count = 0;
        {
            let mut table = txn.open_table(SLOTS).map_err(map_err!(Table))?;
            for id in slot_ids {
                let key = slot_key(*id);
                if table.remove(key.as_str()).map_err(map_err!(Write))?.is_some() {
                    count += 1;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count, "slots deleted");
        Ok(count)
    }
}
