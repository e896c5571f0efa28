//! Storage seam for decoded events and ingestion cursors.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::Result;

/// One row ready for insertion. `(tx_hash, log_index)` is the dedup key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestedEvent {
    pub contract_name: String,
    /// Checksummed (EIP-55) address.
    pub contract_address: String,
    pub event_name: String,
    /// `0x`-prefixed lowercase hex.
    pub tx_hash: String,
    pub block_number: u64,
    pub log_index: u64,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredEvent {
    #[serde(flatten)]
    pub event: IngestedEvent,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The dedup key already existed; nothing was written.
    Duplicate,
    /// The row was rejected. The rest of the range is unaffected.
    Failed(String),
}

/// Named high-water mark committed together with a range's inserts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorUpdate {
    pub name: String,
    pub block_number: u64,
}

impl CursorUpdate {
    pub fn new(name: impl Into<String>, block_number: u64) -> Self {
        Self {
            name: name.into(),
            block_number,
        }
    }
}

/// Per-range counters, logged once the range is committed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RangeReport {
    pub fetched: usize,
    pub decoded: usize,
    pub unbound: usize,
    pub undecodable: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub failed: usize,
}

impl RangeReport {
    pub fn tally(&mut self, outcomes: &[InsertOutcome]) {
        for outcome in outcomes {
            match outcome {
                InsertOutcome::Inserted => self.inserted += 1,
                InsertOutcome::Duplicate => self.duplicates += 1,
                InsertOutcome::Failed(_) => self.failed += 1,
            }
        }
    }

    pub fn absorb(&mut self, other: &RangeReport) {
        self.fetched += other.fetched;
        self.decoded += other.decoded;
        self.unbound += other.unbound;
        self.undecodable += other.undecodable;
        self.inserted += other.inserted;
        self.duplicates += other.duplicates;
        self.failed += other.failed;
    }
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Inserts a range's events and advances `cursor` as one unit. Outcomes
    /// are returned in input order. An `Err` means nothing was committed.
    async fn commit_range(
        &self,
        events: &[IngestedEvent],
        cursor: Option<CursorUpdate>,
    ) -> Result<Vec<InsertOutcome>>;

    async fn load_cursor(&self, name: &str) -> Result<Option<u64>>;

    /// Idempotent single-row write for callers outside range ingestion.
    /// Same path as a one-row range without a cursor.
    async fn insert(&self, event: &IngestedEvent) -> Result<InsertOutcome> {
        let mut outcomes = self.commit_range(std::slice::from_ref(event), None).await?;
        Ok(outcomes
            .pop()
            .unwrap_or_else(|| InsertOutcome::Failed("store returned no outcome".to_string())))
    }
}

#[derive(Default)]
struct MemoryState {
    rows: BTreeMap<(String, u64), StoredEvent>,
    cursors: HashMap<String, u64>,
}

/// In-process store with the same dedup and cursor semantics as Postgres.
#[derive(Default)]
pub struct MemoryEventStore {
    state: RwLock<MemoryState>,
    #[cfg(test)]
    reject_tx: std::sync::Mutex<Option<String>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored rows ordered by `(tx_hash, log_index)`.
    pub async fn snapshot(&self) -> Vec<StoredEvent> {
        self.state.read().await.rows.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.rows.is_empty()
    }

    #[cfg(test)]
    fn reject_inserts_for(&self, tx_hash: &str) {
        if let Ok(mut reject) = self.reject_tx.lock() {
            *reject = Some(tx_hash.to_string());
        }
    }

    fn check_row(&self, event: &IngestedEvent) -> std::result::Result<(), String> {
        if !event.payload.is_object() {
            return Err("payload must be a JSON object".to_string());
        }
        #[cfg(test)]
        if let Ok(reject) = self.reject_tx.lock() {
            if reject.as_deref() == Some(event.tx_hash.as_str()) {
                return Err("rejected by test hook".to_string());
            }
        }
        Ok(())
    }

    fn insert_locked(&self, state: &mut MemoryState, event: &IngestedEvent) -> InsertOutcome {
        if let Err(reason) = self.check_row(event) {
            return InsertOutcome::Failed(reason);
        }
        let key = (event.tx_hash.clone(), event.log_index);
        if state.rows.contains_key(&key) {
            return InsertOutcome::Duplicate;
        }
        state.rows.insert(
            key,
            StoredEvent {
                event: event.clone(),
                created_at: Utc::now(),
            },
        );
        InsertOutcome::Inserted
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn commit_range(
        &self,
        events: &[IngestedEvent],
        cursor: Option<CursorUpdate>,
    ) -> Result<Vec<InsertOutcome>> {
        let mut state = self.state.write().await;
        let outcomes = events
            .iter()
            .map(|event| self.insert_locked(&mut state, event))
            .collect();
        if let Some(cursor) = cursor {
            state.cursors.insert(cursor.name, cursor.block_number);
        }
        Ok(outcomes)
    }

    async fn load_cursor(&self, name: &str) -> Result<Option<u64>> {
        Ok(self.state.read().await.cursors.get(name).copied())
    }
}
