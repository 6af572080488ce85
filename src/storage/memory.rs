//! In-memory swap store

use crate::error::ClientResult;
use crate::storage::{matches, QueryClause, SwapStore};
use crate::swap::{SwapId, SwapRecord};
use async_trait::async_trait;
use dashmap::DashMap;

/// DashMap-backed store; contents vanish with the process
#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<SwapId, SwapRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SwapStore for MemoryStore {
    async fn save(&self, record: &SwapRecord) -> ClientResult<()> {
        self.records.insert(record.id, record.clone());
        Ok(())
    }

    async fn save_all(&self, records: &[SwapRecord]) -> ClientResult<()> {
        for record in records {
            self.records.insert(record.id, record.clone());
        }
        Ok(())
    }

    async fn load(&self, id: &SwapId) -> ClientResult<Option<SwapRecord>> {
        Ok(self.records.get(id).map(|r| r.clone()))
    }

    async fn query(&self, clauses: &[QueryClause]) -> ClientResult<Vec<SwapRecord>> {
        Ok(self
            .records
            .iter()
            .filter(|entry| matches(entry.value(), clauses))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn remove(&self, id: &SwapId) -> ClientResult<()> {
        self.records.remove(id);
        Ok(())
    }

    async fn remove_all(&self, ids: &[SwapId]) -> ClientResult<()> {
        for id in ids {
            self.records.remove(id);
        }
        Ok(())
    }

    async fn count(&self) -> ClientResult<u64> {
        Ok(self.records.len() as u64)
    }
}
