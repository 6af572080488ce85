//! Swap persistence
//!
//! Storage is a pluggable key-document store with a handful of indexed
//! columns; consistency is last-write-wins per swap id. Two backends
//! ship with the crate:
//! - `SqliteStore`: durable client-side store on sqlx/SQLite
//! - `MemoryStore`: ephemeral DashMap store for tests and embedders
//!   that persist elsewhere

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::ClientResult;
use crate::swap::{EscrowId, SwapId, SwapKind, SwapRecord};
use async_trait::async_trait;

/// One conjunctive filter clause for [`SwapStore::query`]
#[derive(Debug, Clone)]
pub enum QueryClause {
    IdIn(Vec<SwapId>),
    EscrowIdIn(Vec<EscrowId>),
    Kind(SwapKind),
    /// Non-terminal swaps only
    Active,
    /// Terminal swaps only
    Terminal,
}

/// Whether `record` satisfies every clause
pub fn matches(record: &SwapRecord, clauses: &[QueryClause]) -> bool {
    clauses.iter().all(|clause| match clause {
        QueryClause::IdIn(ids) => ids.contains(&record.id),
        QueryClause::EscrowIdIn(ids) => ids.contains(&record.escrow_id),
        QueryClause::Kind(kind) => record.kind == kind.as_str(),
        QueryClause::Active => !record.terminal,
        QueryClause::Terminal => record.terminal,
    })
}

/// Persistent swap record store
#[async_trait]
pub trait SwapStore: Send + Sync {
    /// Upsert one record
    async fn save(&self, record: &SwapRecord) -> ClientResult<()>;

    /// Upsert a batch
    async fn save_all(&self, records: &[SwapRecord]) -> ClientResult<()>;

    async fn load(&self, id: &SwapId) -> ClientResult<Option<SwapRecord>>;

    /// Fetch every record matching all `clauses`; no clauses fetches
    /// everything
    async fn query(&self, clauses: &[QueryClause]) -> ClientResult<Vec<SwapRecord>>;

    async fn remove(&self, id: &SwapId) -> ClientResult<()>;

    async fn remove_all(&self, ids: &[SwapId]) -> ClientResult<()>;

    async fn count(&self) -> ClientResult<u64>;
}
