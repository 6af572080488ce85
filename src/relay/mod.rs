//! Bitcoin light-client relay synchronization
//!
//! This module provides:
//! - The 80-byte bitcoin header codec and merkle-path arithmetic
//! - `BitcoinSource`, the authoritative header/proof feed, with an
//!   Esplora-backed implementation
//! - `BtcRelay`, the on-chain light client the headers are submitted to
//! - `RelaySynchronizer`, which walks the source to bring the relay tip
//!   up to date before a received bitcoin payment can be proven

pub mod headers;
pub mod source;
pub mod sync;

pub use headers::BlockHeader;
pub use source::{BitcoinSource, EsploraSource, MerkleProof};
pub use sync::RelaySynchronizer;

use crate::error::ClientResult;
use crate::swap::Hash32;
use async_trait::async_trait;

/// Committed tip of the on-chain light client
#[derive(Debug, Clone)]
pub struct RelayTip {
    pub height: u64,
    /// Block hash at `height`, internal byte order
    pub hash: Hash32,
    /// Highest fork slot in use; a brand-new side fork claims the next one
    pub fork_id: u64,
}

/// Result of one header submission transaction
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub txid: String,
    /// Whether the relay counts the submitted run as its main chain
    pub main: bool,
}

/// On-chain bitcoin light client. Implementations sign and broadcast
/// the submission transactions; the synchronizer only decides what to
/// submit and in which batches.
#[async_trait]
pub trait BtcRelay: Send + Sync {
    async fn tip(&self) -> ClientResult<RelayTip>;

    /// Largest header batch one main-chain submission accepts
    fn max_headers_per_tx(&self) -> usize;

    /// Largest header batch one side-fork submission accepts
    fn max_fork_headers_per_tx(&self) -> usize;

    /// Extend the relay main chain with a contiguous ascending run
    async fn submit_main(&self, headers: &[BlockHeader]) -> ClientResult<SubmitOutcome>;

    /// Extend (or open) a side fork. The relay flips the fork to main
    /// once its cumulative work overtakes the stored main chain, which
    /// the outcome reports.
    async fn submit_fork(&self, fork_id: u64, headers: &[BlockHeader])
        -> ClientResult<SubmitOutcome>;
}
