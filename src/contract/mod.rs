//! Interfaces to the smart-chain escrow contract
//!
//! The escrow contract itself lives outside this crate. Embedders
//! supply a [`Contract`] implementation per chain; the orchestration
//! layer only ever talks through these traits, so swap logic stays
//! chain-agnostic.

use crate::error::ClientResult;
use crate::swap::{EscrowData, EscrowId, Hash32};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;

/// Authoritative on-chain status of one escrow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStatus {
    /// Never initialized (or initialization not yet visible)
    NotCommitted,
    /// Funds locked, neither claimed nor refunded
    Committed,
    /// Claimed by the counterparty
    Paid,
    /// Expired and already refunded
    Expired,
    /// Expired with funds still locked; refund is available
    Refundable,
}

impl CommitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitStatus::NotCommitted => "not_committed",
            CommitStatus::Committed => "committed",
            CommitStatus::Paid => "paid",
            CommitStatus::Expired => "expired",
            CommitStatus::Refundable => "refundable",
        }
    }
}

/// Signed quote envelope an intermediary returns with its quote; proves
/// the intermediary will honor initialization until `timeout`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitAuthorization {
    pub prefix: String,
    /// Unix seconds; the signature is dead past this
    pub timeout: u64,
    pub signature: String,
}

/// Chain transaction prepared by the contract layer, opaque to the
/// orchestration logic. Signing happens behind [`Contract::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedTx {
    pub label: &'static str,
    pub payload: Vec<u8>,
}

/// What the claimer presents to release an escrow
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimProof {
    /// Secret preimage of the claim hash (lightning swaps)
    Preimage { preimage: String },
    /// SPV proof of a confirmed bitcoin transaction (on-chain swaps)
    BitcoinTx {
        txid: String,
        raw_tx: Vec<u8>,
        block_height: u64,
        merkle: Vec<Hash32>,
        position: u32,
    },
}

/// Escrow contract operations the swap lifecycle needs
#[async_trait]
pub trait Contract: Send + Sync {
    /// Authoritative status of one escrow
    async fn commit_status(&self, escrow: &EscrowData) -> ClientResult<CommitStatus>;

    /// Batched status query; same order as the input. The default
    /// implementation degrades to sequential single queries.
    async fn commit_statuses(&self, escrows: &[EscrowData]) -> ClientResult<Vec<CommitStatus>> {
        let mut out = Vec::with_capacity(escrows.len());
        for escrow in escrows {
            out.push(self.commit_status(escrow).await?);
        }
        Ok(out)
    }

    /// Cheap local check whether the signed authorization has timed out
    async fn is_init_authorization_expired(
        &self,
        escrow: &EscrowData,
        auth: &InitAuthorization,
    ) -> ClientResult<bool>;

    /// Full structural validation of the signed authorization; returns
    /// `Err(QuoteInvalid)` on a bad signature or mismatched terms
    async fn is_valid_init_authorization(
        &self,
        escrow: &EscrowData,
        auth: &InitAuthorization,
    ) -> ClientResult<()>;

    /// When the signed authorization stops being usable, unix seconds
    async fn init_authorization_expiry(
        &self,
        escrow: &EscrowData,
        auth: &InitAuthorization,
    ) -> ClientResult<u64>;

    /// Transactions committing the escrow on chain
    async fn txs_init(
        &self,
        escrow: &EscrowData,
        auth: &InitAuthorization,
    ) -> ClientResult<Vec<PreparedTx>>;

    /// Transactions claiming a committed escrow with `proof`
    async fn txs_claim(
        &self,
        escrow: &EscrowData,
        proof: &ClaimProof,
    ) -> ClientResult<Vec<PreparedTx>>;

    /// Transactions refunding an expired, unclaimed escrow
    async fn txs_refund(&self, escrow: &EscrowData) -> ClientResult<Vec<PreparedTx>>;

    /// Sign and broadcast prepared transactions, returning their ids
    async fn send(&self, txs: Vec<PreparedTx>) -> ClientResult<Vec<String>>;
}

/// One escrow event as emitted by the contract
#[derive(Debug, Clone, PartialEq)]
pub enum EscrowEvent {
    Initialize {
        escrow_id: EscrowId,
        sequence: u64,
        txid: String,
    },
    Claim {
        escrow_id: EscrowId,
        sequence: u64,
        txid: String,
        /// Claim witness; for HTLC escrows this is the hex preimage
        witness: Vec<u8>,
    },
    Refund {
        escrow_id: EscrowId,
        sequence: u64,
        txid: String,
    },
}

impl EscrowEvent {
    pub fn escrow_id(&self) -> EscrowId {
        match self {
            EscrowEvent::Initialize { escrow_id, .. }
            | EscrowEvent::Claim { escrow_id, .. }
            | EscrowEvent::Refund { escrow_id, .. } => *escrow_id,
        }
    }

    pub fn sequence(&self) -> u64 {
        match self {
            EscrowEvent::Initialize { sequence, .. }
            | EscrowEvent::Claim { sequence, .. }
            | EscrowEvent::Refund { sequence, .. } => *sequence,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EscrowEvent::Initialize { .. } => "initialize",
            EscrowEvent::Claim { .. } => "claim",
            EscrowEvent::Refund { .. } => "refund",
        }
    }
}

/// Push feed of escrow events, delivered in batches in chain order.
/// Dropping the receiver unsubscribes.
pub trait ChainEvents: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<Vec<EscrowEvent>>;
}

/// Reference market price per token, in output units per million input
/// units. Where prices come from is the embedder's concern.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn market_ppm(&self, token: &str) -> ClientResult<u64>;
}

/// Static price table; the test and single-market configuration
pub struct FixedPriceSource {
    prices: HashMap<String, u64>,
}

impl FixedPriceSource {
    pub fn new(prices: HashMap<String, u64>) -> Self {
        Self { prices }
    }

    pub fn single(token: &str, ppm: u64) -> Self {
        let mut prices = HashMap::new();
        prices.insert(token.to_string(), ppm);
        Self { prices }
    }
}

#[async_trait]
impl PriceSource for FixedPriceSource {
    async fn market_ppm(&self, token: &str) -> ClientResult<u64> {
        self.prices.get(token).copied().ok_or_else(|| {
            crate::error::ClientError::Internal(format!("no market price for token {}", token))
        })
    }
}
