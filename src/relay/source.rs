//! Authoritative bitcoin data source
//!
//! The synchronizer and the claim path read bitcoin through the
//! `BitcoinSource` trait. `EsploraSource` implements it against any
//! Esplora-compatible REST endpoint.

use crate::config::BitcoinConfig;
use crate::error::{ClientError, ClientResult};
use crate::relay::headers::{hash_from_display_hex, BlockHeader};
use crate::swap::Hash32;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

/// Merkle inclusion proof for one transaction, internal byte order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    pub block_height: u64,
    pub merkle: Vec<Hash32>,
    /// Transaction index within its block
    pub position: u32,
}

#[async_trait]
pub trait BitcoinSource: Send + Sync {
    /// Best block height the source knows
    async fn tip_height(&self) -> ClientResult<u64>;

    /// Ascending run of headers starting at `start_height`. Shorter
    /// than `count` (possibly empty) when the chain ends inside the
    /// requested range.
    async fn headers(&self, start_height: u64, count: u64) -> ClientResult<Vec<BlockHeader>>;

    /// Merkle inclusion proof for a confirmed transaction
    async fn merkle_proof(&self, txid: &str) -> ClientResult<MerkleProof>;

    /// Raw transaction bytes as hex
    async fn tx_hex(&self, txid: &str) -> ClientResult<String>;

    /// Confirmation count, zero while unconfirmed
    async fn tx_confirmations(&self, txid: &str) -> ClientResult<u64>;
}

#[derive(Debug, Deserialize)]
struct RawMerkleProof {
    block_height: u64,
    merkle: Vec<String>,
    pos: u32,
}

#[derive(Debug, Deserialize)]
struct TxStatus {
    confirmed: bool,
    block_height: Option<u64>,
}

/// Esplora REST client
#[derive(Debug, Clone)]
pub struct EsploraSource {
    http: reqwest::Client,
    base_url: String,
}

impl EsploraSource {
    pub fn new(config: &BitcoinConfig) -> ClientResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self {
            http,
            base_url: config.esplora_url.trim_end_matches('/').to_string(),
        })
    }

    /// Block hash at `height`, or `None` past the tip
    async fn block_hash_at(&self, height: u64) -> ClientResult<Option<String>> {
        let url = format!("{}/block-height/{}", self.base_url, height);
        let resp = self.http.get(&url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(ClientError::ChainQuery {
                message: format!("block-height {} returned status {}", height, resp.status()),
            });
        }
        Ok(Some(resp.text().await?.trim().to_string()))
    }

    async fn header_by_hash(&self, block_hash: &str, height: u64) -> ClientResult<BlockHeader> {
        let url = format!("{}/block/{}/header", self.base_url, block_hash);
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(ClientError::ChainQuery {
                message: format!("header {} returned status {}", block_hash, resp.status()),
            });
        }
        BlockHeader::from_hex(&resp.text().await?, height)
    }
}

#[async_trait]
impl BitcoinSource for EsploraSource {
    async fn tip_height(&self) -> ClientResult<u64> {
        let url = format!("{}/blocks/tip/height", self.base_url);
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(ClientError::ChainQuery {
                message: format!("tip height returned status {}", resp.status()),
            });
        }
        resp.text()
            .await?
            .trim()
            .parse()
            .map_err(|e| ClientError::ChainQuery {
                message: format!("unparseable tip height: {}", e),
            })
    }

    async fn headers(&self, start_height: u64, count: u64) -> ClientResult<Vec<BlockHeader>> {
        let mut out = Vec::with_capacity(count as usize);
        for height in (start_height..).take(count as usize) {
            let block_hash = match self.block_hash_at(height).await? {
                Some(hash) => hash,
                // the chain ends inside the requested range
                None => break,
            };
            out.push(self.header_by_hash(&block_hash, height).await?);
        }
        Ok(out)
    }

    async fn merkle_proof(&self, txid: &str) -> ClientResult<MerkleProof> {
        let url = format!("{}/tx/{}/merkle-proof", self.base_url, txid);
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(ClientError::ChainQuery {
                message: format!("merkle proof for {} returned status {}", txid, resp.status()),
            });
        }
        let raw: RawMerkleProof = resp.json().await?;
        convert_proof(raw)
    }

    async fn tx_hex(&self, txid: &str) -> ClientResult<String> {
        let url = format!("{}/tx/{}/hex", self.base_url, txid);
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(ClientError::ChainQuery {
                message: format!("tx {} returned status {}", txid, resp.status()),
            });
        }
        Ok(resp.text().await?.trim().to_string())
    }

    async fn tx_confirmations(&self, txid: &str) -> ClientResult<u64> {
        let url = format!("{}/tx/{}/status", self.base_url, txid);
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(ClientError::ChainQuery {
                message: format!("tx status for {} returned status {}", txid, resp.status()),
            });
        }
        let status: TxStatus = resp.json().await?;
        if !status.confirmed {
            return Ok(0);
        }
        let tip = self.tip_height().await?;
        let tx_height = status.block_height.unwrap_or(tip);
        Ok(tip.saturating_sub(tx_height) + 1)
    }
}

fn convert_proof(raw: RawMerkleProof) -> ClientResult<MerkleProof> {
    let merkle = raw
        .merkle
        .iter()
        .map(|sibling| hash_from_display_hex(sibling))
        .collect::<ClientResult<Vec<_>>>()?;
    Ok(MerkleProof {
        block_height: raw.block_height,
        merkle,
        position: raw.pos,
    })
}
