//! Bitcoin block header codec
//!
//! Headers travel as raw 80-byte little-endian payloads. Hashing is
//! double SHA-256. Every `Hash32` in this module is in internal byte
//! order, which is the reverse of the hex block explorers display.

use crate::error::{ClientError, ClientResult};
use crate::swap::Hash32;
use sha2::{Digest, Sha256};

pub const HEADER_SIZE: usize = 80;

/// One bitcoin block header plus the height it was fetched at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block_hash: Hash32,
    pub merkle_root: Hash32,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
    pub height: u64,
}

impl BlockHeader {
    /// Parse the raw 80-byte wire format
    pub fn from_raw(raw: &[u8; HEADER_SIZE], height: u64) -> Self {
        let mut prev_block_hash = [0u8; 32];
        prev_block_hash.copy_from_slice(&raw[4..36]);
        let mut merkle_root = [0u8; 32];
        merkle_root.copy_from_slice(&raw[36..68]);

        let mut four = [0u8; 4];
        four.copy_from_slice(&raw[0..4]);
        let version = i32::from_le_bytes(four);
        four.copy_from_slice(&raw[68..72]);
        let timestamp = u32::from_le_bytes(four);
        four.copy_from_slice(&raw[72..76]);
        let bits = u32::from_le_bytes(four);
        four.copy_from_slice(&raw[76..80]);
        let nonce = u32::from_le_bytes(four);

        Self {
            version,
            prev_block_hash: Hash32(prev_block_hash),
            merkle_root: Hash32(merkle_root),
            timestamp,
            bits,
            nonce,
            height,
        }
    }

    /// Parse the hex form Esplora serves
    pub fn from_hex(header_hex: &str, height: u64) -> ClientResult<Self> {
        let bytes = hex::decode(header_hex.trim()).map_err(|e| ClientError::BadHeader {
            height,
            message: format!("invalid hex: {}", e),
        })?;
        let raw: [u8; HEADER_SIZE] =
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| ClientError::BadHeader {
                    height,
                    message: format!("expected {} bytes, got {}", HEADER_SIZE, bytes.len()),
                })?;
        Ok(Self::from_raw(&raw, height))
    }

    /// Serialize back to the raw 80-byte wire format
    pub fn to_raw(&self) -> [u8; HEADER_SIZE] {
        let mut raw = [0u8; HEADER_SIZE];
        raw[0..4].copy_from_slice(&self.version.to_le_bytes());
        raw[4..36].copy_from_slice(&self.prev_block_hash.0);
        raw[36..68].copy_from_slice(&self.merkle_root.0);
        raw[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        raw[72..76].copy_from_slice(&self.bits.to_le_bytes());
        raw[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        raw
    }

    /// Block hash, internal byte order
    pub fn block_hash(&self) -> Hash32 {
        Hash32(double_sha256(&self.to_raw()))
    }
}

pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

fn double_sha256_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut combined = [0u8; 64];
    combined[0..32].copy_from_slice(left);
    combined[32..64].copy_from_slice(right);
    double_sha256(&combined)
}

/// Fold a leaf txid up a merkle path. `position` is the transaction
/// index within its block; its bits pick the side each sibling joins on.
pub fn merkle_root_from_path(txid: &Hash32, siblings: &[Hash32], position: u32) -> Hash32 {
    let mut current = txid.0;
    let mut pos = position;
    for sibling in siblings {
        current = if pos & 1 == 1 {
            double_sha256_pair(&sibling.0, &current)
        } else {
            double_sha256_pair(&current, &sibling.0)
        };
        pos >>= 1;
    }
    Hash32(current)
}

/// Parse an explorer-facing (display order) hash into internal order
pub fn hash_from_display_hex(display_hex: &str) -> ClientResult<Hash32> {
    let mut out = [0u8; 32];
    hex::decode_to_slice(display_hex.trim(), &mut out).map_err(|e| ClientError::ChainQuery {
        message: format!("bad hash from source: {}", e),
    })?;
    out.reverse();
    Ok(Hash32(out))
}
