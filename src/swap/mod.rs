//! Swap records and lifecycle
//!
//! This module provides:
//! - The `Swap` record shared by all four swap kinds
//! - Per-direction state machines and the legal transition graph
//! - Fee arithmetic and quoted-price validation
//! - Versioned revival of persisted records

pub mod migrate;
pub mod price;
pub mod state;

pub use migrate::{revive, CURRENT_VERSION};
pub use price::{PriceInfo, SwapFees};
pub use state::{can_transition, Direction, FromBtcState, StateGroup, SwapState, ToBtcState};

use crate::contract::InitAuthorization;
use crate::error::{ClientError, ClientResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// 32-byte identifier rendered as lowercase hex
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash32(pub [u8; 32]);

impl Hash32 {
    pub const ZERO: Hash32 = Hash32([0u8; 32]);

    pub fn from_hex(s: &str) -> ClientResult<Self> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)
            .map_err(|e| ClientError::Internal(format!("bad hash hex: {}", e)))?;
        Ok(Hash32(out))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl FromStr for Hash32 {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Hash32::from_hex(s)
    }
}

impl Serialize for Hash32 {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash32 {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash32::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Identifier the escrow contract and its events use for one escrow
pub type EscrowId = Hash32;

/// Client-local swap identifier. Derived from the claim hash and a
/// random nonce chosen at quote time, so competing quotes for the same
/// transfer never collide.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SwapId(pub Hash32);

impl SwapId {
    pub fn derive(claim_hash: &Hash32, nonce: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(claim_hash.0);
        hasher.update(nonce.to_le_bytes());
        SwapId(Hash32(hasher.finalize().into()))
    }
}

impl fmt::Display for SwapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for SwapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SwapId({})", self.0)
    }
}

/// The four supported swap kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapKind {
    ToBtc,
    ToBtcLn,
    FromBtc,
    FromBtcLn,
}

impl SwapKind {
    pub const ALL: [SwapKind; 4] = [
        SwapKind::ToBtc,
        SwapKind::ToBtcLn,
        SwapKind::FromBtc,
        SwapKind::FromBtcLn,
    ];

    pub fn direction(&self) -> Direction {
        match self {
            SwapKind::ToBtc | SwapKind::ToBtcLn => Direction::ToBtc,
            SwapKind::FromBtc | SwapKind::FromBtcLn => Direction::FromBtc,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SwapKind::ToBtc => "to_btc",
            SwapKind::ToBtcLn => "to_btc_ln",
            SwapKind::FromBtc => "from_btc",
            SwapKind::FromBtcLn => "from_btc_ln",
        }
    }

    /// Parse a persisted kind tag. Unknown tags yield `None` so newer
    /// record formats pass through loading without breaking it.
    pub fn from_tag(tag: &str) -> Option<SwapKind> {
        match tag {
            "to_btc" => Some(SwapKind::ToBtc),
            "to_btc_ln" => Some(SwapKind::ToBtcLn),
            "from_btc" => Some(SwapKind::FromBtc),
            "from_btc_ln" => Some(SwapKind::FromBtcLn),
            _ => None,
        }
    }
}

impl fmt::Display for SwapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the escrow releases: what the claimer must present
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowKind {
    /// Secret preimage of the claim hash (lightning)
    Htlc,
    /// SPV proof of a confirmed bitcoin transaction
    ChainTx,
    /// SPV proof of a nonce-committed bitcoin transaction
    ChainTxNonced,
}

/// The escrow terms this swap locked in, exclusively owned by the swap
/// record per the one-escrow-one-swap model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowData {
    pub kind: EscrowKind,
    pub offerer: String,
    pub claimer: String,
    pub token: String,
    /// Smart-chain token amount held by the escrow
    pub amount: u64,
    pub claim_hash: Hash32,
    /// Unix seconds after which the offerer may reclaim
    pub expiry: u64,
    /// Disambiguates escrows reusing a claim hash
    pub sequence: u64,
    /// Bitcoin confirmations the claim proof must carry
    pub confirmations: u16,
    pub pay_in: bool,
    pub pay_out: bool,
}

impl EscrowData {
    pub fn escrow_id(&self) -> EscrowId {
        self.claim_hash
    }
}

/// Kind-specific side of a swap record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SwapPayload {
    ToBtc {
        /// Destination bitcoin address
        address: String,
        amount_sats: u64,
        sats_per_vbyte: u64,
        /// Intermediary's payment, once proven
        payment_txid: Option<String>,
    },
    ToBtcLn {
        invoice: String,
        payment_hash: Hash32,
        amount_sats: u64,
        /// Learned from the claim witness once the intermediary settles
        preimage: Option<String>,
    },
    FromBtc {
        /// Address we must pay into
        deposit_address: String,
        amount_sats: u64,
        deposit_txid: Option<String>,
        deposit_vout: Option<u32>,
    },
    FromBtcLn {
        invoice: String,
        payment_hash: Hash32,
        amount_sats: u64,
        preimage: Option<String>,
    },
}

impl SwapPayload {
    pub fn kind(&self) -> SwapKind {
        match self {
            SwapPayload::ToBtc { .. } => SwapKind::ToBtc,
            SwapPayload::ToBtcLn { .. } => SwapKind::ToBtcLn,
            SwapPayload::FromBtc { .. } => SwapKind::FromBtc,
            SwapPayload::FromBtcLn { .. } => SwapKind::FromBtcLn,
        }
    }

    pub fn amount_sats(&self) -> u64 {
        match self {
            SwapPayload::ToBtc { amount_sats, .. }
            | SwapPayload::ToBtcLn { amount_sats, .. }
            | SwapPayload::FromBtc { amount_sats, .. }
            | SwapPayload::FromBtcLn { amount_sats, .. } => *amount_sats,
        }
    }
}

/// One swap, any kind. Kind-specific behavior dispatches on `payload`;
/// everything else is shared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Swap {
    pub id: SwapId,
    /// Persisted record format version, see [`migrate`]
    pub version: u32,
    pub created_at: DateTime<Utc>,
    /// True when the user fixed the input amount, false when the output
    pub exact_in: bool,
    pub state: SwapState,
    pub price: PriceInfo,
    pub fees: SwapFees,
    pub escrow: EscrowData,
    /// Signed initialization envelope the intermediary returned with
    /// the quote; required to commit the escrow
    pub auth: InitAuthorization,
    pub intermediary_url: String,
    /// Unix seconds; the signed quote authorization is dead past this
    pub quote_expiry: u64,
    pub commit_txid: Option<String>,
    pub claim_txid: Option<String>,
    pub refund_txid: Option<String>,
    pub payload: SwapPayload,
}

impl Swap {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        payload: SwapPayload,
        escrow: EscrowData,
        auth: InitAuthorization,
        fees: SwapFees,
        price: PriceInfo,
        intermediary_url: String,
        quote_expiry: u64,
        exact_in: bool,
        nonce: u64,
    ) -> Self {
        let id = SwapId::derive(&escrow.claim_hash, nonce);
        let state = match payload.kind().direction() {
            Direction::ToBtc => SwapState::ToBtc(ToBtcState::Created),
            Direction::FromBtc => SwapState::FromBtc(FromBtcState::Created),
        };
        Swap {
            id,
            version: CURRENT_VERSION,
            created_at: Utc::now(),
            exact_in,
            state,
            price,
            fees,
            escrow,
            auth,
            intermediary_url,
            quote_expiry,
            commit_txid: None,
            claim_txid: None,
            refund_txid: None,
            payload,
        }
    }

    pub fn kind(&self) -> SwapKind {
        self.payload.kind()
    }

    pub fn direction(&self) -> Direction {
        self.kind().direction()
    }

    pub fn escrow_id(&self) -> EscrowId {
        self.escrow.escrow_id()
    }

    pub fn state_group(&self) -> StateGroup {
        self.state.group()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn requires_action(&self) -> bool {
        self.state.requires_action()
    }

    /// Amount the user puts in, in input-asset units
    pub fn input_amount(&self) -> u64 {
        match self.direction() {
            Direction::ToBtc => self.escrow.amount,
            Direction::FromBtc => self.payload.amount_sats(),
        }
    }

    /// Amount the user gets out, in output-asset units
    pub fn output_amount(&self) -> u64 {
        match self.direction() {
            Direction::ToBtc => self.payload.amount_sats(),
            Direction::FromBtc => self.escrow.amount,
        }
    }

    /// Full fee charged on this swap, input-asset units
    pub fn total_fee(&self) -> u64 {
        self.fees.total_for(self.input_amount())
    }

    /// Input net of all fees; what the output price actually applies to
    pub fn input_without_fee(&self) -> u64 {
        self.input_amount().saturating_sub(self.total_fee())
    }

    /// Apply a state transition. Returns `Ok(false)` when the swap is
    /// already in `target` (idempotent re-delivery), `Ok(true)` when the
    /// state changed, and an error when the move is not on the graph.
    /// Persistence and notification are the owning wrapper's job.
    pub fn transition_to(&mut self, target: SwapState) -> ClientResult<bool> {
        if self.state == target {
            return Ok(false);
        }
        if !can_transition(self.state, target) {
            return Err(ClientError::InvalidTransition {
                from: self.state.to_string(),
                to: target.to_string(),
            });
        }
        self.state = target;
        Ok(true)
    }

    pub fn quote_expired(&self, now: u64) -> bool {
        now >= self.quote_expiry
    }

    /// Advisory: close enough to expiry that committing is ill-advised
    pub fn quote_soft_expired(&self, now: u64, margin_secs: u64) -> bool {
        now.saturating_add(margin_secs) >= self.quote_expiry
    }

    /// Terminal swaps are kept until their quote expiry passes so that
    /// late event re-deliveries still resolve, then swept
    pub fn can_remove(&self, now: u64) -> bool {
        self.is_terminal() && self.quote_expired(now)
    }

    /// Persistence form of this swap
    pub fn to_record(&self) -> ClientResult<SwapRecord> {
        Ok(SwapRecord {
            id: self.id,
            kind: self.kind().as_str().to_string(),
            version: self.version,
            state: self.state.ordinal(),
            terminal: self.is_terminal(),
            escrow_id: self.escrow_id(),
            doc: serde_json::to_value(self)?,
        })
    }
}

/// Stored form: enough indexed fields to query without parsing `doc`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapRecord {
    pub id: SwapId,
    pub kind: String,
    pub version: u32,
    pub state: i32,
    pub terminal: bool,
    pub escrow_id: EscrowId,
    pub doc: serde_json::Value,
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fee_example_adds_up() {
        let swap = testutil::from_btc_swap(2_000_000_000);
        assert_eq!(swap.input_amount(), 100_000);
        assert_eq!(swap.total_fee(), 3_000);
        assert_eq!(swap.input_without_fee(), 97_000);
        assert_eq!(swap.output_amount(), 97_000);
    }

    #[test]
    fn serde_round_trip_preserves_swap() {
        let swap = testutil::from_btc_swap(2_000_000_000);
        let json = serde_json::to_value(&swap).unwrap();
        let back: Swap = serde_json::from_value(json).unwrap();
        assert_eq!(back, swap);
    }

    #[test]
    fn transition_is_idempotent() {
        let mut swap = testutil::from_btc_swap(2_000_000_000);
        let committed = SwapState::FromBtc(FromBtcState::Committed);
        assert!(swap.transition_to(committed).unwrap());
        assert!(!swap.transition_to(committed).unwrap());
        assert_eq!(swap.state, committed);
    }

    #[test]
    fn illegal_transition_leaves_state_untouched() {
        let mut swap = testutil::from_btc_swap(2_000_000_000);
        let err = swap
            .transition_to(SwapState::FromBtc(FromBtcState::Claimed))
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidTransition { .. }));
        assert_eq!(swap.state, SwapState::FromBtc(FromBtcState::Created));
    }

    #[test]
    fn swap_ids_differ_per_nonce() {
        let hash = Hash32([1u8; 32]);
        assert_ne!(SwapId::derive(&hash, 1), SwapId::derive(&hash, 2));
    }

    #[test]
    fn removal_needs_terminal_and_expired() {
        let mut swap = testutil::from_btc_swap(1_000);
        assert!(!swap.can_remove(2_000));
        swap.state = SwapState::FromBtc(FromBtcState::QuoteExpired);
        assert!(swap.can_remove(2_000));
        assert!(!swap.can_remove(500));
    }

    #[test]
    fn hash_hex_round_trip() {
        let h = Hash32([0xAB; 32]);
        let parsed = Hash32::from_hex(&h.to_hex()).unwrap();
        assert_eq!(parsed, h);
        assert!(Hash32::from_hex("zz").is_err());
    }
}
