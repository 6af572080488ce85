//! Swap lifecycle states and the legal transition graph
//!
//! Each swap direction has its own state enum. Ordinals are part of the
//! persisted record format; negative ordinals are failure-side states,
//! matching the wire-level escrow protocol. State only ever moves
//! forward along the graph, with one deliberate exception: the advisory
//! `QuoteSoftExpired` mark may revert to `Created` when a later
//! authoritative check proves the quote authorization still valid.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Swap direction: which side of the trade bitcoin is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Smart-chain tokens in, bitcoin out
    ToBtc,
    /// Bitcoin in, smart-chain tokens out
    FromBtc,
}

/// Coarse grouping shared by both directions; drives watchdog and
/// recovery decisions without enumerating concrete states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateGroup {
    /// Quote accepted, escrow not yet committed; quote expiry applies
    PreCommit,
    /// Escrow committed on chain, settlement in progress
    Committed,
    /// Settled as far as the counterparty goes; a local action
    /// (claim or refund) is still owed
    ActionRequired,
    /// Nothing will ever change again
    Terminal,
}

/// States of a swap paying out bitcoin (on-chain or lightning)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToBtcState {
    /// Escrow refunded back to us after the intermediary failed to pay
    Refunded,
    /// Quote expired before the escrow was committed
    QuoteExpired,
    /// Expiry is close enough that committing is no longer advisable
    QuoteSoftExpired,
    /// Quote accepted, escrow not committed
    Created,
    /// Escrow committed, intermediary owes the bitcoin payment
    Committed,
    /// Intermediary proved payment and claimed the escrow
    Claimed,
    /// Escrow expired unclaimed; our refund is ready to send
    Refundable,
}

/// States of a swap receiving bitcoin (on-chain or lightning)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FromBtcState {
    /// Bitcoin payment failed or was double-spent after commit
    Failed,
    /// Quote expired before the escrow was committed
    QuoteExpired,
    /// Expiry is close enough that committing is no longer advisable
    QuoteSoftExpired,
    /// Quote accepted, escrow not committed
    Created,
    /// Escrow committed by the intermediary, bitcoin payment owed by us
    Committed,
    /// Bitcoin payment confirmed (or invoice settled); claim owed by us
    PaymentReceived,
    /// Escrow claimed, tokens received
    Claimed,
}

/// Direction-tagged state carried by the swap record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapState {
    ToBtc(ToBtcState),
    FromBtc(FromBtcState),
}

impl ToBtcState {
    pub fn ordinal(&self) -> i32 {
        match self {
            ToBtcState::Refunded => -3,
            ToBtcState::QuoteExpired => -2,
            ToBtcState::QuoteSoftExpired => -1,
            ToBtcState::Created => 0,
            ToBtcState::Committed => 1,
            ToBtcState::Claimed => 3,
            ToBtcState::Refundable => 4,
        }
    }

    pub fn from_ordinal(ordinal: i32) -> Option<Self> {
        match ordinal {
            -3 => Some(ToBtcState::Refunded),
            -2 => Some(ToBtcState::QuoteExpired),
            -1 => Some(ToBtcState::QuoteSoftExpired),
            0 => Some(ToBtcState::Created),
            1 => Some(ToBtcState::Committed),
            3 => Some(ToBtcState::Claimed),
            4 => Some(ToBtcState::Refundable),
            _ => None,
        }
    }

    pub fn group(&self) -> StateGroup {
        match self {
            ToBtcState::Created | ToBtcState::QuoteSoftExpired => StateGroup::PreCommit,
            ToBtcState::Committed => StateGroup::Committed,
            ToBtcState::Refundable => StateGroup::ActionRequired,
            ToBtcState::Refunded | ToBtcState::QuoteExpired | ToBtcState::Claimed => {
                StateGroup::Terminal
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ToBtcState::Refunded => "refunded",
            ToBtcState::QuoteExpired => "quote_expired",
            ToBtcState::QuoteSoftExpired => "quote_soft_expired",
            ToBtcState::Created => "created",
            ToBtcState::Committed => "committed",
            ToBtcState::Claimed => "claimed",
            ToBtcState::Refundable => "refundable",
        }
    }

    fn can_transition(from: Self, to: Self) -> bool {
        use ToBtcState::*;
        matches!(
            (from, to),
            (Created, QuoteSoftExpired)
                | (Created, QuoteExpired)
                | (Created, Committed)
                | (QuoteSoftExpired, Created)
                | (QuoteSoftExpired, QuoteExpired)
                | (QuoteSoftExpired, Committed)
                | (Committed, Claimed)
                | (Committed, Refundable)
                | (Refundable, Claimed)
                | (Refundable, Refunded)
        )
    }
}

impl FromBtcState {
    pub fn ordinal(&self) -> i32 {
        match self {
            FromBtcState::Failed => -4,
            FromBtcState::QuoteExpired => -2,
            FromBtcState::QuoteSoftExpired => -1,
            FromBtcState::Created => 0,
            FromBtcState::Committed => 1,
            FromBtcState::PaymentReceived => 2,
            FromBtcState::Claimed => 3,
        }
    }

    pub fn from_ordinal(ordinal: i32) -> Option<Self> {
        match ordinal {
            -4 => Some(FromBtcState::Failed),
            -2 => Some(FromBtcState::QuoteExpired),
            -1 => Some(FromBtcState::QuoteSoftExpired),
            0 => Some(FromBtcState::Created),
            1 => Some(FromBtcState::Committed),
            2 => Some(FromBtcState::PaymentReceived),
            3 => Some(FromBtcState::Claimed),
            _ => None,
        }
    }

    pub fn group(&self) -> StateGroup {
        match self {
            FromBtcState::Created | FromBtcState::QuoteSoftExpired => StateGroup::PreCommit,
            FromBtcState::Committed => StateGroup::Committed,
            FromBtcState::PaymentReceived => StateGroup::ActionRequired,
            FromBtcState::Failed | FromBtcState::QuoteExpired | FromBtcState::Claimed => {
                StateGroup::Terminal
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FromBtcState::Failed => "failed",
            FromBtcState::QuoteExpired => "quote_expired",
            FromBtcState::QuoteSoftExpired => "quote_soft_expired",
            FromBtcState::Created => "created",
            FromBtcState::Committed => "committed",
            FromBtcState::PaymentReceived => "payment_received",
            FromBtcState::Claimed => "claimed",
        }
    }

    fn can_transition(from: Self, to: Self) -> bool {
        use FromBtcState::*;
        matches!(
            (from, to),
            (Created, QuoteSoftExpired)
                | (Created, QuoteExpired)
                | (Created, Committed)
                | (QuoteSoftExpired, Created)
                | (QuoteSoftExpired, QuoteExpired)
                | (QuoteSoftExpired, Committed)
                | (Committed, PaymentReceived)
                | (Committed, QuoteExpired)
                | (Committed, Failed)
                | (PaymentReceived, Claimed)
                | (PaymentReceived, Failed)
        )
    }
}

impl SwapState {
    pub fn direction(&self) -> Direction {
        match self {
            SwapState::ToBtc(_) => Direction::ToBtc,
            SwapState::FromBtc(_) => Direction::FromBtc,
        }
    }

    pub fn ordinal(&self) -> i32 {
        match self {
            SwapState::ToBtc(s) => s.ordinal(),
            SwapState::FromBtc(s) => s.ordinal(),
        }
    }

    pub fn from_parts(direction: Direction, ordinal: i32) -> Option<Self> {
        match direction {
            Direction::ToBtc => ToBtcState::from_ordinal(ordinal).map(SwapState::ToBtc),
            Direction::FromBtc => FromBtcState::from_ordinal(ordinal).map(SwapState::FromBtc),
        }
    }

    pub fn group(&self) -> StateGroup {
        match self {
            SwapState::ToBtc(s) => s.group(),
            SwapState::FromBtc(s) => s.group(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.group() == StateGroup::Terminal
    }

    pub fn requires_action(&self) -> bool {
        self.group() == StateGroup::ActionRequired
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SwapState::ToBtc(s) => s.as_str(),
            SwapState::FromBtc(s) => s.as_str(),
        }
    }
}

impl fmt::Display for SwapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether moving `from → to` is legal. Self-transitions are not part of
/// the graph; callers treat them as idempotent no-ops before asking.
pub fn can_transition(from: SwapState, to: SwapState) -> bool {
    match (from, to) {
        (SwapState::ToBtc(a), SwapState::ToBtc(b)) => ToBtcState::can_transition(a, b),
        (SwapState::FromBtc(a), SwapState::FromBtc(b)) => FromBtcState::can_transition(a, b),
        _ => false,
    }
}
