//! btcswap-client - Client-side orchestration for bitcoin cross-chain
//! atomic swaps
//!
//! This crate drives the client side of a trustless swap network
//! exchanging bitcoin (on-chain or lightning) for tokens on
//! smart-contract chains, brokered by collateralized intermediaries.
//! It covers quote racing across intermediaries, the per-kind swap
//! lifecycle state machines, event-driven reconciliation against chain
//! truth, crash recovery from persistent storage, and synchronization
//! of an on-chain bitcoin light-client relay for SPV claim proofs.
//!
//! Chain-facing concerns (escrow program calls, transaction signing,
//! price oracles) stay behind traits supplied by the embedding
//! application; see [`Collaborators`].

pub mod backoff;
pub mod broker;
pub mod cancel;
pub mod client;
pub mod config;
pub mod contract;
pub mod error;
pub mod events;
pub mod metrics;
pub mod relay;
pub mod storage;
pub mod swap;
pub mod watchdog;
pub mod wrapper;

pub use broker::QuoteSpec;
pub use cancel::{cancel_pair, CancelHandle, CancelToken};
pub use client::{init_logging, Collaborators, SwapClient};
pub use config::Settings;
pub use error::{ClientError, ClientResult};
pub use swap::{Swap, SwapId, SwapKind};
