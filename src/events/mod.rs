//! Escrow event intake
//!
//! This module provides:
//! - The listener feeding contract event batches into the wrappers
//! - Per-escrow ordered dispatch with storage fallback for swaps the
//!   live maps do not know

pub mod listener;

pub use listener::EventListener;
