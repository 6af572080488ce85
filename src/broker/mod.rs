//! Intermediary discovery and quoting
//!
//! This module provides:
//! - The HTTP wire format of the intermediary and registry endpoints
//! - The registry of known intermediaries with lifetime blacklisting
//! - The quote race that fans a request out and picks the best answer

pub mod http;
pub mod quote;
pub mod registry;

pub use http::{
    HttpQuoteApi, InfoResponse, QuoteApi, QuoteRequest, QuoteResponse, Reputation, ServiceInfo,
};
pub use quote::{QuoteBroker, QuoteSpec};
pub use registry::IntermediaryRegistry;

use crate::swap::SwapKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One known intermediary and the services it advertises
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Intermediary {
    pub url: String,
    /// Settlement address per chain tag, from discovery
    pub addresses: HashMap<String, String>,
    pub services: HashMap<SwapKind, ServiceInfo>,
    /// Self-reported track record, when the endpoint exposes one
    pub reputation: Option<Reputation>,
}

impl Intermediary {
    /// Build from an info response, dropping service tags this client
    /// does not know
    pub fn from_info(url: String, info: InfoResponse) -> Self {
        let services = info
            .services
            .into_iter()
            .filter_map(|(tag, service)| SwapKind::from_tag(&tag).map(|kind| (kind, service)))
            .collect();
        Self {
            url,
            addresses: info.addresses,
            services,
            reputation: info.reputation,
        }
    }

    /// Whether this intermediary services `kind` with `amount_sats`
    /// inside its advertised bounds
    pub fn supports(&self, kind: SwapKind, amount_sats: u64) -> bool {
        self.services
            .get(&kind)
            .map_or(false, |s| (s.min_sats..=s.max_sats).contains(&amount_sats))
    }

    /// Whether the `kind` service covers `token`
    pub fn supports_token(&self, kind: SwapKind, token: &str) -> bool {
        self.services.get(&kind).map_or(false, |s| {
            s.tokens.is_empty() || s.tokens.iter().any(|t| t == token)
        })
    }

    /// Settlement address on `chain`, when discovery advertised one
    pub fn address_on(&self, chain: &str) -> Option<&str> {
        self.addresses.get(chain).map(String::as_str)
    }

    /// Last advertised liquidity for `kind`, output-asset units
    pub fn advertised_liquidity(&self, kind: SwapKind) -> Option<u64> {
        self.services.get(&kind).and_then(|s| s.liquidity)
    }
}
