//! Intermediary discovery and blacklisting
//!
//! The registry holds every intermediary the client may quote against:
//! the statically configured URLs plus whatever the optional registry
//! endpoint lists. Blacklisting is in-memory and lasts for the process
//! lifetime; an intermediary that violated the protocol once is not
//! asked again.

use crate::broker::http::QuoteApi;
use crate::broker::Intermediary;
use crate::config::BrokerConfig;
use crate::error::ClientResult;
use crate::swap::SwapKind;

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct IntermediaryRegistry {
    api: Arc<dyn QuoteApi>,
    /// Optional endpoint listing intermediary URLs
    registry_url: Option<String>,
    /// Always-queried URLs from configuration
    static_urls: Vec<String>,
    entries: DashMap<String, Intermediary>,
    /// URL to blacklist reason
    blacklist: DashMap<String, String>,
}

impl IntermediaryRegistry {
    pub fn new(api: Arc<dyn QuoteApi>, config: &BrokerConfig) -> Self {
        Self {
            api,
            registry_url: config.registry_url.clone(),
            static_urls: config.intermediary_urls.clone(),
            entries: DashMap::new(),
            blacklist: DashMap::new(),
        }
    }

    /// Re-discover intermediaries and refresh their advertised services.
    /// Unreachable intermediaries are skipped, not removed; their last
    /// known services keep serving candidate selection.
    pub async fn refresh(&self) -> ClientResult<usize> {
        let mut urls = self.static_urls.clone();
        if let Some(registry_url) = &self.registry_url {
            match self.api.registry(registry_url).await {
                Ok(listed) => urls.extend(listed),
                Err(e) => warn!("Registry {} unreachable: {}", registry_url, e),
            }
        }
        urls.sort();
        urls.dedup();

        let mut refreshed = 0;
        for url in urls {
            if self.is_blacklisted(&url) {
                continue;
            }
            match self.api.info(&url).await {
                Ok(response) => {
                    self.entries
                        .insert(url.clone(), Intermediary::from_info(url, response));
                    refreshed += 1;
                }
                Err(e) => {
                    if e.blacklists_intermediary() {
                        self.blacklist(&url, &e.to_string());
                    } else {
                        debug!("Intermediary {} info failed: {}", url, e);
                    }
                }
            }
        }
        info!("Intermediary registry refreshed, {} reachable", refreshed);
        Ok(refreshed)
    }

    /// Permanently exclude an intermediary for this process lifetime
    pub fn blacklist(&self, url: &str, reason: &str) {
        warn!("Blacklisting intermediary {}: {}", url, reason);
        self.blacklist.insert(url.to_string(), reason.to_string());
        self.entries.remove(url);
        crate::metrics::record_blacklisted();
    }

    pub fn is_blacklisted(&self, url: &str) -> bool {
        self.blacklist.contains_key(url)
    }

    /// Intermediaries servicing `kind` for `token` with `amount_sats`
    /// inside their advertised bounds
    pub fn candidates(&self, kind: SwapKind, amount_sats: u64, token: &str) -> Vec<Intermediary> {
        self.entries
            .iter()
            .filter(|entry| {
                entry.value().supports(kind, amount_sats)
                    && entry.value().supports_token(kind, token)
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Intermediaries servicing `kind` for `token` at any amount; used
    /// when the fixed side of the request is not the bitcoin side, so
    /// advertised sat bounds cannot apply yet
    pub fn candidates_for_kind(&self, kind: SwapKind, token: &str) -> Vec<Intermediary> {
        self.entries
            .iter()
            .filter(|entry| entry.value().supports_token(kind, token))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Advertised settlement address of `url` on `chain`
    pub fn address_of(&self, url: &str, chain: &str) -> Option<String> {
        self.entries
            .get(url)
            .and_then(|entry| entry.value().address_on(chain).map(String::from))
    }

    /// Widest advertised `min..max` range over every intermediary that
    /// services `kind` at any amount; reported when the requested amount
    /// fits nobody
    pub fn bounds_for(&self, kind: SwapKind) -> Option<(u64, u64)> {
        let mut bounds: Option<(u64, u64)> = None;
        for entry in self.entries.iter() {
            if let Some(service) = entry.value().services.get(&kind) {
                bounds = Some(match bounds {
                    Some((min, max)) => {
                        (min.min(service.min_sats), max.max(service.max_sats))
                    }
                    None => (service.min_sats, service.max_sats),
                });
            }
        }
        bounds
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert an intermediary directly, bypassing discovery
    pub fn insert(&self, intermediary: Intermediary) {
        self.entries
            .insert(intermediary.url.clone(), intermediary);
    }
}
