//! Intermediary HTTP API client
//!
//! Wire format of the intermediary quote endpoints and the registry
//! listing. The trait keeps the race and registry logic off the network
//! in tests.

use crate::contract::InitAuthorization;
use crate::error::{ClientError, ClientResult};
use crate::swap::{EscrowData, SwapFees};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Advertised terms for one swap kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// Smallest bitcoin amount serviced, sats
    pub min_sats: u64,
    /// Largest bitcoin amount serviced, sats
    pub max_sats: u64,
    pub base_fee: u64,
    pub fee_ppm: u64,
    /// Token mints serviced; empty leaves the token set unrestricted
    #[serde(default)]
    pub tokens: Vec<String>,
    /// Last advertised available liquidity, output-asset units
    #[serde(default)]
    pub liquidity: Option<u64>,
}

/// Swap track record an intermediary reports about itself
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reputation {
    pub successes: u64,
    pub failures: u64,
}

/// GET /api/v1/info response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InfoResponse {
    /// Keyed by swap kind tag
    pub services: HashMap<String, ServiceInfo>,
    /// Settlement address per chain tag
    #[serde(default)]
    pub addresses: HashMap<String, String>,
    #[serde(default)]
    pub reputation: Option<Reputation>,
}

/// POST /api/v1/quote request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteRequest {
    /// Swap kind tag
    pub kind: String,
    /// Smart-chain token mint
    pub token: String,
    pub amount: u64,
    pub exact_in: bool,
    /// Destination bitcoin address or bolt11 invoice, for kinds paying
    /// out bitcoin
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

/// POST /api/v1/quote success response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteResponse {
    /// Gross input, input-asset units
    pub amount_in: u64,
    /// Net output, output-asset units
    pub amount_out: u64,
    pub fees: SwapFees,
    /// Unix seconds the quote dies at
    pub quote_expiry: u64,
    /// Escrow terms the intermediary will honor
    pub escrow: EscrowData,
    /// Signed initialization envelope
    pub auth: InitAuthorization,
    /// Bitcoin address to pay into, from-btc on-chain kind
    #[serde(default)]
    pub deposit_address: Option<String>,
    /// Invoice to pay, from-btc lightning kind
    #[serde(default)]
    pub invoice: Option<String>,
    /// Fee rate the intermediary will pay out with, to-btc on-chain kind
    #[serde(default)]
    pub sats_per_vbyte: Option<u64>,
}

/// Error body intermediaries return with a non-success status
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub min: Option<u64>,
    #[serde(default)]
    pub max: Option<u64>,
}

/// Intermediary and registry endpoints used by discovery and quoting
#[async_trait]
pub trait QuoteApi: Send + Sync {
    /// Intermediary URLs listed by a registry
    async fn registry(&self, url: &str) -> ClientResult<Vec<String>>;

    /// Advertised services of one intermediary
    async fn info(&self, url: &str) -> ClientResult<InfoResponse>;

    /// Request a quote from one intermediary
    async fn quote(&self, url: &str, request: &QuoteRequest) -> ClientResult<QuoteResponse>;
}

/// reqwest-backed implementation
pub struct HttpQuoteApi {
    http: reqwest::Client,
}

impl HttpQuoteApi {
    pub fn new(request_timeout: Duration) -> ClientResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self { http })
    }

    fn base(url: &str) -> &str {
        url.trim_end_matches('/')
    }
}

#[async_trait]
impl QuoteApi for HttpQuoteApi {
    async fn registry(&self, url: &str) -> ClientResult<Vec<String>> {
        let resp = self.http.get(Self::base(url)).send().await?;
        if !resp.status().is_success() {
            return Err(ClientError::QuoteInvalid {
                url: url.to_string(),
                message: format!("registry returned status {}", resp.status()),
            });
        }
        let urls: Vec<String> = resp.json().await?;
        Ok(urls)
    }

    async fn info(&self, url: &str) -> ClientResult<InfoResponse> {
        let endpoint = format!("{}/api/v1/info", Self::base(url));
        let resp = self.http.get(&endpoint).send().await?;
        if !resp.status().is_success() {
            return Err(ClientError::QuoteInvalid {
                url: url.to_string(),
                message: format!("info returned status {}", resp.status()),
            });
        }
        // a success response that does not decode violates the protocol
        resp.json().await.map_err(|e| ClientError::ProtocolViolation {
            url: url.to_string(),
            message: format!("undecodable info response: {}", e),
        })
    }

    async fn quote(&self, url: &str, request: &QuoteRequest) -> ClientResult<QuoteResponse> {
        let endpoint = format!("{}/api/v1/quote", Self::base(url));
        let resp = self.http.post(&endpoint).json(request).send().await?;
        let status = resp.status();

        if status.is_success() {
            return resp.json().await.map_err(|e| ClientError::ProtocolViolation {
                url: url.to_string(),
                message: format!("undecodable quote response: {}", e),
            });
        }

        let body = resp.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorBody>(&body) {
            Ok(err) => Err(map_error_body(url, err)),
            Err(_) => Err(ClientError::QuoteInvalid {
                url: url.to_string(),
                message: format!("quote returned status {}", status),
            }),
        }
    }
}

fn map_error_body(url: &str, body: ErrorBody) -> ClientError {
    match body.code.as_str() {
        "out_of_bounds" => ClientError::OutOfBounds {
            min: body.min.unwrap_or(0),
            max: body.max.unwrap_or(u64::MAX),
        },
        "insufficient_liquidity" => ClientError::LiquidityInsufficient {
            url: url.to_string(),
        },
        _ => ClientError::QuoteInvalid {
            url: url.to_string(),
            message: if body.message.is_empty() {
                body.code
            } else {
                body.message
            },
        },
    }
}
