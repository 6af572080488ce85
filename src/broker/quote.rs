//! Quote fan-out race
//!
//! One request goes to every eligible intermediary concurrently. The
//! first valid answer arms a grace window; answers landing inside it
//! still compete, later ones are discarded without cancelling the
//! in-flight requests. A quote that violates the protocol blacklists
//! its intermediary on the spot; out-of-bounds rejections aggregate
//! into the widest serviceable range for the error the caller sees.

use crate::broker::http::{QuoteApi, QuoteRequest, QuoteResponse};
use crate::broker::registry::IntermediaryRegistry;
use crate::cancel::CancelToken;
use crate::contract::{Contract, PriceSource};
use crate::error::{ClientError, ClientResult};
use crate::swap::state::Direction;
use crate::swap::{Hash32, PriceInfo, Swap, SwapKind, SwapPayload};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What the user asked to swap
#[derive(Debug, Clone)]
pub struct QuoteSpec {
    pub kind: SwapKind,
    /// Smart-chain token mint
    pub token: String,
    /// Fixed amount: input units when `exact_in`, output units otherwise
    pub amount: u64,
    pub exact_in: bool,
    /// Destination bitcoin address or bolt11 invoice, required for
    /// kinds paying out bitcoin
    pub destination: Option<String>,
}

impl QuoteSpec {
    /// True when `amount` is denominated in sats; advertised intermediary
    /// bounds only apply then
    pub fn amount_is_sats(&self) -> bool {
        match self.kind.direction() {
            Direction::FromBtc => self.exact_in,
            Direction::ToBtc => !self.exact_in,
        }
    }
}

enum Outcome {
    Valid(String, QuoteResponse, PriceInfo),
    Bounds(u64, u64),
    Skip,
}

/// Fans quote requests out and picks the winner
pub struct QuoteBroker {
    registry: Arc<IntermediaryRegistry>,
    api: Arc<dyn QuoteApi>,
    contract: Arc<dyn Contract>,
    prices: Arc<dyn PriceSource>,
    grace_window: Duration,
    price_tolerance_ppm: u64,
    /// Chain tag selecting the intermediary settlement address the
    /// escrow party is checked against
    chain: String,
}

impl QuoteBroker {
    pub fn new(
        registry: Arc<IntermediaryRegistry>,
        api: Arc<dyn QuoteApi>,
        contract: Arc<dyn Contract>,
        prices: Arc<dyn PriceSource>,
        grace_window: Duration,
        price_tolerance_ppm: u64,
        chain: String,
    ) -> Self {
        Self {
            registry,
            api,
            contract,
            prices,
            grace_window,
            price_tolerance_ppm,
            chain,
        }
    }

    pub fn registry(&self) -> &Arc<IntermediaryRegistry> {
        &self.registry
    }

    /// Run one race and return the winning quote as an untracked swap
    pub async fn best_quote(&self, spec: &QuoteSpec, cancel: CancelToken) -> ClientResult<Swap> {
        let race = Uuid::new_v4();

        let mut candidates = self.candidates(spec);
        if candidates.is_empty() {
            // one re-discovery before giving up
            if let Err(e) = self.registry.refresh().await {
                warn!("Race {}: registry refresh failed: {}", race, e);
            }
            candidates = self.candidates(spec);
        }
        if candidates.is_empty() {
            if let Some((min, max)) = self.registry.bounds_for(spec.kind) {
                return Err(ClientError::OutOfBounds { min, max });
            }
            return Err(ClientError::NoCandidates {
                message: format!("nobody services {} swaps", spec.kind),
            });
        }

        info!(
            "Race {}: quoting {} intermediaries for {} of {} {}",
            race,
            candidates.len(),
            spec.kind,
            spec.amount,
            if spec.exact_in { "in" } else { "out" }
        );

        let request = QuoteRequest {
            kind: spec.kind.as_str().to_string(),
            token: spec.token.clone(),
            amount: spec.amount,
            exact_in: spec.exact_in,
            destination: spec.destination.clone(),
        };
        let started = Instant::now();
        let (tx, mut rx) = mpsc::channel(candidates.len());
        for lp in &candidates {
            crate::metrics::record_quote_requested(spec.kind.as_str());
            let api = Arc::clone(&self.api);
            let url = lp.url.clone();
            let request = request.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = api.quote(&url, &request).await;
                // the race may be over; a closed channel just drops this
                let _ = tx.send((url, result)).await;
            });
        }
        drop(tx);

        let mut best: Option<(String, QuoteResponse, PriceInfo)> = None;
        let mut bounds: Option<(u64, u64)> = None;
        let mut deadline: Option<Instant> = None;

        loop {
            let grace = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now));
            tokio::select! {
                received = rx.recv() => {
                    // channel drains once every candidate answered
                    let (url, result) = match received {
                        Some(pair) => pair,
                        None => break,
                    };
                    crate::metrics::record_quote_latency(
                        spec.kind.as_str(),
                        started.elapsed().as_secs_f64(),
                    );
                    match self.consider(spec, race, url, result).await {
                        Outcome::Valid(url, quote, price) => {
                            let replace = match &best {
                                Some((_, incumbent, _)) => better(spec, incumbent, &quote),
                                None => true,
                            };
                            if replace {
                                best = Some((url, quote, price));
                            }
                            if deadline.is_none() {
                                deadline = Some(Instant::now() + self.grace_window);
                            }
                        }
                        Outcome::Bounds(min, max) => {
                            bounds = Some(match bounds {
                                Some((lo, hi)) => (lo.min(min), hi.max(max)),
                                None => (min, max),
                            });
                        }
                        Outcome::Skip => {}
                    }
                }
                _ = grace, if deadline.is_some() => {
                    debug!("Race {}: grace window closed", race);
                    break;
                }
                _ = cancel.cancelled() => return Err(ClientError::Aborted),
            }
        }

        match best {
            Some((url, quote, price)) => {
                info!(
                    "Race {}: selected {} ({} in, {} out)",
                    race, url, quote.amount_in, quote.amount_out
                );
                self.build_swap(spec, url, quote, price)
            }
            None => match bounds {
                Some((min, max)) => Err(ClientError::OutOfBounds { min, max }),
                None => Err(ClientError::NoCandidates {
                    message: format!("no usable quotes for {}", spec.kind),
                }),
            },
        }
    }

    fn candidates(&self, spec: &QuoteSpec) -> Vec<crate::broker::Intermediary> {
        if spec.amount_is_sats() {
            self.registry.candidates(spec.kind, spec.amount, &spec.token)
        } else {
            self.registry.candidates_for_kind(spec.kind, &spec.token)
        }
    }

    async fn consider(
        &self,
        spec: &QuoteSpec,
        race: Uuid,
        url: String,
        result: ClientResult<QuoteResponse>,
    ) -> Outcome {
        let kind = spec.kind.as_str();
        match result {
            Ok(quote) => match self.validate(spec, &url, &quote).await {
                Ok(price) => {
                    crate::metrics::record_quote_received(kind, "ok");
                    Outcome::Valid(url, quote, price)
                }
                Err(e) if e.blacklists_intermediary() => {
                    crate::metrics::record_quote_received(kind, "protocol_error");
                    self.registry.blacklist(&url, &e.to_string());
                    Outcome::Skip
                }
                Err(e) => {
                    crate::metrics::record_quote_received(kind, "invalid");
                    debug!("Race {}: quote from {} rejected: {}", race, url, e);
                    Outcome::Skip
                }
            },
            Err(ClientError::OutOfBounds { min, max }) => {
                crate::metrics::record_quote_received(kind, "out_of_bounds");
                Outcome::Bounds(min, max)
            }
            Err(e) if e.blacklists_intermediary() => {
                crate::metrics::record_quote_received(kind, "protocol_error");
                self.registry.blacklist(&url, &e.to_string());
                Outcome::Skip
            }
            Err(e) => {
                crate::metrics::record_quote_received(kind, "error");
                debug!("Race {}: {} failed to quote: {}", race, url, e);
                Outcome::Skip
            }
        }
    }

    /// Full quote validation: structural protocol checks, authorization
    /// signature, and the price-tolerance gate. Returns the validated
    /// price snapshot.
    async fn validate(
        &self,
        spec: &QuoteSpec,
        url: &str,
        quote: &QuoteResponse,
    ) -> ClientResult<PriceInfo> {
        let violation = |message: String| ClientError::ProtocolViolation {
            url: url.to_string(),
            message,
        };

        if quote.escrow.claim_hash == Hash32::ZERO {
            return Err(violation("escrow carries a zero claim hash".into()));
        }
        let requested_ok = if spec.exact_in {
            quote.amount_in == spec.amount
        } else {
            quote.amount_out == spec.amount
        };
        if !requested_ok {
            return Err(violation("quoted amounts do not match the request".into()));
        }
        match spec.kind {
            SwapKind::FromBtc if quote.deposit_address.is_none() => {
                return Err(violation("missing deposit address".into()));
            }
            SwapKind::FromBtcLn if quote.invoice.is_none() => {
                return Err(violation("missing invoice".into()));
            }
            _ => {}
        }
        if quote.escrow.token != spec.token {
            return Err(violation("escrow token disagrees with the request".into()));
        }
        // the escrow holds the smart-chain side of the trade
        let escrow_ok = match spec.kind.direction() {
            Direction::ToBtc => quote.escrow.amount == quote.amount_in,
            Direction::FromBtc => quote.escrow.amount == quote.amount_out,
        };
        if !escrow_ok {
            return Err(violation("escrow amount disagrees with the quote".into()));
        }
        // the intermediary side of the escrow must be the address it
        // advertised for this chain; a mismatch means the envelope was
        // signed for somebody else
        if let Some(expected) = self.registry.address_of(url, &self.chain) {
            let party = match spec.kind.direction() {
                Direction::ToBtc => &quote.escrow.claimer,
                Direction::FromBtc => &quote.escrow.offerer,
            };
            if *party != expected {
                return Err(violation(format!(
                    "escrow names party {}, advertised address is {}",
                    party, expected
                )));
            }
        }

        // a bad signature is as disqualifying as a malformed response
        self.contract
            .is_valid_init_authorization(&quote.escrow, &quote.auth)
            .await
            .map_err(|e| match e {
                ClientError::QuoteInvalid { message, .. } => violation(message),
                other => other,
            })?;

        let market = self.prices.market_ppm(&spec.token).await?;
        let without_fee = quote
            .amount_in
            .saturating_sub(quote.fees.total_for(quote.amount_in));
        let mut price = PriceInfo::new(without_fee, quote.amount_out);
        if !price.revalidate(market, self.price_tolerance_ppm) {
            return Err(ClientError::QuoteInvalid {
                url: url.to_string(),
                message: format!(
                    "price {} ppm outside tolerance of market {} ppm",
                    price.swap_ppm, market
                ),
            });
        }
        Ok(price)
    }

    fn build_swap(
        &self,
        spec: &QuoteSpec,
        url: String,
        quote: QuoteResponse,
        price: PriceInfo,
    ) -> ClientResult<Swap> {
        let payload = match spec.kind {
            SwapKind::ToBtc => SwapPayload::ToBtc {
                address: spec
                    .destination
                    .clone()
                    .ok_or_else(|| ClientError::Internal("destination address required".into()))?,
                amount_sats: quote.amount_out,
                sats_per_vbyte: quote.sats_per_vbyte.unwrap_or(1),
                payment_txid: None,
            },
            SwapKind::ToBtcLn => SwapPayload::ToBtcLn {
                invoice: spec
                    .destination
                    .clone()
                    .ok_or_else(|| ClientError::Internal("destination invoice required".into()))?,
                payment_hash: quote.escrow.claim_hash,
                amount_sats: quote.amount_out,
                preimage: None,
            },
            SwapKind::FromBtc => SwapPayload::FromBtc {
                deposit_address: quote
                    .deposit_address
                    .clone()
                    .ok_or_else(|| ClientError::Internal("deposit address vanished".into()))?,
                amount_sats: quote.amount_in,
                deposit_txid: None,
                deposit_vout: None,
            },
            SwapKind::FromBtcLn => SwapPayload::FromBtcLn {
                invoice: quote
                    .invoice
                    .clone()
                    .ok_or_else(|| ClientError::Internal("invoice vanished".into()))?,
                payment_hash: quote.escrow.claim_hash,
                amount_sats: quote.amount_in,
                preimage: None,
            },
        };

        Ok(Swap::new(
            payload,
            quote.escrow,
            quote.auth,
            quote.fees,
            price,
            url,
            quote.quote_expiry,
            spec.exact_in,
            rand::random(),
        ))
    }
}

/// Quote comparison: exact-in maximizes output, exact-out minimizes
/// input. Ties keep the incumbent, so the earlier answer wins.
fn better(spec: &QuoteSpec, incumbent: &QuoteResponse, challenger: &QuoteResponse) -> bool {
    if spec.exact_in {
        challenger.amount_out > incumbent.amount_out
    } else {
        challenger.amount_in < incumbent.amount_in
    }
}
