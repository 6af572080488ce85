//! Top-level client assembly
//!
//! `SwapClient` wires the whole orchestration stack together: the swap
//! store, one wrapper per swap kind, the escrow event listener, the
//! quote broker and the optional bitcoin relay synchronizer. Embedding
//! applications construct it from [`Settings`] plus their chain
//! collaborators, call [`SwapClient::start`] once, and drive swaps
//! through the entry operations below.

use crate::backoff::{self, BackoffConfig};
use crate::broker::{HttpQuoteApi, IntermediaryRegistry, QuoteBroker, QuoteSpec};
use crate::cancel::{cancel_pair, CancelHandle, CancelToken};
use crate::config::Settings;
use crate::contract::{ChainEvents, ClaimProof, Contract, PriceSource};
use crate::error::{ClientError, ClientResult};
use crate::events::EventListener;
use crate::metrics;
use crate::relay::headers::{hash_from_display_hex, merkle_root_from_path};
use crate::relay::{BitcoinSource, BtcRelay, EsploraSource, RelaySynchronizer};
use crate::storage::{SqliteStore, SwapStore};
use crate::swap::state::SwapState;
use crate::swap::{Swap, SwapId, SwapKind, SwapPayload};
use crate::watchdog;
use crate::wrapper::{SwapChange, SwapWrapper};

use chrono::Utc;
use futures::future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Install the global tracing subscriber. Embedding binaries call this
/// once at startup; `RUST_LOG` overrides the default filter.
pub fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,btcswap_client=debug,sqlx=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

/// Chain-side collaborators the embedding application supplies
pub struct Collaborators {
    /// Smart-chain escrow program binding
    pub contract: Arc<dyn Contract>,
    /// Live escrow event feed from the same chain
    pub events: Arc<dyn ChainEvents>,
    /// Market price oracle backing quote validation
    pub prices: Arc<dyn PriceSource>,
    /// Bitcoin chain source; `None` builds an esplora client from the
    /// configuration
    pub bitcoin: Option<Arc<dyn BitcoinSource>>,
    /// On-chain header relay binding. Without one, on-chain receiving
    /// swaps cannot assemble claim proofs.
    pub relay: Option<Arc<dyn BtcRelay>>,
}

/// The assembled swap client
pub struct SwapClient {
    settings: Settings,
    store: Arc<dyn SwapStore>,
    events: Arc<dyn ChainEvents>,
    bitcoin: Arc<dyn BitcoinSource>,
    /// One wrapper per kind, in `SwapKind::ALL` order
    wrappers: Vec<Arc<SwapWrapper>>,
    broker: QuoteBroker,
    synchronizer: Option<Arc<RelaySynchronizer>>,
    change_tx: broadcast::Sender<SwapChange>,
    backoff: BackoffConfig,
    cancel: CancelHandle,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SwapClient {
    /// Connect the configured sqlite store and assemble every
    /// subsystem. Background tasks only start in [`start`].
    pub async fn new(settings: Settings, collaborators: Collaborators) -> ClientResult<Self> {
        let store: Arc<dyn SwapStore> = Arc::new(
            SqliteStore::connect(&settings.storage.url, settings.storage.max_connections).await?,
        );
        info!("Swap store connected at {}", settings.storage.url);
        Self::with_store(settings, collaborators, store)
    }

    /// Assemble on an existing store, for embedders sharing a pool or
    /// keeping swaps in memory
    pub fn with_store(
        settings: Settings,
        collaborators: Collaborators,
        store: Arc<dyn SwapStore>,
    ) -> ClientResult<Self> {
        let Collaborators {
            contract,
            events,
            prices,
            bitcoin,
            relay,
        } = collaborators;
        let backoff = BackoffConfig::from(&settings.client);
        let (change_tx, _) = broadcast::channel(256);

        let wrappers: Vec<Arc<SwapWrapper>> = SwapKind::ALL
            .iter()
            .map(|kind| {
                Arc::new(SwapWrapper::new(
                    *kind,
                    contract.clone(),
                    prices.clone(),
                    store.clone(),
                    change_tx.clone(),
                    backoff.clone(),
                    settings.broker.price_tolerance_ppm,
                ))
            })
            .collect();

        let api = Arc::new(HttpQuoteApi::new(Duration::from_millis(
            settings.broker.request_timeout_ms,
        ))?);
        let registry = Arc::new(IntermediaryRegistry::new(api.clone(), &settings.broker));
        let broker = QuoteBroker::new(
            registry,
            api,
            contract,
            prices,
            Duration::from_millis(settings.broker.grace_window_ms),
            settings.broker.price_tolerance_ppm,
            settings.broker.chain.clone(),
        );

        let bitcoin: Arc<dyn BitcoinSource> = match bitcoin {
            Some(source) => source,
            None => Arc::new(EsploraSource::new(&settings.bitcoin)?),
        };
        let synchronizer = relay.map(|relay| {
            Arc::new(RelaySynchronizer::new(
                bitcoin.clone(),
                relay,
                &settings.relay,
                backoff.clone(),
            ))
        });

        let (cancel, _) = cancel_pair();
        Ok(Self {
            settings,
            store,
            events,
            bitcoin,
            wrappers,
            broker,
            synchronizer,
            change_tx,
            backoff,
            cancel,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Revive persisted swaps, run intermediary discovery once, and
    /// launch the background tasks: escrow event intake, the advisory
    /// deadline ticker, and relay synchronization when a relay binding
    /// exists
    pub async fn start(&self) -> ClientResult<()> {
        let counts =
            future::try_join_all(self.wrappers.iter().map(|wrapper| wrapper.recover())).await?;
        let revived: usize = counts.into_iter().sum();
        if revived > 0 {
            info!("Recovered {} swaps from storage", revived);
        }

        if let Err(e) = self.broker.registry().refresh().await {
            warn!("Initial intermediary discovery failed: {}", e);
        }

        let mut tasks = self.tasks.lock().await;

        tasks.push(tokio::spawn({
            let listener = EventListener::new(self.wrappers.clone(), self.store.clone());
            let events = self.events.clone();
            let token = self.cancel.token();
            async move {
                listener.run(events, token).await;
            }
        }));

        tasks.push(tokio::spawn({
            let wrappers = self.wrappers.clone();
            let tick = Duration::from_millis(self.settings.client.expiry_tick_ms);
            let soft_margin_secs = self.settings.client.soft_expiry_margin_secs;
            let gauges = self.settings.metrics.enabled;
            let token = self.cancel.token();
            async move {
                deadline_loop(wrappers, tick, soft_margin_secs, gauges, token).await;
            }
        }));

        if let Some(synchronizer) = &self.synchronizer {
            tasks.push(tokio::spawn({
                let synchronizer = synchronizer.clone();
                let pause = Duration::from_secs(self.settings.relay.sync_interval_secs);
                let token = self.cancel.token();
                async move {
                    relay_loop(synchronizer, pause, token).await;
                }
            }));
        }

        info!("Swap client started");
        Ok(())
    }

    /// Stop every background task. Tasks honor the cancel token; any
    /// that lag past the grace period are aborted.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for mut task in tasks {
            if tokio::time::timeout(Duration::from_secs(5), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
        info!("Swap client stopped");
    }

    /// Race the intermediaries for a quote and start tracking the
    /// winner. The returned swap is in its created state; `commit`
    /// locks the escrow on chain.
    pub async fn create_swap(&self, spec: QuoteSpec, cancel: CancelToken) -> ClientResult<Swap> {
        let swap = self.broker.best_quote(&spec, cancel).await?;
        self.wrapper(spec.kind).track(swap.clone()).await?;
        Ok(swap)
    }

    /// The wrapper tracking `kind` swaps
    pub fn wrapper(&self, kind: SwapKind) -> &Arc<SwapWrapper> {
        // construction makes one wrapper per SwapKind::ALL entry, so
        // the scan always hits
        self.wrappers
            .iter()
            .find(|wrapper| wrapper.kind() == kind)
            .unwrap_or(&self.wrappers[0])
    }

    pub fn get(&self, id: &SwapId) -> Option<Swap> {
        self.wrappers.iter().find_map(|wrapper| wrapper.get(id))
    }

    pub fn all(&self) -> Vec<Swap> {
        self.wrappers
            .iter()
            .flat_map(|wrapper| wrapper.all())
            .collect()
    }

    /// State changes across every wrapper, one stream
    pub fn subscribe(&self) -> broadcast::Receiver<SwapChange> {
        self.change_tx.subscribe()
    }

    /// Re-run intermediary discovery now; returns the number of known
    /// intermediaries afterwards
    pub async fn refresh_intermediaries(&self) -> ClientResult<usize> {
        self.broker.registry().refresh().await
    }

    /// Commit the escrow for a created swap
    pub async fn commit(&self, id: &SwapId) -> ClientResult<String> {
        self.owning(id)?.commit(id).await
    }

    /// Refund an expired outgoing escrow
    pub async fn refund(&self, id: &SwapId) -> ClientResult<String> {
        self.owning(id)?.refund(id).await
    }

    /// External signal that the bitcoin leg of a receiving swap settled
    pub async fn mark_payment_received(
        &self,
        id: &SwapId,
        txid: Option<String>,
        vout: Option<u32>,
    ) -> ClientResult<bool> {
        self.owning(id)?.mark_payment_received(id, txid, vout).await
    }

    /// External signal that the lightning invoice of a receiving swap
    /// settled, carrying the preimage the wallet returned
    pub async fn mark_invoice_paid(&self, id: &SwapId, preimage: String) -> ClientResult<bool> {
        self.owning(id)?.mark_invoice_paid(id, preimage).await
    }

    /// Claim a receiving swap. Lightning swaps claim with the learned
    /// preimage; on-chain swaps claim with an SPV proof of the deposit,
    /// assembled after the relay has been synchronized past its block.
    pub async fn claim(&self, id: &SwapId, cancel: CancelToken) -> ClientResult<String> {
        let wrapper = self.owning(id)?;
        let swap = wrapper.get(id).ok_or_else(|| ClientError::SwapNotFound {
            swap_id: id.to_string(),
        })?;
        let proof = self.claim_proof(&swap, cancel).await?;
        wrapper.claim(id, &proof).await
    }

    /// Wait until the swap leaves its pre-commit phase
    pub async fn wait_for_commit(
        &self,
        id: &SwapId,
        cancel: CancelToken,
    ) -> ClientResult<SwapState> {
        let poll = Duration::from_millis(self.settings.client.watchdog_poll_ms);
        watchdog::wait_for_commit(self.owning(id)?, id, poll, cancel).await
    }

    /// Wait until the counterparty settled or a local claim/refund is
    /// owed
    pub async fn wait_for_settlement(
        &self,
        id: &SwapId,
        cancel: CancelToken,
    ) -> ClientResult<SwapState> {
        let poll = Duration::from_millis(self.settings.client.watchdog_poll_ms);
        watchdog::wait_for_settlement(self.owning(id)?, id, poll, cancel).await
    }

    fn owning(&self, id: &SwapId) -> ClientResult<&Arc<SwapWrapper>> {
        self.wrappers
            .iter()
            .find(|wrapper| wrapper.get(id).is_some())
            .ok_or_else(|| ClientError::SwapNotFound {
                swap_id: id.to_string(),
            })
    }

    async fn claim_proof(&self, swap: &Swap, cancel: CancelToken) -> ClientResult<ClaimProof> {
        match &swap.payload {
            SwapPayload::FromBtcLn { preimage, .. } => {
                let preimage = preimage.clone().ok_or_else(|| ClientError::WrongState {
                    swap_id: swap.id.to_string(),
                    action: "claim before the payment preimage is known".into(),
                })?;
                Ok(ClaimProof::Preimage { preimage })
            }
            SwapPayload::FromBtc { deposit_txid, .. } => {
                let txid = deposit_txid.clone().ok_or_else(|| ClientError::WrongState {
                    swap_id: swap.id.to_string(),
                    action: "claim before the deposit is seen".into(),
                })?;
                self.chain_claim_proof(swap, &txid, cancel).await
            }
            _ => Err(ClientError::WrongState {
                swap_id: swap.id.to_string(),
                action: "claim".into(),
            }),
        }
    }

    /// Assemble the SPV proof for a confirmed deposit: fetch the merkle
    /// path, check it against the block header locally, bring the relay
    /// up past the confirmation height, and ship the raw transaction
    async fn chain_claim_proof(
        &self,
        swap: &Swap,
        txid: &str,
        cancel: CancelToken,
    ) -> ClientResult<ClaimProof> {
        let synchronizer = self
            .synchronizer
            .as_ref()
            .ok_or_else(|| ClientError::Config("on-chain claims need a relay binding".into()))?;

        let bitcoin = &self.bitcoin;
        let proof = backoff::retry("fetch merkle proof", &self.backoff, || {
            bitcoin.merkle_proof(txid)
        })
        .await?;
        let headers = backoff::retry("fetch deposit header", &self.backoff, || {
            bitcoin.headers(proof.block_height, 1)
        })
        .await?;
        let header = headers.first().ok_or_else(|| ClientError::ChainQuery {
            message: format!("source lost the block at height {}", proof.block_height),
        })?;

        // check the path locally before paying for a claim transaction
        let leaf = hash_from_display_hex(txid)?;
        let root = merkle_root_from_path(&leaf, &proof.merkle, proof.position);
        if root != header.merkle_root {
            return Err(ClientError::ChainQuery {
                message: format!(
                    "merkle path for {} does not match block {}",
                    txid, proof.block_height
                ),
            });
        }

        let required = proof.block_height + u64::from(swap.escrow.confirmations.max(1)) - 1;
        synchronizer.ensure_height(required, cancel).await?;

        let raw_hex =
            backoff::retry("fetch raw transaction", &self.backoff, || bitcoin.tx_hex(txid)).await?;
        let raw_tx = hex::decode(raw_hex.trim()).map_err(|e| ClientError::ChainQuery {
            message: format!("source returned an undecodable raw tx: {}", e),
        })?;

        Ok(ClaimProof::BitcoinTx {
            txid: txid.to_string(),
            raw_tx,
            block_height: proof.block_height,
            merkle: proof.merkle,
            position: proof.position,
        })
    }
}

/// Periodic advisory sweep: quote expiries, soft-expiry marks, terminal
/// record cleanup, active-swap gauges
async fn deadline_loop(
    wrappers: Vec<Arc<SwapWrapper>>,
    tick: Duration,
    soft_margin_secs: u64,
    gauges: bool,
    cancel: CancelToken,
) {
    let mut ticker = tokio::time::interval(tick);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Utc::now().timestamp().max(0) as u64;
                for wrapper in &wrappers {
                    if let Err(e) = wrapper.tick_deadlines(now, soft_margin_secs).await {
                        warn!("Deadline sweep for {} swaps failed: {}", wrapper.kind(), e);
                    }
                    if gauges {
                        metrics::record_active_swaps(
                            wrapper.kind().as_str(),
                            wrapper.active_count(),
                        );
                    }
                }
            }
            _ = cancel.cancelled() => {
                debug!("Deadline ticker stopped");
                return;
            }
        }
    }
}

async fn relay_loop(synchronizer: Arc<RelaySynchronizer>, pause: Duration, cancel: CancelToken) {
    loop {
        match synchronizer.sync_to_tip(cancel.clone()).await {
            Ok(height) => debug!("Relay synchronized at height {}", height),
            Err(ClientError::Aborted) => {
                debug!("Relay synchronization stopped");
                return;
            }
            Err(e) if e.is_fatal() => {
                error!("Relay synchronization failed: {}", e);
                return;
            }
            Err(e) => warn!("Relay synchronization pass failed: {}", e),
        }
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = cancel.cancelled() => {
                debug!("Relay synchronization stopped");
                return;
            }
        }
    }
}
