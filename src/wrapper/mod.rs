//! Per-kind swap collections and lifecycle reconciliation
//!
//! A `SwapWrapper` owns every tracked swap of one kind:
//! 1. Mirrors every externally visible change to storage before
//!    returning to the caller
//! 2. Broadcasts state changes for watchdogs and embedders
//! 3. Applies escrow events and authoritative commit-status checks
//! 4. Revives and reconciles its swaps from storage after a restart

pub mod reconcile;

pub use reconcile::{derived_target, transition_path};

use crate::backoff::{self, BackoffConfig};
use crate::contract::{ClaimProof, CommitStatus, Contract, EscrowEvent, PriceSource};
use crate::error::{ClientError, ClientResult};
use crate::storage::{QueryClause, SwapStore};
use crate::swap::state::{Direction, FromBtcState, StateGroup, SwapState, ToBtcState};
use crate::swap::{migrate, EscrowData, EscrowId, Swap, SwapId, SwapKind, SwapPayload};

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// State-change notification, broadcast on every externally visible
/// transition (and on field updates that get persisted)
#[derive(Debug, Clone)]
pub struct SwapChange {
    pub id: SwapId,
    pub kind: SwapKind,
    pub state: SwapState,
}

/// Collection of live swaps of one kind
pub struct SwapWrapper {
    kind: SwapKind,
    /// Live swaps by id
    swaps: DashMap<SwapId, Swap>,
    /// Escrow identifier to swap id, for event resolution
    by_escrow: DashMap<EscrowId, SwapId>,
    contract: Arc<dyn Contract>,
    prices: Arc<dyn PriceSource>,
    store: Arc<dyn SwapStore>,
    change_tx: broadcast::Sender<SwapChange>,
    backoff: BackoffConfig,
    price_tolerance_ppm: u64,
}

impl SwapWrapper {
    pub fn new(
        kind: SwapKind,
        contract: Arc<dyn Contract>,
        prices: Arc<dyn PriceSource>,
        store: Arc<dyn SwapStore>,
        change_tx: broadcast::Sender<SwapChange>,
        backoff: BackoffConfig,
        price_tolerance_ppm: u64,
    ) -> Self {
        Self {
            kind,
            swaps: DashMap::new(),
            by_escrow: DashMap::new(),
            contract,
            prices,
            store,
            change_tx,
            backoff,
            price_tolerance_ppm,
        }
    }

    pub fn kind(&self) -> SwapKind {
        self.kind
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwapChange> {
        self.change_tx.subscribe()
    }

    pub fn get(&self, id: &SwapId) -> Option<Swap> {
        self.swaps.get(id).map(|s| s.clone())
    }

    pub fn all(&self) -> Vec<Swap> {
        self.swaps.iter().map(|e| e.value().clone()).collect()
    }

    pub fn find_by_escrow(&self, escrow_id: &EscrowId) -> Option<SwapId> {
        self.by_escrow.get(escrow_id).map(|e| *e.value())
    }

    pub fn active_count(&self) -> usize {
        self.swaps.iter().filter(|e| !e.value().is_terminal()).count()
    }

    /// Start tracking a freshly created swap: index, persist, notify
    pub async fn track(&self, swap: Swap) -> ClientResult<()> {
        if swap.kind() != self.kind {
            return Err(ClientError::Internal(format!(
                "swap {} is {} but this wrapper handles {}",
                swap.id,
                swap.kind(),
                self.kind
            )));
        }

        let record = swap.to_record()?;
        let change = SwapChange {
            id: swap.id,
            kind: self.kind,
            state: swap.state,
        };
        self.by_escrow.insert(swap.escrow_id(), swap.id);
        self.swaps.insert(swap.id, swap);

        self.store.save(&record).await?;
        let _ = self.change_tx.send(change);
        crate::metrics::record_active_swaps(self.kind.as_str(), self.active_count());
        info!("Tracking new {} swap {}", self.kind, record.id);
        Ok(())
    }

    /// Mutate one swap under its map entry, then persist and notify if
    /// the closure reports a visible change. The entry guard is dropped
    /// before any await.
    async fn mutate<F>(&self, id: &SwapId, f: F) -> ClientResult<bool>
    where
        F: FnOnce(&mut Swap) -> ClientResult<bool>,
    {
        let snapshot = {
            let mut entry = self
                .swaps
                .get_mut(id)
                .ok_or_else(|| ClientError::SwapNotFound {
                    swap_id: id.to_string(),
                })?;
            if !f(entry.value_mut())? {
                return Ok(false);
            }
            entry.value().clone()
        };

        self.store.save(&snapshot.to_record()?).await?;
        let _ = self.change_tx.send(SwapChange {
            id: *id,
            kind: self.kind,
            state: snapshot.state,
        });
        Ok(true)
    }

    /// Apply one state transition; `Ok(false)` when already there
    pub async fn transition(&self, id: &SwapId, target: SwapState) -> ClientResult<bool> {
        let changed = self.mutate(id, |swap| swap.transition_to(target)).await?;
        if changed {
            crate::metrics::record_transition(self.kind.as_str(), target.as_str());
            debug!("Swap {} moved to {}", id, target);
        }
        Ok(changed)
    }

    /// Walk the swap to `target` through every legal intermediate
    /// state, persisting and notifying each hop
    pub async fn apply_derived(&self, id: &SwapId, target: SwapState) -> ClientResult<()> {
        let Some(current) = self.get(id).map(|s| s.state) else {
            return Ok(());
        };
        let Some(path) = transition_path(current, target) else {
            debug!(
                "Swap {} cannot reach {} from {}, leaving as is",
                id, target, current
            );
            return Ok(());
        };
        for step in path {
            match self.transition(id, step).await {
                Ok(_) => {}
                Err(ClientError::InvalidTransition { .. }) => {
                    // a concurrent actor moved the swap elsewhere
                    debug!("Swap {} diverged while walking to {}", id, target);
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// One authoritative poll: fetch commit status, derive and apply
    /// the implied transition, return the (possibly new) state
    pub async fn reconcile_with_chain(&self, id: &SwapId) -> ClientResult<SwapState> {
        let swap = self.get(id).ok_or_else(|| ClientError::SwapNotFound {
            swap_id: id.to_string(),
        })?;
        if swap.is_terminal() {
            return Ok(swap.state);
        }

        crate::metrics::record_commit_status_poll();
        let status = backoff::retry("commit_status", &self.backoff, || async {
            self.contract.commit_status(&swap.escrow).await
        })
        .await?;

        let auth_expired = if swap.state_group() == StateGroup::PreCommit
            && status == CommitStatus::NotCommitted
        {
            self.contract
                .is_init_authorization_expired(&swap.escrow, &swap.auth)
                .await?
        } else {
            false
        };

        if let Some(target) = derived_target(&swap, status, auth_expired) {
            self.apply_derived(id, target).await?;
        }
        Ok(self.get(id).map(|s| s.state).unwrap_or(swap.state))
    }

    /// Apply one escrow event observed on chain. Events are re-delivered
    /// at least once; everything here is idempotent.
    pub async fn apply_event(&self, id: &SwapId, event: &EscrowEvent) -> ClientResult<()> {
        let Some(swap) = self.get(id) else {
            return Ok(());
        };
        if event.sequence() != swap.escrow.sequence {
            debug!(
                "Ignoring {} event with sequence {} for swap {} (expected {})",
                event.name(),
                event.sequence(),
                id,
                swap.escrow.sequence
            );
            return Ok(());
        }
        crate::metrics::record_chain_event(event.name());

        match event {
            EscrowEvent::Initialize { txid, .. } => {
                let txid = txid.clone();
                self.mutate(id, move |s| {
                    if s.commit_txid.as_deref() == Some(txid.as_str()) {
                        return Ok(false);
                    }
                    s.commit_txid = Some(txid);
                    Ok(true)
                })
                .await?;
                self.apply_derived(id, committed_state(swap.direction())).await
            }
            EscrowEvent::Claim { txid, witness, .. } => {
                let txid = txid.clone();
                let preimage = extract_preimage(&swap.payload, witness);
                self.mutate(id, move |s| {
                    let mut changed = false;
                    if s.claim_txid.as_deref() != Some(txid.as_str()) {
                        s.claim_txid = Some(txid);
                        changed = true;
                    }
                    if let Some(secret) = preimage {
                        changed |= set_preimage(&mut s.payload, secret);
                    }
                    Ok(changed)
                })
                .await?;
                self.apply_derived(id, claimed_state(swap.direction())).await
            }
            EscrowEvent::Refund { txid, .. } => {
                let txid = txid.clone();
                self.mutate(id, move |s| {
                    if s.refund_txid.as_deref() == Some(txid.as_str()) {
                        return Ok(false);
                    }
                    s.refund_txid = Some(txid);
                    Ok(true)
                })
                .await?;
                let target = match swap.direction() {
                    Direction::ToBtc => SwapState::ToBtc(ToBtcState::Refunded),
                    // the intermediary reclaimed an escrow we never paid
                    Direction::FromBtc => SwapState::FromBtc(FromBtcState::QuoteExpired),
                };
                self.apply_derived(id, target).await
            }
        }
    }

    /// Commit the escrow on chain. Only swaps paying out bitcoin commit
    /// locally; receiving-side escrows are committed by the intermediary.
    pub async fn commit(&self, id: &SwapId) -> ClientResult<String> {
        let swap = self.get(id).ok_or_else(|| ClientError::SwapNotFound {
            swap_id: id.to_string(),
        })?;
        if swap.direction() != Direction::ToBtc {
            return Err(ClientError::WrongState {
                swap_id: id.to_string(),
                action: "commit".into(),
            });
        }
        if swap.state_group() != StateGroup::PreCommit {
            return Err(ClientError::WrongState {
                swap_id: id.to_string(),
                action: "commit".into(),
            });
        }

        // revalidate before spending gas on it
        if self
            .contract
            .is_init_authorization_expired(&swap.escrow, &swap.auth)
            .await?
        {
            return Err(ClientError::AuthorizationExpired {
                swap_id: id.to_string(),
            });
        }
        self.contract
            .is_valid_init_authorization(&swap.escrow, &swap.auth)
            .await?;

        // a soft-expired swap that just proved valid returns to Created
        if swap.state == SwapState::ToBtc(ToBtcState::QuoteSoftExpired) {
            self.transition(id, SwapState::ToBtc(ToBtcState::Created)).await?;
        }

        let txs = self.contract.txs_init(&swap.escrow, &swap.auth).await?;
        let txids = self.contract.send(txs).await?;
        let txid = txids
            .last()
            .cloned()
            .ok_or_else(|| ClientError::Internal("contract returned no commit txid".into()))?;

        let stored = txid.clone();
        self.mutate(id, move |s| {
            s.commit_txid = Some(stored);
            Ok(true)
        })
        .await?;
        info!("Committed swap {} in {}", id, txid);
        Ok(txid)
    }

    /// Claim a committed receiving-side escrow with `proof`
    pub async fn claim(&self, id: &SwapId, proof: &ClaimProof) -> ClientResult<String> {
        let swap = self.get(id).ok_or_else(|| ClientError::SwapNotFound {
            swap_id: id.to_string(),
        })?;
        let claimable = swap.direction() == Direction::FromBtc
            && matches!(
                swap.state_group(),
                StateGroup::Committed | StateGroup::ActionRequired
            );
        if !claimable {
            return Err(ClientError::WrongState {
                swap_id: id.to_string(),
                action: "claim".into(),
            });
        }

        let txs = self.contract.txs_claim(&swap.escrow, proof).await?;
        let txids = self.contract.send(txs).await?;
        let txid = txids
            .last()
            .cloned()
            .ok_or_else(|| ClientError::Internal("contract returned no claim txid".into()))?;

        let stored = txid.clone();
        self.mutate(id, move |s| {
            s.claim_txid = Some(stored);
            Ok(true)
        })
        .await?;
        info!("Claim for swap {} sent in {}", id, txid);
        Ok(txid)
    }

    /// Refund an expired outgoing escrow back to us
    pub async fn refund(&self, id: &SwapId) -> ClientResult<String> {
        let swap = self.get(id).ok_or_else(|| ClientError::SwapNotFound {
            swap_id: id.to_string(),
        })?;
        if swap.state != SwapState::ToBtc(ToBtcState::Refundable) {
            return Err(ClientError::WrongState {
                swap_id: id.to_string(),
                action: "refund".into(),
            });
        }

        let txs = self.contract.txs_refund(&swap.escrow).await?;
        let txids = self.contract.send(txs).await?;
        let txid = txids
            .last()
            .cloned()
            .ok_or_else(|| ClientError::Internal("contract returned no refund txid".into()))?;

        let stored = txid.clone();
        self.mutate(id, move |s| {
            s.refund_txid = Some(stored);
            Ok(true)
        })
        .await?;
        info!("Refund for swap {} sent in {}", id, txid);
        Ok(txid)
    }

    /// External signal that the bitcoin leg of a receiving swap settled
    /// (deposit confirmed, or lightning invoice paid)
    pub async fn mark_payment_received(
        &self,
        id: &SwapId,
        txid: Option<String>,
        vout: Option<u32>,
    ) -> ClientResult<bool> {
        let swap = self.get(id).ok_or_else(|| ClientError::SwapNotFound {
            swap_id: id.to_string(),
        })?;
        if swap.direction() != Direction::FromBtc {
            return Err(ClientError::WrongState {
                swap_id: id.to_string(),
                action: "mark_payment_received".into(),
            });
        }

        self.mutate(id, move |s| {
            let mut changed = false;
            if let SwapPayload::FromBtc {
                deposit_txid,
                deposit_vout,
                ..
            } = &mut s.payload
            {
                if txid.is_some() && *deposit_txid != txid {
                    *deposit_txid = txid;
                    changed = true;
                }
                if vout.is_some() && *deposit_vout != vout {
                    *deposit_vout = vout;
                    changed = true;
                }
            }
            match s.transition_to(SwapState::FromBtc(FromBtcState::PaymentReceived)) {
                Ok(c) => Ok(changed | c),
                Err(_) if changed => Ok(true),
                Err(e) => Err(e),
            }
        })
        .await
    }

    /// External signal that the lightning invoice of a receiving swap
    /// settled; `preimage` is the payment receipt the wallet returned
    /// and later becomes the claim proof
    pub async fn mark_invoice_paid(&self, id: &SwapId, preimage: String) -> ClientResult<bool> {
        let swap = self.get(id).ok_or_else(|| ClientError::SwapNotFound {
            swap_id: id.to_string(),
        })?;
        if !matches!(swap.payload, SwapPayload::FromBtcLn { .. }) {
            return Err(ClientError::WrongState {
                swap_id: id.to_string(),
                action: "mark_invoice_paid".into(),
            });
        }

        self.mutate(id, move |s| {
            let changed = set_preimage(&mut s.payload, preimage);
            match s.transition_to(SwapState::FromBtc(FromBtcState::PaymentReceived)) {
                Ok(c) => Ok(changed | c),
                Err(_) if changed => Ok(true),
                Err(e) => Err(e),
            }
        })
        .await
    }

    /// Re-check the quoted price against the market
    pub async fn refresh_price(&self, id: &SwapId) -> ClientResult<bool> {
        let swap = self.get(id).ok_or_else(|| ClientError::SwapNotFound {
            swap_id: id.to_string(),
        })?;
        let market = self.prices.market_ppm(&swap.escrow.token).await?;
        let tolerance = self.price_tolerance_ppm;
        self.mutate(id, move |s| {
            let before = s.price;
            s.price.revalidate(market, tolerance);
            Ok(s.price != before)
        })
        .await?;
        Ok(self.get(id).map(|s| s.price.valid).unwrap_or(false))
    }

    /// Take over a stored record this process never tracked; used when
    /// an event arrives for a swap that recovery did not see (another
    /// client instance sharing the store, or a track racing dispatch)
    pub async fn adopt_record(
        &self,
        record: &crate::swap::SwapRecord,
    ) -> ClientResult<Option<SwapId>> {
        let Some(swap) = migrate::revive(record)? else {
            return Ok(None);
        };
        if swap.kind() != self.kind {
            return Ok(None);
        }
        let id = swap.id;
        self.by_escrow.insert(swap.escrow_id(), id);
        self.swaps.insert(id, swap);
        crate::metrics::record_active_swaps(self.kind.as_str(), self.active_count());
        debug!("Adopted stored {} swap {}", self.kind, id);
        Ok(Some(id))
    }

    /// Revive this wrapper's swaps from storage and reconcile them with
    /// chain truth; called once at startup
    pub async fn recover(&self) -> ClientResult<usize> {
        let records = self
            .store
            .query(&[QueryClause::Active, QueryClause::Kind(self.kind)])
            .await?;

        let mut revived = 0;
        let mut rewritten: Vec<crate::swap::SwapRecord> = Vec::new();
        for record in &records {
            match migrate::revive(record) {
                Ok(Some(swap)) => {
                    if record.version < migrate::CURRENT_VERSION {
                        match swap.to_record() {
                            Ok(fresh) => rewritten.push(fresh),
                            Err(e) => warn!("Could not re-encode migrated swap {}: {}", swap.id, e),
                        }
                    }
                    self.by_escrow.insert(swap.escrow_id(), swap.id);
                    self.swaps.insert(swap.id, swap);
                    crate::metrics::record_recovered(self.kind.as_str());
                    revived += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Could not revive swap record {}: {}", record.id, e);
                }
            }
        }

        // migrated documents go back at the current version so the next
        // start skips the upgrade
        if !rewritten.is_empty() {
            if let Err(e) = self.store.save_all(&rewritten).await {
                warn!("Could not rewrite {} migrated records: {}", rewritten.len(), e);
            }
        }

        // partition: swaps we initiated need a commit status check;
        // uncommitted quotes need an authorization expiry check first
        let mut status_batch: Vec<Swap> = Vec::new();
        let mut expiry_candidates: Vec<Swap> = Vec::new();
        for entry in self.swaps.iter() {
            let swap = entry.value();
            if swap.is_terminal() {
                continue;
            }
            let initiated = swap.commit_txid.is_some()
                || matches!(
                    swap.state_group(),
                    StateGroup::Committed | StateGroup::ActionRequired
                );
            if initiated {
                status_batch.push(swap.clone());
            } else {
                expiry_candidates.push(swap.clone());
            }
        }

        let mut expired_auth: HashSet<SwapId> = HashSet::new();
        for swap in expiry_candidates {
            if self
                .contract
                .is_init_authorization_expired(&swap.escrow, &swap.auth)
                .await?
            {
                expired_auth.insert(swap.id);
                status_batch.push(swap);
            }
        }

        if !status_batch.is_empty() {
            let escrows: Vec<EscrowData> =
                status_batch.iter().map(|s| s.escrow.clone()).collect();
            let statuses = backoff::retry("commit_statuses", &self.backoff, || async {
                self.contract.commit_statuses(&escrows).await
            })
            .await?;

            for (swap, status) in status_batch.iter().zip(statuses) {
                let auth_expired = expired_auth.contains(&swap.id);
                if let Some(target) = derived_target(swap, status, auth_expired) {
                    if let Err(e) = self.apply_derived(&swap.id, target).await {
                        warn!("Reconciling swap {} failed: {}", swap.id, e);
                    }
                }
            }
        }

        crate::metrics::record_active_swaps(self.kind.as_str(), self.active_count());
        if revived > 0 {
            info!("Recovered {} {} swaps from storage", revived, self.kind);
        }
        Ok(revived)
    }

    /// Periodic deadline pass: mark quotes nearing expiry, confirm hard
    /// expiry against the chain, sweep settled swaps out of storage
    pub async fn tick_deadlines(&self, now: u64, soft_margin_secs: u64) -> ClientResult<()> {
        let mut removable: Vec<SwapId> = Vec::new();
        let mut soft_marks: Vec<SwapId> = Vec::new();
        let mut hard_candidates: Vec<Swap> = Vec::new();

        for entry in self.swaps.iter() {
            let swap = entry.value();
            if swap.can_remove(now) {
                removable.push(swap.id);
            } else if swap.state_group() == StateGroup::PreCommit {
                if swap.quote_expired(now) {
                    hard_candidates.push(swap.clone());
                } else if swap.quote_soft_expired(now, soft_margin_secs) {
                    soft_marks.push(swap.id);
                }
            }
        }

        for id in soft_marks {
            let target = match self.kind.direction() {
                Direction::ToBtc => SwapState::ToBtc(ToBtcState::QuoteSoftExpired),
                Direction::FromBtc => SwapState::FromBtc(FromBtcState::QuoteSoftExpired),
            };
            if let Err(e) = self.transition(&id, target).await {
                warn!("Soft-expiring swap {} failed: {}", id, e);
            }
        }

        // wall-clock expiry is advisory until the chain confirms the
        // escrow never got committed
        if !hard_candidates.is_empty() {
            let escrows: Vec<EscrowData> =
                hard_candidates.iter().map(|s| s.escrow.clone()).collect();
            match backoff::retry("commit_statuses", &self.backoff, || async {
                self.contract.commit_statuses(&escrows).await
            })
            .await
            {
                Ok(statuses) => {
                    for (swap, status) in hard_candidates.iter().zip(statuses) {
                        if let Some(target) = derived_target(swap, status, true) {
                            if let Err(e) = self.apply_derived(&swap.id, target).await {
                                warn!("Expiring swap {} failed: {}", swap.id, e);
                            }
                        }
                    }
                }
                Err(e) => warn!("Deadline status check failed: {}", e),
            }
        }

        if !removable.is_empty() {
            self.store.remove_all(&removable).await?;
            for id in &removable {
                if let Some((_, swap)) = self.swaps.remove(id) {
                    self.by_escrow.remove(&swap.escrow_id());
                }
            }
            debug!("Swept {} settled {} swaps", removable.len(), self.kind);
        }

        crate::metrics::record_active_swaps(self.kind.as_str(), self.active_count());
        Ok(())
    }
}

/// Committed-state constant per direction
pub fn committed_state(direction: Direction) -> SwapState {
    match direction {
        Direction::ToBtc => SwapState::ToBtc(ToBtcState::Committed),
        Direction::FromBtc => SwapState::FromBtc(FromBtcState::Committed),
    }
}

/// Claimed-state constant per direction
pub fn claimed_state(direction: Direction) -> SwapState {
    match direction {
        Direction::ToBtc => SwapState::ToBtc(ToBtcState::Claimed),
        Direction::FromBtc => SwapState::FromBtc(FromBtcState::Claimed),
    }
}

/// For HTLC-style swaps the claim witness is the hash preimage; keep it
/// so lightning counterparties can settle their side
fn extract_preimage(payload: &SwapPayload, witness: &[u8]) -> Option<String> {
    if witness.is_empty() {
        return None;
    }
    match payload {
        SwapPayload::ToBtcLn { .. } | SwapPayload::FromBtcLn { .. } => {
            Some(hex::encode(witness))
        }
        _ => None,
    }
}

fn set_preimage(payload: &mut SwapPayload, secret: String) -> bool {
    match payload {
        SwapPayload::ToBtcLn { preimage, .. } | SwapPayload::FromBtcLn { preimage, .. } => {
            if preimage.as_deref() == Some(secret.as_str()) {
                false
            } else {
                *preimage = Some(secret);
                true
            }
        }
        _ => false,
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::wrapper_with;
    use super::*;
    use crate::contract::testutil::FakeContract;
    use crate::swap::testutil;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn track_persists_and_notifies() {
        let contract = FakeContract::new();
        let (wrapper, store) = wrapper_with(SwapKind::FromBtc, contract);
        let mut changes = wrapper.subscribe();

        let swap = testutil::from_btc_swap(2_000_000_000);
        wrapper.track(swap.clone()).await.unwrap();

        assert!(store.load(&swap.id).await.unwrap().is_some());
        let change = changes.recv().await.unwrap();
        assert_eq!(change.id, swap.id);
        assert_eq!(change.state, SwapState::FromBtc(FromBtcState::Created));
        assert_eq!(wrapper.find_by_escrow(&swap.escrow_id()), Some(swap.id));
    }

    #[tokio::test]
    async fn commit_records_txid_without_forcing_state() {
        let contract = FakeContract::new();
        let (wrapper, store) = wrapper_with(SwapKind::ToBtc, contract.clone());
        let swap = testutil::to_btc_swap(2_000_000_000);
        wrapper.track(swap.clone()).await.unwrap();

        let txid = wrapper.commit(&swap.id).await.unwrap();
        assert!(txid.starts_with("tx-init"));

        let live = wrapper.get(&swap.id).unwrap();
        assert_eq!(live.commit_txid.as_deref(), Some(txid.as_str()));
        // the transition itself comes from events or the watchdog
        assert_eq!(live.state, SwapState::ToBtc(ToBtcState::Created));

        let stored = store.load(&swap.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ToBtcState::Created.ordinal());
    }

    #[tokio::test]
    async fn commit_reverts_soft_expired_quote_that_is_still_valid() {
        let contract = FakeContract::new();
        let (wrapper, _) = wrapper_with(SwapKind::ToBtc, contract);
        let swap = testutil::to_btc_swap(2_000_000_000);
        wrapper.track(swap.clone()).await.unwrap();
        wrapper
            .transition(&swap.id, SwapState::ToBtc(ToBtcState::QuoteSoftExpired))
            .await
            .unwrap();

        wrapper.commit(&swap.id).await.unwrap();
        let live = wrapper.get(&swap.id).unwrap();
        assert_eq!(live.state, SwapState::ToBtc(ToBtcState::Created));
        assert!(live.commit_txid.is_some());
    }

    #[tokio::test]
    async fn commit_refuses_expired_authorization() {
        let contract = FakeContract::new();
        contract.auth_expired.store(true, Ordering::SeqCst);
        let (wrapper, _) = wrapper_with(SwapKind::ToBtc, contract);
        let swap = testutil::to_btc_swap(2_000_000_000);
        wrapper.track(swap.clone()).await.unwrap();

        let err = wrapper.commit(&swap.id).await.unwrap_err();
        assert!(matches!(err, ClientError::AuthorizationExpired { .. }));
        assert_eq!(
            wrapper.get(&swap.id).unwrap().state,
            SwapState::ToBtc(ToBtcState::Created)
        );
    }

    #[tokio::test]
    async fn initialize_event_is_idempotent() {
        let contract = FakeContract::new();
        let (wrapper, _) = wrapper_with(SwapKind::FromBtc, contract);
        let swap = testutil::from_btc_swap(2_000_000_000);
        wrapper.track(swap.clone()).await.unwrap();

        let event = EscrowEvent::Initialize {
            escrow_id: swap.escrow_id(),
            sequence: swap.escrow.sequence,
            txid: "commit-tx".into(),
        };
        wrapper.apply_event(&swap.id, &event).await.unwrap();
        let live = wrapper.get(&swap.id).unwrap();
        assert_eq!(live.state, SwapState::FromBtc(FromBtcState::Committed));
        assert_eq!(live.commit_txid.as_deref(), Some("commit-tx"));

        // second delivery changes nothing
        wrapper.apply_event(&swap.id, &event).await.unwrap();
        assert_eq!(wrapper.get(&swap.id).unwrap(), live);
    }

    #[tokio::test]
    async fn mismatched_sequence_is_dropped() {
        let contract = FakeContract::new();
        let (wrapper, _) = wrapper_with(SwapKind::FromBtc, contract);
        let swap = testutil::from_btc_swap(2_000_000_000);
        wrapper.track(swap.clone()).await.unwrap();

        let event = EscrowEvent::Initialize {
            escrow_id: swap.escrow_id(),
            sequence: swap.escrow.sequence + 1,
            txid: "commit-tx".into(),
        };
        wrapper.apply_event(&swap.id, &event).await.unwrap();
        assert_eq!(
            wrapper.get(&swap.id).unwrap().state,
            SwapState::FromBtc(FromBtcState::Created)
        );
    }

    #[tokio::test]
    async fn refund_event_walks_to_refunded() {
        let contract = FakeContract::new();
        let (wrapper, _) = wrapper_with(SwapKind::ToBtc, contract);
        let swap = testutil::to_btc_swap(2_000_000_000);
        wrapper.track(swap.clone()).await.unwrap();
        wrapper
            .transition(&swap.id, SwapState::ToBtc(ToBtcState::Committed))
            .await
            .unwrap();

        let event = EscrowEvent::Refund {
            escrow_id: swap.escrow_id(),
            sequence: swap.escrow.sequence,
            txid: "refund-tx".into(),
        };
        wrapper.apply_event(&swap.id, &event).await.unwrap();
        let live = wrapper.get(&swap.id).unwrap();
        assert_eq!(live.state, SwapState::ToBtc(ToBtcState::Refunded));
        assert_eq!(live.refund_txid.as_deref(), Some("refund-tx"));
    }

    #[tokio::test]
    async fn recover_reconciles_without_events() {
        let contract = FakeContract::new();
        let (wrapper, store) = wrapper_with(SwapKind::ToBtc, contract.clone());

        // a committed swap persisted by a previous run
        let mut swap = testutil::to_btc_swap(2_000_000_000);
        swap.transition_to(SwapState::ToBtc(ToBtcState::Committed))
            .unwrap();
        swap.commit_txid = Some("old-commit".into());
        store.save(&swap.to_record().unwrap()).await.unwrap();
        contract.set_status(swap.escrow_id(), CommitStatus::Paid);

        let revived = wrapper.recover().await.unwrap();
        assert_eq!(revived, 1);
        assert_eq!(
            wrapper.get(&swap.id).unwrap().state,
            SwapState::ToBtc(ToBtcState::Claimed)
        );
        assert_eq!(contract.batch_calls.load(Ordering::SeqCst), 1);

        let stored = store.load(&swap.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ToBtcState::Claimed.ordinal());
    }

    #[tokio::test]
    async fn recover_expires_stale_uncommitted_quote() {
        let contract = FakeContract::new();
        contract.auth_expired.store(true, Ordering::SeqCst);
        let (wrapper, store) = wrapper_with(SwapKind::FromBtc, contract);

        let swap = testutil::from_btc_swap(1_000);
        store.save(&swap.to_record().unwrap()).await.unwrap();

        wrapper.recover().await.unwrap();
        assert_eq!(
            wrapper.get(&swap.id).unwrap().state,
            SwapState::FromBtc(FromBtcState::QuoteExpired)
        );
    }

    #[tokio::test]
    async fn recover_rewrites_migrated_records() {
        let contract = FakeContract::new();
        let (wrapper, store) = wrapper_with(SwapKind::FromBtc, contract);

        let swap = testutil::from_btc_swap(2_000_000_000);
        let mut record = swap.to_record().unwrap();
        record.version = 1;
        let obj = record.doc.as_object_mut().unwrap();
        obj.remove("exact_in");
        obj.insert("version".into(), serde_json::json!(1));
        store.save(&record).await.unwrap();

        wrapper.recover().await.unwrap();

        let stored = store.load(&swap.id).await.unwrap().unwrap();
        assert_eq!(stored.version, migrate::CURRENT_VERSION);
        assert_eq!(stored.doc.get("exact_in"), Some(&serde_json::json!(true)));
    }

    #[tokio::test]
    async fn tick_marks_soft_expiry_and_sweeps_settled() {
        let contract = FakeContract::new();
        let (wrapper, store) = wrapper_with(SwapKind::FromBtc, contract);

        // quote expiring in 5 seconds: inside a 10 second soft margin
        let now = 1_000_000;
        let closing = testutil::from_btc_swap(now + 5);
        wrapper.track(closing.clone()).await.unwrap();

        let mut settled = testutil::from_btc_swap(now - 100);
        settled.escrow.claim_hash = crate::swap::Hash32([8u8; 32]);
        settled.id = SwapId::derive(&settled.escrow.claim_hash, 77);
        settled.state = SwapState::FromBtc(FromBtcState::Claimed);
        wrapper.track(settled.clone()).await.unwrap();

        wrapper.tick_deadlines(now, 10).await.unwrap();

        assert_eq!(
            wrapper.get(&closing.id).unwrap().state,
            SwapState::FromBtc(FromBtcState::QuoteSoftExpired)
        );
        assert!(wrapper.get(&settled.id).is_none());
        assert!(store.load(&settled.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tick_confirms_hard_expiry_with_chain() {
        let contract = FakeContract::new();
        let (wrapper, _) = wrapper_with(SwapKind::ToBtc, contract.clone());

        let now = 1_000_000;
        let stale = testutil::to_btc_swap(now - 10);
        wrapper.track(stale.clone()).await.unwrap();

        // chain says the commit actually landed; expiry does not apply
        contract.set_status(stale.escrow_id(), CommitStatus::Committed);
        wrapper.tick_deadlines(now, 10).await.unwrap();
        assert_eq!(
            wrapper.get(&stale.id).unwrap().state,
            SwapState::ToBtc(ToBtcState::Committed)
        );
    }

    #[tokio::test]
    async fn reconcile_poll_applies_authoritative_status() {
        let contract = FakeContract::new();
        let (wrapper, _) = wrapper_with(SwapKind::ToBtc, contract.clone());
        let swap = testutil::to_btc_swap(2_000_000_000);
        wrapper.track(swap.clone()).await.unwrap();

        contract.set_status(swap.escrow_id(), CommitStatus::Committed);
        let state = wrapper.reconcile_with_chain(&swap.id).await.unwrap();
        assert_eq!(state, SwapState::ToBtc(ToBtcState::Committed));
        assert!(contract.single_calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn payment_received_records_the_deposit_txo() {
        let contract = FakeContract::new();
        let (wrapper, _) = wrapper_with(SwapKind::FromBtc, contract);
        let swap = testutil::from_btc_swap(2_000_000_000);
        wrapper.track(swap.clone()).await.unwrap();
        wrapper
            .transition(&swap.id, SwapState::FromBtc(FromBtcState::Committed))
            .await
            .unwrap();

        let changed = wrapper
            .mark_payment_received(&swap.id, Some("deposit-tx".into()), Some(1))
            .await
            .unwrap();
        assert!(changed);

        let live = wrapper.get(&swap.id).unwrap();
        assert_eq!(live.state, SwapState::FromBtc(FromBtcState::PaymentReceived));
        match &live.payload {
            SwapPayload::FromBtc {
                deposit_txid,
                deposit_vout,
                ..
            } => {
                assert_eq!(deposit_txid.as_deref(), Some("deposit-tx"));
                assert_eq!(*deposit_vout, Some(1));
            }
            _ => panic!("wrong payload"),
        }

        // re-delivery is a no-op
        let changed = wrapper
            .mark_payment_received(&swap.id, Some("deposit-tx".into()), Some(1))
            .await
            .unwrap();
        assert!(!changed);

        // the lightning signal is refused on an on-chain swap
        let err = wrapper
            .mark_invoice_paid(&swap.id, "11".repeat(32))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::WrongState { .. }));
    }

    #[tokio::test]
    async fn early_deposit_is_recorded_without_forcing_state() {
        let contract = FakeContract::new();
        let (wrapper, _) = wrapper_with(SwapKind::FromBtc, contract);
        let swap = testutil::from_btc_swap(2_000_000_000);
        wrapper.track(swap.clone()).await.unwrap();

        // deposit seen before the intermediary committed the escrow
        let changed = wrapper
            .mark_payment_received(&swap.id, Some("deposit-tx".into()), Some(0))
            .await
            .unwrap();
        assert!(changed);
        let live = wrapper.get(&swap.id).unwrap();
        assert_eq!(live.state, SwapState::FromBtc(FromBtcState::Created));
        match &live.payload {
            SwapPayload::FromBtc { deposit_txid, .. } => {
                assert_eq!(deposit_txid.as_deref(), Some("deposit-tx"));
            }
            _ => panic!("wrong payload"),
        }
    }

    #[tokio::test]
    async fn invoice_paid_stores_the_preimage_and_settles() {
        let contract = FakeContract::new();
        let (wrapper, _) = wrapper_with(SwapKind::FromBtcLn, contract);
        let mut swap = testutil::from_btc_swap(2_000_000_000);
        swap.escrow.kind = crate::swap::EscrowKind::Htlc;
        swap.payload = SwapPayload::FromBtcLn {
            invoice: "lnbc1invoice".into(),
            payment_hash: swap.escrow.claim_hash,
            amount_sats: 100_000,
            preimage: None,
        };
        wrapper.track(swap.clone()).await.unwrap();
        wrapper
            .transition(&swap.id, SwapState::FromBtc(FromBtcState::Committed))
            .await
            .unwrap();

        assert!(wrapper
            .mark_invoice_paid(&swap.id, "11".repeat(32))
            .await
            .unwrap());
        let live = wrapper.get(&swap.id).unwrap();
        assert_eq!(live.state, SwapState::FromBtc(FromBtcState::PaymentReceived));
        match &live.payload {
            SwapPayload::FromBtcLn { preimage, .. } => {
                assert_eq!(preimage.as_deref(), Some("11".repeat(32).as_str()));
            }
            _ => panic!("wrong payload"),
        }
    }

    #[tokio::test]
    async fn claim_event_stores_lightning_preimage() {
        let contract = FakeContract::new();
        let (wrapper, _) = wrapper_with(SwapKind::ToBtcLn, contract);

        let claim_hash = crate::swap::Hash32([3u8; 32]);
        let payload = SwapPayload::ToBtcLn {
            invoice: "lnbc1invoice".into(),
            payment_hash: claim_hash,
            amount_sats: 21_000,
            preimage: None,
        };
        let swap = Swap::new(
            payload,
            testutil::escrow(claim_hash, 22_000, 2_000_000_000),
            testutil::auth(2_000_000_000),
            crate::swap::SwapFees {
                base: 0,
                ppm: 0,
                network: 0,
            },
            crate::swap::PriceInfo::new(21_000, 21_000),
            "https://lp.example.com".into(),
            2_000_000_000,
            true,
            7,
        );
        wrapper.track(swap.clone()).await.unwrap();
        wrapper
            .transition(&swap.id, SwapState::ToBtc(ToBtcState::Committed))
            .await
            .unwrap();

        let event = EscrowEvent::Claim {
            escrow_id: swap.escrow_id(),
            sequence: swap.escrow.sequence,
            txid: "claim-tx".into(),
            witness: vec![0xde, 0xad, 0xbe, 0xef],
        };
        wrapper.apply_event(&swap.id, &event).await.unwrap();

        let live = wrapper.get(&swap.id).unwrap();
        assert_eq!(live.state, SwapState::ToBtc(ToBtcState::Claimed));
        match live.payload {
            SwapPayload::ToBtcLn { preimage, .. } => {
                assert_eq!(preimage.as_deref(), Some("deadbeef"));
            }
            _ => panic!("wrong payload"),
        }
    }
}
