//! Escrow event listener
//!
//! One listener serves every wrapper. Event batches arrive in chain
//! order; within a batch, events for the same escrow are applied in
//! order. Escrows resolve against the wrappers' live maps first, then
//! one batched storage query for the rest. Whatever still does not
//! resolve belongs to someone else's swap and is dropped.

use crate::cancel::CancelToken;
use crate::contract::{ChainEvents, EscrowEvent};
use crate::error::ClientResult;
use crate::storage::{QueryClause, SwapStore};
use crate::swap::{EscrowId, SwapId, SwapKind, SwapRecord};
use crate::wrapper::SwapWrapper;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// Routes escrow events to the wrapper tracking the affected swap
pub struct EventListener {
    /// One wrapper per swap kind
    wrappers: Vec<Arc<SwapWrapper>>,
    /// Shared store, for swaps no live map knows
    store: Arc<dyn SwapStore>,
}

impl EventListener {
    pub fn new(wrappers: Vec<Arc<SwapWrapper>>, store: Arc<dyn SwapStore>) -> Self {
        Self { wrappers, store }
    }

    /// Main listening loop; runs until cancelled or the event source
    /// goes away
    pub async fn run(&self, events: Arc<dyn ChainEvents>, cancel: CancelToken) {
        let mut rx = events.subscribe();
        info!("Escrow event listener started");

        loop {
            tokio::select! {
                batch = rx.recv() => match batch {
                    Ok(batch) => {
                        if let Err(e) = self.dispatch(batch).await {
                            warn!("Event batch dispatch failed: {}", e);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // watchdog polls reconstruct whatever was dropped
                        warn!("Event stream lagged by {} batches", skipped);
                    }
                    Err(RecvError::Closed) => {
                        info!("Event stream closed, listener exiting");
                        return;
                    }
                },
                _ = cancel.cancelled() => {
                    info!("Escrow event listener stopped");
                    return;
                }
            }
        }
    }

    /// Apply one batch: group per escrow preserving order, resolve each
    /// escrow to its tracked swap, apply every event in order
    pub async fn dispatch(&self, batch: Vec<EscrowEvent>) -> ClientResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        debug!("Dispatching {} escrow events", batch.len());

        let mut order: Vec<EscrowId> = Vec::new();
        let mut grouped: HashMap<EscrowId, Vec<EscrowEvent>> = HashMap::new();
        for event in batch {
            let escrow_id = event.escrow_id();
            grouped
                .entry(escrow_id)
                .or_insert_with(|| {
                    order.push(escrow_id);
                    Vec::new()
                })
                .push(event);
        }

        let mut resolved: HashMap<EscrowId, (SwapId, usize)> = HashMap::new();
        let mut misses: Vec<EscrowId> = Vec::new();
        for escrow_id in &order {
            match self.find_live(escrow_id) {
                Some(hit) => {
                    resolved.insert(*escrow_id, hit);
                }
                None => misses.push(*escrow_id),
            }
        }

        if !misses.is_empty() {
            let records = self
                .store
                .query(&[QueryClause::EscrowIdIn(misses)])
                .await?;
            for record in &records {
                match self.adopt(record).await {
                    Ok(Some(hit)) => {
                        resolved.insert(record.escrow_id, hit);
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Could not adopt stored swap {}: {}", record.id, e),
                }
            }
        }

        for escrow_id in order {
            let Some((swap_id, wrapper_idx)) = resolved.get(&escrow_id).copied() else {
                debug!("No tracked swap for escrow {}, dropping its events", escrow_id);
                continue;
            };
            for event in &grouped[&escrow_id] {
                self.wrappers[wrapper_idx].apply_event(&swap_id, event).await?;
            }
        }
        Ok(())
    }

    fn find_live(&self, escrow_id: &EscrowId) -> Option<(SwapId, usize)> {
        self.wrappers
            .iter()
            .enumerate()
            .find_map(|(idx, wrapper)| {
                wrapper.find_by_escrow(escrow_id).map(|id| (id, idx))
            })
    }

    async fn adopt(&self, record: &SwapRecord) -> ClientResult<Option<(SwapId, usize)>> {
        let Some(kind) = SwapKind::from_tag(&record.kind) else {
            return Ok(None);
        };
        let Some(idx) = self.wrappers.iter().position(|w| w.kind() == kind) else {
            return Ok(None);
        };
        Ok(self.wrappers[idx]
            .adopt_record(record)
            .await?
            .map(|id| (id, idx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::testutil::FakeContract;
    use crate::swap::state::{FromBtcState, SwapState, ToBtcState};
    use crate::swap::{testutil, Hash32};
    use crate::cancel::cancel_pair;
    use std::time::Duration;
    use tokio::sync::broadcast;

    struct FakeEvents {
        tx: broadcast::Sender<Vec<EscrowEvent>>,
    }

    impl ChainEvents for FakeEvents {
        fn subscribe(&self) -> broadcast::Receiver<Vec<EscrowEvent>> {
            self.tx.subscribe()
        }
    }

    fn initialize(escrow_id: EscrowId, sequence: u64, txid: &str) -> EscrowEvent {
        EscrowEvent::Initialize {
            escrow_id,
            sequence,
            txid: txid.into(),
        }
    }

    #[tokio::test]
    async fn events_route_to_the_owning_wrapper() {
        let contract = FakeContract::new();
        let (to_btc, store) =
            crate::wrapper::testutil::wrapper_with(SwapKind::ToBtc, contract.clone());
        let (from_btc, _) =
            crate::wrapper::testutil::wrapper_with(SwapKind::FromBtc, contract);
        let listener =
            EventListener::new(vec![to_btc.clone(), from_btc.clone()], store);

        let outgoing = testutil::to_btc_swap(2_000_000_000);
        let incoming = testutil::from_btc_swap(2_000_000_000);
        to_btc.track(outgoing.clone()).await.unwrap();
        from_btc.track(incoming.clone()).await.unwrap();

        listener
            .dispatch(vec![
                initialize(outgoing.escrow_id(), outgoing.escrow.sequence, "tx-a"),
                initialize(incoming.escrow_id(), incoming.escrow.sequence, "tx-b"),
            ])
            .await
            .unwrap();

        assert_eq!(
            to_btc.get(&outgoing.id).unwrap().state,
            SwapState::ToBtc(ToBtcState::Committed)
        );
        assert_eq!(
            from_btc.get(&incoming.id).unwrap().state,
            SwapState::FromBtc(FromBtcState::Committed)
        );
    }

    #[tokio::test]
    async fn same_escrow_events_apply_in_order() {
        let contract = FakeContract::new();
        let (wrapper, store) =
            crate::wrapper::testutil::wrapper_with(SwapKind::FromBtc, contract);
        let listener = EventListener::new(vec![wrapper.clone()], store);

        let swap = testutil::from_btc_swap(2_000_000_000);
        wrapper.track(swap.clone()).await.unwrap();

        listener
            .dispatch(vec![
                initialize(swap.escrow_id(), swap.escrow.sequence, "commit-tx"),
                EscrowEvent::Claim {
                    escrow_id: swap.escrow_id(),
                    sequence: swap.escrow.sequence,
                    txid: "claim-tx".into(),
                    witness: Vec::new(),
                },
            ])
            .await
            .unwrap();

        let live = wrapper.get(&swap.id).unwrap();
        assert_eq!(live.state, SwapState::FromBtc(FromBtcState::Claimed));
        assert_eq!(live.commit_txid.as_deref(), Some("commit-tx"));
        assert_eq!(live.claim_txid.as_deref(), Some("claim-tx"));
    }

    #[tokio::test]
    async fn unknown_escrow_is_dropped() {
        let contract = FakeContract::new();
        let (wrapper, store) =
            crate::wrapper::testutil::wrapper_with(SwapKind::ToBtc, contract);
        let listener = EventListener::new(vec![wrapper], store);

        listener
            .dispatch(vec![initialize(Hash32([0xEE; 32]), 1, "tx")])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stored_but_untracked_swap_is_adopted() {
        let contract = FakeContract::new();
        let (wrapper, store) =
            crate::wrapper::testutil::wrapper_with(SwapKind::FromBtc, contract);
        let listener = EventListener::new(vec![wrapper.clone()], store.clone());

        // persisted by another instance; this process never tracked it
        let swap = testutil::from_btc_swap(2_000_000_000);
        store.save(&swap.to_record().unwrap()).await.unwrap();
        assert!(wrapper.get(&swap.id).is_none());

        listener
            .dispatch(vec![initialize(
                swap.escrow_id(),
                swap.escrow.sequence,
                "tx-adopted",
            )])
            .await
            .unwrap();

        let live = wrapper.get(&swap.id).unwrap();
        assert_eq!(live.state, SwapState::FromBtc(FromBtcState::Committed));
    }

    #[tokio::test]
    async fn run_loop_applies_batches_until_cancelled() {
        let contract = FakeContract::new();
        let (wrapper, store) =
            crate::wrapper::testutil::wrapper_with(SwapKind::FromBtc, contract);
        let listener =
            Arc::new(EventListener::new(vec![wrapper.clone()], store));

        let swap = testutil::from_btc_swap(2_000_000_000);
        wrapper.track(swap.clone()).await.unwrap();
        let mut changes = wrapper.subscribe();

        let (event_tx, _) = broadcast::channel(16);
        let events = Arc::new(FakeEvents {
            tx: event_tx.clone(),
        });
        let (handle, token) = cancel_pair();
        let running = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.run(events, token).await })
        };
        tokio::task::yield_now().await;

        event_tx
            .send(vec![initialize(
                swap.escrow_id(),
                swap.escrow.sequence,
                "tx-live",
            )])
            .unwrap();

        // the txid update notifies at Created first, then the transition
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let change = changes.recv().await.unwrap();
                if change.state == SwapState::FromBtc(FromBtcState::Committed) {
                    break;
                }
            }
        })
        .await
        .unwrap();

        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .unwrap()
            .unwrap();
    }
}
