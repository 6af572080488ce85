//! Watchdogs awaiting swap progress
//!
//! A wait races three sources: wrapper change notifications, a periodic
//! authoritative commit-status poll, and cancellation. Notifications
//! only shorten the wait; the poll alone always makes progress, so a
//! lost or lagged notification can never strand a waiter.

use crate::cancel::CancelToken;
use crate::error::{ClientError, ClientResult};
use crate::swap::state::{StateGroup, SwapState};
use crate::swap::SwapId;
use crate::wrapper::SwapWrapper;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

/// Wait until `done` holds for the swap's state. The current state is
/// checked before waiting, so a wait on an already-resolved swap
/// returns without touching the chain.
pub async fn wait_until<F>(
    wrapper: &SwapWrapper,
    id: &SwapId,
    poll_interval: Duration,
    cancel: CancelToken,
    mut done: F,
) -> ClientResult<SwapState>
where
    F: FnMut(SwapState) -> bool,
{
    // subscribe before the initial check so no change can fall between
    let mut changes = wrapper.subscribe();
    let state = wrapper
        .get(id)
        .ok_or_else(|| ClientError::SwapNotFound {
            swap_id: id.to_string(),
        })?
        .state;
    if done(state) {
        return Ok(state);
    }

    let mut poll = tokio::time::interval(poll_interval);
    poll.tick().await;
    let mut subscribed = true;

    loop {
        tokio::select! {
            changed = changes.recv(), if subscribed => match changed {
                Ok(change) if change.id == *id => {
                    if done(change.state) {
                        debug!("Watchdog for {} resolved by notification at {}", id, change.state);
                        return Ok(change.state);
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Swap change stream lagged by {} messages, re-checking {}", skipped, id);
                    let state = wrapper.reconcile_with_chain(id).await?;
                    if done(state) {
                        return Ok(state);
                    }
                }
                Err(RecvError::Closed) => {
                    subscribed = false;
                }
            },
            _ = poll.tick() => {
                let state = wrapper.reconcile_with_chain(id).await?;
                if done(state) {
                    debug!("Watchdog for {} resolved by poll at {}", id, state);
                    return Ok(state);
                }
            }
            _ = cancel.cancelled() => {
                debug!("Watchdog for {} cancelled", id);
                return Err(ClientError::Aborted);
            }
        }
    }
}

/// Resolve once the escrow leaves the pre-commit phase: either it got
/// committed on chain, or the quote died first (`QuoteExpired`)
pub async fn wait_for_commit(
    wrapper: &SwapWrapper,
    id: &SwapId,
    poll_interval: Duration,
    cancel: CancelToken,
) -> ClientResult<SwapState> {
    wait_until(wrapper, id, poll_interval, cancel, |state| {
        state.group() != StateGroup::PreCommit
    })
    .await
}

/// Resolve once the counterparty side settled: the swap is terminal or
/// a local claim/refund is owed
pub async fn wait_for_settlement(
    wrapper: &SwapWrapper,
    id: &SwapId,
    poll_interval: Duration,
    cancel: CancelToken,
) -> ClientResult<SwapState> {
    wait_until(wrapper, id, poll_interval, cancel, |state| {
        matches!(
            state.group(),
            StateGroup::ActionRequired | StateGroup::Terminal
        )
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use crate::contract::testutil::FakeContract;
    use crate::contract::CommitStatus;
    use crate::swap::state::{FromBtcState, ToBtcState};
    use crate::swap::testutil;
    use crate::swap::SwapKind;
    use crate::wrapper::testutil::wrapper_with;
    use std::sync::atomic::Ordering;

    #[tokio::test(start_paused = true)]
    async fn notification_resolves_before_any_poll() {
        let contract = FakeContract::new();
        let (wrapper, _) = wrapper_with(SwapKind::ToBtc, contract.clone());
        let swap = testutil::to_btc_swap(2_000_000_000);
        wrapper.track(swap.clone()).await.unwrap();

        let waiter = {
            let wrapper = wrapper.clone();
            let id = swap.id;
            tokio::spawn(async move {
                wait_for_commit(&wrapper, &id, Duration::from_secs(5), CancelToken::never())
                    .await
            })
        };
        tokio::task::yield_now().await;

        wrapper
            .transition(&swap.id, SwapState::ToBtc(ToBtcState::Committed))
            .await
            .unwrap();

        let state = waiter.await.unwrap().unwrap();
        assert_eq!(state, SwapState::ToBtc(ToBtcState::Committed));
        assert_eq!(contract.single_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_resolves_without_any_notification() {
        let contract = FakeContract::new();
        let (wrapper, _) = wrapper_with(SwapKind::ToBtc, contract.clone());
        let swap = testutil::to_btc_swap(2_000_000_000);
        wrapper.track(swap.clone()).await.unwrap();
        contract.set_status(swap.escrow_id(), CommitStatus::Committed);

        let state = wait_for_commit(
            &wrapper,
            &swap.id,
            Duration::from_secs(5),
            CancelToken::never(),
        )
        .await
        .unwrap();

        assert_eq!(state, SwapState::ToBtc(ToBtcState::Committed));
        assert!(contract.single_calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn commit_wait_ends_when_quote_dies() {
        let contract = FakeContract::new();
        contract.auth_expired.store(true, Ordering::SeqCst);
        let (wrapper, _) = wrapper_with(SwapKind::ToBtc, contract);
        let swap = testutil::to_btc_swap(2_000_000_000);
        wrapper.track(swap.clone()).await.unwrap();

        let state = wait_for_commit(
            &wrapper,
            &swap.id,
            Duration::from_secs(5),
            CancelToken::never(),
        )
        .await
        .unwrap();

        assert_eq!(state, SwapState::ToBtc(ToBtcState::QuoteExpired));
    }

    #[tokio::test(start_paused = true)]
    async fn settlement_wait_walks_to_claimed() {
        let contract = FakeContract::new();
        let (wrapper, _) = wrapper_with(SwapKind::FromBtc, contract.clone());
        let swap = testutil::from_btc_swap(2_000_000_000);
        wrapper.track(swap.clone()).await.unwrap();
        contract.set_status(swap.escrow_id(), CommitStatus::Paid);

        let state = wait_for_settlement(
            &wrapper,
            &swap.id,
            Duration::from_secs(5),
            CancelToken::never(),
        )
        .await
        .unwrap();

        assert_eq!(state, SwapState::FromBtc(FromBtcState::Claimed));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_wins_the_race() {
        let contract = FakeContract::new();
        let (wrapper, _) = wrapper_with(SwapKind::ToBtc, contract);
        let swap = testutil::to_btc_swap(2_000_000_000);
        wrapper.track(swap.clone()).await.unwrap();

        let (handle, token) = cancel_pair();
        let waiter = {
            let wrapper = wrapper.clone();
            let id = swap.id;
            tokio::spawn(async move {
                wait_for_commit(&wrapper, &id, Duration::from_secs(60), token).await
            })
        };
        tokio::task::yield_now().await;

        handle.cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::Aborted));
    }

    #[tokio::test(start_paused = true)]
    async fn satisfied_wait_returns_without_polling() {
        let contract = FakeContract::new();
        let (wrapper, _) = wrapper_with(SwapKind::ToBtc, contract.clone());
        let swap = testutil::to_btc_swap(2_000_000_000);
        wrapper.track(swap.clone()).await.unwrap();
        wrapper
            .transition(&swap.id, SwapState::ToBtc(ToBtcState::Committed))
            .await
            .unwrap();

        let state = wait_for_commit(
            &wrapper,
            &swap.id,
            Duration::from_secs(3600),
            CancelToken::never(),
        )
        .await
        .unwrap();

        assert_eq!(state, SwapState::ToBtc(ToBtcState::Committed));
        assert_eq!(contract.single_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_swap_errors_immediately() {
        let contract = FakeContract::new();
        let (wrapper, _) = wrapper_with(SwapKind::ToBtc, contract);
        let missing = testutil::to_btc_swap(2_000_000_000).id;

        let err = wait_for_commit(
            &wrapper,
            &missing,
            Duration::from_secs(5),
            CancelToken::never(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ClientError::SwapNotFound { .. }));
    }
}
