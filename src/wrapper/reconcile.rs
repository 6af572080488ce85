//! Deriving swap transitions from authoritative chain status
//!
//! The escrow contract's commit status is the source of truth. Local
//! state may lag arbitrarily far behind it (crash, missed events), so a
//! derived target is not always one hop away; [`transition_path`] finds
//! the legal intermediate states to pass through.

use crate::contract::CommitStatus;
use crate::swap::state::{can_transition, FromBtcState, StateGroup, SwapState, ToBtcState};
use crate::swap::Swap;

/// Target state implied by `status`, or `None` when the local state
/// already reflects it. `auth_expired` is the initialization
/// authorization timeout check, consulted only for uncommitted swaps.
pub fn derived_target(swap: &Swap, status: CommitStatus, auth_expired: bool) -> Option<SwapState> {
    if swap.is_terminal() {
        return None;
    }
    match swap.state {
        SwapState::ToBtc(current) => {
            derived_to_btc(current, status, auth_expired).map(SwapState::ToBtc)
        }
        SwapState::FromBtc(current) => {
            derived_from_btc(current, status, auth_expired).map(SwapState::FromBtc)
        }
    }
}

fn derived_to_btc(
    current: ToBtcState,
    status: CommitStatus,
    auth_expired: bool,
) -> Option<ToBtcState> {
    let pre_commit = current.group() == StateGroup::PreCommit;
    match status {
        CommitStatus::NotCommitted if pre_commit && auth_expired => Some(ToBtcState::QuoteExpired),
        CommitStatus::NotCommitted => None,
        CommitStatus::Committed if pre_commit => Some(ToBtcState::Committed),
        CommitStatus::Committed => None,
        CommitStatus::Paid if current != ToBtcState::Claimed => Some(ToBtcState::Claimed),
        CommitStatus::Paid => None,
        CommitStatus::Refundable if current != ToBtcState::Refundable => {
            Some(ToBtcState::Refundable)
        }
        CommitStatus::Refundable => None,
        // escrow expired and already refunded on chain
        CommitStatus::Expired if pre_commit => Some(ToBtcState::QuoteExpired),
        CommitStatus::Expired => Some(ToBtcState::Refunded),
    }
}

fn derived_from_btc(
    current: FromBtcState,
    status: CommitStatus,
    auth_expired: bool,
) -> Option<FromBtcState> {
    let pre_commit = current.group() == StateGroup::PreCommit;
    match status {
        CommitStatus::NotCommitted if pre_commit && auth_expired => {
            Some(FromBtcState::QuoteExpired)
        }
        CommitStatus::NotCommitted => None,
        CommitStatus::Committed if pre_commit => Some(FromBtcState::Committed),
        CommitStatus::Committed => None,
        CommitStatus::Paid if current != FromBtcState::Claimed => Some(FromBtcState::Claimed),
        CommitStatus::Paid => None,
        // the escrow we were supposed to claim expired under us
        CommitStatus::Expired if current == FromBtcState::PaymentReceived => {
            Some(FromBtcState::Failed)
        }
        CommitStatus::Expired => Some(FromBtcState::QuoteExpired),
        // expired but unclaimed; our in-flight claim may still win, so
        // only give up on swaps where no bitcoin has moved yet
        CommitStatus::Refundable if current == FromBtcState::PaymentReceived => None,
        CommitStatus::Refundable => Some(FromBtcState::QuoteExpired),
    }
}

fn same_direction_states(state: SwapState) -> Vec<SwapState> {
    match state {
        SwapState::ToBtc(_) => [
            ToBtcState::Refunded,
            ToBtcState::QuoteExpired,
            ToBtcState::QuoteSoftExpired,
            ToBtcState::Created,
            ToBtcState::Committed,
            ToBtcState::Claimed,
            ToBtcState::Refundable,
        ]
        .into_iter()
        .map(SwapState::ToBtc)
        .collect(),
        SwapState::FromBtc(_) => [
            FromBtcState::Failed,
            FromBtcState::QuoteExpired,
            FromBtcState::QuoteSoftExpired,
            FromBtcState::Created,
            FromBtcState::Committed,
            FromBtcState::PaymentReceived,
            FromBtcState::Claimed,
        ]
        .into_iter()
        .map(SwapState::FromBtc)
        .collect(),
    }
}

/// Shortest legal path `from → … → to`, excluding `from` itself.
/// Empty when already there, `None` when no path exists.
pub fn transition_path(from: SwapState, to: SwapState) -> Option<Vec<SwapState>> {
    if from == to {
        return Some(Vec::new());
    }
    if from.direction() != to.direction() {
        return None;
    }

    // breadth-first search; the graph has at most seven nodes
    let mut queue = std::collections::VecDeque::new();
    let mut previous: std::collections::HashMap<SwapState, SwapState> = Default::default();
    queue.push_back(from);

    while let Some(node) = queue.pop_front() {
        for next in same_direction_states(node) {
            if next == from || previous.contains_key(&next) || !can_transition(node, next) {
                continue;
            }
            previous.insert(next, node);
            if next == to {
                let mut path = vec![to];
                let mut cursor = to;
                while let Some(&prev) = previous.get(&cursor) {
                    if prev == from {
                        break;
                    }
                    path.push(prev);
                    cursor = prev;
                }
                path.reverse();
                return Some(path);
            }
            queue.push_back(next);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swap::testutil;

    #[test]
    fn direct_hop() {
        let path = transition_path(
            SwapState::ToBtc(ToBtcState::Created),
            SwapState::ToBtc(ToBtcState::Committed),
        )
        .unwrap();
        assert_eq!(path, vec![SwapState::ToBtc(ToBtcState::Committed)]);
    }

    #[test]
    fn staged_path_through_committed() {
        let path = transition_path(
            SwapState::ToBtc(ToBtcState::Created),
            SwapState::ToBtc(ToBtcState::Claimed),
        )
        .unwrap();
        assert_eq!(
            path,
            vec![
                SwapState::ToBtc(ToBtcState::Committed),
                SwapState::ToBtc(ToBtcState::Claimed),
            ]
        );
    }

    #[test]
    fn from_btc_paid_stages_through_payment_received() {
        let path = transition_path(
            SwapState::FromBtc(FromBtcState::Committed),
            SwapState::FromBtc(FromBtcState::Claimed),
        )
        .unwrap();
        assert_eq!(
            path,
            vec![
                SwapState::FromBtc(FromBtcState::PaymentReceived),
                SwapState::FromBtc(FromBtcState::Claimed),
            ]
        );
    }

    #[test]
    fn no_path_out_of_terminal() {
        assert!(transition_path(
            SwapState::ToBtc(ToBtcState::Claimed),
            SwapState::ToBtc(ToBtcState::Refunded),
        )
        .is_none());
    }

    #[test]
    fn expired_auth_and_not_committed_expires_quote() {
        let swap = testutil::from_btc_swap(1_000);
        let target = derived_target(&swap, CommitStatus::NotCommitted, true);
        assert_eq!(target, Some(SwapState::FromBtc(FromBtcState::QuoteExpired)));

        // valid auth keeps waiting
        assert_eq!(derived_target(&swap, CommitStatus::NotCommitted, false), None);
    }

    #[test]
    fn paid_status_derives_claimed() {
        let mut swap = testutil::to_btc_swap(1_000);
        swap.state = SwapState::ToBtc(ToBtcState::Committed);
        assert_eq!(
            derived_target(&swap, CommitStatus::Paid, false),
            Some(SwapState::ToBtc(ToBtcState::Claimed))
        );
    }

    #[test]
    fn expired_escrow_after_payment_is_a_failure() {
        let mut swap = testutil::from_btc_swap(1_000);
        swap.state = SwapState::FromBtc(FromBtcState::PaymentReceived);
        assert_eq!(
            derived_target(&swap, CommitStatus::Expired, false),
            Some(SwapState::FromBtc(FromBtcState::Failed))
        );
        // refundable-but-unclaimed leaves the claim race open
        assert_eq!(derived_target(&swap, CommitStatus::Refundable, false), None);
    }

    #[test]
    fn terminal_swaps_never_derive() {
        let mut swap = testutil::to_btc_swap(1_000);
        swap.state = SwapState::ToBtc(ToBtcState::Claimed);
        assert_eq!(derived_target(&swap, CommitStatus::Expired, true), None);
    }
}
