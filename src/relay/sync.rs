//! Relay synchronizer
//!
//! Brings the on-chain light client up to the bitcoin source tip:
//! locate where the source chain and the relay still agree, then replay
//! the missing headers in capped submission batches, as a side fork when
//! the relay tip fell off the source chain. The outer loop repeats while
//! the source tip keeps advancing mid-pass.

use crate::backoff::{self, BackoffConfig};
use crate::cancel::CancelToken;
use crate::config::RelayConfig;
use crate::error::{ClientError, ClientResult};
use crate::relay::headers::BlockHeader;
use crate::relay::source::BitcoinSource;
use crate::relay::{BtcRelay, RelayTip};

use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};

pub struct RelaySynchronizer {
    source: Arc<dyn BitcoinSource>,
    relay: Arc<dyn BtcRelay>,
    page_size: u64,
    max_walk_pages: u64,
    backoff: BackoffConfig,
}

impl RelaySynchronizer {
    pub fn new(
        source: Arc<dyn BitcoinSource>,
        relay: Arc<dyn BtcRelay>,
        config: &RelayConfig,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            source,
            relay,
            page_size: config.retrieval_page_size.max(1),
            max_walk_pages: config.max_walk_pages,
            backoff,
        }
    }

    /// Sync until the relay tip covers the source tip. Returns the final
    /// relay height.
    pub async fn sync_to_tip(&self, cancel: CancelToken) -> ClientResult<u64> {
        tokio::select! {
            result = self.sync_loop() => result,
            _ = cancel.cancelled() => Err(ClientError::Aborted),
        }
    }

    /// Claim-path pre-check: make sure the relay knows the block at
    /// `height` before a payment in it is proven
    pub async fn ensure_height(&self, height: u64, cancel: CancelToken) -> ClientResult<u64> {
        let relay_tip = backoff::retry("relay tip", &self.backoff, || self.relay.tip()).await?;
        if relay_tip.height >= height {
            return Ok(relay_tip.height);
        }
        let synced = self.sync_to_tip(cancel).await?;
        if synced < height {
            return Err(ClientError::ChainQuery {
                message: format!("relay tip {} still below required height {}", synced, height),
            });
        }
        Ok(synced)
    }

    async fn sync_loop(&self) -> ClientResult<u64> {
        loop {
            let source_tip =
                backoff::retry("bitcoin tip", &self.backoff, || self.source.tip_height()).await?;
            crate::metrics::record_bitcoin_tip(source_tip);
            let relay_tip = backoff::retry("relay tip", &self.backoff, || self.relay.tip()).await?;
            crate::metrics::record_relay_tip(relay_tip.height);

            if relay_tip.height >= source_tip {
                debug!(
                    "Relay height {} already covers source tip {}",
                    relay_tip.height, source_tip
                );
                return Ok(relay_tip.height);
            }

            info!(
                "Relay at height {}, {} behind the source, starting sync pass",
                relay_tip.height,
                source_tip - relay_tip.height
            );
            self.sync_pass(&relay_tip, source_tip).await?;
            crate::metrics::record_sync_pass();
        }
    }

    /// One backward walk plus forward replay up to `source_tip`
    async fn sync_pass(&self, relay_tip: &RelayTip, source_tip: u64) -> ClientResult<()> {
        // Backward walk: page down from the relay height until a fetched
        // header hashes to the relay's stored tip. No match within the
        // walk budget means the relay tip fell off the source chain and
        // the replay starts at the oldest header fetched, as a fork.
        let mut pending: VecDeque<BlockHeader> = VecDeque::new();
        let mut connected = false;
        let mut page_start = relay_tip.height;
        let mut page_count = self.page_size;

        for _ in 0..=self.max_walk_pages {
            let page = backoff::retry("bitcoin headers", &self.backoff, || {
                self.source.headers(page_start, page_count)
            })
            .await?;
            if page.is_empty() {
                return Err(ClientError::ChainQuery {
                    message: format!("source served no headers at height {}", page_start),
                });
            }
            let matched = page
                .iter()
                .find(|h| h.block_hash() == relay_tip.hash)
                .map(|h| h.height);
            for header in page.into_iter().rev() {
                pending.push_front(header);
            }
            if let Some(match_height) = matched {
                while pending
                    .front()
                    .map_or(false, |h| h.height <= match_height)
                {
                    pending.pop_front();
                }
                connected = true;
                break;
            }
            if page_start == 0 {
                break;
            }
            page_count = page_start.min(self.page_size);
            page_start -= page_count;
        }

        if !connected {
            info!(
                "Relay tip {} not found on the source chain, replaying from height {} as a fork",
                relay_tip.hash,
                pending.front().map_or(relay_tip.height, |h| h.height)
            );
        }

        // Forward replay. Fork submissions carry the next unused fork
        // slot until the relay reports the fork overtook its main chain.
        let fork_id = relay_tip.fork_id + 1;
        let mut main = connected;
        let mut next_fetch = pending
            .back()
            .map_or(relay_tip.height + 1, |h| h.height + 1);

        loop {
            if pending.is_empty() {
                if next_fetch > source_tip {
                    break;
                }
                let page = backoff::retry("bitcoin headers", &self.backoff, || {
                    self.source.headers(next_fetch, self.page_size)
                })
                .await?;
                match page.last() {
                    Some(last) => next_fetch = last.height + 1,
                    // the source shrank mid-pass; the outer loop re-reads both tips
                    None => break,
                }
                pending.extend(page);
            }

            let cap = if main {
                self.relay.max_headers_per_tx()
            } else {
                self.relay.max_fork_headers_per_tx()
            };
            let take = cap.min(pending.len()).max(1);
            let batch: Vec<BlockHeader> = pending.drain(..take).collect();

            let outcome = if main {
                backoff::retry("relay submit", &self.backoff, || {
                    self.relay.submit_main(&batch)
                })
                .await?
            } else {
                backoff::retry("relay submit", &self.backoff, || {
                    self.relay.submit_fork(fork_id, &batch)
                })
                .await?
            };
            crate::metrics::record_headers_submitted(if main { "main" } else { "fork" }, take);
            debug!(
                "Submitted {} headers up to height {} ({}, tx {})",
                take,
                batch.last().map_or(0, |h| h.height),
                if main { "main" } else { "fork" },
                outcome.txid
            );
            if !main && outcome.main {
                info!("Fork {} recognized as the relay main chain", fork_id);
                main = true;
            }
        }

        if !main {
            // everything the source had is submitted and the relay still
            // holds a heavier chain
            return Err(ClientError::InsufficientChainwork);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use crate::relay::SubmitOutcome;
    use crate::swap::Hash32;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Properly linked header chain with real double-sha hashes
    fn test_chain(len: u64) -> Vec<BlockHeader> {
        let mut chain = Vec::with_capacity(len as usize);
        let mut prev = Hash32::ZERO;
        for height in 0..len {
            let header = BlockHeader {
                version: 2,
                prev_block_hash: prev,
                merkle_root: Hash32([height as u8; 32]),
                timestamp: 1_600_000_000 + height as u32 * 600,
                bits: 0x1d00ffff,
                nonce: height as u32,
                height,
            };
            prev = header.block_hash();
            chain.push(header);
        }
        chain
    }

    struct FakeBitcoin {
        chain: Vec<BlockHeader>,
        visible_tip: AtomicU64,
        /// Tip values applied one per `tip_height` call
        growth: Mutex<VecDeque<u64>>,
        tip_calls: AtomicUsize,
        header_calls: AtomicUsize,
        hang: bool,
    }

    impl FakeBitcoin {
        fn new(chain: Vec<BlockHeader>, visible_tip: u64) -> Arc<Self> {
            Arc::new(Self {
                chain,
                visible_tip: AtomicU64::new(visible_tip),
                growth: Mutex::new(VecDeque::new()),
                tip_calls: AtomicUsize::new(0),
                header_calls: AtomicUsize::new(0),
                hang: false,
            })
        }
    }

    #[async_trait]
    impl BitcoinSource for FakeBitcoin {
        async fn tip_height(&self) -> ClientResult<u64> {
            self.tip_calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                tokio::time::sleep(Duration::from_secs(10_000)).await;
            }
            if let Some(next) = self.growth.lock().unwrap().pop_front() {
                self.visible_tip.store(next, Ordering::SeqCst);
            }
            Ok(self.visible_tip.load(Ordering::SeqCst))
        }

        async fn headers(&self, start_height: u64, count: u64) -> ClientResult<Vec<BlockHeader>> {
            self.header_calls.fetch_add(1, Ordering::SeqCst);
            let tip = self.visible_tip.load(Ordering::SeqCst);
            Ok(self
                .chain
                .iter()
                .filter(|h| h.height >= start_height && h.height <= tip)
                .take(count as usize)
                .cloned()
                .collect())
        }

        async fn merkle_proof(&self, _txid: &str) -> ClientResult<crate::relay::MerkleProof> {
            unimplemented!("not used by sync tests")
        }

        async fn tx_hex(&self, _txid: &str) -> ClientResult<String> {
            unimplemented!("not used by sync tests")
        }

        async fn tx_confirmations(&self, _txid: &str) -> ClientResult<u64> {
            unimplemented!("not used by sync tests")
        }
    }

    struct FakeRelay {
        tip: Mutex<RelayTip>,
        main_cap: usize,
        fork_cap: usize,
        /// Total fork headers after which the fork overtakes main;
        /// `None` never flips
        fork_wins_after: Option<usize>,
        fork_head: Mutex<Option<(u64, Hash32)>>,
        fork_headers_seen: AtomicUsize,
        main_submissions: AtomicUsize,
        fork_submissions: AtomicUsize,
        max_main_batch: AtomicUsize,
        max_fork_batch: AtomicUsize,
        fork_ids_seen: Mutex<Vec<u64>>,
    }

    impl FakeRelay {
        fn new(tip: RelayTip, main_cap: usize, fork_cap: usize) -> Arc<Self> {
            Arc::new(Self {
                tip: Mutex::new(tip),
                main_cap,
                fork_cap,
                fork_wins_after: None,
                fork_head: Mutex::new(None),
                fork_headers_seen: AtomicUsize::new(0),
                main_submissions: AtomicUsize::new(0),
                fork_submissions: AtomicUsize::new(0),
                max_main_batch: AtomicUsize::new(0),
                max_fork_batch: AtomicUsize::new(0),
                fork_ids_seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl BtcRelay for FakeRelay {
        async fn tip(&self) -> ClientResult<RelayTip> {
            Ok(self.tip.lock().unwrap().clone())
        }

        fn max_headers_per_tx(&self) -> usize {
            self.main_cap
        }

        fn max_fork_headers_per_tx(&self) -> usize {
            self.fork_cap
        }

        async fn submit_main(&self, headers: &[BlockHeader]) -> ClientResult<SubmitOutcome> {
            self.main_submissions.fetch_add(1, Ordering::SeqCst);
            self.max_main_batch.fetch_max(headers.len(), Ordering::SeqCst);
            let mut tip = self.tip.lock().unwrap();
            assert_eq!(
                headers[0].prev_block_hash, tip.hash,
                "main submission must extend the relay tip"
            );
            let last = headers.last().unwrap();
            tip.height = last.height;
            tip.hash = last.block_hash();
            Ok(SubmitOutcome {
                txid: format!("main-{}", last.height),
                main: true,
            })
        }

        async fn submit_fork(
            &self,
            fork_id: u64,
            headers: &[BlockHeader],
        ) -> ClientResult<SubmitOutcome> {
            self.fork_submissions.fetch_add(1, Ordering::SeqCst);
            self.max_fork_batch.fetch_max(headers.len(), Ordering::SeqCst);
            self.fork_ids_seen.lock().unwrap().push(fork_id);
            let mut fork_head = self.fork_head.lock().unwrap();
            if let Some((_, head_hash)) = *fork_head {
                assert_eq!(
                    headers[0].prev_block_hash, head_hash,
                    "fork submission must extend the fork head"
                );
            }
            let last = headers.last().unwrap();
            *fork_head = Some((last.height, last.block_hash()));
            let seen =
                self.fork_headers_seen.fetch_add(headers.len(), Ordering::SeqCst) + headers.len();
            let wins = self.fork_wins_after.map_or(false, |after| seen >= after);
            if wins {
                let mut tip = self.tip.lock().unwrap();
                tip.height = last.height;
                tip.hash = last.block_hash();
            }
            Ok(SubmitOutcome {
                txid: format!("fork-{}", last.height),
                main: wins,
            })
        }
    }

    fn synchronizer(
        source: Arc<FakeBitcoin>,
        relay: Arc<FakeRelay>,
        page_size: u64,
        max_walk_pages: u64,
    ) -> RelaySynchronizer {
        let config = RelayConfig {
            retrieval_page_size: page_size,
            max_walk_pages,
            ..RelayConfig::default()
        };
        let backoff = BackoffConfig {
            max_retries: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter: false,
        };
        RelaySynchronizer::new(source, relay, &config, backoff)
    }

    fn tip_of(chain: &[BlockHeader], height: u64, fork_id: u64) -> RelayTip {
        RelayTip {
            height,
            hash: chain[height as usize].block_hash(),
            fork_id,
        }
    }

    #[tokio::test]
    async fn extends_relay_tip_to_the_source_tip() {
        let chain = test_chain(131);
        let source = FakeBitcoin::new(chain.clone(), 130);
        let relay = FakeRelay::new(tip_of(&chain, 100, 0), 50, 7);

        let synced = synchronizer(source, relay.clone(), 16, 4)
            .sync_to_tip(CancelToken::never())
            .await
            .unwrap();

        assert_eq!(synced, 130);
        let tip = relay.tip.lock().unwrap().clone();
        assert_eq!(tip.height, 130);
        assert_eq!(tip.hash, chain[130].block_hash());
        assert_eq!(relay.fork_submissions.load(Ordering::SeqCst), 0);
        assert_eq!(relay.main_submissions.load(Ordering::SeqCst), 2);
        assert!(relay.max_main_batch.load(Ordering::SeqCst) <= 50);
    }

    #[tokio::test]
    async fn reorged_relay_tip_replays_as_a_fork() {
        let chain = test_chain(131);
        let source = FakeBitcoin::new(chain.clone(), 130);
        // stale tip hash that exists nowhere on the source chain
        let stale = RelayTip {
            height: 100,
            hash: Hash32([0xaa; 32]),
            fork_id: 3,
        };
        let mut relay = FakeRelay::new(stale, 50, 7);
        Arc::get_mut(&mut relay).unwrap().fork_wins_after = Some(35);

        let synced = synchronizer(source, relay.clone(), 16, 2)
            .sync_to_tip(CancelToken::never())
            .await
            .unwrap();

        assert_eq!(synced, 130);
        let tip = relay.tip.lock().unwrap().clone();
        assert_eq!(tip.hash, chain[130].block_hash());
        // walk gave up after the tip page plus two more, forking from 68
        assert!(relay
            .fork_ids_seen
            .lock()
            .unwrap()
            .iter()
            .all(|id| *id == 4));
        assert_eq!(relay.fork_headers_seen.load(Ordering::SeqCst), 35);
        assert_eq!(relay.fork_submissions.load(Ordering::SeqCst), 5);
        assert!(relay.max_fork_batch.load(Ordering::SeqCst) <= 7);
        // the flip switches the remaining batches to main submissions
        assert_eq!(relay.main_submissions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fork_that_never_overtakes_is_fatal() {
        let chain = test_chain(111);
        let source = FakeBitcoin::new(chain, 110);
        let stale = RelayTip {
            height: 100,
            hash: Hash32([0xbb; 32]),
            fork_id: 0,
        };
        let relay = FakeRelay::new(stale, 50, 7);

        let err = synchronizer(source, relay.clone(), 16, 2)
            .sync_to_tip(CancelToken::never())
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::InsufficientChainwork));
        assert!(err.is_fatal());
        assert_eq!(relay.main_submissions.load(Ordering::SeqCst), 0);
        assert!(relay.max_fork_batch.load(Ordering::SeqCst) <= 7);
    }

    #[tokio::test]
    async fn tip_advancing_mid_sync_triggers_another_pass() {
        let chain = test_chain(116);
        let source = FakeBitcoin::new(chain.clone(), 110);
        *source.growth.lock().unwrap() = VecDeque::from([110, 115]);
        let relay = FakeRelay::new(tip_of(&chain, 100, 0), 50, 7);

        let synced = synchronizer(source.clone(), relay.clone(), 16, 4)
            .sync_to_tip(CancelToken::never())
            .await
            .unwrap();

        assert_eq!(synced, 115);
        assert_eq!(relay.tip.lock().unwrap().hash, chain[115].block_hash());
        // two passes plus the final already-covered check
        assert_eq!(source.tip_calls.load(Ordering::SeqCst), 3);
        assert_eq!(relay.main_submissions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn already_covered_tip_submits_nothing() {
        let chain = test_chain(131);
        let source = FakeBitcoin::new(chain.clone(), 130);
        let relay = FakeRelay::new(tip_of(&chain, 130, 0), 50, 7);

        let synced = synchronizer(source.clone(), relay.clone(), 16, 4)
            .sync_to_tip(CancelToken::never())
            .await
            .unwrap();

        assert_eq!(synced, 130);
        assert_eq!(source.header_calls.load(Ordering::SeqCst), 0);
        assert_eq!(relay.main_submissions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ensure_height_skips_sync_when_covered() {
        let chain = test_chain(131);
        let source = FakeBitcoin::new(chain.clone(), 130);
        let relay = FakeRelay::new(tip_of(&chain, 130, 0), 50, 7);

        let height = synchronizer(source.clone(), relay, 16, 4)
            .ensure_height(120, CancelToken::never())
            .await
            .unwrap();

        assert_eq!(height, 130);
        assert_eq!(source.tip_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ensure_height_fails_when_the_source_is_behind() {
        let chain = test_chain(111);
        let source = FakeBitcoin::new(chain.clone(), 110);
        let relay = FakeRelay::new(tip_of(&chain, 100, 0), 50, 7);

        let err = synchronizer(source, relay.clone(), 16, 4)
            .ensure_height(120, CancelToken::never())
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::ChainQuery { .. }));
        // the sync itself still ran to the source tip
        assert_eq!(relay.tip.lock().unwrap().height, 110);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_unblocks_a_hung_source() {
        let chain = test_chain(131);
        let mut source = FakeBitcoin::new(chain.clone(), 130);
        Arc::get_mut(&mut source).unwrap().hang = true;
        let relay = FakeRelay::new(tip_of(&chain, 100, 0), 50, 7);

        let sync = Arc::new(synchronizer(source, relay, 16, 4));
        let (handle, token) = cancel_pair();
        let running = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.sync_to_tip(token).await })
        };
        tokio::task::yield_now().await;

        handle.cancel();
        let err = running.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::Aborted));
    }
}
