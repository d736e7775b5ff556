//! NTP-style time sync between a receiver and the broadcaster host.
//!
//! The exchange aligns a receiver's local clock to the broadcaster's
//! monotonic time and yields the end-to-end latency the scheduler budgets
//! for:
//!
//! 1. Receiver sends `SYNC[t1]` with its local send time.
//! 2. Broadcaster stamps `t2` on receive and `t3` on send, replies
//!    `SYNC[t1][t2][t3]`.
//! 3. Receiver stamps `t4` on arrival and derives offset and round trip.
//!
//! One round collects a fixed number of samples; the median filters
//! outliers, and samples over the RTT ceiling are dropped outright. A
//! round with no usable samples is degenerate: no latency is reported, so
//! the channel's staleness sweep takes the receiver offline.
//!
//! Both ends have runtime drivers here: [`serve_sync`] is the host-side
//! control loop answering requests on a receiver connection, and
//! [`spawn_sync_runner`] is the receiver-side task that runs a round on
//! attach and then every sync interval, reporting each estimate to the
//! channel.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::channel::ChannelHandle;
use crate::clock::MonotonicClock;
use crate::config::SyncConfig;
use crate::protocol::ControlMessage;
use crate::protocol_constants::MAX_CONTROL_FRAME_LEN;
use crate::receiver::ReceiverId;
use crate::transport::Transport;

/// One completed sync exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSample {
    /// Estimated broadcaster-clock minus receiver-clock offset (µs).
    pub offset_us: i64,
    /// Network round trip with broadcaster processing time removed (µs).
    pub round_trip_us: u64,
}

impl SyncSample {
    /// Derives a sample from the four exchange timestamps.
    ///
    /// `offset = ((t2 − t1) + (t3 − t4)) / 2`,
    /// `round_trip = (t4 − t1) − (t3 − t2)`.
    #[must_use]
    pub fn from_exchange(t1: u64, t2: u64, t3: u64, t4: u64) -> Self {
        let (t1, t2, t3, t4) = (t1 as i64, t2 as i64, t3 as i64, t4 as i64);
        let offset_us = ((t2 - t1) + (t3 - t4)) / 2;
        let round_trip_us = ((t4 - t1) - (t3 - t2)).max(0) as u64;
        Self {
            offset_us,
            round_trip_us,
        }
    }
}

/// Result of a sync round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncEstimate {
    /// Median clock offset (µs). Add to receiver-local time to get
    /// broadcaster time.
    pub offset_us: i64,
    /// Reported latency: half the median round trip (µs).
    pub latency_us: u64,
}

/// Collects one round of sync samples and produces a median estimate.
pub struct SyncEstimator {
    config: SyncConfig,
    samples: Vec<SyncSample>,
    attempts: usize,
}

impl SyncEstimator {
    /// Creates an estimator for one round.
    #[must_use]
    pub fn new(config: SyncConfig) -> Self {
        let capacity = config.sample_count;
        Self {
            config,
            samples: Vec::with_capacity(capacity),
            attempts: 0,
        }
    }

    /// Adds a sample. Returns `false` when the sample was dropped for
    /// exceeding the RTT ceiling.
    pub fn add_sample(&mut self, sample: SyncSample) -> bool {
        self.attempts += 1;
        if sample.round_trip_us > self.config.rtt_ceiling_us {
            log::debug!(
                "[Sync] Dropping sample with rtt={}µs above ceiling {}µs",
                sample.round_trip_us,
                self.config.rtt_ceiling_us
            );
            return false;
        }
        self.samples.push(sample);
        true
    }

    /// Whether the round has seen its full complement of exchanges.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.attempts >= self.config.sample_count
    }

    /// Median-filtered estimate, or `None` when the round is degenerate
    /// (no sample survived the ceiling).
    #[must_use]
    pub fn estimate(&self) -> Option<SyncEstimate> {
        if self.samples.is_empty() {
            return None;
        }
        let mut offsets: Vec<i64> = self.samples.iter().map(|s| s.offset_us).collect();
        let mut rtts: Vec<u64> = self.samples.iter().map(|s| s.round_trip_us).collect();
        offsets.sort_unstable();
        rtts.sort_unstable();

        Some(SyncEstimate {
            offset_us: offsets[offsets.len() / 2],
            latency_us: rtts[rtts.len() / 2] / 2,
        })
    }

    /// Clears the round for reuse.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.attempts = 0;
    }
}

/// Broadcaster-side half of the exchange: stamps `t2`/`t3` onto incoming
/// requests.
pub struct SyncResponder {
    clock: MonotonicClock,
}

impl SyncResponder {
    /// Creates a responder on the process clock.
    #[must_use]
    pub fn new(clock: MonotonicClock) -> Self {
        Self { clock }
    }

    /// Answers a control frame. Returns the encoded response for sync
    /// requests and `None` for anything else (callers ignore unknown
    /// opcodes).
    #[must_use]
    pub fn respond(&self, frame: &[u8]) -> Option<Bytes> {
        match ControlMessage::decode(frame) {
            Some(ControlMessage::SyncRequest { t1 }) => {
                let t2 = self.clock.now();
                let t3 = self.clock.now();
                Some(ControlMessage::SyncResponse { t1, t2, t3 }.encode())
            }
            _ => None,
        }
    }
}

/// Converts a broadcaster playback instant to receiver-local time.
#[must_use]
pub fn local_play_at(playback_at: u64, offset_us: i64) -> u64 {
    (playback_at as i64 - offset_us).max(0) as u64
}

/// Host-side control loop for one receiver connection.
///
/// Reframes the length-prefixed byte stream from `read` (the read half of
/// the receiver's transport) and answers sync requests through
/// `transport`. Unknown opcodes are ignored; oversized frames and read
/// errors end the loop, as does `cancel`.
pub async fn serve_sync<R>(
    mut read: R,
    transport: Arc<dyn Transport>,
    clock: MonotonicClock,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let responder = SyncResponder::new(clock);
    let mut frame = Vec::new();
    loop {
        let len = tokio::select! {
            _ = cancel.cancelled() => break,
            len = read.read_u32() => match len {
                Ok(len) => len as usize,
                Err(_) => break,
            },
        };
        if len > MAX_CONTROL_FRAME_LEN {
            log::warn!(
                "[Sync] Control frame of {} bytes from {}, dropping connection",
                len,
                transport.peer()
            );
            break;
        }
        frame.resize(len, 0);
        if read.read_exact(&mut frame).await.is_err() {
            break;
        }
        match responder.respond(&frame) {
            Some(reply) => {
                if let Err(e) = transport.send(reply).await {
                    log::warn!("[Sync] Reply to {} failed: {}", transport.peer(), e);
                    break;
                }
            }
            None => log::debug!(
                "[Sync] Ignoring non-sync control frame ({} bytes) from {}",
                len,
                transport.peer()
            ),
        }
    }
    log::debug!("[Sync] Control loop for {} ended", transport.peer());
}

/// One request/response leg of the exchange, as the receiver sees it.
///
/// Sends `SYNC[t1]` to the broadcaster host and returns its `(t2, t3)`
/// stamps. Implementations own the socket plumbing; the runner owns the
/// timing and the math.
#[async_trait]
pub trait SyncExchange: Send + Sync {
    /// Performs one exchange. Errors count as a lost sample.
    async fn exchange(&self, t1: u64) -> io::Result<(u64, u64)>;
}

/// Runs one full sync round: `sample_count` exchanges on the receiver's
/// local clock, median-filtered into an estimate.
///
/// Returns `None` when the round is degenerate (no exchange survived the
/// ceiling or the wire).
pub async fn run_sync_round(
    receiver_id: &str,
    exchange: &dyn SyncExchange,
    clock: MonotonicClock,
    config: &SyncConfig,
) -> Option<SyncEstimate> {
    let mut estimator = SyncEstimator::new(config.clone());
    for _ in 0..config.sample_count {
        let t1 = clock.now();
        match exchange.exchange(t1).await {
            Ok((t2, t3)) => {
                let t4 = clock.now();
                estimator.add_sample(SyncSample::from_exchange(t1, t2, t3, t4));
            }
            Err(e) => log::debug!("[Sync] {} exchange failed: {}", receiver_id, e),
        }
    }
    estimator.estimate()
}

/// Spawns the receiver-side sync driver.
///
/// Runs a round immediately (the attach-time sync) and then one per
/// `config.interval_secs`, reporting each estimate's latency to the
/// channel. Degenerate rounds report nothing, which lets the channel's
/// staleness sweep mark the receiver offline. Returns the token that
/// stops the driver.
pub fn spawn_sync_runner(
    receiver_id: impl Into<ReceiverId>,
    channel: ChannelHandle,
    exchange: Arc<dyn SyncExchange>,
    clock: MonotonicClock,
    config: SyncConfig,
) -> CancellationToken {
    let receiver_id = receiver_id.into();
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(config.interval_secs));
        // A late round should not trigger a burst of catch-up rounds
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    match run_sync_round(&receiver_id, &*exchange, clock, &config).await {
                        Some(estimate) => {
                            log::debug!(
                                "[Sync] {} offset={}µs latency={}µs",
                                receiver_id,
                                estimate.offset_us,
                                estimate.latency_us
                            );
                            channel.report_sync(&receiver_id, estimate.latency_us);
                        }
                        None => log::warn!(
                            "[Sync] {} round degenerate, no latency report",
                            receiver_id
                        ),
                    }
                }
            }
        }
        log::debug!("[Sync] Runner for {} stopped", receiver_id);
    });
    cancel
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_math_matches_the_exchange_formula() {
        // Receiver clock runs 1000µs behind; each leg takes 500µs; the
        // broadcaster spends 100µs between stamps.
        let t1 = 10_000;
        let t2 = 11_500; // t1 + 500 travel + 1000 offset
        let t3 = 11_600;
        let t4 = 11_100; // t3 - 1000 offset + 500 travel

        let sample = SyncSample::from_exchange(t1, t2, t3, t4);
        assert_eq!(sample.offset_us, 1_000);
        assert_eq!(sample.round_trip_us, 1_000);
    }

    #[test]
    fn median_discards_the_outlier() {
        // RTTs in ms: 8 12 10 9 11 500 10 9 11 8 12. The 500ms sample is
        // below the 1s ceiling but the median ignores it.
        let rtts_ms = [8u64, 12, 10, 9, 11, 500, 10, 9, 11, 8, 12];
        let mut estimator = SyncEstimator::new(SyncConfig::default());
        for rtt in rtts_ms {
            estimator.add_sample(SyncSample {
                offset_us: 0,
                round_trip_us: rtt * 1_000,
            });
        }

        assert!(estimator.is_complete());
        let estimate = estimator.estimate().expect("samples collected");
        assert_eq!(estimate.latency_us, 5_000);
    }

    #[test]
    fn samples_over_the_ceiling_are_dropped() {
        let mut estimator = SyncEstimator::new(SyncConfig::default());
        assert!(!estimator.add_sample(SyncSample {
            offset_us: 0,
            round_trip_us: 1_500_000,
        }));
        assert!(estimator.add_sample(SyncSample {
            offset_us: 10,
            round_trip_us: 9_000,
        }));
        assert_eq!(estimator.estimate().unwrap().latency_us, 4_500);
    }

    #[test]
    fn degenerate_round_yields_no_estimate() {
        let mut estimator = SyncEstimator::new(SyncConfig::default());
        for _ in 0..11 {
            estimator.add_sample(SyncSample {
                offset_us: 0,
                round_trip_us: 2_000_000,
            });
        }
        assert!(estimator.is_complete());
        assert!(estimator.estimate().is_none());
    }

    #[test]
    fn median_offset_is_reported() {
        let mut estimator = SyncEstimator::new(SyncConfig::default());
        for offset in [-30i64, 10, 20, 15, 12] {
            estimator.add_sample(SyncSample {
                offset_us: offset,
                round_trip_us: 10_000,
            });
        }
        assert_eq!(estimator.estimate().unwrap().offset_us, 12);
    }

    #[tokio::test(start_paused = true)]
    async fn responder_answers_sync_requests_only() {
        let clock = MonotonicClock::new();
        let responder = SyncResponder::new(clock);

        tokio::time::advance(std::time::Duration::from_micros(5_000)).await;

        let request = ControlMessage::SyncRequest { t1: 77 }.encode();
        let reply = responder.respond(&request).expect("sync gets a reply");
        match ControlMessage::decode(&reply) {
            Some(ControlMessage::SyncResponse { t1, t2, t3 }) => {
                assert_eq!(t1, 77);
                assert!(t2 >= 5_000);
                assert!(t3 >= t2);
            }
            other => panic!("unexpected reply: {:?}", other),
        }

        assert!(responder.respond(&ControlMessage::Play.encode()).is_none());
        assert!(responder.respond(b"????").is_none());
    }

    #[test]
    fn playback_instants_convert_to_local_time() {
        assert_eq!(local_play_at(100_000, 2_000), 98_000);
        assert_eq!(local_play_at(100_000, -2_000), 102_000);
        assert_eq!(local_play_at(1_000, 5_000), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn serve_sync_answers_requests_on_a_connection() {
        use tokio::io::AsyncWriteExt;

        let clock = MonotonicClock::new();
        let (mut peer, host_end) = tokio::io::duplex(256);
        let (transport, mut replies) = crate::transport::ChannelTransport::new("receiver");
        let cancel = CancellationToken::new();
        tokio::spawn(serve_sync(
            host_end,
            Arc::new(transport),
            clock,
            cancel.clone(),
        ));

        // A non-sync control frame is ignored without a reply
        let flush = ControlMessage::Flush.encode();
        peer.write_u32(flush.len() as u32).await.unwrap();
        peer.write_all(&flush).await.unwrap();

        let request = ControlMessage::SyncRequest { t1: 42 }.encode();
        peer.write_u32(request.len() as u32).await.unwrap();
        peer.write_all(&request).await.unwrap();

        let reply = replies.recv().await.expect("sync reply");
        match ControlMessage::decode(&reply) {
            Some(ControlMessage::SyncResponse { t1, t2, t3 }) => {
                assert_eq!(t1, 42);
                assert!(t3 >= t2);
            }
            other => panic!("unexpected reply: {:?}", other),
        }

        cancel.cancel();
    }

    /// Exchange double with scripted round trips; symmetric legs, so the
    /// derived offset is zero.
    struct ScriptedExchange {
        rtts_us: Vec<u64>,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl ScriptedExchange {
        fn new(rtts_ms: &[u64]) -> Arc<Self> {
            Arc::new(Self {
                rtts_us: rtts_ms.iter().map(|ms| ms * 1_000).collect(),
                calls: std::sync::atomic::AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SyncExchange for ScriptedExchange {
        async fn exchange(&self, t1: u64) -> io::Result<(u64, u64)> {
            let i = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let rtt = self.rtts_us[i % self.rtts_us.len()];
            tokio::time::sleep(Duration::from_micros(rtt)).await;
            let mid = t1 + rtt / 2;
            Ok((mid, mid))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sync_runner_reports_on_attach_and_periodically() {
        let clock = MonotonicClock::new();
        let config = crate::config::StreamConfig::default();
        let playlist: Vec<Box<dyn crate::source::Source>> = vec![Box::new(
            crate::source::MemorySource::new("a", vec![0u8; config.bytes_per_step()]),
        )];
        let source = crate::source::SourceStream::new(
            playlist,
            config.bytes_per_step(),
            config.byte_rate(),
            config.source_error_limit,
        );
        let handle = crate::channel::Channel::spawn_with_emitter(
            "synced".into(),
            source,
            crate::testing::LoopbackEmitter::new(),
            None,
            clock,
            Arc::new(crate::events::NoopEventEmitter),
            Arc::new(crate::store::MemoryStore::new()),
            Arc::new(crate::registry::Registry::new()),
            config,
            SyncConfig::default(),
        );
        let (transport, _rx) = crate::transport::ChannelTransport::new("r1");
        handle
            .attach_receiver("r1", Arc::new(transport))
            .await
            .unwrap();

        // The reference RTT scenario: median 10ms, 500ms outlier ignored
        let exchange = ScriptedExchange::new(&[8, 12, 10, 9, 11, 500, 10, 9, 11, 8, 12]);
        let cancel = spawn_sync_runner(
            "r1",
            handle.clone(),
            exchange.clone() as Arc<dyn SyncExchange>,
            clock,
            SyncConfig::default(),
        );

        // The attach-time round completes well within two virtual seconds
        tokio::time::sleep(Duration::from_secs(2)).await;
        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.receivers[0].latency_us, 5_000);
        assert!(snap.receivers[0].online);
        assert_eq!(exchange.calls(), 11);

        // The next round fires after the sync interval
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(exchange.calls(), 22);

        cancel.cancel();
    }
}
