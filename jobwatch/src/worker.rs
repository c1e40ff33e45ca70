use std::time::Duration;

use metrics::{counter, histogram};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::dedup::{DedupOutcome, Deduplicator};
use crate::error::{CycleError, WorkerError};
use crate::health::HealthHandle;
use crate::sink::PostingSink;
use crate::source::PostingSource;

/// What happened during one completed cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleStats {
    pub fetched: usize,
    pub delivered: usize,
    pub duplicates: usize,
    pub check_failures: usize,
    pub delivery_failures: usize,
}

/// The ingestion loop: harvest the board, drop what was already announced,
/// announce the rest.
///
/// Cycles run strictly one after another on a fixed interval, starting with
/// one immediately at startup. A cycle that overruns its interval delays
/// the next one instead of piling up behind it. The worker only ever exits
/// through its cancellation token.
pub struct PostingWorker<S, K> {
    /// An identifier for this worker, used in logs.
    name: String,
    /// Where postings are harvested from, once per cycle.
    source: S,
    /// Decides which postings were already announced.
    dedup: Deduplicator,
    /// Where new postings get announced.
    sink: K,
    /// Time between the starts of two cycles.
    interval: Duration,
    /// The liveness check handle, reported on every scheduler pass.
    liveness: HealthHandle,
    /// Cancelling this token unblocks whatever the worker is waiting on.
    shutdown: CancellationToken,
}

impl<S: PostingSource, K: PostingSink> PostingWorker<S, K> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        source: S,
        dedup: Deduplicator,
        sink: K,
        interval: Duration,
        liveness: HealthHandle,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            name: name.to_owned(),
            source,
            dedup,
            sink,
            interval,
            liveness,
            shutdown,
        }
    }

    /// Run cycles until the shutdown token fires. Cancellation is honored
    /// at every wait: the periodic trigger, rate-limit tokens and throttle
    /// backoffs inside the sink. A send that has not completed when the
    /// token fires does not happen.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let mut ticker = interval(self.interval);
        // an overrunning cycle must not cause a burst of catch-up cycles
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            name = %self.name,
            interval_secs = self.interval.as_secs(),
            "worker starting"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!(name = %self.name, "worker stopping, shutdown requested");
                    return Err(WorkerError::Cancelled);
                }
                _ = ticker.tick() => {}
            }

            self.liveness.report_healthy().await;

            let start = Instant::now();
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!(name = %self.name, "worker stopping mid-cycle, shutdown requested");
                    return Err(WorkerError::Cancelled);
                }
                result = self.run_cycle() => match result {
                    Ok(stats) => {
                        counter!("cycles_total", "outcome" => "ok").increment(1);
                        histogram!("cycle_duration_seconds").record(start.elapsed().as_secs_f64());
                        info!(
                            name = %self.name,
                            fetched = stats.fetched,
                            delivered = stats.delivered,
                            duplicates = stats.duplicates,
                            check_failures = stats.check_failures,
                            delivery_failures = stats.delivery_failures,
                            "cycle finished"
                        );
                    }
                    Err(err) => {
                        counter!("cycles_total", "outcome" => "error").increment(1);
                        error!(name = %self.name, error = %err, "cycle aborted");
                    }
                }
            }

            self.liveness.report_healthy().await;
        }
    }

    /// One harvest-filter-announce pass.
    ///
    /// Only an extractor failure aborts the cycle. Per-posting trouble is
    /// counted and logged, then the loop moves on: a failed dedup check
    /// skips the posting without recording it, so it gets another chance
    /// next cycle, while a failed send leaves the posting recorded and it
    /// will not be announced again.
    pub async fn run_cycle(&self) -> Result<CycleStats, CycleError> {
        let postings = self.source.fetch_postings().await?;

        let mut stats = CycleStats {
            fetched: postings.len(),
            ..CycleStats::default()
        };

        for posting in &postings {
            match self.dedup.check_and_mark(posting.dedup_key()).await {
                Ok(DedupOutcome::New) => match self.sink.send(posting).await {
                    Ok(()) => stats.delivered += 1,
                    Err(err) => {
                        stats.delivery_failures += 1;
                        error!(link = %posting.link, error = %err, "failed to announce posting");
                    }
                },
                Ok(DedupOutcome::Duplicate) => {
                    stats.duplicates += 1;
                    debug!(link = %posting.link, "posting already announced, skipping");
                }
                Err(err) => {
                    stats.check_failures += 1;
                    error!(link = %posting.link, error = %err, "dedup check failed, skipping posting");
                }
            }
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::FINGERPRINT_NAMESPACE;
    use crate::health::HealthRegistry;
    use crate::posting::Posting;
    use crate::redis::{MockRedisClient, StoreError};
    use crate::sink::RecordingSink;
    use crate::source::{MemorySource, SourceError};
    use std::sync::Arc;

    const ONE_HOUR: Duration = Duration::from_secs(3600);

    fn posting(id: u32) -> Posting {
        Posting {
            title: format!("Posting {id}"),
            company: "Acme Corp".to_string(),
            work_status: "Remote".to_string(),
            location: "Worldwide".to_string(),
            skills: vec!["Rust".to_string()],
            link: format!("https://jobs.example/postings/{id}"),
        }
    }

    async fn worker(
        source: MemorySource,
        store: MockRedisClient,
        sink: RecordingSink,
        interval: Duration,
    ) -> PostingWorker<MemorySource, RecordingSink> {
        let registry = HealthRegistry::new("liveness");
        let liveness = registry
            .register("worker".to_string(), time::Duration::seconds(30))
            .await;

        PostingWorker::new(
            "worker",
            source,
            Deduplicator::new(Arc::new(store), FINGERPRINT_NAMESPACE),
            sink,
            interval,
            liveness,
            CancellationToken::new(),
        )
    }

    async fn wait_until<F>(check: F)
    where
        F: Fn() -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(check())
    }

    #[tokio::test]
    async fn a_cycle_announces_each_identity_once() {
        let mut repeat = posting(1);
        repeat.title = "Posting 1 (reposted)".to_string();
        let source = MemorySource::new().push_batch(vec![posting(1), posting(2), repeat]);
        let sink = RecordingSink::new();
        let worker = worker(source, MockRedisClient::new(), sink.clone(), ONE_HOUR).await;

        let stats = worker.run_cycle().await.unwrap();

        assert_eq!(
            stats,
            CycleStats {
                fetched: 3,
                delivered: 2,
                duplicates: 1,
                ..CycleStats::default()
            }
        );
        assert_eq!(sink.sent(), vec![posting(1), posting(2)]);
    }

    #[tokio::test]
    async fn later_cycles_only_announce_unseen_postings() {
        let source = MemorySource::new().push_batch(vec![posting(1), posting(2)]);
        source.push_batch(vec![posting(1), posting(2), posting(3)]);
        let sink = RecordingSink::new();
        let worker = worker(source, MockRedisClient::new(), sink.clone(), ONE_HOUR).await;

        worker.run_cycle().await.unwrap();
        let stats = worker.run_cycle().await.unwrap();

        assert_eq!(
            stats,
            CycleStats {
                fetched: 3,
                delivered: 1,
                duplicates: 2,
                ..CycleStats::default()
            }
        );
        assert_eq!(sink.sent(), vec![posting(1), posting(2), posting(3)]);
    }

    #[tokio::test]
    async fn sightings_survive_a_restart() {
        let store = MockRedisClient::new();

        let before = worker(
            MemorySource::new().push_batch(vec![posting(1)]),
            store.clone(),
            RecordingSink::new(),
            ONE_HOUR,
        )
        .await;
        before.run_cycle().await.unwrap();

        // fresh worker over the same store, as after a process restart
        let sink = RecordingSink::new();
        let after = worker(
            MemorySource::new().push_batch(vec![posting(1)]),
            store,
            sink.clone(),
            ONE_HOUR,
        )
        .await;
        let stats = after.run_cycle().await.unwrap();

        assert_eq!(stats.duplicates, 1);
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn a_failed_check_skips_the_posting_but_not_the_cycle() {
        let store = MockRedisClient::new().err_ret(StoreError::Timeout);
        let source = MemorySource::new().push_batch(vec![posting(1), posting(2)]);
        source.push_batch(vec![posting(1)]);
        let sink = RecordingSink::new();
        let worker = worker(source, store, sink.clone(), ONE_HOUR).await;

        let stats = worker.run_cycle().await.unwrap();

        assert_eq!(
            stats,
            CycleStats {
                fetched: 2,
                delivered: 1,
                check_failures: 1,
                ..CycleStats::default()
            }
        );
        assert_eq!(sink.sent(), vec![posting(2)]);

        // the failed check recorded nothing, so the posting is announced next cycle
        let stats = worker.run_cycle().await.unwrap();
        assert_eq!(stats.delivered, 1);
        assert_eq!(sink.sent(), vec![posting(2), posting(1)]);
    }

    #[tokio::test]
    async fn a_fetch_failure_aborts_the_cycle() {
        let source =
            MemorySource::new().push_error(SourceError::Status(reqwest::StatusCode::BAD_GATEWAY));
        let sink = RecordingSink::new();
        let worker = worker(source, MockRedisClient::new(), sink.clone(), ONE_HOUR).await;

        let result = worker.run_cycle().await;

        assert!(matches!(result, Err(CycleError::Fetch(_))));
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn a_failed_send_counts_and_is_not_retried_later() {
        let source = MemorySource::new().push_batch(vec![posting(1), posting(2)]);
        source.push_batch(vec![posting(1)]);
        let sink = RecordingSink::new().fail_next(1);
        let worker = worker(source, MockRedisClient::new(), sink.clone(), ONE_HOUR).await;

        let stats = worker.run_cycle().await.unwrap();

        assert_eq!(
            stats,
            CycleStats {
                fetched: 2,
                delivered: 1,
                delivery_failures: 1,
                ..CycleStats::default()
            }
        );
        assert_eq!(sink.sent(), vec![posting(2)]);

        // the posting was recorded before the send failed, announcing is at-most-once
        let stats = worker.run_cycle().await.unwrap();
        assert_eq!(stats.duplicates, 1);
        assert_eq!(sink.sent(), vec![posting(2)]);
    }

    #[tokio::test]
    async fn run_performs_the_first_cycle_immediately() {
        let source = MemorySource::new().push_batch(vec![posting(1)]);
        let sink = RecordingSink::new();
        let worker = worker(source, MockRedisClient::new(), sink.clone(), ONE_HOUR).await;
        let shutdown = worker.shutdown.clone();

        let handle = tokio::spawn(async move { worker.run().await });

        // no tick interval has elapsed yet, the first cycle runs anyway
        wait_until(|| sink.sent().len() == 1).await;

        shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker did not stop after cancellation")
            .unwrap();
        assert!(matches!(result, Err(WorkerError::Cancelled)));
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_cycle_in_flight() {
        let source = MemorySource::new().push_batch(vec![posting(1)]);
        let sink = RecordingSink::new().delay_sends(Duration::from_secs(30));
        let worker = worker(source, MockRedisClient::new(), sink.clone(), ONE_HOUR).await;
        let shutdown = worker.shutdown.clone();

        let handle = tokio::spawn(async move { worker.run().await });

        // let the first cycle reach the slow send, then pull the plug
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker did not stop after cancellation")
            .unwrap();
        assert!(matches!(result, Err(WorkerError::Cancelled)));
        // the interrupted send never completed
        assert!(sink.sent().is_empty());
    }
}
