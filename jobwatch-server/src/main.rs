//! Harvest job postings on a schedule and announce the new ones.
use std::sync::Arc;

use envconfig::Envconfig;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use jobwatch::config::Config;
use jobwatch::dedup::{Deduplicator, FINGERPRINT_NAMESPACE};
use jobwatch::error::WorkerError;
use jobwatch::health::HealthRegistry;
use jobwatch::redis::{Client, RedisClient};
use jobwatch::sink::PrintSink;
use jobwatch::sinks::telegram::TelegramSink;
use jobwatch::source::BoardSource;
use jobwatch::status::{serve, setup_metrics_recorder, status_router};
use jobwatch::worker::PostingWorker;

async fn shutdown(token: CancellationToken) {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("shutting down gracefully...");
    token.cancel();
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let redis = Arc::new(
        RedisClient::new(config.redis_url.clone()).expect("failed to create redis client"),
    );
    tokio::time::timeout(config.setup_timeout.0, redis.ping())
        .await
        .expect("timed out waiting for redis")
        .expect("failed to reach redis");

    let dedup = Deduplicator::new(redis, FINGERPRINT_NAMESPACE);

    let source = BoardSource::new(config.board_url.as_str(), config.fetch_timeout.0)
        .expect("failed to create board source");

    let liveness = HealthRegistry::new("liveness");
    // a worker that misses three cycles in a row is wedged
    let worker_liveness = liveness
        .register(
            "worker".to_string(),
            time::Duration::try_from(3 * config.cycle_interval.0)
                .expect("invalid cycle interval"),
        )
        .await;

    let token = CancellationToken::new();
    tokio::task::spawn(shutdown(token.clone()));

    let recorder_handle = setup_metrics_recorder();
    let router = status_router(liveness, Some(recorder_handle));
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving status endpoints");
    });

    let result = if config.print_sink {
        let worker = PostingWorker::new(
            &config.worker_name,
            source,
            dedup,
            PrintSink {},
            config.cycle_interval.0,
            worker_liveness,
            token,
        );
        worker.run().await
    } else {
        let sink =
            TelegramSink::new(config.telegram.clone()).expect("failed to create telegram sink");

        let worker = PostingWorker::new(
            &config.worker_name,
            source,
            dedup,
            sink,
            config.cycle_interval.0,
            worker_liveness,
            token,
        );
        worker.run().await
    };

    match result {
        Err(WorkerError::Cancelled) => tracing::info!("worker stopped"),
        Ok(()) => tracing::warn!("worker exited without a shutdown request"),
    }
}
