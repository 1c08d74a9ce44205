use classify_fleet::{
    config::AppConfig,
    init_tracing,
    services::{queue::RedisQueue, storage::S3Store, worker::Worker},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    init_tracing();

    tracing::info!("Starting classification worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    tracing::info!("Initializing services");
    let queue = RedisQueue::new(&config.redis_url, config.visibility_timeout())
        .expect("Failed to initialize queue client");

    let storage = S3Store::new(&config.s3_settings()).expect("Failed to initialize artifact store");

    let classifier = config
        .build_classifier()
        .expect("Failed to initialize classifier");

    let worker = Worker::new(
        Arc::new(queue),
        Arc::new(storage),
        classifier,
        config.worker_settings(),
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutdown signal received");
        signal.cancel();
    });

    worker.run(shutdown).await;
}
