use axum::routing::get;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use classify_fleet::{
    app_state::AppState,
    config::{AppConfig, FleetBackend},
    init_tracing, routes,
    services::{
        autoscaler::Autoscaler,
        fleet::{FleetController, HttpFleetController, LocalFleet},
        gateway::Gateway,
        queue::{QueueClient, RedisQueue},
        storage::{ArtifactStore, S3Store},
        worker::Worker,
    },
};

#[tokio::main]
async fn main() {
    init_tracing();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing classify-fleet gateway");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    describe_metrics();

    tracing::info!("Connecting to Redis queues");
    let queue: Arc<dyn QueueClient> = Arc::new(
        RedisQueue::new(&config.redis_url, config.visibility_timeout())
            .expect("Failed to initialize queue client"),
    );

    tracing::info!("Initializing S3 artifact store");
    let storage: Arc<dyn ArtifactStore> = Arc::new(
        S3Store::new(&config.s3_settings()).expect("Failed to initialize artifact store"),
    );

    let shutdown = CancellationToken::new();

    let gateway = Arc::new(Gateway::new(
        Arc::clone(&queue),
        Arc::clone(&storage),
        config.gateway_settings(),
    ));
    tokio::spawn(Arc::clone(&gateway).run_response_poller(shutdown.clone()));

    // Fleet control
    let mut local_fleet: Option<Arc<LocalFleet>> = None;
    let instance_ids = config.instance_ids();
    if instance_ids.is_empty() {
        tracing::warn!("No INSTANCE_IDS configured, autoscaler disabled");
    } else {
        let fleet: Arc<dyn FleetController> = match config.fleet_backend {
            FleetBackend::Http => {
                let endpoint = config
                    .fleet_endpoint()
                    .expect("FLEET_ENDPOINT is required for the http fleet backend");
                tracing::info!(endpoint, "Using fleet API");
                Arc::new(HttpFleetController::new(
                    endpoint,
                    config.fleet_api_token.clone(),
                ))
            }
            FleetBackend::Local => {
                tracing::info!("Running fleet instances as in-process workers");
                let classifier = config
                    .build_classifier()
                    .expect("Failed to initialize classifier");
                let worker = Arc::new(Worker::new(
                    Arc::clone(&queue),
                    Arc::clone(&storage),
                    classifier,
                    config.worker_settings(),
                ));
                let fleet = Arc::new(LocalFleet::new(worker));
                local_fleet = Some(Arc::clone(&fleet));
                fleet
            }
        };

        let autoscaler = Autoscaler::new(
            Arc::clone(&queue),
            fleet,
            config.scaling_policy(),
            config.request_queue.clone(),
            instance_ids,
            config.autoscale_period(),
        );
        tokio::spawn(autoscaler.run(shutdown.clone()));
    }

    let state = AppState::new(gateway, queue, storage);

    let app = routes::router(state, config.max_upload_bytes).route(
        "/metrics",
        get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
    );

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown signal received");
            signal.cancel();
        })
        .await
        .expect("Server error");

    shutdown.cancel();
    if let Some(fleet) = local_fleet {
        fleet.shutdown();
    }
}

fn describe_metrics() {
    metrics::describe_counter!(
        "classify_jobs_submitted_total",
        "Total classification jobs submitted"
    );
    metrics::describe_counter!(
        "classify_jobs_completed_total",
        "Submissions answered with a label"
    );
    metrics::describe_counter!(
        "classify_jobs_timed_out_total",
        "Submissions that hit the gateway deadline"
    );
    metrics::describe_counter!(
        "classify_jobs_failed_total",
        "Submissions that failed on storage or queue errors"
    );
    metrics::describe_histogram!(
        "classify_submit_seconds",
        "Time from submission to label or timeout"
    );
    metrics::describe_gauge!(
        "classify_pending_correlations",
        "Submissions currently awaiting a result"
    );
    metrics::describe_counter!(
        "classify_unclaimed_results_total",
        "Results received that no local submission was waiting for"
    );
    metrics::describe_gauge!(
        "classify_queue_depth",
        "Approximate number of jobs waiting in the request queue"
    );
    metrics::describe_gauge!("classify_fleet_running", "Fleet instances running or starting");
    metrics::describe_gauge!("classify_fleet_target", "Fleet size chosen by the autoscaler");
}
