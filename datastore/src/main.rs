use axum::{routing::get, Router};
use datastore::{metrics, mqtt, open_store, rest, writer, ServiceConfig};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = ServiceConfig::from_env();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting device datastore");
    info!("Store backend: {}", config.store_backend);
    info!("MQTT broker: {}:{}", config.mqtt_broker, config.mqtt_port);
    info!("HTTP server: {}", config.http_addr);
    info!("Database: {}", config.redacted_database_url());

    metrics::init_metrics();

    let store = match open_store(config.store_backend, &config.database_url).await {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open store: {}", e);
            std::process::exit(1);
        }
    };

    info!("Channel capacity: {}", config.channel_capacity);
    let (tx, rx) = mpsc::channel(config.channel_capacity);

    let client_id = format!("datastore-{}", uuid::Uuid::new_v4());
    let (broker, port) = (config.mqtt_broker.clone(), config.mqtt_port);
    let mqtt_handle = tokio::spawn(async move {
        if let Err(e) = mqtt::run_mqtt(broker, port, client_id, tx).await {
            error!("MQTT task failed: {}", e);
        }
    });

    let writer_store = store.clone();
    let (batch_size, batch_timeout_ms) = (config.batch_size, config.batch_timeout_ms);
    let writer_handle = tokio::spawn(async move {
        writer::run_writer(rx, writer_store, batch_size, batch_timeout_ms).await;
    });

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(store));

    let listener = match tokio::net::TcpListener::bind(&config.http_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        }
    };

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });

    tokio::select! {
        _ = mqtt_handle => {
            error!("MQTT task terminated");
        }
        _ = writer_handle => {
            error!("Writer task terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
