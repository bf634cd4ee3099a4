//! Per-device sensor reading storage.
//!
//! [`DeviceDataStore`] is the capability the rest of the system depends on;
//! [`MemoryStore`] and [`PgStore`] implement it. The service binary feeds
//! it from MQTT device messages and serves it over HTTP.

pub mod config;
pub mod db;
pub mod errors;
pub mod literal;
pub mod messaging;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod rest;
pub mod store;
pub mod validate;
pub mod writer;

pub use config::{ServiceConfig, StoreBackend};
pub use db::PgStore;
pub use errors::{Error, Result};
pub use model::{DeviceDataRow, DeviceReading, IncomingReading};
pub use store::{DeviceDataStore, MemoryStore};

use std::sync::Arc;

/// Open the configured store.
pub async fn open_store(
    backend: StoreBackend,
    database_url: &str,
) -> Result<Arc<dyn DeviceDataStore>> {
    let store: Arc<dyn DeviceDataStore> = match backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Postgres => Arc::new(PgStore::connect(database_url).await?),
    };
    Ok(store)
}
