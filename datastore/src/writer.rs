use crate::metrics::{BATCH_SIZE, WRITE_LATENCY_SECONDS};
use crate::model::IncomingReading;
use crate::store::DeviceDataStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tracing::{debug, error, info};

const MAX_RETRIES: u32 = 3;

/// Drain readings from `rx` into `store`, flushing at `max_batch` readings
/// or every `max_wait_ms`, whichever comes first.
pub async fn run_writer(
    mut rx: mpsc::Receiver<IncomingReading>,
    store: Arc<dyn DeviceDataStore>,
    max_batch: usize,
    max_wait_ms: u64,
) {
    info!(
        "Starting writer with max_batch={}, max_wait_ms={}",
        max_batch, max_wait_ms
    );

    let mut buffer: Vec<IncomingReading> = Vec::with_capacity(max_batch);
    let mut ticker = interval(Duration::from_millis(max_wait_ms.max(1)));

    loop {
        tokio::select! {
            incoming = rx.recv() => {
                match incoming {
                    Some(r) => {
                        buffer.push(r);
                        if buffer.len() >= max_batch {
                            flush_batch(store.as_ref(), &mut buffer).await;
                        }
                    }
                    None => {
                        info!("Channel closed, flushing remaining batch");
                        flush_batch(store.as_ref(), &mut buffer).await;
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush_batch(store.as_ref(), &mut buffer).await;
                }
            }
        }
    }

    info!("Writer stopped");
}

async fn flush_batch(store: &dyn DeviceDataStore, buffer: &mut Vec<IncomingReading>) {
    let batch_len = buffer.len();
    if batch_len == 0 {
        return;
    }

    debug!("Flushing batch of {} readings", batch_len);
    BATCH_SIZE.set(batch_len as f64);

    let start = Instant::now();
    let mut attempt = 0;

    loop {
        attempt += 1;

        match store.save_batch(buffer).await {
            Ok(()) => {
                let elapsed = start.elapsed().as_secs_f64();
                WRITE_LATENCY_SECONDS.observe(elapsed);
                if attempt > 1 {
                    info!(
                        "Batch written after {} attempts in {:.3}s",
                        attempt, elapsed
                    );
                } else {
                    debug!("Batch written in {:.3}s", elapsed);
                }
                buffer.clear();
                BATCH_SIZE.set(0.0);
                return;
            }
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    error!("Failed to write batch after {} attempts: {}", MAX_RETRIES, e);
                    error!("{} readings dropped", batch_len);
                    buffer.clear();
                    BATCH_SIZE.set(0.0);
                    return;
                }

                // 100ms, 200ms
                let backoff_ms = 100 * 2_u64.pow(attempt - 1);
                error!(
                    "Failed to write batch (attempt {}/{}): {}. Retrying in {}ms...",
                    attempt, MAX_RETRIES, e, backoff_ms
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            }
        }
    }
}
