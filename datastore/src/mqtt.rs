use crate::errors::{Error, Result};
use crate::messaging::{device_id_from_topic, parse_message, TOPIC_PREFIX};
use crate::metrics::{
    CHANNEL_FULL_TOTAL, IGNORED_MESSAGES_TOTAL, INVALID_MESSAGES_TOTAL, MESSAGES_TOTAL,
    READINGS_TOTAL,
};
use crate::model::IncomingReading;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub async fn run_mqtt(
    broker: String,
    port: u16,
    client_id: String,
    tx: mpsc::Sender<IncomingReading>,
) -> Result<()> {
    info!("Connecting to MQTT broker at {}:{}", broker, port);

    let mut mqtt_options = MqttOptions::new(client_id, broker, port);
    mqtt_options.set_keep_alive(std::time::Duration::from_secs(30));
    mqtt_options.set_clean_session(false);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10000);

    let topic = format!("{}+", TOPIC_PREFIX);
    client
        .subscribe(&topic, QoS::AtLeastOnce)
        .await
        .map_err(Error::Mqtt)?;

    info!("Subscribed to {} with QoS 1", topic);

    loop {
        match eventloop.poll().await {
            Ok(notification) => {
                if let Event::Incoming(Packet::Publish(publish)) = notification {
                    MESSAGES_TOTAL.inc();

                    debug!(
                        "Received message on topic {}, size: {} bytes",
                        publish.topic,
                        publish.payload.len()
                    );

                    let Some(device_id) = device_id_from_topic(&publish.topic) else {
                        warn!("Ignoring message on unexpected topic {}", publish.topic);
                        INVALID_MESSAGES_TOTAL.inc();
                        continue;
                    };

                    match process_message(device_id, &publish.payload, &tx).await {
                        Ok(()) => {}
                        // The writer is gone; nothing more can be stored.
                        Err(Error::ChannelSend) => return Err(Error::ChannelSend),
                        Err(e) => {
                            error!("Failed to process message from {}: {}", device_id, e);
                            INVALID_MESSAGES_TOTAL.inc();
                        }
                    }
                }
            }
            Err(e) => {
                error!("MQTT error: {}", e);
                // rumqttc reconnects on the next poll
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}

/// Parse one device message and queue its reading, if any.
async fn process_message(
    device_id: &str,
    payload: &[u8],
    tx: &mpsc::Sender<IncomingReading>,
) -> Result<()> {
    let incoming = match parse_message(device_id, payload, Utc::now())? {
        Some(incoming) => incoming,
        None => {
            IGNORED_MESSAGES_TOTAL.inc();
            return Ok(());
        }
    };

    match tx.try_send(incoming) {
        Ok(()) => {
            READINGS_TOTAL.inc();
            Ok(())
        }
        Err(mpsc::error::TrySendError::Full(incoming)) => {
            CHANNEL_FULL_TOTAL.inc();
            debug!("Channel full, using blocking send");
            tx.send(incoming).await.map_err(|_| Error::ChannelSend)?;
            READINGS_TOTAL.inc();
            Ok(())
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            error!("Channel closed, cannot queue reading");
            Err(Error::ChannelSend)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env_var_payload() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "messageType": "EnvVar",
            "var": "air_temperature_celsius",
            "values": "{'values':[{'name':'SHT25-Top','type':'float','value':24.0}]}"
        }))
        .unwrap()
    }

    #[test]
    fn test_process_message_valid() {
        tokio_test::block_on(async {
            let (tx, mut rx) = mpsc::channel(10);

            assert!(process_message("test-dev", &env_var_payload(), &tx)
                .await
                .is_ok());

            let received = rx.recv().await.unwrap();
            assert_eq!(received.device_id, "test-dev");
            assert_eq!(received.metric, "air_temperature_celsius");
            assert_eq!(received.reading.value, "24.0");
        });
    }

    #[test]
    fn test_process_message_ignored_type() {
        tokio_test::block_on(async {
            let (tx, mut rx) = mpsc::channel(10);
            let payload = serde_json::to_vec(&json!({
                "messageType": "RecipeEvent",
                "action": "stop"
            }))
            .unwrap();

            assert!(process_message("test-dev", &payload, &tx).await.is_ok());
            drop(tx);
            assert!(rx.recv().await.is_none());
        });
    }

    #[test]
    fn test_process_message_invalid_json() {
        tokio_test::block_on(async {
            let (tx, _rx) = mpsc::channel(10);
            assert!(process_message("test-dev", b"invalid json", &tx)
                .await
                .is_err());
        });
    }

    #[test]
    fn test_process_message_closed_channel() {
        tokio_test::block_on(async {
            let (tx, rx) = mpsc::channel(10);
            drop(rx);
            assert!(matches!(
                process_message("test-dev", &env_var_payload(), &tx).await,
                Err(Error::ChannelSend)
            ));
        });
    }
}
