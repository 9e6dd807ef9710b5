use crate::config::Config;
use crate::telemetry::{parse_payload, Reading};
use anyhow::Result;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

/// Subscribes to the configured topics and forwards normalized readings to the
/// ingest loop, reconnecting until `cancel` fires.
pub async fn run_listener(
    config: Config,
    tx: mpsc::Sender<Vec<Reading>>,
    cancel: CancellationToken,
) -> Result<()> {
    let fallback_ip = config.fallback_ip.clone();
    'connect: loop {
        if cancel.is_cancelled() {
            break;
        }
        let mut mqttoptions = MqttOptions::new(
            config.mqtt_client_id.clone(),
            config.mqtt_host.clone(),
            config.mqtt_port,
        );
        mqttoptions.set_keep_alive(config.mqtt_keepalive());
        if let Some(username) = &config.mqtt_username {
            mqttoptions.set_credentials(
                username.clone(),
                config.mqtt_password.clone().unwrap_or_default(),
            );
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 64);
        for topic in &config.mqtt_topics {
            if let Err(err) = client.subscribe(topic.clone(), QoS::AtLeastOnce).await {
                tracing::warn!(error=%err, %topic, "failed to subscribe to MQTT; retrying");
                sleep(Duration::from_secs(2)).await;
                continue 'connect;
            }
        }

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(err) = client.disconnect().await {
                        tracing::debug!(error=%err, "MQTT disconnect failed");
                    }
                    break 'connect;
                }
                event = eventloop.poll() => event,
            };
            match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    tracing::info!(
                        host = %config.mqtt_host,
                        topics = ?config.mqtt_topics,
                        "connected to MQTT broker"
                    );
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let received_at = Utc::now();
                    let mut payload = publish.payload.to_vec();
                    match parse_payload(&mut payload, received_at, &fallback_ip) {
                        Ok(readings) if readings.is_empty() => {
                            tracing::debug!(topic=%publish.topic, "payload carried no device readings");
                        }
                        Ok(readings) => {
                            if tx.send(readings).await.is_err() {
                                tracing::warn!("ingest loop closed; stopping MQTT listener");
                                break 'connect;
                            }
                        }
                        Err(err) => {
                            tracing::warn!(error=%err, topic=%publish.topic, "failed to decode MQTT payload");
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error=%err, "MQTT connection dropped; reconnecting");
                    break;
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(config.mqtt_reconnect_delay()) => {}
        }
    }
    tracing::info!("MQTT listener stopped");
    Ok(())
}
