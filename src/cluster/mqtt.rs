//! MQTT-backed fabric using rumqttc.
//!
//! Each instance connects to the broker with its instance id as the MQTT
//! client id, subscribes to the three cluster channels, and forwards every
//! incoming publish into a broadcast channel consumed by the bridge.

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use super::{ClusterError, Fabric, FabricEvent, CHANNELS};

/// Configuration for the MQTT connection.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// Broker URL (e.g., "mqtt://localhost:1883")
    pub broker_url: String,
    /// Client id for this instance; also the instance tag on publications.
    pub client_id: String,
    /// Keep-alive interval in seconds
    pub keep_alive_secs: u64,
    /// Whether to use clean session
    pub clean_session: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_url: "mqtt://localhost:1883".to_string(),
            client_id: uuid::Uuid::new_v4().to_string(),
            keep_alive_secs: 60,
            clean_session: true,
        }
    }
}

pub struct MqttFabric {
    client: AsyncClient,
    client_id: String,
    event_tx: broadcast::Sender<FabricEvent>,
}

impl MqttFabric {
    /// Connects to the broker, subscribes to the cluster channels and
    /// spawns the polling task that feeds [`Fabric::events`].
    pub async fn connect(config: MqttConfig) -> Result<Self, ClusterError> {
        let (host, port) = parse_broker_url(&config.broker_url)?;

        let mut options = MqttOptions::new(&config.client_id, host, port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        options.set_clean_session(config.clean_session);

        let (client, mut event_loop) = AsyncClient::new(options, 256);
        let (event_tx, _) = broadcast::channel(1024);

        let tx = event_tx.clone();
        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        // Ignore send errors: no bridge attached yet.
                        let _ = tx.send(FabricEvent {
                            channel: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                        });
                    }
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        info!("connected to MQTT broker: {:?}", ack.code);
                    }
                    Ok(event) => {
                        debug!("mqtt event: {:?}", event);
                    }
                    Err(e) => {
                        error!("mqtt event loop error: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        for channel in CHANNELS {
            client
                .subscribe(channel, QoS::AtMostOnce)
                .await
                .map_err(|e| ClusterError::Subscribe(e.to_string()))?;
        }

        info!(
            "MQTT fabric connected to {} as {}",
            config.broker_url, config.client_id
        );

        Ok(Self {
            client,
            client_id: config.client_id,
            event_tx,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

#[async_trait]
impl Fabric for MqttFabric {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), ClusterError> {
        self.client
            .publish(channel, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| ClusterError::Publish(e.to_string()))
    }

    fn events(&self) -> broadcast::Receiver<FabricEvent> {
        self.event_tx.subscribe()
    }
}

/// Parse a broker URL of the form "mqtt://host:port" into host and port.
fn parse_broker_url(url: &str) -> Result<(String, u16), ClusterError> {
    let stripped = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);

    match stripped.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| ClusterError::Connection(format!("invalid port in {url}")))?;
            Ok((host.to_string(), port))
        }
        None => Ok((stripped.to_string(), 1883)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_url_with_scheme_and_port() {
        let (host, port) = parse_broker_url("mqtt://broker.internal:2883").unwrap();
        assert_eq!(host, "broker.internal");
        assert_eq!(port, 2883);
    }

    #[test]
    fn broker_url_defaults_port() {
        let (host, port) = parse_broker_url("mqtt://localhost").unwrap();
        assert_eq!(host, "localhost");
        assert_eq!(port, 1883);
    }

    #[test]
    fn broker_url_rejects_bad_port() {
        assert!(parse_broker_url("mqtt://localhost:notaport").is_err());
    }
}
