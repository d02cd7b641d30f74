//! MQTT transport backed by rumqttc.
//!
//! rumqttc reconnects on the next `poll` after a connection error; the
//! session is clean, so the subscription is re-issued on every ConnAck.

use chrono::Utc;
use rallytime_protocol::defaults::{
    DEFAULT_MQTT_KEEP_ALIVE_SECS, DEFAULT_MQTT_PORT, DEFAULT_MQTT_TOPIC_FILTER,
};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::source::{PassMessage, PassSource};

const REQUEST_CHANNEL_CAPACITY: usize = 10;

#[derive(Debug, Clone)]
pub struct MqttSourceConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_filter: String,
    pub keep_alive: Duration,
}

impl Default for MqttSourceConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_MQTT_PORT,
            client_id: format!("rallytime-{}", std::process::id()),
            username: None,
            password: None,
            topic_filter: DEFAULT_MQTT_TOPIC_FILTER.to_string(),
            keep_alive: Duration::from_secs(DEFAULT_MQTT_KEEP_ALIVE_SECS),
        }
    }
}

pub struct MqttSource {
    client: AsyncClient,
    eventloop: EventLoop,
    topic_filter: String,
}

impl MqttSource {
    /// Build the client. No network traffic happens until the first poll.
    pub fn new(config: MqttSourceConfig) -> Self {
        let mut options = MqttOptions::new(config.client_id, config.host, config.port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(true);
        if let Some(username) = config.username {
            options.set_credentials(username, config.password.unwrap_or_default());
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        Self {
            client,
            eventloop,
            topic_filter: config.topic_filter,
        }
    }

    pub fn topic_filter(&self) -> &str {
        &self.topic_filter
    }

    async fn poll_message(&mut self) -> Result<PassMessage, TransportError> {
        loop {
            let event = self
                .eventloop
                .poll()
                .await
                .map_err(|e| TransportError::Connection(e.to_string()))?;

            match event {
                Event::Incoming(Incoming::ConnAck(_)) => {
                    info!("MQTT connected, subscribing to {}", self.topic_filter);
                    self.client
                        .try_subscribe(self.topic_filter.clone(), QoS::AtLeastOnce)
                        .map_err(|e| TransportError::Subscribe {
                            filter: self.topic_filter.clone(),
                            message: e.to_string(),
                        })?;
                }
                Event::Incoming(Incoming::SubAck(_)) => {
                    debug!("Subscribed to {}", self.topic_filter);
                }
                Event::Incoming(Incoming::Publish(publish)) => {
                    return Ok(PassMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                        received_at: Utc::now(),
                    });
                }
                Event::Incoming(Incoming::Disconnect) => {
                    warn!("MQTT broker disconnected us");
                    return Err(TransportError::Closed);
                }
                _ => {}
            }
        }
    }
}

impl PassSource for MqttSource {
    async fn next_message(&mut self) -> Result<PassMessage, TransportError> {
        self.poll_message().await
    }
}
