// src/bus.rs
//! MQTT transport and the publisher seam.
//!
//! The core never talks to rumqttc directly: it publishes through the
//! [`Publisher`] trait and receives inbound messages over a channel that
//! the transport task feeds. That keeps the core single-threaded and
//! lets the test suite swap in a [`RecordingBus`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;

use crate::config::BrokerConfig;
use crate::error::{Result, VigilError};

/// Outbound side of the bus. Publishing must not block the core loop.
pub trait Publisher: Send {
    fn publish(&self, topic: &str, payload: &str);
}

/// Match a concrete topic against a subscription pattern, one level at
/// a time: `+` consumes exactly one topic level, `#` accepts whatever
/// remains. Both sides must run out together for a match.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut levels = topic.split('/');
    for wanted in pattern.split('/') {
        match wanted {
            "#" => return true,
            "+" => {
                if levels.next().is_none() {
                    return false;
                }
            }
            literal => {
                if levels.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    levels.next().is_none()
}

/// Publisher over a live rumqttc client.
#[derive(Clone)]
pub struct MqttBus {
    client: AsyncClient,
}

impl Publisher for MqttBus {
    fn publish(&self, topic: &str, payload: &str) {
        if let Err(e) = self
            .client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
        {
            warn!("Publish to '{topic}' failed: {e}");
        }
    }
}

/// Owns the rumqttc event loop: subscribes, forwards inbound publishes
/// onto the core loop channel and rides out reconnects. The application
/// layer never retries; redelivery of subscriptions is handled here.
pub struct MqttTransport {
    client: AsyncClient,
    eventloop: EventLoop,
}

impl MqttTransport {
    /// Connect and return the transport plus a cloneable publisher.
    /// `online_topic` carries the last-will `0` so consumers see the
    /// service drop off the bus.
    pub fn connect(config: &BrokerConfig, online_topic: &str) -> Result<(Self, MqttBus)> {
        let mut options =
            MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        options.set_last_will(LastWill::new(online_topic, "0", QoS::AtLeastOnce, true));
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user.clone(), pass.clone());
        }

        let (client, eventloop) = AsyncClient::new(options, 100);
        Ok((
            Self {
                client: client.clone(),
                eventloop,
            },
            MqttBus { client },
        ))
    }

    /// Drive the event loop, feeding inbound publishes to `inbound`.
    /// Subscriptions are (re-)established on every ConnAck. Returns
    /// when the core drops the receiving side.
    pub async fn run(
        mut self,
        subscriptions: Vec<String>,
        inbound: mpsc::UnboundedSender<(String, String)>,
    ) -> Result<()> {
        let mut reconnect_delay = Duration::from_secs(1);
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to MQTT broker");
                    reconnect_delay = Duration::from_secs(1);
                    for topic in &subscriptions {
                        if let Err(e) = self.client.subscribe(topic.clone(), QoS::AtLeastOnce).await {
                            return Err(VigilError::Mqtt(format!(
                                "subscribe to '{topic}' failed: {e}"
                            )));
                        }
                        debug!("Subscribed to '{topic}'");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                    if inbound.send((publish.topic, payload)).is_err() {
                        return Ok(());
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT connection error: {e}, retrying in {reconnect_delay:?}");
                    tokio::time::sleep(reconnect_delay).await;
                    reconnect_delay = (reconnect_delay * 2).min(Duration::from_secs(60));
                }
            }
        }
    }
}

/// Publisher that records everything; the test suite's stand-in broker.
#[derive(Clone, Default)]
pub struct RecordingBus {
    messages: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain everything published since the last call.
    pub fn take(&self) -> Vec<(String, String)> {
        std::mem::take(&mut *self.messages.lock().expect("recording bus poisoned"))
    }
}

impl Publisher for RecordingBus {
    fn publish(&self, topic: &str, payload: &str) {
        self.messages
            .lock()
            .expect("recording bus poisoned")
            .push((topic.to_string(), payload.to_string()));
    }
}
