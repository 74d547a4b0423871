//! MQTT sessions over `rumqttc`

use core::time::Duration;

use log::{debug, warn};
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions,
    Packet, QoS,
};

use super::{Delivery, SessionOptions, Transport, TransportError};

/// Requests queued between the client handle and the event loop
const REQUEST_CAPACITY: usize = 32;

const MQTT_PORT: u16 = 1883;
const MQTTS_PORT: u16 = 8883;
const WS_PORT: u16 = 80;
const WSS_PORT: u16 = 443;

/// A [`Transport`] backed by an `rumqttc` client and event loop.
///
/// Each `connect` builds a fresh client from the session options and
/// drives the event loop until the broker acknowledges the connection.
/// Reconnecting is left to the connector, so the event loop is dropped
/// rather than polled again after an error.
pub struct MqttTransport {
    capacity: usize,
    session: Option<Session>,
}

struct Session {
    client: AsyncClient,
    events: EventLoop,
}

impl MqttTransport {
    pub fn new() -> Self {
        Self {
            capacity: REQUEST_CAPACITY,
            session: None,
        }
    }
}

impl Default for MqttTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MqttTransport {
    async fn connect(&mut self, options: &SessionOptions) -> Result<(), TransportError> {
        self.session = None;
        let mqtt = mqtt_options(options)?;
        let (client, mut events) = AsyncClient::new(mqtt, self.capacity);

        loop {
            match events.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(connect_failed(
                            &options.broker_url,
                            format!("refused: {:?}", ack.code),
                        ));
                    }
                    debug!("MQTT session open on {}", options.broker_url);
                    self.session = Some(Session { client, events });
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => return Err(connect_failed(&options.broker_url, e.to_string())),
            }
        }
    }

    async fn subscribe(&mut self, channel: &str) -> Result<(), TransportError> {
        let session = self.session.as_ref().ok_or(TransportError::Closed)?;
        session
            .client
            .subscribe(channel, QoS::AtMostOnce)
            .await
            .map_err(|e| subscribe_failed(channel, e))
    }

    async fn unsubscribe(&mut self, channel: &str) -> Result<(), TransportError> {
        let session = self.session.as_ref().ok_or(TransportError::Closed)?;
        session
            .client
            .unsubscribe(channel)
            .await
            .map_err(|e| subscribe_failed(channel, e))
    }

    async fn recv(&mut self) -> Result<Delivery, TransportError> {
        let session = self.session.as_mut().ok_or(TransportError::Closed)?;
        loop {
            match session.events.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    return Ok(Delivery::new(publish.topic, publish.payload.to_vec()));
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    self.session = None;
                    return Err(TransportError::Closed);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("MQTT event loop failed: {}", e);
                    self.session = None;
                    return Err(session_lost(e));
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        session
            .client
            .disconnect()
            .await
            .map_err(|e| TransportError::Close(e.to_string()))?;

        // Flush the queued DISCONNECT; the broker hangs up once it is sent.
        loop {
            match session.events.poll().await {
                Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) | Err(_) => return Ok(()),
                Ok(_) => {}
            }
        }
    }
}

/// Map session options onto `rumqttc` options
///
/// `ws://` and `wss://` URLs are handed to `rumqttc` whole, which is how it
/// expects websocket brokers. `tcp://`, `mqtt://`, `mqtts://` and `ssl://`
/// are split into host and port.
pub(crate) fn mqtt_options(options: &SessionOptions) -> Result<MqttOptions, TransportError> {
    let url = options.broker_url.trim();
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| connect_failed(url, "missing scheme"))?;
    let scheme = scheme.to_ascii_lowercase();

    let (default_port, websocket) = match scheme.as_str() {
        "tcp" | "mqtt" => (MQTT_PORT, false),
        "mqtts" | "ssl" => (MQTTS_PORT, false),
        "ws" => (WS_PORT, true),
        "wss" => (WSS_PORT, true),
        other => return Err(connect_failed(url, format!("unsupported scheme {other}"))),
    };

    let authority = rest.split('/').next().unwrap_or_default();
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| connect_failed(url, format!("bad port {port}")))?;
            (host, port)
        }
        None => (authority, default_port),
    };
    if host.is_empty() {
        return Err(connect_failed(url, "missing host"));
    }

    let address = if websocket { url } else { host };
    let mut mqtt = MqttOptions::new(options.client_id.as_str(), address, port);
    mqtt.set_clean_session(true);

    match scheme.as_str() {
        "ws" => {
            mqtt.set_transport(rumqttc::Transport::Ws);
        }
        "wss" => {
            mqtt.set_transport(rumqttc::Transport::wss_with_default_config());
        }
        "mqtts" | "ssl" => {
            mqtt.set_transport(rumqttc::Transport::tls_with_default_config());
        }
        _ => {}
    }

    if let Some(credentials) = &options.credentials {
        mqtt.set_credentials(credentials.login.as_str(), credentials.passcode.as_str());
    }
    if let Some(heartbeat) = options.heartbeat {
        mqtt.set_keep_alive(keep_alive(heartbeat));
    }

    Ok(mqtt)
}

/// MQTT keep-alive is in whole seconds and at least one
fn keep_alive(heartbeat: Duration) -> Duration {
    let secs = heartbeat.as_millis().div_ceil(1000).max(1);
    Duration::from_secs(u64::try_from(secs).unwrap_or(u64::MAX))
}

/// Translate an event loop failure on an open session
pub(crate) fn session_lost(error: ConnectionError) -> TransportError {
    match error {
        // Every client handle is gone, so nothing can reach the broker.
        ConnectionError::RequestsDone => TransportError::Closed,
        other => TransportError::SessionLost(other.to_string()),
    }
}

fn connect_failed(url: &str, details: impl Into<String>) -> TransportError {
    TransportError::Connect {
        url: url.to_owned(),
        details: details.into(),
    }
}

fn subscribe_failed(channel: &str, error: ClientError) -> TransportError {
    TransportError::Subscribe {
        channel: channel.to_owned(),
        details: error.to_string(),
    }
}
