//! Transport seam for the source connectors
//!
//! The engine does not speak MQTT or STOMP itself. A broker client library is
//! wrapped in a [`Transport`] that delivers decoded message bodies, and the
//! connector drives it through connect, subscribe, receive and close.
//! [`MqttTransport`] talks to a real broker. [`ChannelTransport`] is the
//! in-process implementation used by the simulator and the tests.

mod channel;
mod mqtt;

pub use channel::{ChannelFeed, ChannelTransport, FeedClosed, channel_transport};
pub use mqtt::MqttTransport;

use core::future::Future;
use core::time::Duration;

use thiserror::Error;

/// One message as delivered by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Topic or destination the message arrived on
    pub channel: String,
    /// Message body, expected to be UTF-8 JSON
    pub payload: Vec<u8>,
}

impl Delivery {
    pub fn new(channel: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// Login for broker sessions that require one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub login: String,
    pub passcode: String,
}

/// Everything a transport needs to open a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub broker_url: String,
    pub client_id: String,
    pub credentials: Option<Credentials>,
    pub heartbeat: Option<Duration>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect to {url} failed: {details}")]
    Connect { url: String, details: String },
    #[error("subscribe to {channel} failed: {details}")]
    Subscribe { channel: String, details: String },
    #[error("session lost: {0}")]
    SessionLost(String),
    #[error("session closed by peer")]
    Closed,
    #[error("close failed: {0}")]
    Close(String),
}

/// A message-oriented session with one broker.
///
/// Implementations must be cancel-safe in [`Transport::recv`]: the connector
/// drops the receive future when shutdown is requested.
pub trait Transport: Send {
    /// Open the session
    fn connect(
        &mut self,
        options: &SessionOptions,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Start receiving messages from a topic or destination
    fn subscribe(&mut self, channel: &str)
    -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Stop receiving messages from a topic or destination
    fn unsubscribe(
        &mut self,
        channel: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Wait for the next message on any subscribed channel.
    ///
    /// An error means the session is gone and has to be reopened.
    fn recv(&mut self) -> impl Future<Output = Result<Delivery, TransportError>> + Send;

    /// Close the session
    fn close(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}
