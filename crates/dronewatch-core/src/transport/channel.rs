use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::debug;
use thiserror::Error;
use tokio::sync::mpsc;

use super::{Delivery, SessionOptions, Transport, TransportError};

enum FeedItem {
    Message(Delivery),
    Fault(String),
}

#[derive(Debug, Default)]
struct FeedShared {
    connected: AtomicBool,
    connect_attempts: AtomicUsize,
    refuse_connects: AtomicUsize,
    close_calls: AtomicUsize,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("transport side of the feed has been dropped")]
pub struct FeedClosed;

/// Create a connected transport/feed pair buffering up to `buffer` items
pub fn channel_transport(buffer: usize) -> (ChannelTransport, ChannelFeed) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let shared = Arc::new(FeedShared::default());
    (
        ChannelTransport {
            rx,
            subscriptions: BTreeSet::new(),
            shared: shared.clone(),
        },
        ChannelFeed { tx, shared },
    )
}

/// In-process [`Transport`] fed through a [`ChannelFeed`].
///
/// Messages on channels that are not subscribed are discarded, mirroring a
/// broker that only routes subscribed topics. Faults injected through the
/// feed end the session the way a dropped broker connection would.
pub struct ChannelTransport {
    rx: mpsc::Receiver<FeedItem>,
    subscriptions: BTreeSet<String>,
    shared: Arc<FeedShared>,
}

/// Producer handle for a [`ChannelTransport`]
#[derive(Clone)]
pub struct ChannelFeed {
    tx: mpsc::Sender<FeedItem>,
    shared: Arc<FeedShared>,
}

impl ChannelFeed {
    /// Queue a message for delivery, waiting for buffer space
    pub async fn publish(
        &self,
        channel: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(), FeedClosed> {
        self.tx
            .send(FeedItem::Message(Delivery::new(channel, payload)))
            .await
            .map_err(|_| FeedClosed)
    }

    /// Queue a session failure; the transport reports it from `recv`
    pub async fn inject_fault(&self, reason: impl Into<String>) -> Result<(), FeedClosed> {
        self.tx
            .send(FeedItem::Fault(reason.into()))
            .await
            .map_err(|_| FeedClosed)
    }

    /// Make the next `count` connect attempts fail
    pub fn refuse_connects(&self, count: usize) {
        self.shared.refuse_connects.store(count, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> usize {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.shared.close_calls.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

impl ChannelTransport {
    fn connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn drop_session(&mut self) {
        self.shared.connected.store(false, Ordering::SeqCst);
        self.subscriptions.clear();
    }
}

impl Transport for ChannelTransport {
    async fn connect(&mut self, options: &SessionOptions) -> Result<(), TransportError> {
        self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .shared
            .refuse_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Connect {
                url: options.broker_url.clone(),
                details: "connection refused".into(),
            });
        }

        debug!("Channel transport {} connected", options.client_id);
        self.shared.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&mut self, channel: &str) -> Result<(), TransportError> {
        if !self.connected() {
            return Err(TransportError::Subscribe {
                channel: channel.to_owned(),
                details: "not connected".into(),
            });
        }
        self.subscriptions.insert(channel.to_owned());
        Ok(())
    }

    async fn unsubscribe(&mut self, channel: &str) -> Result<(), TransportError> {
        self.subscriptions.remove(channel);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Delivery, TransportError> {
        loop {
            if !self.connected() {
                return Err(TransportError::SessionLost("not connected".into()));
            }

            match self.rx.recv().await {
                None => {
                    self.drop_session();
                    return Err(TransportError::Closed);
                }
                Some(FeedItem::Fault(reason)) => {
                    self.drop_session();
                    return Err(TransportError::SessionLost(reason));
                }
                Some(FeedItem::Message(delivery)) => {
                    if self.subscriptions.contains(&delivery.channel) {
                        return Ok(delivery);
                    }
                    debug!("Discarding message on unsubscribed {}", delivery.channel);
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.drop_session();
        self.shared.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> SessionOptions {
        SessionOptions {
            broker_url: "memory://test".into(),
            client_id: "test".into(),
            credentials: None,
            heartbeat: None,
        }
    }

    #[tokio::test]
    async fn test_only_subscribed_channels_are_delivered() {
        let (mut transport, feed) = channel_transport(8);
        transport.connect(&options()).await.unwrap();
        transport.subscribe("dados").await.unwrap();

        feed.publish("other", "ignored").await.unwrap();
        feed.publish("dados", "kept").await.unwrap();

        let delivery = transport.recv().await.unwrap();
        assert_eq!(delivery.channel, "dados");
        assert_eq!(delivery.payload, b"kept");
    }

    #[tokio::test]
    async fn test_fault_ends_session() {
        let (mut transport, feed) = channel_transport(8);
        transport.connect(&options()).await.unwrap();
        transport.subscribe("dados").await.unwrap();

        feed.inject_fault("broker went away").await.unwrap();

        assert_eq!(
            transport.recv().await,
            Err(TransportError::SessionLost("broker went away".into()))
        );
        assert!(!feed.is_connected());
        assert!(transport.recv().await.is_err());
    }

    #[tokio::test]
    async fn test_refused_connects_are_counted() {
        let (mut transport, feed) = channel_transport(8);
        feed.refuse_connects(2);

        assert!(transport.connect(&options()).await.is_err());
        assert!(transport.connect(&options()).await.is_err());
        assert!(transport.connect(&options()).await.is_ok());
        assert_eq!(feed.connect_attempts(), 3);
        assert!(feed.is_connected());
    }

    #[tokio::test]
    async fn test_dropped_feed_closes_session() {
        let (mut transport, feed) = channel_transport(8);
        transport.connect(&options()).await.unwrap();
        drop(feed);

        assert_eq!(transport.recv().await, Err(TransportError::Closed));
    }
}
