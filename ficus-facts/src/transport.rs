//! Change event transport.
//!
//! The listener consumes a durable, per-key ordered topic through
//! [`EventTransport`]. Broker clients plug in by implementing the trait;
//! [`ChannelTransport`] is an in-process implementation backed by a tokio
//! channel, used for embedding and tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use tokio::sync::mpsc;

use crate::error::{FactError, FactResult};
use crate::event::ChangeEvent;

/// Subscription to the datasource change topic
#[async_trait]
pub trait EventTransport: Send {
    /// Connect and subscribe to `topic`
    async fn connect(&mut self, topic: &str) -> FactResult<()>;

    /// Wait up to `timeout` for the next payload
    ///
    /// `Ok(None)` means nothing arrived in time. Errors mean the subscription
    /// is lost and the caller should reconnect.
    async fn poll(&mut self, timeout: Duration) -> FactResult<Option<Bytes>>;

    /// Drop the subscription
    async fn disconnect(&mut self);
}

#[derive(Default)]
struct Faults {
    connects: AtomicUsize,
    failing_connects: AtomicUsize,
    failing_polls: AtomicUsize,
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok()
}

/// In-process transport fed by an [`EventPublisher`]
///
/// Published payloads survive reconnects, like a durable topic.
pub struct ChannelTransport {
    receiver: mpsc::UnboundedReceiver<Bytes>,
    faults: Arc<Faults>,
    topic: Option<String>,
}

/// Producer side of a [`ChannelTransport`]
#[derive(Clone)]
pub struct EventPublisher {
    sender: mpsc::UnboundedSender<Bytes>,
    faults: Arc<Faults>,
}

impl ChannelTransport {
    /// Create a transport and its publisher
    pub fn channel() -> (ChannelTransport, EventPublisher) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let faults = Arc::new(Faults::default());
        let transport = ChannelTransport {
            receiver,
            faults: Arc::clone(&faults),
            topic: None,
        };
        (transport, EventPublisher { sender, faults })
    }

    /// Topic of the current subscription
    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }
}

#[async_trait]
impl EventTransport for ChannelTransport {
    async fn connect(&mut self, topic: &str) -> FactResult<()> {
        self.faults.connects.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.faults.failing_connects) {
            return Err(FactError::Transport(format!("connection to {} refused", topic)));
        }
        debug!("Channel transport subscribed to {}", topic);
        self.topic = Some(topic.to_string());
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> FactResult<Option<Bytes>> {
        if self.topic.is_none() {
            return Err(FactError::Transport("not connected".to_string()));
        }
        if take_one(&self.faults.failing_polls) {
            self.topic = None;
            return Err(FactError::Transport("connection reset".to_string()));
        }

        match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Ok(Some(payload)) => Ok(Some(payload)),
            Ok(None) => Err(FactError::Transport("event stream closed".to_string())),
            Err(_) => Ok(None),
        }
    }

    async fn disconnect(&mut self) {
        if let Some(topic) = self.topic.take() {
            debug!("Channel transport unsubscribed from {}", topic);
        }
    }
}

impl EventPublisher {
    /// Publish a change event
    pub fn publish(&self, event: &ChangeEvent) -> FactResult<()> {
        self.publish_raw(event.encode()?)
    }

    /// Publish a raw payload
    pub fn publish_raw(&self, payload: impl Into<Bytes>) -> FactResult<()> {
        self.sender.send(payload.into())?;
        Ok(())
    }

    /// Make the next `count` connect attempts fail
    pub fn fail_connects(&self, count: usize) {
        self.faults.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Make the next poll drop the subscription
    pub fn drop_connection(&self) {
        self.faults.failing_polls.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of connect attempts the transport has seen
    pub fn connect_attempts(&self) -> usize {
        self.faults.connects.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::{DatasourceConfig, DatasourceKind};

    #[tokio::test]
    async fn test_poll_requires_connect() {
        let (mut transport, _publisher) = ChannelTransport::channel();
        assert!(transport.poll(Duration::from_millis(10)).await.is_err());

        transport.connect("changes").await.unwrap();
        assert_eq!(transport.topic(), Some("changes"));
        assert_eq!(transport.poll(Duration::from_millis(10)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_payloads_survive_reconnect() {
        let (mut transport, publisher) = ChannelTransport::channel();
        transport.connect("changes").await.unwrap();

        let config = DatasourceConfig::new("es_test", DatasourceKind::Es, "").with_version(1);
        let event = ChangeEvent::add(config);
        publisher.publish(&event).unwrap();
        publisher.drop_connection();

        assert!(transport.poll(Duration::from_millis(10)).await.is_err());
        assert!(transport.topic().is_none());

        transport.connect("changes").await.unwrap();
        let payload = transport.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(ChangeEvent::decode(&payload).unwrap(), event);
        assert_eq!(publisher.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_connect_failures() {
        let (mut transport, publisher) = ChannelTransport::channel();
        publisher.fail_connects(2);

        assert!(transport.connect("changes").await.is_err());
        assert!(transport.connect("changes").await.is_err());
        assert!(transport.connect("changes").await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_stream_is_an_error() {
        let (mut transport, publisher) = ChannelTransport::channel();
        transport.connect("changes").await.unwrap();
        drop(publisher);

        assert!(transport.poll(Duration::from_millis(10)).await.is_err());
    }
}
