//! Message transport between the coordinator and workers.
//!
//! The transport is a set of named queues with competing consumers: every
//! message is delivered to exactly one subscriber of its queue. A message may
//! carry a `reply_to` queue name, which is how a worker's work request tells
//! the coordinator where to send the task payload.

mod memory;

pub use memory::MemoryBroker;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("malformed message on {queue}: {source}")]
    Decode {
        queue: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("broker error: {0}")]
    Broker(String),
}

/// Raw message body plus routing metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub body: Vec<u8>,
    pub reply_to: Option<String>,
}

impl Envelope {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            reply_to: None,
        }
    }

    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }
}

/// A message taken off a queue.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub envelope: Envelope,
}

impl Delivery {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        serde_json::from_slice(&self.envelope.body).map_err(|source| TransportError::Decode {
            queue: self.queue.clone(),
            source,
        })
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.envelope.reply_to.as_deref()
    }

    pub fn body(&self) -> &[u8] {
        &self.envelope.body
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, queue: &str, envelope: Envelope) -> Result<(), TransportError>;

    /// Attach a consumer to `queue`. Consumers of one queue compete for messages.
    async fn consume(&self, queue: &str) -> Result<Box<dyn Subscription>, TransportError>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Next message, or `None` once the transport is closed and drained.
    async fn recv(&mut self) -> Option<Delivery>;
}

/// Serialize `message` as JSON and publish it.
pub async fn publish_json<T: Serialize + Sync>(
    transport: &dyn Transport,
    queue: &str,
    message: &T,
    reply_to: Option<&str>,
) -> Result<(), TransportError> {
    let body = serde_json::to_vec(message).map_err(TransportError::Encode)?;
    let mut envelope = Envelope::new(body);
    if let Some(queue) = reply_to {
        envelope = envelope.with_reply_to(queue);
    }
    transport.publish(queue, envelope).await
}
