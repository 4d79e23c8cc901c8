use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;

use ort_model::Endpoint;

use crate::error::Result;
use crate::orchestration::messages::{Envelope, Message};

/// Receives every message delivered to a subscribed endpoint.
///
/// An `Err` is reported back to the transport, which logs it; domain
/// failures are expected to be handled inside the handler.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handles one delivered message. Errors are logged by the transport.
    async fn handle(&self, envelope: Envelope) -> Result<()>;
}

/// Named, at-least-once delivery channels.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Publishes a message to `endpoint`.
    async fn send(&self, endpoint: Endpoint, envelope: Envelope) -> Result<()>;

    /// Starts delivering messages sent to `endpoint` to `handler`. The
    /// returned task runs until the transport is closed or the task aborted.
    async fn subscribe(
        &self,
        endpoint: Endpoint,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<JoinHandle<()>>;
}

/// Typed publishing on top of any [`Transport`].
#[derive(Clone, Debug)]
pub struct MessagePublisher {
    transport: Arc<dyn Transport>,
}

impl MessagePublisher {
    /// Publisher sending over `transport`.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// The underlying transport.
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    /// Encodes `message` and sends it to `endpoint`.
    pub async fn publish<T: Serialize>(
        &self,
        endpoint: Endpoint,
        message: &Message<T>,
    ) -> Result<()> {
        let envelope = message.encode()?;
        self.transport.send(endpoint, envelope).await
    }
}
