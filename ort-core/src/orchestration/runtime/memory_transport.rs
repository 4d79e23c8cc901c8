use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use ort_model::Endpoint;

use crate::error::{OrchestratorError, Result};
use crate::orchestration::messages::Envelope;
use crate::orchestration::transport::{MessageHandler, Transport};

/// Default number of messages a single subscription handles concurrently.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 32;

/// Lightweight in-process transport. Each endpoint is an unbounded queue;
/// subscribers of the same endpoint compete for messages, so every message
/// is delivered to exactly one of them.
pub struct InMemoryTransport {
    channels: DashMap<Endpoint, Channel>,
    max_in_flight: usize,
    closed: CancellationToken,
}

#[derive(Clone)]
struct Channel {
    sender: mpsc::UnboundedSender<Envelope>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Envelope>>>,
}

impl Channel {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }
}

impl fmt::Debug for InMemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryTransport")
            .field("endpoints", &self.channels.len())
            .field("max_in_flight", &self.max_in_flight)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    /// Transport with the default handler concurrency.
    pub fn new() -> Self {
        Self::with_max_in_flight(DEFAULT_MAX_IN_FLIGHT)
    }

    /// Limits concurrent handler calls per subscription.
    pub fn with_max_in_flight(max_in_flight: usize) -> Self {
        Self {
            channels: DashMap::new(),
            max_in_flight: max_in_flight.max(1),
            closed: CancellationToken::new(),
        }
    }

    fn channel(&self, endpoint: Endpoint) -> Channel {
        self.channels
            .entry(endpoint)
            .or_insert_with(Channel::new)
            .clone()
    }

    /// Takes the next queued message for `endpoint` without waiting.
    pub async fn try_receive(&self, endpoint: Endpoint) -> Option<Envelope> {
        let channel = self.channel(endpoint);
        let mut receiver = channel.receiver.lock().await;
        receiver.try_recv().ok()
    }

    /// Drains every queued message for `endpoint`.
    pub async fn drain(&self, endpoint: Endpoint) -> Vec<Envelope> {
        let channel = self.channel(endpoint);
        let mut receiver = channel.receiver.lock().await;
        let mut drained = Vec::new();
        while let Ok(envelope) = receiver.try_recv() {
            drained.push(envelope);
        }
        drained
    }

    /// Stops every subscription loop. Queued messages are kept.
    pub fn close(&self) {
        self.closed.cancel();
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, endpoint: Endpoint, envelope: Envelope) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(OrchestratorError::Transport(format!(
                "transport closed; cannot send to {endpoint}"
            )));
        }

        debug!(
            endpoint = %endpoint,
            run_id = %envelope.header.ort_run_id,
            token = %envelope.header.token,
            "sending message"
        );

        self.channel(endpoint).sender.send(envelope).map_err(|_| {
            OrchestratorError::Transport(format!(
                "endpoint {endpoint} has no receiver"
            ))
        })
    }

    async fn subscribe(
        &self,
        endpoint: Endpoint,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<JoinHandle<()>> {
        let receiver = self.channel(endpoint).receiver;
        let closed = self.closed.clone();
        let permits = Arc::new(Semaphore::new(self.max_in_flight));

        let handle = tokio::spawn(async move {
            loop {
                // Take a message only once a handler slot is free, so
                // aborting this task leaves unhandled messages queued.
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await
                else {
                    break;
                };
                let next = tokio::select! {
                    _ = closed.cancelled() => None,
                    envelope = async { receiver.lock().await.recv().await } => envelope,
                };
                let Some(envelope) = next else {
                    debug!(endpoint = %endpoint, "subscription stopped");
                    break;
                };

                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let token = envelope.header.token.clone();
                    if let Err(err) = handler.handle(envelope).await {
                        warn!(
                            endpoint = %endpoint,
                            token = %token,
                            "message handler failed: {err}"
                        );
                    }
                    drop(permit);
                });
            }
        });

        Ok(handle)
    }
}
