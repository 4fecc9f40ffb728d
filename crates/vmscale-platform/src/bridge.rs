//! Platform bridge — non-blocking publish over a bounded channel, with a
//! forwarding task that hands each message to a [`PlatformSink`].

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::error::PlatformResult;
use crate::message::PlatformMessage;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Destination for platform messages.
pub trait PlatformSink: Send + Sync {
    fn deliver<'a>(&'a self, message: &'a PlatformMessage) -> BoxFuture<'a, PlatformResult<()>>;
}

/// Cloneable publishing handle.
#[derive(Clone)]
pub struct PlatformBridge {
    tx: mpsc::Sender<PlatformMessage>,
}

impl PlatformBridge {
    /// Create a bridge buffering at most `buffer` undelivered messages.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<PlatformMessage>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }

    /// Queue a message without waiting. Returns false if it was dropped.
    pub fn publish(&self, message: PlatformMessage) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                warn!(kind = message.kind(), "platform buffer full, message dropped");
                false
            }
            Err(TrySendError::Closed(message)) => {
                debug!(kind = message.kind(), "platform forwarder gone, message dropped");
                false
            }
        }
    }
}

/// Forward messages to `sink` until shutdown, then drain what is buffered.
///
/// Delivery failures are logged and the message is discarded.
pub async fn forward(
    mut rx: mpsc::Receiver<PlatformMessage>,
    sink: Arc<dyn PlatformSink>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    info!("platform forwarder started");
    loop {
        tokio::select! {
            message = rx.recv() => match message {
                Some(message) => deliver(sink.as_ref(), &message).await,
                None => break,
            },
            _ = shutdown.changed() => {
                while let Ok(message) = rx.try_recv() {
                    deliver(sink.as_ref(), &message).await;
                }
                break;
            }
        }
    }
    info!("platform forwarder stopped");
}

async fn deliver(sink: &dyn PlatformSink, message: &PlatformMessage) {
    if let Err(e) = sink.deliver(message).await {
        warn!(kind = message.kind(), error = %e, "platform delivery failed");
    }
}

/// Writes each message as one structured log line.
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    domain: Option<String>,
}

impl LogSink {
    pub fn new(domain: Option<String>) -> Self {
        Self { domain }
    }
}

impl PlatformSink for LogSink {
    fn deliver<'a>(&'a self, message: &'a PlatformMessage) -> BoxFuture<'a, PlatformResult<()>> {
        Box::pin(async move {
            let body = serde_json::to_string(message)?;
            info!(
                target: "vmscale::platform",
                kind = message.kind(),
                domain = self.domain.as_deref().unwrap_or("-"),
                %body,
                "platform event"
            );
            Ok(())
        })
    }
}

/// Keeps every delivered message in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    messages: Arc<Mutex<Vec<PlatformMessage>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<PlatformMessage> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl PlatformSink for MemorySink {
    fn deliver<'a>(&'a self, message: &'a PlatformMessage) -> BoxFuture<'a, PlatformResult<()>> {
        Box::pin(async move {
            self.messages
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(message.clone());
            Ok(())
        })
    }
}
