/*!
 * Bounded queue for inbound broker messages.
 *
 * The broker's delivery context pushes into a [`MessageSender`]; a single
 * router task drains the [`MessageReceiver`]. A full queue makes the sender
 * wait, nothing is dropped.
 */
use tokio::sync::mpsc;
use tracing::trace;

use withub_core::types::SubscribeMessage;

use crate::error::{Error, Result};

/// Queue depth used when the configuration does not say otherwise
pub const DEFAULT_DEPTH: usize = 8;

/// Create a message channel holding at most `depth` messages
pub fn channel(depth: usize) -> (MessageSender, MessageReceiver) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    (MessageSender { inner: tx }, MessageReceiver { inner: rx })
}

/// Producer half of the message channel
#[derive(Debug, Clone)]
pub struct MessageSender {
    inner: mpsc::Sender<SubscribeMessage>,
}

impl MessageSender {
    /// Queue a message, waiting while the queue is full
    pub async fn send(&self, message: SubscribeMessage) -> Result<()> {
        trace!("Queueing message on {}", message.topic);
        self.inner
            .send(message)
            .await
            .map_err(|_| Error::invalid_state("message router has stopped"))
    }

    /// Free slots in the queue
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Whether the consumer is gone
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// Consumer half of the message channel
#[derive(Debug)]
pub struct MessageReceiver {
    inner: mpsc::Receiver<SubscribeMessage>,
}

impl MessageReceiver {
    /// Wait for the next message, `None` once every sender is gone
    pub async fn recv(&mut self) -> Option<SubscribeMessage> {
        self.inner.recv().await
    }
}
