use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::mqtt::message::BridgeMessage;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Outbound queue is closed")]
    Closed,
}

/// Producer side of the bounded FIFO between ingestion and the publisher loop.
///
/// Cheap to clone; every HTTP request task holds one. A full queue suspends
/// `enqueue` until the publisher frees a slot or the queue gets closed.
#[derive(Clone, Debug)]
pub struct OutboundQueue {
    sender: mpsc::Sender<BridgeMessage>,
    closed: CancellationToken,
}

/// Consumer side, owned by the single publisher loop.
#[derive(Debug)]
pub struct QueueReceiver {
    receiver: mpsc::Receiver<BridgeMessage>,
    closed: CancellationToken,
    receiver_closed: bool,
}

impl OutboundQueue {
    /// Creates the queue. A capacity of zero is raised to one.
    pub fn bounded(capacity: usize) -> (Self, QueueReceiver) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let closed = CancellationToken::new();
        debug!("Created outbound queue with capacity {}", capacity.max(1));

        (
            Self {
                sender,
                closed: closed.clone(),
            },
            QueueReceiver {
                receiver,
                closed,
                receiver_closed: false,
            },
        )
    }

    pub async fn enqueue(&self, message: BridgeMessage) -> Result<(), QueueError> {
        if self.closed.is_cancelled() {
            return Err(QueueError::Closed);
        }

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(QueueError::Closed),
            sent = self.sender.send(message) => sent.map_err(|_| QueueError::Closed),
        }
    }

    /// Rejects all further enqueues. Buffered messages are still delivered.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!("Closing outbound queue");
            self.closed.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }
}

impl QueueReceiver {
    /// Next message in FIFO order. Suspends while the queue is empty and
    /// returns `None` once it is closed and fully drained.
    pub async fn next(&mut self) -> Option<BridgeMessage> {
        if !self.receiver_closed {
            tokio::select! {
                biased;
                message = self.receiver.recv() => return message,
                _ = self.closed.cancelled() => {
                    self.receiver.close();
                    self.receiver_closed = true;
                }
            }
        }

        self.receiver.recv().await
    }
}
