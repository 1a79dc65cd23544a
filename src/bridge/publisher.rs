use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::queue::QueueReceiver;
use crate::mqtt::message::BridgeMessage;

/// Sink the publisher loop forwards messages to.
///
/// The returned future may suspend while the sink cannot take more work
/// (a full client request buffer), which is what lets broker slowness fill
/// the outbound queue. It must never wait for a broker acknowledgement.
pub trait MessagePublisher: Send + Sync + 'static {
    fn publish(&self, message: BridgeMessage) -> impl Future<Output = ()> + Send;
}

/// The single consumer of the outbound queue.
pub struct PublisherLoop<P: MessagePublisher> {
    receiver: QueueReceiver,
    publisher: Arc<P>,
}

impl<P: MessagePublisher> PublisherLoop<P> {
    pub fn new(receiver: QueueReceiver, publisher: Arc<P>) -> Self {
        Self {
            receiver,
            publisher,
        }
    }

    /// Spawns the loop; the handle resolves to the number of forwarded messages
    /// once the queue is closed and drained.
    pub fn spawn(receiver: QueueReceiver, publisher: Arc<P>) -> JoinHandle<usize> {
        tokio::spawn(Self::new(receiver, publisher).run())
    }

    pub async fn run(mut self) -> usize {
        info!("Publisher loop started");
        let mut forwarded = 0usize;

        while let Some(message) = self.receiver.next().await {
            info!("Sending message {}", message);
            self.publisher.publish(message).await;
            forwarded += 1;
        }

        debug!("Outbound queue drained");
        info!("Publisher loop stopped after {} messages", forwarded);
        forwarded
    }
}
