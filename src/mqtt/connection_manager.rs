//! Broker connection lifecycle.
//!
//! [`ConnectionManager`] owns the single `rumqttc` client of the process. The
//! initial handshake happens inline in [`ConnectionManager::connect`] so that a
//! broken broker address or rejected credentials abort startup. After that a
//! background task keeps polling the event loop, which is what drives both the
//! outgoing publishes and the automatic reconnects.
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected ──► ConnectionLost ──► Reconnecting
//!                                     ▲                                 │
//!                                     └─────────────(CONNACK)───────────┘
//!                       close() from any state ──► Closed
//! ```

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Outgoing, Packet, QoS,
};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::MqttSettings;
use super::message::BridgeMessage;
use crate::bridge::publisher::MessagePublisher;

/// Capacity of the request buffer between the client handle and the event loop.
const REQUEST_CAPACITY: usize = 100;
const EVENT_CAPACITY: usize = 16;
/// How long `close()` waits for the DISCONNECT packet to be flushed.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    ConnectionLost,
    Reconnecting,
    Closed,
}

/// Advisory lifecycle notifications. Nothing in the bridge changes behaviour
/// based on these; they exist for logging and observers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    ConnectionLost(String),
    Reconnecting { attempt: u32 },
    Closed,
}

/// Fatal errors of the initial connection attempt.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Broker {broker} did not acknowledge the connection within {timeout:?}")]
    Timeout { broker: String, timeout: Duration },

    #[error("Broker {broker} refused the connection: {code:?}")]
    Refused {
        broker: String,
        code: ConnectReturnCode,
    },

    #[error("Unable to connect to broker {broker}: {source}")]
    Transport {
        broker: String,
        #[source]
        source: ConnectionError,
    },
}

pub struct ConnectionManager {
    client: AsyncClient,
    broker: String,
    state_rx: watch::Receiver<ConnectionState>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    events_tx: broadcast::Sender<ConnectionEvent>,
    driver: Mutex<Option<JoinHandle<()>>>,
    stop: CancellationToken,
}

impl ConnectionManager {
    /// Connects to the broker and arms auto-reconnect for the lifetime of the
    /// returned handle.
    ///
    /// # Errors
    ///
    /// * [`ConnectError::Transport`] - broker unreachable or the socket failed mid-handshake
    /// * [`ConnectError::Refused`] - broker answered CONNACK with a failure code (e.g. bad credentials)
    /// * [`ConnectError::Timeout`] - no CONNACK within `connect_timeout`
    pub async fn connect(settings: &MqttSettings) -> Result<Self, ConnectError> {
        let broker = settings.broker_url();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        info!("Connecting to broker {} as {}", broker, settings.client_id);
        state_tx.send_replace(ConnectionState::Connecting);

        let (client, mut eventloop) = AsyncClient::new(settings.to_options(), REQUEST_CAPACITY);

        match tokio::time::timeout(settings.connect_timeout, handshake(&mut eventloop)).await {
            Ok(Ok(())) => {}
            Ok(Err(ConnectionError::ConnectionRefused(code))) => {
                state_tx.send_replace(ConnectionState::Disconnected);
                return Err(ConnectError::Refused { broker, code });
            }
            Ok(Err(source)) => {
                state_tx.send_replace(ConnectionState::Disconnected);
                return Err(ConnectError::Transport { broker, source });
            }
            Err(_) => {
                state_tx.send_replace(ConnectionState::Disconnected);
                return Err(ConnectError::Timeout {
                    broker,
                    timeout: settings.connect_timeout,
                });
            }
        }

        info!("Connected to broker");
        state_tx.send_replace(ConnectionState::Connected);
        let _ = events_tx.send(ConnectionEvent::Connected);

        let state_tx = Arc::new(state_tx);
        let stop = CancellationToken::new();
        let driver = ConnectionDriver {
            eventloop,
            state_tx: state_tx.clone(),
            events_tx: events_tx.clone(),
            stop: stop.clone(),
            initial_backoff: settings.initial_reconnect_interval,
            max_backoff: settings.max_reconnect_interval,
        };
        let driver = tokio::spawn(driver.run());

        Ok(Self {
            client,
            broker,
            state_rx,
            state_tx,
            events_tx,
            driver: Mutex::new(Some(driver)),
            stop,
        })
    }

    /// Hands the message to the client at QoS 0.
    ///
    /// Suspends only while the client request buffer is full, never for a
    /// broker acknowledgement. A closed client or an invalid topic is logged
    /// and the message is dropped.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) {
        if let Err(e) = self
            .client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
        {
            warn!("Dropping message for topic {}: {}", topic, e);
        }
    }

    /// Sends DISCONNECT, stops the event loop and moves to `Closed`.
    pub async fn close(&self) {
        let Some(mut driver) = self.driver.lock().await.take() else {
            debug!("Connection to {} already closed", self.broker);
            return;
        };

        info!("Disconnecting from broker {}", self.broker);
        if let Err(e) = self.client.try_disconnect() {
            warn!("Unable to queue disconnect: {}", e);
        }

        if tokio::time::timeout(DISCONNECT_GRACE, &mut driver)
            .await
            .is_err()
        {
            debug!("Disconnect not flushed in time, stopping event loop");
            self.stop.cancel();
            if let Err(e) = driver.await {
                error!("Connection task panicked: {}", e);
            }
        }

        self.stop.cancel();
        self.state_tx.send_replace(ConnectionState::Closed);
        let _ = self.events_tx.send(ConnectionEvent::Closed);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events_tx.subscribe()
    }
}

impl MessagePublisher for ConnectionManager {
    async fn publish(&self, message: BridgeMessage) {
        let (topic, payload) = message.into_parts();
        ConnectionManager::publish(self, &topic, payload).await;
    }
}

async fn handshake(eventloop: &mut EventLoop) -> Result<(), ConnectionError> {
    loop {
        match eventloop.poll().await? {
            Event::Incoming(Packet::ConnAck(_)) => return Ok(()),
            event => debug!("Handshake event: {:?}", event),
        }
    }
}

/// Background task polling the event loop after the initial handshake.
struct ConnectionDriver {
    eventloop: EventLoop,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    events_tx: broadcast::Sender<ConnectionEvent>,
    stop: CancellationToken,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl ConnectionDriver {
    async fn run(mut self) {
        let mut attempt: u32 = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let polled = tokio::select! {
                _ = self.stop.cancelled() => break,
                polled = self.eventloop.poll() => polled,
            };

            match polled {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to broker");
                    attempt = 0;
                    backoff = self.initial_backoff;
                    self.transition(ConnectionState::Connected, ConnectionEvent::Connected);
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!("Disconnect sent, stopping event loop");
                    break;
                }
                Ok(event) => debug!("MQTT event: {:?}", event),
                Err(e) => {
                    if self.stop.is_cancelled() {
                        break;
                    }

                    if *self.state_tx.borrow() == ConnectionState::Connected {
                        warn!("Connection to broker lost: {}", e);
                        self.transition(
                            ConnectionState::ConnectionLost,
                            ConnectionEvent::ConnectionLost(e.to_string()),
                        );
                    } else {
                        debug!("Reconnect attempt {} failed: {}", attempt, e);
                    }

                    attempt = attempt.saturating_add(1);
                    info!(
                        "Attempting to reconnect to broker (attempt {}, in {:?})",
                        attempt, backoff
                    );
                    self.transition(
                        ConnectionState::Reconnecting,
                        ConnectionEvent::Reconnecting { attempt },
                    );

                    tokio::select! {
                        _ = self.stop.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.max_backoff);
                }
            }
        }

        debug!("Connection event loop stopped");
    }

    fn transition(&self, state: ConnectionState, event: ConnectionEvent) {
        self.state_tx.send_replace(state);
        let _ = self.events_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::publisher::PublisherLoop;
    use crate::bridge::queue::OutboundQueue;
    use crate::mqtt::config::{packet_size_for, Credentials};
    use crate::mqtt::test_broker::FakeBroker;

    fn settings_for(port: u16) -> MqttSettings {
        MqttSettings {
            host: "127.0.0.1".to_string(),
            port,
            client_id: "http2mqtt-test".to_string(),
            connect_timeout: Duration::from_secs(5),
            initial_reconnect_interval: Duration::from_millis(50),
            max_reconnect_interval: Duration::from_millis(200),
            ..MqttSettings::default()
        }
    }

    async fn next_event(events: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for connection event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn connect_fails_when_broker_unreachable() {
        let port = FakeBroker::unused_port().await;

        let result = ConnectionManager::connect(&settings_for(port)).await;

        assert!(matches!(result, Err(ConnectError::Transport { .. })));
    }

    #[tokio::test]
    async fn connect_fails_when_credentials_rejected() {
        let broker = FakeBroker::bind().await;
        let settings = MqttSettings {
            credentials: Some(Credentials {
                username: "bridge".to_string(),
                password: "wrong".to_string(),
            }),
            ..settings_for(broker.port())
        };

        let accept = tokio::spawn(async move { broker.accept(FakeBroker::NOT_AUTHORIZED).await });
        let result = ConnectionManager::connect(&settings).await;

        assert!(matches!(result, Err(ConnectError::Refused { .. })));
        let session = accept.await.unwrap();
        assert!(session.connect_had_credentials());
    }

    #[tokio::test]
    async fn publishes_at_most_once_without_retain() {
        let broker = FakeBroker::bind().await;
        let settings = settings_for(broker.port());

        let accept = tokio::spawn(async move { broker.accept(FakeBroker::ACCEPTED).await });
        let manager = ConnectionManager::connect(&settings).await.unwrap();
        let mut session = accept.await.unwrap();
        assert!(!session.connect_had_credentials());
        assert_eq!(manager.state(), ConnectionState::Connected);

        manager.publish("sensors/temp", b"21.5".to_vec()).await;
        MessagePublisher::publish(&manager, BridgeMessage::new("sensors/temp", "22.0")).await;

        let first = session.next_publish().await.unwrap();
        let second = session.next_publish().await.unwrap();
        assert_eq!(first.topic, "sensors/temp");
        assert_eq!(first.payload, b"21.5");
        assert_eq!(first.flags, 0, "expected QoS 0, retain false");
        assert_eq!(second.payload, b"22.0");

        manager.close().await;
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(session.next_publish().await.is_none());
    }

    #[tokio::test]
    async fn reconnects_after_transport_loss() {
        let broker = FakeBroker::bind().await;
        let settings = settings_for(broker.port());
        let broker = Arc::new(broker);

        let first_accept = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.accept(FakeBroker::ACCEPTED).await })
        };
        let manager = ConnectionManager::connect(&settings).await.unwrap();
        let mut events = manager.subscribe_events();
        let first_session = first_accept.await.unwrap();

        let second_accept = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.accept(FakeBroker::ACCEPTED).await })
        };
        drop(first_session);

        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::ConnectionLost(_)
        ));
        assert_eq!(
            next_event(&mut events).await,
            ConnectionEvent::Reconnecting { attempt: 1 }
        );

        let mut second_session = second_accept.await.unwrap();
        loop {
            match next_event(&mut events).await {
                ConnectionEvent::Connected => break,
                ConnectionEvent::Reconnecting { .. } => continue,
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(manager.state(), ConnectionState::Connected);

        manager.publish("alerts", b"fire".to_vec()).await;
        let publish = second_session.next_publish().await.unwrap();
        assert_eq!(publish.topic, "alerts");
        assert_eq!(publish.payload, b"fire");

        manager.close().await;
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Closed);
    }

    #[tokio::test]
    async fn slow_broker_backpressures_instead_of_dropping() {
        const MESSAGES: usize = 2000;
        const PAYLOAD_BYTES: usize = 8 * 1024;

        let broker = FakeBroker::bind().await;
        let settings = settings_for(broker.port());

        let accept = tokio::spawn(async move { broker.accept(FakeBroker::ACCEPTED).await });
        let manager = Arc::new(ConnectionManager::connect(&settings).await.unwrap());
        let mut session = accept.await.unwrap();

        let (queue, receiver) = OutboundQueue::bounded(10);
        let publisher = PublisherLoop::spawn(receiver, manager.clone());
        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                for i in 0..MESSAGES {
                    let payload = vec![(i % 251) as u8; PAYLOAD_BYTES];
                    queue
                        .enqueue(BridgeMessage::new("bulk", payload))
                        .await
                        .unwrap();
                }
            })
        };

        // the broker is not reading yet, so the producer must get stuck
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!producer.is_finished());

        for i in 0..MESSAGES {
            let publish = tokio::time::timeout(Duration::from_secs(10), session.next_publish())
                .await
                .expect("timed out waiting for publish")
                .expect("client disconnected");
            assert_eq!(publish.payload.len(), PAYLOAD_BYTES);
            assert_eq!(publish.payload[0], (i % 251) as u8);
        }

        producer.await.unwrap();
        queue.close();
        assert_eq!(publisher.await.unwrap(), MESSAGES);
        assert_eq!(manager.state(), ConnectionState::Connected);
        manager.close().await;
    }

    #[tokio::test]
    async fn publishes_payloads_up_to_the_packet_limit() {
        const PAYLOAD_LIMIT: usize = 64 * 1024;

        let broker = FakeBroker::bind().await;
        let settings = MqttSettings {
            max_packet_size: packet_size_for(PAYLOAD_LIMIT),
            ..settings_for(broker.port())
        };

        let accept = tokio::spawn(async move { broker.accept(FakeBroker::ACCEPTED).await });
        let manager = ConnectionManager::connect(&settings).await.unwrap();
        let mut session = accept.await.unwrap();

        let payload = vec![b'x'; PAYLOAD_LIMIT];
        manager.publish("bulk", payload.clone()).await;
        manager.publish("after", b"ok".to_vec()).await;

        let publish = session.next_publish().await.unwrap();
        assert_eq!(publish.topic, "bulk");
        assert_eq!(publish.payload, payload);
        let publish = session.next_publish().await.unwrap();
        assert_eq!(publish.payload, b"ok");
        assert_eq!(manager.state(), ConnectionState::Connected);

        manager.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let broker = FakeBroker::bind().await;
        let settings = settings_for(broker.port());

        let accept = tokio::spawn(async move { broker.accept(FakeBroker::ACCEPTED).await });
        let manager = ConnectionManager::connect(&settings).await.unwrap();
        let _session = accept.await.unwrap();

        manager.close().await;
        manager.close().await;
        assert_eq!(manager.state(), ConnectionState::Closed);
    }
}
