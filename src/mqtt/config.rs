use crate::config::DEFAULT_MAX_BODY_BYTES;
use rumqttc::MqttOptions;
use std::time::Duration;

/// Largest remaining length an MQTT 3.1.1 fixed header can encode.
pub const MQTT_MAX_PACKET_SIZE: usize = 268_435_455;

/// Packet size needed to publish `payload_limit` bytes to any valid topic:
/// fixed header (at most 5 bytes), topic length prefix plus the longest
/// possible topic, and a packet identifier.
pub fn packet_size_for(payload_limit: usize) -> usize {
    payload_limit.saturating_add(5 + 2 + u16::MAX as usize + 2)
}

/// Username/password pair sent in the MQTT CONNECT packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Everything the connection manager needs to reach the broker.
///
/// Built once by the configuration layer and treated as immutable afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// `None` means no authentication is attempted.
    pub credentials: Option<Credentials>,
    pub keep_alive: Duration,
    /// Upper bound for the initial CONNECT/CONNACK handshake.
    pub connect_timeout: Duration,
    /// First delay between reconnect attempts, doubled after every failure.
    pub initial_reconnect_interval: Duration,
    pub max_reconnect_interval: Duration,
    /// Largest packet the client will send or accept.
    pub max_packet_size: usize,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: format!("http2mqtt-{}", std::process::id()),
            credentials: None,
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            initial_reconnect_interval: Duration::from_secs(1),
            max_reconnect_interval: Duration::from_secs(600),
            max_packet_size: packet_size_for(DEFAULT_MAX_BODY_BYTES),
        }
    }
}

impl MqttSettings {
    pub fn broker_url(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }

    pub fn to_options(&self) -> MqttOptions {
        let mut mqtt_options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        mqtt_options
            .set_keep_alive(self.keep_alive)
            .set_clean_session(true)
            .set_max_packet_size(self.max_packet_size, self.max_packet_size);

        if let Some(credentials) = &self.credentials {
            mqtt_options.set_credentials(
                credentials.username.clone(),
                credentials.password.clone(),
            );
        }

        mqtt_options
    }
}
