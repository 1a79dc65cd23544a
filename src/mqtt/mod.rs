//! # MQTT Side of the Bridge
//!
//! Everything that talks to the broker lives here:
//!
//! ```text
//! mqtt/
//! ├── config.rs              - Broker address, credentials and timing settings
//! ├── message.rs             - The message travelling through the bridge
//! └── connection_manager.rs  - Connection state machine, publish and close
//! ```
//!
//! ## Delivery Semantics
//!
//! Publishing is fire-and-forget at QoS 0 with the retain flag cleared. A
//! message handed over while the connection is down (between a transport loss
//! and the next successful reconnect) may be lost, and nothing is re-queued.
//! The same applies to messages still inside the client when the process
//! exits. Callers that need delivery guarantees must not rely on this bridge.
//!
//! Handing a message over waits for room in the client's request buffer, so a
//! broker that stops reading slows the pipeline down rather than losing data.

pub mod config;
pub mod connection_manager;
pub mod message;

#[cfg(test)]
pub(crate) mod test_broker;
