//! An MQTT 3.1/3.1.1 client protocol engine.
//!
//! The engine drives one long-lived broker session over a byte-duplex
//! [`Transport`]: it performs the CONNECT/CONNACK handshake, runs the
//! QoS 1/2 handshakes for inbound and outbound publications, dispatches
//! deliveries to subscription callbacks, and keeps the session alive from a
//! single-threaded cooperative event loop ([`MqttClient::run`]).
//!
//! ```no_run
//! use mqtt_client::{ConnectionSettings, MqttClient, QoS};
//!
//! # fn main() -> Result<(), mqtt_client::ClientError> {
//! let mut client = MqttClient::new("localhost", 1883).with_client_id("example");
//! client.connect(ConnectionSettings::default(), true)?;
//!
//! client.subscribe("sensor/+/temperature", QoS::AtLeastOnce, |_, topic, payload, _| {
//!     println!("{}: {:?}", topic, payload);
//! })?;
//!
//! client.run()
//! # }
//! ```

mod client;
mod errors;
mod looping;
mod repository;
mod session;
mod settings;
mod topic;
mod transport;

pub use mqtt_codec as codec;
pub use mqtt_codec::{PacketId, ProtocolVersion, QoS};

pub use crate::client::{
    HookHandle, InterruptHandle, LoopHook, MessageCallback, MessageHook, MqttClient, PublishHook,
};
pub use crate::errors::{AckKind, ClientError, ConnectFailure, Direction};
pub use crate::looping::LoopSettings;
pub use crate::repository::{
    MemoryRepository, PendingConfirmation, PendingPublish, PendingUnsubscribe, Repository,
    RepositoryError, Subscription,
};
pub use crate::settings::{ConnectionSettings, LastWill, TlsOptions};
pub use crate::topic::{InvalidTopicFilter, TopicMatcher};
pub use crate::transport::{Connector, TcpConnector, TcpTransport, Transport};
