use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use hexplay::HexViewBuilder;
use log::{debug, error, info, trace};
use rand::Rng;

use mqtt_codec::{
    self as codec, Packet, PacketId, ProtocolVersion, QoS, WriteTo,
};

use crate::errors::{ClientError, ConnectFailure, Direction};
use crate::repository::{
    MemoryRepository, PendingPublish, PendingUnsubscribe, Repository, Subscription,
};
use crate::session::ConnectionState;
use crate::settings::ConnectionSettings;
use crate::transport::{Connector, TcpConnector, Transport};

/// A subscription callback: `(client, topic, payload, retained)`.
///
/// Every callback receives the client first, so callbacks may publish,
/// subscribe or unsubscribe again; such calls take effect before the next
/// inbound packet is processed.
pub type MessageCallback = Rc<RefCell<dyn FnMut(&mut MqttClient, &str, &[u8], bool)>>;

/// A hook invoked once per event-loop iteration: `(client, elapsed_secs)`.
pub type LoopHook = Rc<RefCell<dyn FnMut(&mut MqttClient, f64)>>;

/// A hook invoked after every outbound publication:
/// `(client, topic, payload, packet_id, qos, retain)`.
pub type PublishHook = Rc<RefCell<dyn FnMut(&mut MqttClient, &str, &[u8], Option<PacketId>, QoS, bool)>>;

/// A hook invoked for every delivered publication:
/// `(client, topic, payload, qos, retained)`.
pub type MessageHook = Rc<RefCell<dyn FnMut(&mut MqttClient, &str, &[u8], QoS, bool)>>;

/// An opaque handle returned at hook registration; passing it back removes
/// that one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookHandle(u64);

/// Interrupts a running event loop from a signal handler or another thread.
#[derive(Debug, Clone)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

const READ_CHUNK_SIZE: usize = 4096;
const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const HANDSHAKE_RETRY_PAUSE: Duration = Duration::from_millis(10);

const CLIENT_ID_LENGTH: usize = 20;
const CLIENT_ID_CHARS: &[u8] = b"0123456789abcdef";

fn generate_client_id() -> String {
    let mut rng = rand::thread_rng();

    (0..CLIENT_ID_LENGTH)
        .map(|_| CLIENT_ID_CHARS[rng.gen_range(0, CLIENT_ID_CHARS.len())] as char)
        .collect()
}

/// An MQTT 3.1/3.1.1 client session over a byte-duplex transport.
///
/// The client is single-threaded and cooperative: all calls must come from
/// the thread driving it, and suspension happens only inside [`run`] and
/// the blocking handshake read. See [`InterruptHandle`] for the one
/// cross-thread channel.
///
/// [`run`]: MqttClient::run
pub struct MqttClient {
    host: String,
    port: u16,
    client_id: Option<String>,
    protocol_version: ProtocolVersion,
    connector: Box<dyn Connector>,
    pub(crate) repository: Box<dyn Repository>,
    pub(crate) settings: ConnectionSettings,
    pub(crate) transport: Option<Box<dyn Transport>>,
    pub(crate) state: ConnectionState,
    pub(crate) read_buffer: BytesMut,
    pub(crate) last_activity: Instant,
    interrupted: Arc<AtomicBool>,
    sent_bytes: u64,
    received_bytes: u64,
    loop_hooks: Vec<(HookHandle, LoopHook)>,
    publish_hooks: Vec<(HookHandle, PublishHook)>,
    message_hooks: Vec<(HookHandle, MessageHook)>,
    next_hook_handle: u64,
}

impl MqttClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        MqttClient {
            host: host.into(),
            port,
            client_id: None,
            protocol_version: ProtocolVersion::default(),
            connector: Box::new(TcpConnector::default()),
            repository: Box::new(MemoryRepository::new()),
            settings: ConnectionSettings::default(),
            transport: None,
            state: ConnectionState::Disconnected,
            read_buffer: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            last_activity: Instant::now(),
            interrupted: Arc::new(AtomicBool::new(false)),
            sent_bytes: 0,
            received_bytes: 0,
            loop_hooks: Vec::new(),
            publish_hooks: Vec::new(),
            message_hooks: Vec::new(),
            next_hook_handle: 0,
        }
    }

    /// Names the session. Without an explicit identifier a random one is
    /// generated at connect time, which forces a clean session.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_protocol_version(mut self, protocol_version: ProtocolVersion) -> Self {
        self.protocol_version = protocol_version;
        self
    }

    /// Replaces the in-memory repository, e.g. with a persistent store.
    pub fn with_repository(mut self, repository: Box<dyn Repository>) -> Self {
        self.repository = repository;
        self
    }

    /// Replaces the plain-TCP connector, e.g. with one that speaks TLS.
    pub fn with_connector(mut self, connector: Box<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The session identifier; `None` until one is configured or generated.
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    pub fn repository(&self) -> &dyn Repository {
        &*self.repository
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Bytes successfully written to the transport so far.
    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes
    }

    /// Bytes successfully read from the transport so far.
    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    /// Makes the event loop exit at the top of its next iteration.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle(Arc::clone(&self.interrupted))
    }

    pub(crate) fn take_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::SeqCst)
    }

    /// Opens the transport and performs the CONNECT/CONNACK handshake.
    ///
    /// Must succeed before `publish`, `subscribe` or `unsubscribe` are
    /// usable. Connecting an already connected client is a no-op.
    pub fn connect(
        &mut self,
        settings: ConnectionSettings,
        clean_session: bool,
    ) -> Result<(), ClientError> {
        if self.is_connected() {
            return Ok(());
        }

        settings.validate()?;

        let mut clean_session = clean_session;
        if self.client_id.is_none() {
            // an unnamed session cannot be resumed later anyway
            self.client_id = Some(generate_client_id());
            clean_session = true;
        }

        debug!(
            "connecting to {}:{} as `{}` (protocol {})",
            self.host,
            self.port,
            self.client_id.as_deref().unwrap_or_default(),
            self.protocol_version
        );

        self.settings = settings;
        self.state = ConnectionState::Handshaking;

        match self.connector.open(&self.host, self.port, &self.settings) {
            Ok(transport) => self.transport = Some(transport),
            Err(err) => {
                self.state = ConnectionState::Disconnected;
                return Err(err);
            }
        }

        if let Err(err) = self.handshake(clean_session) {
            self.drop_transport();
            self.state = ConnectionState::Disconnected;
            return Err(err);
        }

        self.state = ConnectionState::Connected;
        self.last_activity = Instant::now();
        info!("connected to {}:{}", self.host, self.port);

        Ok(())
    }

    fn handshake(&mut self, clean_session: bool) -> Result<(), ClientError> {
        let client_id = self.client_id.clone().unwrap_or_default();
        let settings = self.settings.clone();

        let connect = Packet::Connect(codec::Connect {
            protocol_version: self.protocol_version,
            clean_session,
            keep_alive: settings.keep_alive_interval,
            client_id: &client_id,
            last_will: settings.last_will.as_ref().map(|will| codec::LastWill {
                qos: will.qos,
                retain: will.retain,
                topic_name: &will.topic,
                message: &will.payload,
            }),
            username: settings.username.as_deref(),
            password: settings.password.as_deref(),
        });
        self.send_packet(&connect)?;

        self.await_connect_ack()
    }

    /// Blocks until the broker answers CONNECT, bounded by the connect
    /// timeout.
    fn await_connect_ack(&mut self) -> Result<(), ClientError> {
        let handshake_failed = |reason: String| {
            ClientError::ConnectingToBrokerFailed(ConnectFailure::Handshake(reason))
        };
        let deadline = Instant::now() + self.settings.connect_timeout;

        loop {
            match codec::check(&self.read_buffer) {
                Ok(codec::Status::Ready(total)) => {
                    let frame = self.read_buffer.split_to(total);
                    let packet = codec::decode(&frame)
                        .map_err(|err| handshake_failed(err.to_string()))?;

                    return match packet {
                        Packet::ConnectAck(ack) => match ack.return_code.ok() {
                            Ok(()) => {
                                debug!(
                                    "the broker accepted the connection (session present: {})",
                                    ack.session_present
                                );
                                Ok(())
                            }
                            Err(code) => Err(ClientError::ConnectingToBrokerFailed(
                                ConnectFailure::Refused(code),
                            )),
                        },
                        other => Err(handshake_failed(format!(
                            "expected CONNACK, received {:?}",
                            other.packet_type()
                        ))),
                    };
                }
                Ok(codec::Status::Pending(_)) => {}
                Err(err) => return Err(handshake_failed(err.to_string())),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ClientError::ConnectingToBrokerFailed(ConnectFailure::Timeout));
            }

            let timeout = (deadline - now).min(self.settings.socket_timeout);
            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = self
                .transport
                .as_mut()
                .ok_or(ClientError::NotConnected)?
                .read_timeout(&mut chunk, timeout)
                .map_err(|err| {
                    ClientError::ConnectingToBrokerFailed(ConnectFailure::Socket(err))
                })?;

            if read > 0 {
                self.received_bytes += read as u64;
                self.read_buffer.extend_from_slice(&chunk[..read]);
            } else {
                thread::sleep(HANDSHAKE_RETRY_PAUSE);
            }
        }
    }

    /// Publishes a message. QoS 1/2 publications claim a packet identifier
    /// and stay in the repository until their handshake completes; QoS 0
    /// goes straight to the wire.
    pub fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<Option<PacketId>, ClientError> {
        self.require_connected()?;
        validate_topic_name(topic)?;

        let packet_id = match qos {
            QoS::AtMostOnce => None,
            _ => Some(self.repository.new_packet_id()?),
        };

        if let Some(packet_id) = packet_id {
            self.repository.add_pending_publish(PendingPublish::new(
                packet_id,
                topic.to_owned(),
                payload.to_vec(),
                qos,
                retain,
                Instant::now(),
            ))?;
        }

        self.send_packet(&Packet::Publish(codec::Publish {
            dup: false,
            qos,
            retain,
            topic_name: topic,
            packet_id,
            payload,
        }))?;

        debug!("published {} bytes to `{}` ({})", payload.len(), topic, qos);
        self.run_publish_hooks(topic, payload, packet_id, qos, retain);

        Ok(packet_id)
    }

    /// Subscribes to a topic filter; the callback runs for every delivered
    /// publication whose topic matches.
    pub fn subscribe<F>(
        &mut self,
        topic_filter: &str,
        qos: QoS,
        callback: F,
    ) -> Result<PacketId, ClientError>
    where
        F: FnMut(&mut MqttClient, &str, &[u8], bool) + 'static,
    {
        self.require_connected()?;
        validate_topic_name(topic_filter).map_err(|_| {
            ClientError::ConfigurationInvalid(format!("invalid topic filter `{}`", topic_filter))
        })?;

        let packet_id = self.repository.new_packet_id()?;
        let callback: MessageCallback = Rc::new(RefCell::new(callback));

        let subscription = match Subscription::new(topic_filter, qos, Some(callback), Some(packet_id))
        {
            Ok(subscription) => subscription,
            Err(err) => {
                self.repository.release_packet_id(packet_id);
                return Err(ClientError::ConfigurationInvalid(err.to_string()));
            }
        };
        self.repository.add_subscription(subscription);

        self.send_packet(&Packet::Subscribe(codec::Subscribe {
            packet_id,
            dup: false,
            subscriptions: vec![(topic_filter, qos)],
        }))?;

        debug!(
            "subscribing to `{}` with QoS {} (packet id {})",
            topic_filter, qos, packet_id
        );

        Ok(packet_id)
    }

    /// Requests the removal of an existing subscription. The subscription
    /// itself is dropped once the broker acknowledges with UNSUBACK.
    pub fn unsubscribe(&mut self, topic_filter: &str) -> Result<PacketId, ClientError> {
        self.require_connected()?;

        if !self.repository.has_subscription(topic_filter) {
            return Err(ClientError::TopicNotSubscribed(topic_filter.to_owned()));
        }

        let packet_id = self.repository.new_packet_id()?;
        self.repository.add_pending_unsubscribe(PendingUnsubscribe::new(
            packet_id,
            topic_filter.to_owned(),
            Instant::now(),
        ))?;

        self.send_packet(&Packet::Unsubscribe(codec::Unsubscribe {
            packet_id,
            dup: false,
            topic_filters: vec![topic_filter],
        }))?;

        debug!(
            "unsubscribing from `{}` (packet id {})",
            topic_filter, packet_id
        );

        Ok(packet_id)
    }

    /// Ends the session gracefully: DISCONNECT, then the transport closes.
    pub fn disconnect(&mut self) -> Result<(), ClientError> {
        if self.transport.is_none() {
            self.state = ConnectionState::Disconnected;
            return Ok(());
        }

        debug!("disconnecting from {}:{}", self.host, self.port);

        self.state = ConnectionState::Closing;
        let sent = self.send_packet(&Packet::Disconnect);
        self.drop_transport();
        self.state = ConnectionState::Disconnected;

        info!("disconnected from {}:{}", self.host, self.port);

        sent
    }

    pub(crate) fn require_connected(&self) -> Result<(), ClientError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ClientError::NotConnected)
        }
    }

    pub(crate) fn drop_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(err) = transport.close() {
                debug!("closing the transport failed: {}", err);
            }
        }
    }

    pub(crate) fn send_packet(&mut self, packet: &Packet<'_>) -> Result<(), ClientError> {
        let mut buf = Vec::with_capacity(packet.size());
        packet.write_to(&mut buf);

        trace!(
            "sending {:?} as {} bytes:\n{}",
            packet.packet_type(),
            buf.len(),
            HexViewBuilder::new(&buf).finish()
        );

        let transport = self.transport.as_mut().ok_or(ClientError::NotConnected)?;
        transport
            .write_all(&buf)
            .map_err(|err| ClientError::DataTransfer(Direction::Tx, err))?;

        self.sent_bytes += buf.len() as u64;
        self.last_activity = Instant::now();

        Ok(())
    }

    /// Appends everything currently readable to the receive buffer.
    pub(crate) fn fill_read_buffer(&mut self) -> Result<usize, ClientError> {
        let mut total = 0;
        let mut chunk = [0u8; READ_CHUNK_SIZE];

        loop {
            let transport = self.transport.as_mut().ok_or(ClientError::NotConnected)?;
            let read = transport
                .poll_read(&mut chunk)
                .map_err(|err| ClientError::DataTransfer(Direction::Rx, err))?;

            if read == 0 {
                break;
            }

            self.read_buffer.extend_from_slice(&chunk[..read]);
            total += read;
        }

        if total > 0 {
            self.received_bytes += total as u64;
            trace!("received {} bytes", total);
        }

        Ok(total)
    }

    pub fn register_loop_hook<F>(&mut self, hook: F) -> HookHandle
    where
        F: FnMut(&mut MqttClient, f64) + 'static,
    {
        let handle = self.next_handle();
        self.loop_hooks.push((handle, Rc::new(RefCell::new(hook))));
        handle
    }

    pub fn unregister_loop_hook(&mut self, handle: HookHandle) -> bool {
        remove_hook(&mut self.loop_hooks, handle)
    }

    pub fn clear_loop_hooks(&mut self) {
        self.loop_hooks.clear();
    }

    pub fn register_publish_hook<F>(&mut self, hook: F) -> HookHandle
    where
        F: FnMut(&mut MqttClient, &str, &[u8], Option<PacketId>, QoS, bool) + 'static,
    {
        let handle = self.next_handle();
        self.publish_hooks.push((handle, Rc::new(RefCell::new(hook))));
        handle
    }

    pub fn unregister_publish_hook(&mut self, handle: HookHandle) -> bool {
        remove_hook(&mut self.publish_hooks, handle)
    }

    pub fn clear_publish_hooks(&mut self) {
        self.publish_hooks.clear();
    }

    pub fn register_message_hook<F>(&mut self, hook: F) -> HookHandle
    where
        F: FnMut(&mut MqttClient, &str, &[u8], QoS, bool) + 'static,
    {
        let handle = self.next_handle();
        self.message_hooks.push((handle, Rc::new(RefCell::new(hook))));
        handle
    }

    pub fn unregister_message_hook(&mut self, handle: HookHandle) -> bool {
        remove_hook(&mut self.message_hooks, handle)
    }

    pub fn clear_message_hooks(&mut self) {
        self.message_hooks.clear();
    }

    fn next_handle(&mut self) -> HookHandle {
        self.next_hook_handle += 1;
        HookHandle(self.next_hook_handle)
    }

    pub(crate) fn run_loop_hooks(&mut self, elapsed_secs: f64) {
        let hooks: Vec<LoopHook> = self
            .loop_hooks
            .iter()
            .map(|(_, hook)| Rc::clone(hook))
            .collect();

        for hook in hooks {
            if panic::catch_unwind(AssertUnwindSafe(|| (hook.borrow_mut())(self, elapsed_secs)))
                .is_err()
            {
                error!("a loop hook panicked; the loop continues");
            }
        }
    }

    pub(crate) fn run_publish_hooks(
        &mut self,
        topic: &str,
        payload: &[u8],
        packet_id: Option<PacketId>,
        qos: QoS,
        retain: bool,
    ) {
        let hooks: Vec<PublishHook> = self
            .publish_hooks
            .iter()
            .map(|(_, hook)| Rc::clone(hook))
            .collect();

        for hook in hooks {
            if panic::catch_unwind(AssertUnwindSafe(|| {
                (hook.borrow_mut())(self, topic, payload, packet_id, qos, retain)
            }))
            .is_err()
            {
                error!("a publish hook panicked; the loop continues");
            }
        }
    }

    pub(crate) fn run_message_hooks(&mut self, topic: &str, payload: &[u8], qos: QoS, retained: bool) {
        let hooks: Vec<MessageHook> = self
            .message_hooks
            .iter()
            .map(|(_, hook)| Rc::clone(hook))
            .collect();

        for hook in hooks {
            if panic::catch_unwind(AssertUnwindSafe(|| {
                (hook.borrow_mut())(self, topic, payload, qos, retained)
            }))
            .is_err()
            {
                error!("a message hook panicked; the loop continues");
            }
        }
    }

    pub(crate) fn run_message_callback(
        &mut self,
        callback: &MessageCallback,
        topic: &str,
        payload: &[u8],
        retained: bool,
    ) {
        if panic::catch_unwind(AssertUnwindSafe(|| {
            (callback.borrow_mut())(self, topic, payload, retained)
        }))
        .is_err()
        {
            error!("a subscription callback panicked; the loop continues");
        }
    }
}

fn remove_hook<T>(hooks: &mut Vec<(HookHandle, T)>, handle: HookHandle) -> bool {
    let before = hooks.len();
    hooks.retain(|(registered, _)| *registered != handle);

    hooks.len() != before
}

fn validate_topic_name(topic: &str) -> Result<(), ClientError> {
    if topic.is_empty() {
        return Err(ClientError::InvalidMessage(
            "the topic may not be empty".to_owned(),
        ));
    }
    if topic.len() > usize::from(u16::max_value()) {
        return Err(ClientError::InvalidMessage(
            "the topic exceeds 65535 bytes".to_owned(),
        ));
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    use crate::transport::testing::{scripted, ScriptedConnector, TransportHandle};

    pub(crate) const CONNACK_ACCEPTED: &[u8] = b"\x20\x02\x00\x00";

    /// A client wired to a scripted transport that already accepted the
    /// connection; the CONNECT bytes are consumed from the written log.
    pub(crate) fn connected_client(
        settings: ConnectionSettings,
    ) -> (MqttClient, TransportHandle) {
        let (transport, handle) = scripted();
        handle.feed(CONNACK_ACCEPTED);

        let mut client = MqttClient::new("broker.test", 1883)
            .with_client_id("test-client")
            .with_protocol_version(ProtocolVersion::V31)
            .with_connector(Box::new(ScriptedConnector::new(transport)));

        client.connect(settings, false).expect("connect");
        handle.take_written();

        (client, handle)
    }
}
