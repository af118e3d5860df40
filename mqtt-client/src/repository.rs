use std::collections::{BTreeMap, BTreeSet};
use std::error::Error as StdError;
use std::fmt;
use std::time::Instant;

use derive_more::Display;

use mqtt_codec::{PacketId, QoS};

use crate::client::MessageCallback;
use crate::topic::{InvalidTopicFilter, TopicMatcher};

/// A repository operation that could not be carried out.
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// Every identifier in 1..=65535 is claimed by an open transaction.
    #[display(fmt = "no free packet identifier is available")]
    PacketIdsExhausted,
    /// A pending record with the same packet identifier already exists.
    #[display(fmt = "a pending record with packet identifier {} already exists", _0)]
    PendingRecordAlreadyExists(PacketId),
}

impl StdError for RepositoryError {}

/// An outbound QoS 1/2 publication awaiting its acknowledgement.
#[derive(Debug, Clone)]
pub struct PendingPublish {
    pub packet_id: PacketId,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    /// Set once PUBREC has been seen; the resend timer then retransmits
    /// PUBREL instead of the publication itself.
    pub received: bool,
    pub last_sent: Instant,
    pub attempts: u32,
}

impl PendingPublish {
    pub fn new(
        packet_id: PacketId,
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
        sent_at: Instant,
    ) -> Self {
        PendingPublish {
            packet_id,
            topic,
            payload,
            qos,
            retain,
            received: false,
            last_sent: sent_at,
            attempts: 1,
        }
    }

    /// Records one more transmission.
    pub fn record_attempt(&mut self, at: Instant) {
        self.attempts += 1;
        self.last_sent = at;
    }
}

/// An inbound QoS 2 publication held back between PUBREC and PUBREL, so a
/// redelivery of the same identifier stays idempotent.
#[derive(Debug, Clone)]
pub struct PendingConfirmation {
    pub packet_id: PacketId,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retained: bool,
}

/// An unsubscribe request awaiting UNSUBACK.
#[derive(Debug, Clone)]
pub struct PendingUnsubscribe {
    pub packet_id: PacketId,
    pub topic_filter: String,
    pub last_sent: Instant,
    pub attempts: u32,
}

impl PendingUnsubscribe {
    pub fn new(packet_id: PacketId, topic_filter: String, sent_at: Instant) -> Self {
        PendingUnsubscribe {
            packet_id,
            topic_filter,
            last_sent: sent_at,
            attempts: 1,
        }
    }

    /// Records one more transmission.
    pub fn record_attempt(&mut self, at: Instant) {
        self.attempts += 1;
        self.last_sent = at;
    }
}

/// An active subscription of the session.
#[derive(Clone)]
pub struct Subscription {
    topic_filter: String,
    qos: QoS,
    granted_qos: Option<QoS>,
    packet_id: Option<PacketId>,
    callback: Option<MessageCallback>,
    matcher: TopicMatcher,
}

impl Subscription {
    pub fn new(
        topic_filter: &str,
        qos: QoS,
        callback: Option<MessageCallback>,
        packet_id: Option<PacketId>,
    ) -> Result<Self, InvalidTopicFilter> {
        Ok(Subscription {
            topic_filter: topic_filter.to_owned(),
            qos,
            granted_qos: None,
            packet_id,
            callback,
            matcher: TopicMatcher::new(topic_filter)?,
        })
    }

    pub fn topic_filter(&self) -> &str {
        &self.topic_filter
    }

    /// The QoS requested in SUBSCRIBE.
    pub fn qos(&self) -> QoS {
        self.qos
    }

    /// The QoS granted by SUBACK, unknown while the subscribe is in flight.
    pub fn granted_qos(&self) -> Option<QoS> {
        self.granted_qos
    }

    pub fn set_granted_qos(&mut self, granted: QoS) {
        self.granted_qos = Some(granted);
    }

    /// The identifier of the in-flight SUBSCRIBE, cleared after SUBACK.
    pub fn packet_id(&self) -> Option<PacketId> {
        self.packet_id
    }

    pub fn clear_packet_id(&mut self) {
        self.packet_id = None;
    }

    pub fn callback(&self) -> Option<&MessageCallback> {
        self.callback.as_ref()
    }

    pub fn matcher(&self) -> &TopicMatcher {
        &self.matcher
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic_filter", &self.topic_filter)
            .field("qos", &self.qos)
            .field("granted_qos", &self.granted_qos)
            .field("packet_id", &self.packet_id)
            .field("callback", &self.callback.as_ref().map(|_| ".."))
            .finish()
    }
}

/// Storage for everything a session keeps in flight: pending outbound
/// publications, inbound QoS 2 confirmations, unsubscribe requests, active
/// subscriptions, and the packet identifier pool.
///
/// The session owns its repository exclusively. The in-memory default is
/// [`MemoryRepository`]; alternative implementations (persistent stores)
/// must honor the same contracts:
///
/// - identifiers come from 1..=65535, lowest free first, and never serve
///   two open transactions at once; 0 is reserved,
/// - at most one pending confirmation exists per identifier,
/// - all `remove_*` operations are idempotent in their boolean result.
pub trait Repository {
    /// Claims the lowest free packet identifier.
    fn new_packet_id(&mut self) -> Result<PacketId, RepositoryError>;

    /// Returns an identifier to the pool once its transaction completed.
    fn release_packet_id(&mut self, packet_id: PacketId);

    fn add_pending_publish(&mut self, message: PendingPublish) -> Result<(), RepositoryError>;
    fn get_pending_publish(&self, packet_id: PacketId) -> Option<&PendingPublish>;
    fn pending_publishes_older_than(&self, than: Instant) -> Vec<PendingPublish>;
    fn record_publish_attempt(&mut self, packet_id: PacketId, at: Instant) -> bool;
    /// Marks the QoS 2 publication as received by the broker; `false` when
    /// nothing is pending under the identifier or it was already marked.
    fn mark_publish_received(&mut self, packet_id: PacketId) -> bool;
    fn remove_pending_publish(&mut self, packet_id: PacketId) -> bool;
    fn count_pending_publishes(&self) -> usize;

    fn add_pending_unsubscribe(
        &mut self,
        request: PendingUnsubscribe,
    ) -> Result<(), RepositoryError>;
    fn get_pending_unsubscribe(&self, packet_id: PacketId) -> Option<&PendingUnsubscribe>;
    fn pending_unsubscribes_older_than(&self, than: Instant) -> Vec<PendingUnsubscribe>;
    fn record_unsubscribe_attempt(&mut self, packet_id: PacketId, at: Instant) -> bool;
    fn remove_pending_unsubscribe(&mut self, packet_id: PacketId) -> bool;
    fn count_pending_unsubscribes(&self) -> usize;

    fn add_pending_confirmation(
        &mut self,
        confirmation: PendingConfirmation,
    ) -> Result<(), RepositoryError>;
    fn get_pending_confirmation(&self, packet_id: PacketId) -> Option<&PendingConfirmation>;
    fn remove_pending_confirmation(&mut self, packet_id: PacketId) -> bool;
    fn count_pending_confirmations(&self) -> usize;

    /// Adds a subscription, replacing a previous one for the same filter.
    fn add_subscription(&mut self, subscription: Subscription);
    fn has_subscription(&self, topic_filter: &str) -> bool;
    fn remove_subscription(&mut self, topic_filter: &str) -> bool;
    /// The subscriptions whose SUBSCRIBE is in flight under the identifier,
    /// in insertion order.
    fn subscriptions_with_packet_id(&self, packet_id: PacketId) -> Vec<Subscription>;
    /// Records the QoS granted by SUBACK and ends the in-flight state.
    fn grant_subscription(&mut self, topic_filter: &str, granted: QoS) -> bool;
    fn subscriptions_matching(&self, topic_name: &str) -> Vec<Subscription>;
    fn count_subscriptions(&self) -> usize;
}

/// The ordered in-memory default.
///
/// The identifier pool is a high-water mark plus the set of identifiers
/// released below it; the lowest free identifier is the smallest released
/// one, or the mark plus one.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    released_packet_ids: BTreeSet<PacketId>,
    highest_claimed_packet_id: PacketId,
    pending_publishes: BTreeMap<PacketId, PendingPublish>,
    pending_unsubscribes: BTreeMap<PacketId, PendingUnsubscribe>,
    pending_confirmations: BTreeMap<PacketId, PendingConfirmation>,
    subscriptions: Vec<Subscription>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Repository for MemoryRepository {
    fn new_packet_id(&mut self) -> Result<PacketId, RepositoryError> {
        if let Some(&packet_id) = self.released_packet_ids.iter().next() {
            self.released_packet_ids.remove(&packet_id);
            return Ok(packet_id);
        }

        if self.highest_claimed_packet_id == PacketId::max_value() {
            return Err(RepositoryError::PacketIdsExhausted);
        }

        self.highest_claimed_packet_id += 1;

        Ok(self.highest_claimed_packet_id)
    }

    fn release_packet_id(&mut self, packet_id: PacketId) {
        if packet_id == 0 || packet_id > self.highest_claimed_packet_id {
            return;
        }

        if packet_id == self.highest_claimed_packet_id {
            self.highest_claimed_packet_id -= 1;
            while self.highest_claimed_packet_id > 0
                && self
                    .released_packet_ids
                    .remove(&self.highest_claimed_packet_id)
            {
                self.highest_claimed_packet_id -= 1;
            }
        } else {
            self.released_packet_ids.insert(packet_id);
        }
    }

    fn add_pending_publish(&mut self, message: PendingPublish) -> Result<(), RepositoryError> {
        if self.pending_publishes.contains_key(&message.packet_id) {
            return Err(RepositoryError::PendingRecordAlreadyExists(
                message.packet_id,
            ));
        }

        self.pending_publishes.insert(message.packet_id, message);

        Ok(())
    }

    fn get_pending_publish(&self, packet_id: PacketId) -> Option<&PendingPublish> {
        self.pending_publishes.get(&packet_id)
    }

    fn pending_publishes_older_than(&self, than: Instant) -> Vec<PendingPublish> {
        self.pending_publishes
            .values()
            .filter(|message| message.last_sent <= than)
            .cloned()
            .collect()
    }

    fn record_publish_attempt(&mut self, packet_id: PacketId, at: Instant) -> bool {
        match self.pending_publishes.get_mut(&packet_id) {
            Some(message) => {
                message.record_attempt(at);
                true
            }
            None => false,
        }
    }

    fn mark_publish_received(&mut self, packet_id: PacketId) -> bool {
        match self.pending_publishes.get_mut(&packet_id) {
            Some(message) if !message.received => {
                message.received = true;
                true
            }
            _ => false,
        }
    }

    fn remove_pending_publish(&mut self, packet_id: PacketId) -> bool {
        self.pending_publishes.remove(&packet_id).is_some()
    }

    fn count_pending_publishes(&self) -> usize {
        self.pending_publishes.len()
    }

    fn add_pending_unsubscribe(
        &mut self,
        request: PendingUnsubscribe,
    ) -> Result<(), RepositoryError> {
        if self.pending_unsubscribes.contains_key(&request.packet_id) {
            return Err(RepositoryError::PendingRecordAlreadyExists(
                request.packet_id,
            ));
        }

        self.pending_unsubscribes.insert(request.packet_id, request);

        Ok(())
    }

    fn get_pending_unsubscribe(&self, packet_id: PacketId) -> Option<&PendingUnsubscribe> {
        self.pending_unsubscribes.get(&packet_id)
    }

    fn pending_unsubscribes_older_than(&self, than: Instant) -> Vec<PendingUnsubscribe> {
        self.pending_unsubscribes
            .values()
            .filter(|request| request.last_sent <= than)
            .cloned()
            .collect()
    }

    fn record_unsubscribe_attempt(&mut self, packet_id: PacketId, at: Instant) -> bool {
        match self.pending_unsubscribes.get_mut(&packet_id) {
            Some(request) => {
                request.record_attempt(at);
                true
            }
            None => false,
        }
    }

    fn remove_pending_unsubscribe(&mut self, packet_id: PacketId) -> bool {
        self.pending_unsubscribes.remove(&packet_id).is_some()
    }

    fn count_pending_unsubscribes(&self) -> usize {
        self.pending_unsubscribes.len()
    }

    fn add_pending_confirmation(
        &mut self,
        confirmation: PendingConfirmation,
    ) -> Result<(), RepositoryError> {
        if self
            .pending_confirmations
            .contains_key(&confirmation.packet_id)
        {
            return Err(RepositoryError::PendingRecordAlreadyExists(
                confirmation.packet_id,
            ));
        }

        self.pending_confirmations
            .insert(confirmation.packet_id, confirmation);

        Ok(())
    }

    fn get_pending_confirmation(&self, packet_id: PacketId) -> Option<&PendingConfirmation> {
        self.pending_confirmations.get(&packet_id)
    }

    fn remove_pending_confirmation(&mut self, packet_id: PacketId) -> bool {
        self.pending_confirmations.remove(&packet_id).is_some()
    }

    fn count_pending_confirmations(&self) -> usize {
        self.pending_confirmations.len()
    }

    fn add_subscription(&mut self, subscription: Subscription) {
        self.remove_subscription(subscription.topic_filter());
        self.subscriptions.push(subscription);
    }

    fn has_subscription(&self, topic_filter: &str) -> bool {
        self.subscriptions
            .iter()
            .any(|subscription| subscription.topic_filter() == topic_filter)
    }

    fn remove_subscription(&mut self, topic_filter: &str) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions
            .retain(|subscription| subscription.topic_filter() != topic_filter);

        self.subscriptions.len() != before
    }

    fn subscriptions_with_packet_id(&self, packet_id: PacketId) -> Vec<Subscription> {
        self.subscriptions
            .iter()
            .filter(|subscription| subscription.packet_id() == Some(packet_id))
            .cloned()
            .collect()
    }

    fn grant_subscription(&mut self, topic_filter: &str, granted: QoS) -> bool {
        match self
            .subscriptions
            .iter_mut()
            .find(|subscription| subscription.topic_filter() == topic_filter)
        {
            Some(subscription) => {
                subscription.set_granted_qos(granted);
                subscription.clear_packet_id();
                true
            }
            None => false,
        }
    }

    fn subscriptions_matching(&self, topic_name: &str) -> Vec<Subscription> {
        self.subscriptions
            .iter()
            .filter(|subscription| subscription.matcher().matches(topic_name))
            .cloned()
            .collect()
    }

    fn count_subscriptions(&self) -> usize {
        self.subscriptions.len()
    }
}
