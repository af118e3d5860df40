use std::rc::Rc;
use std::time::Instant;

use log::{debug, warn};

use mqtt_codec::{
    Packet, PacketId, Publish, PublishAck, PublishComplete, PublishReceived, PublishRelease, QoS,
    SubscribeAck, SubscribeReturnCode, UnsubscribeAck,
};

use crate::client::MqttClient;
use crate::errors::{AckKind, ClientError};
use crate::repository::PendingConfirmation;

/// The lifecycle of one broker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Disconnected,
    Handshaking,
    Connected,
    Closing,
}

impl MqttClient {
    /// Interprets one inbound packet on an established session.
    ///
    /// Recoverable errors (acknowledgement mismatches) are surfaced to the
    /// caller, which logs them and keeps the session alive; everything else
    /// terminates it.
    pub(crate) fn handle_packet(&mut self, packet: &Packet<'_>) -> Result<(), ClientError> {
        match packet {
            Packet::Publish(publish) => self.handle_publish(publish),
            Packet::PublishAck(PublishAck { packet_id }) => self.handle_publish_ack(*packet_id),
            Packet::PublishReceived(received) => self.handle_publish_received(received.packet_id),
            Packet::PublishRelease(PublishRelease { packet_id }) => {
                self.handle_publish_release(*packet_id)
            }
            Packet::PublishComplete(PublishComplete { packet_id }) => {
                self.handle_publish_complete(*packet_id)
            }
            Packet::SubscribeAck(ack) => self.handle_subscribe_ack(ack),
            Packet::UnsubscribeAck(UnsubscribeAck { packet_id }) => {
                self.handle_unsubscribe_ack(*packet_id)
            }
            Packet::Ping => {
                debug!("answering the broker's PINGREQ");
                self.send_packet(&Packet::Pong)
            }
            Packet::Pong => {
                debug!("the broker answered the keep-alive ping");
                self.last_activity = Instant::now();
                Ok(())
            }
            Packet::ConnectAck(_) => Err(ClientError::UnexpectedAcknowledgement(
                AckKind::ConnectAck,
                "the session is already established".to_owned(),
            )),
            Packet::Connect(_) | Packet::Subscribe(_) | Packet::Unsubscribe(_) | Packet::Disconnect => {
                Err(ClientError::InvalidMessage(format!(
                    "the broker sent a client-only packet ({:?})",
                    packet.packet_type()
                )))
            }
        }
    }

    fn handle_publish(&mut self, publish: &Publish<'_>) -> Result<(), ClientError> {
        match publish.qos {
            QoS::AtMostOnce => {
                self.deliver_message(publish.topic_name, publish.payload, publish.qos, publish.retain);
                Ok(())
            }
            QoS::AtLeastOnce => {
                let packet_id = match publish.packet_id {
                    Some(packet_id) => packet_id,
                    // the broker will retransmit with the identifier intact
                    None => {
                        debug!("discarding a QoS 1 publication without packet identifier");
                        return Ok(());
                    }
                };

                self.send_packet(&Packet::PublishAck(PublishAck { packet_id }))?;
                self.deliver_message(publish.topic_name, publish.payload, publish.qos, publish.retain);

                Ok(())
            }
            QoS::ExactlyOnce => {
                let packet_id = match publish.packet_id {
                    Some(packet_id) => packet_id,
                    None => {
                        debug!("discarding a QoS 2 publication without packet identifier");
                        return Ok(());
                    }
                };

                self.send_packet(&Packet::PublishReceived(PublishReceived { packet_id }))?;

                // delivery happens on PUBREL; a redelivery in between finds
                // the confirmation already queued and stays without effect
                let confirmation = PendingConfirmation {
                    packet_id,
                    topic: publish.topic_name.to_owned(),
                    payload: publish.payload.to_vec(),
                    qos: publish.qos,
                    retained: publish.retain,
                };
                if self.repository.add_pending_confirmation(confirmation).is_err() {
                    debug!(
                        "publication {} already awaits its release; not queueing it twice",
                        packet_id
                    );
                }

                Ok(())
            }
        }
    }

    fn handle_publish_ack(&mut self, packet_id: PacketId) -> Result<(), ClientError> {
        if !self.repository.remove_pending_publish(packet_id) {
            return Err(ClientError::UnexpectedAcknowledgement(
                AckKind::PublishAck,
                format!("no pending publication with packet id {}", packet_id),
            ));
        }

        self.repository.release_packet_id(packet_id);
        debug!("publication {} was acknowledged", packet_id);

        Ok(())
    }

    fn handle_publish_received(&mut self, packet_id: PacketId) -> Result<(), ClientError> {
        if !self.repository.mark_publish_received(packet_id) {
            return Err(ClientError::UnexpectedAcknowledgement(
                AckKind::PublishReceived,
                format!("no pending publication awaits a PUBREC for packet id {}", packet_id),
            ));
        }

        debug!("publication {} was received; releasing it", packet_id);

        // the resend timer retransmits this PUBREL while PUBCOMP is late
        self.send_packet(&Packet::PublishRelease(PublishRelease { packet_id }))
    }

    fn handle_publish_release(&mut self, packet_id: PacketId) -> Result<(), ClientError> {
        let confirmation = match self.repository.get_pending_confirmation(packet_id) {
            Some(confirmation) => confirmation.clone(),
            None => {
                return Err(ClientError::UnexpectedAcknowledgement(
                    AckKind::PublishRelease,
                    format!("no pending confirmation with packet id {}", packet_id),
                ));
            }
        };

        self.deliver_message(
            &confirmation.topic,
            &confirmation.payload,
            confirmation.qos,
            confirmation.retained,
        );
        self.send_packet(&Packet::PublishComplete(PublishComplete { packet_id }))?;
        self.repository.remove_pending_confirmation(packet_id);

        Ok(())
    }

    fn handle_publish_complete(&mut self, packet_id: PacketId) -> Result<(), ClientError> {
        if !self.repository.remove_pending_publish(packet_id) {
            return Err(ClientError::UnexpectedAcknowledgement(
                AckKind::PublishComplete,
                format!("no pending publication with packet id {}", packet_id),
            ));
        }

        self.repository.release_packet_id(packet_id);
        debug!("publication {} completed its QoS 2 handshake", packet_id);

        Ok(())
    }

    fn handle_subscribe_ack(&mut self, ack: &SubscribeAck) -> Result<(), ClientError> {
        let subscriptions = self.repository.subscriptions_with_packet_id(ack.packet_id);

        if subscriptions.is_empty() {
            return Err(ClientError::UnexpectedAcknowledgement(
                AckKind::SubscribeAck,
                format!("no subscribe request in flight with packet id {}", ack.packet_id),
            ));
        }
        if subscriptions.len() != ack.status.len() {
            return Err(ClientError::UnexpectedAcknowledgement(
                AckKind::SubscribeAck,
                format!(
                    "{} grants acknowledge {} subscriptions",
                    ack.status.len(),
                    subscriptions.len()
                ),
            ));
        }

        for (subscription, status) in subscriptions.iter().zip(&ack.status) {
            match status {
                SubscribeReturnCode::Success(granted) => {
                    debug!(
                        "the broker granted QoS {} for `{}`",
                        granted,
                        subscription.topic_filter()
                    );
                    self.repository
                        .grant_subscription(subscription.topic_filter(), *granted);
                }
                SubscribeReturnCode::Failure => {
                    warn!(
                        "the broker refused the subscription to `{}`",
                        subscription.topic_filter()
                    );
                    self.repository
                        .remove_subscription(subscription.topic_filter());
                }
            }
        }

        self.repository.release_packet_id(ack.packet_id);

        Ok(())
    }

    fn handle_unsubscribe_ack(&mut self, packet_id: PacketId) -> Result<(), ClientError> {
        let topic_filter = match self.repository.get_pending_unsubscribe(packet_id) {
            Some(request) => request.topic_filter.clone(),
            None => {
                return Err(ClientError::UnexpectedAcknowledgement(
                    AckKind::UnsubscribeAck,
                    format!("no unsubscribe request in flight with packet id {}", packet_id),
                ));
            }
        };

        self.repository.remove_pending_unsubscribe(packet_id);
        self.repository.remove_subscription(&topic_filter);
        self.repository.release_packet_id(packet_id);

        debug!("unsubscribed from `{}`", topic_filter);

        Ok(())
    }

    /// Runs the callbacks of every matching subscription, then the
    /// message-received hooks. A callback is free to call back into the
    /// client; its writes happen before the next packet is processed.
    fn deliver_message(&mut self, topic: &str, payload: &[u8], qos: QoS, retained: bool) {
        let subscriptions = self.repository.subscriptions_matching(topic);

        if subscriptions.is_empty() {
            debug!("no subscription matches `{}`", topic);
        }

        for subscription in &subscriptions {
            if let Some(callback) = subscription.callback() {
                let callback = Rc::clone(callback);
                self.run_message_callback(&callback, topic, payload, retained);
            }
        }

        self.run_message_hooks(topic, payload, qos, retained);
    }
}
