use std::thread;
use std::time::{Duration, Instant};

use hexplay::HexViewBuilder;
use log::{debug, trace, warn};

use mqtt_codec::{self as codec, Packet, PublishRelease, Unsubscribe};

use crate::client::MqttClient;
use crate::errors::ClientError;

/// How long an idle iteration sleeps before polling again.
const IDLE_SLEEP: Duration = Duration::from_millis(100);

/// How often the pending records are walked for retransmission.
const RESEND_WALK_INTERVAL: Duration = Duration::from_secs(1);

/// Exit policies of one [`MqttClient::run_with`] invocation.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// Sleep 100 ms when an iteration saw no inbound bytes.
    pub allow_sleep: bool,
    /// Exit once nothing is pending and no subscriptions remain.
    pub exit_when_queues_empty: bool,
    /// Give up waiting for the queues to drain after this much time,
    /// provided no subscriptions remain.
    pub queue_wait_limit: Option<Duration>,
}

impl Default for LoopSettings {
    fn default() -> Self {
        LoopSettings {
            allow_sleep: true,
            exit_when_queues_empty: false,
            queue_wait_limit: None,
        }
    }
}

impl MqttClient {
    /// Runs the event loop until it is interrupted or the session dies:
    /// polls the transport, dispatches inbound packets, retransmits
    /// unacknowledged messages and keeps the session alive.
    pub fn run(&mut self) -> Result<(), ClientError> {
        self.run_with(LoopSettings::default())
    }

    pub fn run_with(&mut self, loop_settings: LoopSettings) -> Result<(), ClientError> {
        self.require_connected()?;

        debug!("starting the event loop");

        let started = Instant::now();
        let mut last_resend_walk = started;

        loop {
            if self.take_interrupt() {
                debug!("the event loop was interrupted");
                break;
            }

            self.run_loop_hooks(started.elapsed().as_secs_f64());

            // a hook or callback may have ended the session
            if !self.is_connected() {
                debug!("the session ended; leaving the event loop");
                break;
            }

            let received = self.fill_read_buffer()?;
            self.process_read_buffer()?;

            if !self.is_connected() {
                debug!("the session ended; leaving the event loop");
                break;
            }

            if received == 0 && loop_settings.allow_sleep {
                thread::sleep(IDLE_SLEEP);
            }

            if last_resend_walk.elapsed() >= RESEND_WALK_INTERVAL {
                self.resend_unacknowledged()?;
                last_resend_walk = Instant::now();
            }

            self.maintain_keep_alive()?;

            if loop_settings.exit_when_queues_empty {
                let subscriptions = self.repository().count_subscriptions();

                if self.queues_are_empty() && subscriptions == 0 {
                    debug!("all queues are empty; leaving the event loop");
                    break;
                }
                if let Some(limit) = loop_settings.queue_wait_limit {
                    if started.elapsed() >= limit && subscriptions == 0 {
                        debug!("the queue wait limit elapsed; leaving the event loop");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Extracts and dispatches every whole packet in the receive buffer.
    /// Acknowledgement mismatches are logged at warning level and the
    /// session continues; everything else ends it.
    pub(crate) fn process_read_buffer(&mut self) -> Result<(), ClientError> {
        loop {
            match codec::check(&self.read_buffer) {
                Ok(codec::Status::Ready(total)) => {
                    let frame = self.read_buffer.split_to(total);

                    trace!(
                        "processing a {}-byte packet:\n{}",
                        frame.len(),
                        HexViewBuilder::new(&frame).finish()
                    );

                    let packet = codec::decode(&frame).map_err(ClientError::ProtocolViolation)?;

                    if let Err(err) = self.handle_packet(&packet) {
                        if err.is_recoverable() {
                            warn!("{} (error code {:04})", err, err.code());
                        } else {
                            return Err(err);
                        }
                    }
                }
                Ok(codec::Status::Pending(_)) => return Ok(()),
                Err(err) => return Err(ClientError::ProtocolViolation(err)),
            }
        }
    }

    /// Retransmits every pending publication and unsubscribe request whose
    /// resend timeout has passed, with the duplicate flag set.
    fn resend_unacknowledged(&mut self) -> Result<(), ClientError> {
        let now = Instant::now();
        let than = match now.checked_sub(self.settings.resend_timeout) {
            Some(than) => than,
            None => return Ok(()),
        };

        for message in self.repository.pending_publishes_older_than(than) {
            if message.received {
                debug!(
                    "re-releasing publication {} while PUBCOMP is outstanding",
                    message.packet_id
                );
                self.send_packet(&Packet::PublishRelease(PublishRelease {
                    packet_id: message.packet_id,
                }))?;
            } else {
                debug!(
                    "retransmitting publication {} (attempt {})",
                    message.packet_id,
                    message.attempts + 1
                );
                self.send_packet(&Packet::Publish(codec::Publish {
                    dup: true,
                    qos: message.qos,
                    retain: message.retain,
                    topic_name: &message.topic,
                    packet_id: Some(message.packet_id),
                    payload: &message.payload,
                }))?;
            }

            self.repository.record_publish_attempt(message.packet_id, now);
        }

        for request in self.repository.pending_unsubscribes_older_than(than) {
            debug!(
                "retransmitting unsubscribe request {} (attempt {})",
                request.packet_id,
                request.attempts + 1
            );
            self.send_packet(&Packet::Unsubscribe(Unsubscribe {
                packet_id: request.packet_id,
                dup: true,
                topic_filters: vec![&request.topic_filter],
            }))?;

            self.repository
                .record_unsubscribe_attempt(request.packet_id, now);
        }

        Ok(())
    }

    /// Pings the broker once the keep-alive interval passed without any
    /// outbound traffic.
    fn maintain_keep_alive(&mut self) -> Result<(), ClientError> {
        let keep_alive = Duration::from_secs(u64::from(self.settings.keep_alive_interval));

        if self.last_activity.elapsed() >= keep_alive {
            debug!("pinging the broker to keep the session alive");
            self.send_packet(&Packet::Ping)?;
        }

        Ok(())
    }

    fn queues_are_empty(&self) -> bool {
        let repository = self.repository();

        repository.count_pending_publishes() == 0
            && repository.count_pending_unsubscribes() == 0
            && repository.count_pending_confirmations() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    use matches::assert_matches;

    use mqtt_codec::QoS;

    use super::LoopSettings;
    use crate::client::testing::connected_client;
    use crate::errors::ClientError;
    use crate::settings::ConnectionSettings;

    #[test]
    fn test_interrupt_is_honored_and_cleared() {
        let (mut client, _handle) = connected_client(ConnectionSettings::default());

        client.interrupt();
        client.run().unwrap();

        // a second run is not affected by the consumed flag
        let mut iterations = 0u32;
        let handle = client.register_loop_hook(move |client, _| {
            iterations += 1;
            if iterations >= 2 {
                client.interrupt();
            }
        });
        client.run().unwrap();
        client.unregister_loop_hook(handle);
    }

    #[test]
    fn test_exit_when_queues_empty() {
        let (mut client, _handle) = connected_client(ConnectionSettings::default());

        client
            .run_with(LoopSettings {
                allow_sleep: false,
                exit_when_queues_empty: true,
                queue_wait_limit: None,
            })
            .unwrap();
    }

    #[test]
    fn test_queue_wait_limit_bounds_the_loop() {
        let (mut client, _handle) = connected_client(ConnectionSettings::default());

        // a pending publication keeps the queues busy forever
        client.publish("t", b"p", QoS::AtLeastOnce, false).unwrap();

        let started = std::time::Instant::now();
        client
            .run_with(LoopSettings {
                allow_sleep: false,
                exit_when_queues_empty: true,
                queue_wait_limit: Some(Duration::from_millis(200)),
            })
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn test_recoverable_mismatch_keeps_the_loop_running() {
        let (mut client, handle) = connected_client(ConnectionSettings::default());

        let delivered = Rc::new(RefCell::new(Vec::new()));
        let recorder = Rc::clone(&delivered);
        client
            .subscribe("t", QoS::AtMostOnce, move |_, topic, payload, _| {
                recorder
                    .borrow_mut()
                    .push((topic.to_owned(), payload.to_vec()));
            })
            .unwrap();

        // grant, then a PUBACK nothing is waiting for, then a publication
        handle.feed(b"\x90\x03\x00\x01\x00");
        handle.feed(b"\x40\x02\x00\x63");
        handle.feed(b"\x30\x04\x00\x01tp");

        let feed = handle.clone();
        client.register_loop_hook(move |client, _| {
            if feed.exhausted() {
                client.interrupt();
            }
        });

        client
            .run_with(LoopSettings {
                allow_sleep: false,
                ..Default::default()
            })
            .unwrap();

        assert_eq!(
            delivered.borrow().as_slice(),
            &[("t".to_owned(), b"p".to_vec())]
        );
    }

    #[test]
    fn test_protocol_violation_ends_the_loop() {
        let (mut client, handle) = connected_client(ConnectionSettings::default());

        // packet type 15 is reserved
        handle.feed(b"\xf0\x00");

        let err = client
            .run_with(LoopSettings {
                allow_sleep: false,
                ..Default::default()
            })
            .unwrap_err();

        assert_matches!(err, ClientError::ProtocolViolation(_));
    }

    #[test]
    fn test_keep_alive_ping_after_idle_interval() {
        let settings = ConnectionSettings {
            keep_alive_interval: 1,
            ..Default::default()
        };
        let (mut client, handle) = connected_client(settings);

        client.register_loop_hook(|client, elapsed_secs| {
            if elapsed_secs > 1.5 {
                client.interrupt();
            }
        });
        client.run().unwrap();

        assert_eq!(handle.written(), b"\xc0\x00".to_vec());
    }

    #[test]
    fn test_resend_sets_the_duplicate_flag() {
        let settings = ConnectionSettings {
            resend_timeout: Duration::from_secs(1),
            // keep the keep-alive quiet while waiting for the resend
            keep_alive_interval: 30,
            ..Default::default()
        };
        let (mut client, handle) = connected_client(settings);

        let packet_id = client
            .publish("a", b"x", QoS::AtLeastOnce, false)
            .unwrap()
            .unwrap();
        handle.take_written();

        client.register_loop_hook(|client, elapsed_secs| {
            if elapsed_secs > 1.5 {
                client.interrupt();
            }
        });
        client.run().unwrap();

        assert_eq!(handle.written(), b"\x3a\x06\x00\x01a\x00\x01x".to_vec());
        assert_eq!(
            client.repository().get_pending_publish(packet_id).unwrap().attempts,
            2
        );
    }

    #[test]
    fn test_outstanding_pubcomp_resends_the_release() {
        let settings = ConnectionSettings {
            resend_timeout: Duration::from_secs(1),
            keep_alive_interval: 30,
            ..Default::default()
        };
        let (mut client, handle) = connected_client(settings);

        let packet_id = client
            .publish("t", b"p", QoS::ExactlyOnce, false)
            .unwrap()
            .unwrap();
        handle.feed(&[0x50, 0x02, 0x00, packet_id as u8]);

        client.register_loop_hook(|client, elapsed_secs| {
            if elapsed_secs > 1.5 {
                client.interrupt();
            }
        });
        handle.take_written();
        client.run().unwrap();

        // the immediate PUBREL on PUBREC, then the timer-driven repeat
        let release = vec![0x62, 0x02, 0x00, packet_id as u8];
        let written = handle.written();
        assert_eq!(written[..4], release[..]);
        assert_eq!(written[4..], release[..]);
    }
}
