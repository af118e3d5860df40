use core::convert::TryFrom;
use core::str;
use std::error::Error as StdError;

use derive_more::Display;
use nom::{
    branch::alt,
    bytes::complete::{tag, take, take_while_m_n},
    combinator::{all_consuming, map, map_opt, map_res, opt, recognize, rest, verify},
    error::{context, ErrorKind, ParseError, VerboseError},
    multi::many1,
    number::complete::{be_u16, be_u8},
    sequence::pair,
    IResult,
};

use crate::packet::*;

/// How far an incremental decode got on a partial buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// More bytes are required before a packet can be extracted.
    Pending(Needed),
    /// A whole packet of the given total length (fixed header included) is buffered.
    Ready(usize),
}

/// The amount of data required to make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Needed {
    /// The fixed header is still incomplete, so the packet length is unknown.
    Unknown,
    /// The total length of the pending packet, fixed header included.
    Size(usize),
}

/// A protocol violation found while decoding inbound bytes.
#[derive(Debug, Display, PartialEq)]
pub enum DecodeError {
    /// The remaining-length field used more than 4 bytes.
    #[display(fmt = "malformed remaining length")]
    MalformedRemainingLength,
    /// The packet type code is reserved.
    #[display(fmt = "reserved packet type {}", _0)]
    ReservedPacketType(u8),
    /// The packet body violated the wire format.
    #[display(fmt = "malformed packet: {}", _0)]
    MalformedPacket(String),
}

impl StdError for DecodeError {}

const CONTINUATION_BIT: u8 = 0x80;
const MAX_VARINT_BYTES: usize = 4;

/// Flag bits carried in the fixed header of SUBSCRIBE, UNSUBSCRIBE and PUBREL.
const TRANSACTION_FLAGS: u8 = 0x02;
const DUP_FLAG: u8 = 0x08;

/// Examines a receive buffer without consuming it.
///
/// Returns `Status::Ready(total)` once `total` buffered bytes form one whole
/// packet, and `Status::Pending` otherwise; the caller is expected to retry
/// with the same buffer extended. Violations of the fixed-header format are
/// fatal and reported as errors.
pub fn check(input: &[u8]) -> Result<Status, DecodeError> {
    if input.len() < 2 {
        return Ok(Status::Pending(Needed::Unknown));
    }

    let type_code = input[0] >> 4;
    if Type::try_from(type_code).is_err() {
        return Err(DecodeError::ReservedPacketType(type_code));
    }

    let mut remaining_length = 0;
    for (i, &b) in input[1..].iter().take(MAX_VARINT_BYTES).enumerate() {
        remaining_length += usize::from(b & !CONTINUATION_BIT) << (7 * i);

        if b & CONTINUATION_BIT == 0 {
            let total = 1 + (i + 1) + remaining_length;

            return Ok(if input.len() < total {
                Status::Pending(Needed::Size(total))
            } else {
                Status::Ready(total)
            });
        }
    }

    if input.len() > MAX_VARINT_BYTES {
        Err(DecodeError::MalformedRemainingLength)
    } else {
        Ok(Status::Pending(Needed::Unknown))
    }
}

/// Parses exactly one complete packet, as delimited by [`check`].
pub fn decode(frame: &[u8]) -> Result<Packet, DecodeError> {
    match parse::<VerboseError<&[u8]>>(frame) {
        Ok((_, packet)) => Ok(packet),
        Err(err) => Err(DecodeError::MalformedPacket(format!("{:?}", err))),
    }
}

impl FixedHeader {
    fn parse<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], Self, E> {
        map(
            pair(
                map_res(
                    be_u8,
                    |b| -> Result<_, num_enum::TryFromPrimitiveError<Type>> {
                        let packet_type = Type::try_from(b >> 4)?;
                        let packet_flags = b & 0x0F;

                        Ok((packet_type, packet_flags))
                    },
                ),
                variable_length,
            ),
            |((packet_type, packet_flags), remaining_length)| FixedHeader {
                packet_type,
                packet_flags,
                remaining_length,
            },
        )(input)
    }
}

fn variable_length<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], usize, E> {
    context(
        "variable length",
        map(
            verify(
                recognize(pair(
                    take_while_m_n(0, 3, |b| (b & CONTINUATION_BIT) != 0),
                    verify(be_u8, |b| (b & CONTINUATION_BIT) == 0),
                )),
                |s: &[u8]| s.len() <= MAX_VARINT_BYTES,
            ),
            |s: &[u8]| {
                s.iter().enumerate().fold(0, |value, (i, b)| {
                    value + (usize::from(*b & !CONTINUATION_BIT) << (7 * i))
                })
            },
        ),
    )(input)
}

/// Text fields in the Control Packets described later are encoded as UTF-8 strings.
fn utf8_str<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], &'a str, E> {
    context(
        "utf8 string",
        map_res(nom::multi::length_data(be_u16), str::from_utf8),
    )(input)
}

/// Binary Data is represented by a Two Byte Integer length which indicates the number of data bytes,
/// followed by that number of bytes.
fn binary_data<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], &'a [u8], E> {
    context("binary data", nom::multi::length_data(be_u16))(input)
}

/// The Topic Name identifies the information channel to which payload data is published.
fn topic_name<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], &'a str, E> {
    context(
        "topic name",
        verify(utf8_str, |s: &str| s.bytes().all(|c| c != b'#')),
    )(input)
}

/// An expression contained in a Subscription, to indicate an interest in one or more topics.
///
/// A Topic Filter can include wildcard characters.
fn topic_filter<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], &'a str, E> {
    context("topic filter", utf8_str)(input)
}

/// A Subscription comprises a Topic Filter and a maximum QoS.
fn subscription<'a, E: ParseError<&'a [u8]>>(
    input: &'a [u8],
) -> IResult<&'a [u8], (&'a str, QoS), E> {
    context(
        "subscription",
        pair(topic_filter, context("QoS", map_res(be_u8, QoS::try_from))),
    )(input)
}

fn packet_id<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], PacketId, E> {
    context("packet id", be_u16)(input)
}

fn protocol_version<'a, E: ParseError<&'a [u8]>>(
    input: &'a [u8],
) -> IResult<&'a [u8], ProtocolVersion, E> {
    context(
        "protocol version",
        alt((
            map(tag(&b"\x00\x06MQIsdp\x03"[..]), |_| ProtocolVersion::V31),
            map(tag(&b"\x00\x04MQTT\x04"[..]), |_| ProtocolVersion::V311),
        )),
    )(input)
}

/// Parses the bytes slice into Packet type.
pub fn parse<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], Packet<'a>, E> {
    let (input, fixed_header) = FixedHeader::parse(input)?;
    let (remaining, input) = take(fixed_header.remaining_length)(input)?;

    match fixed_header.packet_type {
        Type::CONNECT => context("Connect", all_consuming(map(connect, Packet::Connect)))(input),
        Type::CONNACK => context(
            "ConnectAck",
            all_consuming(map(connect_ack, Packet::ConnectAck)),
        )(input),
        Type::PUBLISH => context(
            "Publish",
            all_consuming(map(
                |i| {
                    publish(
                        PublishFlags::from_bits_truncate(fixed_header.packet_flags),
                        i,
                    )
                },
                Packet::Publish,
            )),
        )(input),
        Type::PUBACK => context(
            "PublishAck",
            all_consuming(map(packet_id, |packet_id| {
                Packet::PublishAck(PublishAck { packet_id })
            })),
        )(input),
        Type::PUBREC => context(
            "PublishReceived",
            all_consuming(map(packet_id, |packet_id| {
                Packet::PublishReceived(PublishReceived { packet_id })
            })),
        )(input),
        Type::PUBREL => {
            // the fixed-header flags of PUBREL are reserved and must be 0010
            if fixed_header.packet_flags != TRANSACTION_FLAGS {
                return Err(nom::Err::Error(E::from_error_kind(
                    input,
                    ErrorKind::Verify,
                )));
            }

            context(
                "PublishRelease",
                all_consuming(map(packet_id, |packet_id| {
                    Packet::PublishRelease(PublishRelease { packet_id })
                })),
            )(input)
        }
        Type::PUBCOMP => context(
            "PublishComplete",
            all_consuming(map(packet_id, |packet_id| {
                Packet::PublishComplete(PublishComplete { packet_id })
            })),
        )(input),
        Type::SUBSCRIBE => context(
            "Subscribe",
            all_consuming(map(pair(packet_id, many1(subscription)), {
                let dup = fixed_header.packet_flags & DUP_FLAG != 0;
                move |(packet_id, subscriptions)| {
                    Packet::Subscribe(Subscribe {
                        packet_id,
                        dup,
                        subscriptions,
                    })
                }
            })),
        )(input),
        Type::SUBACK => context(
            "SubscribeAck",
            all_consuming(map(
                pair(packet_id, many1(subscribe_return_code)),
                |(packet_id, status)| Packet::SubscribeAck(SubscribeAck { packet_id, status }),
            )),
        )(input),
        Type::UNSUBSCRIBE => context(
            "Unsubscribe",
            all_consuming(map(pair(packet_id, many1(topic_filter)), {
                let dup = fixed_header.packet_flags & DUP_FLAG != 0;
                move |(packet_id, topic_filters)| {
                    Packet::Unsubscribe(Unsubscribe {
                        packet_id,
                        dup,
                        topic_filters,
                    })
                }
            })),
        )(input),
        Type::UNSUBACK => context(
            "UnsubscribeAck",
            all_consuming(map(packet_id, |packet_id| {
                Packet::UnsubscribeAck(UnsubscribeAck { packet_id })
            })),
        )(input),
        Type::PINGREQ => Ok((remaining, Packet::Ping)),
        Type::PINGRESP => Ok((remaining, Packet::Pong)),
        Type::DISCONNECT => Ok((remaining, Packet::Disconnect)),
    }
}

fn connect<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], Connect<'a>, E> {
    let (input, protocol_version) = protocol_version(input)?;
    let (input, flags) = context("flags", map_opt(be_u8, ConnectFlags::from_bits))(input)?;
    let (input, keep_alive) = context("keepalive", be_u16)(input)?;
    let (input, client_id) = context("client id", utf8_str)(input)?;
    let (input, last_will) = if flags.contains(ConnectFlags::LAST_WILL) {
        let will_qos = QoS::try_from(flags.will_qos_bits())
            .map_err(|_| nom::Err::Error(E::from_error_kind(input, ErrorKind::MapRes)))?;
        let (input, (topic, message)) = pair(
            context("will topic", utf8_str),
            context("will message", binary_data),
        )(input)?;

        (
            input,
            Some(LastWill {
                qos: will_qos,
                retain: flags.contains(ConnectFlags::WILL_RETAIN),
                topic_name: topic,
                message,
            }),
        )
    } else {
        (input, None)
    };
    let (input, username) = if flags.contains(ConnectFlags::USERNAME) {
        context("username", map(utf8_str, Some))(input)?
    } else {
        (input, None)
    };
    let (input, password) = if flags.contains(ConnectFlags::PASSWORD) {
        context("password", map(binary_data, Some))(input)?
    } else {
        (input, None)
    };

    Ok((
        input,
        Connect {
            protocol_version,
            clean_session: flags.contains(ConnectFlags::CLEAN_SESSION),
            keep_alive,
            client_id,
            last_will,
            username,
            password,
        },
    ))
}

fn connect_ack<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], ConnectAck, E> {
    map(
        pair(
            context("flags", map_opt(be_u8, ConnectAckFlags::from_bits)),
            context("return code", map_res(be_u8, ConnectReturnCode::try_from)),
        ),
        |(flags, return_code)| ConnectAck {
            session_present: flags.contains(ConnectAckFlags::SESSION_PRESENT),
            return_code,
        },
    )(input)
}

fn publish<'a, E: ParseError<&'a [u8]>>(
    flags: PublishFlags,
    input: &'a [u8],
) -> IResult<&'a [u8], Publish<'a>, E> {
    let qos = QoS::try_from(flags.qos_bits())
        .map_err(|_| nom::Err::Error(E::from_error_kind(input, ErrorKind::MapRes)))?;
    let (input, topic) = topic_name(input)?;
    let (input, packet_id) = if qos > QoS::AtMostOnce {
        opt(packet_id)(input)?
    } else {
        (input, None)
    };
    let (input, payload) = rest(input)?;

    Ok((
        input,
        Publish {
            dup: flags.contains(PublishFlags::DUP),
            qos,
            retain: flags.contains(PublishFlags::RETAIN),
            topic_name: topic,
            packet_id,
            payload,
        },
    ))
}

fn subscribe_return_code<'a, E: ParseError<&'a [u8]>>(
    input: &'a [u8],
) -> IResult<&'a [u8], SubscribeReturnCode, E> {
    context(
        "return code",
        map_res(be_u8, |b| {
            if b == SubscribeReturnCode::FAILURE {
                Ok(SubscribeReturnCode::Failure)
            } else {
                QoS::try_from(b).map(SubscribeReturnCode::Success)
            }
        }),
    )(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_header() {
        assert_eq!(
            FixedHeader::parse::<()>(b"\x20\x7f"),
            Ok((
                &b""[..],
                FixedHeader {
                    packet_type: Type::CONNACK,
                    packet_flags: 0,
                    remaining_length: 127,
                },
            ))
        );

        assert_eq!(
            FixedHeader::parse::<()>(b"\x3C\x82\x7f"),
            Ok((
                &b""[..],
                FixedHeader {
                    packet_type: Type::PUBLISH,
                    packet_flags: 0x0C,
                    remaining_length: 16258,
                },
            ))
        );

        assert!(
            FixedHeader::parse::<()>(b"\x20").is_err(),
            "incomplete fixed header"
        );
        assert!(
            FixedHeader::parse::<()>(b"\x00\x00").is_err(),
            "reserved packet type 0"
        );
        assert!(
            FixedHeader::parse::<()>(b"\xf0\x00").is_err(),
            "reserved packet type 15"
        );
    }

    #[test]
    fn test_variable_length() {
        macro_rules! assert_variable_length (
            ($bytes:expr, $res:expr) => {{
                assert_eq!(variable_length::<()>($bytes), Ok((&b""[..], $res)));
            }};

            ($bytes:expr, $res:expr, $rest:expr) => {{
                assert_eq!(variable_length::<()>($bytes), Ok((&$rest[..], $res)));
            }};
        );

        assert_variable_length!(b"\x7f\x7f", 127, b"\x7f");

        assert!(
            variable_length::<()>(b"\xff\xff\xff").is_err(),
            "incomplete variable length"
        );
        assert!(
            variable_length::<()>(b"\xff\xff\xff\xff\xff\xff").is_err(),
            "too long variable length"
        );

        assert_variable_length!(b"\x00", 0);
        assert_variable_length!(b"\x7f", 127);
        assert_variable_length!(b"\x80\x01", 128);
        assert_variable_length!(b"\xff\x7f", 16383);
        assert_variable_length!(b"\x80\x80\x01", 16384);
        assert_variable_length!(b"\xff\xff\x7f", 2097151);
        assert_variable_length!(b"\x80\x80\x80\x01", 2097152);
        assert_variable_length!(b"\xff\xff\xff\x7f", 268435455);
    }

    #[test]
    fn test_check_needs_more_bytes() {
        assert_eq!(check(b""), Ok(Status::Pending(Needed::Unknown)));
        assert_eq!(check(b"\x30"), Ok(Status::Pending(Needed::Unknown)));
        assert_eq!(check(b"\x30\x80"), Ok(Status::Pending(Needed::Unknown)));
        assert_eq!(check(b"\x30\x80\x80"), Ok(Status::Pending(Needed::Unknown)));
    }

    #[test]
    fn test_check_reports_total_length() {
        // PUBLISH with remaining length 11: 2 header bytes + 11 = 13 total
        let packet = b"\x30\x0b\x00\x05topicdata";

        for len in 2..packet.len() {
            assert_eq!(
                check(&packet[..len]),
                Ok(Status::Pending(Needed::Size(13))),
                "monotone while {} of {} bytes buffered",
                len,
                packet.len()
            );
        }

        assert_eq!(check(packet), Ok(Status::Ready(13)));

        // trailing bytes of the next packet do not change the verdict
        let mut extended = packet.to_vec();
        extended.extend_from_slice(b"\xd0\x00");
        assert_eq!(check(&extended), Ok(Status::Ready(13)));

        // multi-byte remaining length
        assert_eq!(
            check(b"\x30\x80\x01"),
            Ok(Status::Pending(Needed::Size(3 + 128)))
        );
    }

    #[test]
    fn test_check_rejects_violations() {
        assert_eq!(check(b"\x00\x00"), Err(DecodeError::ReservedPacketType(0)));
        assert_eq!(check(b"\xf0\x00"), Err(DecodeError::ReservedPacketType(15)));
        assert_eq!(
            check(b"\x30\xff\xff\xff\xff\x7f"),
            Err(DecodeError::MalformedRemainingLength)
        );
    }

    #[test]
    fn test_connect() {
        assert_eq!(
            connect::<()>(b"\x00\x04MQTT\x04\xC0\x00\x3C\x00\x0512345\x00\x04user\x00\x04pass"),
            Ok((
                &b""[..],
                Connect {
                    protocol_version: ProtocolVersion::V311,
                    clean_session: false,
                    keep_alive: 60,
                    client_id: "12345",
                    last_will: None,
                    username: Some("user"),
                    password: Some(b"pass"),
                },
            ))
        );

        assert_eq!(
            connect::<()>(b"\x00\x06MQIsdp\x03\x00\x00\x0a\x00\x0btest-client"),
            Ok((
                &b""[..],
                Connect {
                    protocol_version: ProtocolVersion::V31,
                    clean_session: false,
                    keep_alive: 10,
                    client_id: "test-client",
                    last_will: None,
                    username: None,
                    password: None,
                },
            ))
        );

        assert_eq!(
            connect::<()>(b"\x00\x04MQTT\x04\x14\x00\x3C\x00\x0512345\x00\x05topic\x00\x07message"),
            Ok((
                &b""[..],
                Connect {
                    protocol_version: ProtocolVersion::V311,
                    clean_session: false,
                    keep_alive: 60,
                    client_id: "12345",
                    last_will: Some(LastWill {
                        qos: QoS::ExactlyOnce,
                        retain: false,
                        topic_name: "topic",
                        message: b"message",
                    }),
                    username: None,
                    password: None,
                },
            ))
        );

        assert!(
            connect::<()>(b"\x00\x04MQAA\x04\x00\x00\x3C\x00\x0512345").is_err(),
            "invalid protocol name"
        );
        assert!(
            connect::<()>(b"\x00\x04MQTT\x05\x00\x00\x3C\x00\x0512345").is_err(),
            "invalid protocol level"
        );
        assert!(
            connect::<()>(b"\x00\x04MQTT\x04\xff\x00\x3C\x00\x0512345").is_err(),
            "invalid connect flags"
        );
    }

    #[test]
    fn test_connect_ack() {
        assert_eq!(
            connect_ack::<()>(b"\x01\x04"),
            Ok((
                &b""[..],
                ConnectAck {
                    session_present: true,
                    return_code: ConnectReturnCode::BadUserNameOrPassword,
                }
            ))
        );

        assert_eq!(
            parse::<()>(b"\x20\x02\x00\x00"),
            Ok((
                &b""[..],
                Packet::ConnectAck(ConnectAck {
                    session_present: false,
                    return_code: ConnectReturnCode::ConnectionAccepted,
                })
            ))
        );

        assert!(connect_ack::<()>(b"\x03\x04").is_err(), "invalid flags");
        assert!(connect_ack::<()>(b"\x00\x06").is_err(), "reserved return code");
    }

    #[test]
    fn test_disconnect() {
        assert_eq!(parse::<()>(b"\xe0\x00"), Ok((&b""[..], Packet::Disconnect)));
    }

    #[test]
    fn test_publish() {
        assert_eq!(
            publish::<()>(QoS::AtLeastOnce.into(), b"\x00\x05topic\x12\x34hello"),
            Ok((
                &b""[..],
                Publish {
                    dup: false,
                    qos: QoS::AtLeastOnce,
                    retain: false,
                    topic_name: "topic",
                    packet_id: Some(0x1234),
                    payload: b"hello",
                }
            ))
        );

        assert_eq!(
            parse::<()>(b"\x3d\x0D\x00\x05topic\x43\x21data"),
            Ok((
                &b""[..],
                Packet::Publish(Publish {
                    dup: true,
                    retain: true,
                    qos: QoS::ExactlyOnce,
                    topic_name: "topic",
                    packet_id: Some(0x4321),
                    payload: b"data",
                }),
            ))
        );
        assert_eq!(
            parse::<()>(b"\x30\x0b\x00\x05topicdata"),
            Ok((
                &b""[..],
                Packet::Publish(Publish {
                    dup: false,
                    retain: false,
                    qos: QoS::AtMostOnce,
                    topic_name: "topic",
                    packet_id: None,
                    payload: b"data",
                }),
            ))
        );

        assert!(
            parse::<()>(b"\x36\x0b\x00\x05topicdata").is_err(),
            "reserved QoS 3"
        );

        // QoS>0 PUBLISH truncated before its packet identifier decodes with
        // packet_id: None so the session can discard it silently
        assert_eq!(
            parse::<()>(b"\x32\x07\x00\x05topic"),
            Ok((
                &b""[..],
                Packet::Publish(Publish {
                    dup: false,
                    retain: false,
                    qos: QoS::AtLeastOnce,
                    topic_name: "topic",
                    packet_id: None,
                    payload: b"",
                }),
            ))
        );
    }

    #[test]
    fn test_publish_acknowledgements() {
        assert_eq!(
            parse::<()>(b"\x40\x02\x43\x21"),
            Ok((
                &b""[..],
                Packet::PublishAck(PublishAck { packet_id: 0x4321 })
            ))
        );
        assert_eq!(
            parse::<()>(b"\x50\x02\x10\x92"),
            Ok((
                &b""[..],
                Packet::PublishReceived(PublishReceived { packet_id: 0x1092 })
            ))
        );
        assert_eq!(
            parse::<()>(b"\x62\x02\x10\x92"),
            Ok((
                &b""[..],
                Packet::PublishRelease(PublishRelease { packet_id: 0x1092 })
            ))
        );
        assert_eq!(
            parse::<()>(b"\x70\x02\x10\x92"),
            Ok((
                &b""[..],
                Packet::PublishComplete(PublishComplete { packet_id: 0x1092 })
            ))
        );

        assert!(
            parse::<()>(b"\x60\x02\x10\x92").is_err(),
            "PUBREL with reserved flags"
        );
    }

    #[test]
    fn test_subscribe() {
        assert_eq!(
            parse::<()>(b"\x82\x12\x12\x34\x00\x04test\x01\x00\x06filter\x02"),
            Ok((
                &b""[..],
                Packet::Subscribe(Subscribe {
                    packet_id: 0x1234,
                    dup: false,
                    subscriptions: vec![("test", QoS::AtLeastOnce), ("filter", QoS::ExactlyOnce)],
                })
            ))
        );

        assert_eq!(
            parse::<()>(b"\x8a\x09\x12\x34\x00\x04test\x01"),
            Ok((
                &b""[..],
                Packet::Subscribe(Subscribe {
                    packet_id: 0x1234,
                    dup: true,
                    subscriptions: vec![("test", QoS::AtLeastOnce)],
                })
            ))
        );

        assert_eq!(
            parse::<()>(b"\x90\x05\x12\x34\x01\x80\x02"),
            Ok((
                &b""[..],
                Packet::SubscribeAck(SubscribeAck {
                    packet_id: 0x1234,
                    status: vec![
                        SubscribeReturnCode::Success(QoS::AtLeastOnce),
                        SubscribeReturnCode::Failure,
                        SubscribeReturnCode::Success(QoS::ExactlyOnce),
                    ],
                })
            ))
        );

        assert_eq!(
            parse::<()>(b"\xa2\x10\x12\x34\x00\x04test\x00\x06filter"),
            Ok((
                &b""[..],
                Packet::Unsubscribe(Unsubscribe {
                    packet_id: 0x1234,
                    dup: false,
                    topic_filters: vec!["test", "filter"],
                })
            ))
        );

        assert_eq!(
            parse::<()>(b"\xb0\x02\x43\x21"),
            Ok((
                &b""[..],
                Packet::UnsubscribeAck(UnsubscribeAck { packet_id: 0x4321 })
            ))
        );

        assert!(
            parse::<()>(b"\x82\x02\x42\x42").is_err(),
            "subscribe without subscription topics"
        );
        assert!(
            parse::<()>(b"\x82\x04\x42\x42\x00\x00").is_err(),
            "no QoS for topic filter"
        );
        assert!(
            parse::<()>(b"\x90\x03\x12\x34\x03").is_err(),
            "reserved granted QoS"
        );
        assert!(
            parse::<()>(b"\xa2\x02\x42\x42").is_err(),
            "unsubscribe without subscription topics"
        );
    }

    #[test]
    fn test_ping_pong() {
        assert_eq!(parse::<()>(b"\xc0\x00"), Ok((&b""[..], Packet::Ping)));
        assert_eq!(parse::<()>(b"\xd0\x00"), Ok((&b""[..], Packet::Pong)));
    }

    #[test]
    fn test_decode() {
        assert_eq!(
            decode(b"\xc0\x00"),
            Ok(Packet::Ping)
        );
        assert!(matches::matches!(
            decode(b"\x20\x02\x03\x04"),
            Err(DecodeError::MalformedPacket(_))
        ));
    }
}
