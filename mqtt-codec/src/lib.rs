//! MQTT 3.1 / 3.1.1 control packet codec.
//!
//! The codec is purely about bytes: [`WriteTo`] turns a [`Packet`] into its
//! wire form, [`check`] delimits whole packets inside a receive buffer, and
//! [`parse`] / [`decode`] turn a complete frame back into a [`Packet`].
//! Session behavior lives in the `mqtt-client` crate.

mod decode;
mod encode;
mod packet;

pub use crate::decode::{check, decode, parse, DecodeError, Needed, Status};
pub use crate::encode::WriteTo;
pub use crate::packet::{
    Connect, ConnectAck, ConnectAckFlags, ConnectFlags, ConnectReturnCode, FixedHeader, LastWill,
    Packet, PacketId, ProtocolVersion, Publish, PublishAck, PublishComplete, PublishFlags,
    PublishReceived, PublishRelease, QoS, Subscribe, SubscribeAck, SubscribeReturnCode, Type,
    Unsubscribe, UnsubscribeAck, UnsupportedProtocolVersion,
};
