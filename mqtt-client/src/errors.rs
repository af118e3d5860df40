use std::error::Error as StdError;
use std::io;

use derive_more::Display;

use mqtt_codec::{ConnectReturnCode, DecodeError, UnsupportedProtocolVersion};

use crate::repository::RepositoryError;

/// The direction of the transfer that failed.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    #[display(fmt = "sending")]
    Tx,
    #[display(fmt = "receiving")]
    Rx,
}

/// The acknowledgement packet a bookkeeping mismatch was detected for.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    #[display(fmt = "CONNACK")]
    ConnectAck,
    #[display(fmt = "PUBACK")]
    PublishAck,
    #[display(fmt = "SUBACK")]
    SubscribeAck,
    #[display(fmt = "UNSUBACK")]
    UnsubscribeAck,
    #[display(fmt = "PUBREC")]
    PublishReceived,
    #[display(fmt = "PUBREL")]
    PublishRelease,
    #[display(fmt = "PUBCOMP")]
    PublishComplete,
}

impl AckKind {
    fn code(self) -> u16 {
        match self {
            AckKind::ConnectAck => 201,
            AckKind::PublishAck | AckKind::UnsubscribeAck => 202,
            AckKind::SubscribeAck => 203,
            AckKind::PublishRelease => 204,
            AckKind::PublishReceived => 205,
            AckKind::PublishComplete => 206,
        }
    }
}

/// Why a connection attempt did not end in an established session.
#[derive(Debug, Display)]
pub enum ConnectFailure {
    /// The broker answered CONNECT with a non-zero return code.
    #[display(fmt = "{}", _0)]
    Refused(ConnectReturnCode),
    /// No CONNACK arrived within the connect timeout.
    #[display(fmt = "no CONNACK received within the connect timeout")]
    Timeout,
    /// The socket could not be established or died during the handshake.
    #[display(fmt = "socket error: {}", _0)]
    Socket(io::Error),
    /// The TLS layer reported a failure.
    #[display(fmt = "TLS error: {}", _0)]
    Tls(String),
    /// The broker answered with something other than a well-formed CONNACK.
    #[display(fmt = "{}", _0)]
    Handshake(String),
}

impl ConnectFailure {
    fn code(&self) -> u16 {
        match self {
            ConnectFailure::Refused(ConnectReturnCode::UnacceptableProtocolVersion) => 2,
            ConnectFailure::Refused(ConnectReturnCode::IdentifierRejected) => 3,
            ConnectFailure::Refused(ConnectReturnCode::ServiceUnavailable) => 4,
            ConnectFailure::Refused(ConnectReturnCode::BadUserNameOrPassword) => 5,
            ConnectFailure::Refused(ConnectReturnCode::NotAuthorized) => 6,
            ConnectFailure::Refused(ConnectReturnCode::ConnectionAccepted)
            | ConnectFailure::Timeout
            | ConnectFailure::Handshake(_) => 1,
            ConnectFailure::Socket(_) => 1000,
            ConnectFailure::Tls(_) => 2000,
        }
    }
}

/// Everything that can go wrong inside the client.
#[derive(Debug, Display)]
pub enum ClientError {
    /// Pre-flight validation of the connection settings failed.
    #[display(fmt = "invalid configuration: {}", _0)]
    ConfigurationInvalid(String),
    /// The CONNECT/CONNACK exchange did not end in an established session.
    #[display(fmt = "connecting to the broker failed: {}", _0)]
    ConnectingToBrokerFailed(ConnectFailure),
    /// The transport failed on an established session.
    #[display(fmt = "{} data failed: {}", _0, _1)]
    DataTransfer(Direction, io::Error),
    /// An operation that requires an established session was called without one.
    #[display(fmt = "the client is not connected to a broker")]
    NotConnected,
    /// An inbound packet no broker should ever produce.
    #[display(fmt = "invalid message: {}", _0)]
    InvalidMessage(String),
    /// The inbound byte stream violated the wire format.
    #[display(fmt = "protocol violation: {}", _0)]
    ProtocolViolation(DecodeError),
    /// An acknowledgement arrived that no open transaction accounts for.
    #[display(fmt = "unexpected {}: {}", _0, _1)]
    UnexpectedAcknowledgement(AckKind, String),
    /// The pending-message repository refused an operation.
    #[display(fmt = "{}", _0)]
    Repository(RepositoryError),
    /// `unsubscribe` was called for a filter without a subscription.
    #[display(fmt = "no subscription exists for topic filter `{}`", _0)]
    TopicNotSubscribed(String),
    /// A protocol version other than 3.1 / 3.1.1 was requested.
    #[display(fmt = "{}", _0)]
    ProtocolNotSupported(UnsupportedProtocolVersion),
}

impl ClientError {
    /// The stable numeric code of this error, kept for compatibility with
    /// existing deployments. Errors outside the historical table report 0.
    pub fn code(&self) -> u16 {
        match self {
            ClientError::ConnectingToBrokerFailed(failure) => failure.code(),
            ClientError::DataTransfer(Direction::Tx, _) => 101,
            ClientError::DataTransfer(Direction::Rx, _) => 102,
            ClientError::UnexpectedAcknowledgement(kind, _) => kind.code(),
            ClientError::NotConnected => 300,
            _ => 0,
        }
    }

    /// Whether the event loop may log this error and keep the session alive.
    ///
    /// Only acknowledgement mismatches qualify; a CONNACK outside the
    /// handshake is a broker gone rogue and terminates the session.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ClientError::UnexpectedAcknowledgement(AckKind::ConnectAck, _) => false,
            ClientError::UnexpectedAcknowledgement(..) => true,
            _ => false,
        }
    }
}

impl StdError for ClientError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ClientError::DataTransfer(_, err) => Some(err),
            ClientError::ConnectingToBrokerFailed(ConnectFailure::Socket(err)) => Some(err),
            ClientError::ProtocolViolation(err) => Some(err),
            ClientError::Repository(err) => Some(err),
            ClientError::ProtocolNotSupported(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RepositoryError> for ClientError {
    fn from(err: RepositoryError) -> Self {
        ClientError::Repository(err)
    }
}

impl From<UnsupportedProtocolVersion> for ClientError {
    fn from(err: UnsupportedProtocolVersion) -> Self {
        ClientError::ProtocolNotSupported(err)
    }
}
