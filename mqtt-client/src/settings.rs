use std::path::PathBuf;
use std::time::Duration;

use mqtt_codec::QoS;

use crate::errors::ClientError;

/// A message the broker publishes on behalf of the client when the session
/// ends abnormally. All fields travel together in CONNECT.
#[derive(Debug, Clone, PartialEq)]
pub struct LastWill {
    /// The topic the broker publishes the will message to.
    pub topic: String,
    /// The will message payload.
    pub payload: Vec<u8>,
    /// The QoS level the broker uses when publishing the will message.
    pub qos: QoS,
    /// Whether the broker retains the will message.
    pub retain: bool,
}

/// TLS material handed to the transport connector.
///
/// The client validates these values but never performs the handshake
/// itself; a connector that speaks TLS receives them verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct TlsOptions {
    /// Verify the peer certificate chain.
    pub verify_peer: bool,
    /// Verify that the peer certificate matches the broker host name.
    pub verify_peer_name: bool,
    /// Accept certificates that are not signed by a trusted authority.
    pub allow_self_signed: bool,
    /// A CA bundle file.
    pub ca_file: Option<PathBuf>,
    /// A directory of trusted CA certificates.
    pub ca_path: Option<PathBuf>,
    /// The client certificate presented to the broker.
    pub client_certificate_file: Option<PathBuf>,
    /// The private key belonging to the client certificate.
    pub client_key_file: Option<PathBuf>,
    /// The passphrase protecting the private key.
    pub client_key_passphrase: Option<String>,
}

impl Default for TlsOptions {
    fn default() -> Self {
        TlsOptions {
            verify_peer: true,
            verify_peer_name: true,
            allow_self_signed: false,
            ca_file: None,
            ca_path: None,
            client_certificate_file: None,
            client_key_file: None,
            client_key_passphrase: None,
        }
    }
}

/// The immutable settings of one connection attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    /// Username presented to the broker.
    pub username: Option<String>,
    /// Password presented to the broker.
    pub password: Option<Vec<u8>>,
    /// Bounds the CONNECT/CONNACK exchange.
    pub connect_timeout: Duration,
    /// Bounds any single blocking read on the transport.
    pub socket_timeout: Duration,
    /// How long an unacknowledged QoS>0 message or unsubscribe request may
    /// rest before the loop retransmits it.
    pub resend_timeout: Duration,
    /// The keep-alive interval announced in CONNECT, in seconds.
    pub keep_alive_interval: u16,
    /// The last-will message, all-or-nothing.
    pub last_will: Option<LastWill>,
    /// TLS material for connectors that speak TLS; `None` means plain TCP.
    pub tls: Option<TlsOptions>,
    /// Reconnect after an abnormal session end. Configuration only; the
    /// engine itself never reconnects.
    pub reconnect_automatically: bool,
    /// Upper bound on reconnect attempts.
    pub max_reconnect_attempts: u32,
    /// Pause between reconnect attempts.
    pub delay_between_reconnect_attempts: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            username: None,
            password: None,
            connect_timeout: Duration::from_secs(60),
            socket_timeout: Duration::from_secs(5),
            resend_timeout: Duration::from_secs(10),
            keep_alive_interval: 10,
            last_will: None,
            tls: None,
            reconnect_automatically: false,
            max_reconnect_attempts: 3,
            delay_between_reconnect_attempts: Duration::from_secs(1),
        }
    }
}

impl ConnectionSettings {
    /// Checks every pre-flight rule; called by `connect()` before the
    /// transport is opened.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.connect_timeout < Duration::from_secs(1) {
            return invalid("the connect timeout must be at least one second");
        }
        if self.socket_timeout < Duration::from_secs(1) {
            return invalid("the socket timeout must be at least one second");
        }
        if self.resend_timeout < Duration::from_secs(1) {
            return invalid("the resend timeout must be at least one second");
        }
        if self.keep_alive_interval == 0 {
            return invalid("the keep-alive interval must be at least one second");
        }
        if self.max_reconnect_attempts == 0 {
            return invalid("at least one reconnect attempt must be allowed");
        }
        if let Some(ref username) = self.username {
            if username.trim().is_empty() {
                return invalid("the username may not consist of whitespace only");
            }
        }
        if let Some(ref will) = self.last_will {
            if will.topic.trim().is_empty() {
                return invalid("the last-will topic may not consist of whitespace only");
            }
        }
        if let Some(ref tls) = self.tls {
            if let Some(ref ca_file) = tls.ca_file {
                if !ca_file.is_file() {
                    return invalid("the TLS CA file does not exist");
                }
            }
            if let Some(ref ca_path) = tls.ca_path {
                if !ca_path.is_dir() {
                    return invalid("the TLS CA directory does not exist");
                }
            }
            if let Some(ref cert) = tls.client_certificate_file {
                if !cert.is_file() {
                    return invalid("the TLS client certificate file does not exist");
                }
            }
            if let Some(ref key) = tls.client_key_file {
                if !key.is_file() {
                    return invalid("the TLS client key file does not exist");
                }
                if tls.client_certificate_file.is_none() {
                    return invalid("a TLS client key requires a client certificate");
                }
            }
            if tls.client_key_passphrase.is_some() && tls.client_key_file.is_none() {
                return invalid("a TLS key passphrase requires a client key");
            }
        }

        Ok(())
    }
}

fn invalid(reason: &str) -> Result<(), ClientError> {
    Err(ClientError::ConfigurationInvalid(reason.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    use matches::assert_matches;

    #[test]
    fn test_default_settings_are_valid() {
        assert_matches!(ConnectionSettings::default().validate(), Ok(()));
    }

    #[test]
    fn test_timeouts() {
        let settings = ConnectionSettings {
            connect_timeout: Duration::from_millis(500),
            ..Default::default()
        };
        assert_matches!(
            settings.validate(),
            Err(ClientError::ConfigurationInvalid(_))
        );

        let settings = ConnectionSettings {
            socket_timeout: Duration::from_millis(0),
            ..Default::default()
        };
        assert_matches!(
            settings.validate(),
            Err(ClientError::ConfigurationInvalid(_))
        );

        let settings = ConnectionSettings {
            resend_timeout: Duration::from_millis(999),
            ..Default::default()
        };
        assert_matches!(
            settings.validate(),
            Err(ClientError::ConfigurationInvalid(_))
        );

        let settings = ConnectionSettings {
            keep_alive_interval: 0,
            ..Default::default()
        };
        assert_matches!(
            settings.validate(),
            Err(ClientError::ConfigurationInvalid(_))
        );
    }

    #[test]
    fn test_reconnect_attempts() {
        let settings = ConnectionSettings {
            max_reconnect_attempts: 0,
            ..Default::default()
        };
        assert_matches!(
            settings.validate(),
            Err(ClientError::ConfigurationInvalid(_))
        );
    }

    #[test]
    fn test_blank_username() {
        let settings = ConnectionSettings {
            username: Some("   ".to_owned()),
            ..Default::default()
        };
        assert_matches!(
            settings.validate(),
            Err(ClientError::ConfigurationInvalid(_))
        );

        let settings = ConnectionSettings {
            username: Some("user".to_owned()),
            ..Default::default()
        };
        assert_matches!(settings.validate(), Ok(()));
    }

    #[test]
    fn test_blank_will_topic() {
        let settings = ConnectionSettings {
            last_will: Some(LastWill {
                topic: " \t".to_owned(),
                payload: b"gone".to_vec(),
                qos: QoS::AtLeastOnce,
                retain: false,
            }),
            ..Default::default()
        };
        assert_matches!(
            settings.validate(),
            Err(ClientError::ConfigurationInvalid(_))
        );
    }

    #[test]
    fn test_tls_files() {
        let settings = ConnectionSettings {
            tls: Some(TlsOptions {
                ca_file: Some(PathBuf::from("/does/not/exist.pem")),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_matches!(
            settings.validate(),
            Err(ClientError::ConfigurationInvalid(_))
        );

        // a key without a certificate is rejected even if the file existed
        let settings = ConnectionSettings {
            tls: Some(TlsOptions {
                client_key_file: Some(PathBuf::from("/does/not/exist.key")),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_matches!(
            settings.validate(),
            Err(ClientError::ConfigurationInvalid(_))
        );

        let settings = ConnectionSettings {
            tls: Some(TlsOptions {
                client_key_passphrase: Some("secret".to_owned()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_matches!(
            settings.validate(),
            Err(ClientError::ConfigurationInvalid(_))
        );

        let settings = ConnectionSettings {
            tls: Some(TlsOptions::default()),
            ..Default::default()
        };
        assert_matches!(settings.validate(), Ok(()));
    }
}
