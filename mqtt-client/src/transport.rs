use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::errors::{ClientError, ConnectFailure};
use crate::settings::ConnectionSettings;

/// The byte-duplex stream a session runs over.
///
/// Establishment, TLS and certificate validation live outside the engine;
/// the session only requires best-effort ordered delivery, a non-blocking
/// read path and a bounded blocking read for the handshake.
pub trait Transport {
    /// Reads whatever is currently available without blocking.
    ///
    /// `Ok(0)` means nothing is buffered right now; a closed connection is
    /// an error.
    fn poll_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Blocks for up to `timeout` until at least one byte arrives; `Ok(0)`
    /// means the timeout passed quietly.
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Writes the whole buffer.
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    fn close(&mut self) -> io::Result<()>;
}

/// Opens a transport when the client connects.
pub trait Connector {
    fn open(
        &mut self,
        host: &str,
        port: u16,
        settings: &ConnectionSettings,
    ) -> Result<Box<dyn Transport>, ClientError>;
}

/// Plain TCP over `std::net`.
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        TcpTransport { stream }
    }
}

impl Transport for TcpTransport {
    fn poll_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.set_nonblocking(true)?;

        match self.stream.read(buf) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by broker",
            )),
            Ok(read) => Ok(read),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(err) => Err(err),
        }
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.stream.set_nonblocking(false)?;
        self.stream.set_read_timeout(Some(timeout))?;

        match self.stream.read(buf) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by broker",
            )),
            Ok(read) => Ok(read),
            Err(ref err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(0)
            }
            Err(err) => Err(err),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.stream.write_all(buf)
    }

    fn close(&mut self) -> io::Result<()> {
        self.stream.shutdown(Shutdown::Both)
    }
}

/// The default connector: plain TCP, bounded by the connect timeout.
///
/// TLS settings are validated by the client but ignored here; connectors
/// that speak TLS wrap the stream themselves.
#[derive(Debug, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn open(
        &mut self,
        host: &str,
        port: u16,
        settings: &ConnectionSettings,
    ) -> Result<Box<dyn Transport>, ClientError> {
        let socket_error =
            |err: io::Error| ClientError::ConnectingToBrokerFailed(ConnectFailure::Socket(err));

        let mut last_error = None;
        for addr in (host, port).to_socket_addrs().map_err(socket_error)? {
            match TcpStream::connect_timeout(&addr, settings.connect_timeout) {
                Ok(stream) => return Ok(Box::new(TcpTransport::new(stream))),
                Err(err) => last_error = Some(err),
            }
        }

        Err(socket_error(last_error.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{}:{} did not resolve to any address", host, port),
            )
        })))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    use super::*;

    #[derive(Debug, Default)]
    struct Shared {
        inbound: VecDeque<Vec<u8>>,
        written: Vec<u8>,
        closed: bool,
    }

    /// A transport fed from a script of inbound chunks, recording every
    /// byte written to it.
    pub(crate) struct ScriptedTransport {
        shared: Rc<RefCell<Shared>>,
    }

    /// The test's view onto a [`ScriptedTransport`] after the client took
    /// ownership of it.
    #[derive(Clone)]
    pub(crate) struct TransportHandle {
        shared: Rc<RefCell<Shared>>,
    }

    pub(crate) fn scripted() -> (ScriptedTransport, TransportHandle) {
        let shared = Rc::new(RefCell::new(Shared::default()));

        (
            ScriptedTransport {
                shared: Rc::clone(&shared),
            },
            TransportHandle { shared },
        )
    }

    impl TransportHandle {
        pub(crate) fn feed(&self, bytes: &[u8]) {
            self.shared.borrow_mut().inbound.push_back(bytes.to_vec());
        }

        pub(crate) fn written(&self) -> Vec<u8> {
            self.shared.borrow().written.clone()
        }

        pub(crate) fn take_written(&self) -> Vec<u8> {
            std::mem::take(&mut self.shared.borrow_mut().written)
        }

        pub(crate) fn exhausted(&self) -> bool {
            self.shared.borrow().inbound.is_empty()
        }

        pub(crate) fn closed(&self) -> bool {
            self.shared.borrow().closed
        }
    }

    impl Transport for ScriptedTransport {
        fn poll_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut shared = self.shared.borrow_mut();

            match shared.inbound.pop_front() {
                Some(mut chunk) => {
                    let read = chunk.len().min(buf.len());
                    buf[..read].copy_from_slice(&chunk[..read]);
                    if read < chunk.len() {
                        chunk.drain(..read);
                        shared.inbound.push_front(chunk);
                    }
                    Ok(read)
                }
                None => Ok(0),
            }
        }

        fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
            self.poll_read(buf)
        }

        fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
            let mut shared = self.shared.borrow_mut();

            if shared.closed {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "transport closed",
                ));
            }
            shared.written.extend_from_slice(buf);

            Ok(())
        }

        fn close(&mut self) -> io::Result<()> {
            self.shared.borrow_mut().closed = true;

            Ok(())
        }
    }

    /// Hands out one prepared [`ScriptedTransport`] on `open`.
    pub(crate) struct ScriptedConnector {
        transport: Option<ScriptedTransport>,
    }

    impl ScriptedConnector {
        pub(crate) fn new(transport: ScriptedTransport) -> Self {
            ScriptedConnector {
                transport: Some(transport),
            }
        }
    }

    impl Connector for ScriptedConnector {
        fn open(
            &mut self,
            _host: &str,
            _port: u16,
            _settings: &ConnectionSettings,
        ) -> Result<Box<dyn Transport>, ClientError> {
            match self.transport.take() {
                Some(transport) => Ok(Box::new(transport)),
                None => Err(ClientError::ConnectingToBrokerFailed(
                    ConnectFailure::Socket(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        "the scripted transport was already taken",
                    )),
                )),
            }
        }
    }
}
