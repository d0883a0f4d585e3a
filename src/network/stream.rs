use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use rustls::{ClientConnection, ServerConnection, StreamOwned};
use std::any::Any;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

/// Bidirectional byte channel handed out by a [`Listener`](crate::Listener).
///
/// All operations take a shared reference so a stream can be driven from the
/// connection thread while control operations (timeouts, shutdown) come from
/// elsewhere. Plain TCP and TLS connections both satisfy this contract.
pub trait Stream: Send + Sync {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    fn flush(&self) -> io::Result<()>;

    /// Remote address, when the transport has one.
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Local address, when the transport has one.
    fn local_addr(&self) -> Option<SocketAddr>;

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Shut down both directions; pending blocking reads and writes fail.
    fn shutdown(&self) -> io::Result<()>;

    /// Type-erased escape hatch used to recover the concrete stream type.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl fmt::Debug for dyn Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("dyn Stream")
            .field("peer_addr", &self.peer_addr())
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

impl Stream for TcpStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(&mut &*self, buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        Write::write(&mut &*self, buf)
    }

    fn flush(&self) -> io::Result<()> {
        Write::flush(&mut &*self)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        TcpStream::local_addr(self).ok()
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(unix)]
impl Stream for std::os::unix::net::UnixStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(&mut &*self, buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        Write::write(&mut &*self, buf)
    }

    fn flush(&self) -> io::Result<()> {
        Write::flush(&mut &*self)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_write_timeout(self, timeout)
    }

    fn shutdown(&self) -> io::Result<()> {
        std::os::unix::net::UnixStream::shutdown(self, Shutdown::Both)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

enum TlsSession {
    Server(StreamOwned<ServerConnection, TcpStream>),
    Client(StreamOwned<ClientConnection, TcpStream>),
}

/// TLS connection over TCP.
///
/// rustls serializes record processing, so reads and writes share one session
/// lock. A cloned control handle keeps timeouts and shutdown independent of
/// the session lock, letting `shutdown` interrupt a blocked read.
pub struct TlsStream {
    session: Mutex<TlsSession>,
    control: TcpStream,
}

impl TlsStream {
    pub(crate) fn server(stream: TcpStream, config: Arc<rustls::ServerConfig>) -> io::Result<Self> {
        let control = stream.try_clone()?;
        let connection = ServerConnection::new(config)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

        Ok(Self {
            session: Mutex::new(TlsSession::Server(StreamOwned::new(connection, stream))),
            control,
        })
    }

    pub(crate) fn client(
        stream: TcpStream,
        server_name: &str,
        config: Arc<rustls::ClientConfig>,
    ) -> io::Result<Self> {
        let control = stream.try_clone()?;
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        let connection = ClientConnection::new(config, name)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

        Ok(Self {
            session: Mutex::new(TlsSession::Client(StreamOwned::new(connection, stream))),
            control,
        })
    }
}

impl Stream for TlsStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut *self.session.lock() {
            TlsSession::Server(session) => session.read(buf),
            TlsSession::Client(session) => session.read(buf),
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        match &mut *self.session.lock() {
            TlsSession::Server(session) => session.write(buf),
            TlsSession::Client(session) => session.write(buf),
        }
    }

    fn flush(&self) -> io::Result<()> {
        match &mut *self.session.lock() {
            TlsSession::Server(session) => session.flush(),
            TlsSession::Client(session) => session.flush(),
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.control.peer_addr().ok()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.control.local_addr().ok()
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.control.set_read_timeout(timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.control.set_write_timeout(timeout)
    }

    fn shutdown(&self) -> io::Result<()> {
        self.control.shutdown(Shutdown::Both)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Adapter exposing a shared stream as `std::io::Read`, used to build the
/// socket's metered reader chain.
pub(crate) struct StreamReader(pub(crate) Arc<dyn Stream>);

impl Read for StreamReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

/// Adapter exposing a shared stream as `std::io::Write`.
pub(crate) struct StreamWriter(pub(crate) Arc<dyn Stream>);

impl Write for StreamWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}
