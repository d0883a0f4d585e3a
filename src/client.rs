use crate::error::{eof_error, is_broken_pipe};
use crate::network::stream::{Stream, TlsStream};
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

type CloseHandler = Box<dyn FnOnce() + Send>;

/// A TCP/TLS client.
///
/// Mirrors the server-side socket semantics: broken-pipe class failures
/// close the connection and surface as end-of-stream.
pub struct Client {
    stream: Arc<dyn Stream>,
    closed: AtomicBool,
    close_handler: Mutex<Option<CloseHandler>>,
}

impl Client {
    /// Connect to a TCP socket.
    pub fn connect(address: impl ToSocketAddrs) -> io::Result<Self> {
        let stream = TcpStream::connect(address)?;
        Ok(Self::from_stream(Arc::new(stream)))
    }

    /// Connect to a TCP socket and perform a TLS handshake. The connection
    /// is TLS secured.
    pub fn connect_tls(
        address: impl ToSocketAddrs,
        server_name: &str,
        config: Arc<rustls::ClientConfig>,
    ) -> io::Result<Self> {
        let stream = TcpStream::connect(address)?;
        let stream = TlsStream::client(stream, server_name, config)?;
        Ok(Self::from_stream(Arc::new(stream)))
    }

    fn from_stream(stream: Arc<dyn Stream>) -> Self {
        Self {
            stream,
            closed: AtomicBool::new(false),
            close_handler: Mutex::new(None),
        }
    }

    /// Close the connection and run the close handler. Idempotent.
    pub fn close(&self) -> io::Result<()> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let result = self.stream.shutdown();

        if let Some(handler) = self.close_handler.lock().take() {
            handler();
        }

        result
    }

    /// Set a handler called when the connection closes, either side first.
    pub fn on_close(&self, handler: impl FnOnce() + Send + 'static) {
        *self.close_handler.lock() = Some(Box::new(handler));
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_write_timeout(timeout)
    }

    /// The underlying stream.
    pub fn stream(&self) -> Arc<dyn Stream> {
        Arc::clone(&self.stream)
    }

    /// The underlying TLS stream, when connected through `connect_tls`.
    pub fn tls_stream(&self) -> Option<Arc<TlsStream>> {
        Arc::clone(&self.stream).into_any().downcast::<TlsStream>().ok()
    }

    fn read_impl(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.read(buf) {
            Ok(0) if !buf.is_empty() => {
                let _ = self.close();
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(err) if is_broken_pipe(&err) => {
                let _ = self.close();
                Err(eof_error())
            }
            Err(err) => Err(err),
        }
    }

    fn write_impl(&self, buf: &[u8]) -> io::Result<usize> {
        match self.stream.write(buf) {
            Err(err) if is_broken_pipe(&err) => {
                let _ = self.close();
                Err(eof_error())
            }
            other => other,
        }
    }
}

impl Read for Client {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_impl(buf)
    }
}

impl Read for &Client {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_impl(buf)
    }
}

impl Write for Client {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_impl(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Write for &Client {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_impl(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}
