use crate::error::{eof_error, is_broken_pipe};
use crate::io::metered::{Meter, MeteredReader, MeteredWriter};
use crate::network::stream::{Stream, StreamReader, StreamWriter, TlsStream};
use parking_lot::{Mutex, RwLock};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Why a socket was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The connection was closed intentionally on the server side.
    Local,

    /// The connection was closed by the client or lost.
    Peer,
}

type CloseHandler = Box<dyn FnOnce(CloseReason) + Send>;
type RecycleHandler = Box<dyn FnOnce() + Send>;

/// A connected socket.
///
/// Sockets are pool-allocated: an instance is only valid inside its
/// designated handler and its identity may be reused once the handler
/// returns. Code that needs to keep a socket around longer must go through
/// [`SocketRef`](crate::SocketRef).
///
/// Reads and writes are metered, and broken-pipe class failures close the
/// socket with [`CloseReason::Peer`] and surface as end-of-stream.
pub struct Socket {
    remote_addr: RwLock<String>,
    connected_at: RwLock<Option<SystemTime>>,
    connection: RwLock<Option<Arc<dyn Stream>>>,
    reader: Mutex<Option<Box<dyn Read + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    read_meter: Arc<Meter>,
    write_meter: Arc<Meter>,
    closed: AtomicBool,
    recyclable: AtomicBool,
    close_handlers: Mutex<Vec<CloseHandler>>,
    recycle_handlers: Mutex<Vec<RecycleHandler>>,
}

impl Socket {
    pub(crate) fn new() -> Self {
        Self {
            remote_addr: RwLock::new(String::new()),
            connected_at: RwLock::new(None),
            connection: RwLock::new(None),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            read_meter: Arc::new(Meter::new()),
            write_meter: Arc::new(Meter::new()),
            closed: AtomicBool::new(false),
            recyclable: AtomicBool::new(false),
            close_handlers: Mutex::new(Vec::new()),
            recycle_handlers: Mutex::new(Vec::new()),
        }
    }

    /// Attach a freshly accepted connection to this (pooled) socket.
    pub(crate) fn init(&self, connection: Arc<dyn Stream>) {
        let remote = connection
            .peer_addr()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_default();

        *self.remote_addr.write() = remote;
        *self.connected_at.write() = Some(SystemTime::now());
        *self.reader.lock() = Some(Box::new(MeteredReader::new(
            StreamReader(Arc::clone(&connection)),
            Arc::clone(&self.read_meter),
        )));
        *self.writer.lock() = Some(Box::new(MeteredWriter::new(
            StreamWriter(Arc::clone(&connection)),
            Arc::clone(&self.write_meter),
        )));
        *self.connection.write() = Some(connection);
    }

    /// Read into `buf`. `Ok(0)` with a non-empty buffer means the peer closed
    /// the connection; the socket is closed with [`CloseReason::Peer`] before
    /// returning.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let result = {
            let mut guard = self.reader.lock();
            match guard.as_mut() {
                Some(reader) => reader.read(buf),
                None => return Err(eof_error()),
            }
        };

        match result {
            Ok(0) if !buf.is_empty() => {
                let _ = self.close(CloseReason::Peer);
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(err) if is_broken_pipe(&err) => {
                let _ = self.close(CloseReason::Peer);
                Err(eof_error())
            }
            Err(err) => Err(err),
        }
    }

    /// Write `buf`, returning the number of bytes accepted by the transport.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let result = {
            let mut guard = self.writer.lock();
            match guard.as_mut() {
                Some(writer) => writer.write(buf),
                None => return Err(eof_error()),
            }
        };

        match result {
            Err(err) if is_broken_pipe(&err) => {
                let _ = self.close(CloseReason::Peer);
                Err(eof_error())
            }
            other => other,
        }
    }

    /// Write the whole buffer, retrying on short writes.
    pub fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write(buf)? {
                0 => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write whole buffer",
                    ))
                }
                n => buf = &buf[n..],
            }
        }
        Ok(())
    }

    pub fn flush(&self) -> io::Result<()> {
        let mut guard = self.writer.lock();
        match guard.as_mut() {
            Some(writer) => writer.flush(),
            None => Err(eof_error()),
        }
    }

    /// Close the underlying connection and run the registered close handlers
    /// in reverse registration order. Idempotent: only the first call has any
    /// effect.
    pub fn close(&self, reason: CloseReason) -> io::Result<()> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let result = match self.connection.read().as_ref() {
            Some(connection) => connection.shutdown(),
            None => Ok(()),
        };

        let handlers: Vec<CloseHandler> = self.close_handlers.lock().drain(..).collect();
        for handler in handlers.into_iter().rev() {
            handler(reason);
        }

        result
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Set the read timeout on the underlying connection.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        let connection = match self.connection.read().as_ref() {
            Some(connection) => Arc::clone(connection),
            None => return Err(eof_error()),
        };

        match connection.set_read_timeout(timeout) {
            Err(err) if is_broken_pipe(&err) => {
                let _ = self.close(CloseReason::Peer);
                Err(eof_error())
            }
            other => other,
        }
    }

    /// Set the write timeout on the underlying connection.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        let connection = match self.connection.read().as_ref() {
            Some(connection) => Arc::clone(connection),
            None => return Err(eof_error()),
        };

        match connection.set_write_timeout(timeout) {
            Err(err) if is_broken_pipe(&err) => {
                let _ = self.close(CloseReason::Peer);
                Err(eof_error())
            }
            other => other,
        }
    }

    /// Remote address of the socket.
    pub fn remote_address(&self) -> String {
        self.remote_addr.read().clone()
    }

    /// The moment the socket connected.
    pub fn connected_at(&self) -> SystemTime {
        self.connected_at.read().unwrap_or(UNIX_EPOCH)
    }

    /// Register a handler called once when the connection is closed.
    pub fn on_close(&self, handler: impl FnOnce(CloseReason) + Send + 'static) {
        self.close_handlers.lock().push(Box::new(handler));
    }

    /// Register a handler called when the socket object is reclaimed by the
    /// pool.
    pub fn on_recycle(&self, handler: impl FnOnce() + Send + 'static) {
        self.recycle_handlers.lock().push(Box::new(handler));
    }

    /// The underlying stream.
    pub fn stream(&self) -> Option<Arc<dyn Stream>> {
        self.connection.read().clone()
    }

    /// The underlying TLS stream, when the connection was accepted in TLS
    /// mode.
    pub fn tls_stream(&self) -> Option<Arc<TlsStream>> {
        self.stream()?.into_any().downcast::<TlsStream>().ok()
    }

    /// Replace the visible reader with a wrapped one; used by middleware.
    /// The meter stays innermost, so counters keep reflecting bytes that
    /// actually crossed the connection.
    pub fn wrap_reader(
        &self,
        wrap: impl FnOnce(Box<dyn Read + Send>) -> Box<dyn Read + Send>,
    ) {
        let mut guard = self.reader.lock();
        if let Some(reader) = guard.take() {
            *guard = Some(wrap(reader));
        }
    }

    /// Replace the visible writer with a wrapped one; used by middleware.
    pub fn wrap_writer(
        &self,
        wrap: impl FnOnce(Box<dyn Write + Send>) -> Box<dyn Write + Send>,
    ) {
        let mut guard = self.writer.lock();
        if let Some(writer) = guard.take() {
            *guard = Some(wrap(writer));
        }
    }

    /// Total number of bytes read through this socket.
    pub fn total_read(&self) -> u64 {
        self.read_meter.total()
    }

    /// Number of bytes read from this socket during the last second.
    pub fn read_last_second(&self) -> u64 {
        self.read_meter.per_second()
    }

    /// Total number of bytes written through this socket.
    pub fn total_written(&self) -> u64 {
        self.write_meter.total()
    }

    /// Number of bytes written to this socket during the last second.
    pub fn written_last_second(&self) -> u64 {
        self.write_meter.per_second()
    }

    /// Run recycle handlers (in reverse registration order) and mark the
    /// socket reclaimable by the next housekeeping sweep.
    pub(crate) fn recycle(&self) {
        let handlers: Vec<RecycleHandler> = self.recycle_handlers.lock().drain(..).collect();
        for handler in handlers.into_iter().rev() {
            handler();
        }

        self.recyclable.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_recyclable(&self) -> bool {
        self.recyclable.load(Ordering::SeqCst)
    }

    /// Clear all mutable state before the socket returns to the pool.
    pub(crate) fn reset(&self) {
        self.remote_addr.write().clear();
        *self.connected_at.write() = None;
        *self.connection.write() = None;
        *self.reader.lock() = None;
        *self.writer.lock() = None;
        self.read_meter.reset();
        self.write_meter.reset();
        self.closed.store(false, Ordering::SeqCst);
        self.recyclable.store(false, Ordering::SeqCst);
        self.close_handlers.lock().clear();
        self.recycle_handlers.lock().clear();
    }

    pub(crate) fn update_metrics(&self, interval: Duration) -> (u64, u64) {
        let reads = self.read_meter.update(interval);
        let writes = self.write_meter.update(interval);
        (reads, writes)
    }
}

impl Read for &Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Socket::read(self, buf)
    }
}

impl Write for &Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Socket::write(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Socket::flush(self)
    }
}
