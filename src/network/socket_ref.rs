use crate::error::{eof_error, is_timeout};
use crate::network::socket::{CloseReason, Socket};
use parking_lot::RwLock;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// A reference to a socket that can be stored outside its designated handler.
///
/// Sockets are pooled, so holding one past its handler risks touching an
/// object that has been reclaimed and reinitialized for another connection.
/// A `SocketRef` detaches itself when the socket is recycled: every operation
/// takes a read lock, checks the attachment, and either forwards to the
/// socket or reports end-of-stream. Timeouts observed while the reference is
/// detaching are also reported as end-of-stream so pending operations unblock
/// cleanly.
pub struct SocketRef {
    socket: Arc<RwLock<Option<Arc<Socket>>>>,
    detaching: Arc<AtomicBool>,
}

impl SocketRef {
    pub fn new(socket: &Arc<Socket>) -> Self {
        let slot = Arc::new(RwLock::new(Some(Arc::clone(socket))));
        let detaching = Arc::new(AtomicBool::new(false));

        {
            let slot = Arc::clone(&slot);
            let detaching = Arc::clone(&detaching);
            socket.on_recycle(move || {
                detaching.store(true, Ordering::SeqCst);
                *slot.write() = None;
            });
        }

        Self {
            socket: slot,
            detaching,
        }
    }

    fn with<T>(&self, op: impl FnOnce(&Socket) -> io::Result<T>) -> io::Result<T> {
        let guard = self.socket.read();
        let socket = match guard.as_ref() {
            Some(socket) => socket,
            None => return Err(eof_error()),
        };

        match op(socket) {
            Err(err) if is_timeout(&err) && self.detaching.load(Ordering::SeqCst) => {
                Err(eof_error())
            }
            other => other,
        }
    }

    /// True while the underlying socket has not been recycled.
    pub fn is_attached(&self) -> bool {
        self.socket.read().is_some()
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.with(|socket| socket.read(buf))
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.with(|socket| socket.write(buf))
    }

    pub fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        self.with(|socket| socket.write_all(buf))
    }

    pub fn close(&self, reason: CloseReason) -> io::Result<()> {
        self.with(|socket| socket.close(reason))
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.with(|socket| socket.set_read_timeout(timeout))
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.with(|socket| socket.set_write_timeout(timeout))
    }

    /// Remote address of the socket; empty once detached.
    pub fn remote_address(&self) -> String {
        self.socket
            .read()
            .as_ref()
            .map(|socket| socket.remote_address())
            .unwrap_or_default()
    }

    /// Connect time of the socket; `None` once detached.
    pub fn connected_at(&self) -> Option<SystemTime> {
        self.socket
            .read()
            .as_ref()
            .map(|socket| socket.connected_at())
    }

    pub fn total_read(&self) -> u64 {
        self.socket
            .read()
            .as_ref()
            .map(|socket| socket.total_read())
            .unwrap_or(0)
    }

    pub fn read_last_second(&self) -> u64 {
        self.socket
            .read()
            .as_ref()
            .map(|socket| socket.read_last_second())
            .unwrap_or(0)
    }

    pub fn total_written(&self) -> u64 {
        self.socket
            .read()
            .as_ref()
            .map(|socket| socket.total_written())
            .unwrap_or(0)
    }

    pub fn written_last_second(&self) -> u64 {
        self.socket
            .read()
            .as_ref()
            .map(|socket| socket.written_last_second())
            .unwrap_or(0)
    }
}
