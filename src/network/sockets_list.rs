use crate::io::pool::Pool;
use crate::network::socket::{CloseReason, Socket};
use crate::network::stream::Stream;
use parking_lot::RwLock;
use std::sync::Arc;

/// Registry of active sockets, backed by an object pool.
///
/// Sockets are kept in registration order under a reader/writer lock: hot
/// paths (`len`, `iterate`) take the read lock, mutation (`add`, `cleanup`,
/// `reset`) takes the write lock. A socket is returned to the pool only when
/// no other reference to it remains, so the pool never aliases a socket that
/// is still in use.
pub(crate) struct SocketsList {
    sockets: RwLock<Vec<Arc<Socket>>>,
    max_size: Option<usize>,
    pool: Pool<Arc<Socket>>,
}

impl SocketsList {
    /// `max_clients < 0` means no limit.
    pub(crate) fn new(max_clients: i32) -> Self {
        Self {
            sockets: RwLock::new(Vec::new()),
            max_size: if max_clients < 0 {
                None
            } else {
                Some(max_clients as usize)
            },
            pool: Pool::new(|| Arc::new(Socket::new())),
        }
    }

    /// Pull a socket from the pool, attach the connection and register it.
    /// When the client limit is reached the connection is terminated
    /// instantly and `None` is returned.
    pub(crate) fn add(&self, connection: Arc<dyn Stream>) -> Option<Arc<Socket>> {
        let socket = self.pool.get();
        socket.init(Arc::clone(&connection));

        if !self.register(&socket) {
            let _ = connection.shutdown();
            self.recycle_to_pool(socket);
            return None;
        }

        Some(socket)
    }

    pub(crate) fn len(&self) -> usize {
        self.sockets.read().len()
    }

    /// Visit every registered socket in registration order.
    pub(crate) fn iterate(&self, mut visit: impl FnMut(&Arc<Socket>)) {
        for socket in self.sockets.read().iter() {
            visit(socket);
        }
    }

    /// Unlink sockets whose handlers have returned and hand them back to the
    /// pool.
    pub(crate) fn cleanup(&self) {
        let mut reclaimed = Vec::new();
        {
            let mut sockets = self.sockets.write();
            sockets.retain(|socket| {
                if socket.is_recyclable() {
                    reclaimed.push(Arc::clone(socket));
                    false
                } else {
                    true
                }
            });
        }

        for socket in reclaimed {
            self.recycle_to_pool(socket);
        }
    }

    /// Close every socket, run its recycle handlers and empty the list.
    pub(crate) fn reset(&self) {
        let drained: Vec<Arc<Socket>> = {
            let mut sockets = self.sockets.write();
            sockets.drain(..).collect()
        };

        for socket in drained {
            let _ = socket.close(CloseReason::Local);
            socket.recycle();
            self.recycle_to_pool(socket);
        }
    }

    fn register(&self, socket: &Arc<Socket>) -> bool {
        let mut sockets = self.sockets.write();

        if let Some(max) = self.max_size {
            if sockets.len() >= max {
                return false;
            }
        }

        sockets.push(Arc::clone(socket));
        true
    }

    fn recycle_to_pool(&self, socket: Arc<Socket>) {
        socket.reset();

        // a stale clone (handler thread still winding down) keeps the object
        // out of the pool; a fresh socket is built on demand instead
        if Arc::strong_count(&socket) == 1 {
            self.pool.put(socket);
        }
    }

    #[cfg(test)]
    pub(crate) fn pooled(&self) -> usize {
        self.pool.idle()
    }
}
