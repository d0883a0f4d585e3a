use crate::error::{panic_message, Error};
use crate::metrics::ServerMetrics;
use crate::network::socket::{CloseReason, Socket};
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::warn;

/// Handler invoked when a forked task observes a panic.
pub type PanicHandler = Arc<dyn Fn(&Error) + Send + Sync>;

/// Policy deciding how each accepted connection is executed.
///
/// The most naive implementation dedicates a thread to every connection and
/// makes it responsible for the whole connection lifecycle. Servers with
/// different concurrency needs can implement a worker pool or reactor on top
/// of this interface without touching the framing engine, which only ever
/// sees blocking reads and writes.
pub trait ForkingStrategy: Send + Sync {
    /// Called once, after server start.
    fn on_start(&self, panic_handler: Option<PanicHandler>);

    /// Called for every connection accepted by the server. The
    /// implementation owns all interaction with the socket: it must close it
    /// and mark it recyclable after use, and recover from panics in the
    /// handler.
    fn on_accept(&self, socket: Arc<Socket>);

    /// Called every time the server updates its metrics.
    fn on_metrics_update(&self, metrics: &mut ServerMetrics);

    /// Called once, after server stop.
    fn on_stop(&self);
}

/// Runs every connection on a dedicated thread.
///
/// This is the recommended strategy for general-purpose servers: the handler
/// may block freely, and the connection is closed and recycled when it
/// returns, panics included.
pub struct ThreadPerConnection {
    handler: Arc<dyn Fn(&Socket) + Send + Sync>,
    active: Arc<AtomicUsize>,
    panic_handler: RwLock<Option<PanicHandler>>,
}

impl ThreadPerConnection {
    pub fn new(handler: impl Fn(&Socket) + Send + Sync + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
            active: Arc::new(AtomicUsize::new(0)),
            panic_handler: RwLock::new(None),
        }
    }
}

impl ForkingStrategy for ThreadPerConnection {
    fn on_start(&self, panic_handler: Option<PanicHandler>) {
        *self.panic_handler.write() = panic_handler;
    }

    fn on_accept(&self, socket: Arc<Socket>) {
        let handler = Arc::clone(&self.handler);
        let active = Arc::clone(&self.active);
        let panic_handler = self.panic_handler.read().clone();

        let spawned = thread::Builder::new()
            .name("tcpframe-connection".to_string())
            .spawn(move || {
                active.fetch_add(1, Ordering::SeqCst);

                let result = catch_unwind(AssertUnwindSafe(|| handler(&socket)));

                let _ = socket.close(CloseReason::Local);
                socket.recycle();
                active.fetch_sub(1, Ordering::SeqCst);

                if let Err(payload) = result {
                    if let Some(panic_handler) = panic_handler {
                        panic_handler(&Error::HandlerPanic(panic_message(payload.as_ref())));
                    }
                }
            });

        if let Err(err) = spawned {
            warn!(%err, "failed to spawn connection thread");
        }
    }

    fn on_metrics_update(&self, metrics: &mut ServerMetrics) {
        metrics.threads = self.active.load(Ordering::SeqCst);
    }

    fn on_stop(&self) {}
}
