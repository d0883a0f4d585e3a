use crate::config::ServerConfig;
use crate::error::{is_broken_pipe, Error, Result};
use crate::forking::{ForkingStrategy, PanicHandler};
use crate::housekeeping::HousekeepingJob;
use crate::metrics::ServerMetrics;
use crate::network::listener::{Listener, NetListener};
use crate::network::sockets_list::SocketsList;
use crate::network::stream::Stream;
use crate::service::Service;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

type LifecycleHandler = Box<dyn Fn() + Send + Sync>;
type MetricsHandler = Box<dyn Fn(&ServerMetrics) + Send + Sync>;
type AcceptErrorHandler = Box<dyn Fn(&Error) + Send + Sync>;

/// A TCP server.
///
/// The server accepts connections through its [`Listener`] and passes them to
/// their handlers as defined by the configured [`ForkingStrategy`]. A
/// background job aggregates metrics and reclaims closed sockets once per
/// tick interval.
///
/// `Server` is cheap to clone; clones share the same instance.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: ServerConfig,
    address: String,
    listener: RwLock<Option<Arc<dyn Listener>>>,
    forking_strategy: RwLock<Option<Arc<dyn ForkingStrategy>>>,
    sockets: SocketsList,
    metrics: Mutex<ServerMetrics>,
    error_tx: Sender<Error>,
    error_rx: Receiver<Error>,
    running: AtomicBool,
    running_lock: Mutex<()>,
    housekeeping: Mutex<Option<HousekeepingJob>>,
    aborted: AtomicBool,
    metrics_handler: RwLock<Option<MetricsHandler>>,
    start_handler: RwLock<Option<LifecycleHandler>>,
    stop_handler: RwLock<Option<LifecycleHandler>>,
    socket_panic_handler: RwLock<Option<PanicHandler>>,
    server_panic_handler: RwLock<Option<PanicHandler>>,
    accept_error_handler: RwLock<Option<AcceptErrorHandler>>,
}

impl Server {
    /// Create a server bound to `address` once started.
    pub fn new(address: impl Into<String>, config: ServerConfig) -> Self {
        let address = address.into();
        let (error_tx, error_rx) = bounded(1);

        Self {
            inner: Arc::new(ServerInner {
                listener: RwLock::new(Some(Arc::new(NetListener::new(
                    address.clone(),
                    config.clone(),
                )))),
                sockets: SocketsList::new(config.max_clients),
                config,
                address,
                forking_strategy: RwLock::new(None),
                metrics: Mutex::new(ServerMetrics::default()),
                error_tx,
                error_rx,
                running: AtomicBool::new(false),
                running_lock: Mutex::new(()),
                housekeeping: Mutex::new(None),
                aborted: AtomicBool::new(false),
                metrics_handler: RwLock::new(None),
                start_handler: RwLock::new(None),
                stop_handler: RwLock::new(None),
                socket_panic_handler: RwLock::new(None),
                server_panic_handler: RwLock::new(None),
                accept_error_handler: RwLock::new(None),
            }),
        }
    }

    /// Set the forking strategy. Ignored while the server is running.
    pub fn set_forking_strategy(&self, strategy: impl ForkingStrategy + 'static) {
        let _guard = self.inner.running_lock.lock();
        if self.inner.running.load(Ordering::SeqCst) {
            return;
        }

        *self.inner.forking_strategy.write() = Some(Arc::new(strategy));
    }

    /// Overwrite the default listener. Should be used with care; ignored
    /// while the server is running.
    pub fn set_listener(&self, listener: impl Listener + 'static) {
        let _guard = self.inner.running_lock.lock();
        if self.inner.running.load(Ordering::SeqCst) {
            return;
        }

        *self.inner.listener.write() = Some(Arc::new(listener));
    }

    /// Port the listener is bound to. Only meaningful after `start`.
    pub fn port(&self) -> u16 {
        self.inner
            .listener
            .read()
            .as_ref()
            .and_then(|listener| listener.local_addr())
            .map(|addr| addr.port())
            .unwrap_or(0)
    }

    /// A snapshot of the aggregated server metrics.
    pub fn metrics(&self) -> ServerMetrics {
        self.inner.metrics.lock().clone()
    }

    /// Set a handler called once per tick with fresh metrics.
    pub fn on_metrics_update(&self, handler: impl Fn(&ServerMetrics) + Send + Sync + 'static) {
        *self.inner.metrics_handler.write() = Some(Box::new(handler));
    }

    /// Set a handler called when the server starts.
    pub fn on_start(&self, handler: impl Fn() + Send + Sync + 'static) {
        *self.inner.start_handler.write() = Some(Box::new(handler));
    }

    /// Set a handler called when the server stops.
    pub fn on_stop(&self, handler: impl Fn() + Send + Sync + 'static) {
        *self.inner.stop_handler.write() = Some(Box::new(handler));
    }

    /// Set a handler for panics inside connection handlers.
    pub fn on_socket_panic(&self, handler: impl Fn(&Error) + Send + Sync + 'static) {
        *self.inner.socket_panic_handler.write() = Some(Arc::new(handler));
    }

    /// Set a handler for panics inside server background jobs.
    pub fn on_server_panic(&self, handler: impl Fn(&Error) + Send + Sync + 'static) {
        *self.inner.server_panic_handler.write() = Some(Arc::new(handler));
    }

    /// Set a handler for transient errors returned by `accept`.
    pub fn on_accept_error(&self, handler: impl Fn(&Error) + Send + Sync + 'static) {
        *self.inner.accept_error_handler.write() = Some(Box::new(handler));
    }

    /// Start the server and block until [`stop`](Server::stop) or
    /// [`abort`](Server::abort) is called.
    pub fn start(&self) -> Result<()> {
        {
            let _guard = self.inner.running_lock.lock();

            let listener = self
                .inner
                .listener
                .read()
                .clone()
                .ok_or(Error::MissingListener)?;
            let strategy = self
                .inner
                .forking_strategy
                .read()
                .clone()
                .ok_or(Error::MissingForkingStrategy)?;

            self.inner
                .config
                .validate()
                .map_err(|err| Error::Config(err.to_string()))?;

            listener.listen()?;

            ServerInner::start_housekeeping(&self.inner);
            strategy.on_start(self.inner.socket_panic_handler.read().clone());

            if let Some(handler) = &*self.inner.start_handler.read() {
                handler();
            }

            self.inner.running.store(true, Ordering::SeqCst);
            info!(address = %self.inner.address, "server started");
        }

        self.inner.accept_loop()
    }

    /// Stop the server and unblock [`start`](Server::start).
    pub fn stop(&self) -> Result<()> {
        self.inner.stop()
    }

    /// Stop the server, making [`start`](Server::start) return `err`.
    /// Single-shot: subsequent aborts are no-ops.
    pub fn abort(&self, err: Error) -> Result<()> {
        self.inner.abort(err)
    }
}

impl ServerInner {
    fn start_housekeeping(inner: &Arc<ServerInner>) {
        let tick_inner = Arc::clone(inner);
        let panic_inner = Arc::clone(inner);

        let job = HousekeepingJob::start(
            inner.config.tick_interval,
            move || tick_inner.tick(),
            move |err| {
                error!(%err, "housekeeping job panicked, aborting server");
                if let Some(handler) = panic_inner.server_panic_handler.read().clone() {
                    handler(&err);
                }
                let _ = panic_inner.abort(err);
            },
        );

        *inner.housekeeping.lock() = Some(job);
    }

    /// One housekeeping pass: refresh per-socket meters, fold them into the
    /// server metrics, let the forking strategy publish its counters, then
    /// sweep recyclable sockets.
    fn tick(&self) {
        let interval = self.config.tick_interval;
        let connections = self.sockets.len();

        let mut reads = 0u64;
        let mut writes = 0u64;
        self.sockets.iterate(|socket| {
            let (socket_reads, socket_writes) = socket.update_metrics(interval);
            reads += socket_reads;
            writes += socket_writes;
        });

        let snapshot = {
            let mut metrics = self.metrics.lock();
            metrics.connections = connections;
            metrics.total_read += reads;
            metrics.total_written += writes;
            metrics.read_last_second = (reads as f64 / interval.as_secs_f64()) as u64;
            metrics.written_last_second = (writes as f64 / interval.as_secs_f64()) as u64;

            if let Some(strategy) = &*self.forking_strategy.read() {
                strategy.on_metrics_update(&mut metrics);
            }

            metrics.clone()
        };

        if let Some(handler) = &*self.metrics_handler.read() {
            handler(&snapshot);
        }

        self.sockets.cleanup();
    }

    fn accept_loop(&self) -> Result<()> {
        loop {
            let listener = match self.listener.read().clone() {
                Some(listener) => listener,
                None => break,
            };

            match listener.accept() {
                Ok(connection) => self.handle_new_connection(connection),
                Err(err) => {
                    if is_broken_pipe(&err) {
                        break;
                    }

                    warn!(%err, "accept failed");
                    if let Some(handler) = &*self.accept_error_handler.read() {
                        handler(&Error::Io(err));
                    }
                }
            }
        }

        match self.error_rx.try_recv() {
            Ok(err) => Err(err),
            Err(_) => Ok(()),
        }
    }

    fn handle_new_connection(&self, connection: Arc<dyn Stream>) {
        let remote = connection.peer_addr();

        match self.sockets.add(connection) {
            Some(socket) => {
                debug!(remote = ?remote, "connection accepted");
                if let Some(strategy) = &*self.forking_strategy.read() {
                    strategy.on_accept(socket);
                }
            }
            None => {
                debug!(remote = ?remote, "connection rejected, client limit reached");
            }
        }
    }

    fn stop(&self) -> Result<()> {
        let _guard = self.running_lock.lock();

        if self
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let mut result = Ok(());
        if let Some(listener) = &*self.listener.read() {
            if let Err(err) = listener.close() {
                if !is_broken_pipe(&err) {
                    result = Err(Error::Io(err));
                }
            }
        }

        if let Some(job) = self.housekeeping.lock().take() {
            job.stop();
        }

        self.sockets.reset();

        if let Some(strategy) = &*self.forking_strategy.read() {
            strategy.on_stop();
        }

        if let Some(handler) = &*self.stop_handler.read() {
            handler();
        }

        info!(address = %self.address, "server stopped");
        result
    }

    fn abort(&self, err: Error) -> Result<()> {
        if self
            .aborted
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let _ = self.error_tx.try_send(err);
        self.stop()
    }
}

impl Service for Server {
    fn start(&self) -> Result<()> {
        Server::start(self)
    }

    fn stop(&self) -> Result<()> {
        Server::stop(self)
    }
}
