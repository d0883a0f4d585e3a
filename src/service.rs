use crate::error::{panic_message, Error, Result};
use crossbeam_channel::bounded;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use tracing::{error, warn};

/// A concurrent job expected to run in background for the whole lifetime of
/// the process, such as a network server.
pub trait Service: Send + Sync {
    /// Start execution and block. Returns a non-nil error when execution
    /// cannot be started or fails abruptly.
    fn start(&self) -> Result<()>;

    /// Stop the running service gracefully, unblocking the thread occupied
    /// by `start`.
    fn stop(&self) -> Result<()>;
}

/// Start all services on dedicated threads and block the current thread
/// until one of them fails or the process receives an interrupt/terminate
/// signal. On exit, all services are stopped gracefully and the stop pass is
/// awaited.
pub fn start_and_block(services: Vec<Arc<dyn Service>>) -> Result<()> {
    let (error_tx, error_rx) = bounded::<Error>(1);

    for service in &services {
        let service = Arc::clone(service);
        let error_tx = error_tx.clone();

        thread::spawn(move || {
            match catch_unwind(AssertUnwindSafe(|| service.start())) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    let _ = error_tx.try_send(err);
                }
                Err(payload) => {
                    let _ = error_tx.try_send(Error::ServicePanic(panic_message(payload.as_ref())));
                }
            }
        });
    }

    let (signal_tx, signal_rx) = bounded::<()>(1);
    if let Err(err) = ctrlc::set_handler(move || {
        let _ = signal_tx.try_send(());
    }) {
        warn!(%err, "failed to install signal handler");
    }

    let result = crossbeam_channel::select! {
        recv(error_rx) -> err => match err {
            Ok(err) => Err(err),
            Err(_) => Ok(()),
        },
        recv(signal_rx) -> _ => Ok(()),
    };

    let mut stopping = Vec::with_capacity(services.len());
    for service in &services {
        let service = Arc::clone(service);
        stopping.push(thread::spawn(move || {
            if catch_unwind(AssertUnwindSafe(|| service.stop())).is_err() {
                error!("panic while stopping service");
            }
        }));
    }
    for handle in stopping {
        let _ = handle.join();
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FailingService;

    impl Service for FailingService {
        fn start(&self) -> Result<()> {
            Err(Error::Io(io::Error::new(
                io::ErrorKind::AddrInUse,
                "address in use",
            )))
        }

        fn stop(&self) -> Result<()> {
            Ok(())
        }
    }

    struct BlockingService {
        stopped: Arc<AtomicBool>,
        release: Arc<Mutex<()>>,
    }

    impl Service for BlockingService {
        fn start(&self) -> Result<()> {
            let _guard = self.release.lock();
            Ok(())
        }

        fn stop(&self) -> Result<()> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn failing_start_unblocks_and_stops_everything() {
        let stopped = Arc::new(AtomicBool::new(false));
        let release = Arc::new(Mutex::new(()));
        let guard = release.lock();

        let blocking = Arc::new(BlockingService {
            stopped: Arc::clone(&stopped),
            release: Arc::clone(&release),
        });

        let result = start_and_block(vec![blocking, Arc::new(FailingService)]);

        assert!(matches!(result, Err(Error::Io(_))));
        assert!(stopped.load(Ordering::SeqCst));
        drop(guard);
    }
}
