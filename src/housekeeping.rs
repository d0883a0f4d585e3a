use crate::error::{panic_message, Error};
use crossbeam_channel::{bounded, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread;
use std::time::Duration;
use tracing::error;

/// Periodic background job driving metrics aggregation and socket
/// reclamation.
///
/// A panicking tick is reported through the panic handler (which aborts the
/// server) and ends the job. `stop` only signals the job thread and never
/// joins it, because stopping can be initiated from inside a tick.
pub(crate) struct HousekeepingJob {
    stop: Sender<()>,
}

impl HousekeepingJob {
    pub(crate) fn start<F, P>(interval: Duration, tick: F, panic_handler: P) -> Self
    where
        F: Fn() + Send + 'static,
        P: FnOnce(Error) + Send + 'static,
    {
        let (stop, stop_signal) = bounded::<()>(1);

        let spawned = thread::Builder::new()
            .name("tcpframe-housekeeping".to_string())
            .spawn(move || {
                let ticker = crossbeam_channel::tick(interval);
                let mut panic_handler = Some(panic_handler);

                loop {
                    crossbeam_channel::select! {
                        recv(ticker) -> _ => {
                            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| tick())) {
                                if let Some(handler) = panic_handler.take() {
                                    handler(Error::BackgroundJobPanic(panic_message(
                                        payload.as_ref(),
                                    )));
                                }
                                break;
                            }
                        }
                        recv(stop_signal) -> _ => break,
                    }
                }
            });

        if let Err(err) = spawned {
            error!(%err, "failed to spawn housekeeping thread");
        }

        Self { stop }
    }

    /// Signal the job to finish. Idempotent.
    pub(crate) fn stop(&self) {
        let _ = self.stop.try_send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);

        let job = HousekeepingJob::start(
            Duration::from_millis(10),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            |_| {},
        );

        thread::sleep(Duration::from_millis(100));
        job.stop();
        let observed = ticks.load(Ordering::SeqCst);
        assert!(observed >= 2, "observed {observed} ticks");

        thread::sleep(Duration::from_millis(50));
        let after_stop = ticks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert!(ticks.load(Ordering::SeqCst) <= after_stop + 1);
    }

    #[test]
    fn panicking_tick_reports_and_ends_the_job() {
        let (report_tx, report_rx) = bounded(1);

        let _job = HousekeepingJob::start(
            Duration::from_millis(10),
            || panic!("tick exploded"),
            move |err| {
                let _ = report_tx.try_send(err.to_string());
            },
        );

        let message = report_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("panic reported");
        assert!(message.contains("tick exploded"));
    }
}
