use crate::coordinator::{Coordinator, CoordinatorError, CoordinatorState, RefreshOutcome};
use crate::transport::Transport;
use log::{debug, error, info, warn};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Wakes a sleeping poll loop and tells it to stop.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleeps up to `timeout`; returns `true` if the signal fired meanwhile.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |stop| !*stop)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Refreshes on a steady cadence until `shutdown` fires or the coordinator fails.
pub fn run_loop<T: Transport>(
    coordinator: &Coordinator<T>,
    interval: Duration,
    shutdown: &ShutdownSignal,
) -> Result<(), String> {
    let result = loop {
        if shutdown.is_triggered() {
            break Ok(());
        }
        let tick_start = Instant::now();

        match coordinator.refresh() {
            Ok(RefreshOutcome::Complete { updated }) => debug!("Poll: {} device(s) updated", updated),
            Ok(RefreshOutcome::PartialFailure { updated, failures }) => {
                let failed = failures.iter().map(|f| f.to_string()).collect::<Vec<_>>().join("; ");
                warn!("Poll: {} device(s) updated, {} failed: {}", updated, failures.len(), failed);
            }
            Ok(RefreshOutcome::Skipped) => debug!("Poll: previous refresh still running"),
            Ok(RefreshOutcome::Cancelled) | Err(CoordinatorError::ShutDown) => break Ok(()),
            Err(CoordinatorError::NotReady(CoordinatorState::Failed)) => {
                break Err("coordinator failed; re-check credentials".to_string());
            }
            Err(CoordinatorError::AllFailed(failures)) if failures.iter().all(|f| f.error.is_retryable()) => {
                warn!("Poll: update failed for every device, retrying next tick")
            }
            Err(e) => error!("Poll: update failed: {}", e),
        }
        if coordinator.state() == CoordinatorState::Failed {
            break Err("coordinator failed; re-check credentials".to_string());
        }

        // Maintain steady cadence
        let elapsed = tick_start.elapsed();
        if elapsed < interval && shutdown.wait_timeout(interval - elapsed) {
            break Ok(());
        }
    };

    coordinator.shutdown();
    info!("Poll loop stopped");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientError;
    use crate::coordinator::Snapshot;
    use crate::coordinator::tests::{coordinator, fan, light, two_devices};
    use crate::transport::scripted::{Call, code, ok};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn signal_interrupts_wait() {
        let signal = ShutdownSignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(5)));
        let s = signal.clone();
        let t = thread::spawn(move || s.wait_timeout(Duration::from_secs(30)));
        signal.trigger();
        assert!(t.join().unwrap());
        assert!(signal.is_triggered());
    }

    #[test]
    fn loop_polls_until_stopped() {
        let c = coordinator(|call: &Call| {
            if call.is("/udm/getDeviceList/v1") {
                ok(two_devices())
            } else if call.device_id() == Some(1) {
                ok(light(false, 80))
            } else {
                ok(fan("70", "50"))
            }
        });
        c.setup().unwrap();

        let signal = ShutdownSignal::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        {
            let ticks = ticks.clone();
            let signal = signal.clone();
            c.subscribe(move |_: &Snapshot| {
                if ticks.fetch_add(1, Ordering::SeqCst) + 1 >= 3 {
                    signal.trigger();
                }
            });
        }

        let worker = {
            let c = c.clone();
            let signal = signal.clone();
            thread::spawn(move || run_loop(&*c, Duration::from_millis(5), &signal))
        };
        assert_eq!(worker.join().unwrap(), Ok(()));
        assert!(ticks.load(Ordering::SeqCst) >= 3);
        assert!(c.is_shut_down());
    }

    #[test]
    fn transport_failures_keep_polling() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let signal = ShutdownSignal::new();
        let c = {
            let attempts = attempts.clone();
            let signal = signal.clone();
            coordinator(move |call: &Call| {
                if call.is("/udm/getDeviceList/v1") {
                    return ok(two_devices());
                }
                if attempts.fetch_add(1, Ordering::SeqCst) >= 5 {
                    signal.trigger();
                }
                Err(ClientError::Transport("unreachable".into()))
            })
        };
        c.setup().unwrap();
        assert_eq!(run_loop(&*c, Duration::from_millis(1), &signal), Ok(()));
        assert!(attempts.load(Ordering::SeqCst) >= 6);
    }

    #[test]
    fn rejected_credentials_stop_the_loop() {
        let c = coordinator(|call: &Call| {
            if call.is("/udm/getDeviceList/v1") { ok(two_devices()) } else { code("102") }
        });
        c.setup().unwrap();
        let signal = ShutdownSignal::new();
        assert!(run_loop(&*c, Duration::from_millis(1), &signal).is_err());
        assert_eq!(c.state(), CoordinatorState::Failed);
    }
}
