//! Wall-clock deadline monitor.
//!
//! A single watchdog thread sleeps until the armed deadline and then raises
//! an atomic flag. The dispatch loop polls the flag at safe points (host
//! calls and between actions); running contract code is never interrupted.
//! Once raised, the flag stays raised until the next `start`.
//!
//! Expiry is a local safety valve. It is a subjective failure and never
//! feeds billing, which uses charged CPU only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use meterchain_primitives::{ChainError, ChainResult};

#[derive(Debug, Default)]
struct Timer {
    deadline: Option<Instant>,
    started: Option<Instant>,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct Shared {
    expired: AtomicBool,
    timer: Mutex<Timer>,
    wake: Condvar,
}

/// Watchdog for one transaction at a time.
#[derive(Debug)]
pub struct DeadlineMonitor {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl DeadlineMonitor {
    /// Spawn the watchdog thread, disarmed.
    pub fn new() -> ChainResult<Self> {
        let shared = Arc::new(Shared::default());
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("checktime".into())
            .spawn(move || watchdog(&worker_shared))
            .map_err(|e| ChainError::ControllerState(format!("spawn checktime thread: {e}")))?;
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Arm for `deadline`, clearing any previous expiry.
    pub fn start(&self, deadline: Instant) {
        let mut timer = self.shared.timer.lock();
        let now = Instant::now();
        timer.started = Some(now);
        if deadline <= now {
            timer.deadline = None;
            self.shared.expired.store(true, Ordering::Release);
        } else {
            timer.deadline = Some(deadline);
            self.shared.expired.store(false, Ordering::Release);
        }
        self.shared.wake.notify_one();
    }

    /// Disarm. An expiry already raised stays visible.
    pub fn stop(&self) {
        let mut timer = self.shared.timer.lock();
        timer.deadline = None;
        self.shared.wake.notify_one();
    }

    pub fn expired(&self) -> bool {
        self.shared.expired.load(Ordering::Acquire)
    }

    /// `DeadlineExceeded` once the armed deadline has passed.
    pub fn checktime(&self) -> ChainResult<()> {
        if !self.expired() {
            return Ok(());
        }
        let elapsed_us = self
            .shared
            .timer
            .lock()
            .started
            .map_or(0, |s| s.elapsed().as_micros() as u64);
        Err(ChainError::DeadlineExceeded { elapsed_us })
    }
}

impl Drop for DeadlineMonitor {
    fn drop(&mut self) {
        {
            let mut timer = self.shared.timer.lock();
            timer.shutdown = true;
            self.shared.wake.notify_one();
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("checktime thread panicked");
            }
        }
    }
}

fn watchdog(shared: &Shared) {
    let mut timer = shared.timer.lock();
    loop {
        if timer.shutdown {
            return;
        }
        match timer.deadline {
            None => shared.wake.wait(&mut timer),
            Some(deadline) => {
                if Instant::now() >= deadline {
                    shared.expired.store(true, Ordering::Release);
                    timer.deadline = None;
                } else {
                    shared.wake.wait_until(&mut timer, deadline);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn wait_for(monitor: &DeadlineMonitor) -> bool {
        for _ in 0..200 {
            if monitor.expired() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_not_expired_before_deadline() {
        let monitor = DeadlineMonitor::new().unwrap();
        monitor.start(Instant::now() + Duration::from_secs(60));
        assert!(!monitor.expired());
        assert!(monitor.checktime().is_ok());
    }

    #[test]
    fn test_expires_after_deadline() {
        let monitor = DeadlineMonitor::new().unwrap();
        monitor.start(Instant::now() + Duration::from_millis(10));
        assert!(wait_for(&monitor));
        let err = monitor.checktime().unwrap_err();
        assert!(matches!(err, ChainError::DeadlineExceeded { .. }));
        assert_eq!(err.category(), meterchain_primitives::FailureCategory::Subjective);
    }

    #[test]
    fn test_past_deadline_expires_immediately() {
        let monitor = DeadlineMonitor::new().unwrap();
        monitor.start(Instant::now());
        assert!(monitor.expired());
    }

    #[test]
    fn test_expiry_sticks_until_rearmed() {
        let monitor = DeadlineMonitor::new().unwrap();
        monitor.start(Instant::now());
        monitor.stop();
        assert!(monitor.expired());
        monitor.start(Instant::now() + Duration::from_secs(60));
        assert!(!monitor.expired());
    }

    #[test]
    fn test_stop_disarms() {
        let monitor = DeadlineMonitor::new().unwrap();
        monitor.start(Instant::now() + Duration::from_millis(20));
        monitor.stop();
        std::thread::sleep(Duration::from_millis(60));
        assert!(!monitor.expired());
    }
}
