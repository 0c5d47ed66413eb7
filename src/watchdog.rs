//! Inactivity watchdog.
//!
//! A [`Watchdog`] runs a one-shot alarm on the tokio timer. Every call to
//! [`Watchdog::reset`] cancels the pending alarm and schedules a fresh one, so
//! the handler only runs when no liveness event arrives for a full timeout.
//!
//! Each alarm carries a generation number. An alarm only fires if its
//! generation is still current when it takes the state lock, which keeps a
//! reset racing an alarm that has already woken from producing two firings.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    Idle,
    Running,
    Expired,
    Stopped,
}

/// Diagnostic payload delivered when the watchdog fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no bus traffic for {elapsed:?} (timeout {timeout:?})")]
pub struct WatchdogExpired {
    pub timeout: Duration,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WatchdogError {
    #[error("watchdog timeout must be greater than zero")]
    InvalidTimeout,
    #[error("watchdog requires a running tokio runtime")]
    NoRuntime,
    #[error("watchdog has been stopped")]
    Stopped,
}

pub type ExpiryHandler = Arc<dyn Fn(&WatchdogExpired) + Send + Sync>;

/// Receiving end of the default fault channel.
pub type FaultReceiver = mpsc::UnboundedReceiver<WatchdogExpired>;

struct Alarm {
    state: WatchdogState,
    generation: u64,
    armed_at: Instant,
    pending: Option<JoinHandle<()>>,
}

struct Shared {
    timeout: Duration,
    handler: ExpiryHandler,
    alarm: Mutex<Alarm>,
    expirations: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Alarm> {
        // The handler never runs under the lock, so poisoning can only come
        // from a panic in this module; the state is still consistent.
        self.alarm.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

pub struct Watchdog {
    shared: Arc<Shared>,
    runtime: Handle,
}

impl core::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Watchdog")
            .field("timeout", &self.shared.timeout)
            .field("state", &self.state())
            .finish()
    }
}

impl Watchdog {
    /// Create an idle watchdog. Must be called from within a tokio runtime.
    pub fn new<F>(timeout: Duration, on_expire: F) -> Result<Self, WatchdogError>
    where
        F: Fn(&WatchdogExpired) + Send + Sync + 'static,
    {
        if timeout.is_zero() {
            return Err(WatchdogError::InvalidTimeout);
        }
        let runtime = Handle::try_current().map_err(|_| WatchdogError::NoRuntime)?;

        Ok(Self {
            shared: Arc::new(Shared {
                timeout,
                handler: Arc::new(on_expire),
                alarm: Mutex::new(Alarm {
                    state: WatchdogState::Idle,
                    generation: 0,
                    armed_at: Instant::now(),
                    pending: None,
                }),
                expirations: AtomicU64::new(0),
            }),
            runtime,
        })
    }

    /// Create and start a watchdog in one step.
    pub fn spawn<F>(timeout: Duration, on_expire: F) -> Result<Self, WatchdogError>
    where
        F: Fn(&WatchdogExpired) + Send + Sync + 'static,
    {
        let watchdog = Self::new(timeout, on_expire)?;
        watchdog.start()?;
        Ok(watchdog)
    }

    /// Started watchdog whose expiry is reported on a channel, for callers
    /// that treat loss of traffic as a fault of the whole process.
    pub fn with_fault_channel(timeout: Duration) -> Result<(Self, FaultReceiver), WatchdogError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watchdog = Self::spawn(timeout, move |expired: &WatchdogExpired| {
            if tx.send(*expired).is_err() {
                warn!("Watchdog fault receiver dropped: {}", expired);
            }
        })?;
        Ok((watchdog, rx))
    }

    pub fn timeout(&self) -> Duration {
        self.shared.timeout
    }

    pub fn state(&self) -> WatchdogState {
        self.shared.lock().state
    }

    /// Number of times the handler has been invoked.
    pub fn expirations(&self) -> u64 {
        self.shared.expirations.load(Ordering::SeqCst)
    }

    /// Begin (or, after an expiry, restart) the countdown.
    pub fn start(&self) -> Result<(), WatchdogError> {
        let mut alarm = self.shared.lock();
        if alarm.state == WatchdogState::Stopped {
            return Err(WatchdogError::Stopped);
        }
        self.rearm(&mut alarm);
        alarm.state = WatchdogState::Running;
        debug!("Watchdog started with timeout {:?}", self.shared.timeout);
        Ok(())
    }

    /// Record a liveness event. No effect unless the watchdog is running.
    pub fn reset(&self) {
        let mut alarm = self.shared.lock();
        if alarm.state == WatchdogState::Running {
            self.rearm(&mut alarm);
        }
    }

    /// Cancel the pending alarm for good. Safe to call in any state.
    pub fn stop(&self) {
        let mut alarm = self.shared.lock();
        if let Some(pending) = alarm.pending.take() {
            pending.abort();
        }
        alarm.generation = alarm.generation.wrapping_add(1);
        if alarm.state != WatchdogState::Stopped {
            debug!("Watchdog stopped in state {:?}", alarm.state);
        }
        alarm.state = WatchdogState::Stopped;
    }

    // Caller holds the lock; the old alarm is cancelled before the new one
    // is scheduled.
    fn rearm(&self, alarm: &mut Alarm) {
        if let Some(pending) = alarm.pending.take() {
            pending.abort();
        }
        alarm.generation = alarm.generation.wrapping_add(1);
        alarm.armed_at = Instant::now();

        let generation = alarm.generation;
        let deadline = alarm.armed_at + self.shared.timeout;
        let shared = Arc::clone(&self.shared);
        alarm.pending = Some(self.runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            fire(&shared, generation);
        }));
    }
}

fn fire(shared: &Shared, generation: u64) {
    let expired = {
        let mut alarm = shared.lock();
        if alarm.generation != generation || alarm.state != WatchdogState::Running {
            return;
        }
        alarm.state = WatchdogState::Expired;
        alarm.pending = None;
        WatchdogExpired {
            timeout: shared.timeout,
            elapsed: alarm.armed_at.elapsed(),
        }
    };

    shared.expirations.fetch_add(1, Ordering::SeqCst);
    warn!("Watchdog expired: {}", expired);
    (shared.handler)(&expired);
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Anything that wants to hear about bus traffic.
pub trait TrafficListener {
    fn on_traffic(&self);
}

impl TrafficListener for Watchdog {
    fn on_traffic(&self) {
        self.reset();
    }
}

impl<T: TrafficListener + ?Sized> TrafficListener for Arc<T> {
    fn on_traffic(&self) {
        (**self).on_traffic();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_runtime() {
        let err = Watchdog::new(Duration::from_secs(1), |_: &WatchdogExpired| {}).unwrap_err();
        assert_eq!(err, WatchdogError::NoRuntime);
    }

    #[tokio::test]
    async fn test_rejects_zero_timeout() {
        let err = Watchdog::new(Duration::ZERO, |_: &WatchdogExpired| {}).unwrap_err();
        assert_eq!(err, WatchdogError::InvalidTimeout);
    }

    #[tokio::test]
    async fn test_new_watchdog_is_idle() {
        let watchdog = Watchdog::new(Duration::from_secs(1), |_: &WatchdogExpired| {}).unwrap();
        assert_eq!(watchdog.state(), WatchdogState::Idle);
        watchdog.reset();
        assert_eq!(watchdog.state(), WatchdogState::Idle);
    }

    #[tokio::test]
    async fn test_start_after_stop_fails() {
        let watchdog = Watchdog::spawn(Duration::from_secs(1), |_: &WatchdogExpired| {}).unwrap();
        watchdog.stop();
        assert_eq!(watchdog.start(), Err(WatchdogError::Stopped));
    }
}
