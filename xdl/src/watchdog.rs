// SPDX-License-Identifier: BSD-3-Clause
//! Per-module timeout supervisor.
//!
//! A watchdog observes one long-running operation: the operation feeds it at
//! every sign of progress, a background monitor compares elapsed time
//! against the configured limit at a coarse cadence, and a policy handler
//! decides whether a starved watchdog resets and carries on or aborts the
//! session. The watchdog never touches the transport itself; on abort it
//! trips the session's [`CancelToken`] and the in-flight transfer fails on
//! its own.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{Error, TransportError};
use crate::transport::CancelToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    Idle,
    Running,
    TimedOut,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogDecision {
    /// Re-arm the stopwatch and keep going
    Reset,
    /// Give up: trip the cancel token and stay timed out
    Abort,
}

#[derive(Debug, Clone)]
pub struct TimeoutEvent {
    pub module: String,
    pub elapsed: Duration,
    /// How many times this watchdog has starved, this one included
    pub timeout_count: u32,
}

pub type TimeoutHandler = Arc<dyn Fn(&TimeoutEvent) -> WatchdogDecision + Send + Sync>;

struct State {
    state: WatchdogState,
    armed_at: Instant,
    timeout_count: u32,
    aborted: bool,
}

struct Inner {
    module: String,
    timeout: Duration,
    poll: Duration,
    state: Mutex<State>,
    wake: Condvar,
    handler: TimeoutHandler,
    cancel: Option<CancelToken>,
}

/// The default policy: one starvation is forgiven, the second aborts.
pub fn default_handler() -> TimeoutHandler {
    Arc::new(|event: &TimeoutEvent| {
        if event.timeout_count < 2 {
            tracing::warn!(
                module = %event.module,
                elapsed = ?event.elapsed,
                "watchdog starved once, resetting"
            );
            WatchdogDecision::Reset
        } else {
            WatchdogDecision::Abort
        }
    })
}

pub struct Watchdog {
    inner: Arc<Inner>,
    monitor: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn new(module: impl Into<String>, timeout: Duration) -> Self {
        Self::with_policy(module, timeout, default_handler(), None)
    }

    /// Full-control constructor. `cancel` is tripped when the policy says
    /// abort, which is what actually unblocks a stuck transfer.
    pub fn with_policy(
        module: impl Into<String>,
        timeout: Duration,
        handler: TimeoutHandler,
        cancel: Option<CancelToken>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                module: module.into(),
                timeout,
                poll: Duration::from_secs(1),
                state: Mutex::new(State {
                    state: WatchdogState::Idle,
                    armed_at: Instant::now(),
                    timeout_count: 0,
                    aborted: false,
                }),
                wake: Condvar::new(),
                handler,
                cancel,
            }),
            monitor: None,
        }
    }

    #[cfg(test)]
    fn set_poll_interval(&mut self, poll: Duration) {
        // Only valid before start(); tests shorten the cadence.
        Arc::get_mut(&mut self.inner)
            .expect("watchdog already started")
            .poll = poll;
    }

    pub fn module(&self) -> &str {
        &self.inner.module
    }

    pub fn state(&self) -> WatchdogState {
        self.inner.state.lock().unwrap().state
    }

    pub fn timeout_count(&self) -> u32 {
        self.inner.state.lock().unwrap().timeout_count
    }

    /// Arm the watchdog and launch the monitor task.
    pub fn start(&mut self) {
        {
            let mut st = self.inner.state.lock().unwrap();
            if st.state == WatchdogState::Running {
                return;
            }
            st.state = WatchdogState::Running;
            st.armed_at = Instant::now();
            st.aborted = false;
        }
        if self.monitor.is_none() {
            let inner = Arc::clone(&self.inner);
            self.monitor = Some(std::thread::spawn(move || monitor_loop(&inner)));
        }
    }

    /// Progress notification; re-arms the stopwatch while running.
    pub fn feed(&self) {
        let mut st = self.inner.state.lock().unwrap();
        if st.state == WatchdogState::Running {
            st.armed_at = Instant::now();
        }
    }

    pub fn stop(&mut self) {
        {
            let mut st = self.inner.state.lock().unwrap();
            st.state = WatchdogState::Stopped;
        }
        self.inner.wake.notify_all();
        if let Some(handle) = self.monitor.take() {
            let _ = handle.join();
        }
    }

    /// Fail fast if the policy has already pulled the plug. Engines call
    /// this between protocol steps.
    pub fn check(&self) -> Result<(), Error> {
        let st = self.inner.state.lock().unwrap();
        if st.aborted {
            Err(TransportError::Timeout {
                phase: self.inner.module.clone(),
                elapsed: st.armed_at.elapsed(),
            }
            .into())
        } else {
            Ok(())
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

fn monitor_loop(inner: &Inner) {
    let mut st = inner.state.lock().unwrap();
    loop {
        match st.state {
            WatchdogState::Stopped => return,
            WatchdogState::Running if st.armed_at.elapsed() >= inner.timeout => {
                st.state = WatchdogState::TimedOut;
                st.timeout_count += 1;
                let event = TimeoutEvent {
                    module: inner.module.clone(),
                    elapsed: st.armed_at.elapsed(),
                    timeout_count: st.timeout_count,
                };

                // Never hold the lock across the user's policy code
                drop(st);
                let decision = (inner.handler)(&event);
                st = inner.state.lock().unwrap();

                match decision {
                    WatchdogDecision::Reset => {
                        if st.state == WatchdogState::TimedOut {
                            st.state = WatchdogState::Running;
                            st.armed_at = Instant::now();
                        }
                    }
                    WatchdogDecision::Abort => {
                        st.aborted = true;
                        if let Some(cancel) = &inner.cancel {
                            cancel.cancel();
                        }
                        tracing::error!(module = %inner.module, "watchdog abort");
                        return;
                    }
                }
            }
            _ => {}
        }
        let (next, _) = inner.wake.wait_timeout(st, inner.poll).unwrap();
        st = next;
    }
}

/// Scoped watchdog: armed on construction, stopped on drop.
pub struct WatchdogGuard {
    dog: Watchdog,
}

impl WatchdogGuard {
    pub fn new(module: impl Into<String>, timeout: Duration) -> Self {
        let mut dog = Watchdog::new(module, timeout);
        dog.start();
        Self { dog }
    }

    pub fn with_cancel(module: impl Into<String>, timeout: Duration, cancel: CancelToken) -> Self {
        let mut dog = Watchdog::with_policy(module, timeout, default_handler(), Some(cancel));
        dog.start();
        Self { dog }
    }
}

impl std::ops::Deref for WatchdogGuard {
    type Target = Watchdog;

    fn deref(&self) -> &Watchdog {
        &self.dog
    }
}

impl Drop for WatchdogGuard {
    fn drop(&mut self) {
        self.dog.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_watchdog(
        timeout_ms: u64,
        handler: TimeoutHandler,
        cancel: Option<CancelToken>,
    ) -> Watchdog {
        let mut dog = Watchdog::with_policy(
            "test",
            Duration::from_millis(timeout_ms),
            handler,
            cancel,
        );
        dog.set_poll_interval(Duration::from_millis(5));
        dog
    }

    #[test]
    fn feeding_keeps_it_running() {
        let mut dog = fast_watchdog(50, default_handler(), None);
        dog.start();
        for _ in 0..10 {
            std::thread::sleep(Duration::from_millis(10));
            dog.feed();
        }
        assert_eq!(dog.state(), WatchdogState::Running);
        assert_eq!(dog.timeout_count(), 0);
        dog.stop();
        assert_eq!(dog.state(), WatchdogState::Stopped);
    }

    #[test]
    fn default_policy_forgives_one_starvation() {
        let mut dog = fast_watchdog(20, default_handler(), None);
        dog.start();
        std::thread::sleep(Duration::from_millis(60));
        // First starvation resets; state is Running again
        assert!(dog.timeout_count() >= 1);
        assert!(dog.check().is_ok() || dog.timeout_count() >= 2);
        dog.stop();
    }

    #[test]
    fn second_starvation_aborts_and_trips_cancel() {
        let cancel = CancelToken::new();
        let mut dog = fast_watchdog(15, default_handler(), Some(cancel.clone()));
        dog.start();
        // Long enough for two starvations with no feeding
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(dog.state(), WatchdogState::TimedOut);
        assert!(cancel.is_cancelled());
        assert!(dog.check().is_err());
        dog.stop();
    }

    #[test]
    fn custom_handler_sees_the_event() {
        let hits = Arc::new(AtomicU32::new(0));
        let hits2 = Arc::clone(&hits);
        let handler: TimeoutHandler = Arc::new(move |event| {
            assert_eq!(event.module, "test");
            hits2.fetch_add(1, Ordering::SeqCst);
            WatchdogDecision::Abort
        });
        let mut dog = fast_watchdog(10, handler, None);
        dog.start();
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        dog.stop();
    }

    #[test]
    fn guard_stops_on_drop() {
        let cancel = CancelToken::new();
        {
            let guard =
                WatchdogGuard::with_cancel("scoped", Duration::from_secs(60), cancel.clone());
            assert_eq!(guard.state(), WatchdogState::Running);
        }
        // A clean stop must not abort anything
        assert!(!cancel.is_cancelled());
    }
}
