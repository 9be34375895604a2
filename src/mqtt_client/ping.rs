// SPDX-License-Identifier: MPL-2.0

//! Keep-alive scheduling
//!
//! The engine decides whether a PINGREQ is due; a [`PingSender`] only decides
//! when to ask. Each call of `check_for_activity` reschedules the sender with
//! the delay until the next decision point.

use crate::mqtt_client::token::Token;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Engine side of the keep-alive protocol.
pub(crate) trait ActivityCheck: Send + Sync {
    fn check_for_activity(&self) -> Option<Token>;

    fn keep_alive(&self) -> Duration;

    fn client_id(&self) -> String;
}

/// Weak handle from a [`PingSender`] back into its engine.
#[derive(Clone)]
pub struct CommsHandle {
    target: Weak<dyn ActivityCheck>,
}

impl CommsHandle {
    pub(crate) fn new(target: Weak<dyn ActivityCheck>) -> Self {
        CommsHandle { target }
    }

    /// Runs the engine's keep-alive check. `None` once the engine is gone or
    /// when no PINGREQ was sent.
    pub fn check_for_activity(&self) -> Option<Token> {
        self.target.upgrade()?.check_for_activity()
    }

    pub fn keep_alive(&self) -> Duration {
        self.target
            .upgrade()
            .map(|t| t.keep_alive())
            .unwrap_or_default()
    }

    pub fn client_id(&self) -> String {
        self.target
            .upgrade()
            .map(|t| t.client_id())
            .unwrap_or_default()
    }

    pub fn is_alive(&self) -> bool {
        self.target.strong_count() > 0
    }
}

impl fmt::Debug for CommsHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommsHandle")
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Calls [`CommsHandle::check_for_activity`] no later than the scheduled
/// delay, repeatedly, between `start` and `stop`.
pub trait PingSender: Send {
    fn init(&mut self, comms: CommsHandle);

    fn start(&mut self);

    fn stop(&mut self);

    fn schedule(&mut self, delay: Duration);
}

/// [`PingSender`] on tokio timers.
///
/// Only the most recently scheduled timer fires; older ones see a stale
/// generation and exit.
#[derive(Debug, Default)]
pub struct TimerPingSender {
    comms: Option<CommsHandle>,
    cancel: Option<CancellationToken>,
    generation: Arc<AtomicU64>,
}

impl TimerPingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.cancel.is_some()
    }
}

impl PingSender for TimerPingSender {
    fn init(&mut self, comms: CommsHandle) {
        self.comms = Some(comms);
    }

    fn start(&mut self) {
        let Some(comms) = &self.comms else {
            warn!("PingSender started before init");
            return;
        };
        if let Some(old) = self.cancel.take() {
            old.cancel();
        }
        debug!("Ping sender started for {}", comms.client_id());
        let keep_alive = comms.keep_alive();
        self.cancel = Some(CancellationToken::new());
        self.schedule(keep_alive);
    }

    fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
            debug!("Ping sender stopped");
        }
    }

    fn schedule(&mut self, delay: Duration) {
        let (Some(comms), Some(cancel)) = (self.comms.clone(), self.cancel.clone()) else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime, keep-alive check not scheduled");
            return;
        };
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let current = self.generation.clone();
        trace!("Next activity check in {:?}", delay);
        runtime.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if current.load(Ordering::Acquire) == generation {
                        comms.check_for_activity();
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeEngine {
        pinger: Mutex<Option<Box<dyn PingSender>>>,
        checks: Mutex<Vec<tokio::time::Instant>>,
    }

    impl ActivityCheck for FakeEngine {
        fn check_for_activity(&self) -> Option<Token> {
            self.checks.lock().unwrap().push(tokio::time::Instant::now());
            if let Some(pinger) = self.pinger.lock().unwrap().as_mut() {
                pinger.schedule(Duration::from_secs(2));
            }
            None
        }

        fn keep_alive(&self) -> Duration {
            Duration::from_secs(2)
        }

        fn client_id(&self) -> String {
            "fake".to_string()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_checks_repeat_until_stopped() {
        let engine = Arc::new(FakeEngine {
            pinger: Mutex::new(None),
            checks: Mutex::new(Vec::new()),
        });
        let weak: Weak<dyn ActivityCheck> = Arc::downgrade(&engine) as Weak<dyn ActivityCheck>;
        let mut sender = TimerPingSender::new();
        sender.init(CommsHandle::new(weak));
        sender.start();
        assert!(sender.is_running());
        *engine.pinger.lock().unwrap() = Some(Box::new(sender));

        let begin = tokio::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(6500)).await;
        let checks = engine.checks.lock().unwrap().clone();
        assert_eq!(checks.len(), 3);
        assert_eq!(checks[0] - begin, Duration::from_secs(2));

        if let Some(pinger) = engine.pinger.lock().unwrap().as_mut() {
            pinger.stop();
        }
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(engine.checks.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_supersedes_pending_timer() {
        let engine = Arc::new(FakeEngine {
            pinger: Mutex::new(None),
            checks: Mutex::new(Vec::new()),
        });
        let weak: Weak<dyn ActivityCheck> = Arc::downgrade(&engine) as Weak<dyn ActivityCheck>;
        let mut sender = TimerPingSender::new();
        sender.init(CommsHandle::new(weak));
        sender.start();
        sender.schedule(Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(engine.checks.lock().unwrap().is_empty());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(engine.checks.lock().unwrap().len(), 1);
        sender.stop();
    }
}
