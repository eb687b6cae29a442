use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogStatus {
    Stopped,
    Ticking,
    Alerted,
}

#[derive(Debug, Clone, Copy)]
struct State {
    status: WatchdogStatus,
    deadline: Option<Instant>,
}

/// Raises an alert when [`Watchdog::tick`] has not been called for `timeout`.
///
/// Clones share the same timer, so one task can tick while another awaits
/// [`Watchdog::alerted`].
#[derive(Clone)]
pub struct Watchdog {
    timeout: Duration,
    state: Arc<watch::Sender<State>>,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        let (state, _) = watch::channel(State {
            status: WatchdogStatus::Stopped,
            deadline: None,
        });
        Self {
            timeout,
            state: Arc::new(state),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn status(&self) -> WatchdogStatus {
        self.state.borrow().status
    }

    /// Restarts the countdown, clearing a previous alert.
    pub fn tick(&self) {
        let deadline = Instant::now() + self.timeout;
        self.state.send_replace(State {
            status: WatchdogStatus::Ticking,
            deadline: Some(deadline),
        });
    }

    pub fn stop(&self) {
        self.state.send_replace(State {
            status: WatchdogStatus::Stopped,
            deadline: None,
        });
    }

    /// Resolves once the watchdog is in the alerted state. Stays pending
    /// while stopped.
    pub async fn alerted(&self) {
        let mut rx = self.state.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            match (current.status, current.deadline) {
                (WatchdogStatus::Alerted, _) => return,
                (WatchdogStatus::Ticking, Some(deadline)) => {
                    tokio::select! {
                        _ = sleep_until(deadline) => {
                            self.state.send_if_modified(|state| {
                                let expired = state.status == WatchdogStatus::Ticking
                                    && state.deadline == Some(deadline);
                                if expired {
                                    state.status = WatchdogStatus::Alerted;
                                    state.deadline = None;
                                }
                                expired
                            });
                        }
                        changed = rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                    }
                }
                _ => {
                    if rx.changed().await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_alerts_after_silence() {
        let dog = Watchdog::new(Duration::from_millis(50));
        dog.tick();
        timeout(Duration::from_secs(2), dog.alerted()).await.unwrap();
        assert_eq!(dog.status(), WatchdogStatus::Alerted);
    }

    #[tokio::test]
    async fn test_ticks_postpone_the_alert() {
        let dog = Watchdog::new(Duration::from_millis(150));
        dog.tick();
        let ticker = {
            let dog = dog.clone();
            tokio::spawn(async move {
                for _ in 0..5 {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    dog.tick();
                }
            })
        };
        let started = Instant::now();
        timeout(Duration::from_secs(3), dog.alerted()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(250));
        ticker.await.unwrap();
    }

    #[tokio::test]
    async fn test_stopped_watchdog_never_alerts() {
        let dog = Watchdog::new(Duration::from_millis(20));
        dog.tick();
        dog.stop();
        assert!(timeout(Duration::from_millis(100), dog.alerted()).await.is_err());
        assert_eq!(dog.status(), WatchdogStatus::Stopped);
    }
}
