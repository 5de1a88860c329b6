//! Heartbeat bookkeeping: the miss-counter state machine and its timer task.
//!
//! Each tick takes one life away from the counter. Any inbound frame gives
//! them all back. When the counter hits zero the peer is declared dead and
//! stays dead until a reconnection revives it.

use std::ops::ControlFlow;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Health of a link as seen by its liveness monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LivenessState {
    /// Counter at its maximum.
    Alive,
    /// At least one tick went by without traffic.
    Suspect,
    /// Counter exhausted. Only a reconnection leaves this state.
    Dead,
}

/// What the owner of a counter should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickVerdict {
    /// Still alive. Probe the peer.
    Probe,
    /// This tick exhausted the counter.
    Expired,
    /// Already dead; nothing to do.
    Idle,
}

/// Decrementing miss-counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissCounter {
    max: u32,
    remaining: u32,
    state: LivenessState,
}

impl MissCounter {
    /// A fresh, alive counter. `max` is clamped to at least one.
    pub fn new(max: u32) -> Self {
        let max = max.max(1);
        Self {
            max,
            remaining: max,
            state: LivenessState::Alive,
        }
    }

    /// Account for one timer period without confirmed traffic.
    pub fn tick(&mut self) -> TickVerdict {
        if self.state == LivenessState::Dead {
            return TickVerdict::Idle;
        }

        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            self.state = LivenessState::Dead;
            TickVerdict::Expired
        } else {
            self.state = LivenessState::Suspect;
            TickVerdict::Probe
        }
    }

    /// Inbound traffic seen. Returns `false` if the counter is dead and was
    /// left untouched.
    pub fn reset(&mut self) -> bool {
        if self.state == LivenessState::Dead {
            return false;
        }
        self.remaining = self.max;
        self.state = LivenessState::Alive;
        true
    }

    /// Force the dead state.
    pub fn kill(&mut self) {
        self.remaining = 0;
        self.state = LivenessState::Dead;
    }

    /// Back to full health after a new channel was installed.
    pub fn revive(&mut self) {
        self.remaining = self.max;
        self.state = LivenessState::Alive;
    }

    /// Current state.
    pub fn state(&self) -> LivenessState {
        self.state
    }

    /// Ticks left before expiry.
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Configured maximum.
    pub fn max(&self) -> u32 {
        self.max
    }
}

/// Wait until a closed flag becomes `true` (or its sender goes away).
pub(crate) async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Spawn a timer calling `on_tick` every `period`, first after one full
/// period. Stops when `on_tick` breaks or `closed` turns `true`.
pub(crate) fn spawn_monitor<F>(
    period: Duration,
    mut closed: watch::Receiver<bool>,
    mut on_tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> ControlFlow<()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if on_tick().is_break() {
                        break;
                    }
                }
                _ = wait_closed(&mut closed) => break,
            }
        }
        tracing::trace!("Liveness monitor stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_dead_after_exactly_max_ticks() {
        let mut counter = MissCounter::new(3);
        assert_eq!(counter.tick(), TickVerdict::Probe);
        assert_eq!(counter.tick(), TickVerdict::Probe);
        assert_eq!(counter.state(), LivenessState::Suspect);
        assert_eq!(counter.tick(), TickVerdict::Expired);
        assert_eq!(counter.state(), LivenessState::Dead);
        assert_eq!(counter.tick(), TickVerdict::Idle);
    }

    #[test]
    fn test_reset_never_exceeds_max() {
        let mut counter = MissCounter::new(3);
        for _ in 0..10 {
            assert!(counter.reset());
            assert_eq!(counter.remaining(), 3);
        }
        assert_eq!(counter.state(), LivenessState::Alive);
    }

    #[test]
    fn test_reset_returns_suspect_to_alive() {
        let mut counter = MissCounter::new(3);
        counter.tick();
        counter.tick();
        assert_eq!(counter.remaining(), 1);

        counter.reset();
        assert_eq!(counter.state(), LivenessState::Alive);
        assert_eq!(counter.remaining(), 3);
    }

    #[test]
    fn test_reset_ignored_once_dead() {
        let mut counter = MissCounter::new(1);
        assert_eq!(counter.tick(), TickVerdict::Expired);
        assert!(!counter.reset());
        assert_eq!(counter.state(), LivenessState::Dead);
        assert_eq!(counter.remaining(), 0);
    }

    #[test]
    fn test_revive_after_kill() {
        let mut counter = MissCounter::new(3);
        counter.kill();
        assert_eq!(counter.tick(), TickVerdict::Idle);
        counter.revive();
        assert_eq!(counter.state(), LivenessState::Alive);
        assert_eq!(counter.remaining(), 3);
    }

    #[test]
    fn test_zero_max_is_clamped() {
        let mut counter = MissCounter::new(0);
        assert_eq!(counter.max(), 1);
        assert_eq!(counter.tick(), TickVerdict::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_first_tick_after_one_period() {
        let ticks = Arc::new(AtomicU32::new(0));
        let (_closed_tx, closed_rx) = watch::channel(false);
        let counted = Arc::clone(&ticks);
        let _monitor = spawn_monitor(Duration::from_millis(5000), closed_rx, move || {
            counted.fetch_add(1, Ordering::SeqCst);
            ControlFlow::Continue(())
        });

        tokio::time::sleep(Duration::from_millis(4990)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(10_020)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_stops_when_closed() {
        let ticks = Arc::new(AtomicU32::new(0));
        let (closed_tx, closed_rx) = watch::channel(false);
        let counted = Arc::clone(&ticks);
        let monitor = spawn_monitor(Duration::from_millis(100), closed_rx, move || {
            counted.fetch_add(1, Ordering::SeqCst);
            ControlFlow::Continue(())
        });

        tokio::time::sleep(Duration::from_millis(250)).await;
        closed_tx.send_replace(true);
        monitor.await.unwrap();
        let seen = ticks.load(Ordering::SeqCst);
        assert_eq!(seen, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_stops_on_break() {
        let (_closed_tx, closed_rx) = watch::channel(false);
        let monitor = spawn_monitor(Duration::from_millis(100), closed_rx, || {
            ControlFlow::Break(())
        });
        monitor.await.unwrap();
    }
}
