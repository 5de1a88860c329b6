//! Client-side reconnection with a single in-flight attempt per link.
//!
//! Every failure report carries the generation of the channel it was observed
//! on. The first report for the current generation takes the link's
//! reconnection ticket and runs the rebuild loop; reports that arrive while
//! the ticket is held wait for its outcome instead of starting a second
//! attempt, and reports for an older generation are ignored.
//!
//! The rebuild loop retries forever with a fixed delay (plus optional
//! jitter). Only teardown stops it.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;

use crate::link::{Link, TicketClaim};
use crate::liveness::wait_closed;
use crate::message::WireMessage;
use crate::transport::Connector;

/// Reachability change reported to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerStatus {
    /// The channel broke. Sent once per failure episode.
    Disconnected,
    /// A new channel is installed.
    Reconnected,
}

/// Receives [`PeerStatus`] changes.
pub trait StatusListener: Send + Sync + 'static {
    /// Called from the reconnection task; must not block.
    fn on_status(&self, status: PeerStatus);
}

impl<F> StatusListener for F
where
    F: Fn(PeerStatus) + Send + Sync + 'static,
{
    fn on_status(&self, status: PeerStatus) {
        self(status)
    }
}

/// How a call to [`ReconnectionManager::on_failure_detected`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// This call rebuilt the channel.
    Reconnected {
        /// Generation of the new channel.
        generation: u64,
        /// Connection attempts made, the successful one included.
        attempts: u32,
    },
    /// Another call was already rebuilding; this one waited for it.
    Joined,
    /// The reported generation had already been replaced.
    Stale,
    /// The link was torn down.
    Abandoned,
}

/// Delay between rebuild attempts.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    delay: Duration,
    jitter: f64,
    attempts: u32,
}

impl RetrySchedule {
    /// Fixed `delay`, stretched by up to `jitter` (a fraction) at random.
    pub fn new(delay: Duration, jitter: f64) -> Self {
        Self {
            delay,
            jitter: jitter.clamp(0.0, 1.0),
            attempts: 0,
        }
    }

    /// Record a failed attempt and return how long to wait before the next.
    pub fn next_delay(&mut self) -> Duration {
        self.attempts += 1;
        if self.jitter > 0.0 {
            let factor = rand::rng().random_range(1.0..=(1.0 + self.jitter));
            self.delay.mul_f64(factor)
        } else {
            self.delay
        }
    }

    /// Failed attempts recorded so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Rebuilds the channel of one client link.
pub struct ReconnectionManager<Out> {
    link: Arc<Link<Out>>,
    connector: Arc<dyn Connector>,
    listener: Arc<dyn StatusListener>,
    rejoin: Mutex<Option<Out>>,
}

impl<Out: WireMessage> ReconnectionManager<Out> {
    pub(crate) fn new(
        link: Arc<Link<Out>>,
        connector: Arc<dyn Connector>,
        listener: Arc<dyn StatusListener>,
    ) -> Self {
        Self {
            link,
            connector,
            listener,
            rejoin: Mutex::new(None),
        }
    }

    /// Frame written first on every rebuilt channel, ahead of anything
    /// queued. `None` stops sending one.
    pub fn set_rejoin(&self, frame: Option<Out>) {
        *self.rejoin.lock().unwrap_or_else(PoisonError::into_inner) = frame;
    }

    fn rejoin(&self) -> Option<Out> {
        self.rejoin
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Handle a failure seen on the channel of generation `observed`.
    ///
    /// Returns once the link has a working channel again, or was torn down.
    pub async fn on_failure_detected(&self, observed: u64) -> ReconnectOutcome {
        match self.link.claim_ticket(observed) {
            TicketClaim::Closed => return ReconnectOutcome::Abandoned,
            TicketClaim::Stale => return ReconnectOutcome::Stale,
            TicketClaim::InFlight(generations) => return self.join(generations).await,
            TicketClaim::Acquired => {}
        }

        let link_id = self.link.id();
        tracing::info!(
            "Link {link_id} lost its channel, reconnecting to {}",
            self.connector.describe()
        );
        self.listener.on_status(PeerStatus::Disconnected);
        self.link.drop_channel().await;

        let config = self.link.config();
        let mut schedule = RetrySchedule::new(config.retry_delay, config.retry_jitter);
        let mut closed = self.link.subscribe_closed();

        loop {
            let attempt = tokio::select! {
                biased;
                _ = wait_closed(&mut closed) => return ReconnectOutcome::Abandoned,
                attempt = self.connector.connect() => attempt,
            };

            match attempt {
                Ok(channel) => {
                    let rejoin = self.rejoin();
                    let installed = self
                        .link
                        .install_with_greeting(channel, rejoin.as_ref())
                        .await;
                    let Some(generation) = installed else {
                        return ReconnectOutcome::Abandoned;
                    };
                    let attempts = schedule.attempts() + 1;
                    tracing::info!(
                        "Link {link_id} reconnected (generation {generation}, {attempts} attempts)"
                    );
                    self.listener.on_status(PeerStatus::Reconnected);
                    return ReconnectOutcome::Reconnected {
                        generation,
                        attempts,
                    };
                }
                Err(e) => {
                    let delay = schedule.next_delay();
                    tracing::debug!(
                        "Reconnection attempt {} for link {link_id} failed: {e}; \
                         retrying in {delay:?}",
                        schedule.attempts()
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = wait_closed(&mut closed) => return ReconnectOutcome::Abandoned,
                    }
                }
            }
        }
    }

    async fn join(&self, mut generations: watch::Receiver<u64>) -> ReconnectOutcome {
        let mut closed = self.link.subscribe_closed();
        tokio::select! {
            changed = generations.changed() => match changed {
                Ok(()) => ReconnectOutcome::Joined,
                Err(_) => ReconnectOutcome::Abandoned,
            },
            _ = wait_closed(&mut closed) => ReconnectOutcome::Abandoned,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::test_support::*;
    use crate::liveness::LivenessState;
    use crate::framing::FrameConfig;
    use crate::local;
    use crate::message::Downstream;
    use crate::transport::Channel;

    fn recording_listener() -> (Arc<Mutex<Vec<PeerStatus>>>, Arc<dyn StatusListener>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener: Arc<dyn StatusListener> =
            Arc::new(move |status: PeerStatus| sink.lock().unwrap().push(status));
        (seen, listener)
    }

    #[test]
    fn test_fixed_schedule_without_jitter() {
        let mut schedule = RetrySchedule::new(Duration::from_millis(100), 0.0);
        for _ in 0..5 {
            assert_eq!(schedule.next_delay(), Duration::from_millis(100));
        }
        assert_eq!(schedule.attempts(), 5);
    }

    #[test]
    fn test_jitter_only_stretches_delay() {
        let mut schedule = RetrySchedule::new(Duration::from_millis(100), 0.5);
        for _ in 0..50 {
            let delay = schedule.next_delay();
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn test_retries_until_connector_accepts() {
        let supervisor = Arc::new(RecordingSupervisor::default());
        let (link, _readers, _far) = local_link(&supervisor);
        let (connector, mut acceptor) = local::listener();
        connector.refuse_next(2);
        let (seen, listener) = recording_listener();

        let manager = ReconnectionManager::new(
            Arc::clone(&link),
            Arc::new(connector.clone()),
            listener,
        );
        let outcome = manager.on_failure_detected(0).await;

        assert_eq!(
            outcome,
            ReconnectOutcome::Reconnected {
                generation: 1,
                attempts: 3
            }
        );
        assert_eq!(connector.attempts(), 3);
        assert!(acceptor.accept().await.is_some());
        assert_eq!(link.liveness(), LivenessState::Alive);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![PeerStatus::Disconnected, PeerStatus::Reconnected]
        );
    }

    #[tokio::test]
    async fn test_rejoin_frame_opens_every_rebuilt_channel() {
        let supervisor = Arc::new(RecordingSupervisor::default());
        let (link, _readers, _far) = local_link(&supervisor);
        let (connector, mut acceptor) = local::listener();
        let (_seen, listener) = recording_listener();
        let manager =
            ReconnectionManager::new(Arc::clone(&link), Arc::new(connector.clone()), listener);

        let rejoin = Downstream::Notice("seat 3".to_string());
        manager.set_rejoin(Some(rejoin.clone()));
        manager.on_failure_detected(0).await;
        let far = acceptor.accept().await.unwrap();
        let (mut far_rx, _far_tx) = Channel::Local(far).split(FrameConfig::default());
        assert_eq!(received(&mut far_rx).await, rejoin);

        manager.set_rejoin(None);
        manager.on_failure_detected(1).await;
        let far = acceptor.accept().await.unwrap();
        let (mut far_rx, _far_tx) = Channel::Local(far).split(FrameConfig::default());
        link.hand_off(&Downstream::Notice("plain".to_string()))
            .await
            .unwrap();
        assert_eq!(
            received(&mut far_rx).await,
            Downstream::Notice("plain".to_string())
        );
    }

    #[tokio::test]
    async fn test_concurrent_failures_start_one_rebuild() {
        let supervisor = Arc::new(RecordingSupervisor::default());
        let (link, _readers, _far) = local_link(&supervisor);
        let (connector, _acceptor) = local::listener();
        connector.refuse_next(3);
        let (seen, listener) = recording_listener();

        let manager = Arc::new(ReconnectionManager::new(
            Arc::clone(&link),
            Arc::new(connector.clone()),
            listener,
        ));
        let first = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.on_failure_detected(0).await }
        });
        let second = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.on_failure_detected(0).await }
        });

        let mut outcomes = vec![first.await.unwrap(), second.await.unwrap()];
        outcomes.sort_by_key(|o| matches!(o, ReconnectOutcome::Joined));

        assert!(matches!(
            outcomes[0],
            ReconnectOutcome::Reconnected { generation: 1, .. }
        ));
        assert_eq!(outcomes[1], ReconnectOutcome::Joined);
        // One rebuild: three refusals plus the successful attempt.
        assert_eq!(connector.attempts(), 4);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![PeerStatus::Disconnected, PeerStatus::Reconnected]
        );
    }

    #[tokio::test]
    async fn test_stale_report_is_ignored() {
        let supervisor = Arc::new(RecordingSupervisor::default());
        let (link, _readers, _far) = local_link(&supervisor);
        let (connector, _acceptor) = local::listener();
        let (_seen, listener) = recording_listener();
        let manager =
            ReconnectionManager::new(Arc::clone(&link), Arc::new(connector.clone()), listener);

        manager.on_failure_detected(0).await;
        assert_eq!(manager.on_failure_detected(0).await, ReconnectOutcome::Stale);
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_abandons_rebuild() {
        let supervisor = Arc::new(RecordingSupervisor::default());
        let (link, _readers, _far) = local_link(&supervisor);
        let (connector, acceptor) = local::listener();
        drop(acceptor);
        let (_seen, listener) = recording_listener();
        let manager = Arc::new(ReconnectionManager::new(
            Arc::clone(&link),
            Arc::new(connector.clone()),
            listener,
        ));

        let rebuild = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.on_failure_detected(0).await }
        });
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(connector.attempts() > 1);

        link.begin_teardown();
        link.mark_closed();
        assert_eq!(rebuild.await.unwrap(), ReconnectOutcome::Abandoned);
    }
}
