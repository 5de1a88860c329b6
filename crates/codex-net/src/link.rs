//! The logical link to one peer.
//!
//! A [`Link`] outlives the physical [`Channel`]s behind it. It owns the
//! current channel writer, the liveness counter and a generation number that
//! is bumped every time a new channel is installed. Generation changes and
//! teardown are broadcast over `watch` channels so that waiting tasks (the
//! delivery loop, blocked reconnection callers) wake without polling.
//!
//! Two locks guard a link and they are always taken in this order:
//! 1. `writer`, an async mutex held for the duration of a frame write;
//! 2. `state`, a std mutex never held across an `.await`.
//!
//! Failures are not handled here. They are reported to the link's
//! [`Supervisor`], which reconnects on the client and tears down on the
//! server.

use std::fmt;
use std::marker::PhantomData;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::framing::{FrameConfig, FrameError};
use crate::liveness::{LivenessState, MissCounter, TickVerdict, wait_closed};
use crate::message::{WireMessage, encode};
use crate::transport::{Channel, ChannelReader, ChannelWriter};

/// Unique identifier for a link within one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Atomic generator for monotonically increasing [`ConnectionId`]s.
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique [`ConnectionId`].
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Who is on the other end of a link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Identity {
    /// Not known yet.
    #[default]
    Anonymous,
    /// Player nickname.
    Nickname(String),
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => f.write_str("Unknown"),
            Self::Nickname(name) => f.write_str(name),
        }
    }
}

/// Timing and framing parameters of a link.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkConfig {
    /// Liveness tick period. Default: 5 s.
    pub ping_interval: Duration,
    /// Ticks without traffic before the peer is declared dead. Default: 3.
    pub max_missed_pings: u32,
    /// Upper bound on a single blocking read. Default: 100 ms.
    pub read_timeout: Duration,
    /// Upper bound on writing one frame. Default: 5 s.
    pub write_timeout: Duration,
    /// Pause between reconnection attempts. Default: 100 ms.
    pub retry_delay: Duration,
    /// Random extra delay, as a fraction of `retry_delay`. Default: 0.
    pub retry_jitter: f64,
    /// Frame size limits.
    pub frame: FrameConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_millis(5000),
            max_missed_pings: 3,
            read_timeout: Duration::from_millis(100),
            write_timeout: Duration::from_millis(5000),
            retry_delay: Duration::from_millis(100),
            retry_jitter: 0.0,
            frame: FrameConfig::default(),
        }
    }
}

/// Errors returned by [`Link::hand_off`].
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The link was torn down.
    #[error("link is closed")]
    Closed,

    /// No usable channel right now (dead or being rebuilt).
    #[error("no usable channel (generation {generation})")]
    Down {
        /// Generation that was current when the hand-off was refused.
        generation: u64,
    },

    /// Writing to the channel failed.
    #[error("write failed on generation {generation}: {source}")]
    Io {
        /// Generation of the channel that failed.
        generation: u64,
        /// Underlying framing error.
        #[source]
        source: FrameError,
    },

    /// The peer stopped draining the channel. The channel has been dropped
    /// and reported.
    #[error("write timed out on generation {generation}")]
    WriteTimeout {
        /// Generation of the dropped channel.
        generation: u64,
    },

    /// The message could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(#[from] postcard::Error),
}

/// Receives failure reports from a link.
pub(crate) trait Supervisor: Send + Sync + 'static {
    /// The channel of `generation` is believed broken.
    fn channel_failed(self: Arc<Self>, generation: u64);
}

/// Outcome of trying to take the reconnection ticket.
pub(crate) enum TicketClaim {
    /// The caller now owns the single in-flight reconnection.
    Acquired,
    /// Another attempt is running; wait on the receiver for its outcome.
    InFlight(watch::Receiver<u64>),
    /// The reported generation is already gone.
    Stale,
    /// The link was torn down.
    Closed,
}

/// A channel reader tagged with the generation it belongs to.
pub(crate) struct InstalledReader {
    pub(crate) generation: u64,
    pub(crate) reader: ChannelReader,
}

/// What the read loop hands to its owner.
pub(crate) enum Inbound {
    /// A complete frame. Liveness has already been refreshed.
    Frame(Vec<u8>),
    /// The reader of `generation` failed.
    Failed { generation: u64, error: FrameError },
}

struct LinkState {
    liveness: MissCounter,
    generation: u64,
    reconnecting: bool,
    torn_down: bool,
}

/// One logical, reconnectable link carrying outbound messages of type `Out`.
pub struct Link<Out> {
    id: ConnectionId,
    peer: String,
    config: LinkConfig,
    identity: Mutex<Identity>,
    writer: tokio::sync::Mutex<Option<ChannelWriter>>,
    state: Mutex<LinkState>,
    generation_tx: watch::Sender<u64>,
    closed_tx: watch::Sender<bool>,
    readers: mpsc::UnboundedSender<InstalledReader>,
    supervisor: Weak<dyn Supervisor>,
    _out: PhantomData<fn(&Out)>,
}

impl<Out: WireMessage> Link<Out> {
    /// Build a link around its first channel (generation 0). Reader halves,
    /// this one and every later replacement, are sent on `readers`.
    pub(crate) fn new(
        id: ConnectionId,
        config: LinkConfig,
        channel: Channel,
        readers: mpsc::UnboundedSender<InstalledReader>,
        supervisor: Weak<dyn Supervisor>,
    ) -> Self {
        let peer = channel.describe();
        let (reader, writer) = channel.split(config.frame);
        // A dropped read loop only means nobody is listening yet.
        let _ = readers.send(InstalledReader {
            generation: 0,
            reader,
        });

        Self {
            id,
            peer,
            identity: Mutex::new(Identity::Anonymous),
            writer: tokio::sync::Mutex::new(Some(writer)),
            state: Mutex::new(LinkState {
                liveness: MissCounter::new(config.max_missed_pings),
                generation: 0,
                reconnecting: false,
                torn_down: false,
            }),
            generation_tx: watch::Sender::new(0),
            closed_tx: watch::Sender::new(false),
            readers,
            supervisor,
            config,
            _out: PhantomData,
        }
    }

    fn state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Link identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote end of the first channel, for logs.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Configuration the link was built with.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Who the peer is.
    pub fn identity(&self) -> Identity {
        self.identity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Record the peer's nickname.
    pub fn set_nickname(&self, nickname: impl Into<String>) {
        *self.identity.lock().unwrap_or_else(PoisonError::into_inner) =
            Identity::Nickname(nickname.into());
    }

    /// Current channel generation.
    pub fn generation(&self) -> u64 {
        self.state().generation
    }

    /// Current liveness state.
    pub fn liveness(&self) -> LivenessState {
        self.state().liveness.state()
    }

    /// Whether teardown has started.
    pub fn is_closed(&self) -> bool {
        self.state().torn_down
    }

    /// Subscribe to generation changes.
    pub fn subscribe_generation(&self) -> watch::Receiver<u64> {
        self.generation_tx.subscribe()
    }

    /// Subscribe to the closed flag.
    pub fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Serialize `msg` and write it to the current channel.
    ///
    /// Ordinary write errors are left to the caller, which decides whether
    /// they are worth a [`Link::report_failure`]. A write that exceeds
    /// `write_timeout` may have left half a frame on the wire, so that channel
    /// is dropped and reported here.
    pub async fn hand_off(&self, msg: &Out) -> Result<(), LinkError> {
        let payload = encode(msg)?;

        let mut writer = self.writer.lock().await;
        let generation = {
            let state = self.state();
            if state.torn_down {
                return Err(LinkError::Closed);
            }
            if state.liveness.state() == LivenessState::Dead {
                return Err(LinkError::Down {
                    generation: state.generation,
                });
            }
            state.generation
        };

        let Some(channel) = writer.as_mut() else {
            return Err(LinkError::Down { generation });
        };
        let write_timeout = self.config.write_timeout;
        match tokio::time::timeout(write_timeout, channel.send_frame(&payload)).await {
            Ok(result) => result.map_err(|source| LinkError::Io { generation, source }),
            Err(_) => {
                // Dropping the half closes it without waiting on the peer.
                writer.take();
                drop(writer);
                tracing::warn!(
                    "Write on link {} stalled for {write_timeout:?}, dropping channel {generation}",
                    self.id
                );
                self.report_failure(generation);
                Err(LinkError::WriteTimeout { generation })
            }
        }
    }

    /// Any inbound frame counts as proof of life.
    pub fn on_inbound_traffic(&self) -> bool {
        let mut state = self.state();
        !state.torn_down && state.liveness.reset()
    }

    /// Advance the liveness counter by one tick.
    pub(crate) fn on_tick(&self) -> (TickVerdict, u64) {
        let mut state = self.state();
        if state.torn_down {
            return (TickVerdict::Idle, state.generation);
        }
        let verdict = state.liveness.tick();
        (verdict, state.generation)
    }

    /// Tell the supervisor that the channel of `generation` looks broken.
    pub fn report_failure(&self, generation: u64) {
        if let Some(supervisor) = self.supervisor.upgrade() {
            supervisor.channel_failed(generation);
        }
    }

    /// Try to become the single in-flight reconnection for `observed`.
    pub(crate) fn claim_ticket(&self, observed: u64) -> TicketClaim {
        let mut state = self.state();
        if state.torn_down {
            return TicketClaim::Closed;
        }
        if state.reconnecting {
            // Subscribe while holding the lock so the install cannot slip by.
            return TicketClaim::InFlight(self.generation_tx.subscribe());
        }
        if state.generation != observed {
            return TicketClaim::Stale;
        }
        state.reconnecting = true;
        state.liveness.kill();
        TicketClaim::Acquired
    }

    /// Swap in a freshly opened channel. Returns the new generation, or
    /// `None` if the link was torn down in the meantime.
    pub(crate) async fn install(&self, channel: Channel) -> Option<u64> {
        self.install_with_greeting(channel, None).await
    }

    /// Like [`Link::install`], but `greeting` is written to the new channel
    /// before any other writer can reach it and before waiters on the
    /// generation are woken.
    pub(crate) async fn install_with_greeting(
        &self,
        channel: Channel,
        greeting: Option<&Out>,
    ) -> Option<u64> {
        let (reader, new_writer) = channel.split(self.config.frame);

        let mut writer = self.writer.lock().await;
        let generation = {
            let mut state = self.state();
            if state.torn_down {
                None
            } else {
                state.generation += 1;
                state.reconnecting = false;
                state.liveness.revive();
                Some(state.generation)
            }
        };

        let Some(generation) = generation else {
            let mut rejected = new_writer;
            rejected.close().await;
            return None;
        };

        if let Some(mut old) = writer.replace(new_writer) {
            old.close().await;
        }
        let greeted = match (greeting, writer.as_mut()) {
            (Some(greeting), Some(channel)) => self.greet(channel, greeting, generation).await,
            _ => true,
        };
        if !greeted {
            writer.take();
        }
        drop(writer);

        // Read loop gone means the link is shutting down anyway.
        let _ = self.readers.send(InstalledReader { generation, reader });
        self.generation_tx.send_replace(generation);
        if !greeted {
            self.report_failure(generation);
        }
        Some(generation)
    }

    async fn greet(&self, channel: &mut ChannelWriter, greeting: &Out, generation: u64) -> bool {
        let payload = match encode(greeting) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Skipping greeting on link {}: {e}", self.id);
                return true;
            }
        };
        match tokio::time::timeout(self.config.write_timeout, channel.send_frame(&payload)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::debug!("Greeting on link {} generation {generation} failed: {e}", self.id);
                false
            }
            Err(_) => {
                tracing::debug!("Greeting on link {} generation {generation} stalled", self.id);
                false
            }
        }
    }

    /// Close and forget the current channel writer.
    pub(crate) async fn drop_channel(&self) {
        let old = self.writer.lock().await.take();
        if let Some(mut old) = old {
            old.close().await;
        }
    }

    /// Mark the link as torn down. Returns `false` if it already was.
    pub(crate) fn begin_teardown(&self) -> bool {
        let mut state = self.state();
        if state.torn_down {
            return false;
        }
        state.torn_down = true;
        state.reconnecting = false;
        state.liveness.kill();
        true
    }

    /// Wake everything waiting on this link so it can exit.
    pub(crate) fn mark_closed(&self) {
        self.closed_tx.send_replace(true);
    }

    /// Drive the inbound side: read frames from whichever channel is current,
    /// refresh liveness on every frame and pass the result to `on_inbound`.
    ///
    /// Returns when the link is closed or when `on_inbound` breaks.
    pub(crate) async fn read_loop<F>(
        &self,
        mut readers: mpsc::UnboundedReceiver<InstalledReader>,
        mut on_inbound: F,
    ) where
        F: FnMut(Inbound) -> ControlFlow<()>,
    {
        enum Step {
            Closed,
            Replaced(Option<InstalledReader>),
            Read(Result<Result<Vec<u8>, FrameError>, tokio::time::error::Elapsed>),
        }

        let mut closed = self.subscribe_closed();
        let mut current: Option<InstalledReader> = None;
        let read_timeout = self.config.read_timeout;

        loop {
            let step = match current.as_mut() {
                None => tokio::select! {
                    _ = wait_closed(&mut closed) => Step::Closed,
                    next = readers.recv() => Step::Replaced(next),
                },
                Some(installed) => tokio::select! {
                    biased;
                    _ = wait_closed(&mut closed) => Step::Closed,
                    next = readers.recv() => Step::Replaced(next),
                    read = tokio::time::timeout(read_timeout, installed.reader.next_frame()) => {
                        Step::Read(read)
                    }
                },
            };

            match step {
                Step::Closed => break,
                Step::Replaced(None) => break,
                Step::Replaced(Some(next)) => {
                    tracing::debug!(
                        "Link {} switched to channel generation {}",
                        self.id,
                        next.generation
                    );
                    current = Some(next);
                }
                // Timed out: loop around and re-check the closed flag.
                Step::Read(Err(_)) => {}
                Step::Read(Ok(Ok(frame))) => {
                    self.on_inbound_traffic();
                    if on_inbound(Inbound::Frame(frame)).is_break() {
                        break;
                    }
                }
                Step::Read(Ok(Err(error))) => {
                    let generation = current.take().map_or(0, |r| r.generation);
                    if on_inbound(Inbound::Failed { generation, error }).is_break() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::local::{self, LocalChannel};
    use crate::message::Downstream;

    pub(crate) type TestFrame = Downstream<String>;

    /// Supervisor that only records failure reports.
    #[derive(Default)]
    pub(crate) struct RecordingSupervisor {
        pub(crate) failures: Mutex<Vec<u64>>,
    }

    impl Supervisor for RecordingSupervisor {
        fn channel_failed(self: Arc<Self>, generation: u64) {
            self.failures.lock().unwrap().push(generation);
        }
    }

    /// A link over a local pair plus the far end of that pair.
    pub(crate) fn local_link(
        supervisor: &Arc<RecordingSupervisor>,
    ) -> (
        Arc<Link<TestFrame>>,
        mpsc::UnboundedReceiver<InstalledReader>,
        LocalChannel,
    ) {
        let (near, far) = local::pair();
        let weak: Weak<dyn Supervisor> = Arc::downgrade(supervisor) as Weak<dyn Supervisor>;
        let (readers_tx, readers) = mpsc::unbounded_channel();
        let link = Link::new(
            ConnectionId(1),
            LinkConfig::default(),
            Channel::Local(near),
            readers_tx,
            weak,
        );
        (Arc::new(link), readers, far)
    }

    /// Decode the next frame arriving on `reader`.
    pub(crate) async fn received(reader: &mut ChannelReader) -> TestFrame {
        let frame = reader.next_frame().await.unwrap();
        crate::message::decode(&frame).unwrap()
    }
}
