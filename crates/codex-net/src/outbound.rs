//! Per-peer outbound delivery queue.
//!
//! Producers call [`OutboundQueue::enqueue`], which never blocks or fails. A
//! single delivery task per queue peeks the head, hands it to the target
//! [`Link`] and pops it only once the hand-off succeeded. When a hand-off
//! fails, the task parks until the link installs a new channel or the queue
//! is closed, then retries the same head message, so order is preserved and
//! nothing is skipped.
//!
//! A link has exactly one queue. Everything sent to the peer goes through
//! it, which is what makes per-link order FIFO.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Notify, watch};

use crate::link::{Link, LinkError};
use crate::liveness::wait_closed;
use crate::message::WireMessage;

struct Pending<M> {
    items: VecDeque<M>,
    closed: bool,
}

struct Shared<M> {
    pending: Mutex<Pending<M>>,
    wake: Notify,
    target: Option<Arc<Link<M>>>,
    closed: watch::Sender<bool>,
    depth: watch::Sender<usize>,
}

impl<M> Shared<M> {
    fn pending(&self) -> MutexGuard<'_, Pending<M>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) -> bool {
        let mut pending = self.pending();
        if pending.closed {
            return false;
        }
        pending.closed = true;
        let discarded = pending.items.len();
        pending.items.clear();
        drop(pending);

        if discarded > 0 {
            tracing::debug!("Outbound queue closed, discarding {discarded} messages");
        }
        self.depth.send_replace(0);
        self.closed.send_replace(true);
        self.wake.notify_one();
        true
    }
}

/// Closes the queue when the last handle goes away.
struct CloseOnDrop<M>(Arc<Shared<M>>);

impl<M> Drop for CloseOnDrop<M> {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// FIFO of messages waiting to be handed to a [`Link`].
///
/// Cloning yields another handle to the same queue.
pub struct OutboundQueue<M> {
    shared: Arc<Shared<M>>,
    _guard: Arc<CloseOnDrop<M>>,
}

impl<M> Clone for OutboundQueue<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            _guard: Arc::clone(&self._guard),
        }
    }
}

impl<M: WireMessage> OutboundQueue<M> {
    /// Create a queue delivering to `target` and spawn its delivery task.
    ///
    /// With no target, messages accumulate until the queue is closed.
    /// Must be called from within a tokio runtime.
    pub fn new(target: Option<Arc<Link<M>>>) -> Self {
        let shared = Arc::new(Shared {
            pending: Mutex::new(Pending {
                items: VecDeque::new(),
                closed: false,
            }),
            wake: Notify::new(),
            target,
            closed: watch::Sender::new(false),
            depth: watch::Sender::new(0),
        });
        tokio::spawn(deliver(Arc::clone(&shared)));

        Self {
            _guard: Arc::new(CloseOnDrop(Arc::clone(&shared))),
            shared,
        }
    }

    /// Append a message. Silently discarded once the queue is closed.
    pub fn enqueue(&self, msg: M) {
        let mut pending = self.shared.pending();
        if pending.closed {
            tracing::trace!("Dropping message for closed queue: {msg:?}");
            return;
        }
        pending.items.push_back(msg);
        let depth = pending.items.len();
        drop(pending);

        self.shared.depth.send_replace(depth);
        self.shared.wake.notify_one();
    }

    /// Discard everything and stop the delivery task. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Whether [`OutboundQueue::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.pending().closed
    }

    /// Number of messages not yet handed off.
    pub fn len(&self) -> usize {
        self.shared.pending().items.len()
    }

    /// Whether nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the messages not yet handed off, head first.
    pub fn pending(&self) -> Vec<M> {
        self.shared.pending().items.iter().cloned().collect()
    }

    /// Wait until every queued message has been handed off (or discarded).
    pub async fn flushed(&self) {
        let mut depth = self.shared.depth.subscribe();
        while *depth.borrow_and_update() > 0 {
            if depth.changed().await.is_err() {
                return;
            }
        }
    }
}

async fn deliver<M: WireMessage>(shared: Arc<Shared<M>>) {
    let mut closed = shared.closed.subscribe();
    let Some(link) = shared.target.clone() else {
        wait_closed(&mut closed).await;
        tracing::trace!("Detached queue closed");
        return;
    };

    loop {
        let head = {
            let pending = shared.pending();
            if pending.closed {
                break;
            }
            pending.items.front().cloned()
        };
        let Some(head) = head else {
            // A notify_one with no waiter leaves a permit, so a wake-up
            // between the check above and this await is not lost.
            shared.wake.notified().await;
            continue;
        };

        let failed_generation = match link.hand_off(&head).await {
            Ok(()) => {
                let mut pending = shared.pending();
                pending.items.pop_front();
                let depth = pending.items.len();
                drop(pending);
                shared.depth.send_replace(depth);
                continue;
            }
            Err(LinkError::Encode(e)) => {
                tracing::error!("Discarding message that cannot be encoded: {e}");
                let mut pending = shared.pending();
                pending.items.pop_front();
                let depth = pending.items.len();
                drop(pending);
                shared.depth.send_replace(depth);
                continue;
            }
            Err(LinkError::Io { generation, source }) => {
                tracing::debug!("Hand-off to link {} failed: {source}", link.id());
                link.report_failure(generation);
                Some(generation)
            }
            Err(LinkError::Down { generation } | LinkError::WriteTimeout { generation }) => {
                Some(generation)
            }
            // A closed link never gets a new channel.
            Err(LinkError::Closed) => None,
        };

        let mut generations = link.subscribe_generation();
        let channel_swapped = async {
            match failed_generation {
                Some(failed) => {
                    while *generations.borrow_and_update() == failed {
                        if generations.changed().await.is_err() {
                            std::future::pending::<()>().await;
                        }
                    }
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = channel_swapped => {}
            _ = wait_closed(&mut closed) => break,
        }
    }

    tracing::trace!("Delivery loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::FrameConfig;
    use crate::link::test_support::*;
    use crate::local;
    use crate::message::Downstream;
    use crate::transport::Channel;
    use std::time::Duration;

    fn notice(text: &str) -> TestFrame {
        Downstream::Notice(text.to_string())
    }

    #[tokio::test]
    async fn test_delivers_in_enqueue_order() {
        let supervisor = Arc::new(RecordingSupervisor::default());
        let (link, _readers, far) = local_link(&supervisor);
        let (mut far_rx, _far_tx) = Channel::Local(far).split(FrameConfig::default());

        let queue = OutboundQueue::new(Some(link));
        for text in ["a", "b", "c"] {
            queue.enqueue(notice(text));
        }

        for text in ["a", "b", "c"] {
            assert_eq!(received(&mut far_rx).await, notice(text));
        }
        queue.flushed().await;
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_after_close_is_noop() {
        let queue = OutboundQueue::<TestFrame>::new(None);
        queue.enqueue(notice("kept"));
        assert_eq!(queue.len(), 1);

        queue.close();
        queue.close();
        queue.enqueue(notice("dropped"));
        assert!(queue.is_closed());
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_detached_queue_holds_messages() {
        let queue = OutboundQueue::<TestFrame>::new(None);
        queue.enqueue(notice("early"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.pending(), vec![notice("early")]);
    }

    #[tokio::test]
    async fn test_failed_head_is_retried_after_channel_swap() {
        let supervisor = Arc::new(RecordingSupervisor::default());
        let (link, _readers, far) = local_link(&supervisor);
        drop(far);

        let queue = OutboundQueue::new(Some(Arc::clone(&link)));
        queue.enqueue(notice("one"));
        queue.enqueue(notice("two"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(queue.len(), 2);
        assert_eq!(*supervisor.failures.lock().unwrap(), vec![0]);

        link.claim_ticket(0);
        let (near, far2) = local::pair();
        link.install(Channel::Local(near)).await.unwrap();
        let (mut far_rx, _far_tx) = Channel::Local(far2).split(FrameConfig::default());

        assert_eq!(received(&mut far_rx).await, notice("one"));
        assert_eq!(received(&mut far_rx).await, notice("two"));
    }

    #[tokio::test]
    async fn test_closed_link_parks_until_queue_closes() {
        let supervisor = Arc::new(RecordingSupervisor::default());
        let (link, _readers, _far) = local_link(&supervisor);
        link.begin_teardown();

        let queue = OutboundQueue::new(Some(link));
        queue.enqueue(notice("held"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.len(), 1);
        assert!(supervisor.failures.lock().unwrap().is_empty());

        queue.close();
        assert!(queue.is_empty());
        tokio::time::timeout(Duration::from_secs(1), queue.flushed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_flushed_returns_once_delivered() {
        let supervisor = Arc::new(RecordingSupervisor::default());
        let (link, _readers, _far) = local_link(&supervisor);
        let queue = OutboundQueue::new(Some(link));
        queue.enqueue(notice("x"));

        tokio::time::timeout(Duration::from_secs(1), queue.flushed())
            .await
            .unwrap();
    }
}
