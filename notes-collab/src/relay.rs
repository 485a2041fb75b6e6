//! Fan-out of edits and presence to the members of a session.
//!
//! Every connection owns a bounded outbound queue; its [`PeerHandle`] is what
//! the registry stores as membership. The relay enqueues with `try_send`
//! while holding the session's member lock, so:
//! - broadcasting never waits on a slow peer (full queues drop the event),
//! - each peer observes one origin's events in the order they were issued,
//! - presence counts are read and enqueued atomically with the membership
//!   they describe.
//!
//! Active counts are never lost to a full queue: the newest one is parked
//! beside the queue and handed out once the queue drains.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tokio::sync::Notify;

use crate::protocol::{ConnectionId, ServerEvent, ServerMessage};
use crate::registry::{Members, SessionRegistry};

/// Newest active count that did not fit in the queue.
#[derive(Debug, Default)]
struct ParkedCount {
    latest: Mutex<Option<ServerMessage>>,
    notify: Notify,
}

impl ParkedCount {
    fn park(&self, msg: ServerMessage) {
        if let Ok(mut latest) = self.latest.lock() {
            *latest = Some(msg);
        }
        self.notify.notify_one();
    }

    fn clear(&self) {
        if let Ok(mut latest) = self.latest.lock() {
            *latest = None;
        }
    }

    fn take(&self) -> Option<ServerMessage> {
        self.latest.lock().ok().and_then(|mut latest| latest.take())
    }
}

/// Sending side of one connection's outbound queue.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    id: ConnectionId,
    tx: mpsc::Sender<ServerMessage>,
    parked: Arc<ParkedCount>,
}

/// Receiving side of one connection's outbound queue.
#[derive(Debug)]
pub struct PeerReceiver {
    rx: mpsc::Receiver<ServerMessage>,
    parked: Arc<ParkedCount>,
}

/// Outcome of a single enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Queue full; the event was dropped.
    Dropped,
    /// Queue full; the active count was parked and replaces any older one.
    Parked,
    /// The connection is gone.
    Closed,
}

impl PeerHandle {
    /// Create a handle plus the receiving side of its queue.
    pub fn channel(id: ConnectionId, capacity: usize) -> (Self, PeerReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let parked = Arc::new(ParkedCount::default());
        (
            Self {
                id,
                tx,
                parked: parked.clone(),
            },
            PeerReceiver { rx, parked },
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Enqueue without waiting.
    pub fn deliver(&self, msg: ServerMessage) -> Delivery {
        let is_count = matches!(msg.event, ServerEvent::ActiveCount(_));
        match self.tx.try_send(msg) {
            Ok(()) => {
                if is_count {
                    // Anything parked is older than what was just queued.
                    self.parked.clear();
                }
                Delivery::Queued
            }
            Err(TrySendError::Full(msg)) if is_count => {
                self.parked.park(msg);
                Delivery::Parked
            }
            Err(TrySendError::Full(_)) => Delivery::Dropped,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

impl PeerReceiver {
    /// Next outbound message. A parked count is handed out once the queue is
    /// empty. `None` once every handle is gone and nothing is left.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        loop {
            match self.rx.try_recv() {
                Ok(msg) => return Some(msg),
                Err(TryRecvError::Disconnected) => return self.parked.take(),
                Err(TryRecvError::Empty) => {}
            }
            if let Some(msg) = self.parked.take() {
                return Some(msg);
            }
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(msg) => return Some(msg),
                    None => return self.parked.take(),
                },
                _ = self.parked.notify.notified() => {}
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Result<ServerMessage, TryRecvError> {
        match self.rx.try_recv() {
            Ok(msg) => Ok(msg),
            Err(e) => self.parked.take().ok_or(e),
        }
    }
}

/// Presence signals. Joined/Left are anonymous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// Sent to everyone but the joiner.
    Joined,
    /// Sent to everyone but the leaver.
    Left,
    /// Sent to every member, carrying the current member count.
    ActiveCount,
}

/// Statistics for monitoring relay health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
}

#[derive(Default)]
struct AtomicRelayStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// The broadcast relay.
pub struct BroadcastRelay {
    registry: Arc<SessionRegistry>,
    stats: AtomicRelayStats,
}

impl BroadcastRelay {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            stats: AtomicRelayStats::default(),
        }
    }

    /// Deliver `content` to every member of the session except `origin`.
    ///
    /// Returns the number of peers the edit was queued for.
    pub async fn broadcast_update(
        &self,
        session_id: &str,
        origin: ConnectionId,
        content: &str,
    ) -> usize {
        let Some(session) = self.registry.session(session_id).await else {
            return 0;
        };
        let members = session.members().await;
        let event = ServerEvent::PeerEdit {
            content: content.to_string(),
        };
        self.fan_out(session_id, &members, Some(origin), event)
    }

    /// Deliver a presence event to the session.
    ///
    /// Returns the number of peers the event was queued for.
    pub async fn broadcast_presence(
        &self,
        session_id: &str,
        origin: ConnectionId,
        presence: Presence,
    ) -> usize {
        let Some(session) = self.registry.session(session_id).await else {
            return 0;
        };
        let members = session.members().await;
        let (event, skip) = match presence {
            Presence::Joined => (ServerEvent::PeerJoined, Some(origin)),
            Presence::Left => (ServerEvent::PeerLeft, Some(origin)),
            Presence::ActiveCount => (ServerEvent::ActiveCount(members.len()), None),
        };
        self.fan_out(session_id, &members, skip, event)
    }

    /// Lock-free stats snapshot.
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
        }
    }

    fn fan_out(
        &self,
        session_id: &str,
        members: &Members,
        skip: Option<ConnectionId>,
        event: ServerEvent,
    ) -> usize {
        let mut queued = 0;
        for peer in members.iter().filter(|p| Some(p.id()) != skip) {
            let msg = ServerMessage::session(session_id, event.clone());
            match peer.deliver(msg) {
                Delivery::Queued => {
                    queued += 1;
                    self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                }
                Delivery::Parked => {
                    log::debug!("Peer {} lagging in {session_id}; parked {event:?}", peer.id());
                }
                Delivery::Dropped => {
                    self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Peer {} lagging in {session_id}; dropped {event:?}", peer.id());
                }
                // Already disconnected; cleanup will remove it from the session.
                Delivery::Closed => {}
            }
        }
        queued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    struct Fixture {
        registry: Arc<SessionRegistry>,
        relay: BroadcastRelay,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = Arc::new(SessionRegistry::new());
            let relay = BroadcastRelay::new(registry.clone());
            Self { registry, relay }
        }

        async fn member(&self, session: &str) -> (PeerHandle, PeerReceiver) {
            let (peer, rx) = PeerHandle::channel(Uuid::new_v4(), 16);
            self.registry.join(session, peer.clone()).await;
            (peer, rx)
        }
    }

    fn drain(rx: &mut PeerReceiver) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            events.push(msg.event);
        }
        events
    }

    #[tokio::test]
    async fn test_update_skips_origin() {
        let fx = Fixture::new();
        let (a, mut rx_a) = fx.member("doc").await;
        let (_b, mut rx_b) = fx.member("doc").await;
        let (_c, mut rx_c) = fx.member("doc").await;

        let queued = fx.relay.broadcast_update("doc", a.id(), "hello").await;
        assert_eq!(queued, 2);

        let expected = vec![ServerEvent::PeerEdit { content: "hello".into() }];
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(drain(&mut rx_b), expected);
        assert_eq!(drain(&mut rx_c), expected);
    }

    #[tokio::test]
    async fn test_messages_are_scoped_to_session() {
        let fx = Fixture::new();
        let (a, _rx_a) = fx.member("doc1").await;
        let (_b, mut rx_b) = fx.member("doc1").await;
        let (_c, mut rx_c) = fx.member("doc2").await;

        fx.relay.broadcast_update("doc1", a.id(), "x").await;

        let msg = rx_b.try_recv().unwrap();
        assert_eq!(msg.session_id.as_deref(), Some("doc1"));
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_presence_targets() {
        let fx = Fixture::new();
        let (_a, mut rx_a) = fx.member("doc").await;
        let (b, mut rx_b) = fx.member("doc").await;

        assert_eq!(fx.relay.broadcast_presence("doc", b.id(), Presence::Joined).await, 1);
        assert_eq!(fx.relay.broadcast_presence("doc", b.id(), Presence::ActiveCount).await, 2);

        assert_eq!(
            drain(&mut rx_a),
            vec![ServerEvent::PeerJoined, ServerEvent::ActiveCount(2)]
        );
        assert_eq!(drain(&mut rx_b), vec![ServerEvent::ActiveCount(2)]);

        fx.registry.leave("doc", b.id()).await;
        fx.relay.broadcast_presence("doc", b.id(), Presence::Left).await;
        fx.relay.broadcast_presence("doc", b.id(), Presence::ActiveCount).await;

        assert_eq!(
            drain(&mut rx_a),
            vec![ServerEvent::PeerLeft, ServerEvent::ActiveCount(1)]
        );
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn test_relay_to_missing_session_is_noop() {
        let fx = Fixture::new();
        assert_eq!(fx.relay.broadcast_update("nobody", Uuid::new_v4(), "x").await, 0);
        assert_eq!(
            fx.relay
                .broadcast_presence("nobody", Uuid::new_v4(), Presence::ActiveCount)
                .await,
            0
        );
        assert_eq!(fx.relay.stats(), RelayStats::default());
    }

    #[tokio::test]
    async fn test_closed_peer_is_skipped_silently() {
        let fx = Fixture::new();
        let (a, _rx_a) = fx.member("doc").await;
        let (_b, rx_b) = fx.member("doc").await;
        drop(rx_b);

        assert_eq!(fx.relay.broadcast_update("doc", a.id(), "x").await, 0);
        assert_eq!(fx.relay.stats().messages_dropped, 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops_and_counts() {
        let fx = Fixture::new();
        let (a, _rx_a) = fx.member("doc").await;
        let (slow, mut rx_slow) = PeerHandle::channel(Uuid::new_v4(), 1);
        fx.registry.join("doc", slow).await;

        fx.relay.broadcast_update("doc", a.id(), "one").await;
        fx.relay.broadcast_update("doc", a.id(), "two").await;

        let stats = fx.relay.stats();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_dropped, 1);
        assert_eq!(
            drain(&mut rx_slow),
            vec![ServerEvent::PeerEdit { content: "one".into() }]
        );
    }

    #[tokio::test]
    async fn test_single_origin_order_preserved() {
        let fx = Fixture::new();
        let (a, _rx_a) = fx.member("doc").await;
        let (_b, mut rx_b) = fx.member("doc").await;

        for i in 0..10 {
            fx.relay.broadcast_update("doc", a.id(), &format!("v{i}")).await;
        }

        let received: Vec<ServerEvent> = drain(&mut rx_b);
        let expected: Vec<ServerEvent> = (0..10)
            .map(|i| ServerEvent::PeerEdit { content: format!("v{i}") })
            .collect();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_full_queue_parks_latest_count() {
        let fx = Fixture::new();
        let (a, _rx_a) = fx.member("doc").await;
        let (slow, mut rx_slow) = PeerHandle::channel(Uuid::new_v4(), 1);
        fx.registry.join("doc", slow).await;

        fx.relay.broadcast_update("doc", a.id(), "one").await;
        fx.relay.broadcast_presence("doc", a.id(), Presence::ActiveCount).await;
        let (_c, _rx_c) = fx.member("doc").await;
        fx.relay.broadcast_presence("doc", a.id(), Presence::ActiveCount).await;

        assert_eq!(fx.relay.stats().messages_dropped, 0);
        assert_eq!(
            drain(&mut rx_slow),
            vec![
                ServerEvent::PeerEdit { content: "one".into() },
                ServerEvent::ActiveCount(3),
            ]
        );
    }

    #[tokio::test]
    async fn test_queued_count_supersedes_parked_one() {
        let fx = Fixture::new();
        let (a, _rx_a) = fx.member("doc").await;
        let (slow, mut rx_slow) = PeerHandle::channel(Uuid::new_v4(), 1);
        fx.registry.join("doc", slow).await;

        fx.relay.broadcast_update("doc", a.id(), "one").await;
        fx.relay.broadcast_presence("doc", a.id(), Presence::ActiveCount).await;
        assert!(rx_slow.try_recv().is_ok());

        let (_c, _rx_c) = fx.member("doc").await;
        fx.relay.broadcast_presence("doc", a.id(), Presence::ActiveCount).await;

        assert_eq!(drain(&mut rx_slow), vec![ServerEvent::ActiveCount(3)]);
    }

    #[tokio::test]
    async fn test_recv_wakes_for_parked_count() {
        let (peer, mut rx) = PeerHandle::channel(Uuid::new_v4(), 1);
        peer.deliver(ServerMessage::direct(ServerEvent::Pong));
        assert_eq!(
            peer.deliver(ServerMessage::session("doc", ServerEvent::ActiveCount(2))),
            Delivery::Parked
        );

        assert_eq!(rx.recv().await.map(|m| m.event), Some(ServerEvent::Pong));
        assert_eq!(rx.recv().await.map(|m| m.event), Some(ServerEvent::ActiveCount(2)));

        drop(peer);
        assert!(rx.recv().await.is_none());
    }
}
