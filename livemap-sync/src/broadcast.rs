//! Relay-side room fan-out.
//!
//! Each room owns a tokio broadcast channel carrying pre-encoded JSON
//! frames, plus the table of visitors the relay has seen in that room.
//! A uid has at most one live connection: a newer connection for the same
//! uid displaces the older one, and only the current session may update or
//! retire the visitor record.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, oneshot, RwLock};

use crate::protocol::{LocationReport, PeerEvent, ProtocolError, RoomId};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_visitors: usize,
    pub known_visitors: usize,
}

/// What the relay remembers about one uid in a room.
#[derive(Debug)]
struct RelayVisitor {
    name: String,
    location: Option<String>,
    active: bool,
    session: u64,
    /// Fires to close the connection when a newer session takes over.
    displace: Option<oneshot::Sender<()>>,
}

impl RelayVisitor {
    fn public_event(&self, uid: &str) -> PeerEvent {
        PeerEvent::new(uid, self.name.clone(), self.location.clone(), self.active)
    }
}

/// A connection's registration in a room.
pub struct Membership {
    /// Session id; stale sessions are ignored on update/leave.
    pub session: u64,
    /// Frames fanned out to this room.
    pub receiver: broadcast::Receiver<Arc<str>>,
    /// Resolves when a newer connection for the same uid displaces this one.
    pub displaced: oneshot::Receiver<()>,
    /// Current public state of every other visitor in the room.
    pub existing: Vec<PeerEvent>,
}

/// Broadcast group and visitor table for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<str>>,
    visitors: RwLock<HashMap<String, RelayVisitor>>,
    capacity: usize,
    next_session: AtomicU64,
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    /// Create a group buffering up to `capacity` frames per receiver.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            visitors: RwLock::new(HashMap::new()),
            capacity,
            next_session: AtomicU64::new(1),
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Register a new connection for `uid`, displacing any live one.
    pub async fn join(&self, uid: &str) -> Membership {
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        let (displace_tx, displaced) = oneshot::channel();

        let mut visitors = self.visitors.write().await;
        // Subscribe under the lock so no frame falls between snapshot and stream.
        let receiver = self.sender.subscribe();

        if let Some(old) = visitors.get_mut(uid) {
            if let Some(tx) = old.displace.take() {
                log::info!("Displacing previous connection of {uid}");
                let _ = tx.send(());
            }
        }
        visitors.insert(
            uid.to_string(),
            RelayVisitor {
                name: String::new(),
                location: None,
                active: true,
                session,
                displace: Some(displace_tx),
            },
        );

        let existing = visitors
            .iter()
            .filter(|(id, _)| id.as_str() != uid)
            .map(|(id, v)| v.public_event(id))
            .collect();

        Membership {
            session,
            receiver,
            displaced,
            existing,
        }
    }

    /// Record a report from `uid` and fan the public event out.
    ///
    /// Returns `None` if `session` is no longer the uid's current one.
    pub async fn update(
        &self,
        uid: &str,
        session: u64,
        report: LocationReport,
    ) -> Result<Option<PeerEvent>, ProtocolError> {
        let event = {
            let mut visitors = self.visitors.write().await;
            let Some(visitor) = visitors.get_mut(uid).filter(|v| v.session == session) else {
                return Ok(None);
            };
            visitor.name = report.name;
            visitor.location = report.location;
            visitor.public_event(uid)
        };
        self.broadcast(&event)?;
        Ok(Some(event))
    }

    /// Mark `uid` inactive (keeping its last location) and fan that out.
    pub async fn leave(&self, uid: &str, session: u64) -> Result<Option<PeerEvent>, ProtocolError> {
        let event = {
            let mut visitors = self.visitors.write().await;
            let Some(visitor) = visitors.get_mut(uid).filter(|v| v.session == session) else {
                return Ok(None);
            };
            visitor.active = false;
            visitor.displace = None;
            visitor.public_event(uid)
        };
        self.broadcast(&event)?;
        Ok(Some(event))
    }

    /// Fan an event out to every receiver, the sender's own included.
    ///
    /// Returns the number of receivers reached.
    pub fn broadcast(&self, event: &PeerEvent) -> Result<usize, ProtocolError> {
        let frame: Arc<str> = Arc::from(event.encode()?);
        let count = self.sender.send(frame).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(count)
    }

    /// Number of visitors with a live connection.
    pub async fn active_count(&self) -> usize {
        self.visitors.read().await.values().filter(|v| v.active).count()
    }

    pub async fn stats(&self) -> BroadcastStats {
        let visitors = self.visitors.read().await;
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_visitors: visitors.values().filter(|v| v.active).count(),
            known_visitors: visitors.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps room ids to broadcast groups; rooms never see each other's frames.
pub struct RoomManager {
    rooms: RwLock<HashMap<RoomId, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the group for `room`.
    pub async fn get_or_create(&self, room: &RoomId) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(group) = rooms.get(room) {
                return group.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room.clone())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .clone()
    }

    pub async fn get(&self, room: &RoomId) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(room).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(uid: &str, name: &str, location: Option<&str>) -> LocationReport {
        LocationReport::new(uid, name, location.map(String::from))
    }

    #[tokio::test]
    async fn test_join_lists_other_visitors() {
        let group = BroadcastGroup::new(16);

        let alice = group.join("a").await;
        assert!(alice.existing.is_empty());
        group
            .update("a", alice.session, report("a", "Alice", Some("1,2")))
            .await
            .unwrap();

        let bob = group.join("b").await;
        assert_eq!(bob.existing.len(), 1);
        assert_eq!(bob.existing[0].uid, "a");
        assert_eq!(bob.existing[0].name, "Alice");
        assert_eq!(bob.existing[0].location.as_deref(), Some("1,2"));
        assert!(bob.existing[0].active);
    }

    #[tokio::test]
    async fn test_update_fans_out_to_everyone() {
        let group = BroadcastGroup::new(16);
        let mut alice = group.join("a").await;
        let mut bob = group.join("b").await;

        let event = group
            .update("a", alice.session, report("a", "Alice", Some("3,4")))
            .await
            .unwrap()
            .unwrap();
        assert!(event.active);

        for rx in [&mut alice.receiver, &mut bob.receiver] {
            let frame = rx.recv().await.unwrap();
            assert_eq!(PeerEvent::decode(&frame).unwrap(), event);
        }
    }

    #[tokio::test]
    async fn test_leave_keeps_location_inactive() {
        let group = BroadcastGroup::new(16);
        let alice = group.join("a").await;
        let mut bob = group.join("b").await;
        group
            .update("a", alice.session, report("a", "Alice", Some("5,6")))
            .await
            .unwrap();
        let _ = bob.receiver.recv().await.unwrap();

        let left = group.leave("a", alice.session).await.unwrap().unwrap();
        assert!(!left.active);
        assert_eq!(left.location.as_deref(), Some("5,6"));

        let frame = bob.receiver.recv().await.unwrap();
        assert!(!PeerEvent::decode(&frame).unwrap().active);
        assert_eq!(group.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_rejoin_displaces_old_session() {
        let group = BroadcastGroup::new(16);
        let first = group.join("a").await;
        let second = group.join("a").await;
        assert_ne!(first.session, second.session);

        // The older connection is told to close.
        first.displaced.await.unwrap();

        // Its late updates and leave are ignored.
        assert!(group
            .update("a", first.session, report("a", "Old", Some("0,0")))
            .await
            .unwrap()
            .is_none());
        assert!(group.leave("a", first.session).await.unwrap().is_none());
        assert_eq!(group.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_stats() {
        let group = BroadcastGroup::new(8);
        let a = group.join("a").await;
        let _b = group.join("b").await;
        group.update("a", a.session, report("a", "", None)).await.unwrap();
        group.leave("a", a.session).await.unwrap();

        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.active_visitors, 1);
        assert_eq!(stats.known_visitors, 2);
        assert_eq!(group.capacity(), 8);
    }

    #[tokio::test]
    async fn test_room_manager_get_or_create() {
        let manager = RoomManager::new(16);
        let room = RoomId::parse("block-1").unwrap();

        let g1 = manager.get_or_create(&room).await;
        let g2 = manager.get_or_create(&room).await;
        assert!(Arc::ptr_eq(&g1, &g2));
        assert_eq!(manager.room_count().await, 1);
        assert!(manager.get(&RoomId::parse("other").unwrap()).await.is_none());
    }

    #[tokio::test]
    async fn test_rooms_isolated() {
        let manager = RoomManager::new(16);
        let r1 = manager.get_or_create(&RoomId::parse("one").unwrap()).await;
        let r2 = manager.get_or_create(&RoomId::parse("two").unwrap()).await;

        let a = r1.join("a").await;
        let mut b = r2.join("b").await;
        r1.update("a", a.session, report("a", "A", Some("1,1"))).await.unwrap();

        assert!(matches!(
            b.receiver.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        assert!(b.existing.is_empty());
    }
}
