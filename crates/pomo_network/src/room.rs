//! Rooms: named groups of peers sharing their activity state.
//!
//! A [`RoomManager`] keeps at most one room open. Joining subscribes to the
//! room's topic and starts a receive loop that folds Join, Leave and
//! StateUpdate messages into the member map. State is last-write-wins in
//! arrival order; there is no coordinator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::host::Host;
use crate::message::{Member, Message};
use crate::pubsub::{Subscription, Topic};
use crate::shutdown::Shutdown;

/// The active room and its converged member map.
#[derive(Debug, Clone)]
pub struct Room {
    key: String,
    topic: String,
    members: HashMap<String, Member>,
}

impl Room {
    pub fn new(key: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            topic: topic.into(),
            members: HashMap::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn members(&self) -> &HashMap<String, Member> {
        &self.members
    }

    /// Fold one protocol message into the member map.
    ///
    /// A Join for a member already present only refreshes the display name,
    /// so a late Join never rolls back a newer StateUpdate.
    pub fn apply(&mut self, message: &Message) {
        match message {
            Message::StateUpdate { member } => {
                self.members.insert(member.id.clone(), member.clone());
            }
            Message::Join { member, .. } => {
                self.members
                    .entry(member.id.clone())
                    .and_modify(|existing| existing.name = member.name.clone())
                    .or_insert_with(|| member.clone());
            }
            Message::Leave { member, .. } => {
                self.members.remove(&member.id);
            }
        }
    }
}

struct Session {
    key: String,
    topic: Topic,
    cancel: Shutdown,
    task: JoinHandle<()>,
}

/// Joins, leaves and synchronizes one room at a time.
pub struct RoomManager {
    host: Arc<Host>,
    display_name: String,
    topic_prefix: String,
    join_grace: Duration,
    shutdown: Shutdown,
    room: Arc<RwLock<Option<Room>>>,
    session: Mutex<Option<Session>>,
}

impl RoomManager {
    /// Create a manager publishing as `display_name`. Receive loops are bound
    /// to children of `shutdown`.
    pub fn new(
        host: Arc<Host>,
        display_name: impl Into<String>,
        config: &NetworkConfig,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            host,
            display_name: display_name.into(),
            topic_prefix: config.topic_prefix.clone(),
            join_grace: config.join_grace,
            shutdown,
            room: Arc::new(RwLock::new(None)),
            session: Mutex::new(None),
        }
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// The topic name used for `room_key`.
    pub fn topic_for(&self, room_key: &str) -> String {
        format!("{}{room_key}", self.topic_prefix)
    }

    /// Key of the room currently joined, if any.
    pub fn current_room(&self) -> Option<String> {
        self.room.read().as_ref().map(|room| room.key.clone())
    }

    /// Join `room_key`. Re-joining the current room is a no-op; joining a
    /// different one leaves the current room first.
    pub async fn join_room(&self, room_key: &str) -> Result<(), NetworkError> {
        let mut session = self.session.lock().await;
        if session.as_ref().is_some_and(|s| s.key == room_key) {
            debug!("Already in room {room_key}");
            return Ok(());
        }
        if let Some(previous) = session.take() {
            if let Err(e) = self.teardown(previous).await {
                warn!("Leaving previous room failed: {e}");
            }
        }

        let topic_name = self.topic_for(room_key);
        let topic = self.host.join_topic(&topic_name)?;
        let subscription = topic.subscribe()?;

        *self.room.write() = Some(Room::new(room_key, topic_name));
        let cancel = self.shutdown.child();
        let task = tokio::spawn(receive_loop(
            Arc::clone(&self.room),
            subscription,
            cancel.clone(),
        ));
        info!("Joined room {room_key}");

        tokio::time::sleep(self.join_grace).await;
        let me = Member::idle(self.host.peer_id().as_str(), self.display_name.as_str());
        if let Err(e) = publish(&topic, &Message::join(me, room_key)) {
            warn!("Announcing join to room {room_key} failed: {e}");
        }

        *session = Some(Session {
            key: room_key.to_string(),
            topic,
            cancel,
            task,
        });
        Ok(())
    }

    /// Leave the current room. Does nothing when not in a room.
    ///
    /// The room is always torn down; an error only reports that the Leave
    /// message could not be published.
    pub async fn leave_room(&self) -> Result<(), NetworkError> {
        let mut session = self.session.lock().await;
        match session.take() {
            Some(current) => self.teardown(current).await,
            None => Ok(()),
        }
    }

    async fn teardown(&self, session: Session) -> Result<(), NetworkError> {
        let me = Member::idle(self.host.peer_id().as_str(), self.display_name.as_str());
        let published = publish(&session.topic, &Message::leave(me, session.key.as_str()));

        session.cancel.trigger();
        if let Err(e) = session.task.await {
            warn!("Room receive loop ended abnormally: {e}");
        }
        session.topic.close();
        *self.room.write() = None;
        info!("Left room {}", session.key);

        published.map(|_| ())
    }

    /// Publish `member` as this node's current state.
    pub async fn broadcast_state(&self, member: Member) -> Result<usize, NetworkError> {
        let session = self.session.lock().await;
        let Some(current) = session.as_ref() else {
            return Err(NetworkError::NotInRoom);
        };
        publish(&current.topic, &Message::state_update(member))
    }

    /// Copy of the member map, or `None` when not in a room.
    pub fn members(&self) -> Option<HashMap<String, Member>> {
        self.room.read().as_ref().map(|room| room.members.clone())
    }

    /// Apply a message received on `topic`. Returns `false` if it was not
    /// meant for the current room.
    pub(crate) fn handle_message(&self, topic: &str, message: &Message) -> bool {
        apply_to(&self.room, topic, message)
    }

    /// Leave the current room and stop every receive loop.
    pub async fn close(&self) {
        if let Err(e) = self.leave_room().await {
            debug!("Leave on close failed: {e}");
        }
        self.shutdown.trigger();
    }
}

fn publish(topic: &Topic, message: &Message) -> Result<usize, NetworkError> {
    topic.publish(message.encode()?)
}

fn apply_to(room: &RwLock<Option<Room>>, topic: &str, message: &Message) -> bool {
    let mut guard = room.write();
    match guard.as_mut() {
        Some(room) if room.topic == topic => {
            room.apply(message);
            true
        }
        _ => false,
    }
}

async fn receive_loop(
    room: Arc<RwLock<Option<Room>>>,
    mut subscription: Subscription,
    cancel: Shutdown,
) {
    loop {
        let inbound = tokio::select! {
            next = subscription.next() => match next {
                Some(inbound) => inbound,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        match Message::decode(&inbound.data) {
            Ok(message) => {
                let member = message.member();
                debug!(
                    "Received {} for {} ({}) from {}",
                    message.kind().as_str(),
                    member.id,
                    member.name,
                    inbound.received_from
                );
                apply_to(&room, &inbound.topic, &message);
            }
            Err(e) => warn!("Dropping invalid room message from {}: {e}", inbound.origin),
        }
    }
    debug!("Receive loop for {} finished", subscription.topic());
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
