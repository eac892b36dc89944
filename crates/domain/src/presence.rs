use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{RwLock, mpsc};

use crate::DomainResult;
use crate::error::DomainError;
use crate::ports::BoxFuture;
use crate::ports::realtime::{FanoutGateway, FanoutTarget};

pub const EVENT_ONLINE_USERS: &str = "online-users";
pub const EVENT_ERROR: &str = "error";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Messaging,
    Notifications,
    Realtime,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Messaging, Channel::Notifications, Channel::Realtime];

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Messaging => "messaging",
            Channel::Notifications => "notifications",
            Channel::Realtime => "realtime",
        }
    }
}

/// Wire envelope shared by every realtime channel: `{"event": ..., "data": ...}`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct OutboundEvent {
    pub event: String,
    pub data: Value,
}

impl OutboundEvent {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EVENT_ERROR, json!({ "message": message.into() }))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Registered,
    Disconnected,
}

/// A socket that finished the transport upgrade but has not been admitted yet.
#[derive(Clone, Debug)]
pub struct PendingConnection {
    pub channel: Channel,
    pub user_id: Option<String>,
}

impl PendingConnection {
    pub fn new(channel: Channel, user_id: Option<String>) -> Self {
        Self { channel, user_id }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::Connecting
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registration {
    pub connection_id: u64,
    pub channel: Channel,
    pub user_id: String,
    /// First live handle for this user on this channel.
    pub first_for_user: bool,
    /// First live handle for this user on any channel.
    pub first_on_any_channel: bool,
}

impl Registration {
    pub fn state(&self) -> ConnectionState {
        ConnectionState::Registered
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Disconnection {
    pub removed: bool,
    pub last_for_user: bool,
    pub last_on_any_channel: bool,
}

impl Disconnection {
    pub fn state(&self) -> ConnectionState {
        ConnectionState::Disconnected
    }
}

struct ConnectionEntry {
    channel: Channel,
    user_id: String,
    sender: mpsc::UnboundedSender<OutboundEvent>,
    rooms: HashSet<String>,
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<u64, ConnectionEntry>,
    by_user: HashMap<(Channel, String), HashSet<u64>>,
    rooms: HashMap<(Channel, String), HashSet<u64>>,
}

impl RegistryState {
    fn user_handle_count(&self, user_id: &str) -> usize {
        Channel::ALL
            .iter()
            .map(|channel| {
                self.by_user
                    .get(&(*channel, user_id.to_string()))
                    .map_or(0, HashSet::len)
            })
            .sum()
    }

    fn send(&self, connection_id: u64, event: &OutboundEvent) -> bool {
        self.connections
            .get(&connection_id)
            .is_some_and(|entry| entry.sender.send(event.clone()).is_ok())
    }
}

/// Process-local map from `(channel, user)` to live connection handles plus
/// room subscriptions. Every mutation happens under one write lock and no
/// critical section awaits anything but the lock itself.
#[derive(Clone, Default)]
pub struct PresenceRegistry {
    state: Arc<RwLock<RegistryState>>,
    next_connection_id: Arc<AtomicU64>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        pending: PendingConnection,
        sender: mpsc::UnboundedSender<OutboundEvent>,
    ) -> DomainResult<Registration> {
        let user_id = pending
            .user_id
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                DomainError::Validation("connection requires an authenticated identity".into())
            })?;

        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut state = self.state.write().await;
        let first_on_any_channel = state.user_handle_count(&user_id) == 0;
        let handles = state
            .by_user
            .entry((pending.channel, user_id.clone()))
            .or_default();
        let first_for_user = handles.is_empty();
        handles.insert(connection_id);
        state.connections.insert(
            connection_id,
            ConnectionEntry {
                channel: pending.channel,
                user_id: user_id.clone(),
                sender,
                rooms: HashSet::new(),
            },
        );

        Ok(Registration {
            connection_id,
            channel: pending.channel,
            user_id,
            first_for_user,
            first_on_any_channel,
        })
    }

    /// Removes the handle and its room subscriptions. Calling it twice for the
    /// same registration is harmless.
    pub async fn unregister(&self, registration: &Registration) -> Disconnection {
        let mut state = self.state.write().await;
        let Some(entry) = state.connections.remove(&registration.connection_id) else {
            return Disconnection::default();
        };

        for room in &entry.rooms {
            let key = (entry.channel, room.clone());
            if let Some(members) = state.rooms.get_mut(&key) {
                members.remove(&registration.connection_id);
                if members.is_empty() {
                    state.rooms.remove(&key);
                }
            }
        }

        let user_key = (entry.channel, entry.user_id.clone());
        let mut last_for_user = false;
        if let Some(handles) = state.by_user.get_mut(&user_key) {
            handles.remove(&registration.connection_id);
            if handles.is_empty() {
                state.by_user.remove(&user_key);
                last_for_user = true;
            }
        }
        let last_on_any_channel = state.user_handle_count(&entry.user_id) == 0;

        Disconnection {
            removed: true,
            last_for_user,
            last_on_any_channel,
        }
    }

    /// Returns false when the connection is unknown or already in the room.
    pub async fn join_room(&self, connection_id: u64, room: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(entry) = state.connections.get_mut(&connection_id) else {
            return false;
        };
        if !entry.rooms.insert(room.to_string()) {
            return false;
        }
        let channel = entry.channel;
        state
            .rooms
            .entry((channel, room.to_string()))
            .or_default()
            .insert(connection_id);
        true
    }

    pub async fn leave_room(&self, connection_id: u64, room: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(entry) = state.connections.get_mut(&connection_id) else {
            return false;
        };
        if !entry.rooms.remove(room) {
            return false;
        }
        let key = (entry.channel, room.to_string());
        if let Some(members) = state.rooms.get_mut(&key) {
            members.remove(&connection_id);
            if members.is_empty() {
                state.rooms.remove(&key);
            }
        }
        true
    }

    pub async fn emit_to_user(&self, channel: Channel, user_id: &str, event: OutboundEvent) -> usize {
        self.deliver(
            channel,
            &FanoutTarget::User {
                user_id: user_id.to_string(),
            },
            &event,
        )
        .await
    }

    pub async fn emit_to_room(&self, channel: Channel, room: &str, event: OutboundEvent) -> usize {
        self.deliver(
            channel,
            &FanoutTarget::Room {
                room: room.to_string(),
                except_user: None,
            },
            &event,
        )
        .await
    }

    pub async fn broadcast(&self, channel: Channel, event: OutboundEvent) -> usize {
        self.deliver(channel, &FanoutTarget::Channel, &event).await
    }

    /// Pushes `event` to every matching local handle and returns how many
    /// accepted it. A target with no handles is a silent no-op.
    pub async fn deliver(
        &self,
        channel: Channel,
        target: &FanoutTarget,
        event: &OutboundEvent,
    ) -> usize {
        let state = self.state.read().await;
        let connection_ids: Vec<u64> = match target {
            FanoutTarget::User { user_id } => state
                .by_user
                .get(&(channel, user_id.clone()))
                .map(|handles| handles.iter().copied().collect())
                .unwrap_or_default(),
            FanoutTarget::Room { room, except_user } => state
                .rooms
                .get(&(channel, room.clone()))
                .map(|members| {
                    members
                        .iter()
                        .copied()
                        .filter(|connection_id| {
                            let Some(except_user) = except_user.as_deref() else {
                                return true;
                            };
                            state
                                .connections
                                .get(connection_id)
                                .is_some_and(|entry| entry.user_id != except_user)
                        })
                        .collect()
                })
                .unwrap_or_default(),
            FanoutTarget::Channel => state
                .connections
                .iter()
                .filter(|(_, entry)| entry.channel == channel)
                .map(|(connection_id, _)| *connection_id)
                .collect(),
        };

        connection_ids
            .into_iter()
            .filter(|connection_id| state.send(*connection_id, event))
            .count()
    }

    pub async fn online_users(&self, channel: Channel) -> Vec<String> {
        let state = self.state.read().await;
        let users: BTreeSet<String> = state
            .by_user
            .keys()
            .filter(|(entry_channel, _)| *entry_channel == channel)
            .map(|(_, user_id)| user_id.clone())
            .collect();
        users.into_iter().collect()
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        self.state.read().await.user_handle_count(user_id) > 0
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }
}

impl FanoutGateway for PresenceRegistry {
    fn emit(&self, channel: Channel, target: FanoutTarget, event: OutboundEvent) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.deliver(channel, &target, &event).await;
        })
    }
}

pub fn online_users_event(user_ids: Vec<String>) -> OutboundEvent {
    OutboundEvent::new(EVENT_ONLINE_USERS, json!({ "userIds": user_ids }))
}
