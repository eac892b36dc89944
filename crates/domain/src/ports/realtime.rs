use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ports::BoxFuture;
use crate::presence::{Channel, OutboundEvent};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FanoutTarget {
    User {
        user_id: String,
    },
    Room {
        room: String,
        except_user: Option<String>,
    },
    /// Every connection on the channel.
    Channel,
}

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("fanout transport unavailable: {0}")]
    Unavailable(String),
    #[error("fanout serialization error: {0}")]
    Serialization(String),
}

/// Best-effort delivery of events to live connections. Absent recipients are
/// not an error; callers never learn whether anybody received the event.
pub trait FanoutGateway: Send + Sync {
    fn emit(
        &self,
        channel: Channel,
        target: FanoutTarget,
        event: OutboundEvent,
    ) -> BoxFuture<'_, ()>;

    fn emit_to_user(
        &self,
        channel: Channel,
        user_id: &str,
        event: OutboundEvent,
    ) -> BoxFuture<'_, ()> {
        self.emit(
            channel,
            FanoutTarget::User {
                user_id: user_id.to_string(),
            },
            event,
        )
    }

    fn emit_to_room(&self, channel: Channel, room: &str, event: OutboundEvent) -> BoxFuture<'_, ()> {
        self.emit(
            channel,
            FanoutTarget::Room {
                room: room.to_string(),
                except_user: None,
            },
            event,
        )
    }
}
