use std::time::Duration;

use chorus_domain::ports::BoxFuture;
use chorus_domain::ports::realtime::{FanoutError, FanoutGateway, FanoutTarget};
use chorus_domain::presence::{Channel, OutboundEvent, PresenceRegistry};
use chorus_domain::util::uuid_v7_without_dashes;
use futures_util::StreamExt;
use metrics::counter;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

const FANOUT_PUBLISHED_TOTAL: &str = "chorus_fanout_published_total";
const FANOUT_RECEIVED_TOTAL: &str = "chorus_fanout_received_total";
const FANOUT_ERRORS_TOTAL: &str = "chorus_fanout_errors_total";
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// What crosses the wire between instances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FanoutEnvelope {
    pub origin: String,
    pub channel: Channel,
    pub target: FanoutTarget,
    pub event: OutboundEvent,
}

impl FanoutEnvelope {
    pub fn encode(&self) -> Result<String, FanoutError> {
        serde_json::to_string(self).map_err(|err| FanoutError::Serialization(err.to_string()))
    }

    pub fn decode(payload: &str) -> Result<Self, FanoutError> {
        serde_json::from_str(payload).map_err(|err| FanoutError::Serialization(err.to_string()))
    }
}

/// Delivers locally right away, then publishes so other instances can reach
/// their own connections. Envelopes carrying our own origin are skipped on
/// the way back in.
#[derive(Clone)]
pub struct RedisFanoutBridge {
    client: redis::Client,
    manager: ConnectionManager,
    channel_name: String,
    origin: String,
    local: PresenceRegistry,
}

impl RedisFanoutBridge {
    pub async fn connect(
        redis_url: &str,
        channel_name: impl Into<String>,
        local: PresenceRegistry,
    ) -> Result<Self, FanoutError> {
        let client = redis::Client::open(redis_url)
            .map_err(|err| FanoutError::Unavailable(err.to_string()))?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(|err| FanoutError::Unavailable(err.to_string()))?;
        Ok(Self {
            client,
            manager,
            channel_name: channel_name.into(),
            origin: uuid_v7_without_dashes(),
            local,
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    async fn publish(&self, envelope: &FanoutEnvelope) -> Result<(), FanoutError> {
        let payload = envelope.encode()?;
        let mut manager = self.manager.clone();
        let _: i64 = manager
            .publish(&self.channel_name, payload)
            .await
            .map_err(|err| FanoutError::Unavailable(err.to_string()))?;
        Ok(())
    }

    /// Spawns the subscriber loop. It resubscribes after a dropped
    /// connection and runs until the task is aborted.
    pub fn spawn_subscriber(&self) -> JoinHandle<()> {
        let bridge = self.clone();
        tokio::spawn(async move {
            loop {
                if let Err(err) = bridge.subscribe_once().await {
                    counter!(FANOUT_ERRORS_TOTAL, "stage" => "subscribe").increment(1);
                    tracing::warn!(
                        error = %err,
                        channel = %bridge.channel_name,
                        "fanout subscription dropped; resubscribing"
                    );
                }
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            }
        })
    }

    async fn subscribe_once(&self) -> Result<(), FanoutError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|err| FanoutError::Unavailable(err.to_string()))?;
        pubsub
            .subscribe(&self.channel_name)
            .await
            .map_err(|err| FanoutError::Unavailable(err.to_string()))?;
        tracing::info!(channel = %self.channel_name, origin = %self.origin, "fanout subscriber ready");

        let mut messages = pubsub.on_message();
        while let Some(message) = messages.next().await {
            let payload: String = match message.get_payload() {
                Ok(payload) => payload,
                Err(err) => {
                    counter!(FANOUT_ERRORS_TOTAL, "stage" => "payload").increment(1);
                    tracing::warn!(error = %err, "fanout payload was not a string");
                    continue;
                }
            };
            self.handle_payload(&payload).await;
        }
        Err(FanoutError::Unavailable("pubsub stream ended".into()))
    }

    /// Returns how many local handles received the envelope's event.
    pub async fn handle_payload(&self, payload: &str) -> usize {
        let envelope = match FanoutEnvelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                counter!(FANOUT_ERRORS_TOTAL, "stage" => "decode").increment(1);
                tracing::warn!(error = %err, "dropping malformed fanout envelope");
                return 0;
            }
        };
        if envelope.origin == self.origin {
            return 0;
        }
        counter!(FANOUT_RECEIVED_TOTAL, "channel" => envelope.channel.as_str()).increment(1);
        self.local
            .deliver(envelope.channel, &envelope.target, &envelope.event)
            .await
    }
}

impl FanoutGateway for RedisFanoutBridge {
    fn emit(
        &self,
        channel: Channel,
        target: FanoutTarget,
        event: OutboundEvent,
    ) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.local.deliver(channel, &target, &event).await;
            let envelope = FanoutEnvelope {
                origin: self.origin.clone(),
                channel,
                target,
                event,
            };
            match self.publish(&envelope).await {
                Ok(()) => {
                    counter!(FANOUT_PUBLISHED_TOTAL, "channel" => channel.as_str()).increment(1);
                }
                Err(err) => {
                    counter!(FANOUT_ERRORS_TOTAL, "stage" => "publish").increment(1);
                    tracing::warn!(
                        error = %err,
                        channel = channel.as_str(),
                        event = %envelope.event.event,
                        "fanout publish failed; delivered locally only"
                    );
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_wire_shape_is_tagged() {
        let envelope = FanoutEnvelope {
            origin: "node-a".into(),
            channel: Channel::Notifications,
            target: FanoutTarget::User {
                user_id: "u1".into(),
            },
            event: OutboundEvent::new("unread-count", json!({ "count": 3 })),
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["target"]["kind"], "user");
        assert_eq!(value["target"]["user_id"], "u1");
        assert_eq!(value["event"]["event"], "unread-count");

        let decoded = FanoutEnvelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn malformed_envelope_is_a_serialization_error() {
        assert!(matches!(
            FanoutEnvelope::decode("{\"origin\":1}"),
            Err(FanoutError::Serialization(_))
        ));
    }
}
