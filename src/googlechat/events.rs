use anyhow::{Result, anyhow};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use tracing::debug;

use super::{WireMessage, WireUser, parse_timestamp};
use crate::bridge::event::{
    BridgeEvent, EventKind, Membership, MessagePayload, Network, parent_resource,
};
use crate::web::metrics::Metrics;

/// Receives Google Chat event deliveries and queues them for the orchestrator.
///
/// Accepts both the interaction payloads sent to a Chat app endpoint (`MESSAGE`,
/// `ADDED_TO_SPACE`, ..) and Workspace Events (`google.workspace.chat.*`).
pub struct ChatEventListener {
    sender: mpsc::Sender<BridgeEvent>,
    bot_user_id: String,
    webhook_token: SecretString,
}

impl ChatEventListener {
    pub fn new(
        sender: mpsc::Sender<BridgeEvent>,
        bot_user_id: impl Into<String>,
        webhook_token: SecretString,
    ) -> Self {
        Self {
            sender,
            bot_user_id: bot_user_id.into(),
            webhook_token,
        }
    }

    /// An empty configured token accepts nothing.
    pub fn verify_token(&self, provided: Option<&str>) -> bool {
        let expected = self.webhook_token.expose_secret();
        match provided {
            Some(token) if !expected.is_empty() => {
                token.as_bytes().ct_eq(expected.as_bytes()).into()
            }
            _ => false,
        }
    }

    pub async fn handle(&self, body: &Value) -> Result<usize> {
        let events = self.parse(body);
        let count = events.len();
        for event in events {
            Metrics::inc_events_received(Network::GoogleChat);
            self.sender
                .send(event)
                .await
                .map_err(|_| anyhow!("google chat event channel closed"))?;
        }
        Ok(count)
    }

    pub fn parse(&self, body: &Value) -> Vec<BridgeEvent> {
        let event_type = body
            .get("type")
            .or_else(|| body.get("ce-type"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let data = body.get("data").unwrap_or(body);
        let event_time = body
            .get("eventTime")
            .or_else(|| body.get("time"))
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

        let parsed = match event_type {
            "MESSAGE" | "google.workspace.chat.message.v1.created" => {
                message_event(data, event_time, |message| {
                    EventKind::Message(MessagePayload::Chat(message))
                })
            }
            "google.workspace.chat.message.v1.updated" => {
                message_event(data, event_time, |message| EventKind::Edit {
                    target: message.name.clone(),
                    payload: MessagePayload::Chat(message),
                })
            }
            "google.workspace.chat.message.v1.deleted" => {
                message_event(data, event_time, |message| EventKind::Redaction {
                    target: message.name,
                })
            }
            "google.workspace.chat.reaction.v1.created" => reaction_event(data, event_time, true),
            "google.workspace.chat.reaction.v1.deleted" => reaction_event(data, event_time, false),
            "ADDED_TO_SPACE" => self.bot_membership(body, event_time, Membership::Join),
            "REMOVED_FROM_SPACE" => self.bot_membership(body, event_time, Membership::Leave),
            "google.workspace.chat.membership.v1.created"
            | "google.workspace.chat.membership.v1.deleted" => {
                membership_event(data, event_time, event_type.ends_with("created"))
            }
            "google.workspace.chat.space.v1.updated" => space_update_event(data, event_time),
            "READ_STATE_UPDATED" => read_state_event(body),
            other => {
                debug!("ignoring google chat event type={}", other);
                None
            }
        };
        parsed.into_iter().collect()
    }

    fn bot_membership(
        &self,
        body: &Value,
        event_time: i64,
        membership: Membership,
    ) -> Option<BridgeEvent> {
        let space = body.get("space")?.get("name")?.as_str()?.to_string();
        let actor = user_name(body.get("user"));
        Some(BridgeEvent {
            source: Network::GoogleChat,
            event_id: format!("{space}/membership/{event_time}"),
            conversation: space,
            sender: actor,
            timestamp: event_time,
            kind: EventKind::Membership {
                user: self.bot_user_id.clone(),
                membership,
            },
        })
    }
}

fn message_event<F>(data: &Value, event_time: i64, kind: F) -> Option<BridgeEvent>
where
    F: FnOnce(crate::bridge::event::ChatMessage) -> EventKind,
{
    let wire: WireMessage = serde_json::from_value(data.get("message")?.clone()).ok()?;
    let conversation = data
        .get("space")
        .and_then(|space| space.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| parent_resource(&wire.name, "messages"))?;
    let message = wire.into_chat_message();
    let timestamp = if message.create_time > 0 {
        message.create_time
    } else {
        event_time
    };
    Some(BridgeEvent {
        source: Network::GoogleChat,
        conversation,
        sender: message.sender.name.clone(),
        event_id: message.name.clone(),
        timestamp,
        kind: kind(message),
    })
}

fn reaction_event(data: &Value, event_time: i64, added: bool) -> Option<BridgeEvent> {
    let reaction = data.get("reaction")?;
    let name = reaction.get("name")?.as_str()?.to_string();
    let target = parent_resource(&name, "reactions")?;
    let conversation = parent_resource(&target, "messages")?;
    let kind = if added {
        EventKind::Reaction {
            target,
            key: reaction
                .get("emoji")
                .and_then(|emoji| emoji.get("unicode"))
                .and_then(Value::as_str)?
                .to_string(),
        }
    } else {
        EventKind::ReactionRemoved {
            reaction_id: name.clone(),
        }
    };
    Some(BridgeEvent {
        source: Network::GoogleChat,
        conversation,
        sender: user_name(reaction.get("user")),
        event_id: name,
        timestamp: event_time,
        kind,
    })
}

fn membership_event(data: &Value, event_time: i64, joined: bool) -> Option<BridgeEvent> {
    let membership = data.get("membership")?;
    let name = membership.get("name")?.as_str()?.to_string();
    let conversation = parent_resource(&name, "members")?;
    Some(BridgeEvent {
        source: Network::GoogleChat,
        conversation,
        sender: String::new(),
        event_id: format!("{name}/{event_time}"),
        timestamp: event_time,
        kind: EventKind::Membership {
            user: user_name(membership.get("member")),
            membership: if joined {
                Membership::Join
            } else {
                Membership::Leave
            },
        },
    })
}

fn space_update_event(data: &Value, event_time: i64) -> Option<BridgeEvent> {
    let space = data.get("space")?;
    let conversation = space.get("name")?.as_str()?.to_string();
    Some(BridgeEvent {
        source: Network::GoogleChat,
        event_id: format!("{conversation}/update/{event_time}"),
        conversation,
        sender: String::new(),
        timestamp: event_time,
        kind: EventKind::MetadataChange {
            name: space
                .get("displayName")
                .and_then(Value::as_str)
                .map(str::to_string),
            topic: space
                .get("spaceDetails")
                .and_then(|details| details.get("description"))
                .and_then(Value::as_str)
                .map(str::to_string),
        },
    })
}

/// `READ_STATE_UPDATED` is the bridge's own envelope for read positions polled from
/// `spaceReadState`: `{type, space: {name}, user: {name}, lastReadTime}`.
fn read_state_event(body: &Value) -> Option<BridgeEvent> {
    let conversation = body.get("space")?.get("name")?.as_str()?.to_string();
    let read_time = body
        .get("lastReadTime")
        .and_then(Value::as_str)
        .and_then(parse_timestamp)?;
    Some(BridgeEvent {
        source: Network::GoogleChat,
        event_id: format!("{conversation}/read/{read_time}"),
        conversation,
        sender: user_name(body.get("user")),
        timestamp: read_time,
        kind: EventKind::ReadReceipt { up_to: None },
    })
}

fn user_name(user: Option<&Value>) -> String {
    user.cloned()
        .and_then(|user| serde_json::from_value::<WireUser>(user).ok())
        .map(|user| user.name)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::ChatEventListener;
    use crate::bridge::event::{EventKind, Membership, MessagePayload};

    fn listener(token: &str) -> (ChatEventListener, mpsc::Receiver<crate::bridge::BridgeEvent>) {
        let (tx, rx) = mpsc::channel(8);
        (
            ChatEventListener::new(tx, "users/100", SecretString::from(token.to_string())),
            rx,
        )
    }

    #[test]
    fn interaction_message_becomes_message_event() {
        let (listener, _rx) = listener("");
        let events = listener.parse(&json!({
            "type": "MESSAGE",
            "eventTime": "2024-01-01T00:00:00Z",
            "space": { "name": "spaces/AAA" },
            "message": {
                "name": "spaces/AAA/messages/m1",
                "text": "hi",
                "sender": { "name": "users/1", "displayName": "Alice" },
                "createTime": "2024-01-01T00:00:00Z"
            }
        }));
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.conversation, "spaces/AAA");
        assert_eq!(event.sender, "users/1");
        assert_eq!(event.event_id, "spaces/AAA/messages/m1");
        assert!(matches!(event.kind, EventKind::Message(MessagePayload::Chat(_))));
    }

    #[test]
    fn workspace_reaction_events_resolve_their_targets() {
        let (listener, _rx) = listener("");
        let created = listener.parse(&json!({
            "type": "google.workspace.chat.reaction.v1.created",
            "data": { "reaction": {
                "name": "spaces/AAA/messages/m1/reactions/r1",
                "user": { "name": "users/2" },
                "emoji": { "unicode": "👍" }
            } }
        }));
        assert_eq!(created[0].conversation, "spaces/AAA");
        assert_eq!(
            created[0].kind,
            EventKind::Reaction {
                target: "spaces/AAA/messages/m1".to_string(),
                key: "👍".to_string()
            }
        );

        let deleted = listener.parse(&json!({
            "type": "google.workspace.chat.reaction.v1.deleted",
            "data": { "reaction": { "name": "spaces/AAA/messages/m1/reactions/r1" } }
        }));
        assert_eq!(
            deleted[0].kind,
            EventKind::ReactionRemoved {
                reaction_id: "spaces/AAA/messages/m1/reactions/r1".to_string()
            }
        );
    }

    #[test]
    fn deletions_and_space_changes() {
        let (listener, _rx) = listener("");
        let deleted = listener.parse(&json!({
            "type": "google.workspace.chat.message.v1.deleted",
            "data": { "message": { "name": "spaces/AAA/messages/m1" } }
        }));
        assert_eq!(
            deleted[0].kind,
            EventKind::Redaction {
                target: "spaces/AAA/messages/m1".to_string()
            }
        );

        let renamed = listener.parse(&json!({
            "type": "google.workspace.chat.space.v1.updated",
            "data": { "space": { "name": "spaces/AAA", "displayName": "Team" } }
        }));
        assert_eq!(
            renamed[0].kind,
            EventKind::MetadataChange {
                name: Some("Team".to_string()),
                topic: None
            }
        );
    }

    #[test]
    fn bot_added_to_space_is_a_join() {
        let (listener, _rx) = listener("");
        let events = listener.parse(&json!({
            "type": "ADDED_TO_SPACE",
            "space": { "name": "spaces/AAA" },
            "user": { "name": "users/1" }
        }));
        assert_eq!(
            events[0].kind,
            EventKind::Membership {
                user: "users/100".to_string(),
                membership: Membership::Join
            }
        );
    }

    #[test]
    fn unknown_and_typing_events_are_ignored() {
        let (listener, _rx) = listener("");
        assert!(listener.parse(&json!({ "type": "CARD_CLICKED" })).is_empty());
        assert!(listener.parse(&json!({ "type": "TYPING" })).is_empty());
    }

    #[test]
    fn token_verification() {
        let (unset, _rx) = listener("");
        assert!(!unset.verify_token(None));
        assert!(!unset.verify_token(Some("")));
        let (guarded, _rx) = listener("secret");
        assert!(guarded.verify_token(Some("secret")));
        assert!(!guarded.verify_token(Some("wrong")));
        assert!(!guarded.verify_token(None));
    }

    #[tokio::test]
    async fn handle_queues_parsed_events() {
        let (listener, mut rx) = listener("");
        let queued = listener
            .handle(&json!({
                "type": "READ_STATE_UPDATED",
                "space": { "name": "spaces/AAA" },
                "user": { "name": "users/1" },
                "lastReadTime": "2024-01-01T00:00:00Z"
            }))
            .await
            .expect("handled");
        assert_eq!(queued, 1);
        let event = rx.recv().await.expect("queued");
        assert_eq!(event.kind, EventKind::ReadReceipt { up_to: None });
        assert_eq!(event.timestamp, 1_704_067_200_000);
    }
}
