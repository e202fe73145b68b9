use std::collections::VecDeque;

use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::bridge::event::{BridgeEvent, EventKind, MatrixMessage, Membership, MessagePayload, Network};
use crate::web::metrics::Metrics;

const SEEN_TRANSACTIONS: usize = 128;

/// Event as delivered in an appservice transaction, before normalization.
#[derive(Debug, Clone)]
pub struct MatrixEvent {
    pub event_id: Option<String>,
    pub event_type: String,
    pub room_id: String,
    pub sender: String,
    pub state_key: Option<String>,
    pub content: Option<Value>,
    pub redacts: Option<String>,
    pub timestamp: Option<i64>,
}

impl MatrixEvent {
    pub fn from_json(event: &Value) -> Option<Self> {
        Some(Self {
            event_id: str_field(event, "event_id"),
            event_type: str_field(event, "type")?,
            room_id: str_field(event, "room_id")?,
            sender: str_field(event, "sender")?,
            state_key: str_field(event, "state_key"),
            content: event.get("content").cloned(),
            redacts: str_field(event, "redacts")
                .or_else(|| event.get("content").and_then(|c| str_field(c, "redacts"))),
            timestamp: event.get("origin_server_ts").and_then(Value::as_i64),
        })
    }
}

/// Turns appservice transactions into canonical bridge events for the orchestrator.
pub struct MatrixEventProcessor {
    sender: mpsc::Sender<BridgeEvent>,
    age_limit_ms: i64,
    seen: Mutex<VecDeque<String>>,
}

impl MatrixEventProcessor {
    pub fn new(sender: mpsc::Sender<BridgeEvent>, age_limit_ms: i64) -> Self {
        Self {
            sender,
            age_limit_ms,
            seen: Mutex::new(VecDeque::new()),
        }
    }

    /// Returns the number of events queued. Replayed transaction ids queue nothing.
    pub async fn process_transaction(&self, txn_id: &str, body: &Value) -> Result<usize> {
        {
            let mut seen = self.seen.lock();
            if seen.iter().any(|id| id == txn_id) {
                debug!("skipping replayed transaction txn_id={}", txn_id);
                return Ok(0);
            }
            seen.push_back(txn_id.to_string());
            if seen.len() > SEEN_TRANSACTIONS {
                seen.pop_front();
            }
        }

        let mut events = Vec::new();
        if let Some(timeline) = body.get("events").and_then(Value::as_array) {
            for raw in timeline {
                let Some(event) = MatrixEvent::from_json(raw) else {
                    continue;
                };
                if !Self::check_event_age(&event, self.age_limit_ms) {
                    continue;
                }
                if let Some(parsed) = Self::parse_event(event) {
                    events.push(parsed);
                }
            }
        }

        let ephemeral = body
            .get("ephemeral")
            .or_else(|| body.get("de.sorunome.msc2409.ephemeral"))
            .and_then(Value::as_array);
        if let Some(ephemeral) = ephemeral {
            for raw in ephemeral {
                events.extend(Self::parse_ephemeral(raw));
            }
        }

        let count = events.len();
        for event in events {
            Metrics::inc_events_received(Network::Matrix);
            self.sender
                .send(event)
                .await
                .map_err(|_| anyhow!("matrix event channel closed"))?;
        }
        Ok(count)
    }

    fn check_event_age(event: &MatrixEvent, age_limit_ms: i64) -> bool {
        if let Some(ts) = event.timestamp {
            let now = chrono::Utc::now().timestamp_millis();
            if ts > now {
                debug!("event timestamp is in the future, allowing event_id={:?}", event.event_id);
                return true;
            }
            let age = now - ts;
            if age > age_limit_ms {
                info!(
                    "skipping event due to age {}ms > {}ms event_id={:?} room_id={} type={}",
                    age, age_limit_ms, event.event_id, event.room_id, event.event_type
                );
                return false;
            }
        }
        true
    }

    pub fn parse_event(event: MatrixEvent) -> Option<BridgeEvent> {
        let content = event.content.clone().unwrap_or(Value::Null);
        let relates_to = content.get("m.relates_to");
        let rel_type = relates_to.and_then(|r| str_field(r, "rel_type"));
        let rel_target = relates_to.and_then(|r| str_field(r, "event_id"));

        let kind = match event.event_type.as_str() {
            "m.room.message" | "m.sticker" => {
                if rel_type.as_deref() == Some("m.replace") {
                    let new_content = content.get("m.new_content").unwrap_or(&content);
                    EventKind::Edit {
                        target: rel_target?,
                        payload: MessagePayload::Matrix(parse_message(
                            &event.event_type,
                            new_content,
                            None,
                        )),
                    }
                } else {
                    EventKind::Message(MessagePayload::Matrix(parse_message(
                        &event.event_type,
                        &content,
                        relates_to,
                    )))
                }
            }
            "m.reaction" if rel_type.as_deref() == Some("m.annotation") => EventKind::Reaction {
                target: rel_target?,
                key: relates_to.and_then(|r| str_field(r, "key"))?,
            },
            "m.room.redaction" => EventKind::Redaction {
                target: event.redacts.clone()?,
            },
            "m.room.member" => EventKind::Membership {
                user: event.state_key.clone()?,
                membership: Membership::parse(&str_field(&content, "membership")?)?,
            },
            "m.room.name" => EventKind::MetadataChange {
                name: str_field(&content, "name"),
                topic: None,
            },
            "m.room.topic" => EventKind::MetadataChange {
                name: None,
                topic: str_field(&content, "topic"),
            },
            other => {
                debug!("unhandled matrix event type: {}", other);
                return None;
            }
        };

        Some(BridgeEvent {
            source: Network::Matrix,
            conversation: event.room_id,
            sender: event.sender,
            event_id: event.event_id.unwrap_or_default(),
            timestamp: event
                .timestamp
                .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
            kind,
        })
    }

    pub fn parse_ephemeral(raw: &Value) -> Vec<BridgeEvent> {
        let Some(room_id) = str_field(raw, "room_id") else {
            return Vec::new();
        };
        let content = raw.get("content").cloned().unwrap_or(Value::Null);
        let now = chrono::Utc::now().timestamp_millis();

        match raw.get("type").and_then(Value::as_str) {
            Some("m.typing") => {
                let user_ids = content
                    .get("user_ids")
                    .and_then(Value::as_array)
                    .map(|ids| {
                        ids.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                vec![BridgeEvent {
                    source: Network::Matrix,
                    conversation: room_id,
                    sender: String::new(),
                    event_id: String::new(),
                    timestamp: now,
                    kind: EventKind::Typing { user_ids },
                }]
            }
            Some("m.receipt") => {
                let mut receipts = Vec::new();
                let Some(by_event) = content.as_object() else {
                    return receipts;
                };
                for (event_id, receipt_types) in by_event {
                    let Some(readers) = receipt_types.get("m.read").and_then(Value::as_object)
                    else {
                        continue;
                    };
                    for (user_id, data) in readers {
                        receipts.push(BridgeEvent {
                            source: Network::Matrix,
                            conversation: room_id.clone(),
                            sender: user_id.clone(),
                            event_id: String::new(),
                            timestamp: data.get("ts").and_then(Value::as_i64).unwrap_or(now),
                            kind: EventKind::ReadReceipt {
                                up_to: Some(event_id.clone()),
                            },
                        });
                    }
                }
                receipts
            }
            _ => Vec::new(),
        }
    }
}

fn parse_message(event_type: &str, content: &Value, relates_to: Option<&Value>) -> MatrixMessage {
    let msgtype = if event_type == "m.sticker" {
        "m.image".to_string()
    } else {
        str_field(content, "msgtype").unwrap_or_else(|| "m.text".to_string())
    };
    let formatted_body = (str_field(content, "format").as_deref()
        == Some("org.matrix.custom.html"))
    .then(|| str_field(content, "formatted_body"))
    .flatten();
    let thread_root = relates_to
        .filter(|r| str_field(r, "rel_type").as_deref() == Some("m.thread"))
        .and_then(|r| str_field(r, "event_id"));
    let reply_to = relates_to
        .filter(|r| r.get("is_falling_back").and_then(Value::as_bool) != Some(true))
        .and_then(|r| r.get("m.in_reply_to"))
        .and_then(|r| str_field(r, "event_id"));

    MatrixMessage {
        msgtype,
        body: str_field(content, "body").unwrap_or_default(),
        formatted_body,
        url: str_field(content, "url"),
        mimetype: content
            .get("info")
            .and_then(|info| str_field(info, "mimetype")),
        filename: str_field(content, "filename"),
        reply_to,
        thread_root,
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(ToOwned::to_owned)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;

    fn make_event(ts: Option<i64>) -> MatrixEvent {
        MatrixEvent {
            event_id: Some("$test".to_string()),
            event_type: "m.room.message".to_string(),
            room_id: "!room:example.org".to_string(),
            sender: "@user:example.org".to_string(),
            state_key: None,
            content: None,
            redacts: None,
            timestamp: ts,
        }
    }

    const AGE_LIMIT_MS: i64 = 900_000;

    #[test]
    fn check_event_age_allows_recent_events() {
        let now = chrono::Utc::now().timestamp_millis();
        assert!(MatrixEventProcessor::check_event_age(&make_event(Some(now)), AGE_LIMIT_MS));
    }

    #[test]
    fn check_event_age_rejects_old_events() {
        let old_ts = chrono::Utc::now().timestamp_millis() - 1_000_000;
        assert!(!MatrixEventProcessor::check_event_age(&make_event(Some(old_ts)), AGE_LIMIT_MS));
    }

    #[test]
    fn check_event_age_allows_events_without_timestamp() {
        assert!(MatrixEventProcessor::check_event_age(&make_event(None), AGE_LIMIT_MS));
    }

    #[test]
    fn check_event_age_allows_future_events() {
        let future_ts = chrono::Utc::now().timestamp_millis() + 60_000;
        assert!(MatrixEventProcessor::check_event_age(
            &make_event(Some(future_ts)),
            AGE_LIMIT_MS
        ));
    }

    fn parse(raw: Value) -> BridgeEvent {
        MatrixEventProcessor::parse_event(MatrixEvent::from_json(&raw).expect("well formed"))
            .expect("supported event")
    }

    #[test]
    fn formatted_message_with_reply() {
        let event = parse(json!({
            "type": "m.room.message",
            "event_id": "$m1",
            "room_id": "!room:example.org",
            "sender": "@alice:example.org",
            "origin_server_ts": 1_700_000_000_000i64,
            "content": {
                "msgtype": "m.text",
                "body": "hello **world**",
                "format": "org.matrix.custom.html",
                "formatted_body": "hello <strong>world</strong>",
                "m.relates_to": { "m.in_reply_to": { "event_id": "$parent" } }
            }
        }));
        let EventKind::Message(MessagePayload::Matrix(message)) = event.kind else {
            panic!("expected a matrix message");
        };
        assert_eq!(message.formatted_body.as_deref(), Some("hello <strong>world</strong>"));
        assert_eq!(message.reply_to.as_deref(), Some("$parent"));
        assert_eq!(event.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn thread_fallback_reply_is_not_a_reply() {
        let event = parse(json!({
            "type": "m.room.message",
            "event_id": "$m2",
            "room_id": "!room:example.org",
            "sender": "@alice:example.org",
            "content": {
                "msgtype": "m.text",
                "body": "in thread",
                "m.relates_to": {
                    "rel_type": "m.thread",
                    "event_id": "$root",
                    "is_falling_back": true,
                    "m.in_reply_to": { "event_id": "$root" }
                }
            }
        }));
        let EventKind::Message(MessagePayload::Matrix(message)) = event.kind else {
            panic!("expected a matrix message");
        };
        assert_eq!(message.thread_root.as_deref(), Some("$root"));
        assert_eq!(message.reply_to, None);
    }

    #[test]
    fn replace_relation_is_an_edit() {
        let event = parse(json!({
            "type": "m.room.message",
            "event_id": "$edit",
            "room_id": "!room:example.org",
            "sender": "@alice:example.org",
            "content": {
                "msgtype": "m.text",
                "body": "* fixed",
                "m.new_content": { "msgtype": "m.text", "body": "fixed" },
                "m.relates_to": { "rel_type": "m.replace", "event_id": "$orig" }
            }
        }));
        match event.kind {
            EventKind::Edit {
                target,
                payload: MessagePayload::Matrix(message),
            } => {
                assert_eq!(target, "$orig");
                assert_eq!(message.body, "fixed");
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn reactions_redactions_and_membership() {
        let reaction = parse(json!({
            "type": "m.reaction",
            "event_id": "$r",
            "room_id": "!room:example.org",
            "sender": "@alice:example.org",
            "content": { "m.relates_to": { "rel_type": "m.annotation", "event_id": "$m1", "key": "👍" } }
        }));
        assert_eq!(
            reaction.kind,
            EventKind::Reaction {
                target: "$m1".to_string(),
                key: "👍".to_string()
            }
        );

        let redaction = parse(json!({
            "type": "m.room.redaction",
            "event_id": "$x",
            "room_id": "!room:example.org",
            "sender": "@alice:example.org",
            "redacts": "$m1",
            "content": {}
        }));
        assert_eq!(
            redaction.kind,
            EventKind::Redaction {
                target: "$m1".to_string()
            }
        );

        let member = parse(json!({
            "type": "m.room.member",
            "event_id": "$j",
            "room_id": "!room:example.org",
            "sender": "@alice:example.org",
            "state_key": "@googlechatbot:example.org",
            "content": { "membership": "invite" }
        }));
        assert_eq!(
            member.kind,
            EventKind::Membership {
                user: "@googlechatbot:example.org".to_string(),
                membership: Membership::Invite
            }
        );
    }

    #[test]
    fn ephemeral_receipts_fan_out_per_reader() {
        let events = MatrixEventProcessor::parse_ephemeral(&json!({
            "type": "m.receipt",
            "room_id": "!room:example.org",
            "content": {
                "$m1": { "m.read": {
                    "@alice:example.org": { "ts": 10 },
                    "@bob:example.org": { "ts": 11 }
                } }
            }
        }));
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind
            == EventKind::ReadReceipt {
                up_to: Some("$m1".to_string())
            }));
    }

    #[tokio::test]
    async fn replayed_transactions_are_ignored() {
        let (tx, mut rx) = mpsc::channel(8);
        let processor = MatrixEventProcessor::new(tx, AGE_LIMIT_MS);
        let body = json!({
            "events": [{
                "type": "m.room.message",
                "event_id": "$m1",
                "room_id": "!room:example.org",
                "sender": "@alice:example.org",
                "content": { "msgtype": "m.text", "body": "hi" }
            }],
            "ephemeral": [{
                "type": "m.typing",
                "room_id": "!room:example.org",
                "content": { "user_ids": ["@alice:example.org"] }
            }]
        });

        assert_eq!(processor.process_transaction("txn1", &body).await.expect("first"), 2);
        assert_eq!(processor.process_transaction("txn1", &body).await.expect("replay"), 0);
        assert_eq!(rx.recv().await.expect("message").kind_name(), "message");
        assert_eq!(rx.recv().await.expect("typing").kind_name(), "typing");
        assert!(rx.try_recv().is_err());
    }
}
