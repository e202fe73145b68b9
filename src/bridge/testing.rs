//! In-process doubles for both networks, shared by the bridge tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use super::event::{
    BridgeEvent, ChatAttachment, ChatMessage, ChatUser, EventKind, MatrixMessage, MessagePayload,
    Network,
};
use super::translator::{ChatOutbound, OutboundMedia};
use super::{BridgeContext, IdentityMap, PortalRef, Puppets, SendError};
use crate::config::Config;
use crate::db::{DatabaseManager, PortalState};
use crate::googlechat::{ChatSender, ConversationInfo, GoogleChatApi, SentMessage};
use crate::matrix::{MatrixApi, RoomCreation};
use crate::media::MediaProxy;

pub(crate) const TEST_CONFIG: &str = r#"
bridge:
  domain: example.org
  homeserver_url: http://localhost:8008
  as_token: as-secret
  hs_token: hs-secret
googlechat:
  bot_user_id: users/100
  webhook_token: hook-secret
  access_token: bot-token
database:
  url: memory://
limits:
  send_retries: 2
  retry_backoff_ms: 10
  send_timeout_ms: 1000
"#;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum MatrixCall {
    Send {
        as_user: String,
        room_id: String,
        event_type: String,
        content: Value,
        event_id: String,
    },
    Redact {
        as_user: String,
        room_id: String,
        event_id: String,
    },
    Receipt {
        as_user: String,
        room_id: String,
        event_id: String,
    },
    Register(String),
    DisplayName {
        user_id: String,
        name: String,
    },
    Avatar {
        user_id: String,
        mxc: String,
    },
    CreateRoom(RoomCreation),
    Invite {
        room_id: String,
        user_id: String,
    },
    Join {
        user_id: String,
        room_id: String,
    },
    RoomName {
        room_id: String,
        name: String,
    },
    RoomTopic {
        room_id: String,
        topic: String,
    },
}

#[derive(Default)]
pub(crate) struct MockMatrix {
    calls: Mutex<Vec<MatrixCall>>,
    counter: AtomicU64,
    send_failures: Mutex<VecDeque<SendError>>,
    send_delay: Mutex<Option<Duration>>,
}

impl MockMatrix {
    pub(crate) fn calls(&self) -> Vec<MatrixCall> {
        self.calls.lock().clone()
    }

    /// `(as_user, room_id, event_type, content, event_id)` of every event sent.
    pub(crate) fn sent(&self) -> Vec<(String, String, String, Value, String)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                MatrixCall::Send {
                    as_user,
                    room_id,
                    event_type,
                    content,
                    event_id,
                } => Some((
                    as_user.clone(),
                    room_id.clone(),
                    event_type.clone(),
                    content.clone(),
                    event_id.clone(),
                )),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn messages(&self) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter(|(_, _, event_type, _, _)| event_type == "m.room.message")
            .map(|(_, _, _, content, _)| content)
            .collect()
    }

    pub(crate) fn redactions(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                MatrixCall::Redact { event_id, .. } => Some(event_id.clone()),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn fail_next_send(&self, err: SendError) {
        self.send_failures.lock().push_back(err);
    }

    pub(crate) fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock() = Some(delay);
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn record(&self, call: MatrixCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl MatrixApi for MockMatrix {
    fn bot_user_id(&self) -> &str {
        "@googlechatbot:example.org"
    }

    async fn send_event(
        &self,
        as_user: &str,
        room_id: &str,
        event_type: &str,
        content: &Value,
    ) -> Result<String, SendError> {
        let delay = *self.send_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.send_failures.lock().pop_front() {
            return Err(err);
        }
        let event_id = self.next_id("$ev");
        self.record(MatrixCall::Send {
            as_user: as_user.to_string(),
            room_id: room_id.to_string(),
            event_type: event_type.to_string(),
            content: content.clone(),
            event_id: event_id.clone(),
        });
        Ok(event_id)
    }

    async fn redact_event(
        &self,
        as_user: &str,
        room_id: &str,
        event_id: &str,
        _reason: Option<&str>,
    ) -> Result<(), SendError> {
        self.record(MatrixCall::Redact {
            as_user: as_user.to_string(),
            room_id: room_id.to_string(),
            event_id: event_id.to_string(),
        });
        Ok(())
    }

    async fn send_read_receipt(
        &self,
        as_user: &str,
        room_id: &str,
        event_id: &str,
    ) -> Result<(), SendError> {
        self.record(MatrixCall::Receipt {
            as_user: as_user.to_string(),
            room_id: room_id.to_string(),
            event_id: event_id.to_string(),
        });
        Ok(())
    }

    async fn register_ghost(&self, localpart: &str) -> Result<(), SendError> {
        self.record(MatrixCall::Register(localpart.to_string()));
        Ok(())
    }

    async fn set_display_name(&self, user_id: &str, display_name: &str) -> Result<(), SendError> {
        self.record(MatrixCall::DisplayName {
            user_id: user_id.to_string(),
            name: display_name.to_string(),
        });
        Ok(())
    }

    async fn set_avatar_url(&self, user_id: &str, avatar_mxc: &str) -> Result<(), SendError> {
        self.record(MatrixCall::Avatar {
            user_id: user_id.to_string(),
            mxc: avatar_mxc.to_string(),
        });
        Ok(())
    }

    async fn create_room(&self, creation: &RoomCreation) -> Result<String, SendError> {
        self.record(MatrixCall::CreateRoom(creation.clone()));
        Ok(format!("!{}:example.org", self.next_id("room")))
    }

    async fn invite_user(&self, room_id: &str, user_id: &str) -> Result<(), SendError> {
        self.record(MatrixCall::Invite {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
        });
        Ok(())
    }

    async fn join_room(&self, user_id: &str, room_id: &str) -> Result<(), SendError> {
        self.record(MatrixCall::Join {
            user_id: user_id.to_string(),
            room_id: room_id.to_string(),
        });
        Ok(())
    }

    async fn set_room_name(&self, room_id: &str, name: &str) -> Result<(), SendError> {
        self.record(MatrixCall::RoomName {
            room_id: room_id.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }

    async fn set_room_topic(&self, room_id: &str, topic: &str) -> Result<(), SendError> {
        self.record(MatrixCall::RoomTopic {
            room_id: room_id.to_string(),
            topic: topic.to_string(),
        });
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ChatCall {
    Send {
        space: String,
        outbound: ChatOutbound,
        attachment: Option<Value>,
        sender: String,
        name: String,
    },
    Edit {
        name: String,
        text: String,
    },
    Delete {
        name: String,
        sender: String,
    },
    AddReaction {
        message: String,
        emoji: String,
        name: String,
    },
    DeleteReaction {
        name: String,
    },
    Typing {
        space: String,
        typing: bool,
    },
    MarkRead {
        space: String,
        sender: String,
        read_time_ms: i64,
    },
    UpdateConversation {
        space: String,
        display_name: Option<String>,
        description: Option<String>,
    },
}

pub(crate) struct MockChat {
    calls: Mutex<Vec<ChatCall>>,
    counter: AtomicU64,
    supports_edits: AtomicBool,
    send_failures: Mutex<VecDeque<SendError>>,
    send_delay: Mutex<Option<Duration>>,
    conversation: Mutex<ConversationInfo>,
    history: Mutex<Vec<ChatMessage>>,
}

impl Default for MockChat {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            counter: AtomicU64::new(0),
            supports_edits: AtomicBool::new(true),
            send_failures: Mutex::new(VecDeque::new()),
            send_delay: Mutex::new(None),
            conversation: Mutex::new(ConversationInfo::default()),
            history: Mutex::new(Vec::new()),
        }
    }
}

impl MockChat {
    pub(crate) fn calls(&self) -> Vec<ChatCall> {
        self.calls.lock().clone()
    }

    /// `(space, outbound, sender, message name)` of every message sent.
    pub(crate) fn sent(&self) -> Vec<(String, ChatOutbound, String, String)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                ChatCall::Send {
                    space,
                    outbound,
                    sender,
                    name,
                    ..
                } => Some((space.clone(), outbound.clone(), sender.clone(), name.clone())),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn set_supports_edits(&self, supported: bool) {
        self.supports_edits.store(supported, Ordering::SeqCst);
    }

    pub(crate) fn fail_next_send(&self, err: SendError) {
        self.send_failures.lock().push_back(err);
    }

    pub(crate) fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock() = Some(delay);
    }

    pub(crate) fn set_conversation(&self, info: ConversationInfo) {
        *self.conversation.lock() = info;
    }

    pub(crate) fn set_history(&self, messages: Vec<ChatMessage>) {
        *self.history.lock() = messages;
    }

    fn next_id(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn record(&self, call: ChatCall) {
        self.calls.lock().push(call);
    }
}

fn sender_label(sender: &ChatSender) -> String {
    match sender {
        ChatSender::Relay => "relay".to_string(),
        ChatSender::User { google_user_id, .. } => google_user_id.clone(),
    }
}

#[async_trait]
impl GoogleChatApi for MockChat {
    fn bot_user_id(&self) -> &str {
        "users/100"
    }

    fn supports_edits(&self) -> bool {
        self.supports_edits.load(Ordering::SeqCst)
    }

    async fn send_message(
        &self,
        space: &str,
        message: &ChatOutbound,
        attachment_ref: Option<&Value>,
        sender: &ChatSender,
        _request_id: &str,
    ) -> Result<SentMessage, SendError> {
        let delay = *self.send_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.send_failures.lock().pop_front() {
            return Err(err);
        }
        let n = self.next_id();
        let name = format!("{space}/messages/b{n}");
        let thread_name = message
            .thread_name
            .clone()
            .unwrap_or_else(|| format!("{space}/threads/t{n}"));
        self.record(ChatCall::Send {
            space: space.to_string(),
            outbound: message.clone(),
            attachment: attachment_ref.cloned(),
            sender: sender_label(sender),
            name: name.clone(),
        });
        Ok(SentMessage {
            name,
            thread_name: Some(thread_name),
        })
    }

    async fn edit_message(
        &self,
        message_name: &str,
        text: &str,
        _sender: &ChatSender,
    ) -> Result<(), SendError> {
        self.record(ChatCall::Edit {
            name: message_name.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn delete_message(&self, message_name: &str, sender: &ChatSender) -> Result<(), SendError> {
        self.record(ChatCall::Delete {
            name: message_name.to_string(),
            sender: sender_label(sender),
        });
        Ok(())
    }

    async fn add_reaction(
        &self,
        message_name: &str,
        emoji: &str,
        _sender: &ChatSender,
    ) -> Result<String, SendError> {
        let name = format!("{message_name}/reactions/r{}", self.next_id());
        self.record(ChatCall::AddReaction {
            message: message_name.to_string(),
            emoji: emoji.to_string(),
            name: name.clone(),
        });
        Ok(name)
    }

    async fn delete_reaction(
        &self,
        reaction_name: &str,
        _sender: &ChatSender,
    ) -> Result<(), SendError> {
        self.record(ChatCall::DeleteReaction {
            name: reaction_name.to_string(),
        });
        Ok(())
    }

    async fn set_typing(
        &self,
        space: &str,
        _sender: &ChatSender,
        typing: bool,
    ) -> Result<(), SendError> {
        self.record(ChatCall::Typing {
            space: space.to_string(),
            typing,
        });
        Ok(())
    }

    async fn mark_read(
        &self,
        space: &str,
        sender: &ChatSender,
        read_time_ms: i64,
    ) -> Result<(), SendError> {
        self.record(ChatCall::MarkRead {
            space: space.to_string(),
            sender: sender_label(sender),
            read_time_ms,
        });
        Ok(())
    }

    async fn get_conversation(&self, _space: &str) -> Result<ConversationInfo, SendError> {
        Ok(self.conversation.lock().clone())
    }

    async fn update_conversation(
        &self,
        space: &str,
        display_name: Option<&str>,
        description: Option<&str>,
    ) -> Result<(), SendError> {
        self.record(ChatCall::UpdateConversation {
            space: space.to_string(),
            display_name: display_name.map(str::to_string),
            description: description.map(str::to_string),
        });
        Ok(())
    }

    async fn upload_attachment(
        &self,
        _space: &str,
        filename: &str,
        _content_type: &str,
        _data: Vec<u8>,
        _sender: &ChatSender,
    ) -> Result<Value, SendError> {
        Ok(json!({ "attachmentDataRef": { "resourceName": filename } }))
    }

    async fn download_attachment(&self, _resource_name: &str) -> Result<Vec<u8>, SendError> {
        Ok(b"bytes".to_vec())
    }

    async fn list_messages(&self, _space: &str, limit: u32) -> Result<Vec<ChatMessage>, SendError> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(limit as usize);
        Ok(history[skip..].to_vec())
    }
}

#[derive(Default)]
pub(crate) struct MockMedia;

#[async_trait]
impl MediaProxy for MockMedia {
    async fn chat_attachment_to_matrix(
        &self,
        attachment: &ChatAttachment,
    ) -> Result<String, SendError> {
        Ok(format!("mxc://example.org/{}", attachment.content_name))
    }

    async fn matrix_media_to_chat(
        &self,
        _space: &str,
        media: &OutboundMedia,
        _sender: &ChatSender,
    ) -> Result<Value, SendError> {
        Ok(json!({ "attachmentDataRef": { "resourceName": media.filename } }))
    }

    async fn avatar_to_matrix(&self, _url: &str) -> Result<String, SendError> {
        Ok("mxc://example.org/avatar".to_string())
    }
}

pub(crate) struct Harness {
    pub(crate) ctx: BridgeContext,
    pub(crate) matrix: Arc<MockMatrix>,
    pub(crate) chat: Arc<MockChat>,
}

pub(crate) async fn harness() -> Harness {
    harness_with(|_| {}).await
}

pub(crate) async fn harness_with(configure: impl FnOnce(&mut Config)) -> Harness {
    let mut config = Config::load_from_str(TEST_CONFIG).expect("test config");
    configure(&mut config);
    let config = Arc::new(config);
    let identity = Arc::new(IdentityMap::new(DatabaseManager::in_memory()));
    let matrix = Arc::new(MockMatrix::default());
    let chat = Arc::new(MockChat::default());
    let media: Arc<dyn MediaProxy> = Arc::new(MockMedia);
    let puppets = Arc::new(Puppets::new(
        config.clone(),
        identity.clone(),
        matrix.clone(),
        media.clone(),
    ));
    Harness {
        ctx: BridgeContext {
            config,
            identity,
            puppets,
            matrix: matrix.clone(),
            chat: chat.clone(),
            media,
        },
        matrix,
        chat,
    }
}

impl Harness {
    /// An already bridged portal between `space` and `room_id`.
    pub(crate) async fn active_portal(&self, space: &str, room_id: &str) -> Arc<PortalRef> {
        let portal = self
            .ctx
            .identity
            .resolve_portal(space, false)
            .await
            .expect("resolve portal");
        let mut record = self
            .ctx
            .identity
            .load_portal(portal.id)
            .await
            .expect("load portal")
            .expect("portal exists");
        record.local_room_id = Some(room_id.to_string());
        record.state = PortalState::Active;
        self.ctx.identity.save_portal(&record).await.expect("save portal");
        portal
    }
}

pub(crate) fn chat_text(space: &str, name: &str, sender: &str, text: &str) -> BridgeEvent {
    chat_message_event(
        space,
        ChatMessage {
            name: name.to_string(),
            text: text.to_string(),
            sender: ChatUser {
                name: sender.to_string(),
                display_name: Some(format!("User {sender}")),
                ..Default::default()
            },
            ..Default::default()
        },
    )
}

pub(crate) fn chat_message_event(space: &str, message: ChatMessage) -> BridgeEvent {
    BridgeEvent {
        source: Network::GoogleChat,
        conversation: space.to_string(),
        sender: message.sender.name.clone(),
        event_id: message.name.clone(),
        timestamp: 1_700_000_000_000,
        kind: EventKind::Message(MessagePayload::Chat(message)),
    }
}

pub(crate) fn matrix_text(room_id: &str, event_id: &str, sender: &str, body: &str) -> BridgeEvent {
    matrix_event(
        room_id,
        event_id,
        sender,
        EventKind::Message(MessagePayload::Matrix(MatrixMessage::text(body))),
    )
}

pub(crate) fn matrix_event(room_id: &str, event_id: &str, sender: &str, kind: EventKind) -> BridgeEvent {
    BridgeEvent {
        source: Network::Matrix,
        conversation: room_id.to_string(),
        sender: sender.to_string(),
        event_id: event_id.to_string(),
        timestamp: 1_700_000_000_000,
        kind,
    }
}

pub(crate) fn chat_event(space: &str, event_id: &str, sender: &str, kind: EventKind) -> BridgeEvent {
    BridgeEvent {
        source: Network::GoogleChat,
        conversation: space.to_string(),
        sender: sender.to_string(),
        event_id: event_id.to_string(),
        timestamp: 1_700_000_000_000,
        kind,
    }
}
