use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Network {
    Matrix,
    GoogleChat,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Matrix => "matrix",
            Network::GoogleChat => "googlechat",
        }
    }
}

/// One inbound event from either network, normalized at the listener boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeEvent {
    pub source: Network,
    /// Matrix room id or Google Chat space name (`spaces/..`).
    pub conversation: String,
    /// Matrix user id or Google Chat user name (`users/..`).
    pub sender: String,
    /// Matrix event id or Google Chat resource name.
    pub event_id: String,
    /// Origin timestamp in epoch milliseconds.
    pub timestamp: i64,
    pub kind: EventKind,
}

impl BridgeEvent {
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            EventKind::Message(_) => "message",
            EventKind::Edit { .. } => "edit",
            EventKind::Reaction { .. } => "reaction",
            EventKind::ReactionRemoved { .. } => "reaction_removed",
            EventKind::Redaction { .. } => "redaction",
            EventKind::ReadReceipt { .. } => "read_receipt",
            EventKind::Typing { .. } => "typing",
            EventKind::Membership { .. } => "membership",
            EventKind::MetadataChange { .. } => "metadata",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Message(MessagePayload),
    Edit {
        target: String,
        payload: MessagePayload,
    },
    Reaction {
        target: String,
        key: String,
    },
    /// Removal of a reaction identified by its own id. Matrix expresses this as a
    /// redaction of the reaction event, so only Google Chat produces it.
    ReactionRemoved {
        reaction_id: String,
    },
    Redaction {
        target: String,
    },
    ReadReceipt {
        up_to: Option<String>,
    },
    /// Complete set of users currently typing in the conversation.
    Typing {
        user_ids: Vec<String>,
    },
    Membership {
        user: String,
        membership: Membership,
    },
    MetadataChange {
        name: Option<String>,
        topic: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Invite,
    Join,
    Leave,
    Ban,
}

impl Membership {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "invite" => Some(Membership::Invite),
            "join" => Some(Membership::Join),
            "leave" => Some(Membership::Leave),
            "ban" => Some(Membership::Ban),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessagePayload {
    Matrix(MatrixMessage),
    Chat(ChatMessage),
}

/// `m.room.message` content as received from the homeserver.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatrixMessage {
    pub msgtype: String,
    pub body: String,
    pub formatted_body: Option<String>,
    pub url: Option<String>,
    pub mimetype: Option<String>,
    pub filename: Option<String>,
    pub reply_to: Option<String>,
    pub thread_root: Option<String>,
}

impl MatrixMessage {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            msgtype: "m.text".to_string(),
            body: body.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatUser {
    pub name: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub is_bot: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttachmentSource {
    Uploaded { resource_name: String },
    Drive { drive_file_id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatAttachment {
    pub name: String,
    pub content_name: String,
    pub content_type: String,
    pub source: AttachmentSource,
}

/// Google Chat `Message` resource, reduced to what the bridge relays.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatMessage {
    pub name: String,
    pub text: String,
    pub sender: ChatUser,
    pub thread_name: Option<String>,
    pub thread_reply: bool,
    pub quoted_message: Option<String>,
    pub attachments: Vec<ChatAttachment>,
    pub create_time: i64,
}

/// Google Chat resource names nest: `spaces/S/messages/M/reactions/R`.
pub fn parent_resource(name: &str, collection: &str) -> Option<String> {
    let marker = format!("/{collection}/");
    name.rfind(&marker).map(|idx| name[..idx].to_string())
}
