use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a bridged conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortalState {
    Uninitialized,
    Active,
    Inactive,
}

impl PortalState {
    pub fn as_str(self) -> &'static str {
        match self {
            PortalState::Uninitialized => "uninitialized",
            PortalState::Active => "active",
            PortalState::Inactive => "inactive",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "uninitialized" => Some(PortalState::Uninitialized),
            "active" => Some(PortalState::Active),
            "inactive" => Some(PortalState::Inactive),
            _ => None,
        }
    }

    /// Inactive portals may be revived, but never return to uninitialized.
    pub fn can_transition_to(self, next: PortalState) -> bool {
        matches!(
            (self, next),
            (PortalState::Uninitialized, PortalState::Active)
                | (PortalState::Active, PortalState::Inactive)
                | (PortalState::Inactive, PortalState::Active)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portal {
    pub id: i64,
    pub remote_conversation_id: String,
    pub local_room_id: Option<String>,
    pub is_direct: bool,
    pub name: Option<String>,
    pub topic: Option<String>,
    pub state: PortalState,
    pub last_processed_remote_event_id: Option<String>,
    pub last_processed_local_event_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Portal {
    pub fn new(remote_conversation_id: impl Into<String>, is_direct: bool) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            remote_conversation_id: remote_conversation_id.into(),
            local_room_id: None,
            is_direct,
            name: None,
            topic: None,
            state: PortalState::Uninitialized,
            last_processed_remote_event_id: None,
            last_processed_local_event_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Ghost identity standing in for one Google Chat user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Puppet {
    pub id: i64,
    pub remote_user_id: String,
    pub ghost_user_id: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub is_registered: bool,
    pub is_double_puppeted: bool,
    pub custom_mxid: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Puppet {
    pub fn new(remote_user_id: impl Into<String>, ghost_user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            remote_user_id: remote_user_id.into(),
            ghost_user_id: ghost_user_id.into(),
            display_name: None,
            avatar_url: None,
            is_registered: false,
            is_double_puppeted: false,
            custom_mxid: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A Matrix user who linked their own Google account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeUser {
    pub id: i64,
    pub matrix_user_id: String,
    pub google_user_id: Option<String>,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BridgeUser {
    pub fn is_linked(&self) -> bool {
        self.google_user_id.is_some() && self.access_token.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMapping {
    pub id: i64,
    pub portal_id: i64,
    pub local_event_id: String,
    pub remote_message_id: String,
    pub thread_root_remote_id: Option<String>,
    /// `None` when the message was authored on the Matrix side.
    pub sender_puppet_id: Option<i64>,
    pub sent_by_bridge: bool,
    pub edit_count: i32,
    pub deleted: bool,
    /// Additional Matrix events produced when one Chat message fans out into several.
    pub extra_local_event_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageMapping {
    pub fn new(
        portal_id: i64,
        local_event_id: impl Into<String>,
        remote_message_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            portal_id,
            local_event_id: local_event_id.into(),
            remote_message_id: remote_message_id.into(),
            thread_root_remote_id: None,
            sender_puppet_id: None,
            sent_by_bridge: true,
            edit_count: 0,
            deleted: false,
            extra_local_event_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn all_local_event_ids(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.local_event_id.as_str())
            .chain(self.extra_local_event_ids.iter().map(String::as_str))
    }

    /// True for the primary event and for every additional part.
    pub fn covers_local_event(&self, event_id: &str) -> bool {
        self.all_local_event_ids().any(|id| id == event_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadMapping {
    pub id: i64,
    pub portal_id: i64,
    pub remote_thread_id: String,
    pub local_root_event_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionMapping {
    pub id: i64,
    pub portal_id: i64,
    pub local_event_id: String,
    pub remote_reaction_id: String,
    pub target_remote_message_id: String,
    pub target_local_event_id: String,
    pub key: String,
    pub sender: String,
    /// Set when the reaction could not be expressed natively and was posted as a text note.
    pub is_fallback_note: bool,
    pub created_at: DateTime<Utc>,
}
