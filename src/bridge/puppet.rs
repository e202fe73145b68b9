use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use secrecy::SecretString;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::retry::{RetryPolicy, send_with_retry};
use super::{BridgeError, IdentityMap, SendError};
use crate::config::Config;
use crate::db::{BridgeUser, Puppet};
use crate::googlechat::ChatSender;
use crate::matrix::MatrixApi;
use crate::media::MediaProxy;
use crate::utils::formatting::apply_pattern_string;

/// Identity a Google Chat user's content is posted under on Matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatrixSender {
    Ghost(String),
    /// The real Matrix account the Google user linked.
    DoublePuppet(String),
}

impl MatrixSender {
    pub fn user_id(&self) -> &str {
        match self {
            MatrixSender::Ghost(user_id) | MatrixSender::DoublePuppet(user_id) => user_id,
        }
    }
}

/// Ghost management and sender selection for both directions.
pub struct Puppets {
    config: Arc<Config>,
    identity: Arc<IdentityMap>,
    matrix: Arc<dyn MatrixApi>,
    media: Arc<dyn MediaProxy>,
    joined: Mutex<HashSet<(String, String)>>,
}

impl Puppets {
    pub fn new(
        config: Arc<Config>,
        identity: Arc<IdentityMap>,
        matrix: Arc<dyn MatrixApi>,
        media: Arc<dyn MediaProxy>,
    ) -> Self {
        Self {
            config,
            identity,
            matrix,
            media,
            joined: Mutex::new(HashSet::new()),
        }
    }

    pub fn ghost_localpart(&self, remote_user_id: &str) -> String {
        let id = remote_user_id
            .strip_prefix("users/")
            .unwrap_or(remote_user_id);
        apply_pattern_string(
            &self.config.ghosts.username_template,
            &[("id", &escape_localpart(id))],
        )
    }

    /// Derived from the remote id alone, so it never needs a lookup.
    pub fn ghost_user_id(&self, remote_user_id: &str) -> String {
        format!(
            "@{}:{}",
            self.ghost_localpart(remote_user_id),
            self.config.bridge.domain
        )
    }

    pub fn is_ghost_user_id(&self, user_id: &str) -> bool {
        self.remote_user_for_ghost(user_id).is_some()
    }

    pub fn remote_user_for_ghost(&self, user_id: &str) -> Option<String> {
        let (localpart, server) = user_id.strip_prefix('@')?.split_once(':')?;
        if server != self.config.bridge.domain {
            return None;
        }
        let (prefix, suffix) = self
            .config
            .ghosts
            .username_template
            .split_once(":id")?;
        let escaped = localpart
            .strip_prefix(prefix)?
            .strip_suffix(suffix)
            .filter(|id| !id.is_empty())?;
        Some(format!("users/{}", unescape_localpart(escaped)?))
    }

    /// Creates the ghost on first sight and refreshes its profile when it changed.
    pub async fn ensure_ghost(
        &self,
        remote_user_id: &str,
        display_name: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<Puppet, BridgeError> {
        let ghost_user_id = self.ghost_user_id(remote_user_id);
        let mut puppet = self
            .identity
            .resolve_puppet(remote_user_id, &ghost_user_id)
            .await?;
        let mut changed = false;

        if !puppet.is_registered {
            self.matrix
                .register_ghost(&self.ghost_localpart(remote_user_id))
                .await?;
            info!(
                "registered ghost ghost={} remote={}",
                ghost_user_id, remote_user_id
            );
            puppet.is_registered = true;
            changed = true;
        }

        if let Some(name) = display_name.filter(|name| !name.is_empty())
            && puppet.display_name.as_deref() != Some(name)
        {
            let rendered = apply_pattern_string(
                &self.config.ghosts.displayname_template,
                &[("name", name)],
            );
            self.matrix
                .set_display_name(&ghost_user_id, &rendered)
                .await?;
            puppet.display_name = Some(name.to_string());
            changed = true;
        }

        if let Some(avatar) = avatar_url.filter(|url| !url.is_empty())
            && puppet.avatar_url.as_deref() != Some(avatar)
        {
            match self.media.avatar_to_matrix(avatar).await {
                Ok(mxc) => {
                    self.matrix.set_avatar_url(&ghost_user_id, &mxc).await?;
                    puppet.avatar_url = Some(avatar.to_string());
                    changed = true;
                }
                Err(err) => warn!("failed to mirror avatar ghost={}: {}", ghost_user_id, err),
            }
        }

        if changed {
            self.identity.update_puppet(&puppet).await?;
        }
        Ok(puppet)
    }

    /// A linked account posts as the real Matrix user, never as both.
    pub fn matrix_sender_for(&self, puppet: &Puppet) -> MatrixSender {
        match (&puppet.custom_mxid, puppet.is_double_puppeted) {
            (Some(mxid), true) => MatrixSender::DoublePuppet(mxid.clone()),
            _ => MatrixSender::Ghost(puppet.ghost_user_id.clone()),
        }
    }

    pub async fn send_as(
        &self,
        sender: &MatrixSender,
        room_id: &str,
        event_type: &str,
        content: &Value,
    ) -> Result<String, SendError> {
        self.ensure_joined(sender.user_id(), room_id).await?;
        send_with_retry(
            RetryPolicy::from_limits(&self.config.limits),
            "matrix send",
            || {
                self.matrix
                    .send_event(sender.user_id(), room_id, event_type, content)
            },
        )
        .await
    }

    pub async fn redact_as(
        &self,
        sender: &MatrixSender,
        room_id: &str,
        event_id: &str,
        reason: Option<&str>,
    ) -> Result<(), SendError> {
        send_with_retry(
            RetryPolicy::from_limits(&self.config.limits),
            "matrix redact",
            || {
                self.matrix
                    .redact_event(sender.user_id(), room_id, event_id, reason)
            },
        )
        .await
    }

    /// The bot account may always act; anyone else is invited and joined once per room.
    pub async fn ensure_joined(&self, user_id: &str, room_id: &str) -> Result<(), SendError> {
        if user_id == self.matrix.bot_user_id() {
            return Ok(());
        }
        let key = (user_id.to_string(), room_id.to_string());
        if self.joined.lock().contains(&key) {
            return Ok(());
        }
        if let Err(err) = self.matrix.invite_user(room_id, user_id).await {
            debug!("invite before join failed user={} room={}: {}", user_id, room_id, err);
        }
        self.matrix.join_room(user_id, room_id).await?;
        self.joined.lock().insert(key);
        Ok(())
    }

    /// Linked Matrix users post through their own Google account.
    pub async fn chat_sender_for(&self, matrix_user_id: &str) -> Result<ChatSender, BridgeError> {
        let sender = match self.identity.user_for_matrix(matrix_user_id).await? {
            Some(user) if user.is_linked() => match (user.google_user_id, user.access_token) {
                (Some(google_user_id), Some(token)) => ChatSender::User {
                    google_user_id,
                    token: SecretString::from(token),
                },
                _ => ChatSender::Relay,
            },
            _ => ChatSender::Relay,
        };
        Ok(sender)
    }

    pub async fn link_user(
        &self,
        matrix_user_id: &str,
        google_user_id: &str,
        access_token: &str,
    ) -> Result<BridgeUser, BridgeError> {
        let ghost_user_id = self.ghost_user_id(google_user_id);
        Ok(self
            .identity
            .link_user(matrix_user_id, google_user_id, access_token, &ghost_user_id)
            .await?)
    }

    pub async fn unlink_user(&self, matrix_user_id: &str) -> Result<bool, BridgeError> {
        Ok(self.identity.unlink_user(matrix_user_id).await?)
    }

    /// Name used in the relay prefix for an unlinked Matrix user.
    pub fn relay_display_name(&self, matrix_user_id: &str) -> String {
        matrix_user_id
            .strip_prefix('@')
            .and_then(|rest| rest.split(':').next())
            .unwrap_or(matrix_user_id)
            .to_string()
    }
}

fn escape_localpart(id: &str) -> String {
    let mut escaped = String::with_capacity(id.len());
    for byte in id.bytes() {
        match byte {
            b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' => escaped.push(byte as char),
            other => escaped.push_str(&format!("={other:02x}")),
        }
    }
    escaped
}

fn unescape_localpart(escaped: &str) -> Option<String> {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'=' {
            let hex = escaped.get(idx + 1..idx + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            idx += 3;
        } else {
            out.push(bytes[idx]);
            idx += 1;
        }
    }
    String::from_utf8(out).ok()
}
