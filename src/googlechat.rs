use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, Method};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::bridge::SendError;
use crate::bridge::event::{AttachmentSource, ChatAttachment, ChatMessage, ChatUser};
use crate::bridge::translator::ChatOutbound;
use crate::config::GoogleChatConfig;
use crate::matrix::encode;

pub mod events;

pub use self::events::ChatEventListener;

/// Account a message is sent from on Google Chat.
#[derive(Debug, Clone)]
pub enum ChatSender {
    /// The bridge's own bot account, posting on behalf of an unlinked Matrix user.
    Relay,
    /// A Matrix user's linked Google account.
    User {
        google_user_id: String,
        token: SecretString,
    },
}

impl ChatSender {
    pub fn is_relay(&self) -> bool {
        matches!(self, ChatSender::Relay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub name: String,
    pub thread_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationInfo {
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub is_direct: bool,
}

#[async_trait]
pub trait GoogleChatApi: Send + Sync {
    fn bot_user_id(&self) -> &str;

    fn supports_edits(&self) -> bool;

    async fn send_message(
        &self,
        space: &str,
        message: &ChatOutbound,
        attachment_ref: Option<&Value>,
        sender: &ChatSender,
        request_id: &str,
    ) -> Result<SentMessage, SendError>;

    async fn edit_message(
        &self,
        message_name: &str,
        text: &str,
        sender: &ChatSender,
    ) -> Result<(), SendError>;

    async fn delete_message(&self, message_name: &str, sender: &ChatSender)
    -> Result<(), SendError>;

    /// Returns the reaction resource name.
    async fn add_reaction(
        &self,
        message_name: &str,
        emoji: &str,
        sender: &ChatSender,
    ) -> Result<String, SendError>;

    async fn delete_reaction(
        &self,
        reaction_name: &str,
        sender: &ChatSender,
    ) -> Result<(), SendError>;

    async fn set_typing(&self, space: &str, sender: &ChatSender, typing: bool)
    -> Result<(), SendError>;

    async fn mark_read(
        &self,
        space: &str,
        sender: &ChatSender,
        read_time_ms: i64,
    ) -> Result<(), SendError>;

    async fn get_conversation(&self, space: &str) -> Result<ConversationInfo, SendError>;

    async fn update_conversation(
        &self,
        space: &str,
        display_name: Option<&str>,
        description: Option<&str>,
    ) -> Result<(), SendError>;

    /// Uploads bytes and returns the `attachmentDataRef` to reference in a message.
    async fn upload_attachment(
        &self,
        space: &str,
        filename: &str,
        content_type: &str,
        data: Vec<u8>,
        sender: &ChatSender,
    ) -> Result<Value, SendError>;

    async fn download_attachment(&self, resource_name: &str) -> Result<Vec<u8>, SendError>;

    /// Most recent messages of a space, oldest first.
    async fn list_messages(&self, space: &str, limit: u32) -> Result<Vec<ChatMessage>, SendError>;
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireUser {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default, rename = "type")]
    pub user_type: Option<String>,
}

impl WireUser {
    pub fn into_chat_user(self) -> ChatUser {
        ChatUser {
            is_bot: self.user_type.as_deref() == Some("BOT"),
            name: self.name,
            display_name: self.display_name,
            avatar_url: self.avatar_url,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireName {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireDataRef {
    #[serde(default)]
    pub resource_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireDriveRef {
    #[serde(default)]
    pub drive_file_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireAttachment {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub content_name: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub attachment_data_ref: Option<WireDataRef>,
    #[serde(default)]
    pub drive_data_ref: Option<WireDriveRef>,
}

/// Google Chat `Message` resource as returned by the REST API and in events.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub sender: Option<WireUser>,
    #[serde(default)]
    pub create_time: Option<String>,
    #[serde(default)]
    pub thread: Option<WireName>,
    #[serde(default)]
    pub thread_reply: Option<bool>,
    #[serde(default)]
    pub quoted_message_metadata: Option<WireName>,
    #[serde(default)]
    pub attachment: Vec<WireAttachment>,
}

impl WireMessage {
    pub fn into_chat_message(self) -> ChatMessage {
        let attachments = self
            .attachment
            .into_iter()
            .filter_map(|attachment| {
                let source = match (attachment.drive_data_ref, attachment.attachment_data_ref) {
                    (Some(drive), _) => AttachmentSource::Drive {
                        drive_file_id: drive.drive_file_id,
                    },
                    (None, Some(data)) => AttachmentSource::Uploaded {
                        resource_name: data.resource_name,
                    },
                    (None, None) => return None,
                };
                Some(ChatAttachment {
                    name: attachment.name,
                    content_name: attachment.content_name,
                    content_type: attachment.content_type,
                    source,
                })
            })
            .collect();

        ChatMessage {
            name: self.name,
            text: self.text.unwrap_or_default(),
            sender: self.sender.unwrap_or_default().into_chat_user(),
            thread_name: self.thread.map(|t| t.name).filter(|n| !n.is_empty()),
            thread_reply: self.thread_reply.unwrap_or(false),
            quoted_message: self
                .quoted_message_metadata
                .map(|q| q.name)
                .filter(|n| !n.is_empty()),
            attachments,
            create_time: self
                .create_time
                .as_deref()
                .and_then(parse_timestamp)
                .unwrap_or_else(|| Utc::now().timestamp_millis()),
        }
    }
}

pub fn parse_timestamp(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|ts| ts.timestamp_millis())
}

fn format_timestamp(millis: i64) -> String {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
        .to_rfc3339()
}

#[derive(Debug, Deserialize)]
struct ListMessagesResponse {
    #[serde(default)]
    messages: Vec<WireMessage>,
}

/// REST client for the Google Chat API.
pub struct GoogleChatClient {
    http: Client,
    api_base_url: String,
    upload_base_url: String,
    bot_token: SecretString,
    bot_user_id: String,
    supports_edits: bool,
}

impl GoogleChatClient {
    pub fn new(config: &GoogleChatConfig) -> Result<Self> {
        info!("initializing google chat client api={}", config.api_base_url);
        Ok(Self {
            http: Client::builder().build()?,
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            upload_base_url: config.upload_base_url.trim_end_matches('/').to_string(),
            bot_token: SecretString::from(config.access_token.clone()),
            bot_user_id: config.bot_user_id.clone(),
            supports_edits: config.supports_edits,
        })
    }

    fn token<'a>(&'a self, sender: &'a ChatSender) -> &'a str {
        match sender {
            ChatSender::Relay => self.bot_token.expose_secret(),
            ChatSender::User { token, .. } => token.expose_secret(),
        }
    }

    async fn call(
        &self,
        method: Method,
        url: &str,
        token: &str,
        body: Option<&Value>,
    ) -> Result<Value, SendError> {
        let mut request = self.http.request(method, url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SendError::from_status(status.as_u16(), body));
        }
        Ok(response.json::<Value>().await.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl GoogleChatApi for GoogleChatClient {
    fn bot_user_id(&self) -> &str {
        &self.bot_user_id
    }

    fn supports_edits(&self) -> bool {
        self.supports_edits
    }

    async fn send_message(
        &self,
        space: &str,
        message: &ChatOutbound,
        attachment_ref: Option<&Value>,
        sender: &ChatSender,
        request_id: &str,
    ) -> Result<SentMessage, SendError> {
        let mut body = json!({ "text": message.text });
        if let Some(thread) = &message.thread_name {
            body["thread"] = json!({ "name": thread });
        }
        if let Some(quoted) = &message.quoted_message {
            body["quotedMessageMetadata"] = json!({ "name": quoted });
        }
        if let Some(data_ref) = attachment_ref {
            body["attachment"] = json!([{ "attachmentDataRef": data_ref }]);
        }

        let url = format!(
            "{}/{}/messages?messageReplyOption=REPLY_MESSAGE_FALLBACK_TO_NEW_THREAD&requestId={}",
            self.api_base_url,
            space,
            encode(request_id)
        );
        let response = self
            .call(Method::POST, &url, self.token(sender), Some(&body))
            .await?;
        let sent: WireMessage = serde_json::from_value(response)
            .map_err(|e| SendError::Permanent(format!("unexpected send response: {e}")))?;
        debug!("google chat message sent space={} name={}", space, sent.name);
        Ok(SentMessage {
            name: sent.name,
            thread_name: sent.thread.map(|t| t.name),
        })
    }

    async fn edit_message(
        &self,
        message_name: &str,
        text: &str,
        sender: &ChatSender,
    ) -> Result<(), SendError> {
        let url = format!("{}/{}?updateMask=text", self.api_base_url, message_name);
        self.call(
            Method::PATCH,
            &url,
            self.token(sender),
            Some(&json!({ "text": text })),
        )
        .await
        .map(|_| ())
    }

    async fn delete_message(
        &self,
        message_name: &str,
        sender: &ChatSender,
    ) -> Result<(), SendError> {
        let url = format!("{}/{}", self.api_base_url, message_name);
        self.call(Method::DELETE, &url, self.token(sender), None)
            .await
            .map(|_| ())
    }

    async fn add_reaction(
        &self,
        message_name: &str,
        emoji: &str,
        sender: &ChatSender,
    ) -> Result<String, SendError> {
        let url = format!("{}/{}/reactions", self.api_base_url, message_name);
        let response = self
            .call(
                Method::POST,
                &url,
                self.token(sender),
                Some(&json!({ "emoji": { "unicode": emoji } })),
            )
            .await?;
        response
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SendError::Permanent("reaction response without name".to_string()))
    }

    async fn delete_reaction(
        &self,
        reaction_name: &str,
        sender: &ChatSender,
    ) -> Result<(), SendError> {
        let url = format!("{}/{}", self.api_base_url, reaction_name);
        self.call(Method::DELETE, &url, self.token(sender), None)
            .await
            .map(|_| ())
    }

    async fn set_typing(
        &self,
        space: &str,
        _sender: &ChatSender,
        typing: bool,
    ) -> Result<(), SendError> {
        // The REST API has no typing indicator.
        debug!("typing not supported by api space={} typing={}", space, typing);
        Ok(())
    }

    async fn mark_read(
        &self,
        space: &str,
        sender: &ChatSender,
        read_time_ms: i64,
    ) -> Result<(), SendError> {
        let url = format!(
            "{}/users/me/{}/spaceReadState?updateMask=lastReadTime",
            self.api_base_url, space
        );
        self.call(
            Method::PATCH,
            &url,
            self.token(sender),
            Some(&json!({ "lastReadTime": format_timestamp(read_time_ms) })),
        )
        .await
        .map(|_| ())
    }

    async fn get_conversation(&self, space: &str) -> Result<ConversationInfo, SendError> {
        let url = format!("{}/{}", self.api_base_url, space);
        let response = self
            .call(Method::GET, &url, self.bot_token.expose_secret(), None)
            .await?;
        let space_type = response
            .get("spaceType")
            .or_else(|| response.get("type"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        Ok(ConversationInfo {
            display_name: response
                .get("displayName")
                .and_then(Value::as_str)
                .filter(|name| !name.is_empty())
                .map(str::to_string),
            description: response
                .get("spaceDetails")
                .and_then(|details| details.get("description"))
                .and_then(Value::as_str)
                .map(str::to_string),
            is_direct: matches!(space_type, "DIRECT_MESSAGE" | "DM"),
        })
    }

    async fn update_conversation(
        &self,
        space: &str,
        display_name: Option<&str>,
        description: Option<&str>,
    ) -> Result<(), SendError> {
        let mut mask = Vec::new();
        let mut body = json!({});
        if let Some(name) = display_name {
            mask.push("displayName");
            body["displayName"] = json!(name);
        }
        if let Some(description) = description {
            mask.push("spaceDetails");
            body["spaceDetails"] = json!({ "description": description });
        }
        if mask.is_empty() {
            return Ok(());
        }
        let url = format!(
            "{}/{}?updateMask={}",
            self.api_base_url,
            space,
            mask.join(",")
        );
        self.call(
            Method::PATCH,
            &url,
            self.bot_token.expose_secret(),
            Some(&body),
        )
        .await
        .map(|_| ())
    }

    async fn upload_attachment(
        &self,
        space: &str,
        filename: &str,
        content_type: &str,
        data: Vec<u8>,
        sender: &ChatSender,
    ) -> Result<Value, SendError> {
        let boundary = format!("bridge-{}", uuid::Uuid::new_v4().simple());
        let metadata = json!({ "filename": filename }).to_string();
        let mut body = Vec::with_capacity(data.len() + 512);
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n--{boundary}\r\nContent-Type: {content_type}\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(&data);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        let url = format!(
            "{}/{}/attachments:upload?uploadType=multipart",
            self.upload_base_url, space
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(self.token(sender))
            .header(
                "Content-Type",
                format!("multipart/related; boundary={boundary}"),
            )
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SendError::from_status(status.as_u16(), body));
        }
        let uploaded: Value = response.json().await?;
        uploaded
            .get("attachmentDataRef")
            .cloned()
            .ok_or_else(|| SendError::Permanent("upload response without attachmentDataRef".into()))
    }

    async fn download_attachment(&self, resource_name: &str) -> Result<Vec<u8>, SendError> {
        let url = format!(
            "{}/media/{}?alt=media",
            self.api_base_url,
            encode(resource_name)
        );
        let response = self
            .http
            .get(&url)
            .bearer_auth(self.bot_token.expose_secret())
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SendError::from_status(status.as_u16(), body));
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn list_messages(&self, space: &str, limit: u32) -> Result<Vec<ChatMessage>, SendError> {
        let url = format!(
            "{}/{}/messages?pageSize={}&orderBy={}",
            self.api_base_url,
            space,
            limit,
            encode("createTime desc")
        );
        let response = self
            .call(Method::GET, &url, self.bot_token.expose_secret(), None)
            .await?;
        let listed: ListMessagesResponse = serde_json::from_value(response)
            .map_err(|e| SendError::Permanent(format!("unexpected list response: {e}")))?;
        let mut messages: Vec<ChatMessage> = listed
            .messages
            .into_iter()
            .map(WireMessage::into_chat_message)
            .collect();
        messages.sort_by_key(|message| message.create_time);
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{WireMessage, parse_timestamp};
    use crate::bridge::event::AttachmentSource;

    #[test]
    fn wire_message_converts_threads_quotes_and_attachments() {
        let wire: WireMessage = serde_json::from_value(json!({
            "name": "spaces/AAA/messages/m1",
            "text": "hello",
            "sender": { "name": "users/1", "displayName": "Alice", "type": "HUMAN" },
            "createTime": "2024-01-01T00:00:00Z",
            "thread": { "name": "spaces/AAA/threads/t1" },
            "threadReply": true,
            "quotedMessageMetadata": { "name": "spaces/AAA/messages/m0" },
            "attachment": [
                { "name": "a1", "contentName": "cat.png", "contentType": "image/png",
                  "attachmentDataRef": { "resourceName": "res" } },
                { "name": "a2", "contentName": "Doc", "contentType": "application/pdf",
                  "driveDataRef": { "driveFileId": "d1" } },
                { "name": "a3", "contentName": "broken" }
            ]
        }))
        .expect("deserializes");

        let message = wire.into_chat_message();
        assert_eq!(message.sender.display_name.as_deref(), Some("Alice"));
        assert!(!message.sender.is_bot);
        assert_eq!(message.thread_name.as_deref(), Some("spaces/AAA/threads/t1"));
        assert!(message.thread_reply);
        assert_eq!(message.quoted_message.as_deref(), Some("spaces/AAA/messages/m0"));
        assert_eq!(message.create_time, 1_704_067_200_000);
        assert_eq!(message.attachments.len(), 2);
        assert_eq!(
            message.attachments[1].source,
            AttachmentSource::Drive {
                drive_file_id: "d1".to_string()
            }
        );
    }

    #[test]
    fn timestamps_parse_as_millis() {
        assert_eq!(parse_timestamp("1970-01-01T00:00:01.500Z"), Some(1_500));
        assert_eq!(parse_timestamp("yesterday"), None);
    }
}
