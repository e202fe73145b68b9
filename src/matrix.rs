use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use matrix_bot_sdk::{
    client::{MatrixAuth, MatrixClient},
    models::CreateRoom,
};
use reqwest::{Client, Method};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use url::Url;

use crate::bridge::SendError;
use crate::config::Config;

pub mod event_handler;

pub use self::event_handler::MatrixEventProcessor;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomCreation {
    pub alias_localpart: Option<String>,
    pub name: Option<String>,
    pub topic: Option<String>,
    pub is_direct: bool,
    pub invite: Vec<String>,
}

/// Client-server calls the bridge makes against the homeserver, always on behalf of a
/// user in the appservice namespace (the bot, a ghost or a double puppet).
#[async_trait]
pub trait MatrixApi: Send + Sync {
    fn bot_user_id(&self) -> &str;

    async fn send_event(
        &self,
        as_user: &str,
        room_id: &str,
        event_type: &str,
        content: &Value,
    ) -> Result<String, SendError>;

    async fn redact_event(
        &self,
        as_user: &str,
        room_id: &str,
        event_id: &str,
        reason: Option<&str>,
    ) -> Result<(), SendError>;

    async fn send_read_receipt(
        &self,
        as_user: &str,
        room_id: &str,
        event_id: &str,
    ) -> Result<(), SendError>;

    async fn register_ghost(&self, localpart: &str) -> Result<(), SendError>;

    async fn set_display_name(&self, user_id: &str, display_name: &str) -> Result<(), SendError>;

    async fn set_avatar_url(&self, user_id: &str, avatar_mxc: &str) -> Result<(), SendError>;

    async fn create_room(&self, creation: &RoomCreation) -> Result<String, SendError>;

    async fn invite_user(&self, room_id: &str, user_id: &str) -> Result<(), SendError>;

    async fn join_room(&self, user_id: &str, room_id: &str) -> Result<(), SendError>;

    async fn set_room_name(&self, room_id: &str, name: &str) -> Result<(), SendError>;

    async fn set_room_topic(&self, room_id: &str, topic: &str) -> Result<(), SendError>;
}

pub struct MatrixAppservice {
    config: Arc<Config>,
    homeserver_url: Url,
    appservice_token: SecretString,
    bot_user_id: String,
    http: Client,
}

impl MatrixAppservice {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        info!(
            "initializing matrix appservice for {}",
            config.bridge.domain
        );
        let homeserver_url = Url::parse(&config.bridge.homeserver_url)?;
        let appservice_token = SecretString::from(config.bridge.appservice_token.clone());
        let bot_user_id = config.bot_user_id();
        Ok(Self {
            config,
            homeserver_url,
            appservice_token,
            bot_user_id,
            http: Client::new(),
        })
    }

    /// A fresh sdk client per call keeps impersonation from leaking between identities.
    async fn client_as(&self, user_id: &str) -> MatrixClient {
        let client = MatrixClient::new(
            self.homeserver_url.clone(),
            MatrixAuth::new(self.appservice_token.expose_secret()),
        );
        if user_id != self.bot_user_id {
            client
                .impersonate_user_id(Some(user_id), None::<&str>)
                .await;
        }
        client
    }

    async fn client_api(
        &self,
        method: Method,
        path: &str,
        as_user: Option<&str>,
        body: &Value,
    ) -> Result<Value, SendError> {
        let mut url = format!(
            "{}/_matrix/client/v3{}",
            self.homeserver_url.as_str().trim_end_matches('/'),
            path
        );
        if let Some(user_id) = as_user {
            url.push_str("?user_id=");
            url.push_str(&encode(user_id));
        }

        let response = self
            .http
            .request(method, &url)
            .bearer_auth(self.appservice_token.expose_secret())
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SendError::from_status(status.as_u16(), body));
        }
        Ok(response.json::<Value>().await.unwrap_or(Value::Null))
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.clone()
    }
}

#[async_trait]
impl MatrixApi for MatrixAppservice {
    fn bot_user_id(&self) -> &str {
        &self.bot_user_id
    }

    async fn send_event(
        &self,
        as_user: &str,
        room_id: &str,
        event_type: &str,
        content: &Value,
    ) -> Result<String, SendError> {
        let client = self.client_as(as_user).await;
        let event_id = client
            .send_event(room_id, event_type, content)
            .await
            .map_err(classify_sdk_error)?;
        debug!(
            "matrix event sent room_id={} sender={} type={} event_id={}",
            room_id, as_user, event_type, event_id
        );
        Ok(event_id)
    }

    async fn redact_event(
        &self,
        as_user: &str,
        room_id: &str,
        event_id: &str,
        reason: Option<&str>,
    ) -> Result<(), SendError> {
        let content = json!({
            "redacts": event_id,
            "reason": reason.unwrap_or(""),
        });
        self.send_event(as_user, room_id, "m.room.redaction", &content)
            .await
            .map(|_| ())
    }

    async fn send_read_receipt(
        &self,
        as_user: &str,
        room_id: &str,
        event_id: &str,
    ) -> Result<(), SendError> {
        let path = format!(
            "/rooms/{}/receipt/m.read/{}",
            encode(room_id),
            encode(event_id)
        );
        self.client_api(Method::POST, &path, Some(as_user), &json!({}))
            .await
            .map(|_| ())
    }

    async fn register_ghost(&self, localpart: &str) -> Result<(), SendError> {
        let client = self.client_as(&self.bot_user_id).await;
        match client.password_register(localpart, "", None::<&str>).await {
            Ok(_) => Ok(()),
            Err(err) if err.to_string().contains("M_USER_IN_USE") => {
                debug!("ghost already registered localpart={}", localpart);
                Ok(())
            }
            Err(err) => Err(classify_sdk_error(err)),
        }
    }

    async fn set_display_name(&self, user_id: &str, display_name: &str) -> Result<(), SendError> {
        let client = self.client_as(user_id).await;
        client
            .set_display_name(display_name)
            .await
            .map_err(classify_sdk_error)?;
        Ok(())
    }

    async fn set_avatar_url(&self, user_id: &str, avatar_mxc: &str) -> Result<(), SendError> {
        let path = format!("/profile/{}/avatar_url", encode(user_id));
        self.client_api(
            Method::PUT,
            &path,
            Some(user_id),
            &json!({ "avatar_url": avatar_mxc }),
        )
        .await
        .map(|_| ())
    }

    async fn create_room(&self, creation: &RoomCreation) -> Result<String, SendError> {
        let visibility = match self.config.room.default_visibility.to_lowercase().as_str() {
            "public" if !creation.is_direct => Some("public".to_string()),
            _ => Some("private".to_string()),
        };

        let opt = CreateRoom {
            visibility,
            room_alias_name: creation.alias_localpart.clone(),
            name: creation.name.clone(),
            topic: creation.topic.clone(),
            ..Default::default()
        };

        let client = self.client_as(&self.bot_user_id).await;
        let room_id = client.create_room(&opt).await.map_err(classify_sdk_error)?;
        info!(
            "created matrix room room_id={} alias={:?}",
            room_id, creation.alias_localpart
        );

        for user_id in &creation.invite {
            if let Err(err) = self.invite_user(&room_id, user_id).await {
                warn!(
                    "failed to invite user_id={} room_id={}: {}",
                    user_id, room_id, err
                );
            }
        }
        Ok(room_id)
    }

    async fn invite_user(&self, room_id: &str, user_id: &str) -> Result<(), SendError> {
        let path = format!("/rooms/{}/invite", encode(room_id));
        self.client_api(Method::POST, &path, None, &json!({ "user_id": user_id }))
            .await
            .map(|_| ())
    }

    async fn join_room(&self, user_id: &str, room_id: &str) -> Result<(), SendError> {
        let path = format!("/join/{}", encode(room_id));
        let as_user = (user_id != self.bot_user_id).then_some(user_id);
        self.client_api(Method::POST, &path, as_user, &json!({}))
            .await
            .map(|_| ())
    }

    async fn set_room_name(&self, room_id: &str, name: &str) -> Result<(), SendError> {
        let path = format!("/rooms/{}/state/m.room.name/", encode(room_id));
        self.client_api(Method::PUT, &path, None, &json!({ "name": name }))
            .await
            .map(|_| ())
    }

    async fn set_room_topic(&self, room_id: &str, topic: &str) -> Result<(), SendError> {
        let path = format!("/rooms/{}/state/m.room.topic/", encode(room_id));
        self.client_api(Method::PUT, &path, None, &json!({ "topic": topic }))
            .await
            .map(|_| ())
    }
}

/// Appservice registration document for the homeserver.
pub fn registration(config: &Config) -> Value {
    let ghost_prefix = config
        .ghosts
        .username_template
        .split(":id")
        .next()
        .unwrap_or_default();
    json!({
        "id": config.bridge.bridge_id,
        "url": format!("http://{}:{}", config.bridge.bind_address, config.bridge.port),
        "as_token": config.bridge.appservice_token,
        "hs_token": config.bridge.homeserver_token,
        "sender_localpart": config.bridge.bot_localpart,
        "rate_limited": false,
        "receive_ephemeral": true,
        "de.sorunome.msc2409.push_ephemeral": true,
        "namespaces": {
            "users": [{
                "exclusive": true,
                "regex": format!("@{}.*:{}", regex::escape(ghost_prefix), regex::escape(&config.bridge.domain))
            }],
            "aliases": [{
                "exclusive": true,
                "regex": format!("#{}.*:{}", regex::escape(&config.room.room_alias_prefix), regex::escape(&config.bridge.domain))
            }],
            "rooms": []
        }
    })
}

fn classify_sdk_error(err: impl std::fmt::Display) -> SendError {
    let message = err.to_string();
    const PERMANENT: [&str; 6] = [
        "M_FORBIDDEN",
        "M_NOT_FOUND",
        "M_UNKNOWN_TOKEN",
        "M_BAD_JSON",
        "M_INVALID_PARAM",
        "M_ROOM_IN_USE",
    ];
    if PERMANENT.iter().any(|code| message.contains(code))
        || message.contains("403")
        || message.contains("404")
    {
        SendError::Permanent(message)
    } else {
        SendError::Transient(message)
    }
}

pub(crate) fn encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}
