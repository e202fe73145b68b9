use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::{debug, warn};

use crate::bridge::SendError;
use crate::bridge::event::{AttachmentSource, ChatAttachment};
use crate::bridge::translator::OutboundMedia;
use crate::config::Config;
use crate::googlechat::{ChatSender, GoogleChatApi};
use crate::matrix::encode;

const MAX_CHAT_FILE_SIZE: usize = 200 * 1024 * 1024;
const MAX_MATRIX_FILE_SIZE: usize = 50 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub data: Vec<u8>,
    pub content_type: String,
    pub filename: String,
    pub size: usize,
}

/// Moves attachment bytes between the two networks' media stores.
#[async_trait]
pub trait MediaProxy: Send + Sync {
    /// Re-uploads a Chat attachment to the homeserver and returns its `mxc://` URI.
    async fn chat_attachment_to_matrix(
        &self,
        attachment: &ChatAttachment,
    ) -> Result<String, SendError>;

    /// Re-uploads Matrix media into a space and returns the attachment reference.
    async fn matrix_media_to_chat(
        &self,
        space: &str,
        media: &OutboundMedia,
        sender: &ChatSender,
    ) -> Result<Value, SendError>;

    async fn avatar_to_matrix(&self, url: &str) -> Result<String, SendError>;
}

pub struct MediaHandler {
    client: Client,
    homeserver_url: String,
    appservice_token: SecretString,
    chat: Arc<dyn GoogleChatApi>,
}

impl MediaHandler {
    pub fn new(config: &Config, chat: Arc<dyn GoogleChatApi>) -> Self {
        Self {
            client: Client::new(),
            homeserver_url: config.bridge.homeserver_url.clone(),
            appservice_token: SecretString::from(config.bridge.appservice_token.clone()),
            chat,
        }
    }

    pub async fn download_from_url(&self, url: &str) -> Result<MediaInfo, SendError> {
        debug!("downloading media from {}", url);

        let response = self
            .client
            .get(url)
            .bearer_auth(self.appservice_token.expose_secret())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SendError::from_status(
                status.as_u16(),
                format!("failed to download from {url}"),
            ));
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let data = response.bytes().await?.to_vec();
        let size = data.len();
        debug!("downloaded {} bytes from {}", size, url);

        Ok(MediaInfo {
            data,
            content_type,
            filename: filename_from_url(url),
            size,
        })
    }

    pub async fn download_matrix_media(&self, mxc_url: &str) -> Result<MediaInfo, SendError> {
        let download_url = matrix_download_url(&self.homeserver_url, mxc_url)?;
        self.download_from_url(&download_url).await
    }

    pub async fn upload_to_matrix(&self, media: &MediaInfo) -> Result<String, SendError> {
        check_file_size(media.size, MAX_MATRIX_FILE_SIZE, "Matrix")?;

        let upload_url = format!(
            "{}/_matrix/media/v3/upload?filename={}",
            self.homeserver_url.trim_end_matches('/'),
            encode(&media.filename)
        );

        debug!("uploading {} to Matrix", media.filename);

        let response = self
            .client
            .post(&upload_url)
            .bearer_auth(self.appservice_token.expose_secret())
            .header("Content-Type", &media.content_type)
            .body(media.data.clone())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SendError::from_status(status.as_u16(), body));
        }

        let json: Value = response.json().await?;
        let content_uri = json
            .get("content_uri")
            .and_then(Value::as_str)
            .ok_or_else(|| SendError::Permanent("no content_uri in upload response".to_string()))?
            .to_string();

        debug!("uploaded to Matrix: {}", content_uri);
        Ok(content_uri)
    }
}

#[async_trait]
impl MediaProxy for MediaHandler {
    async fn chat_attachment_to_matrix(
        &self,
        attachment: &ChatAttachment,
    ) -> Result<String, SendError> {
        let resource_name = match &attachment.source {
            AttachmentSource::Uploaded { resource_name } => resource_name,
            AttachmentSource::Drive { drive_file_id } => {
                return Err(SendError::Permanent(format!(
                    "drive file {drive_file_id} cannot be copied"
                )));
            }
        };
        let data = self.chat.download_attachment(resource_name).await?;
        let media = MediaInfo {
            size: data.len(),
            data,
            content_type: attachment.content_type.clone(),
            filename: attachment.content_name.clone(),
        };
        self.upload_to_matrix(&media).await
    }

    async fn matrix_media_to_chat(
        &self,
        space: &str,
        media: &OutboundMedia,
        sender: &ChatSender,
    ) -> Result<Value, SendError> {
        let downloaded = self.download_matrix_media(&media.mxc).await?;
        check_file_size(downloaded.size, MAX_CHAT_FILE_SIZE, "Google Chat")?;
        let content_type = if media.mimetype.is_empty() {
            downloaded.content_type
        } else {
            media.mimetype.clone()
        };
        self.chat
            .upload_attachment(space, &media.filename, &content_type, downloaded.data, sender)
            .await
    }

    async fn avatar_to_matrix(&self, url: &str) -> Result<String, SendError> {
        let media = self.download_from_url(url).await?;
        self.upload_to_matrix(&media).await
    }
}

fn matrix_download_url(homeserver_url: &str, mxc_url: &str) -> Result<String, SendError> {
    let mxc_path = mxc_url
        .strip_prefix("mxc://")
        .filter(|path| path.contains('/'))
        .ok_or_else(|| SendError::Permanent(format!("invalid mxc URL: {mxc_url}")))?;
    Ok(format!(
        "{}/_matrix/media/v3/download/{}",
        homeserver_url.trim_end_matches('/'),
        mxc_path
    ))
}

fn filename_from_url(url: &str) -> String {
    url.split(['?', '#'])
        .next()
        .and_then(|path| path.rsplit('/').next())
        .filter(|name| !name.is_empty())
        .unwrap_or("attachment")
        .to_string()
}

fn check_file_size(size: usize, max: usize, network: &str) -> Result<(), SendError> {
    if size > max {
        warn!(
            "file too large for {}: {} bytes (max {})",
            network, size, max
        );
        return Err(SendError::Permanent(format!(
            "file too large for {network}: {size} bytes (max {max})"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    #[test]
    fn mxc_urls_map_to_download_endpoint() {
        assert_eq!(
            matrix_download_url("http://hs:8008/", "mxc://example.org/abc").expect("valid"),
            "http://hs:8008/_matrix/media/v3/download/example.org/abc"
        );
        assert_err!(matrix_download_url("http://hs:8008", "https://example.org/abc"));
        assert_err!(matrix_download_url("http://hs:8008", "mxc://example.org"));
    }

    #[test]
    fn filenames_come_from_the_url_path() {
        assert_eq!(filename_from_url("https://host/a/photo.png?sz=64"), "photo.png");
        assert_eq!(filename_from_url("https://host/a/"), "attachment");
    }

    #[test]
    fn oversized_files_are_permanent_failures() {
        assert_ok!(check_file_size(10, MAX_MATRIX_FILE_SIZE, "Matrix"));
        assert!(matches!(
            check_file_size(MAX_MATRIX_FILE_SIZE + 1, MAX_MATRIX_FILE_SIZE, "Matrix"),
            Err(SendError::Permanent(_))
        ));
    }
}
