use std::collections::HashMap;

use serde_json::{Value, json};

use super::BridgeError;
use super::event::{AttachmentSource, ChatAttachment, ChatMessage, MatrixMessage};
use crate::parsers::{MentionTarget, MessageUtils};
use crate::utils::formatting::apply_pattern_string;

pub use crate::parsers::{ConvertedText, chat_markup_to_html, html_to_chat_markup};

/// One Matrix event produced from a Google Chat message. `media` is set when the
/// content still needs its `url` filled in from an uploaded attachment.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixPart {
    pub content: Value,
    pub media: Option<ChatAttachment>,
}

/// References already resolved against the identity map for an inbound Chat message.
#[derive(Debug, Default)]
pub struct ChatToMatrixRefs<'a> {
    pub room_id: &'a str,
    /// Local root event of the Chat thread this message replies in.
    pub thread_root: Option<&'a str>,
    /// Local event of the quoted Chat message.
    pub reply_to: Option<&'a str>,
    pub mentions: HashMap<String, MentionTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMedia {
    pub mxc: String,
    pub filename: String,
    pub mimetype: String,
}

/// Google Chat `Message` fields the bridge sends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatOutbound {
    pub text: String,
    pub thread_name: Option<String>,
    pub quoted_message: Option<String>,
    pub attachment: Option<OutboundMedia>,
}

/// How a Matrix sender is represented on Google Chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderStyle<'a> {
    Native,
    Relayed { display_name: &'a str, format: &'a str },
}

pub struct MatrixToChatRefs<'a> {
    pub sender: SenderStyle<'a>,
    pub thread_name: Option<&'a str>,
    pub quoted_message: Option<&'a str>,
    pub resolve_user: &'a (dyn Fn(&str) -> Option<String> + Sync),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactionTranslation {
    Native(String),
    Note(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditStrategy {
    InPlace,
    RedactAndResend,
}

pub fn edit_strategy(target_supports_edits: bool) -> EditStrategy {
    if target_supports_edits {
        EditStrategy::InPlace
    } else {
        EditStrategy::RedactAndResend
    }
}

/// Splits a Chat message into Matrix events: the text first, then one event per attachment.
///
/// A message that is both a thread reply and quotes another message keeps the thread
/// relation; the quote becomes a link line above the text.
pub fn chat_to_matrix_message(
    message: &ChatMessage,
    refs: &ChatToMatrixRefs<'_>,
) -> Result<Vec<MatrixPart>, BridgeError> {
    let mut parts = Vec::new();
    let quote_line = match (refs.thread_root, refs.reply_to) {
        (Some(_), Some(reply)) => Some(format!(
            "In reply to https://matrix.to/#/{}/{}",
            refs.room_id, reply
        )),
        _ => None,
    };

    if !message.text.trim().is_empty() {
        let converted = chat_markup_to_html(&message.text, |name| refs.mentions.get(name).cloned());
        let mut content = text_content(&converted, quote_line.as_deref());
        apply_relation(&mut content, refs);
        parts.push(MatrixPart {
            content,
            media: None,
        });
    }

    for attachment in &message.attachments {
        let mut content = match &attachment.source {
            AttachmentSource::Drive { drive_file_id } => {
                let link = format!("https://drive.google.com/open?id={drive_file_id}");
                json!({
                    "msgtype": "m.text",
                    "body": format!("{}: {}", attachment.content_name, link),
                    "format": "org.matrix.custom.html",
                    "formatted_body": format!(
                        "<a href=\"{}\">{}</a>",
                        MessageUtils::escape_html(&link),
                        MessageUtils::escape_html(&attachment.content_name)
                    ),
                })
            }
            AttachmentSource::Uploaded { .. } => json!({
                "msgtype": msgtype_for_mime(&attachment.content_type),
                "body": attachment.content_name,
                "filename": attachment.content_name,
                "info": { "mimetype": attachment.content_type },
            }),
        };
        apply_relation(&mut content, refs);
        let media = matches!(attachment.source, AttachmentSource::Uploaded { .. })
            .then(|| attachment.clone());
        parts.push(MatrixPart { content, media });
    }

    if parts.is_empty() {
        return Err(BridgeError::TranslationUnsupported(format!(
            "message {} has neither text nor attachments",
            message.name
        )));
    }
    Ok(parts)
}

/// `m.replace` content for an edited Chat message.
pub fn chat_edit_to_matrix(
    message: &ChatMessage,
    target_event_id: &str,
    mentions: &HashMap<String, MentionTarget>,
) -> Value {
    let converted = chat_markup_to_html(&message.text, |name| mentions.get(name).cloned());
    let new_content = text_content(&converted, None);
    let mut content = json!({
        "msgtype": "m.text",
        "body": format!("* {}", converted.body),
        "m.new_content": new_content,
        "m.relates_to": { "rel_type": "m.replace", "event_id": target_event_id },
    });
    if let Some(html) = &converted.html {
        content["format"] = json!("org.matrix.custom.html");
        content["formatted_body"] = json!(format!("* {html}"));
    }
    content
}

pub fn matrix_to_chat_message(
    message: &MatrixMessage,
    refs: &MatrixToChatRefs<'_>,
) -> Result<ChatOutbound, BridgeError> {
    let text = match &message.formatted_body {
        Some(html) => html_to_chat_markup(html, |mxid| (refs.resolve_user)(mxid)),
        None => MessageUtils::strip_reply_fallback(&message.body),
    };

    let (text, attachment) = match message.msgtype.as_str() {
        "m.text" | "m.notice" => (text, None),
        "m.emote" => (format!("_{}_", text), None),
        "m.image" | "m.video" | "m.audio" | "m.file" => {
            let mxc = message.url.clone().ok_or_else(|| {
                BridgeError::TranslationUnsupported("media message without url".to_string())
            })?;
            let filename = message
                .filename
                .clone()
                .unwrap_or_else(|| message.body.clone());
            let caption = if message.filename.is_some() && message.body != filename {
                text
            } else {
                String::new()
            };
            let media = OutboundMedia {
                mxc,
                filename,
                mimetype: message
                    .mimetype
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
            };
            (caption, Some(media))
        }
        other => {
            return Err(BridgeError::TranslationUnsupported(format!(
                "msgtype {other} has no Google Chat equivalent"
            )));
        }
    };

    let text = match refs.sender {
        SenderStyle::Native => text,
        SenderStyle::Relayed {
            display_name,
            format,
        } => relay_text(format, display_name, &text),
    };

    Ok(ChatOutbound {
        text,
        thread_name: refs.thread_name.map(str::to_string),
        quoted_message: refs.quoted_message.map(str::to_string),
        attachment,
    })
}

pub fn relay_text(format: &str, sender: &str, message: &str) -> String {
    apply_pattern_string(format, &[("sender", sender), ("message", message)])
        .trim()
        .to_string()
}

/// Matrix annotations accept any key, so Chat reactions always translate natively.
pub fn chat_reaction_to_matrix(target_event_id: &str, emoji: &str) -> Value {
    json!({
        "m.relates_to": {
            "rel_type": "m.annotation",
            "event_id": target_event_id,
            "key": emoji,
        }
    })
}

/// Google Chat only accepts unicode emoji reactions; anything else becomes a note.
pub fn matrix_reaction_to_chat(key: &str, sender_display: &str) -> ReactionTranslation {
    if is_unicode_emoji(key) {
        ReactionTranslation::Native(key.to_string())
    } else {
        ReactionTranslation::Note(reaction_note(sender_display, key))
    }
}

pub fn reaction_note(sender_display: &str, key: &str) -> String {
    format!("{sender_display} reacted with {key}")
}

pub fn is_unicode_emoji(key: &str) -> bool {
    !key.is_empty()
        && key.chars().count() <= 32
        && !key
            .chars()
            .any(|c| c.is_ascii_alphanumeric() || c.is_whitespace())
        && key.chars().any(|c| c as u32 >= 0x2000)
}

fn msgtype_for_mime(mime: &str) -> &'static str {
    if mime.starts_with("image/") {
        "m.image"
    } else if mime.starts_with("video/") {
        "m.video"
    } else if mime.starts_with("audio/") {
        "m.audio"
    } else {
        "m.file"
    }
}

fn text_content(converted: &ConvertedText, quote_line: Option<&str>) -> Value {
    let body = match quote_line {
        Some(line) => format!("{line}\n\n{}", converted.body),
        None => converted.body.clone(),
    };
    let mut content = json!({ "msgtype": "m.text", "body": body });

    let html = match (quote_line, &converted.html) {
        (None, None) => None,
        (None, Some(html)) => Some(html.clone()),
        (Some(line), html) => Some(format!(
            "<blockquote>{}</blockquote>{}",
            MessageUtils::escape_html(line),
            html.clone()
                .unwrap_or_else(|| MessageUtils::escape_html(&converted.body))
        )),
    };
    if let Some(html) = html {
        content["format"] = json!("org.matrix.custom.html");
        content["formatted_body"] = json!(html);
    }
    content
}

fn apply_relation(content: &mut Value, refs: &ChatToMatrixRefs<'_>) {
    match (refs.thread_root, refs.reply_to) {
        (Some(root), _) => {
            content["m.relates_to"] = json!({
                "rel_type": "m.thread",
                "event_id": root,
                "is_falling_back": true,
                "m.in_reply_to": { "event_id": root },
            });
        }
        (None, Some(reply)) => {
            content["m.relates_to"] = json!({ "m.in_reply_to": { "event_id": reply } });
        }
        (None, None) => {}
    }
}
