use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use super::common::{MentionTarget, MessageUtils};

static CODE_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```\n?(.*?)\n?```").expect("valid code block pattern"));
static INLINE_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"`([^`\n]+)`").expect("valid inline code pattern"));
static ANGLE_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<(users/[^>|]+)>|<(https?://[^|>\s]+)(?:\|([^>]+))?>")
        .expect("valid angle token pattern")
});
static BOLD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(^|[^\w*])\*([^*\s](?:[^*\n]*[^*\s])?)\*($|[^\w*])").expect("valid bold pattern")
});
static ITALIC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(^|[^\w_])_([^_\s](?:[^_\n]*[^_\s])?)_($|[^\w_])").expect("valid italic pattern")
});
static STRIKE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(^|[^\w~])~([^~\s](?:[^~\n]*[^~\s])?)~($|[^\w~])").expect("valid strike pattern")
});

/// Plain body plus optional HTML rendering, the shape of a Matrix text message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertedText {
    pub body: String,
    pub html: Option<String>,
}

/// Distinct `users/..` resource names mentioned in a message, in order of appearance.
pub fn mentioned_user_ids(text: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for caps in ANGLE_TOKEN.captures_iter(text) {
        if let Some(user) = caps.get(1)
            && !ids.iter().any(|id| id == user.as_str())
        {
            ids.push(user.as_str().to_string());
        }
    }
    ids
}

/// Converts Google Chat message markup into a Matrix body and `org.matrix.custom.html`.
///
/// `resolve_mention` maps a `users/..` resource name onto the Matrix identity that
/// represents it; unresolved mentions fall back to plain text.
pub fn chat_markup_to_html<F>(text: &str, resolve_mention: F) -> ConvertedText
where
    F: Fn(&str) -> Option<MentionTarget>,
{
    let mut body = String::new();
    let mut html = String::new();
    let mut last = 0;

    for block in CODE_BLOCK.captures_iter(text) {
        let (Some(whole), Some(inner)) = (block.get(0), block.get(1)) else {
            continue;
        };
        convert_inline(&text[last..whole.start()], &resolve_mention, &mut body, &mut html);
        body.push_str(inner.as_str());
        html.push_str("<pre><code>");
        html.push_str(&MessageUtils::escape_html(inner.as_str()));
        html.push_str("</code></pre>");
        last = whole.end();
    }
    convert_inline(&text[last..], &resolve_mention, &mut body, &mut html);

    let html = if html == MessageUtils::escape_html(&body).replace('\n', "<br>") {
        None
    } else {
        Some(html)
    };
    ConvertedText { body, html }
}

fn convert_inline<F>(segment: &str, resolve_mention: &F, body: &mut String, html: &mut String)
where
    F: Fn(&str) -> Option<MentionTarget>,
{
    let mut last = 0;
    for code in INLINE_CODE.captures_iter(segment) {
        let (Some(whole), Some(inner)) = (code.get(0), code.get(1)) else {
            continue;
        };
        convert_tokens(&segment[last..whole.start()], resolve_mention, body, html);
        body.push_str(inner.as_str());
        html.push_str("<code>");
        html.push_str(&MessageUtils::escape_html(inner.as_str()));
        html.push_str("</code>");
        last = whole.end();
    }
    convert_tokens(&segment[last..], resolve_mention, body, html);
}

fn convert_tokens<F>(segment: &str, resolve_mention: &F, body: &mut String, html: &mut String)
where
    F: Fn(&str) -> Option<MentionTarget>,
{
    let mut last = 0;
    for token in ANGLE_TOKEN.captures_iter(segment) {
        let Some(whole) = token.get(0) else {
            continue;
        };
        convert_text(&segment[last..whole.start()], body, html);
        if let Some(user) = token.get(1) {
            match resolve_mention(user.as_str()) {
                Some(target) => {
                    body.push_str(&target.display_name);
                    html.push_str(&format!(
                        "<a href=\"https://matrix.to/#/{}\">{}</a>",
                        MessageUtils::escape_html(&target.user_id),
                        MessageUtils::escape_html(&target.display_name)
                    ));
                }
                None => convert_text(whole.as_str(), body, html),
            }
        } else if let Some(url) = token.get(2) {
            let url = url.as_str();
            let label = token.get(3).map(|m| m.as_str()).unwrap_or(url);
            if label == url {
                body.push_str(url);
            } else {
                body.push_str(&format!("{label} ({url})"));
            }
            html.push_str(&format!(
                "<a href=\"{}\">{}</a>",
                MessageUtils::escape_html(url),
                MessageUtils::escape_html(label)
            ));
        }
        last = whole.end();
    }
    convert_text(&segment[last..], body, html);
}

fn convert_text(segment: &str, body: &mut String, html: &mut String) {
    body.push_str(segment);
    let escaped = MessageUtils::escape_html(segment);
    let formatted = apply_emphasis(&BOLD, &escaped, "strong");
    let formatted = apply_emphasis(&ITALIC, &formatted, "em");
    let formatted = apply_emphasis(&STRIKE, &formatted, "del");
    html.push_str(&formatted.replace('\n', "<br>"));
}

fn apply_emphasis(pattern: &Regex, text: &str, tag: &str) -> String {
    pattern
        .replace_all(text, |caps: &Captures| {
            format!("{}<{tag}>{}</{tag}>{}", &caps[1], &caps[2], &caps[3])
        })
        .into_owned()
}
