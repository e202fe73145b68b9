use serde_json::Value;

/// Matrix identity a Google Chat mention resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionTarget {
    pub user_id: String,
    pub display_name: String,
}

pub struct MessageUtils;

impl MessageUtils {
    pub fn extract_plain_text(content: &Value) -> String {
        match content {
            Value::String(s) => s.clone(),
            Value::Object(obj) => {
                if let Some(body) = obj.get("body").and_then(Value::as_str) {
                    body.to_string()
                } else if let Some(formatted) = obj.get("formatted_body").and_then(Value::as_str) {
                    formatted.to_string()
                } else {
                    String::new()
                }
            }
            _ => String::new(),
        }
    }

    /// Drops the `> <@user> quoted` prefix Matrix clients put in front of replies.
    pub fn strip_reply_fallback(body: &str) -> String {
        if !body.starts_with("> ") {
            return body.to_string();
        }
        let mut lines = body.lines().skip_while(|line| line.starts_with('>'));
        let mut rest: Vec<&str> = Vec::new();
        if let Some(first) = lines.next()
            && !first.is_empty()
        {
            rest.push(first);
        }
        rest.extend(lines);
        rest.join("\n")
    }

    pub fn escape_html(text: &str) -> String {
        let mut escaped = String::with_capacity(text.len());
        for ch in text.chars() {
            match ch {
                '&' => escaped.push_str("&amp;"),
                '<' => escaped.push_str("&lt;"),
                '>' => escaped.push_str("&gt;"),
                '"' => escaped.push_str("&quot;"),
                '\'' => escaped.push_str("&#39;"),
                _ => escaped.push(ch),
            }
        }
        escaped
    }

    pub fn unescape_html(text: &str) -> String {
        text.replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&#39;", "'")
            .replace("&#x27;", "'")
            .replace("&nbsp;", " ")
            .replace("&amp;", "&")
    }

    /// Whitespace-insensitive form used when comparing message bodies across networks.
    pub fn normalize_for_comparison(text: &str) -> String {
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}
