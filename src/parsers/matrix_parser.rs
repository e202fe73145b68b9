use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use super::common::MessageUtils;

static REPLY_FALLBACK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<mx-reply>.*?</mx-reply>").expect("valid mx-reply pattern"));
static PRE_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<pre[^>]*>(.*?)</pre>").expect("valid pre pattern"));
static INLINE_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<code[^>]*>(.*?)</code>").expect("valid code pattern"));
static ANCHOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<a\s[^>]*href\s*=\s*["']([^"']*)["'][^>]*>(.*?)</a>"#)
        .expect("valid anchor pattern")
});
static MATRIX_TO_USER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^https://matrix\.to/#/(@[^/?]+)").expect("valid matrix.to pattern")
});
static BOLD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</?(strong|b)(\s[^>]*)?>").expect("valid bold pattern"));
static ITALIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</?(em|i)(\s[^>]*)?>").expect("valid italic pattern"));
static STRIKE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</?(del|s|strike)(\s[^>]*)?>").expect("valid strike pattern"));
static HEADING_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<h[1-6][^>]*>").expect("valid heading pattern"));
static HEADING_CLOSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</h[1-6]>").expect("valid heading pattern"));
static LINE_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<br\s*/?>").expect("valid br pattern"));
static PARAGRAPH_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</p>\s*<p[^>]*>").expect("valid paragraph pattern"));
static LIST_ITEM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<li[^>]*>").expect("valid list pattern"));
static BLOCKQUOTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<blockquote[^>]*>(.*?)</blockquote>").expect("valid quote pattern"));
static ANY_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("valid tag pattern"));
static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new("\u{1}(\\d+)\u{1}").expect("valid placeholder pattern"));
static EXCESS_NEWLINES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n{3,}").expect("valid newline pattern"));

/// Converts Matrix `org.matrix.custom.html` into Google Chat message markup.
///
/// `resolve_user` maps a Matrix user id onto the Google Chat user name (`users/..`)
/// it stands for. Pills that do not resolve degrade to their label.
pub fn html_to_chat_markup<F>(html: &str, resolve_user: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut protected: Vec<String> = Vec::new();
    let mut protect = |value: String| -> String {
        protected.push(value);
        format!("\u{1}{}\u{1}", protected.len() - 1)
    };

    let text = REPLY_FALLBACK.replace_all(html, "").into_owned();

    let text = PRE_BLOCK
        .replace_all(&text, |caps: &Captures| {
            let code = MessageUtils::unescape_html(&strip_tags(&caps[1]));
            protect(format!("```\n{}\n```", code.trim_end_matches('\n')))
        })
        .into_owned();

    let text = INLINE_CODE
        .replace_all(&text, |caps: &Captures| {
            protect(format!("`{}`", MessageUtils::unescape_html(&strip_tags(&caps[1]))))
        })
        .into_owned();

    let text = ANCHOR
        .replace_all(&text, |caps: &Captures| {
            let href = MessageUtils::unescape_html(&caps[1]);
            let label = MessageUtils::unescape_html(&strip_tags(&caps[2]));
            if let Some(user) = MATRIX_TO_USER.captures(&href) {
                return match resolve_user(&user[1]) {
                    Some(chat_user) => protect(format!("<{chat_user}>")),
                    None => protect(label),
                };
            }
            if label.is_empty() || label == href {
                protect(href)
            } else {
                protect(format!("<{href}|{label}>"))
            }
        })
        .into_owned();

    let text = BLOCKQUOTE
        .replace_all(&text, |caps: &Captures| {
            let inner = PARAGRAPH_BREAK.replace_all(&caps[1], "\n");
            let inner = LINE_BREAK.replace_all(&inner, "\n");
            let quoted = strip_tags(&inner)
                .trim()
                .lines()
                .map(|line| format!("> {line}"))
                .collect::<Vec<_>>()
                .join("\n");
            format!("{quoted}\n")
        })
        .into_owned();

    let text = BOLD.replace_all(&text, "*");
    let text = ITALIC.replace_all(&text, "_");
    let text = STRIKE.replace_all(&text, "~");
    let text = HEADING_OPEN.replace_all(&text, "*");
    let text = HEADING_CLOSE.replace_all(&text, "*\n");
    let text = LINE_BREAK.replace_all(&text, "\n");
    let text = PARAGRAPH_BREAK.replace_all(&text, "\n\n");
    let text = LIST_ITEM.replace_all(&text, "• ");
    let text = text.replace("</li>", "\n").replace("</LI>", "\n");

    let text = MessageUtils::unescape_html(&strip_tags(&text));
    let text = PLACEHOLDER.replace_all(&text, |caps: &Captures| {
        caps[1]
            .parse::<usize>()
            .ok()
            .and_then(|idx| protected.get(idx).cloned())
            .unwrap_or_default()
    });
    EXCESS_NEWLINES
        .replace_all(text.trim(), "\n\n")
        .into_owned()
}

fn strip_tags(html: &str) -> String {
    ANY_TAG.replace_all(html, "").into_owned()
}
