pub mod common;
pub mod googlechat_parser;
pub mod matrix_parser;

pub use common::{MentionTarget, MessageUtils};
pub use googlechat_parser::{ConvertedText, chat_markup_to_html, mentioned_user_ids};
pub use matrix_parser::html_to_chat_markup;
