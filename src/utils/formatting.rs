/// Replaces `:key` placeholders in `pattern`. Longer keys are substituted
/// first so `:name` never clobbers `:name_full`.
pub fn apply_pattern_string(pattern: &str, vars: &[(&str, &str)]) -> String {
    let mut ordered: Vec<&(&str, &str)> = vars.iter().collect();
    ordered.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    let mut output = pattern.to_string();
    for (key, value) in ordered {
        output = output.replace(&format!(":{key}"), value);
    }
    output
}

pub fn preview_text(value: &str) -> String {
    const MAX_PREVIEW_CHARS: usize = 120;
    let mut chars = value.chars();
    let preview: String = chars.by_ref().take(MAX_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{preview}…")
    } else {
        preview
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_all_placeholders() {
        let result = apply_pattern_string(":name (Google Chat)", &[("name", "Alice")]);
        assert_eq!(result, "Alice (Google Chat)");
    }

    #[test]
    fn longer_keys_are_replaced_first() {
        let result = apply_pattern_string(
            ":sender_id / :sender",
            &[("sender", "Bob"), ("sender_id", "@bob:example.org")],
        );
        assert_eq!(result, "@bob:example.org / Bob");
    }

    #[test]
    fn preview_text_truncates_long_values() {
        let long = "x".repeat(200);
        let preview = preview_text(&long);
        assert_eq!(preview.chars().count(), 121);
        assert!(preview.ends_with('…'));
        assert_eq!(preview_text("short"), "short");
    }
}
