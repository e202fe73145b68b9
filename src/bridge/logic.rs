use std::collections::HashSet;

use chrono::Utc;

use crate::db::{MessageMapping, ReactionMapping};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RedactionRequest {
    pub(crate) room_id: String,
    pub(crate) event_id: String,
    pub(crate) reason: &'static str,
}

/// Users whose typing state changed between two snapshots of the typing set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct TypingChange {
    pub(crate) started: Vec<String>,
    pub(crate) stopped: Vec<String>,
}

impl TypingChange {
    pub(crate) fn is_empty(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty()
    }
}

pub(crate) const CHAT_DELETE_REASON: &str = "Deleted on Google Chat";

/// One redaction per Matrix event the Chat message was split into.
pub(crate) fn chat_delete_redaction_requests(
    room_id: &str,
    link: &MessageMapping,
) -> Vec<RedactionRequest> {
    link.all_local_event_ids()
        .map(|event_id| RedactionRequest {
            room_id: room_id.to_string(),
            event_id: event_id.to_string(),
            reason: CHAT_DELETE_REASON,
        })
        .collect()
}

pub(crate) fn typing_diff(previous: &HashSet<String>, current: &[String]) -> TypingChange {
    let current_set: HashSet<&str> = current.iter().map(String::as_str).collect();
    let mut started: Vec<String> = current
        .iter()
        .filter(|user| !previous.contains(*user))
        .cloned()
        .collect();
    let mut stopped: Vec<String> = previous
        .iter()
        .filter(|user| !current_set.contains(user.as_str()))
        .cloned()
        .collect();
    started.sort();
    started.dedup();
    stopped.sort();
    TypingChange { started, stopped }
}

pub(crate) fn should_forward_typing(disable_typing_notifications: bool, portal_active: bool) -> bool {
    !disable_typing_notifications && portal_active
}

pub(crate) fn should_forward_receipt(disable_read_receipts: bool, portal_active: bool) -> bool {
    !disable_read_receipts && portal_active
}

pub(crate) fn build_reaction_mapping(
    target: &MessageMapping,
    local_event_id: &str,
    remote_reaction_id: &str,
    key: &str,
    sender: &str,
    is_fallback_note: bool,
) -> ReactionMapping {
    ReactionMapping {
        id: 0,
        portal_id: target.portal_id,
        local_event_id: local_event_id.to_string(),
        remote_reaction_id: remote_reaction_id.to_string(),
        target_remote_message_id: target.remote_message_id.clone(),
        target_local_event_id: target.local_event_id.clone(),
        key: key.to_string(),
        sender: sender.to_string(),
        is_fallback_note,
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::{
        build_reaction_mapping, chat_delete_redaction_requests, should_forward_receipt,
        should_forward_typing, typing_diff,
    };
    use crate::db::MessageMapping;

    fn mapping(remote: &str, local: &str) -> MessageMapping {
        MessageMapping::new(7, local, remote)
    }

    #[test]
    fn chat_delete_redacts_every_part() {
        let mut link = mapping("spaces/A/messages/1", "$text");
        link.extra_local_event_ids = vec!["$image".to_string()];

        let requests = chat_delete_redaction_requests("!room:example.org", &link);

        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].event_id, "$text");
        assert_eq!(requests[1].event_id, "$image");
        assert!(requests.iter().all(|r| r.room_id == "!room:example.org"));
        assert!(requests.iter().all(|r| r.reason == "Deleted on Google Chat"));
    }

    #[test]
    fn typing_diff_reports_started_and_stopped() {
        let previous: HashSet<String> = ["@a:x".to_string(), "@b:x".to_string()].into();
        let current = vec!["@b:x".to_string(), "@c:x".to_string()];

        let change = typing_diff(&previous, &current);

        assert_eq!(change.started, vec!["@c:x".to_string()]);
        assert_eq!(change.stopped, vec!["@a:x".to_string()]);
    }

    #[test]
    fn typing_diff_is_empty_when_unchanged() {
        let previous: HashSet<String> = ["@a:x".to_string()].into();
        assert!(typing_diff(&previous, &["@a:x".to_string()]).is_empty());
    }

    #[test]
    fn forwarding_switches() {
        assert!(should_forward_typing(false, true));
        assert!(!should_forward_typing(true, true));
        assert!(!should_forward_typing(false, false));
        assert!(should_forward_receipt(false, true));
        assert!(!should_forward_receipt(true, true));
    }

    #[test]
    fn reaction_mapping_points_at_both_targets() {
        let target = mapping("spaces/A/messages/1", "$msg");
        let reaction = build_reaction_mapping(
            &target,
            "$reaction",
            "spaces/A/messages/1/reactions/r1",
            "👍",
            "@alice:example.org",
            false,
        );
        assert_eq!(reaction.portal_id, 7);
        assert_eq!(reaction.target_local_event_id, "$msg");
        assert_eq!(reaction.target_remote_message_id, "spaces/A/messages/1");
        assert!(!reaction.is_fallback_note);
    }
}
