use std::collections::VecDeque;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use tokio::time::Instant;

use crate::parsers::MessageUtils;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EchoFingerprint {
    pub portal_id: i64,
    pub content_hash: u64,
    pub sender: u64,
}

impl EchoFingerprint {
    pub fn new(portal_id: i64, content: &str, sender: &str) -> Self {
        Self {
            portal_id,
            content_hash: hash_of(&MessageUtils::normalize_for_comparison(content)),
            sender: hash_of(sender),
        }
    }
}

/// An outbound send the gate recognized coming back from the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoMatch {
    /// Event on the sending side that caused the send, when known at registration time.
    pub source_event_id: Option<String>,
}

struct Expected {
    deadline: Instant,
    fingerprint: EchoFingerprint,
    source_event_id: Option<String>,
}

/// Expected-echo registry for one portal. Entries are registered right before an
/// outbound send and consumed by the first matching inbound event.
pub struct EchoGate {
    ttl: Duration,
    entries: VecDeque<Expected>,
}

impl EchoGate {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: VecDeque::new(),
        }
    }

    pub fn expect(
        &mut self,
        portal_id: i64,
        content: &str,
        sender: &str,
        source_event_id: Option<&str>,
    ) {
        let now = Instant::now();
        self.purge(now);
        self.entries.push_back(Expected {
            deadline: now + self.ttl,
            fingerprint: EchoFingerprint::new(portal_id, content, sender),
            source_event_id: source_event_id.map(str::to_string),
        });
    }

    pub fn take_match(&mut self, portal_id: i64, content: &str, sender: &str) -> Option<EchoMatch> {
        self.purge(Instant::now());
        let fingerprint = EchoFingerprint::new(portal_id, content, sender);
        let idx = self
            .entries
            .iter()
            .position(|entry| entry.fingerprint == fingerprint)?;
        self.entries.remove(idx).map(|entry| EchoMatch {
            source_event_id: entry.source_event_id,
        })
    }

    /// Drops a registration once the send outcome is known, so a later real message is not swallowed.
    pub fn forget(&mut self, portal_id: i64, content: &str, sender: &str) {
        let fingerprint = EchoFingerprint::new(portal_id, content, sender);
        if let Some(idx) = self
            .entries
            .iter()
            .rposition(|entry| entry.fingerprint == fingerprint)
        {
            self.entries.remove(idx);
        }
    }

    pub fn purge(&mut self, now: Instant) {
        // Deadlines are monotonic because the ttl is fixed.
        while self
            .entries
            .front()
            .is_some_and(|entry| entry.deadline <= now)
        {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn hash_of(value: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}
