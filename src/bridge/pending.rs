use std::time::Duration;

use tokio::time::Instant;

use super::event::{BridgeEvent, Network};

struct Deferred {
    deadline: Instant,
    network: Network,
    target: String,
    event: BridgeEvent,
}

/// Events waiting for the message they reference to be mapped.
///
/// `network` is the side the target id belongs to, so a Matrix edit waits for a
/// Matrix event id and a Chat reaction for a Chat message name.
pub struct PendingQueue {
    window: Duration,
    entries: Vec<Deferred>,
}

impl PendingQueue {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Vec::new(),
        }
    }

    pub fn defer(&mut self, network: Network, target: impl Into<String>, event: BridgeEvent) {
        self.entries.push(Deferred {
            deadline: Instant::now() + self.window,
            network,
            target: target.into(),
            event,
        });
    }

    /// Removes and returns every event waiting on `target`, oldest first.
    pub fn take_for(&mut self, network: Network, target: &str) -> Vec<BridgeEvent> {
        let mut ready = Vec::new();
        let mut idx = 0;
        while idx < self.entries.len() {
            if self.entries[idx].network == network && self.entries[idx].target == target {
                ready.push(self.entries.remove(idx).event);
            } else {
                idx += 1;
            }
        }
        ready
    }

    /// Removes and returns every event whose window elapsed at `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<BridgeEvent> {
        let mut expired = Vec::new();
        let mut idx = 0;
        while idx < self.entries.len() {
            if self.entries[idx].deadline <= now {
                expired.push(self.entries.remove(idx).event);
            } else {
                idx += 1;
            }
        }
        expired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|entry| entry.deadline).min()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::PendingQueue;
    use crate::bridge::event::{BridgeEvent, EventKind, Network};

    fn redaction(event_id: &str, target: &str) -> BridgeEvent {
        BridgeEvent {
            source: Network::Matrix,
            conversation: "!room:example.org".to_string(),
            sender: "@alice:example.org".to_string(),
            event_id: event_id.to_string(),
            timestamp: 0,
            kind: EventKind::Redaction {
                target: target.to_string(),
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn take_for_returns_waiting_events_in_order() {
        let mut queue = PendingQueue::new(Duration::from_secs(5));
        queue.defer(Network::Matrix, "$a", redaction("$r1", "$a"));
        queue.defer(Network::Matrix, "$b", redaction("$r2", "$b"));
        queue.defer(Network::Matrix, "$a", redaction("$r3", "$a"));

        let ready = queue.take_for(Network::Matrix, "$a");
        let ids: Vec<_> = ready.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, vec!["$r1", "$r3"]);
        assert_eq!(queue.len(), 1);
        assert!(queue.take_for(Network::GoogleChat, "$b").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn events_expire_after_window() {
        let mut queue = PendingQueue::new(Duration::from_secs(5));
        queue.defer(Network::Matrix, "$a", redaction("$r1", "$a"));
        tokio::time::advance(Duration::from_secs(2)).await;
        queue.defer(Network::Matrix, "$b", redaction("$r2", "$b"));

        assert!(queue.expire(Instant::now()).is_empty());
        tokio::time::advance(Duration::from_secs(3)).await;
        let expired = queue.expire(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].event_id, "$r1");
        assert!(queue.next_deadline().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(queue.expire(Instant::now()).len(), 1);
        assert!(queue.is_empty());
        assert!(queue.next_deadline().is_none());
    }
}
