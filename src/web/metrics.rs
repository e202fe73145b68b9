use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use once_cell::sync::Lazy;

use crate::bridge::Network;

static STARTED_AT: Lazy<Instant> = Lazy::new(Instant::now);
static MATRIX_EVENTS_RECEIVED: AtomicU64 = AtomicU64::new(0);
static CHAT_EVENTS_RECEIVED: AtomicU64 = AtomicU64::new(0);
static MESSAGES_TO_MATRIX: AtomicU64 = AtomicU64::new(0);
static MESSAGES_TO_CHAT: AtomicU64 = AtomicU64::new(0);
static ECHOES_SUPPRESSED: AtomicU64 = AtomicU64::new(0);
static UNRESOLVED_REFERENCES: AtomicU64 = AtomicU64::new(0);
static SEND_FAILURES_TRANSIENT: AtomicU64 = AtomicU64::new(0);
static SEND_FAILURES_PERMANENT: AtomicU64 = AtomicU64::new(0);
static ACTIVE_PORTALS: AtomicU64 = AtomicU64::new(0);

pub struct Metrics;

impl Metrics {
    /// Pins the uptime origin; called once at startup.
    pub fn init() {
        Lazy::force(&STARTED_AT);
    }

    pub fn inc_events_received(network: Network) {
        match network {
            Network::Matrix => MATRIX_EVENTS_RECEIVED.fetch_add(1, Ordering::Relaxed),
            Network::GoogleChat => CHAT_EVENTS_RECEIVED.fetch_add(1, Ordering::Relaxed),
        };
        #[cfg(feature = "metrics")]
        ::metrics::counter!("bridge_events_received_total", "network" => network.as_str())
            .increment(1);
    }

    /// `target` is the network the message was delivered to.
    pub fn message_relayed(target: Network) {
        match target {
            Network::Matrix => MESSAGES_TO_MATRIX.fetch_add(1, Ordering::Relaxed),
            Network::GoogleChat => MESSAGES_TO_CHAT.fetch_add(1, Ordering::Relaxed),
        };
        #[cfg(feature = "metrics")]
        ::metrics::counter!("bridge_messages_relayed_total", "target" => target.as_str())
            .increment(1);
    }

    pub fn echo_suppressed() {
        ECHOES_SUPPRESSED.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        ::metrics::counter!("bridge_echoes_suppressed_total").increment(1);
    }

    pub fn unresolved_reference() {
        UNRESOLVED_REFERENCES.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        ::metrics::counter!("bridge_unresolved_references_total").increment(1);
    }

    pub fn send_failed(transient: bool) {
        let kind = if transient {
            SEND_FAILURES_TRANSIENT.fetch_add(1, Ordering::Relaxed);
            "transient"
        } else {
            SEND_FAILURES_PERMANENT.fetch_add(1, Ordering::Relaxed);
            "permanent"
        };
        #[cfg(feature = "metrics")]
        ::metrics::counter!("bridge_send_failures_total", "kind" => kind).increment(1);
        #[cfg(not(feature = "metrics"))]
        let _ = kind;
    }

    pub fn set_active_portals(count: u64) {
        ACTIVE_PORTALS.store(count, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        ::metrics::gauge!("bridge_active_portals").set(count as f64);
    }
}

pub fn format_prometheus() -> String {
    let uptime = STARTED_AT.elapsed().as_secs();
    let matrix_received = MATRIX_EVENTS_RECEIVED.load(Ordering::Relaxed);
    let chat_received = CHAT_EVENTS_RECEIVED.load(Ordering::Relaxed);
    let to_matrix = MESSAGES_TO_MATRIX.load(Ordering::Relaxed);
    let to_chat = MESSAGES_TO_CHAT.load(Ordering::Relaxed);
    let echoes = ECHOES_SUPPRESSED.load(Ordering::Relaxed);
    let unresolved = UNRESOLVED_REFERENCES.load(Ordering::Relaxed);
    let transient = SEND_FAILURES_TRANSIENT.load(Ordering::Relaxed);
    let permanent = SEND_FAILURES_PERMANENT.load(Ordering::Relaxed);
    let active_portals = ACTIVE_PORTALS.load(Ordering::Relaxed);

    format!(
        r#"# HELP bridge_uptime_seconds Number of seconds the bridge has been running
# TYPE bridge_uptime_seconds gauge
bridge_uptime_seconds {}

# HELP bridge_events_received_total Events accepted from each network
# TYPE bridge_events_received_total counter
bridge_events_received_total{{network="matrix"}} {}
bridge_events_received_total{{network="googlechat"}} {}

# HELP bridge_messages_relayed_total Messages delivered to each network
# TYPE bridge_messages_relayed_total counter
bridge_messages_relayed_total{{target="matrix"}} {}
bridge_messages_relayed_total{{target="googlechat"}} {}

# HELP bridge_echoes_suppressed_total Inbound events recognized as the bridge's own output
# TYPE bridge_echoes_suppressed_total counter
bridge_echoes_suppressed_total {}

# HELP bridge_unresolved_references_total Edits, reactions and redactions dropped because their target never appeared
# TYPE bridge_unresolved_references_total counter
bridge_unresolved_references_total {}

# HELP bridge_send_failures_total Outbound sends that failed after retries
# TYPE bridge_send_failures_total counter
bridge_send_failures_total{{kind="transient"}} {}
bridge_send_failures_total{{kind="permanent"}} {}

# HELP bridge_active_portals Portals with a running worker
# TYPE bridge_active_portals gauge
bridge_active_portals {}
"#,
        uptime,
        matrix_received,
        chat_received,
        to_matrix,
        to_chat,
        echoes,
        unresolved,
        transient,
        permanent,
        active_portals,
    )
}
