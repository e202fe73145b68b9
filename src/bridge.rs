use std::sync::Arc;

use thiserror::Error;

use crate::config::Config;
use crate::db::{DatabaseError, PortalState};
use crate::googlechat::GoogleChatApi;
use crate::matrix::MatrixApi;
use crate::media::MediaProxy;

pub mod echo;
pub mod event;
pub mod identity;
pub mod logic;
pub mod orchestrator;
pub mod pending;
pub mod portal;
pub mod puppet;
pub mod retry;
pub mod translator;

#[cfg(test)]
pub(crate) mod testing;

pub use self::event::{BridgeEvent, EventKind, Network};
pub use self::identity::{IdentityMap, PortalRef};
pub use self::orchestrator::SyncOrchestrator;
pub use self::portal::{Portal, PortalCommand};
pub use self::puppet::Puppets;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),
    #[error("permanent rejection: {0}")]
    PermanentRejection(String),
    #[error("unresolved reference to {target} in portal {portal_id}")]
    UnresolvedReference { portal_id: i64, target: String },
    #[error("translation unsupported: {0}")]
    TranslationUnsupported(String),
    #[error("storage error: {0}")]
    Storage(#[from] DatabaseError),
    #[error("invalid portal transition {from:?} -> {to:?}")]
    InvalidTransition { from: PortalState, to: PortalState },
}

/// Failure of an outbound call to either network.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("transient send failure: {0}")]
    Transient(String),
    #[error("permanent send failure: {0}")]
    Permanent(String),
}

impl SendError {
    /// Rate limits and server errors are worth retrying; other client errors are not.
    pub fn from_status(status: u16, body: impl AsRef<str>) -> Self {
        let message = format!("status {status}: {}", body.as_ref());
        if status == 408 || status == 429 || status >= 500 {
            SendError::Transient(message)
        } else {
            SendError::Permanent(message)
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SendError::Transient(_))
    }
}

impl From<SendError> for BridgeError {
    fn from(value: SendError) -> Self {
        match value {
            SendError::Transient(message) => BridgeError::TransientNetwork(message),
            SendError::Permanent(message) => BridgeError::PermanentRejection(message),
        }
    }
}

impl From<reqwest::Error> for SendError {
    fn from(value: reqwest::Error) -> Self {
        match value.status() {
            Some(status) => SendError::from_status(status.as_u16(), value.to_string()),
            None => SendError::Transient(value.to_string()),
        }
    }
}

/// Collaborators shared by every portal worker.
#[derive(Clone)]
pub struct BridgeContext {
    pub config: Arc<Config>,
    pub identity: Arc<IdentityMap>,
    pub puppets: Arc<Puppets>,
    pub matrix: Arc<dyn MatrixApi>,
    pub chat: Arc<dyn GoogleChatApi>,
    pub media: Arc<dyn MediaProxy>,
}

impl BridgeContext {
    /// Events authored by the bridge itself must never be relayed back.
    pub fn is_bridge_output(&self, network: Network, sender: &str) -> bool {
        match network {
            Network::Matrix => {
                sender == self.matrix.bot_user_id() || self.puppets.is_ghost_user_id(sender)
            }
            Network::GoogleChat => sender == self.chat.bot_user_id(),
        }
    }
}
