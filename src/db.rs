pub use self::error::DatabaseError;
pub use self::manager::DatabaseManager;
pub use self::models::{
    BridgeUser, MessageMapping, Portal, PortalState, Puppet, ReactionMapping, ThreadMapping,
};
pub use self::stores::{
    MessageStore, PortalStore, PuppetStore, ReactionStore, ThreadStore, UserStore,
};

pub mod error;
pub mod manager;
pub mod memory;
pub mod models;
pub mod stores;

#[cfg(any(feature = "postgres", feature = "sqlite"))]
pub mod diesel_store;
#[cfg(any(feature = "postgres", feature = "sqlite"))]
pub mod schema;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "sqlite")]
pub mod sqlite;
