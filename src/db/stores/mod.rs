use async_trait::async_trait;

use super::DatabaseError;
use super::models::{BridgeUser, MessageMapping, Portal, Puppet, ReactionMapping, ThreadMapping};

#[async_trait]
pub trait PortalStore: Send + Sync {
    async fn get_portal_by_remote(
        &self,
        remote_conversation_id: &str,
    ) -> Result<Option<Portal>, DatabaseError>;
    async fn get_portal_by_local_room(
        &self,
        room_id: &str,
    ) -> Result<Option<Portal>, DatabaseError>;
    async fn get_portal_by_id(&self, id: i64) -> Result<Option<Portal>, DatabaseError>;
    /// Inserts unless a portal for the same remote conversation exists, then returns the stored row.
    async fn create_portal_if_absent(&self, portal: &Portal) -> Result<Portal, DatabaseError>;
    async fn update_portal(&self, portal: &Portal) -> Result<(), DatabaseError>;
    async fn count_portals(&self) -> Result<i64, DatabaseError>;
    async fn list_portals(&self, limit: i64, offset: i64) -> Result<Vec<Portal>, DatabaseError>;
}

#[async_trait]
pub trait PuppetStore: Send + Sync {
    async fn get_puppet(&self, remote_user_id: &str) -> Result<Option<Puppet>, DatabaseError>;
    async fn get_puppet_by_ghost(
        &self,
        ghost_user_id: &str,
    ) -> Result<Option<Puppet>, DatabaseError>;
    async fn create_puppet_if_absent(&self, puppet: &Puppet) -> Result<Puppet, DatabaseError>;
    async fn update_puppet(&self, puppet: &Puppet) -> Result<(), DatabaseError>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_user(&self, matrix_user_id: &str) -> Result<Option<BridgeUser>, DatabaseError>;
    async fn get_user_by_google_id(
        &self,
        google_user_id: &str,
    ) -> Result<Option<BridgeUser>, DatabaseError>;
    async fn upsert_user(&self, user: &BridgeUser) -> Result<BridgeUser, DatabaseError>;
    async fn delete_user(&self, matrix_user_id: &str) -> Result<(), DatabaseError>;
    async fn list_users(&self) -> Result<Vec<BridgeUser>, DatabaseError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Returns `false` when a mapping for either id already exists in the portal.
    async fn insert_message(&self, mapping: &MessageMapping) -> Result<bool, DatabaseError>;
    async fn get_message_by_local(
        &self,
        portal_id: i64,
        local_event_id: &str,
    ) -> Result<Option<MessageMapping>, DatabaseError>;
    async fn get_message_by_remote(
        &self,
        portal_id: i64,
        remote_message_id: &str,
    ) -> Result<Option<MessageMapping>, DatabaseError>;
    async fn update_message(&self, mapping: &MessageMapping) -> Result<(), DatabaseError>;
}

#[async_trait]
pub trait ThreadStore: Send + Sync {
    async fn create_thread_if_absent(
        &self,
        mapping: &ThreadMapping,
    ) -> Result<ThreadMapping, DatabaseError>;
    async fn get_thread_by_remote(
        &self,
        portal_id: i64,
        remote_thread_id: &str,
    ) -> Result<Option<ThreadMapping>, DatabaseError>;
    async fn get_thread_by_local_root(
        &self,
        portal_id: i64,
        local_root_event_id: &str,
    ) -> Result<Option<ThreadMapping>, DatabaseError>;
}

#[async_trait]
pub trait ReactionStore: Send + Sync {
    async fn insert_reaction(&self, mapping: &ReactionMapping) -> Result<(), DatabaseError>;
    async fn get_reaction_by_local(
        &self,
        portal_id: i64,
        local_event_id: &str,
    ) -> Result<Option<ReactionMapping>, DatabaseError>;
    async fn get_reaction_by_remote(
        &self,
        portal_id: i64,
        remote_reaction_id: &str,
    ) -> Result<Option<ReactionMapping>, DatabaseError>;
    async fn delete_reaction(&self, id: i64) -> Result<(), DatabaseError>;
}
