use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;

use crate::db::{
    BridgeUser, DatabaseError, DatabaseManager, MessageMapping, Portal, Puppet, ReactionMapping,
    ThreadMapping,
};

/// Cached handle for a portal. Every caller resolving the same remote conversation
/// receives the same `Arc`.
#[derive(Debug, PartialEq, Eq)]
pub struct PortalRef {
    pub id: i64,
    pub remote_conversation_id: String,
}

/// Process-wide cross-network id registry over the repository layer.
///
/// Portal and puppet handles are cached for the process lifetime. Message, thread
/// and reaction lookups always go to storage so tombstones are never missed.
pub struct IdentityMap {
    db: DatabaseManager,
    portals: Mutex<HashMap<String, Arc<PortalRef>>>,
    rooms: Mutex<HashMap<String, Arc<PortalRef>>>,
    puppets: Mutex<HashMap<String, Puppet>>,
}

impl IdentityMap {
    pub fn new(db: DatabaseManager) -> Self {
        Self {
            db,
            portals: Mutex::new(HashMap::new()),
            rooms: Mutex::new(HashMap::new()),
            puppets: Mutex::new(HashMap::new()),
        }
    }

    pub fn database(&self) -> &DatabaseManager {
        &self.db
    }

    pub async fn resolve_portal(
        &self,
        remote_conversation_id: &str,
        is_direct: bool,
    ) -> Result<Arc<PortalRef>, DatabaseError> {
        if let Some(portal) = self.portals.lock().get(remote_conversation_id) {
            return Ok(portal.clone());
        }

        let record = self
            .db
            .portal_store()
            .create_portal_if_absent(&Portal::new(remote_conversation_id, is_direct))
            .await?;
        debug!(
            "resolved portal id={} remote={}",
            record.id, record.remote_conversation_id
        );
        Ok(self.cache_portal(&record))
    }

    pub async fn portal_by_local_room(
        &self,
        room_id: &str,
    ) -> Result<Option<Arc<PortalRef>>, DatabaseError> {
        if let Some(portal) = self.rooms.lock().get(room_id) {
            return Ok(Some(portal.clone()));
        }
        let record = self.db.portal_store().get_portal_by_local_room(room_id).await?;
        Ok(record.map(|record| self.cache_portal(&record)))
    }

    pub async fn portal_by_remote(
        &self,
        remote_conversation_id: &str,
    ) -> Result<Option<Arc<PortalRef>>, DatabaseError> {
        if let Some(portal) = self.portals.lock().get(remote_conversation_id) {
            return Ok(Some(portal.clone()));
        }
        let record = self
            .db
            .portal_store()
            .get_portal_by_remote(remote_conversation_id)
            .await?;
        Ok(record.map(|record| self.cache_portal(&record)))
    }

    pub async fn load_portal(&self, id: i64) -> Result<Option<Portal>, DatabaseError> {
        self.db.portal_store().get_portal_by_id(id).await
    }

    pub async fn save_portal(&self, portal: &Portal) -> Result<(), DatabaseError> {
        let mut portal = portal.clone();
        portal.updated_at = Utc::now();
        self.db.portal_store().update_portal(&portal).await?;
        self.cache_portal(&portal);
        Ok(())
    }

    pub async fn list_portals(&self, limit: i64, offset: i64) -> Result<Vec<Portal>, DatabaseError> {
        self.db.portal_store().list_portals(limit, offset).await
    }

    pub async fn count_portals(&self) -> Result<i64, DatabaseError> {
        self.db.portal_store().count_portals().await
    }

    fn cache_portal(&self, record: &Portal) -> Arc<PortalRef> {
        let portal = self
            .portals
            .lock()
            .entry(record.remote_conversation_id.clone())
            .or_insert_with(|| {
                Arc::new(PortalRef {
                    id: record.id,
                    remote_conversation_id: record.remote_conversation_id.clone(),
                })
            })
            .clone();
        if let Some(room_id) = &record.local_room_id {
            self.rooms.lock().insert(room_id.clone(), portal.clone());
        }
        portal
    }

    pub async fn resolve_puppet(
        &self,
        remote_user_id: &str,
        ghost_user_id: &str,
    ) -> Result<Puppet, DatabaseError> {
        if let Some(puppet) = self.puppets.lock().get(remote_user_id) {
            return Ok(puppet.clone());
        }
        let record = self
            .db
            .puppet_store()
            .create_puppet_if_absent(&Puppet::new(remote_user_id, ghost_user_id))
            .await?;
        Ok(self
            .puppets
            .lock()
            .entry(remote_user_id.to_string())
            .or_insert(record)
            .clone())
    }

    pub async fn puppet(&self, remote_user_id: &str) -> Result<Option<Puppet>, DatabaseError> {
        if let Some(puppet) = self.puppets.lock().get(remote_user_id) {
            return Ok(Some(puppet.clone()));
        }
        self.db.puppet_store().get_puppet(remote_user_id).await
    }

    pub async fn update_puppet(&self, puppet: &Puppet) -> Result<(), DatabaseError> {
        let mut puppet = puppet.clone();
        puppet.updated_at = Utc::now();
        self.db.puppet_store().update_puppet(&puppet).await?;
        self.puppets
            .lock()
            .insert(puppet.remote_user_id.clone(), puppet);
        Ok(())
    }

    /// Returns false when either side of the mapping was already recorded.
    pub async fn record_message(&self, mapping: &MessageMapping) -> Result<bool, DatabaseError> {
        self.db.message_store().insert_message(mapping).await
    }

    pub async fn lookup_by_local(
        &self,
        portal_id: i64,
        local_event_id: &str,
    ) -> Result<Option<MessageMapping>, DatabaseError> {
        self.db
            .message_store()
            .get_message_by_local(portal_id, local_event_id)
            .await
    }

    pub async fn lookup_by_remote(
        &self,
        portal_id: i64,
        remote_message_id: &str,
    ) -> Result<Option<MessageMapping>, DatabaseError> {
        self.db
            .message_store()
            .get_message_by_remote(portal_id, remote_message_id)
            .await
    }

    pub async fn update_message(&self, mapping: &MessageMapping) -> Result<(), DatabaseError> {
        let mut mapping = mapping.clone();
        mapping.updated_at = Utc::now();
        self.db.message_store().update_message(&mapping).await
    }

    pub async fn tombstone_message(&self, mapping: &MessageMapping) -> Result<(), DatabaseError> {
        let mut mapping = mapping.clone();
        mapping.deleted = true;
        self.update_message(&mapping).await
    }

    pub async fn record_thread(
        &self,
        portal_id: i64,
        remote_thread_id: &str,
        local_root_event_id: &str,
    ) -> Result<ThreadMapping, DatabaseError> {
        self.db
            .thread_store()
            .create_thread_if_absent(&ThreadMapping {
                id: 0,
                portal_id,
                remote_thread_id: remote_thread_id.to_string(),
                local_root_event_id: local_root_event_id.to_string(),
                created_at: Utc::now(),
            })
            .await
    }

    pub async fn thread_by_remote(
        &self,
        portal_id: i64,
        remote_thread_id: &str,
    ) -> Result<Option<ThreadMapping>, DatabaseError> {
        self.db
            .thread_store()
            .get_thread_by_remote(portal_id, remote_thread_id)
            .await
    }

    pub async fn thread_by_local_root(
        &self,
        portal_id: i64,
        local_root_event_id: &str,
    ) -> Result<Option<ThreadMapping>, DatabaseError> {
        self.db
            .thread_store()
            .get_thread_by_local_root(portal_id, local_root_event_id)
            .await
    }

    pub async fn record_reaction(&self, mapping: &ReactionMapping) -> Result<(), DatabaseError> {
        self.db.reaction_store().insert_reaction(mapping).await
    }

    pub async fn reaction_by_local(
        &self,
        portal_id: i64,
        local_event_id: &str,
    ) -> Result<Option<ReactionMapping>, DatabaseError> {
        self.db
            .reaction_store()
            .get_reaction_by_local(portal_id, local_event_id)
            .await
    }

    pub async fn reaction_by_remote(
        &self,
        portal_id: i64,
        remote_reaction_id: &str,
    ) -> Result<Option<ReactionMapping>, DatabaseError> {
        self.db
            .reaction_store()
            .get_reaction_by_remote(portal_id, remote_reaction_id)
            .await
    }

    pub async fn remove_reaction(&self, id: i64) -> Result<(), DatabaseError> {
        self.db.reaction_store().delete_reaction(id).await
    }

    pub async fn upsert_user(&self, user: &BridgeUser) -> Result<BridgeUser, DatabaseError> {
        self.db.user_store().upsert_user(user).await
    }

    pub async fn user_for_matrix(
        &self,
        matrix_user_id: &str,
    ) -> Result<Option<BridgeUser>, DatabaseError> {
        self.db.user_store().get_user(matrix_user_id).await
    }

    pub async fn user_for_google(
        &self,
        google_user_id: &str,
    ) -> Result<Option<BridgeUser>, DatabaseError> {
        self.db.user_store().get_user_by_google_id(google_user_id).await
    }

    pub async fn delete_user(&self, matrix_user_id: &str) -> Result<(), DatabaseError> {
        self.db.user_store().delete_user(matrix_user_id).await
    }

    pub async fn list_users(&self) -> Result<Vec<BridgeUser>, DatabaseError> {
        self.db.user_store().list_users().await
    }

    /// Links a Matrix user to a Google account in both directions: the user record
    /// carries the token for sending to Chat, and the account's puppet switches to
    /// the real Matrix user for sending to Matrix.
    pub async fn link_user(
        &self,
        matrix_user_id: &str,
        google_user_id: &str,
        access_token: &str,
        ghost_user_id: &str,
    ) -> Result<BridgeUser, DatabaseError> {
        let now = Utc::now();
        let existing = self.user_for_matrix(matrix_user_id).await?;
        let user = BridgeUser {
            id: existing.as_ref().map(|user| user.id).unwrap_or_default(),
            matrix_user_id: matrix_user_id.to_string(),
            google_user_id: Some(google_user_id.to_string()),
            access_token: Some(access_token.to_string()),
            created_at: existing.map(|user| user.created_at).unwrap_or(now),
            updated_at: now,
        };
        let user = self.upsert_user(&user).await?;

        let mut puppet = self.resolve_puppet(google_user_id, ghost_user_id).await?;
        puppet.is_double_puppeted = true;
        puppet.custom_mxid = Some(matrix_user_id.to_string());
        self.update_puppet(&puppet).await?;
        debug!(
            "linked matrix_user={} google_user={}",
            matrix_user_id, google_user_id
        );
        Ok(user)
    }

    /// Returns false when the user was not linked.
    pub async fn unlink_user(&self, matrix_user_id: &str) -> Result<bool, DatabaseError> {
        let Some(user) = self.user_for_matrix(matrix_user_id).await? else {
            return Ok(false);
        };
        if let Some(google_user_id) = &user.google_user_id
            && let Some(mut puppet) = self.puppet(google_user_id).await?
        {
            puppet.is_double_puppeted = false;
            puppet.custom_mxid = None;
            self.update_puppet(&puppet).await?;
        }
        self.delete_user(matrix_user_id).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::IdentityMap;
    use crate::db::{DatabaseManager, MessageMapping};

    #[tokio::test]
    async fn concurrent_resolution_returns_the_same_handle() {
        let identity = Arc::new(IdentityMap::new(DatabaseManager::in_memory()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let identity = identity.clone();
                tokio::spawn(async move { identity.resolve_portal("spaces/AAA", false).await })
            })
            .collect();

        let mut resolved = Vec::new();
        for handle in handles {
            resolved.push(handle.await.expect("task").expect("resolve"));
        }
        assert!(resolved.iter().all(|p| Arc::ptr_eq(p, &resolved[0])));
        assert_eq!(identity.count_portals().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn saved_room_binding_is_indexed() {
        let identity = IdentityMap::new(DatabaseManager::in_memory());
        let portal = identity
            .resolve_portal("spaces/AAA", false)
            .await
            .expect("resolve");

        let mut record = identity
            .load_portal(portal.id)
            .await
            .expect("load")
            .expect("exists");
        record.local_room_id = Some("!room:example.org".to_string());
        identity.save_portal(&record).await.expect("save");

        let by_room = identity
            .portal_by_local_room("!room:example.org")
            .await
            .expect("lookup")
            .expect("mapped");
        assert!(Arc::ptr_eq(&by_room, &portal));
        assert!(
            identity
                .portal_by_local_room("!other:example.org")
                .await
                .expect("lookup")
                .is_none()
        );
    }

    #[tokio::test]
    async fn puppets_are_created_once() {
        let identity = IdentityMap::new(DatabaseManager::in_memory());
        let first = identity
            .resolve_puppet("users/1", "@googlechat_1:example.org")
            .await
            .expect("resolve");
        let second = identity
            .resolve_puppet("users/1", "@googlechat_1:example.org")
            .await
            .expect("resolve again");
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn linking_marks_the_puppet_double_puppeted() {
        let identity = IdentityMap::new(DatabaseManager::in_memory());
        let user = identity
            .link_user(
                "@alice:example.org",
                "users/1",
                "token",
                "@googlechat_1:example.org",
            )
            .await
            .expect("link");
        assert!(user.is_linked());

        let puppet = identity.puppet("users/1").await.expect("get").expect("exists");
        assert!(puppet.is_double_puppeted);
        assert_eq!(puppet.custom_mxid.as_deref(), Some("@alice:example.org"));

        assert!(identity.unlink_user("@alice:example.org").await.expect("unlink"));
        let puppet = identity.puppet("users/1").await.expect("get").expect("exists");
        assert!(!puppet.is_double_puppeted);
        assert!(
            identity
                .user_for_matrix("@alice:example.org")
                .await
                .expect("get")
                .is_none()
        );
        assert!(!identity.unlink_user("@alice:example.org").await.expect("unlink"));
    }

    #[tokio::test]
    async fn tombstones_are_visible_to_lookups() {
        let identity = IdentityMap::new(DatabaseManager::in_memory());
        let mapping = MessageMapping::new(1, "$event", "spaces/AAA/messages/1");
        assert!(identity.record_message(&mapping).await.expect("record"));
        assert!(!identity.record_message(&mapping).await.expect("record twice"));

        let stored = identity
            .lookup_by_remote(1, "spaces/AAA/messages/1")
            .await
            .expect("lookup")
            .expect("exists");
        identity.tombstone_message(&stored).await.expect("tombstone");

        let stored = identity
            .lookup_by_local(1, "$event")
            .await
            .expect("lookup")
            .expect("still exists");
        assert!(stored.deleted);
    }

    #[tokio::test]
    async fn every_part_of_a_multi_part_message_resolves() {
        let identity = IdentityMap::new(DatabaseManager::in_memory());
        let mut mapping = MessageMapping::new(1, "$text", "spaces/AAA/messages/1");
        mapping.extra_local_event_ids = vec!["$image".to_string()];
        assert!(identity.record_message(&mapping).await.expect("record"));

        let by_part = identity
            .lookup_by_local(1, "$image")
            .await
            .expect("lookup")
            .expect("part is mapped");
        assert_eq!(by_part.remote_message_id, "spaces/AAA/messages/1");
        assert_eq!(by_part.local_event_id, "$text");
        assert!(identity.lookup_by_local(2, "$image").await.expect("lookup").is_none());
    }
}
