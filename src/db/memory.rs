use async_trait::async_trait;
use parking_lot::Mutex;

use super::models::{BridgeUser, MessageMapping, Portal, Puppet, ReactionMapping, ThreadMapping};
use super::{
    DatabaseError, MessageStore, PortalStore, PuppetStore, ReactionStore, ThreadStore, UserStore,
};

#[derive(Default)]
struct Tables {
    next_id: i64,
    portals: Vec<Portal>,
    puppets: Vec<Puppet>,
    users: Vec<BridgeUser>,
    messages: Vec<MessageMapping>,
    threads: Vec<ThreadMapping>,
    reactions: Vec<ReactionMapping>,
}

impl Tables {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Non-persistent store selected with a `memory://` database url. Used by tests and
/// throwaway deployments.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PortalStore for MemoryStore {
    async fn get_portal_by_remote(
        &self,
        remote_conversation_id: &str,
    ) -> Result<Option<Portal>, DatabaseError> {
        let tables = self.tables.lock();
        Ok(tables
            .portals
            .iter()
            .find(|p| p.remote_conversation_id == remote_conversation_id)
            .cloned())
    }

    async fn get_portal_by_local_room(
        &self,
        room_id: &str,
    ) -> Result<Option<Portal>, DatabaseError> {
        let tables = self.tables.lock();
        Ok(tables
            .portals
            .iter()
            .find(|p| p.local_room_id.as_deref() == Some(room_id))
            .cloned())
    }

    async fn get_portal_by_id(&self, id: i64) -> Result<Option<Portal>, DatabaseError> {
        let tables = self.tables.lock();
        Ok(tables.portals.iter().find(|p| p.id == id).cloned())
    }

    async fn create_portal_if_absent(&self, portal: &Portal) -> Result<Portal, DatabaseError> {
        let mut tables = self.tables.lock();
        if let Some(existing) = tables
            .portals
            .iter()
            .find(|p| p.remote_conversation_id == portal.remote_conversation_id)
        {
            return Ok(existing.clone());
        }
        let mut row = portal.clone();
        row.id = tables.allocate_id();
        tables.portals.push(row.clone());
        Ok(row)
    }

    async fn update_portal(&self, portal: &Portal) -> Result<(), DatabaseError> {
        let mut tables = self.tables.lock();
        if let Some(room_id) = portal.local_room_id.as_deref() {
            let taken = tables
                .portals
                .iter()
                .any(|p| p.id != portal.id && p.local_room_id.as_deref() == Some(room_id));
            if taken {
                return Err(DatabaseError::Query(format!(
                    "room {room_id} already belongs to another portal"
                )));
            }
        }
        if let Some(row) = tables.portals.iter_mut().find(|p| p.id == portal.id) {
            *row = portal.clone();
        }
        Ok(())
    }

    async fn count_portals(&self) -> Result<i64, DatabaseError> {
        Ok(self.tables.lock().portals.len() as i64)
    }

    async fn list_portals(&self, limit: i64, offset: i64) -> Result<Vec<Portal>, DatabaseError> {
        let tables = self.tables.lock();
        Ok(tables
            .portals
            .iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PuppetStore for MemoryStore {
    async fn get_puppet(&self, remote_user_id: &str) -> Result<Option<Puppet>, DatabaseError> {
        let tables = self.tables.lock();
        Ok(tables
            .puppets
            .iter()
            .find(|p| p.remote_user_id == remote_user_id)
            .cloned())
    }

    async fn get_puppet_by_ghost(
        &self,
        ghost_user_id: &str,
    ) -> Result<Option<Puppet>, DatabaseError> {
        let tables = self.tables.lock();
        Ok(tables
            .puppets
            .iter()
            .find(|p| p.ghost_user_id == ghost_user_id)
            .cloned())
    }

    async fn create_puppet_if_absent(&self, puppet: &Puppet) -> Result<Puppet, DatabaseError> {
        let mut tables = self.tables.lock();
        if let Some(existing) = tables
            .puppets
            .iter()
            .find(|p| p.remote_user_id == puppet.remote_user_id)
        {
            return Ok(existing.clone());
        }
        let mut row = puppet.clone();
        row.id = tables.allocate_id();
        tables.puppets.push(row.clone());
        Ok(row)
    }

    async fn update_puppet(&self, puppet: &Puppet) -> Result<(), DatabaseError> {
        let mut tables = self.tables.lock();
        if let Some(row) = tables.puppets.iter_mut().find(|p| p.id == puppet.id) {
            *row = puppet.clone();
        }
        Ok(())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn get_user(&self, matrix_user_id: &str) -> Result<Option<BridgeUser>, DatabaseError> {
        let tables = self.tables.lock();
        Ok(tables
            .users
            .iter()
            .find(|u| u.matrix_user_id == matrix_user_id)
            .cloned())
    }

    async fn get_user_by_google_id(
        &self,
        google_user_id: &str,
    ) -> Result<Option<BridgeUser>, DatabaseError> {
        let tables = self.tables.lock();
        Ok(tables
            .users
            .iter()
            .find(|u| u.google_user_id.as_deref() == Some(google_user_id))
            .cloned())
    }

    async fn upsert_user(&self, user: &BridgeUser) -> Result<BridgeUser, DatabaseError> {
        let mut tables = self.tables.lock();
        if let Some(row) = tables
            .users
            .iter_mut()
            .find(|u| u.matrix_user_id == user.matrix_user_id)
        {
            row.google_user_id = user.google_user_id.clone();
            row.access_token = user.access_token.clone();
            row.updated_at = user.updated_at;
            return Ok(row.clone());
        }
        let mut row = user.clone();
        row.id = tables.allocate_id();
        tables.users.push(row.clone());
        Ok(row)
    }

    async fn delete_user(&self, matrix_user_id: &str) -> Result<(), DatabaseError> {
        self.tables
            .lock()
            .users
            .retain(|u| u.matrix_user_id != matrix_user_id);
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<BridgeUser>, DatabaseError> {
        Ok(self.tables.lock().users.clone())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert_message(&self, mapping: &MessageMapping) -> Result<bool, DatabaseError> {
        let mut tables = self.tables.lock();
        let exists = tables.messages.iter().any(|m| {
            m.portal_id == mapping.portal_id
                && (m.local_event_id == mapping.local_event_id
                    || m.remote_message_id == mapping.remote_message_id)
        });
        if exists {
            return Ok(false);
        }
        let mut row = mapping.clone();
        row.id = tables.allocate_id();
        tables.messages.push(row);
        Ok(true)
    }

    async fn get_message_by_local(
        &self,
        portal_id: i64,
        local_event_id: &str,
    ) -> Result<Option<MessageMapping>, DatabaseError> {
        let tables = self.tables.lock();
        Ok(tables
            .messages
            .iter()
            .find(|m| m.portal_id == portal_id && m.covers_local_event(local_event_id))
            .cloned())
    }

    async fn get_message_by_remote(
        &self,
        portal_id: i64,
        remote_message_id: &str,
    ) -> Result<Option<MessageMapping>, DatabaseError> {
        let tables = self.tables.lock();
        Ok(tables
            .messages
            .iter()
            .find(|m| m.portal_id == portal_id && m.remote_message_id == remote_message_id)
            .cloned())
    }

    async fn update_message(&self, mapping: &MessageMapping) -> Result<(), DatabaseError> {
        let mut tables = self.tables.lock();
        if let Some(row) = tables.messages.iter_mut().find(|m| m.id == mapping.id) {
            *row = mapping.clone();
        }
        Ok(())
    }
}

#[async_trait]
impl ThreadStore for MemoryStore {
    async fn create_thread_if_absent(
        &self,
        mapping: &ThreadMapping,
    ) -> Result<ThreadMapping, DatabaseError> {
        let mut tables = self.tables.lock();
        if let Some(existing) = tables.threads.iter().find(|t| {
            t.portal_id == mapping.portal_id && t.remote_thread_id == mapping.remote_thread_id
        }) {
            return Ok(existing.clone());
        }
        let mut row = mapping.clone();
        row.id = tables.allocate_id();
        tables.threads.push(row.clone());
        Ok(row)
    }

    async fn get_thread_by_remote(
        &self,
        portal_id: i64,
        remote_thread_id: &str,
    ) -> Result<Option<ThreadMapping>, DatabaseError> {
        let tables = self.tables.lock();
        Ok(tables
            .threads
            .iter()
            .find(|t| t.portal_id == portal_id && t.remote_thread_id == remote_thread_id)
            .cloned())
    }

    async fn get_thread_by_local_root(
        &self,
        portal_id: i64,
        local_root_event_id: &str,
    ) -> Result<Option<ThreadMapping>, DatabaseError> {
        let tables = self.tables.lock();
        Ok(tables
            .threads
            .iter()
            .find(|t| t.portal_id == portal_id && t.local_root_event_id == local_root_event_id)
            .cloned())
    }
}

#[async_trait]
impl ReactionStore for MemoryStore {
    async fn insert_reaction(&self, mapping: &ReactionMapping) -> Result<(), DatabaseError> {
        let mut tables = self.tables.lock();
        let exists = tables.reactions.iter().any(|r| {
            r.portal_id == mapping.portal_id
                && (r.local_event_id == mapping.local_event_id
                    || r.remote_reaction_id == mapping.remote_reaction_id)
        });
        if !exists {
            let mut row = mapping.clone();
            row.id = tables.allocate_id();
            tables.reactions.push(row);
        }
        Ok(())
    }

    async fn get_reaction_by_local(
        &self,
        portal_id: i64,
        local_event_id: &str,
    ) -> Result<Option<ReactionMapping>, DatabaseError> {
        let tables = self.tables.lock();
        Ok(tables
            .reactions
            .iter()
            .find(|r| r.portal_id == portal_id && r.local_event_id == local_event_id)
            .cloned())
    }

    async fn get_reaction_by_remote(
        &self,
        portal_id: i64,
        remote_reaction_id: &str,
    ) -> Result<Option<ReactionMapping>, DatabaseError> {
        let tables = self.tables.lock();
        Ok(tables
            .reactions
            .iter()
            .find(|r| r.portal_id == portal_id && r.remote_reaction_id == remote_reaction_id)
            .cloned())
    }

    async fn delete_reaction(&self, id: i64) -> Result<(), DatabaseError> {
        self.tables.lock().reactions.retain(|r| r.id != id);
        Ok(())
    }
}
