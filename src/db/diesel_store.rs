use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, R2D2Connection};

use super::DatabaseError;
use super::models::{
    BridgeUser, MessageMapping, Portal, PortalState, Puppet, ReactionMapping, ThreadMapping,
};
use super::schema::{
    message_mappings, portals, puppets, reaction_mappings, thread_mappings, users,
};

/// Store backed by an r2d2 pool; the store traits are implemented per connection type
/// through [`impl_diesel_stores`].
pub struct DieselStore<C>
where
    C: R2D2Connection + Send + 'static,
{
    pool: Pool<ConnectionManager<C>>,
}

impl<C> DieselStore<C>
where
    C: R2D2Connection + Send + 'static,
{
    pub fn new(pool: Pool<ConnectionManager<C>>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool<ConnectionManager<C>> {
        &self.pool
    }

    pub(crate) async fn run<T, F>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&mut C) -> Result<T, DatabaseError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| DatabaseError::Unavailable(e.to_string()))?;
            f(&mut *conn)
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }
}

pub(crate) fn query_err(e: diesel::result::Error) -> DatabaseError {
    DatabaseError::Query(e.to_string())
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| DatabaseError::Query(format!("invalid timestamp: {ms}")))
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = portals)]
pub(crate) struct DbPortal {
    id: i64,
    remote_conversation_id: String,
    local_room_id: Option<String>,
    is_direct: bool,
    name: Option<String>,
    topic: Option<String>,
    state: String,
    last_processed_remote_event_id: Option<String>,
    last_processed_local_event_id: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl DbPortal {
    pub(crate) fn into_portal(self) -> Result<Portal, DatabaseError> {
        let state = PortalState::parse(&self.state).ok_or_else(|| {
            DatabaseError::Query(format!("unknown portal state: {}", self.state))
        })?;
        Ok(Portal {
            id: self.id,
            remote_conversation_id: self.remote_conversation_id,
            local_room_id: self.local_room_id,
            is_direct: self.is_direct,
            name: self.name,
            topic: self.topic,
            state,
            last_processed_remote_event_id: self.last_processed_remote_event_id,
            last_processed_local_event_id: self.last_processed_local_event_id,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = portals)]
pub(crate) struct NewPortal {
    remote_conversation_id: String,
    local_room_id: Option<String>,
    is_direct: bool,
    name: Option<String>,
    topic: Option<String>,
    state: &'static str,
    last_processed_remote_event_id: Option<String>,
    last_processed_local_event_id: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl From<&Portal> for NewPortal {
    fn from(portal: &Portal) -> Self {
        Self {
            remote_conversation_id: portal.remote_conversation_id.clone(),
            local_room_id: portal.local_room_id.clone(),
            is_direct: portal.is_direct,
            name: portal.name.clone(),
            topic: portal.topic.clone(),
            state: portal.state.as_str(),
            last_processed_remote_event_id: portal.last_processed_remote_event_id.clone(),
            last_processed_local_event_id: portal.last_processed_local_event_id.clone(),
            created_at: portal.created_at.timestamp_millis(),
            updated_at: portal.updated_at.timestamp_millis(),
        }
    }
}

#[derive(AsChangeset)]
#[diesel(table_name = portals, treat_none_as_null = true)]
pub(crate) struct UpdatePortal {
    local_room_id: Option<String>,
    is_direct: bool,
    name: Option<String>,
    topic: Option<String>,
    state: &'static str,
    last_processed_remote_event_id: Option<String>,
    last_processed_local_event_id: Option<String>,
    updated_at: i64,
}

impl From<&Portal> for UpdatePortal {
    fn from(portal: &Portal) -> Self {
        Self {
            local_room_id: portal.local_room_id.clone(),
            is_direct: portal.is_direct,
            name: portal.name.clone(),
            topic: portal.topic.clone(),
            state: portal.state.as_str(),
            last_processed_remote_event_id: portal.last_processed_remote_event_id.clone(),
            last_processed_local_event_id: portal.last_processed_local_event_id.clone(),
            updated_at: portal.updated_at.timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = puppets)]
pub(crate) struct DbPuppet {
    id: i64,
    remote_user_id: String,
    ghost_user_id: String,
    display_name: Option<String>,
    avatar_url: Option<String>,
    is_registered: bool,
    is_double_puppeted: bool,
    custom_mxid: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl DbPuppet {
    pub(crate) fn into_puppet(self) -> Result<Puppet, DatabaseError> {
        Ok(Puppet {
            id: self.id,
            remote_user_id: self.remote_user_id,
            ghost_user_id: self.ghost_user_id,
            display_name: self.display_name,
            avatar_url: self.avatar_url,
            is_registered: self.is_registered,
            is_double_puppeted: self.is_double_puppeted,
            custom_mxid: self.custom_mxid,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = puppets)]
pub(crate) struct NewPuppet {
    remote_user_id: String,
    ghost_user_id: String,
    display_name: Option<String>,
    avatar_url: Option<String>,
    is_registered: bool,
    is_double_puppeted: bool,
    custom_mxid: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl From<&Puppet> for NewPuppet {
    fn from(puppet: &Puppet) -> Self {
        Self {
            remote_user_id: puppet.remote_user_id.clone(),
            ghost_user_id: puppet.ghost_user_id.clone(),
            display_name: puppet.display_name.clone(),
            avatar_url: puppet.avatar_url.clone(),
            is_registered: puppet.is_registered,
            is_double_puppeted: puppet.is_double_puppeted,
            custom_mxid: puppet.custom_mxid.clone(),
            created_at: puppet.created_at.timestamp_millis(),
            updated_at: puppet.updated_at.timestamp_millis(),
        }
    }
}

#[derive(AsChangeset)]
#[diesel(table_name = puppets, treat_none_as_null = true)]
pub(crate) struct UpdatePuppet {
    display_name: Option<String>,
    avatar_url: Option<String>,
    is_registered: bool,
    is_double_puppeted: bool,
    custom_mxid: Option<String>,
    updated_at: i64,
}

impl From<&Puppet> for UpdatePuppet {
    fn from(puppet: &Puppet) -> Self {
        Self {
            display_name: puppet.display_name.clone(),
            avatar_url: puppet.avatar_url.clone(),
            is_registered: puppet.is_registered,
            is_double_puppeted: puppet.is_double_puppeted,
            custom_mxid: puppet.custom_mxid.clone(),
            updated_at: puppet.updated_at.timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = users)]
pub(crate) struct DbUser {
    id: i64,
    matrix_user_id: String,
    google_user_id: Option<String>,
    access_token: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl DbUser {
    pub(crate) fn into_user(self) -> Result<BridgeUser, DatabaseError> {
        Ok(BridgeUser {
            id: self.id,
            matrix_user_id: self.matrix_user_id,
            google_user_id: self.google_user_id,
            access_token: self.access_token,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = users)]
pub(crate) struct NewUser {
    matrix_user_id: String,
    google_user_id: Option<String>,
    access_token: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl From<&BridgeUser> for NewUser {
    fn from(user: &BridgeUser) -> Self {
        Self {
            matrix_user_id: user.matrix_user_id.clone(),
            google_user_id: user.google_user_id.clone(),
            access_token: user.access_token.clone(),
            created_at: user.created_at.timestamp_millis(),
            updated_at: user.updated_at.timestamp_millis(),
        }
    }
}

#[derive(AsChangeset)]
#[diesel(table_name = users, treat_none_as_null = true)]
pub(crate) struct UpdateUser {
    google_user_id: Option<String>,
    access_token: Option<String>,
    updated_at: i64,
}

impl From<&BridgeUser> for UpdateUser {
    fn from(user: &BridgeUser) -> Self {
        Self {
            google_user_id: user.google_user_id.clone(),
            access_token: user.access_token.clone(),
            updated_at: user.updated_at.timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = message_mappings)]
pub(crate) struct DbMessageMapping {
    id: i64,
    portal_id: i64,
    local_event_id: String,
    remote_message_id: String,
    thread_root_remote_id: Option<String>,
    sender_puppet_id: Option<i64>,
    sent_by_bridge: bool,
    edit_count: i32,
    deleted: bool,
    extra_local_event_ids: String,
    created_at: i64,
    updated_at: i64,
}

impl DbMessageMapping {
    pub(crate) fn into_mapping(self) -> Result<MessageMapping, DatabaseError> {
        let extra_local_event_ids = serde_json::from_str(&self.extra_local_event_ids)
            .map_err(|e| DatabaseError::Query(format!("invalid extra event ids: {e}")))?;
        Ok(MessageMapping {
            id: self.id,
            portal_id: self.portal_id,
            local_event_id: self.local_event_id,
            remote_message_id: self.remote_message_id,
            thread_root_remote_id: self.thread_root_remote_id,
            sender_puppet_id: self.sender_puppet_id,
            sent_by_bridge: self.sent_by_bridge,
            edit_count: self.edit_count,
            deleted: self.deleted,
            extra_local_event_ids,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
        })
    }
}

fn encode_event_ids(ids: &[String]) -> String {
    serde_json::to_string(ids).unwrap_or_else(|_| "[]".to_string())
}

#[derive(Insertable)]
#[diesel(table_name = message_mappings)]
pub(crate) struct NewMessageMapping {
    portal_id: i64,
    local_event_id: String,
    remote_message_id: String,
    thread_root_remote_id: Option<String>,
    sender_puppet_id: Option<i64>,
    sent_by_bridge: bool,
    edit_count: i32,
    deleted: bool,
    extra_local_event_ids: String,
    created_at: i64,
    updated_at: i64,
}

impl From<&MessageMapping> for NewMessageMapping {
    fn from(mapping: &MessageMapping) -> Self {
        Self {
            portal_id: mapping.portal_id,
            local_event_id: mapping.local_event_id.clone(),
            remote_message_id: mapping.remote_message_id.clone(),
            thread_root_remote_id: mapping.thread_root_remote_id.clone(),
            sender_puppet_id: mapping.sender_puppet_id,
            sent_by_bridge: mapping.sent_by_bridge,
            edit_count: mapping.edit_count,
            deleted: mapping.deleted,
            extra_local_event_ids: encode_event_ids(&mapping.extra_local_event_ids),
            created_at: mapping.created_at.timestamp_millis(),
            updated_at: mapping.updated_at.timestamp_millis(),
        }
    }
}

#[derive(AsChangeset)]
#[diesel(table_name = message_mappings, treat_none_as_null = true)]
pub(crate) struct UpdateMessageMapping {
    local_event_id: String,
    remote_message_id: String,
    thread_root_remote_id: Option<String>,
    edit_count: i32,
    deleted: bool,
    extra_local_event_ids: String,
    updated_at: i64,
}

impl From<&MessageMapping> for UpdateMessageMapping {
    fn from(mapping: &MessageMapping) -> Self {
        Self {
            local_event_id: mapping.local_event_id.clone(),
            remote_message_id: mapping.remote_message_id.clone(),
            thread_root_remote_id: mapping.thread_root_remote_id.clone(),
            edit_count: mapping.edit_count,
            deleted: mapping.deleted,
            extra_local_event_ids: encode_event_ids(&mapping.extra_local_event_ids),
            updated_at: mapping.updated_at.timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = thread_mappings)]
pub(crate) struct DbThreadMapping {
    id: i64,
    portal_id: i64,
    remote_thread_id: String,
    local_root_event_id: String,
    created_at: i64,
}

impl DbThreadMapping {
    pub(crate) fn into_mapping(self) -> Result<ThreadMapping, DatabaseError> {
        Ok(ThreadMapping {
            id: self.id,
            portal_id: self.portal_id,
            remote_thread_id: self.remote_thread_id,
            local_root_event_id: self.local_root_event_id,
            created_at: from_millis(self.created_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = thread_mappings)]
pub(crate) struct NewThreadMapping {
    portal_id: i64,
    remote_thread_id: String,
    local_root_event_id: String,
    created_at: i64,
}

impl From<&ThreadMapping> for NewThreadMapping {
    fn from(mapping: &ThreadMapping) -> Self {
        Self {
            portal_id: mapping.portal_id,
            remote_thread_id: mapping.remote_thread_id.clone(),
            local_root_event_id: mapping.local_root_event_id.clone(),
            created_at: mapping.created_at.timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = reaction_mappings)]
pub(crate) struct DbReactionMapping {
    id: i64,
    portal_id: i64,
    local_event_id: String,
    remote_reaction_id: String,
    target_remote_message_id: String,
    target_local_event_id: String,
    key: String,
    sender: String,
    is_fallback_note: bool,
    created_at: i64,
}

impl DbReactionMapping {
    pub(crate) fn into_mapping(self) -> Result<ReactionMapping, DatabaseError> {
        Ok(ReactionMapping {
            id: self.id,
            portal_id: self.portal_id,
            local_event_id: self.local_event_id,
            remote_reaction_id: self.remote_reaction_id,
            target_remote_message_id: self.target_remote_message_id,
            target_local_event_id: self.target_local_event_id,
            key: self.key,
            sender: self.sender,
            is_fallback_note: self.is_fallback_note,
            created_at: from_millis(self.created_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = reaction_mappings)]
pub(crate) struct NewReactionMapping {
    portal_id: i64,
    local_event_id: String,
    remote_reaction_id: String,
    target_remote_message_id: String,
    target_local_event_id: String,
    key: String,
    sender: String,
    is_fallback_note: bool,
    created_at: i64,
}

impl From<&ReactionMapping> for NewReactionMapping {
    fn from(mapping: &ReactionMapping) -> Self {
        Self {
            portal_id: mapping.portal_id,
            local_event_id: mapping.local_event_id.clone(),
            remote_reaction_id: mapping.remote_reaction_id.clone(),
            target_remote_message_id: mapping.target_remote_message_id.clone(),
            target_local_event_id: mapping.target_local_event_id.clone(),
            key: mapping.key.clone(),
            sender: mapping.sender.clone(),
            is_fallback_note: mapping.is_fallback_note,
            created_at: mapping.created_at.timestamp_millis(),
        }
    }
}

/// Implements every store trait for `DieselStore<$conn>`.
///
/// The query bodies are identical across backends; only the connection type differs, and
/// diesel needs it to be concrete at each call site. Pass a fully qualified type path.
macro_rules! impl_diesel_stores {
    ($conn:ty) => {
        mod store_impls {
        use async_trait::async_trait;
        use diesel::prelude::*;

        use $crate::db::DatabaseError;
        use $crate::db::diesel_store::{
            DbMessageMapping, DbPortal, DbPuppet, DbReactionMapping, DbThreadMapping, DbUser,
            DieselStore, NewMessageMapping, NewPortal, NewPuppet, NewReactionMapping,
            NewThreadMapping, NewUser, UpdateMessageMapping, UpdatePortal, UpdatePuppet,
            UpdateUser, query_err,
        };
        use $crate::db::models::{
            BridgeUser, MessageMapping, Portal, Puppet, ReactionMapping, ThreadMapping,
        };
        use $crate::db::schema::{
            message_mappings, portals, puppets, reaction_mappings, thread_mappings, users,
        };

        #[async_trait]
        impl $crate::db::PortalStore for DieselStore<$conn> {
            async fn get_portal_by_remote(
                &self,
                remote_conversation_id: &str,
            ) -> Result<Option<Portal>, DatabaseError> {
                let remote = remote_conversation_id.to_string();
                self.run(move |conn: &mut $conn| {
                    portals::table
                        .filter(portals::remote_conversation_id.eq(remote))
                        .select(DbPortal::as_select())
                        .first::<DbPortal>(conn)
                        .optional()
                        .map_err(query_err)?
                        .map(DbPortal::into_portal)
                        .transpose()
                })
                .await
            }

            async fn get_portal_by_local_room(
                &self,
                room_id: &str,
            ) -> Result<Option<Portal>, DatabaseError> {
                let room_id = room_id.to_string();
                self.run(move |conn: &mut $conn| {
                    portals::table
                        .filter(portals::local_room_id.eq(room_id))
                        .select(DbPortal::as_select())
                        .first::<DbPortal>(conn)
                        .optional()
                        .map_err(query_err)?
                        .map(DbPortal::into_portal)
                        .transpose()
                })
                .await
            }

            async fn get_portal_by_id(&self, id: i64) -> Result<Option<Portal>, DatabaseError> {
                self.run(move |conn: &mut $conn| {
                    portals::table
                        .find(id)
                        .select(DbPortal::as_select())
                        .first::<DbPortal>(conn)
                        .optional()
                        .map_err(query_err)?
                        .map(DbPortal::into_portal)
                        .transpose()
                })
                .await
            }

            async fn create_portal_if_absent(
                &self,
                portal: &Portal,
            ) -> Result<Portal, DatabaseError> {
                let row = NewPortal::from(portal);
                let remote = portal.remote_conversation_id.clone();
                self.run(move |conn: &mut $conn| {
                    diesel::insert_into(portals::table)
                        .values(&row)
                        .on_conflict_do_nothing()
                        .execute(conn)
                        .map_err(query_err)?;
                    portals::table
                        .filter(portals::remote_conversation_id.eq(remote))
                        .select(DbPortal::as_select())
                        .first::<DbPortal>(conn)
                        .map_err(query_err)?
                        .into_portal()
                })
                .await
            }

            async fn update_portal(&self, portal: &Portal) -> Result<(), DatabaseError> {
                let id = portal.id;
                let changes = UpdatePortal::from(portal);
                self.run(move |conn: &mut $conn| {
                    diesel::update(portals::table.find(id))
                        .set(&changes)
                        .execute(conn)
                        .map_err(query_err)?;
                    Ok(())
                })
                .await
            }

            async fn count_portals(&self) -> Result<i64, DatabaseError> {
                self.run(move |conn: &mut $conn| {
                    portals::table
                        .count()
                        .get_result::<i64>(conn)
                        .map_err(query_err)
                })
                .await
            }

            async fn list_portals(
                &self,
                limit: i64,
                offset: i64,
            ) -> Result<Vec<Portal>, DatabaseError> {
                self.run(move |conn: &mut $conn| {
                    portals::table
                        .order(portals::id.asc())
                        .limit(limit)
                        .offset(offset)
                        .select(DbPortal::as_select())
                        .load::<DbPortal>(conn)
                        .map_err(query_err)?
                        .into_iter()
                        .map(DbPortal::into_portal)
                        .collect()
                })
                .await
            }
        }

        #[async_trait]
        impl $crate::db::PuppetStore for DieselStore<$conn> {
            async fn get_puppet(
                &self,
                remote_user_id: &str,
            ) -> Result<Option<Puppet>, DatabaseError> {
                let remote = remote_user_id.to_string();
                self.run(move |conn: &mut $conn| {
                    puppets::table
                        .filter(puppets::remote_user_id.eq(remote))
                        .select(DbPuppet::as_select())
                        .first::<DbPuppet>(conn)
                        .optional()
                        .map_err(query_err)?
                        .map(DbPuppet::into_puppet)
                        .transpose()
                })
                .await
            }

            async fn get_puppet_by_ghost(
                &self,
                ghost_user_id: &str,
            ) -> Result<Option<Puppet>, DatabaseError> {
                let ghost = ghost_user_id.to_string();
                self.run(move |conn: &mut $conn| {
                    puppets::table
                        .filter(puppets::ghost_user_id.eq(ghost))
                        .select(DbPuppet::as_select())
                        .first::<DbPuppet>(conn)
                        .optional()
                        .map_err(query_err)?
                        .map(DbPuppet::into_puppet)
                        .transpose()
                })
                .await
            }

            async fn create_puppet_if_absent(
                &self,
                puppet: &Puppet,
            ) -> Result<Puppet, DatabaseError> {
                let row = NewPuppet::from(puppet);
                let remote = puppet.remote_user_id.clone();
                self.run(move |conn: &mut $conn| {
                    diesel::insert_into(puppets::table)
                        .values(&row)
                        .on_conflict_do_nothing()
                        .execute(conn)
                        .map_err(query_err)?;
                    puppets::table
                        .filter(puppets::remote_user_id.eq(remote))
                        .select(DbPuppet::as_select())
                        .first::<DbPuppet>(conn)
                        .map_err(query_err)?
                        .into_puppet()
                })
                .await
            }

            async fn update_puppet(&self, puppet: &Puppet) -> Result<(), DatabaseError> {
                let id = puppet.id;
                let changes = UpdatePuppet::from(puppet);
                self.run(move |conn: &mut $conn| {
                    diesel::update(puppets::table.find(id))
                        .set(&changes)
                        .execute(conn)
                        .map_err(query_err)?;
                    Ok(())
                })
                .await
            }
        }

        #[async_trait]
        impl $crate::db::UserStore for DieselStore<$conn> {
            async fn get_user(
                &self,
                matrix_user_id: &str,
            ) -> Result<Option<BridgeUser>, DatabaseError> {
                let mxid = matrix_user_id.to_string();
                self.run(move |conn: &mut $conn| {
                    users::table
                        .filter(users::matrix_user_id.eq(mxid))
                        .select(DbUser::as_select())
                        .first::<DbUser>(conn)
                        .optional()
                        .map_err(query_err)?
                        .map(DbUser::into_user)
                        .transpose()
                })
                .await
            }

            async fn get_user_by_google_id(
                &self,
                google_user_id: &str,
            ) -> Result<Option<BridgeUser>, DatabaseError> {
                let gid = google_user_id.to_string();
                self.run(move |conn: &mut $conn| {
                    users::table
                        .filter(users::google_user_id.eq(gid))
                        .select(DbUser::as_select())
                        .first::<DbUser>(conn)
                        .optional()
                        .map_err(query_err)?
                        .map(DbUser::into_user)
                        .transpose()
                })
                .await
            }

            async fn upsert_user(&self, user: &BridgeUser) -> Result<BridgeUser, DatabaseError> {
                let row = NewUser::from(user);
                let changes = UpdateUser::from(user);
                let mxid = user.matrix_user_id.clone();
                self.run(move |conn: &mut $conn| {
                    diesel::insert_into(users::table)
                        .values(&row)
                        .on_conflict(users::matrix_user_id)
                        .do_update()
                        .set(&changes)
                        .execute(conn)
                        .map_err(query_err)?;
                    users::table
                        .filter(users::matrix_user_id.eq(mxid))
                        .select(DbUser::as_select())
                        .first::<DbUser>(conn)
                        .map_err(query_err)?
                        .into_user()
                })
                .await
            }

            async fn delete_user(&self, matrix_user_id: &str) -> Result<(), DatabaseError> {
                let mxid = matrix_user_id.to_string();
                self.run(move |conn: &mut $conn| {
                    diesel::delete(users::table.filter(users::matrix_user_id.eq(mxid)))
                        .execute(conn)
                        .map_err(query_err)?;
                    Ok(())
                })
                .await
            }

            async fn list_users(&self) -> Result<Vec<BridgeUser>, DatabaseError> {
                self.run(move |conn: &mut $conn| {
                    users::table
                        .order(users::id.asc())
                        .select(DbUser::as_select())
                        .load::<DbUser>(conn)
                        .map_err(query_err)?
                        .into_iter()
                        .map(DbUser::into_user)
                        .collect()
                })
                .await
            }
        }

        #[async_trait]
        impl $crate::db::MessageStore for DieselStore<$conn> {
            async fn insert_message(
                &self,
                mapping: &MessageMapping,
            ) -> Result<bool, DatabaseError> {
                let row = NewMessageMapping::from(mapping);
                self.run(move |conn: &mut $conn| {
                    let inserted = diesel::insert_into(message_mappings::table)
                        .values(&row)
                        .on_conflict_do_nothing()
                        .execute(conn)
                        .map_err(query_err)?;
                    Ok(inserted > 0)
                })
                .await
            }

            async fn get_message_by_local(
                &self,
                portal_id: i64,
                local_event_id: &str,
            ) -> Result<Option<MessageMapping>, DatabaseError> {
                let event_id = local_event_id.to_string();
                self.run(move |conn: &mut $conn| {
                    let primary = message_mappings::table
                        .filter(message_mappings::portal_id.eq(portal_id))
                        .filter(message_mappings::local_event_id.eq(&event_id))
                        .select(DbMessageMapping::as_select())
                        .first::<DbMessageMapping>(conn)
                        .optional()
                        .map_err(query_err)?;
                    if let Some(row) = primary {
                        return row.into_mapping().map(Some);
                    }

                    // Additional parts live in the JSON id list; LIKE narrows, decoding confirms.
                    let quoted = serde_json::to_string(&event_id)
                        .map_err(|e| DatabaseError::Query(e.to_string()))?;
                    let pattern = format!("%{quoted}%");
                    let candidates = message_mappings::table
                        .filter(message_mappings::portal_id.eq(portal_id))
                        .filter(message_mappings::extra_local_event_ids.like(pattern))
                        .select(DbMessageMapping::as_select())
                        .load::<DbMessageMapping>(conn)
                        .map_err(query_err)?;
                    for row in candidates {
                        let mapping = row.into_mapping()?;
                        if mapping.covers_local_event(&event_id) {
                            return Ok(Some(mapping));
                        }
                    }
                    Ok(None)
                })
                .await
            }

            async fn get_message_by_remote(
                &self,
                portal_id: i64,
                remote_message_id: &str,
            ) -> Result<Option<MessageMapping>, DatabaseError> {
                let message_id = remote_message_id.to_string();
                self.run(move |conn: &mut $conn| {
                    message_mappings::table
                        .filter(message_mappings::portal_id.eq(portal_id))
                        .filter(message_mappings::remote_message_id.eq(message_id))
                        .select(DbMessageMapping::as_select())
                        .first::<DbMessageMapping>(conn)
                        .optional()
                        .map_err(query_err)?
                        .map(DbMessageMapping::into_mapping)
                        .transpose()
                })
                .await
            }

            async fn update_message(&self, mapping: &MessageMapping) -> Result<(), DatabaseError> {
                let id = mapping.id;
                let changes = UpdateMessageMapping::from(mapping);
                self.run(move |conn: &mut $conn| {
                    diesel::update(message_mappings::table.find(id))
                        .set(&changes)
                        .execute(conn)
                        .map_err(query_err)?;
                    Ok(())
                })
                .await
            }
        }

        #[async_trait]
        impl $crate::db::ThreadStore for DieselStore<$conn> {
            async fn create_thread_if_absent(
                &self,
                mapping: &ThreadMapping,
            ) -> Result<ThreadMapping, DatabaseError> {
                let row = NewThreadMapping::from(mapping);
                let portal_id = mapping.portal_id;
                let thread_id = mapping.remote_thread_id.clone();
                self.run(move |conn: &mut $conn| {
                    diesel::insert_into(thread_mappings::table)
                        .values(&row)
                        .on_conflict_do_nothing()
                        .execute(conn)
                        .map_err(query_err)?;
                    thread_mappings::table
                        .filter(thread_mappings::portal_id.eq(portal_id))
                        .filter(thread_mappings::remote_thread_id.eq(thread_id))
                        .select(DbThreadMapping::as_select())
                        .first::<DbThreadMapping>(conn)
                        .map_err(query_err)?
                        .into_mapping()
                })
                .await
            }

            async fn get_thread_by_remote(
                &self,
                portal_id: i64,
                remote_thread_id: &str,
            ) -> Result<Option<ThreadMapping>, DatabaseError> {
                let thread_id = remote_thread_id.to_string();
                self.run(move |conn: &mut $conn| {
                    thread_mappings::table
                        .filter(thread_mappings::portal_id.eq(portal_id))
                        .filter(thread_mappings::remote_thread_id.eq(thread_id))
                        .select(DbThreadMapping::as_select())
                        .first::<DbThreadMapping>(conn)
                        .optional()
                        .map_err(query_err)?
                        .map(DbThreadMapping::into_mapping)
                        .transpose()
                })
                .await
            }

            async fn get_thread_by_local_root(
                &self,
                portal_id: i64,
                local_root_event_id: &str,
            ) -> Result<Option<ThreadMapping>, DatabaseError> {
                let root = local_root_event_id.to_string();
                self.run(move |conn: &mut $conn| {
                    thread_mappings::table
                        .filter(thread_mappings::portal_id.eq(portal_id))
                        .filter(thread_mappings::local_root_event_id.eq(root))
                        .select(DbThreadMapping::as_select())
                        .first::<DbThreadMapping>(conn)
                        .optional()
                        .map_err(query_err)?
                        .map(DbThreadMapping::into_mapping)
                        .transpose()
                })
                .await
            }
        }

        #[async_trait]
        impl $crate::db::ReactionStore for DieselStore<$conn> {
            async fn insert_reaction(
                &self,
                mapping: &ReactionMapping,
            ) -> Result<(), DatabaseError> {
                let row = NewReactionMapping::from(mapping);
                self.run(move |conn: &mut $conn| {
                    diesel::insert_into(reaction_mappings::table)
                        .values(&row)
                        .on_conflict_do_nothing()
                        .execute(conn)
                        .map_err(query_err)?;
                    Ok(())
                })
                .await
            }

            async fn get_reaction_by_local(
                &self,
                portal_id: i64,
                local_event_id: &str,
            ) -> Result<Option<ReactionMapping>, DatabaseError> {
                let event_id = local_event_id.to_string();
                self.run(move |conn: &mut $conn| {
                    reaction_mappings::table
                        .filter(reaction_mappings::portal_id.eq(portal_id))
                        .filter(reaction_mappings::local_event_id.eq(event_id))
                        .select(DbReactionMapping::as_select())
                        .first::<DbReactionMapping>(conn)
                        .optional()
                        .map_err(query_err)?
                        .map(DbReactionMapping::into_mapping)
                        .transpose()
                })
                .await
            }

            async fn get_reaction_by_remote(
                &self,
                portal_id: i64,
                remote_reaction_id: &str,
            ) -> Result<Option<ReactionMapping>, DatabaseError> {
                let reaction_id = remote_reaction_id.to_string();
                self.run(move |conn: &mut $conn| {
                    reaction_mappings::table
                        .filter(reaction_mappings::portal_id.eq(portal_id))
                        .filter(reaction_mappings::remote_reaction_id.eq(reaction_id))
                        .select(DbReactionMapping::as_select())
                        .first::<DbReactionMapping>(conn)
                        .optional()
                        .map_err(query_err)?
                        .map(DbReactionMapping::into_mapping)
                        .transpose()
                })
                .await
            }

            async fn delete_reaction(&self, id: i64) -> Result<(), DatabaseError> {
                self.run(move |conn: &mut $conn| {
                    diesel::delete(reaction_mappings::table.find(id))
                        .execute(conn)
                        .map_err(query_err)?;
                    Ok(())
                })
                .await
            }
        }
        }
    };
}

pub(crate) use impl_diesel_stores;
