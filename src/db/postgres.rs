use diesel::pg::PgConnection;

use super::diesel_store::{DieselStore, impl_diesel_stores};

pub type PostgresStore = DieselStore<PgConnection>;

impl_diesel_stores!(diesel::pg::PgConnection);

pub(crate) const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS portals (
        id BIGSERIAL PRIMARY KEY,
        remote_conversation_id TEXT NOT NULL UNIQUE,
        local_room_id TEXT UNIQUE,
        is_direct BOOLEAN NOT NULL DEFAULT FALSE,
        name TEXT,
        topic TEXT,
        state TEXT NOT NULL,
        last_processed_remote_event_id TEXT,
        last_processed_local_event_id TEXT,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS puppets (
        id BIGSERIAL PRIMARY KEY,
        remote_user_id TEXT NOT NULL UNIQUE,
        ghost_user_id TEXT NOT NULL UNIQUE,
        display_name TEXT,
        avatar_url TEXT,
        is_registered BOOLEAN NOT NULL DEFAULT FALSE,
        is_double_puppeted BOOLEAN NOT NULL DEFAULT FALSE,
        custom_mxid TEXT,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id BIGSERIAL PRIMARY KEY,
        matrix_user_id TEXT NOT NULL UNIQUE,
        google_user_id TEXT UNIQUE,
        access_token TEXT,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS message_mappings (
        id BIGSERIAL PRIMARY KEY,
        portal_id BIGINT NOT NULL REFERENCES portals(id) ON DELETE CASCADE,
        local_event_id TEXT NOT NULL,
        remote_message_id TEXT NOT NULL,
        thread_root_remote_id TEXT,
        sender_puppet_id BIGINT,
        sent_by_bridge BOOLEAN NOT NULL DEFAULT TRUE,
        edit_count INTEGER NOT NULL DEFAULT 0,
        deleted BOOLEAN NOT NULL DEFAULT FALSE,
        extra_local_event_ids TEXT NOT NULL DEFAULT '[]',
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL,
        UNIQUE (portal_id, local_event_id),
        UNIQUE (portal_id, remote_message_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS thread_mappings (
        id BIGSERIAL PRIMARY KEY,
        portal_id BIGINT NOT NULL REFERENCES portals(id) ON DELETE CASCADE,
        remote_thread_id TEXT NOT NULL,
        local_root_event_id TEXT NOT NULL,
        created_at BIGINT NOT NULL,
        UNIQUE (portal_id, remote_thread_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS reaction_mappings (
        id BIGSERIAL PRIMARY KEY,
        portal_id BIGINT NOT NULL REFERENCES portals(id) ON DELETE CASCADE,
        local_event_id TEXT NOT NULL,
        remote_reaction_id TEXT NOT NULL,
        target_remote_message_id TEXT NOT NULL,
        target_local_event_id TEXT NOT NULL,
        key TEXT NOT NULL,
        sender TEXT NOT NULL,
        is_fallback_note BOOLEAN NOT NULL DEFAULT FALSE,
        created_at BIGINT NOT NULL,
        UNIQUE (portal_id, local_event_id),
        UNIQUE (portal_id, remote_reaction_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_thread_mappings_root ON thread_mappings(portal_id, local_root_event_id)",
];
