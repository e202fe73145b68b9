use diesel::sqlite::SqliteConnection;

use super::diesel_store::{DieselStore, impl_diesel_stores};

pub type SqliteStore = DieselStore<SqliteConnection>;

impl_diesel_stores!(diesel::sqlite::SqliteConnection);

pub(crate) const MIGRATIONS: &[&str] = &[
    "PRAGMA foreign_keys = ON",
    r#"
    CREATE TABLE IF NOT EXISTS portals (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        remote_conversation_id TEXT NOT NULL UNIQUE,
        local_room_id TEXT UNIQUE,
        is_direct INTEGER NOT NULL DEFAULT 0,
        name TEXT,
        topic TEXT,
        state TEXT NOT NULL,
        last_processed_remote_event_id TEXT,
        last_processed_local_event_id TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS puppets (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        remote_user_id TEXT NOT NULL UNIQUE,
        ghost_user_id TEXT NOT NULL UNIQUE,
        display_name TEXT,
        avatar_url TEXT,
        is_registered INTEGER NOT NULL DEFAULT 0,
        is_double_puppeted INTEGER NOT NULL DEFAULT 0,
        custom_mxid TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        matrix_user_id TEXT NOT NULL UNIQUE,
        google_user_id TEXT UNIQUE,
        access_token TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS message_mappings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        portal_id INTEGER NOT NULL REFERENCES portals(id) ON DELETE CASCADE,
        local_event_id TEXT NOT NULL,
        remote_message_id TEXT NOT NULL,
        thread_root_remote_id TEXT,
        sender_puppet_id INTEGER,
        sent_by_bridge INTEGER NOT NULL DEFAULT 1,
        edit_count INTEGER NOT NULL DEFAULT 0,
        deleted INTEGER NOT NULL DEFAULT 0,
        extra_local_event_ids TEXT NOT NULL DEFAULT '[]',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE (portal_id, local_event_id),
        UNIQUE (portal_id, remote_message_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS thread_mappings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        portal_id INTEGER NOT NULL REFERENCES portals(id) ON DELETE CASCADE,
        remote_thread_id TEXT NOT NULL,
        local_root_event_id TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        UNIQUE (portal_id, remote_thread_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS reaction_mappings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        portal_id INTEGER NOT NULL REFERENCES portals(id) ON DELETE CASCADE,
        local_event_id TEXT NOT NULL,
        remote_reaction_id TEXT NOT NULL,
        target_remote_message_id TEXT NOT NULL,
        target_local_event_id TEXT NOT NULL,
        key TEXT NOT NULL,
        sender TEXT NOT NULL,
        is_fallback_note INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        UNIQUE (portal_id, local_event_id),
        UNIQUE (portal_id, remote_reaction_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_thread_mappings_root ON thread_mappings(portal_id, local_root_event_id)",
];
