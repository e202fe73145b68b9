// Timestamps are epoch milliseconds so the same table definitions serve both backends.

diesel::table! {
    portals (id) {
        id -> BigInt,
        remote_conversation_id -> Text,
        local_room_id -> Nullable<Text>,
        is_direct -> Bool,
        name -> Nullable<Text>,
        topic -> Nullable<Text>,
        state -> Text,
        last_processed_remote_event_id -> Nullable<Text>,
        last_processed_local_event_id -> Nullable<Text>,
        created_at -> BigInt,
        updated_at -> BigInt,
    }
}

diesel::table! {
    puppets (id) {
        id -> BigInt,
        remote_user_id -> Text,
        ghost_user_id -> Text,
        display_name -> Nullable<Text>,
        avatar_url -> Nullable<Text>,
        is_registered -> Bool,
        is_double_puppeted -> Bool,
        custom_mxid -> Nullable<Text>,
        created_at -> BigInt,
        updated_at -> BigInt,
    }
}

diesel::table! {
    users (id) {
        id -> BigInt,
        matrix_user_id -> Text,
        google_user_id -> Nullable<Text>,
        access_token -> Nullable<Text>,
        created_at -> BigInt,
        updated_at -> BigInt,
    }
}

diesel::table! {
    message_mappings (id) {
        id -> BigInt,
        portal_id -> BigInt,
        local_event_id -> Text,
        remote_message_id -> Text,
        thread_root_remote_id -> Nullable<Text>,
        sender_puppet_id -> Nullable<BigInt>,
        sent_by_bridge -> Bool,
        edit_count -> Integer,
        deleted -> Bool,
        extra_local_event_ids -> Text,
        created_at -> BigInt,
        updated_at -> BigInt,
    }
}

diesel::table! {
    thread_mappings (id) {
        id -> BigInt,
        portal_id -> BigInt,
        remote_thread_id -> Text,
        local_root_event_id -> Text,
        created_at -> BigInt,
    }
}

diesel::table! {
    reaction_mappings (id) {
        id -> BigInt,
        portal_id -> BigInt,
        local_event_id -> Text,
        remote_reaction_id -> Text,
        target_remote_message_id -> Text,
        target_local_event_id -> Text,
        key -> Text,
        sender -> Text,
        is_fallback_note -> Bool,
        created_at -> BigInt,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    portals,
    puppets,
    users,
    message_mappings,
    thread_mappings,
    reaction_mappings,
);
