//! Diesel table definitions for the Directory's Postgres-backed metadata store.
//!
//! Simplified from the teacher's `directory/schema.rs`: logical/physical volume
//! indirection is replaced by a direct `photo_locations` join table (one row per
//! replica), matching the data model's `locations: set<store_id>` per photo.

diesel::table! {
    params (key) {
        key -> Int4,
        value -> Bytea,
    }
}

diesel::table! {
    store_machines (id) {
        id -> Int4,
        addr -> Text,
        last_heartbeat -> Timestamptz,
        free_bytes -> Int8,
        ops_window_60s -> Int8,
        status -> Text,
        write_enabled -> Bool,
    }
}

diesel::table! {
    photos (id) {
        id -> Int8,
        cookie -> Bytea,
        size -> Int8,
        checksum -> Bytea,
        desired_replicas -> Int4,
        deleted -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    photo_locations (photo_id, machine_id) {
        photo_id -> Int8,
        machine_id -> Int4,
        volume_id -> Int4,
    }
}

diesel::table! {
    sync_log (seq) {
        seq -> Int8,
        op_json -> Text,
        created_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    params,
    store_machines,
    photos,
    photo_locations,
    sync_log,
);
