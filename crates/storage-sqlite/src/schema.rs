// Typed schema for the sync bookkeeping tables. The mirror tables are written
// through dynamic SQL (see `mirror`) and are not declared here.

diesel::table! {
    sync_idempotency (store_id, entity_kind, external_id) {
        store_id -> Text,
        entity_kind -> Text,
        external_id -> Text,
        revision_updated_at_ms -> BigInt,
        content_hash -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    sync_logs (id) {
        id -> Text,
        store_id -> Text,
        sync_type -> Text,
        entity_kind -> Nullable<Text>,
        status -> Text,
        started_at -> Text,
        completed_at -> Nullable<Text>,
        records_processed -> BigInt,
        records_success -> BigInt,
        records_failed -> BigInt,
        error_message -> Nullable<Text>,
        error_details -> Nullable<Text>,
        window_start -> Nullable<Text>,
    }
}

diesel::table! {
    sync_watermarks (store_id, entity_kind) {
        store_id -> Text,
        entity_kind -> Text,
        last_completed_at -> Text,
        log_id -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    sync_pull_checkpoints (store_id, entity_kind) {
        store_id -> Text,
        entity_kind -> Text,
        sync_type -> Text,
        next_page -> Integer,
        log_id -> Text,
        since -> Nullable<Text>,
        crawl_started_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    sync_retry_queue (id) {
        id -> Text,
        store_id -> Text,
        entity_kind -> Text,
        external_id -> Text,
        event -> Text,
        attempts -> Integer,
        next_retry_at -> Text,
        failure_kind -> Text,
        last_error -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    sync_dead_letters (id) {
        id -> Text,
        store_id -> Text,
        entity_kind -> Text,
        external_id -> Text,
        reason -> Text,
        last_error -> Text,
        attempts -> Integer,
        event -> Text,
        created_at -> Text,
        resubmitted_at -> Nullable<Text>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    sync_idempotency,
    sync_logs,
    sync_watermarks,
    sync_pull_checkpoints,
    sync_retry_queue,
    sync_dead_letters,
);
