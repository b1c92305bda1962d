//! Idempotent DDL for the event log, its indexes, the notification trigger, and the
//! projection checkpoint table.
//!
//! Every statement here is `CREATE ... IF NOT EXISTS` or `CREATE OR REPLACE`, so
//! [`apply`] is safe to call repeatedly — including from several processes racing to be
//! first at startup.

use sqlx::PgPool;

const CREATE_EVENTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS events (
    global_position BIGSERIAL PRIMARY KEY,
    event_id UUID NOT NULL UNIQUE DEFAULT gen_random_uuid(),
    type VARCHAR(255) NOT NULL,
    payload JSONB NOT NULL,
    metadata JSONB NULL,
    occurred_at TIMESTAMPTZ NOT NULL DEFAULT now()
)";

const CREATE_PAYLOAD_GIN_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_events_payload_gin
    ON events USING GIN (payload jsonb_path_ops)
    WITH (fastupdate = on, gin_pending_list_limit = 65536)";

const CREATE_TYPE_POSITION_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_events_type_position
    ON events (type, global_position)";

const CREATE_OCCURRED_AT_BRIN_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_events_occurred_at_brin
    ON events USING BRIN (occurred_at)
    WITH (pages_per_range = 128)";

const TUNE_AUTOVACUUM: &str = r"
ALTER TABLE events SET (
    autovacuum_vacuum_scale_factor = 0.01,
    autovacuum_analyze_scale_factor = 0.005
)";

const CREATE_CHECKPOINTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS projection_checkpoints (
    name TEXT PRIMARY KEY,
    last_position BIGINT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
)";

const CREATE_NOTIFY_FUNCTION: &str = r"
CREATE OR REPLACE FUNCTION es_notify_event_inserted() RETURNS trigger AS $$
BEGIN
    PERFORM pg_notify('es_events', '');
    RETURN NULL;
END;
$$ LANGUAGE plpgsql";

const CREATE_NOTIFY_TRIGGER: &str = r"
CREATE OR REPLACE TRIGGER trg_es_events_notify
    AFTER INSERT ON events
    FOR EACH STATEMENT
    EXECUTE FUNCTION es_notify_event_inserted()";

/// Create every table, index, function, and trigger this store needs, if not already
/// present.
///
/// # Errors
///
/// Returns the underlying `sqlx::Error` if any statement fails.
pub async fn apply(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(CREATE_EVENTS_TABLE).execute(pool).await?;
    sqlx::query(CREATE_PAYLOAD_GIN_INDEX).execute(pool).await?;
    sqlx::query(CREATE_TYPE_POSITION_INDEX).execute(pool).await?;
    sqlx::query(CREATE_OCCURRED_AT_BRIN_INDEX)
        .execute(pool)
        .await?;
    sqlx::query(TUNE_AUTOVACUUM).execute(pool).await?;
    sqlx::query(CREATE_CHECKPOINTS_TABLE).execute(pool).await?;
    sqlx::query(CREATE_NOTIFY_FUNCTION).execute(pool).await?;
    sqlx::query(CREATE_NOTIFY_TRIGGER).execute(pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ddl_statements_are_non_empty() {
        for stmt in [
            CREATE_EVENTS_TABLE,
            CREATE_PAYLOAD_GIN_INDEX,
            CREATE_TYPE_POSITION_INDEX,
            CREATE_OCCURRED_AT_BRIN_INDEX,
            TUNE_AUTOVACUUM,
            CREATE_CHECKPOINTS_TABLE,
            CREATE_NOTIFY_FUNCTION,
            CREATE_NOTIFY_TRIGGER,
        ] {
            assert!(!stmt.trim().is_empty());
        }
    }

    #[test]
    fn ddl_uses_idempotent_forms() {
        assert!(CREATE_EVENTS_TABLE.contains("IF NOT EXISTS"));
        assert!(CREATE_CHECKPOINTS_TABLE.contains("IF NOT EXISTS"));
        assert!(CREATE_NOTIFY_FUNCTION.contains("OR REPLACE"));
        assert!(CREATE_NOTIFY_TRIGGER.contains("OR REPLACE"));
    }
}
