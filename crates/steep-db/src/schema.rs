//! Control-schema bootstrap.
//!
//! All durable coordinator state lives in the `steep_repl` schema of the
//! local database; the daemon is stateless across restarts apart from it.
//! Bootstrap is idempotent and runs on every daemon start.

use tokio_postgres::GenericClient;

use crate::DbError;

const CONTROL_SCHEMA_SQL: &str = r"
CREATE SCHEMA IF NOT EXISTS steep_repl;

-- Cluster nodes participating in bidirectional replication
CREATE TABLE IF NOT EXISTS steep_repl.nodes (
    node_id TEXT PRIMARY KEY,
    node_name TEXT NOT NULL,
    host TEXT NOT NULL,
    port INTEGER NOT NULL DEFAULT 5432,
    rpc_host TEXT,
    rpc_port INTEGER,
    priority INTEGER NOT NULL DEFAULT 50,
    is_coordinator BOOLEAN NOT NULL DEFAULT false,
    last_seen TIMESTAMPTZ,
    status TEXT NOT NULL DEFAULT 'healthy',
    init_state TEXT NOT NULL DEFAULT 'uninitialized',
    init_source_node TEXT REFERENCES steep_repl.nodes(node_id),
    init_started_at TIMESTAMPTZ,
    init_completed_at TIMESTAMPTZ,
    last_sync_throughput_bytes_sec REAL,
    last_sync_at TIMESTAMPTZ,
    CONSTRAINT nodes_priority_check CHECK (priority >= 1 AND priority <= 100),
    CONSTRAINT nodes_port_check CHECK (port >= 1 AND port <= 65535),
    CONSTRAINT nodes_host_check CHECK (host <> ''),
    CONSTRAINT nodes_status_check CHECK (status IN ('healthy', 'stale', 'unreachable')),
    CONSTRAINT nodes_init_state_check CHECK (init_state IN (
        'uninitialized', 'preparing', 'copying', 'catching_up',
        'synchronized', 'diverged', 'failed', 'reinitializing'
    ))
);

CREATE INDEX IF NOT EXISTS idx_nodes_status ON steep_repl.nodes(status);
CREATE INDEX IF NOT EXISTS idx_nodes_coordinator ON steep_repl.nodes(is_coordinator)
    WHERE is_coordinator = true;
CREATE INDEX IF NOT EXISTS idx_nodes_init_state ON steep_repl.nodes(init_state);

-- Replication slots prepared for the manual initialization workflow
CREATE TABLE IF NOT EXISTS steep_repl.init_slots (
    slot_name TEXT PRIMARY KEY,
    node_id TEXT NOT NULL REFERENCES steep_repl.nodes(node_id),
    lsn TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    expires_at TIMESTAMPTZ,
    used_by_node TEXT REFERENCES steep_repl.nodes(node_id),
    used_at TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS idx_init_slots_node ON steep_repl.init_slots(node_id);
CREATE INDEX IF NOT EXISTS idx_init_slots_expires ON steep_repl.init_slots(expires_at)
    WHERE expires_at IS NOT NULL;

-- Real-time initialization progress, one row per target node
CREATE TABLE IF NOT EXISTS steep_repl.init_progress (
    node_id TEXT PRIMARY KEY REFERENCES steep_repl.nodes(node_id) ON DELETE CASCADE,
    phase TEXT NOT NULL,
    overall_percent REAL NOT NULL DEFAULT 0,
    tables_total INTEGER NOT NULL DEFAULT 0,
    tables_completed INTEGER NOT NULL DEFAULT 0,
    current_table TEXT,
    current_table_percent REAL DEFAULT 0,
    rows_copied BIGINT DEFAULT 0,
    bytes_copied BIGINT DEFAULT 0,
    throughput_rows_sec REAL DEFAULT 0,
    started_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    eta_seconds INTEGER,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    parallel_workers INTEGER DEFAULT 1,
    error_message TEXT,
    CONSTRAINT progress_phase_check CHECK (phase IN
        ('preparing', 'generation', 'application', 'copying', 'catching_up', 'complete', 'failed')),
    CONSTRAINT progress_overall_percent_check CHECK (overall_percent BETWEEN 0 AND 100),
    CONSTRAINT progress_tables_check CHECK (tables_completed <= tables_total)
);

-- Structural fingerprints of local user tables
CREATE TABLE IF NOT EXISTS steep_repl.schema_fingerprints (
    table_schema TEXT NOT NULL,
    table_name TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    column_count INTEGER NOT NULL,
    column_definitions JSONB NOT NULL,
    captured_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (table_schema, table_name)
);

-- Snapshot registry with progress mirrored from the bus
CREATE TABLE IF NOT EXISTS steep_repl.snapshots (
    snapshot_id TEXT PRIMARY KEY,
    source_node_id TEXT NOT NULL REFERENCES steep_repl.nodes(node_id),
    target_node_id TEXT REFERENCES steep_repl.nodes(node_id),
    lsn TEXT,
    storage_path TEXT,
    compression TEXT DEFAULT 'none',
    status TEXT NOT NULL DEFAULT 'pending',
    error_message TEXT,
    overall_percent REAL NOT NULL DEFAULT 0,
    table_count INTEGER NOT NULL DEFAULT 0,
    tables_completed INTEGER NOT NULL DEFAULT 0,
    size_bytes BIGINT NOT NULL DEFAULT 0,
    rows_total BIGINT NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    completed_at TIMESTAMPTZ,
    expires_at TIMESTAMPTZ,
    CONSTRAINT snapshots_compression_check CHECK (compression IN ('none', 'gzip', 'lz4', 'zstd')),
    CONSTRAINT snapshots_status_check CHECK (status IN
        ('pending', 'generating', 'complete', 'applying', 'applied', 'failed', 'cancelled', 'expired'))
);

CREATE INDEX IF NOT EXISTS idx_snapshots_status ON steep_repl.snapshots(status);

-- Durable queue of asynchronous operations
CREATE TABLE IF NOT EXISTS steep_repl.work_queue (
    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    operation_type TEXT NOT NULL,
    operation_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    params JSONB NOT NULL DEFAULT '{}',
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    started_at TIMESTAMPTZ,
    finished_at TIMESTAMPTZ,
    error_message TEXT,
    CONSTRAINT work_queue_operation_check CHECK (operation_type IN
        ('snapshot_generate', 'snapshot_apply', 'bidirectional_merge')),
    CONSTRAINT work_queue_status_check CHECK (status IN
        ('pending', 'running', 'completed', 'failed', 'cancelled'))
);

CREATE INDEX IF NOT EXISTS idx_work_queue_pending ON steep_repl.work_queue(status)
    WHERE status = 'pending';
CREATE UNIQUE INDEX IF NOT EXISTS idx_work_queue_operation ON steep_repl.work_queue(operation_id);

-- Unresolved conflicts recorded by merges run with the manual strategy
CREATE TABLE IF NOT EXISTS steep_repl.merge_conflicts (
    merge_id TEXT NOT NULL,
    table_schema TEXT NOT NULL,
    table_name TEXT NOT NULL,
    pk_value JSONB NOT NULL,
    local_hash BIGINT,
    remote_hash BIGINT,
    recorded_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    resolved BOOLEAN NOT NULL DEFAULT false
);

CREATE INDEX IF NOT EXISTS idx_merge_conflicts_merge ON steep_repl.merge_conflicts(merge_id);

-- One row per merged table, dry runs included
CREATE TABLE IF NOT EXISTS steep_repl.merge_audit_log (
    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    merge_id TEXT NOT NULL,
    peer_node_id TEXT NOT NULL,
    table_schema TEXT NOT NULL,
    table_name TEXT NOT NULL,
    strategy TEXT NOT NULL,
    dry_run BOOLEAN NOT NULL DEFAULT false,
    matches BIGINT NOT NULL DEFAULT 0,
    conflicts BIGINT NOT NULL DEFAULT 0,
    local_only BIGINT NOT NULL DEFAULT 0,
    remote_only BIGINT NOT NULL DEFAULT 0,
    rows_sent BIGINT NOT NULL DEFAULT 0,
    rows_received BIGINT NOT NULL DEFAULT 0,
    duration_ms BIGINT NOT NULL DEFAULT 0,
    recorded_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS idx_merge_audit_merge ON steep_repl.merge_audit_log(merge_id);
";

/// Creates the `steep_repl` schema and every control table.
pub async fn bootstrap_control_schema<C: GenericClient>(client: &C) -> Result<(), DbError> {
    client.batch_execute(CONTROL_SCHEMA_SQL).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_sql_is_idempotent_by_construction() {
        // Every object uses IF NOT EXISTS so restarts re-run the script.
        for statement in CONTROL_SCHEMA_SQL
            .split(';')
            .filter(|s| s.contains("CREATE"))
        {
            assert!(
                statement.contains("IF NOT EXISTS"),
                "statement lacks IF NOT EXISTS: {statement}"
            );
        }
    }

    #[test]
    fn init_state_constraint_covers_every_state() {
        for state in [
            "uninitialized",
            "preparing",
            "copying",
            "catching_up",
            "synchronized",
            "diverged",
            "failed",
            "reinitializing",
        ] {
            assert!(CONTROL_SCHEMA_SQL.contains(&format!("'{state}'")));
        }
    }
}
