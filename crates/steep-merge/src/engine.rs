//! The merge engine: pre-flight, overlap analysis, conflict resolution,
//! and FK-ordered transfers.

use std::time::Instant;

use tokio_postgres::GenericClient;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use steep_db::connect_with_retry;
use steep_fingerprint::{compare_schemas, fetch_table_columns};
use steep_progress::ProgressFabric;
use steep_types::{ConflictStrategy, NodeId, OperationKind, ProgressPhase, ProgressUpdate};

use crate::{
    FdwBridge, MergeError, MergeTable, QuiesceGuard, fdw, fetch_merge_tables, fetch_user_triggers,
    quiesce, quote_ident, row_hash::encoded_row_expr, topo_order,
};

/// How to reach the peer database directly.
#[derive(Debug, Clone)]
pub struct PeerEndpoint {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: Option<String>,
}

impl PeerEndpoint {
    pub fn conninfo(&self) -> String {
        let mut parts = vec![
            format!("host={}", self.host),
            format!("port={}", self.port),
            format!("dbname={}", self.dbname),
            format!("user={}", self.user),
        ];
        if let Some(password) = &self.password {
            parts.push(format!("password={password}"));
        }
        parts.join(" ")
    }
}

/// Merge parameters.
#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub merge_id: String,
    pub local_node: NodeId,
    pub peer_node: NodeId,
    pub strategy: ConflictStrategy,
    pub dry_run: bool,
    pub quiesce_timeout_ms: u64,
}

/// Per-table outcome.
#[derive(Debug, Clone, Default)]
pub struct TableMergeOutcome {
    pub schema: String,
    pub table: String,
    pub matches: i64,
    pub conflicts: i64,
    pub local_only: i64,
    pub remote_only: i64,
    pub rows_sent: i64,
    pub rows_received: i64,
    pub duration_ms: u64,
}

/// Whole-merge outcome.
#[derive(Debug, Clone)]
pub struct MergeSummary {
    pub merge_id: String,
    pub strategy: ConflictStrategy,
    pub dry_run: bool,
    pub tables: Vec<TableMergeOutcome>,
    pub warnings: Vec<String>,
}

impl MergeSummary {
    pub fn total_conflicts(&self) -> i64 {
        self.tables.iter().map(|t| t.conflicts).sum()
    }

    pub fn total_transferred(&self) -> i64 {
        self.tables.iter().map(|t| t.rows_sent + t.rows_received).sum()
    }
}

/// Runs a bidirectional merge between the local database and a peer.
///
/// Pre-flight is fail-closed: missing primary keys, commit-timestamp
/// tracking absent under `LastModified`, user triggers that would
/// double-apply, fingerprint drift, and FK cycles all abort before any
/// state changes. A dry run produces the same classification and plan
/// but never executes transfers or resolutions (and does not quiesce).
pub async fn run_merge(
    local_conninfo: &str,
    peer: &PeerEndpoint,
    options: &MergeOptions,
    fabric: &ProgressFabric,
    cancel: &CancellationToken,
) -> Result<MergeSummary, MergeError> {
    let local = connect_with_retry(local_conninfo).await?;
    let peer_client = connect_with_retry(&peer.conninfo()).await?;

    let (tables, order, warnings) =
        preflight(&local, &peer_client, options).await?;

    let bridge = FdwBridge::create(&local, &options.peer_node, peer).await?;
    quiesce::install_support(&local).await?;
    quiesce::install_support(&peer_client).await?;
    bridge
        .prepare_tables(&local, &peer_client, &tables, options.strategy)
        .await?;

    let guards = if options.dry_run {
        None
    } else {
        Some(acquire_quiesce(&local, &peer_client, &tables, options).await?)
    };

    let result = merge_tables(&local, &tables, &order, options, fabric, cancel).await;

    if let Some((local_guard, peer_guard)) = guards {
        local_guard.release(&local).await;
        peer_guard.release(&peer_client).await;
    }
    if let Err(e) = bridge.teardown(&local, &peer_client, &tables).await {
        warn!(error = %e, "fdw teardown failed");
    }

    let mut summary = result?;
    summary.warnings = warnings;
    fabric.publish(progress_base(options, summary.tables.len() as i32).completed());
    info!(
        merge = %options.merge_id,
        tables = summary.tables.len(),
        conflicts = summary.total_conflicts(),
        transferred = summary.total_transferred(),
        dry_run = options.dry_run,
        "merge finished"
    );
    Ok(summary)
}

fn progress_base(options: &MergeOptions, tables_total: i32) -> ProgressUpdate {
    let mut update = ProgressUpdate::starting(
        OperationKind::Merge,
        options.merge_id.clone(),
        options.local_node.clone(),
    );
    update.phase = ProgressPhase::Application;
    update.tables_total = tables_total;
    update
}

async fn preflight(
    local: &tokio_postgres::Client,
    peer: &tokio_postgres::Client,
    options: &MergeOptions,
) -> Result<(Vec<MergeTable>, Vec<usize>, Vec<String>), MergeError> {
    if options.strategy == ConflictStrategy::LastModified {
        for (client, name) in [(local, "local"), (peer, "peer")] {
            let setting: String = client
                .query_one("SHOW track_commit_timestamp", &[])
                .await?
                .get(0);
            if setting != "on" {
                return Err(MergeError::CommitTimestampUnavailable {
                    node: name.to_string(),
                });
            }
        }
    }

    let tables = fetch_merge_tables(local).await?;
    fetch_merge_tables(peer).await?; // peer PK presence, fail-closed

    for client in [local, peer] {
        if let Some((table, trigger)) = fetch_user_triggers(client).await?.into_iter().next() {
            return Err(MergeError::TriggerWouldDoubleApply { table, trigger });
        }
    }

    // Structural equality gate: merge always requires matching
    // fingerprints; default-only drift is surfaced as warnings.
    let local_columns = fetch_table_columns(local, None).await?;
    let peer_columns = fetch_table_columns(peer, None).await?;
    let comparison = compare_schemas(&local_columns, &peer_columns);
    if comparison.blocking() {
        let blocking = comparison
            .tables
            .iter()
            .filter(|t| t.has_blocking_diff())
            .count();
        return Err(MergeError::FingerprintMismatch(blocking));
    }
    let mut warnings = Vec::new();
    for table in &comparison.tables {
        for diff in &table.column_diffs {
            warnings.push(format!(
                "{}.{}.{}: default differs (informational)",
                table.table_schema, table.table_name, diff.column_name
            ));
        }
    }

    let order = topo_order(&tables)?;
    Ok((tables, order, warnings))
}

async fn acquire_quiesce(
    local: &tokio_postgres::Client,
    peer: &tokio_postgres::Client,
    tables: &[MergeTable],
    options: &MergeOptions,
) -> Result<(QuiesceGuard, QuiesceGuard), MergeError> {
    let local_pid: i32 = local.query_one("SELECT pg_backend_pid()", &[]).await?.get(0);
    // The fdw connection's backend on the peer, read through the imported
    // pid view so the peer can exempt exactly that session.
    let fdw_pid: i32 = local
        .query_one(
            &format!("SELECT pid FROM {}.merge_backend_pid", fdw::HASH_SCHEMA),
            &[],
        )
        .await?
        .get(0);

    let local_guard =
        QuiesceGuard::acquire(local, tables, &[local_pid], options.quiesce_timeout_ms).await?;
    match QuiesceGuard::acquire(peer, tables, &[fdw_pid], options.quiesce_timeout_ms).await {
        Ok(peer_guard) => Ok((local_guard, peer_guard)),
        Err(e) => {
            local_guard.release(local).await;
            Err(e)
        }
    }
}

async fn merge_tables(
    local: &tokio_postgres::Client,
    tables: &[MergeTable],
    order: &[usize],
    options: &MergeOptions,
    fabric: &ProgressFabric,
    cancel: &CancellationToken,
) -> Result<MergeSummary, MergeError> {
    let mut outcomes = Vec::with_capacity(order.len());
    for (done, &index) in order.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(MergeError::Cancelled);
        }
        let table = &tables[index];
        let outcome = merge_one_table(local, table, options).await?;

        let mut update = progress_base(options, order.len() as i32);
        update.tables_completed = done as i32 + 1;
        update.current_table = Some(table.qualified_key());
        update.overall_percent = 100.0 * (done as f32 + 1.0) / order.len().max(1) as f32;
        fabric.publish(update);
        outcomes.push(outcome);
    }
    Ok(MergeSummary {
        merge_id: options.merge_id.clone(),
        strategy: options.strategy,
        dry_run: options.dry_run,
        tables: outcomes,
        warnings: Vec::new(),
    })
}

async fn merge_one_table(
    local: &tokio_postgres::Client,
    table: &MergeTable,
    options: &MergeOptions,
) -> Result<TableMergeOutcome, MergeError> {
    let started = Instant::now();
    let mut outcome = TableMergeOutcome {
        schema: table.schema.clone(),
        table: table.name.clone(),
        ..TableMergeOutcome::default()
    };

    build_overlap(local, table, options).await?;

    let counts = local
        .query("SELECT category, count(*) FROM _steep_ov GROUP BY 1", &[])
        .await?;
    for row in counts {
        let category: String = row.get(0);
        let count: i64 = row.get(1);
        match category.as_str() {
            "match" => outcome.matches = count,
            "conflict" => outcome.conflicts = count,
            "local_only" => outcome.local_only = count,
            "remote_only" => outcome.remote_only = count,
            _ => {}
        }
    }

    if !options.dry_run {
        if options.strategy == ConflictStrategy::Manual {
            record_manual_conflicts(local, table, options).await?;
        } else {
            let (sent, received) = resolve_conflicts(local, table).await?;
            outcome.rows_sent += sent;
            outcome.rows_received += received;
        }
        let (sent, received) = transfer_disjoint_rows(local, table).await?;
        outcome.rows_sent += sent;
        outcome.rows_received += received;
    }

    outcome.duration_ms = started.elapsed().as_millis() as u64;
    record_audit(local, table, options, &outcome).await?;
    Ok(outcome)
}

/// Materializes the overlap classification for one table.
///
/// The FULL OUTER JOIN runs against the foreign hash view, so the wire
/// carries primary keys and 8-byte hashes only, independent of row width.
async fn build_overlap(
    local: &tokio_postgres::Client,
    table: &MergeTable,
    options: &MergeOptions,
) -> Result<(), MergeError> {
    let pk_coalesce: Vec<String> = table
        .primary_key
        .iter()
        .map(|c| {
            format!(
                "COALESCE(l.{col}, r.{col}) AS {col}",
                col = quote_ident(c)
            )
        })
        .collect();
    let pk_join = pk_join("l", "r", &table.primary_key);
    let pk_select: Vec<String> = table
        .primary_key
        .iter()
        .map(|c| format!("t.{}", quote_ident(c)))
        .collect();

    let committed = if options.strategy == ConflictStrategy::LastModified {
        "pg_xact_commit_timestamp(t.xmin)"
    } else {
        "NULL::timestamptz"
    };
    let winner = match options.strategy {
        ConflictStrategy::PreferLocal => "'local'".to_string(),
        ConflictStrategy::PreferRemote => "'remote'".to_string(),
        ConflictStrategy::LastModified => {
            "CASE WHEN l.committed_at >= r.committed_at THEN 'local' ELSE 'remote' END".to_string()
        }
        ConflictStrategy::Manual => "NULL".to_string(),
    };

    let sql = format!(
        "DROP TABLE IF EXISTS _steep_ov;
         CREATE TEMP TABLE _steep_ov AS
         SELECT {pk_cols},
                CASE WHEN l.row_hash IS NULL THEN 'remote_only'
                     WHEN r.row_hash IS NULL THEN 'local_only'
                     WHEN l.row_hash = r.row_hash THEN 'match'
                     ELSE 'conflict'
                END AS category,
                l.row_hash AS local_hash,
                r.row_hash AS remote_hash,
                CASE WHEN l.row_hash IS NOT NULL AND r.row_hash IS NOT NULL
                          AND l.row_hash <> r.row_hash
                     THEN {winner} ELSE NULL END AS winner
         FROM (SELECT {pk_select}, steep_repl.fnv1a_64({expr}) AS row_hash,
                      {committed} AS committed_at
               FROM {schema}.{name} t) l
         FULL OUTER JOIN {hash_schema}.{view} r ON {pk_join}",
        pk_cols = pk_coalesce.join(", "),
        pk_select = pk_select.join(", "),
        expr = encoded_row_expr(&table.columns, &table.primary_key, "t"),
        schema = quote_ident(&table.schema),
        name = quote_ident(&table.name),
        hash_schema = fdw::HASH_SCHEMA,
        view = fdw::hash_view_name(table),
    );
    local.batch_execute(&sql).await?;
    Ok(())
}

/// Applies the conflict winner in both directions with UPDATEs, which
/// keeps foreign keys on either side intact.
async fn resolve_conflicts(
    local: &tokio_postgres::Client,
    table: &MergeTable,
) -> Result<(i64, i64), MergeError> {
    let non_pk: Vec<&crate::MergeColumn> = table
        .columns
        .iter()
        .filter(|c| !table.primary_key.contains(&c.name))
        .collect();
    if non_pk.is_empty() {
        // PK-only table: equal keys mean equal rows, no conflicts exist.
        return Ok((0, 0));
    }
    let local_table = format!("{}.{}", quote_ident(&table.schema), quote_ident(&table.name));
    let mirror = format!(
        "{}.{}",
        fdw::mirror_schema_name(&table.schema),
        quote_ident(&table.name)
    );

    let set_from = |source_alias: &str| -> String {
        non_pk
            .iter()
            .map(|c| format!("{col} = {source_alias}.{col}", col = quote_ident(&c.name)))
            .collect::<Vec<_>>()
            .join(", ")
    };

    // Local wins: push local values to the peer mirror.
    let sent = local
        .execute(
            &format!(
                "UPDATE {mirror} f SET {set}
                 FROM {local_table} l, _steep_ov o
                 WHERE {f_o} AND {l_o} AND o.category = 'conflict' AND o.winner = 'local'",
                set = set_from("l"),
                f_o = pk_join("f", "o", &table.primary_key),
                l_o = pk_join("l", "o", &table.primary_key),
            ),
            &[],
        )
        .await?;

    // Remote wins: pull peer values into the local table.
    let received = local
        .execute(
            &format!(
                "UPDATE {local_table} l SET {set}
                 FROM {mirror} f, _steep_ov o
                 WHERE {l_o} AND {f_o} AND o.category = 'conflict' AND o.winner = 'remote'",
                set = set_from("f"),
                l_o = pk_join("l", "o", &table.primary_key),
                f_o = pk_join("f", "o", &table.primary_key),
            ),
            &[],
        )
        .await?;

    Ok((sent as i64, received as i64))
}

/// Moves LocalOnly rows to the peer and RemoteOnly rows to the local
/// table, one INSERT ... SELECT per direction.
async fn transfer_disjoint_rows(
    local: &tokio_postgres::Client,
    table: &MergeTable,
) -> Result<(i64, i64), MergeError> {
    let local_table = format!("{}.{}", quote_ident(&table.schema), quote_ident(&table.name));
    let mirror = format!(
        "{}.{}",
        fdw::mirror_schema_name(&table.schema),
        quote_ident(&table.name)
    );
    let columns: Vec<String> = table
        .columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect();
    let column_list = columns.join(", ");

    let sent = local
        .execute(
            &format!(
                "INSERT INTO {mirror} ({column_list})
                 SELECT {select} FROM {local_table} l
                 JOIN _steep_ov o ON {join}
                 WHERE o.category = 'local_only'",
                select = prefixed(&columns, "l"),
                join = pk_join("l", "o", &table.primary_key),
            ),
            &[],
        )
        .await?;

    let received = local
        .execute(
            &format!(
                "INSERT INTO {local_table} ({column_list})
                 SELECT {select} FROM {mirror} f
                 JOIN _steep_ov o ON {join}
                 WHERE o.category = 'remote_only'",
                select = prefixed(&columns, "f"),
                join = pk_join("f", "o", &table.primary_key),
            ),
            &[],
        )
        .await?;

    Ok((sent as i64, received as i64))
}

/// Records unresolved conflicts for operator review.
async fn record_manual_conflicts(
    local: &tokio_postgres::Client,
    table: &MergeTable,
    options: &MergeOptions,
) -> Result<(), MergeError> {
    let pk_json: Vec<String> = table
        .primary_key
        .iter()
        .map(|c| format!("'{name}', o.{col}", name = c.replace('\'', "''"), col = quote_ident(c)))
        .collect();
    local
        .execute(
            &format!(
                "INSERT INTO steep_repl.merge_conflicts
                     (merge_id, table_schema, table_name, pk_value, local_hash, remote_hash)
                 SELECT $1, $2, $3, jsonb_build_object({pk_json}),
                        o.local_hash, o.remote_hash
                 FROM _steep_ov o WHERE o.category = 'conflict'",
                pk_json = pk_json.join(", "),
            ),
            &[&options.merge_id, &table.schema, &table.name],
        )
        .await?;
    Ok(())
}

async fn record_audit(
    local: &tokio_postgres::Client,
    table: &MergeTable,
    options: &MergeOptions,
    outcome: &TableMergeOutcome,
) -> Result<(), MergeError> {
    local
        .execute(
            "INSERT INTO steep_repl.merge_audit_log
                 (merge_id, peer_node_id, table_schema, table_name, strategy, dry_run,
                  matches, conflicts, local_only, remote_only, rows_sent, rows_received, duration_ms)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            &[
                &options.merge_id,
                &options.peer_node.as_str(),
                &table.schema,
                &table.name,
                &options.strategy.as_str(),
                &options.dry_run,
                &outcome.matches,
                &outcome.conflicts,
                &outcome.local_only,
                &outcome.remote_only,
                &outcome.rows_sent,
                &outcome.rows_received,
                &(outcome.duration_ms as i64),
            ],
        )
        .await?;
    Ok(())
}

fn pk_join(a: &str, b: &str, pk: &[String]) -> String {
    pk.iter()
        .map(|c| format!("{a}.{col} = {b}.{col}", col = quote_ident(c)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn prefixed(columns: &[String], alias: &str) -> String {
    columns
        .iter()
        .map(|c| format!("{alias}.{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_conninfo_renders() {
        let endpoint = PeerEndpoint {
            host: "db-b".to_string(),
            port: 5432,
            dbname: "app".to_string(),
            user: "steep".to_string(),
            password: None,
        };
        assert_eq!(endpoint.conninfo(), "host=db-b port=5432 dbname=app user=steep");
    }

    #[test]
    fn pk_join_composes_composite_keys() {
        let pk = vec!["tenant_id".to_string(), "id".to_string()];
        assert_eq!(
            pk_join("l", "r", &pk),
            "l.\"tenant_id\" = r.\"tenant_id\" AND l.\"id\" = r.\"id\""
        );
    }
}
