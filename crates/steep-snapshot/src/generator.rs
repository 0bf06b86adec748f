//! Snapshot generation: consistent parallel export of every user table.
//!
//! A replication slot pins WAL from the snapshot's consistent point; a
//! REPEATABLE READ transaction exports its snapshot so the parallel COPY
//! workers all observe the same database state. The source stays online
//! throughout.

use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use steep_db::connect_with_retry;
use steep_progress::ProgressFabric;
use steep_replication::SlotManager;
use steep_types::{
    CompressionCodec, NodeId, OperationKind, ProgressPhase, ProgressUpdate,
};

use crate::{
    EncodingWriter, SCHEMA_VERSION, SequenceEntry, Sha256Writer, SnapshotError, SnapshotManifest,
    TableEntry, io_error,
};

/// Parallel COPY workers: 1..=16, default 4.
const MAX_WORKERS: u8 = 16;
const DEFAULT_WORKERS: u8 = 4;

/// Replication slot pinned for a snapshot, named from the snapshot id
/// under the same sanitization rules as init slots.
pub fn snapshot_slot_name(snapshot_id: &str) -> String {
    let sanitized: String = snapshot_id
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let mut name = format!("steep_snap_{sanitized}");
    name.truncate(63);
    name
}

/// Generation parameters.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub snapshot_id: String,
    pub source_node: NodeId,
    pub output_dir: PathBuf,
    pub codec: CompressionCodec,
    pub parallel_workers: Option<u8>,
}

impl GenerateOptions {
    fn workers(&self) -> usize {
        usize::from(self.parallel_workers.unwrap_or(DEFAULT_WORKERS).clamp(1, MAX_WORKERS))
    }
}

/// Result of a completed generation.
#[derive(Debug)]
pub struct GenerateOutcome {
    pub manifest: SnapshotManifest,
    pub slot_name: String,
}

#[derive(Debug, Clone)]
struct TableSpec {
    schema: String,
    table: String,
}

struct SharedCounters {
    tables_total: i32,
    tables_completed: AtomicI32,
    rows_copied: AtomicI64,
    bytes_copied: AtomicI64,
}

/// Exports every user table of the source into `options.output_dir`.
///
/// On any worker failure (or cancellation) the partial snapshot directory
/// is deleted and the slot dropped; the manifest is only ever written
/// after every file is complete.
pub async fn generate_snapshot(
    source_conninfo: &str,
    options: &GenerateOptions,
    fabric: &ProgressFabric,
    cancel: &CancellationToken,
) -> Result<GenerateOutcome, SnapshotError> {
    let slot_name = snapshot_slot_name(&options.snapshot_id);
    let control = match connect_with_retry(source_conninfo).await {
        Ok(client) => client,
        Err(e) => {
            fabric.publish(progress_base(options, 0).failed(e.to_string()));
            return Err(e.into());
        }
    };

    // The slot pins WAL from the consistent point; its creation LSN is the
    // manifest LSN the applier later catches up from.
    let slot = match SlotManager::create(&control, &options.source_node, Some(&slot_name)).await {
        Ok(slot) => slot,
        Err(e) => {
            fabric.publish(progress_base(options, 0).failed(e.to_string()));
            return Err(e.into());
        }
    };

    let result = generate_inner(source_conninfo, options, fabric, cancel, &control, slot.lsn)
        .await;

    match result {
        Ok(manifest) => {
            fabric.publish(
                progress_base(options, manifest.tables.len() as i32)
                    .completed(),
            );
            Ok(GenerateOutcome {
                manifest,
                slot_name,
            })
        }
        Err(e) => {
            warn!(snapshot = %options.snapshot_id, error = %e, "generation failed; cleaning up");
            cleanup_partial(&options.output_dir);
            if let Err(drop_err) = SlotManager::drop_if_exists(&control, &slot_name).await {
                warn!(slot = %slot_name, error = %drop_err, "failed to drop snapshot slot");
            }
            fabric.publish(progress_base(options, 0).failed(e.to_string()));
            Err(e)
        }
    }
}

fn progress_base(options: &GenerateOptions, tables_total: i32) -> ProgressUpdate {
    let mut update = ProgressUpdate::starting(
        OperationKind::SnapshotGenerate,
        options.snapshot_id.clone(),
        options.source_node.clone(),
    );
    update.phase = ProgressPhase::Generation;
    update.tables_total = tables_total;
    update
}

async fn generate_inner(
    source_conninfo: &str,
    options: &GenerateOptions,
    fabric: &ProgressFabric,
    cancel: &CancellationToken,
    control: &tokio_postgres::Client,
    lsn: steep_types::Lsn,
) -> Result<SnapshotManifest, SnapshotError> {
    // Export a snapshot all workers attach to for cross-table consistency.
    control
        .batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY")
        .await?;
    let exported: String = control
        .query_one("SELECT pg_export_snapshot()", &[])
        .await?
        .get(0);

    let tables = enumerate_tables(control).await?;
    let data_dir = options.output_dir.join("data");
    fs::create_dir_all(&data_dir).map_err(|e| io_error(&data_dir, e))?;

    let counters = Arc::new(SharedCounters {
        tables_total: tables.len() as i32,
        tables_completed: AtomicI32::new(0),
        rows_copied: AtomicI64::new(0),
        bytes_copied: AtomicI64::new(0),
    });

    let mut start = progress_base(options, counters.tables_total);
    start.parallel_workers = options.workers() as i32;
    fabric.publish(start);

    let queue: Arc<Mutex<VecDeque<TableSpec>>> = Arc::new(Mutex::new(tables.into()));
    let mut workers: JoinSet<Result<Vec<TableEntry>, SnapshotError>> = JoinSet::new();

    for _ in 0..options.workers() {
        let conninfo = source_conninfo.to_string();
        let exported = exported.clone();
        let queue = Arc::clone(&queue);
        let counters = Arc::clone(&counters);
        let options = options.clone();
        let fabric = fabric.clone();
        let cancel = cancel.clone();
        workers.spawn(async move {
            copy_worker(&conninfo, &exported, &queue, &counters, &options, &fabric, &cancel).await
        });
    }

    // Sequence values are read once every table copy has begun; sequences
    // are non-transactional so the exported snapshot does not govern them.
    let sequences = capture_sequences(control).await?;

    let mut table_entries = Vec::new();
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(entries)) => table_entries.extend(entries),
            Ok(Err(e)) => {
                cancel.cancel();
                while workers.join_next().await.is_some() {}
                return Err(e);
            }
            Err(join_err) => {
                cancel.cancel();
                while workers.join_next().await.is_some() {}
                return Err(SnapshotError::ManifestInvalid(format!(
                    "copy worker panicked: {join_err}"
                )));
            }
        }
    }

    control.batch_execute("COMMIT").await?;
    table_entries.sort_by(|a, b| (&a.schema, &a.table).cmp(&(&b.schema, &b.table)));

    let manifest = SnapshotManifest {
        snapshot_id: options.snapshot_id.clone(),
        source_node_id: options.source_node.clone(),
        lsn,
        codec: options.codec,
        schema_version: SCHEMA_VERSION,
        tables: table_entries,
        sequences,
    };
    manifest.write(&options.output_dir)?;
    info!(
        snapshot = %options.snapshot_id,
        tables = manifest.tables.len(),
        %lsn,
        "snapshot generation complete"
    );
    Ok(manifest)
}

async fn copy_worker(
    conninfo: &str,
    exported_snapshot: &str,
    queue: &Mutex<VecDeque<TableSpec>>,
    counters: &SharedCounters,
    options: &GenerateOptions,
    fabric: &ProgressFabric,
    cancel: &CancellationToken,
) -> Result<Vec<TableEntry>, SnapshotError> {
    let client = connect_with_retry(conninfo).await?;
    client
        .batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY")
        .await?;
    client
        .batch_execute(&format!(
            "SET TRANSACTION SNAPSHOT '{}'",
            exported_snapshot.replace('\'', "''")
        ))
        .await?;

    let mut entries = Vec::new();
    loop {
        if cancel.is_cancelled() {
            return Err(SnapshotError::Cancelled);
        }
        let Some(spec) = queue.lock().await.pop_front() else {
            break;
        };
        let entry = export_table(&client, &spec, options, cancel).await?;

        counters.tables_completed.fetch_add(1, Ordering::Relaxed);
        counters
            .rows_copied
            .fetch_add(entry.rows as i64, Ordering::Relaxed);
        counters
            .bytes_copied
            .fetch_add(entry.bytes as i64, Ordering::Relaxed);

        let mut update = progress_base(options, counters.tables_total);
        update.tables_completed = counters.tables_completed.load(Ordering::Relaxed);
        update.rows_copied = counters.rows_copied.load(Ordering::Relaxed);
        update.bytes_copied = counters.bytes_copied.load(Ordering::Relaxed);
        update.current_table = Some(format!("{}.{}", spec.schema, spec.table));
        update.overall_percent =
            100.0 * update.tables_completed as f32 / counters.tables_total.max(1) as f32;
        update.parallel_workers = options.workers() as i32;
        fabric.publish(update);

        entries.push(entry);
    }
    client.batch_execute("COMMIT").await?;
    Ok(entries)
}

async fn export_table(
    client: &tokio_postgres::Client,
    spec: &TableSpec,
    options: &GenerateOptions,
    cancel: &CancellationToken,
) -> Result<TableEntry, SnapshotError> {
    let qualified = format!(
        "{}.{}",
        quote_ident(&spec.schema),
        quote_ident(&spec.table)
    );
    let row_count: i64 = client
        .query_one(&format!("SELECT count(*) FROM {qualified}"), &[])
        .await?
        .get(0);

    let file_name = options.codec.data_file_name(&spec.schema, &spec.table);
    let rel_path = format!("data/{file_name}");
    let path = options.output_dir.join(&rel_path);
    let file = fs::File::create(&path).map_err(|e| io_error(&path, e))?;
    let encoder = EncodingWriter::new(options.codec, file).map_err(|e| io_error(&path, e))?;
    let mut hashed = Sha256Writer::new(encoder);

    let copy_sql = format!("COPY {qualified} TO STDOUT WITH (FORMAT csv, HEADER true)");
    let mut stream = Box::pin(client.copy_out(&copy_sql).await?);
    while let Some(chunk) = stream.next().await {
        if cancel.is_cancelled() {
            return Err(SnapshotError::Cancelled);
        }
        let chunk = chunk?;
        hashed.write_all(&chunk).map_err(|e| io_error(&path, e))?;
    }

    let (sha256, bytes, encoder) = hashed.finish().map_err(|e| io_error(&path, e))?;
    let file = encoder.finish().map_err(|e| io_error(&path, e))?;
    file.sync_all().map_err(|e| io_error(&path, e))?;

    Ok(TableEntry {
        schema: spec.schema.clone(),
        table: spec.table.clone(),
        file: rel_path,
        rows: row_count as u64,
        bytes,
        sha256,
    })
}

async fn enumerate_tables(
    client: &tokio_postgres::Client,
) -> Result<Vec<TableSpec>, SnapshotError> {
    let rows = client
        .query(
            "SELECT table_schema, table_name
             FROM information_schema.tables
             WHERE table_type = 'BASE TABLE'
               AND table_schema NOT IN ('pg_catalog', 'information_schema', 'steep_repl')
             ORDER BY table_schema, table_name",
            &[],
        )
        .await?;
    Ok(rows
        .into_iter()
        .map(|row| TableSpec {
            schema: row.get(0),
            table: row.get(1),
        })
        .collect())
}

async fn capture_sequences(
    client: &tokio_postgres::Client,
) -> Result<Vec<SequenceEntry>, SnapshotError> {
    let rows = client
        .query(
            "SELECT sequence_schema, sequence_name
             FROM information_schema.sequences
             WHERE sequence_schema NOT IN ('pg_catalog', 'information_schema', 'steep_repl')
             ORDER BY sequence_schema, sequence_name",
            &[],
        )
        .await?;
    let mut sequences = Vec::with_capacity(rows.len());
    for row in rows {
        let schema: String = row.get(0);
        let name: String = row.get(1);
        let value_row = client
            .query_one(
                &format!(
                    "SELECT last_value, is_called FROM {}.{}",
                    quote_ident(&schema),
                    quote_ident(&name)
                ),
                &[],
            )
            .await?;
        sequences.push(SequenceEntry {
            schema,
            name,
            last_value: value_row.get(0),
            is_called: value_row.get(1),
        });
    }
    Ok(sequences)
}

fn cleanup_partial(output_dir: &Path) {
    if let Err(e) = fs::remove_dir_all(output_dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(dir = %output_dir.display(), error = %e, "failed to remove partial snapshot");
        }
    }
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_name_sanitized_and_bounded() {
        assert_eq!(snapshot_slot_name("Snap-01"), "steep_snap_snap_01");
        assert!(snapshot_slot_name(&"z".repeat(200)).len() <= 63);
    }

    #[test]
    fn worker_count_clamped_to_bounds() {
        let mut options = GenerateOptions {
            snapshot_id: "s1".to_string(),
            source_node: NodeId::new("node-a"),
            output_dir: PathBuf::from("/tmp/s1"),
            codec: CompressionCodec::None,
            parallel_workers: None,
        };
        assert_eq!(options.workers(), 4);
        options.parallel_workers = Some(0);
        assert_eq!(options.workers(), 1);
        options.parallel_workers = Some(64);
        assert_eq!(options.workers(), 16);
    }

    #[test]
    fn identifier_quoting() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
    }
}
