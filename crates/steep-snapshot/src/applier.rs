//! Snapshot application: verify, truncate, import, re-sequence.

use std::fs;
use std::io::Read;
use std::path::Path;

use bytes::Bytes;
use futures::SinkExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use steep_db::connect_with_retry;
use steep_progress::ProgressFabric;
use steep_types::{NodeId, OperationKind, ProgressPhase, ProgressUpdate};

use crate::codec::hash_reader;
use crate::generator::quote_ident;
use crate::{DecodingReader, SnapshotError, SnapshotManifest, TableEntry, io_error};

/// Application parameters.
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    pub snapshot_dir: std::path::PathBuf,
    pub target_node: NodeId,
    /// Recompute every file's SHA-256 before any mutation.
    pub verify_checksums: bool,
}

/// Result of a completed application.
#[derive(Debug)]
pub struct ApplyOutcome {
    pub manifest: SnapshotManifest,
    pub rows_applied: u64,
}

/// Applies a snapshot to the target database.
///
/// Checksums, when requested, are verified for every file before the
/// first TRUNCATE: a tampered snapshot leaves the target unmodified. Each
/// table loads under a single transaction; sequences are restored after
/// all tables.
pub async fn apply_snapshot(
    target_conninfo: &str,
    options: &ApplyOptions,
    fabric: &ProgressFabric,
    cancel: &CancellationToken,
) -> Result<ApplyOutcome, SnapshotError> {
    let manifest = SnapshotManifest::load(&options.snapshot_dir)?;
    let result = apply_inner(target_conninfo, options, &manifest, fabric, cancel).await;
    match result {
        Ok(rows_applied) => {
            fabric.publish(progress_base(options, &manifest).completed());
            Ok(ApplyOutcome {
                manifest,
                rows_applied,
            })
        }
        Err(e) => {
            warn!(snapshot = %manifest.snapshot_id, error = %e, "snapshot apply failed");
            fabric.publish(progress_base(options, &manifest).failed(e.to_string()));
            Err(e)
        }
    }
}

fn progress_base(options: &ApplyOptions, manifest: &SnapshotManifest) -> ProgressUpdate {
    let mut update = ProgressUpdate::starting(
        OperationKind::SnapshotApply,
        manifest.snapshot_id.clone(),
        options.target_node.clone(),
    );
    update.phase = ProgressPhase::Application;
    update.tables_total = manifest.tables.len() as i32;
    update
}

async fn apply_inner(
    target_conninfo: &str,
    options: &ApplyOptions,
    manifest: &SnapshotManifest,
    fabric: &ProgressFabric,
    cancel: &CancellationToken,
) -> Result<u64, SnapshotError> {
    if options.verify_checksums {
        verify_files(options, manifest, fabric)?;
    }

    let mut client = connect_with_retry(target_conninfo).await?;
    let mut rows_applied = 0u64;
    let total = manifest.tables.len() as f32;

    for (index, entry) in manifest.tables.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(SnapshotError::Cancelled);
        }
        rows_applied += load_table(&mut client, options, manifest, entry).await?;

        let mut update = progress_base(options, manifest);
        update.tables_completed = index as i32 + 1;
        update.rows_copied = rows_applied as i64;
        update.current_table = Some(format!("{}.{}", entry.schema, entry.table));
        update.overall_percent = 10.0 + 85.0 * (index as f32 + 1.0) / total.max(1.0);
        fabric.publish(update);
    }

    restore_sequences(&client, manifest).await?;
    info!(
        snapshot = %manifest.snapshot_id,
        tables = manifest.tables.len(),
        rows = rows_applied,
        "snapshot applied"
    );
    Ok(rows_applied)
}

/// Recomputes every file's checksum over its uncompressed bytes.
fn verify_files(
    options: &ApplyOptions,
    manifest: &SnapshotManifest,
    fabric: &ProgressFabric,
) -> Result<(), SnapshotError> {
    let total = manifest.tables.len() as f32;
    for (index, entry) in manifest.tables.iter().enumerate() {
        let path = options.snapshot_dir.join(&entry.file);
        let actual = checksum_file(&path, manifest)?;
        if actual != entry.sha256 {
            return Err(SnapshotError::ChecksumMismatch {
                file: entry.file.clone(),
                expected: entry.sha256.clone(),
                actual,
            });
        }
        let mut update = progress_base(options, manifest);
        update.current_table = Some(format!("{}.{}", entry.schema, entry.table));
        update.overall_percent = 10.0 * (index as f32 + 1.0) / total.max(1.0);
        fabric.publish(update);
    }
    Ok(())
}

fn checksum_file(path: &Path, manifest: &SnapshotManifest) -> Result<String, SnapshotError> {
    let file = fs::File::open(path).map_err(|e| io_error(path, e))?;
    let decoder = DecodingReader::new(manifest.codec, file).map_err(|e| io_error(path, e))?;
    let (digest, _) = hash_reader(decoder).map_err(|e| io_error(path, e))?;
    Ok(digest)
}

/// TRUNCATE + COPY FROM under one transaction.
async fn load_table(
    client: &mut tokio_postgres::Client,
    options: &ApplyOptions,
    manifest: &SnapshotManifest,
    entry: &TableEntry,
) -> Result<u64, SnapshotError> {
    let qualified = format!(
        "{}.{}",
        quote_ident(&entry.schema),
        quote_ident(&entry.table)
    );
    let path = options.snapshot_dir.join(&entry.file);
    let file = fs::File::open(&path).map_err(|e| io_error(&path, e))?;
    let mut decoder = DecodingReader::new(manifest.codec, file).map_err(|e| io_error(&path, e))?;

    let tx = client.transaction().await?;
    // Replica session role keeps user triggers quiet during the bulk load,
    // matching logical replication's initial table sync.
    tx.batch_execute("SET LOCAL session_replication_role = replica")
        .await?;
    tx.batch_execute(&format!("TRUNCATE {qualified}")).await?;

    let sink = tx
        .copy_in(&format!(
            "COPY {qualified} FROM STDIN WITH (FORMAT csv, HEADER true)"
        ))
        .await?;
    futures::pin_mut!(sink);

    let mut buf = vec![0u8; 256 * 1024];
    loop {
        let n = decoder.read(&mut buf).map_err(|e| io_error(&path, e))?;
        if n == 0 {
            break;
        }
        sink.send(Bytes::copy_from_slice(&buf[..n])).await?;
    }
    let rows = sink.finish().await?;
    tx.commit().await?;
    Ok(rows)
}

async fn restore_sequences(
    client: &tokio_postgres::Client,
    manifest: &SnapshotManifest,
) -> Result<(), SnapshotError> {
    for sequence in &manifest.sequences {
        let qualified = format!(
            "{}.{}",
            quote_ident(&sequence.schema),
            quote_ident(&sequence.name)
        );
        client
            .execute(
                "SELECT setval($1::regclass, $2, $3)",
                &[&qualified, &sequence.last_value, &sequence.is_called],
            )
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use steep_types::CompressionCodec;
    use tempfile::tempdir;

    use crate::{EncodingWriter, SCHEMA_VERSION, Sha256Writer};

    fn write_snapshot(dir: &Path, codec: CompressionCodec, payload: &[u8]) -> SnapshotManifest {
        fs::create_dir_all(dir.join("data")).unwrap();
        let rel = format!("data/{}", codec.data_file_name("public", "users"));
        let file = fs::File::create(dir.join(&rel)).unwrap();
        let encoder = EncodingWriter::new(codec, file).unwrap();
        let mut hashed = Sha256Writer::new(encoder);
        hashed.write_all(payload).unwrap();
        let (sha256, bytes, encoder) = hashed.finish().unwrap();
        encoder.finish().unwrap();

        let manifest = SnapshotManifest {
            snapshot_id: "snap-apply".to_string(),
            source_node_id: NodeId::new("node-a"),
            lsn: "0/5000".parse().unwrap(),
            codec,
            schema_version: SCHEMA_VERSION,
            tables: vec![TableEntry {
                schema: "public".to_string(),
                table: "users".to_string(),
                file: rel,
                rows: 2,
                bytes,
                sha256,
            }],
            sequences: Vec::new(),
        };
        manifest.write(dir).unwrap();
        manifest
    }

    #[test]
    fn verify_accepts_untampered_files() {
        let dir = tempdir().unwrap();
        let manifest = write_snapshot(dir.path(), CompressionCodec::Gzip, b"id,name\n1,a\n2,b\n");
        let options = ApplyOptions {
            snapshot_dir: dir.path().to_path_buf(),
            target_node: NodeId::new("node-b"),
            verify_checksums: true,
        };
        verify_files(&options, &manifest, &ProgressFabric::new()).unwrap();
    }

    #[test]
    fn verify_flags_single_byte_tamper_as_data_loss() {
        let dir = tempdir().unwrap();
        // Plain codec so the tamper hits the logical bytes directly.
        let manifest = write_snapshot(dir.path(), CompressionCodec::None, b"id,name\n1,a\n2,b\n");

        let data_path = dir.path().join(&manifest.tables[0].file);
        let mut bytes = fs::read(&data_path).unwrap();
        bytes[9] ^= 0x01;
        fs::write(&data_path, bytes).unwrap();

        let options = ApplyOptions {
            snapshot_dir: dir.path().to_path_buf(),
            target_node: NodeId::new("node-b"),
            verify_checksums: true,
        };
        let err = verify_files(&options, &manifest, &ProgressFabric::new()).unwrap_err();
        assert!(matches!(err, SnapshotError::ChecksumMismatch { .. }));
        assert_eq!(err.kind(), steep_types::ErrorKind::DataLoss);
    }
}
