//! Request routing: maps each wire request onto the registry, fingerprint
//! engine, init machine, snapshot pipeline, or merge engine, and streams
//! progress for the long-running operations.

use std::path::PathBuf;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use steep_db::{WorkQueueStore, connect_with_retry};
use steep_fingerprint::{
    ColumnDiff, FingerprintStore, SchemaComparison, Verdict, capture_fingerprints, compare_schemas,
    diff_columns, fetch_table_columns,
};
use steep_init::{InitError, StartInitSpec};
use steep_merge::{MergeOptions, PeerEndpoint, run_merge};
use steep_registry::{Node, RegistryStore};
use steep_snapshot::{GenerateOptions, generate_snapshot};
use steep_types::{
    CompressionCodec, ErrorKind, InitMethod, NodeId, ProgressUpdate, WorkOperation, WorkStatus,
};
use steep_wire::{
    ColumnDiffEntry, ErrorCode, FingerprintRecord, FingerprintVerdict, InitOptions, NodeRecord,
    PROTOCOL_VERSION, Request, RequestId, RequestPayload, Response, ResponsePayload,
    SchemaComparisonReport, TableComparison, encode_frame,
};

use crate::{DaemonState, ServerError};

type OpResult = Result<ResponsePayload, (ErrorKind, String)>;

/// Per-connection handler. Holds no state beyond the shared daemon state
/// and whether the handshake has completed.
pub struct RequestHandler {
    state: DaemonState,
    handshaken: bool,
}

impl RequestHandler {
    pub fn new(state: DaemonState) -> Self {
        Self {
            state,
            handshaken: false,
        }
    }

    /// Handles one request, writing one or more response frames to `sink`.
    #[instrument(skip_all, fields(request_id = request.id.0))]
    pub async fn handle<W: AsyncWrite + Unpin>(
        &mut self,
        request: Request,
        sink: &mut W,
    ) -> Result<(), ServerError> {
        let id = request.id;

        if let RequestPayload::Handshake { protocol_version } = &request.payload {
            if *protocol_version != PROTOCOL_VERSION {
                let response = Response::error(
                    id,
                    ErrorCode::InvalidArgument,
                    format!(
                        "protocol version {protocol_version} unsupported; server speaks {PROTOCOL_VERSION}"
                    ),
                );
                write_frame(sink, &response).await?;
                return Err(ServerError::ProtocolMismatch {
                    client: *protocol_version,
                    server: PROTOCOL_VERSION,
                });
            }
            self.handshaken = true;
            let response = Response::new(
                id,
                ResponsePayload::HandshakeAck {
                    protocol_version: PROTOCOL_VERSION,
                    node_id: self.state.local_node.clone(),
                },
            );
            return write_frame(sink, &response).await;
        }

        if !self.handshaken {
            let response =
                Response::error(id, ErrorCode::FailedPrecondition, "handshake required");
            write_frame(sink, &response).await?;
            return Err(ServerError::HandshakeRequired);
        }

        match request.payload {
            RequestPayload::StreamProgress {
                operation_id,
                node_id,
            } => self.stream_progress(id, operation_id, node_id, sink).await,
            RequestPayload::GenerateSnapshot {
                source,
                output_dir,
                codec,
                parallel_workers,
            } => {
                self.generate_snapshot_stream(
                    id,
                    source,
                    output_dir,
                    codec,
                    parallel_workers,
                    sink,
                )
                .await
            }
            RequestPayload::ApplySnapshot {
                target,
                snapshot_dir,
                verify_checksums,
                source_node,
            } => {
                self.apply_snapshot_stream(
                    id,
                    target,
                    snapshot_dir,
                    verify_checksums,
                    source_node,
                    sink,
                )
                .await
            }
            payload => {
                let deadline =
                    Duration::from_secs(self.state.config.rpc.control_deadline_secs);
                let result = tokio::time::timeout(deadline, self.dispatch(payload)).await;
                let response = match result {
                    Ok(Ok(payload)) => Response::new(id, payload),
                    Ok(Err((kind, message))) => {
                        Response::error(id, ErrorCode::from(kind), message)
                    }
                    Err(_) => Response::error(
                        id,
                        ErrorCode::Unavailable,
                        "control-plane deadline exceeded",
                    ),
                };
                write_frame(sink, &response).await
            }
        }
    }

    /// Unary operations.
    async fn dispatch(&self, payload: RequestPayload) -> OpResult {
        match payload {
            RequestPayload::HealthCheck => self.health().await,
            RequestPayload::RegisterNode {
                node_id,
                node_name,
                host,
                port,
                priority,
            } => {
                let client = self.borrow().await?;
                let node =
                    RegistryStore::register(&**client, &node_id, &node_name, &host, port, priority)
                        .await
                        .map_err(wrap)?;
                Ok(ResponsePayload::NodeRegistered(to_record(&node)))
            }
            RequestPayload::GetNodes { status_filter } => {
                let client = self.borrow().await?;
                let nodes = RegistryStore::get_nodes(&**client, status_filter)
                    .await
                    .map_err(wrap)?;
                Ok(ResponsePayload::Nodes(nodes.iter().map(to_record).collect()))
            }
            RequestPayload::Heartbeat { node_id, .. } => {
                let client = self.borrow().await?;
                let coordinator = RegistryStore::heartbeat(&**client, &node_id)
                    .await
                    .map_err(wrap)?;
                Ok(ResponsePayload::HeartbeatAck { coordinator })
            }
            RequestPayload::SyncNodeMetadata { node } => {
                let client = self.borrow().await?;
                RegistryStore::sync_metadata(&**client, &from_record(&node))
                    .await
                    .map_err(wrap)?;
                Ok(ResponsePayload::MetadataSynced)
            }
            RequestPayload::StartInit {
                target,
                source,
                method,
                options,
            } => self.start_init(target, source, method, options).await,
            RequestPayload::CancelInit { node_id } => {
                self.state.machine.cancel_init(&node_id).await.map_err(wrap)?;
                Ok(ResponsePayload::InitCancelled)
            }
            RequestPayload::PrepareInit { node_id, slot_name } => {
                let slot = self
                    .state
                    .machine
                    .prepare_init(&node_id, slot_name.as_deref())
                    .await
                    .map_err(wrap)?;
                Ok(ResponsePayload::SlotPrepared {
                    slot_name: slot.slot_name,
                    lsn: slot.lsn,
                })
            }
            RequestPayload::CompleteInit {
                target,
                source,
                slot_name,
                lsn: _,
                schema_sync,
            } => {
                let source_conninfo = self.resolve_conninfo(&source).await?;
                let operation_id = self
                    .state
                    .machine
                    .complete_init(&target, &source, &slot_name, schema_sync, &source_conninfo)
                    .await
                    .map_err(wrap)?;
                Ok(ResponsePayload::InitCompleted { operation_id })
            }
            RequestPayload::StartReinit { node_id, scope } => {
                let client = self.borrow().await?;
                let node = RegistryStore::get(&**client, &node_id)
                    .await
                    .map_err(wrap)?
                    .ok_or_else(|| not_found(&node_id))?;
                drop(client);
                let source_conninfo = match &node.init_source_node {
                    Some(source) => self.resolve_conninfo(source).await.unwrap_or_default(),
                    None => String::new(),
                };
                let operation_id = self
                    .state
                    .machine
                    .start_reinit(&node_id, &scope, &source_conninfo)
                    .await
                    .map_err(wrap)?;
                Ok(ResponsePayload::ReinitStarted { operation_id })
            }
            RequestPayload::GetProgress { node_id } => {
                let update = self
                    .state
                    .machine
                    .get_progress(&node_id)
                    .await
                    .map_err(wrap)?;
                Ok(ResponsePayload::ProgressSnapshot(update))
            }
            RequestPayload::CompareSchemas {
                local: _,
                remote,
                mode: _,
            } => {
                let report = self.compare_with_peer(&remote).await?;
                Ok(ResponsePayload::SchemaComparison(report))
            }
            RequestPayload::GetColumnDiff {
                peer,
                schema_name,
                table_name,
            } => {
                let diffs = self.column_diff(&peer, &schema_name, &table_name).await?;
                Ok(ResponsePayload::ColumnDiff(diffs))
            }
            RequestPayload::CaptureFingerprints { node_id: _, schemas } => {
                let client = self.borrow().await?;
                let tables = capture_fingerprints(&**client, schemas.as_deref())
                    .await
                    .map_err(wrap)?;
                Ok(ResponsePayload::FingerprintsCaptured {
                    tables: tables as u32,
                })
            }
            RequestPayload::GetSchemaFingerprints { node_id: _ } => {
                let client = self.borrow().await?;
                let stored = FingerprintStore::all(&**client).await.map_err(wrap)?;
                Ok(ResponsePayload::Fingerprints(
                    stored
                        .into_iter()
                        .map(|fp| FingerprintRecord {
                            schema_name: fp.table_schema,
                            table_name: fp.table_name,
                            fingerprint: fp.fingerprint,
                            column_count: fp.columns.len() as u32,
                            captured_at: fp.captured_at,
                        })
                        .collect(),
                ))
            }
            RequestPayload::StartBidirectionalMerge {
                local: _,
                peer,
                strategy,
                dry_run,
                quiesce_timeout_ms,
            } => {
                self.start_merge(peer, strategy, dry_run, quiesce_timeout_ms)
                    .await
            }
            RequestPayload::Handshake { .. }
            | RequestPayload::StreamProgress { .. }
            | RequestPayload::GenerateSnapshot { .. }
            | RequestPayload::ApplySnapshot { .. } => Err((
                ErrorKind::Internal,
                "streaming request routed to unary dispatch".to_string(),
            )),
        }
    }

    async fn health(&self) -> OpResult {
        let (pg_connected, pg_version, active) = match self.state.db.get().await {
            Ok(client) => {
                let version = client
                    .query_one("SHOW server_version", &[])
                    .await
                    .ok()
                    .map(|row| row.get::<_, String>(0));
                let active: i64 = client
                    .query_one(
                        "SELECT count(*) FROM steep_repl.work_queue WHERE status = 'running'",
                        &[],
                    )
                    .await
                    .map(|row| row.get(0))
                    .unwrap_or(0);
                (true, version, active)
            }
            Err(_) => (false, None, 0),
        };
        Ok(ResponsePayload::Health {
            status: if pg_connected { "healthy" } else { "degraded" }.to_string(),
            pg_connected,
            pg_version,
            active_operations: active as u32,
        })
    }

    async fn start_init(
        &self,
        target: NodeId,
        source: NodeId,
        method: InitMethod,
        options: InitOptions,
    ) -> OpResult {
        let source_conninfo = match method {
            InitMethod::Direct => options
                .direct_conninfo
                .clone()
                .ok_or((
                    ErrorKind::InvalidArgument,
                    "method direct requires direct_conninfo".to_string(),
                ))?,
            _ => self.resolve_conninfo(&source).await?,
        };
        let spec = StartInitSpec {
            target,
            source,
            method,
            schema_sync: options.schema_sync,
            source_conninfo,
            snapshot_dir: options.snapshot_dir.map(PathBuf::from),
            codec: options.codec,
            parallel_workers: options.parallel_workers,
        };
        let operation_id = self.state.machine.start_init(spec).await.map_err(wrap)?;
        Ok(ResponsePayload::InitStarted { operation_id })
    }

    async fn start_merge(
        &self,
        peer: NodeId,
        strategy: steep_types::ConflictStrategy,
        dry_run: bool,
        quiesce_timeout_ms: u64,
    ) -> OpResult {
        let peer_node = self.lookup_node(&peer).await?;
        let database = &self.state.config.database;
        let endpoint = PeerEndpoint {
            host: peer_node.host.clone(),
            port: peer_node.port,
            dbname: database.dbname.clone(),
            user: database.user.clone(),
            password: (!database.password.is_empty()).then(|| database.password.clone()),
        };
        let operation_id = uuid::Uuid::new_v4().to_string();
        let options = MergeOptions {
            merge_id: operation_id.clone(),
            local_node: self.state.local_node.clone(),
            peer_node: peer,
            strategy,
            dry_run,
            quiesce_timeout_ms,
        };

        {
            let client = self.borrow().await?;
            WorkQueueStore::enqueue(
                &**client,
                WorkOperation::BidirectionalMerge,
                &operation_id,
                &serde_json::json!({
                    "peer": options.peer_node.as_str(),
                    "strategy": strategy.as_str(),
                    "dry_run": dry_run,
                }),
            )
            .await
            .map_err(wrap)?;
        }

        let state = self.state.clone();
        let local_conninfo = self.state.config.database.conninfo();
        let deadline = Duration::from_secs(60 * self.state.config.merge.deadline_mins);
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let timer = cancel.clone();
            let timeout_guard = tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                timer.cancel();
            });
            let result = run_merge(&local_conninfo, &endpoint, &options, &state.fabric, &cancel)
                .await;
            timeout_guard.abort();

            let (status, error) = match &result {
                Ok(summary) => {
                    info!(merge = %options.merge_id, conflicts = summary.total_conflicts(), "merge completed");
                    (WorkStatus::Completed, None)
                }
                Err(e) => {
                    warn!(merge = %options.merge_id, error = %e, "merge failed");
                    (WorkStatus::Failed, Some(e.to_string()))
                }
            };
            if let Ok(client) = state.db.get().await {
                if let Ok(Some(entry)) = WorkQueueStore::find(&**client, &options.merge_id).await {
                    let _ =
                        WorkQueueStore::finish(&**client, entry.id, status, error.as_deref()).await;
                }
            }
        });

        Ok(ResponsePayload::MergeStarted { operation_id })
    }

    // ------------------------------------------------------------------
    // Streaming operations
    // ------------------------------------------------------------------

    async fn stream_progress<W: AsyncWrite + Unpin>(
        &self,
        id: RequestId,
        operation_id: Option<String>,
        node_id: Option<NodeId>,
        sink: &mut W,
    ) -> Result<(), ServerError> {
        let mut subscriber = self.state.fabric.subscribe();
        while let Some(update) = subscriber.recv().await {
            if !matches_filter(&update, operation_id.as_deref(), node_id.as_ref()) {
                continue;
            }
            let terminal = update.is_terminal();
            write_frame(sink, &Response::new(id, ResponsePayload::Progress(update))).await?;
            if terminal {
                break;
            }
        }
        write_frame(sink, &Response::new(id, ResponsePayload::StreamEnd)).await
    }

    async fn generate_snapshot_stream<W: AsyncWrite + Unpin>(
        &self,
        id: RequestId,
        source: NodeId,
        output_dir: String,
        codec: CompressionCodec,
        parallel_workers: Option<u8>,
        sink: &mut W,
    ) -> Result<(), ServerError> {
        let operation_id = uuid::Uuid::new_v4().to_string();
        {
            let client = self.state.db.get().await?;
            WorkQueueStore::enqueue(
                &**client,
                WorkOperation::SnapshotGenerate,
                &operation_id,
                &serde_json::json!({"output_dir": output_dir, "codec": codec.as_str()}),
            )
            .await?;
            client
                .execute(
                    "INSERT INTO steep_repl.snapshots
                         (snapshot_id, source_node_id, storage_path, compression, status)
                     VALUES ($1, $2, $3, $4, 'generating')
                     ON CONFLICT (snapshot_id) DO NOTHING",
                    &[
                        &operation_id,
                        &self.state.local_node.as_str(),
                        &output_dir,
                        &codec.as_str(),
                    ],
                )
                .await
                .map_err(steep_db::DbError::from)?;
        }

        let options = GenerateOptions {
            snapshot_id: operation_id.clone(),
            source_node: source,
            output_dir: PathBuf::from(output_dir),
            codec,
            parallel_workers,
        };
        let conninfo = self.state.config.database.conninfo();
        let fabric = self.state.fabric.clone();
        let deadline = Duration::from_secs(3600 * self.state.config.snapshot.deadline_hours);
        let cancel = CancellationToken::new();
        let timer = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            timer.cancel();
        });

        let mut subscriber = self.state.fabric.subscribe();
        let task = tokio::spawn(async move {
            generate_snapshot(&conninfo, &options, &fabric, &cancel).await
        });

        self.pump_progress(id, &operation_id, &mut subscriber, sink).await?;

        let final_payload = match task.await {
            Ok(Ok(outcome)) => {
                self.finish_work(&operation_id, WorkStatus::Completed, None).await;
                let bytes: u64 = outcome.manifest.tables.iter().map(|t| t.bytes).sum();
                let rows: i64 = outcome.manifest.tables.iter().map(|t| t.rows as i64).sum();
                self.record_snapshot_complete(&outcome.manifest, bytes as i64, rows)
                    .await;
                ResponsePayload::SnapshotGenerated {
                    snapshot_id: outcome.manifest.snapshot_id.clone(),
                    lsn: outcome.manifest.lsn,
                    tables: outcome.manifest.tables.len() as u32,
                    bytes,
                }
            }
            Ok(Err(e)) => {
                self.finish_work(&operation_id, WorkStatus::Failed, Some(&e.to_string()))
                    .await;
                self.record_snapshot_failed(&operation_id, &e.to_string()).await;
                return write_frame(
                    sink,
                    &Response::error(id, ErrorCode::from(e.kind()), e.to_string()),
                )
                .await;
            }
            Err(join_err) => {
                return write_frame(
                    sink,
                    &Response::error(id, ErrorCode::Internal, join_err.to_string()),
                )
                .await;
            }
        };
        write_frame(sink, &Response::new(id, final_payload)).await
    }

    async fn apply_snapshot_stream<W: AsyncWrite + Unpin>(
        &self,
        id: RequestId,
        target: NodeId,
        snapshot_dir: String,
        verify_checksums: bool,
        source_node: Option<NodeId>,
        sink: &mut W,
    ) -> Result<(), ServerError> {
        let catchup = match &source_node {
            Some(source) => match self.resolve_conninfo(source).await {
                Ok(conninfo) => Some((source.clone(), conninfo)),
                Err((kind, message)) => {
                    return write_frame(
                        sink,
                        &Response::error(id, ErrorCode::from(kind), message),
                    )
                    .await;
                }
            },
            None => None,
        };

        let mut subscriber = self.state.fabric.subscribe();
        let operation_id = match self
            .state
            .machine
            .apply_snapshot_init(&target, PathBuf::from(snapshot_dir), verify_checksums, catchup)
            .await
        {
            Ok(operation_id) => operation_id,
            Err(e) => {
                return write_frame(
                    sink,
                    &Response::error(id, ErrorCode::from(e.kind()), e.to_string()),
                )
                .await;
            }
        };

        // The apply driver publishes under the manifest's snapshot id once
        // the manifest loads; progress for this node is what the caller
        // wants either way.
        let last = self
            .pump_progress_for_node(id, &target, &mut subscriber, sink)
            .await?;
        let _ = operation_id;

        match last {
            Some(update) if update.error_message.is_none() => {
                write_frame(
                    sink,
                    &Response::new(
                        id,
                        ResponsePayload::SnapshotApplied {
                            snapshot_id: update.operation_id,
                            rows: update.rows_copied.max(0) as u64,
                        },
                    ),
                )
                .await
            }
            Some(update) => {
                let message = update.error_message.unwrap_or_default();
                // The bus carries the message, not the status; recover the
                // contractual codes from the failure class.
                let code = if message.contains("checksum mismatch") {
                    ErrorCode::DataLoss
                } else if message.contains("cancelled") {
                    ErrorCode::Canceled
                } else {
                    ErrorCode::Internal
                };
                write_frame(sink, &Response::error(id, code, message)).await
            }
            None => write_frame(sink, &Response::new(id, ResponsePayload::StreamEnd)).await,
        }
    }

    async fn pump_progress<W: AsyncWrite + Unpin>(
        &self,
        id: RequestId,
        operation_id: &str,
        subscriber: &mut steep_progress::ProgressSubscriber,
        sink: &mut W,
    ) -> Result<(), ServerError> {
        while let Some(update) = subscriber.recv().await {
            if update.operation_id != operation_id {
                continue;
            }
            let terminal = update.is_terminal();
            write_frame(sink, &Response::new(id, ResponsePayload::Progress(update))).await?;
            if terminal {
                break;
            }
        }
        Ok(())
    }

    async fn pump_progress_for_node<W: AsyncWrite + Unpin>(
        &self,
        id: RequestId,
        node: &NodeId,
        subscriber: &mut steep_progress::ProgressSubscriber,
        sink: &mut W,
    ) -> Result<Option<ProgressUpdate>, ServerError> {
        while let Some(update) = subscriber.recv().await {
            if &update.node_id != node {
                continue;
            }
            let terminal = update.is_terminal();
            write_frame(
                sink,
                &Response::new(id, ResponsePayload::Progress(update.clone())),
            )
            .await?;
            if terminal {
                return Ok(Some(update));
            }
        }
        Ok(None)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn borrow(&self) -> Result<deadpool_postgres::Object, (ErrorKind, String)> {
        self.state.db.get().await.map_err(wrap)
    }

    async fn lookup_node(&self, node_id: &NodeId) -> Result<Node, (ErrorKind, String)> {
        let client = self.borrow().await?;
        RegistryStore::get(&**client, node_id)
            .await
            .map_err(wrap)?
            .ok_or_else(|| not_found(node_id))
    }

    async fn resolve_conninfo(&self, node_id: &NodeId) -> Result<String, (ErrorKind, String)> {
        if node_id == &self.state.local_node {
            return Ok(self.state.config.database.conninfo());
        }
        let node = self.lookup_node(node_id).await?;
        Ok(self.state.conninfo_for(&node))
    }

    async fn compare_with_peer(
        &self,
        remote: &NodeId,
    ) -> Result<SchemaComparisonReport, (ErrorKind, String)> {
        let remote_conninfo = self.resolve_conninfo(remote).await?;
        let client = self.borrow().await?;
        let local_columns = fetch_table_columns(&**client, None).await.map_err(wrap)?;
        let remote_client = connect_with_retry(&remote_conninfo).await.map_err(wrap)?;
        let remote_columns = fetch_table_columns(&remote_client, None)
            .await
            .map_err(wrap)?;
        Ok(to_report(&compare_schemas(&local_columns, &remote_columns)))
    }

    async fn column_diff(
        &self,
        peer: &NodeId,
        schema_name: &str,
        table_name: &str,
    ) -> Result<Vec<ColumnDiffEntry>, (ErrorKind, String)> {
        let peer_conninfo = self.resolve_conninfo(peer).await?;
        let client = self.borrow().await?;
        let schemas = vec![schema_name.to_string()];
        let local = fetch_table_columns(&**client, Some(&schemas))
            .await
            .map_err(wrap)?;
        let remote_client = connect_with_retry(&peer_conninfo).await.map_err(wrap)?;
        let remote = fetch_table_columns(&remote_client, Some(&schemas))
            .await
            .map_err(wrap)?;

        let find = |set: &[(String, String, Vec<steep_fingerprint::ColumnDefinition>)]| {
            set.iter()
                .find(|(s, t, _)| s == schema_name && t == table_name)
                .map(|(_, _, columns)| columns.clone())
                .unwrap_or_default()
        };
        let diffs = diff_columns(&find(&local), &find(&remote));
        Ok(diffs.iter().map(to_diff_entry).collect())
    }

    async fn finish_work(&self, operation_id: &str, status: WorkStatus, error: Option<&str>) {
        if let Ok(client) = self.state.db.get().await {
            if let Ok(Some(entry)) = WorkQueueStore::find(&**client, operation_id).await {
                let _ = WorkQueueStore::finish(&**client, entry.id, status, error).await;
            }
        }
    }

    async fn record_snapshot_complete(
        &self,
        manifest: &steep_snapshot::SnapshotManifest,
        bytes: i64,
        rows: i64,
    ) {
        let retention_hours = self.state.config.snapshot.retention_hours as i32;
        if let Ok(client) = self.state.db.get().await {
            let result = client
                .execute(
                    "UPDATE steep_repl.snapshots SET
                         status = 'complete',
                         lsn = $2,
                         table_count = $3,
                         size_bytes = $4,
                         rows_total = $5,
                         overall_percent = 100,
                         tables_completed = $3,
                         completed_at = now(),
                         expires_at = now() + make_interval(hours => $6::int4)
                     WHERE snapshot_id = $1",
                    &[
                        &manifest.snapshot_id,
                        &manifest.lsn.to_string(),
                        &(manifest.tables.len() as i32),
                        &bytes,
                        &rows,
                        &retention_hours,
                    ],
                )
                .await;
            if let Err(e) = result {
                warn!(snapshot = %manifest.snapshot_id, error = %e, "snapshot registry update failed");
            }
        }
    }

    async fn record_snapshot_failed(&self, snapshot_id: &str, error: &str) {
        if let Ok(client) = self.state.db.get().await {
            let result = client
                .execute(
                    "UPDATE steep_repl.snapshots
                     SET status = 'failed', error_message = $2, completed_at = now()
                     WHERE snapshot_id = $1",
                    &[&snapshot_id, &error],
                )
                .await;
            if let Err(e) = result {
                warn!(snapshot = %snapshot_id, error = %e, "snapshot registry update failed");
            }
        }
    }
}

fn matches_filter(
    update: &ProgressUpdate,
    operation_id: Option<&str>,
    node_id: Option<&NodeId>,
) -> bool {
    if let Some(op) = operation_id {
        if update.operation_id != op {
            return false;
        }
    }
    if let Some(node) = node_id {
        if &update.node_id != node {
            return false;
        }
    }
    true
}

fn wrap<E>(error: E) -> (ErrorKind, String)
where
    E: std::fmt::Display + ErrorWithKind,
{
    (error.kind(), error.to_string())
}

fn not_found(node: &NodeId) -> (ErrorKind, String) {
    (ErrorKind::NotFound, format!("unknown node {node}"))
}

/// Every component error exposes its status mapping; this trait lets one
/// `wrap` serve them all.
trait ErrorWithKind {
    fn kind(&self) -> ErrorKind;
}

impl ErrorWithKind for steep_db::DbError {
    fn kind(&self) -> ErrorKind {
        steep_db::DbError::kind(self)
    }
}
impl ErrorWithKind for steep_registry::RegistryError {
    fn kind(&self) -> ErrorKind {
        steep_registry::RegistryError::kind(self)
    }
}
impl ErrorWithKind for steep_fingerprint::FingerprintError {
    fn kind(&self) -> ErrorKind {
        steep_fingerprint::FingerprintError::kind(self)
    }
}
impl ErrorWithKind for InitError {
    fn kind(&self) -> ErrorKind {
        InitError::kind(self)
    }
}

fn to_record(node: &Node) -> NodeRecord {
    NodeRecord {
        node_id: node.node_id.clone(),
        node_name: node.node_name.clone(),
        host: node.host.clone(),
        port: node.port,
        priority: node.priority,
        is_coordinator: node.is_coordinator,
        status: node.status,
        last_seen: node.last_seen,
        init_state: node.init_state,
        init_source_node: node.init_source_node.clone(),
        init_started_at: node.init_started_at,
        init_completed_at: node.init_completed_at,
    }
}

fn from_record(record: &NodeRecord) -> Node {
    Node {
        node_id: record.node_id.clone(),
        node_name: record.node_name.clone(),
        host: record.host.clone(),
        port: record.port,
        rpc_host: None,
        rpc_port: None,
        priority: record.priority,
        is_coordinator: record.is_coordinator,
        last_seen: record.last_seen,
        status: record.status,
        init_state: record.init_state,
        init_source_node: record.init_source_node.clone(),
        init_started_at: record.init_started_at,
        init_completed_at: record.init_completed_at,
    }
}

fn to_report(comparison: &SchemaComparison) -> SchemaComparisonReport {
    SchemaComparisonReport {
        matches: comparison.matches as u32,
        mismatches: comparison.mismatches as u32,
        local_only: comparison.local_only as u32,
        remote_only: comparison.remote_only as u32,
        blocking: comparison.blocking(),
        tables: comparison
            .tables
            .iter()
            .map(|t| TableComparison {
                schema_name: t.table_schema.clone(),
                table_name: t.table_name.clone(),
                verdict: match t.verdict {
                    Verdict::Match => FingerprintVerdict::Match,
                    Verdict::Mismatch => FingerprintVerdict::Mismatch,
                    Verdict::LocalOnly => FingerprintVerdict::LocalOnly,
                    Verdict::RemoteOnly => FingerprintVerdict::RemoteOnly,
                },
                local_fingerprint: t.local_fingerprint.clone(),
                remote_fingerprint: t.remote_fingerprint.clone(),
                column_diffs: t.column_diffs.iter().map(to_diff_entry).collect(),
            })
            .collect(),
    }
}

fn to_diff_entry(diff: &ColumnDiff) -> ColumnDiffEntry {
    let render = |c: &steep_fingerprint::ColumnDefinition| {
        format!(
            "{} {}{}",
            c.name,
            c.data_type,
            if c.nullable { "" } else { " NOT NULL" }
        )
    };
    ColumnDiffEntry {
        column_name: diff.column_name.clone(),
        difference: diff.kind.as_str().to_string(),
        blocking: diff.kind.is_blocking(),
        local_definition: diff.local.as_ref().map(render),
        remote_definition: diff.remote.as_ref().map(render),
    }
}

/// Encodes and writes one frame.
pub(crate) async fn write_frame<W: AsyncWrite + Unpin, T: serde::Serialize>(
    sink: &mut W,
    message: &T,
) -> Result<(), ServerError> {
    let mut buf = BytesMut::new();
    encode_frame(message, &mut buf)?;
    sink.write_all(&buf).await?;
    sink.flush().await?;
    Ok(())
}
