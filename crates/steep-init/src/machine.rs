//! Orchestration of init lifecycles.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use steep_db::{Db, connect_with_retry};
use steep_fingerprint::{compare_schemas, fetch_table_columns, gate};
use steep_progress::ProgressFabric;
use steep_registry::RegistryStore;
use steep_replication::{
    PreparedSlot, SlotManager, SubscriptionManager, SubscriptionMonitor, subscription_name,
};
use steep_snapshot::{
    ApplyOptions, GenerateOptions, apply_snapshot, generate_snapshot, snapshot_slot_name,
};
use steep_types::{
    CompressionCodec, InitMethod, InitState, Lsn, NodeId, OperationKind, OriginPolicy,
    ProgressPhase, ProgressUpdate, ReinitScope, SchemaSyncMode,
};

use crate::{CatchupTracker, Ewma, InitError, InitProgressStore, MIN_SERVER_VERSION_NUM};

/// Poll cadence for copy and catch-up monitoring.
const MONITOR_TICK: Duration = Duration::from_secs(1);

/// Prepared manual-init slots expire after this many hours unconsumed.
const SLOT_EXPIRY_HOURS: i64 = 24;

/// Everything `StartInit` needs, with connection strings already resolved
/// by the caller (registry lookup, or the operator-supplied side channel
/// for the direct method).
#[derive(Debug, Clone)]
pub struct StartInitSpec {
    pub target: NodeId,
    pub source: NodeId,
    pub method: InitMethod,
    pub schema_sync: SchemaSyncMode,
    pub source_conninfo: String,
    pub snapshot_dir: Option<PathBuf>,
    pub codec: CompressionCodec,
    pub parallel_workers: Option<u8>,
}

struct ActiveInit {
    operation_id: String,
    source: NodeId,
    source_conninfo: String,
    slot_name: Option<String>,
    subscription: Option<String>,
    cancel: CancellationToken,
}

/// The per-daemon init coordinator. The target node it manages is the
/// local one; `ops` serializes state transitions per target and enforces
/// the one-in-flight-init rule.
pub struct InitMachine {
    db: Db,
    fabric: ProgressFabric,
    target_conninfo: String,
    ops: Mutex<HashMap<NodeId, ActiveInit>>,
}

impl InitMachine {
    pub fn new(db: Db, fabric: ProgressFabric, target_conninfo: String) -> Arc<Self> {
        Arc::new(Self {
            db,
            fabric,
            target_conninfo,
            ops: Mutex::new(HashMap::new()),
        })
    }

    /// Restart recovery: any durable init row without a live in-memory
    /// operation is marked Failed. Operator reinit is required; a Failed
    /// init never auto-resumes.
    pub async fn recover(&self) -> Result<u64, InitError> {
        let client = self.db.get().await?;
        let failed = InitProgressStore::fail_orphans(&**client).await?;
        if failed > 0 {
            warn!(rows = failed, "marked orphaned inits failed after restart");
        }
        steep_db::WorkQueueStore::fail_orphans(&**client).await?;
        Ok(failed)
    }

    /// Starts an init. Returns the operation id; the lifecycle continues
    /// in a background driver reporting through the progress fabric.
    pub async fn start_init(self: &Arc<Self>, spec: StartInitSpec) -> Result<String, InitError> {
        if spec.method == InitMethod::Direct && spec.source_conninfo.is_empty() {
            return Err(InitError::MissingConninfo);
        }
        if spec.method == InitMethod::TwoPhase && spec.snapshot_dir.is_none() {
            return Err(InitError::MissingSnapshotDir);
        }

        let mut ops = self.ops.lock().await;
        if ops.contains_key(&spec.target) {
            return Err(InitError::AlreadyInFlight(spec.target.clone()));
        }

        let client = self.db.get().await?;
        self.ensure_source_registered(&**client, &spec.source, &spec.source_conninfo)
            .await?;
        let node = RegistryStore::get(&**client, &spec.target)
            .await?
            .ok_or_else(|| InitError::UnknownNode(spec.target.clone()))?;
        if node.init_state != InitState::Uninitialized {
            return Err(InitError::WrongState {
                node: spec.target.clone(),
                state: node.init_state,
                needed: "uninitialized",
            });
        }

        let operation_id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        RegistryStore::set_init_state(
            &**client,
            &spec.target,
            InitState::Preparing,
            Some(&spec.source),
        )
        .await?;
        InitProgressStore::create(
            &**client,
            &spec.target,
            i32::from(spec.parallel_workers.unwrap_or(1)),
        )
        .await?;
        drop(client);

        ops.insert(
            spec.target.clone(),
            ActiveInit {
                operation_id: operation_id.clone(),
                source: spec.source.clone(),
                source_conninfo: spec.source_conninfo.clone(),
                slot_name: None,
                subscription: None,
                cancel: cancel.clone(),
            },
        );
        drop(ops);

        let machine = Arc::clone(self);
        let op_id = operation_id.clone();
        let log_target = spec.target.clone();
        let log_source = spec.source.clone();
        let log_method = spec.method;
        tokio::spawn(async move {
            let result = match spec.method {
                InitMethod::Snapshot | InitMethod::Direct => {
                    machine.drive_subscription_init(&spec, &op_id, &cancel).await
                }
                InitMethod::TwoPhase => machine.drive_generation(&spec, &op_id, &cancel).await,
                InitMethod::Manual => {
                    // Manual init is split: PrepareInit on the source,
                    // CompleteInit on the target. StartInit(manual) only
                    // validates and waits for CompleteInit.
                    Ok(())
                }
            };
            machine.finish_driver(&spec.target, &op_id, result, &cancel).await;
        });

        info!(target = %log_target, source = %log_source, method = %log_method, operation = %operation_id, "init started");
        Ok(operation_id)
    }

    /// Source-side half of the manual method: prepares a slot, records it
    /// with an expiry, and hands back its name and consistent-point LSN.
    pub async fn prepare_init(
        &self,
        for_node: &NodeId,
        slot_name: Option<&str>,
    ) -> Result<PreparedSlot, InitError> {
        let client = self.db.get().await?;
        self.check_server_version(&**client).await?;
        SubscriptionManager::ensure_publication(&**client).await?;
        let slot = SlotManager::create(&**client, for_node, slot_name).await?;
        SlotManager::record_init_slot(
            &**client,
            &slot,
            for_node,
            Some(chrono::Utc::now() + chrono::Duration::hours(SLOT_EXPIRY_HOURS)),
        )
        .await?;
        Ok(slot)
    }

    /// Target-side half of the manual method: the external agent has
    /// restored a physical backup; catch up from the recorded slot.
    pub async fn complete_init(
        self: &Arc<Self>,
        target: &NodeId,
        source: &NodeId,
        slot_name: &str,
        schema_sync: SchemaSyncMode,
        source_conninfo: &str,
    ) -> Result<String, InitError> {
        let mut ops = self.ops.lock().await;
        if ops.contains_key(target) {
            return Err(InitError::AlreadyInFlight(target.clone()));
        }

        let client = self.db.get().await?;
        self.ensure_source_registered(&**client, source, source_conninfo)
            .await?;
        RegistryStore::set_init_state(&**client, target, InitState::Preparing, Some(source)).await?;
        InitProgressStore::create(&**client, target, 1).await?;
        drop(client);

        let operation_id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        ops.insert(
            target.clone(),
            ActiveInit {
                operation_id: operation_id.clone(),
                source: source.clone(),
                source_conninfo: source_conninfo.to_string(),
                slot_name: Some(slot_name.to_string()),
                subscription: None,
                cancel: cancel.clone(),
            },
        );
        drop(ops);

        let machine = Arc::clone(self);
        let spec = StartInitSpec {
            target: target.clone(),
            source: source.clone(),
            method: InitMethod::Manual,
            schema_sync,
            source_conninfo: source_conninfo.to_string(),
            snapshot_dir: None,
            codec: CompressionCodec::None,
            parallel_workers: None,
        };
        let slot_name = slot_name.to_string();
        let op_id = operation_id.clone();
        tokio::spawn(async move {
            let result = machine
                .drive_manual_completion(&spec, &slot_name, &op_id, &cancel)
                .await;
            machine.finish_driver(&spec.target, &op_id, result, &cancel).await;
        });
        Ok(operation_id)
    }

    /// Applies a generated snapshot on this node, optionally catching up
    /// against the snapshot's source afterwards. A distinct
    /// Uninitialized→…→Synchronized chain per the two-phase method.
    pub async fn apply_snapshot_init(
        self: &Arc<Self>,
        target: &NodeId,
        snapshot_dir: PathBuf,
        verify_checksums: bool,
        catchup_source: Option<(NodeId, String)>,
    ) -> Result<String, InitError> {
        let mut ops = self.ops.lock().await;
        if ops.contains_key(target) {
            return Err(InitError::AlreadyInFlight(target.clone()));
        }
        let client = self.db.get().await?;
        let source_for_state = catchup_source.as_ref().map(|(node, _)| node.clone());
        RegistryStore::set_init_state(
            &**client,
            target,
            InitState::Preparing,
            source_for_state.as_ref(),
        )
        .await?;
        InitProgressStore::create(&**client, target, 1).await?;
        drop(client);

        let operation_id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        ops.insert(
            target.clone(),
            ActiveInit {
                operation_id: operation_id.clone(),
                source: source_for_state.clone().unwrap_or_else(|| target.clone()),
                source_conninfo: catchup_source
                    .as_ref()
                    .map(|(_, c)| c.clone())
                    .unwrap_or_default(),
                slot_name: None,
                subscription: None,
                cancel: cancel.clone(),
            },
        );
        drop(ops);

        let machine = Arc::clone(self);
        let target = target.clone();
        let op_id = operation_id.clone();
        tokio::spawn(async move {
            let result = machine
                .drive_apply(&target, snapshot_dir, verify_checksums, catchup_source, &cancel)
                .await;
            machine.finish_driver(&target, &op_id, result, &cancel).await;
        });
        Ok(operation_id)
    }

    /// Cancels an in-flight init and restores the pre-init state: no
    /// subscription on the target, no slot on the source, no partial
    /// rows, InitState back to Uninitialized.
    pub async fn cancel_init(&self, target: &NodeId) -> Result<(), InitError> {
        let mut ops = self.ops.lock().await;
        let Some(op) = ops.remove(target) else {
            return Err(InitError::NoActiveInit(target.clone()));
        };
        op.cancel.cancel();

        let client = self.db.get().await?;
        let subscription = op
            .subscription
            .clone()
            .unwrap_or_else(|| subscription_name(&op.source));
        if let Err(e) = SubscriptionManager::drop_if_exists(&**client, &subscription).await {
            warn!(subscription = %subscription, error = %e, "cancel: subscription drop failed");
        }

        // The slot lives on the source; drop it only if this init made it.
        if let Some(slot_name) = &op.slot_name {
            match connect_with_retry(&op.source_conninfo).await {
                Ok(source) => {
                    if let Err(e) = SlotManager::drop_if_exists(&source, slot_name).await {
                        warn!(slot = %slot_name, error = %e, "cancel: slot drop failed");
                    }
                    if let Err(e) = SlotManager::forget_init_slot(&source, slot_name).await {
                        warn!(slot = %slot_name, error = %e, "cancel: slot record cleanup failed");
                    }
                }
                Err(e) => warn!(error = %e, "cancel: source unreachable for slot cleanup"),
            }
        }

        truncate_user_tables(&**client).await?;
        RegistryStore::set_init_state(&**client, target, InitState::Uninitialized, None).await?;
        InitProgressStore::delete(&**client, target).await?;
        self.fabric.reap(&op.operation_id);

        let update = ProgressUpdate::starting(
            OperationKind::Init,
            op.operation_id.clone(),
            target.clone(),
        )
        .failed("cancelled by operator");
        self.fabric.publish(update);
        info!(target = %target, operation = %op.operation_id, "init cancelled and state restored");
        Ok(())
    }

    /// Reinitializes a node. `Full` resets to Uninitialized; the partial
    /// scopes re-copy a table subset and leave the state Synchronized.
    pub async fn start_reinit(
        &self,
        target: &NodeId,
        scope: &ReinitScope,
        source_conninfo: &str,
    ) -> Result<String, InitError> {
        let ops = self.ops.lock().await;
        if ops.contains_key(target) {
            return Err(InitError::AlreadyInFlight(target.clone()));
        }
        drop(ops);

        let client = self.db.get().await?;
        let node = RegistryStore::get(&**client, target)
            .await?
            .ok_or_else(|| InitError::UnknownNode(target.clone()))?;
        let operation_id = uuid::Uuid::new_v4().to_string();

        match scope {
            ReinitScope::Full => {
                if !node.init_state.is_terminal() {
                    return Err(InitError::WrongState {
                        node: target.clone(),
                        state: node.init_state,
                        needed: "synchronized or failed",
                    });
                }
                RegistryStore::set_init_state(&**client, target, InitState::Reinitializing, None)
                    .await?;
                let subscription = node
                    .init_source_node
                    .as_ref()
                    .map(subscription_name)
                    .unwrap_or_default();
                if !subscription.is_empty() {
                    if let Err(e) =
                        SubscriptionManager::drop_if_exists(&**client, &subscription).await
                    {
                        warn!(subscription = %subscription, error = %e, "reinit: subscription drop failed");
                    }
                }
                if !source_conninfo.is_empty() {
                    if let Ok(source) = connect_with_retry(source_conninfo).await {
                        let slot = target.init_slot_name();
                        let _ = SlotManager::drop_if_exists(&source, &slot).await;
                        let _ = SlotManager::forget_init_slot(&source, &slot).await;
                    }
                }
                truncate_user_tables(&**client).await?;
                InitProgressStore::delete(&**client, target).await?;
                RegistryStore::set_init_state(&**client, target, InitState::Uninitialized, None)
                    .await?;
                info!(target = %target, "full reinit: node reset to uninitialized");
            }
            ReinitScope::Tables { tables } => {
                self.partial_reinit(&node, tables, source_conninfo).await?;
            }
            ReinitScope::Schema { schema } => {
                let rows = client
                    .query(
                        "SELECT table_schema || '.' || table_name
                         FROM information_schema.tables
                         WHERE table_type = 'BASE TABLE' AND table_schema = $1",
                        &[schema],
                    )
                    .await
                    .map_err(steep_db::DbError::from)?;
                let tables: Vec<String> = rows.iter().map(|r| r.get(0)).collect();
                self.partial_reinit(&node, &tables, source_conninfo).await?;
            }
        }
        Ok(operation_id)
    }

    /// Latest progress for a node: in-memory first, durable row second.
    pub async fn get_progress(&self, node: &NodeId) -> Result<Option<ProgressUpdate>, InitError> {
        if let Some(update) = self.fabric.latest_for_node(node) {
            return Ok(Some(update));
        }
        let client = self.db.get().await?;
        let row = client
            .query_opt(
                "SELECT * FROM steep_repl.init_progress WHERE node_id = $1",
                &[&node.as_str()],
            )
            .await
            .map_err(steep_db::DbError::from)?;
        Ok(row.map(|row| {
            let phase_raw: String = row.get("phase");
            let mut update = ProgressUpdate::starting(
                OperationKind::Init,
                format!("init-{}", node.as_str()),
                node.clone(),
            );
            update.phase = match phase_raw.as_str() {
                "copying" => ProgressPhase::Copying,
                "catching_up" => ProgressPhase::CatchingUp,
                "generation" => ProgressPhase::Generation,
                "application" => ProgressPhase::Application,
                "complete" => ProgressPhase::Complete,
                "failed" => ProgressPhase::Failed,
                _ => ProgressPhase::Preparing,
            };
            update.overall_percent = row.get("overall_percent");
            update.tables_total = row.get("tables_total");
            update.tables_completed = row.get("tables_completed");
            update.current_table = row.get("current_table");
            update.rows_copied = row.get::<_, Option<i64>>("rows_copied").unwrap_or(0);
            update.bytes_copied = row.get::<_, Option<i64>>("bytes_copied").unwrap_or(0);
            update.error_message = row.get("error_message");
            update
        }))
    }

    // ------------------------------------------------------------------
    // Drivers
    // ------------------------------------------------------------------

    async fn drive_subscription_init(
        self: &Arc<Self>,
        spec: &StartInitSpec,
        operation_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), InitError> {
        let source = connect_with_retry(&spec.source_conninfo).await?;
        let target = self.db.get().await?;
        self.check_server_version(&**target).await?;
        self.check_server_version(&source).await?;

        self.schema_gate(&**target, &source, spec.schema_sync).await?;

        SubscriptionManager::ensure_publication(&source).await?;
        let slot = SlotManager::create(&source, &spec.target, None).await?;
        self.note_resources(&spec.target, Some(slot.slot_name.clone()), None)
            .await;

        let subscription = SubscriptionManager::create(
            &**target,
            &spec.source,
            &spec.source_conninfo,
            &slot.slot_name,
            OriginPolicy::CopyData,
        )
        .await;
        let subscription = match subscription {
            Ok(name) => name,
            Err(e) => {
                // Compensation: the slot this call prepared must not leak.
                let _ = SlotManager::drop_if_exists(&source, &slot.slot_name).await;
                return Err(e.into());
            }
        };
        self.note_resources(&spec.target, None, Some(subscription.clone()))
            .await;

        RegistryStore::set_init_state(&**target, &spec.target, InitState::Copying, None).await?;
        drop(target);

        self.monitor_copy_and_catchup(spec, operation_id, &subscription, slot.lsn, &source, cancel)
            .await
    }

    async fn drive_manual_completion(
        self: &Arc<Self>,
        spec: &StartInitSpec,
        slot_name: &str,
        operation_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), InitError> {
        let source = connect_with_retry(&spec.source_conninfo).await?;
        let target = self.db.get().await?;
        self.check_server_version(&**target).await?;
        self.schema_gate(&**target, &source, spec.schema_sync).await?;

        // The external agent restored the backup; the recorded slot pins
        // WAL since PrepareInit. Consume it exactly once.
        let slot = SlotManager::consume_init_slot(&source, slot_name, &spec.target).await?;
        let subscription = SubscriptionManager::create(
            &**target,
            &spec.source,
            &spec.source_conninfo,
            &slot.slot_name,
            OriginPolicy::OriginNone,
        )
        .await?;
        self.note_resources(
            &spec.target,
            Some(slot.slot_name.clone()),
            Some(subscription.clone()),
        )
        .await;

        RegistryStore::set_init_state(&**target, &spec.target, InitState::CatchingUp, None).await?;
        drop(target);

        self.monitor_catchup(spec, operation_id, &subscription, slot.lsn, &source, cancel)
            .await
    }

    async fn drive_generation(
        self: &Arc<Self>,
        spec: &StartInitSpec,
        operation_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), InitError> {
        let output_dir = spec
            .snapshot_dir
            .clone()
            .ok_or(InitError::MissingSnapshotDir)?;
        let options = GenerateOptions {
            snapshot_id: operation_id.to_string(),
            source_node: spec.source.clone(),
            output_dir,
            codec: spec.codec,
            parallel_workers: spec.parallel_workers,
        };
        generate_snapshot(&spec.source_conninfo, &options, &self.fabric, cancel).await?;
        // Generation is this chain's whole job; the apply side runs as its
        // own ApplySnapshot chain on the eventual target.
        let client = self.db.get().await?;
        RegistryStore::set_init_state(&**client, &spec.target, InitState::Synchronized, None)
            .await?;
        Ok(())
    }

    async fn drive_apply(
        self: &Arc<Self>,
        target: &NodeId,
        snapshot_dir: PathBuf,
        verify_checksums: bool,
        catchup_source: Option<(NodeId, String)>,
        cancel: &CancellationToken,
    ) -> Result<(), InitError> {
        {
            let client = self.db.get().await?;
            RegistryStore::set_init_state(&**client, target, InitState::Copying, None).await?;
        }
        let options = ApplyOptions {
            snapshot_dir,
            target_node: target.clone(),
            verify_checksums,
        };
        let outcome =
            apply_snapshot(&self.target_conninfo, &options, &self.fabric, cancel).await?;

        if let Some((source_node, source_conninfo)) = catchup_source {
            let client = self.db.get().await?;
            let slot_name = snapshot_slot_name(&outcome.manifest.snapshot_id);
            let subscription = SubscriptionManager::create(
                &**client,
                &source_node,
                &source_conninfo,
                &slot_name,
                OriginPolicy::OriginNone,
            )
            .await?;
            self.note_resources(target, Some(slot_name), Some(subscription.clone()))
                .await;
            RegistryStore::set_init_state(&**client, target, InitState::CatchingUp, None).await?;
            drop(client);

            let source = connect_with_retry(&source_conninfo).await?;
            let spec = StartInitSpec {
                target: target.clone(),
                source: source_node,
                method: InitMethod::TwoPhase,
                schema_sync: SchemaSyncMode::Manual,
                source_conninfo,
                snapshot_dir: None,
                codec: outcome.manifest.codec,
                parallel_workers: None,
            };
            self.monitor_catchup(
                &spec,
                &outcome.manifest.snapshot_id,
                &subscription,
                outcome.manifest.lsn,
                &source,
                cancel,
            )
            .await?;
        } else {
            // Without a catch-up source the applier terminates the chain.
            let client = self.db.get().await?;
            RegistryStore::set_init_state(&**client, target, InitState::Synchronized, None).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Monitoring
    // ------------------------------------------------------------------

    async fn monitor_copy_and_catchup(
        self: &Arc<Self>,
        spec: &StartInitSpec,
        operation_id: &str,
        subscription: &str,
        start_lsn: Lsn,
        source: &tokio_postgres::Client,
        cancel: &CancellationToken,
    ) -> Result<(), InitError> {
        let estimated_total = SubscriptionMonitor::estimated_total_tuples(source).await?;
        let mut throughput = Ewma::default();
        let mut byte_throughput = Ewma::default();
        let mut last_rows = 0i64;
        let mut last_bytes = 0i64;

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Err(InitError::Cancelled),
                () = tokio::time::sleep(MONITOR_TICK) => {}
            }
            let client = self.db.get().await?;
            let progress = SubscriptionMonitor::copy_progress(&**client, subscription).await?;
            let (total, ready) = SubscriptionMonitor::table_sync_state(&**client, subscription).await?;

            let rows_copied: i64 = progress.iter().map(|p| p.tuples_processed).sum();
            let bytes_copied: i64 = progress.iter().map(|p| p.bytes_processed).sum();
            let rate = throughput.observe((rows_copied - last_rows).max(0) as f32);
            byte_throughput.observe((bytes_copied - last_bytes).max(0) as f32);
            last_rows = rows_copied;
            last_bytes = bytes_copied;

            let mut update = ProgressUpdate::starting(
                OperationKind::Init,
                operation_id.to_string(),
                spec.target.clone(),
            );
            update.phase = ProgressPhase::Copying;
            update.tables_total = total as i32;
            update.tables_completed = ready as i32;
            update.rows_copied = rows_copied;
            update.bytes_copied = bytes_copied;
            update.throughput_rows_sec = rate;
            update.current_table = progress
                .first()
                .map(|p| format!("{}.{}", p.schema_name, p.table_name));
            update.overall_percent = if estimated_total > 0 {
                (95.0 * rows_copied as f32 / estimated_total as f32).clamp(0.0, 95.0)
            } else {
                95.0 * ready as f32 / (total.max(1)) as f32
            };
            update.eta_seconds = throughput.eta_seconds((estimated_total - rows_copied).max(0) as f32);
            InitProgressStore::record(&**client, &update).await?;
            self.fabric.publish(update);

            // All tables READY: the bulk copy is done, WAL replay remains.
            if total > 0 && ready == total {
                RegistryStore::set_init_state(&**client, &spec.target, InitState::CatchingUp, None)
                    .await?;
                // Smoothed copy throughput seeds the next sync's ETA.
                if let Some(rate) = byte_throughput.value() {
                    RegistryStore::record_sync_throughput(&**client, &spec.target, rate).await?;
                }
                drop(client);
                break;
            }
        }

        self.monitor_catchup(spec, operation_id, subscription, start_lsn, source, cancel)
            .await
    }

    async fn monitor_catchup(
        self: &Arc<Self>,
        spec: &StartInitSpec,
        operation_id: &str,
        subscription: &str,
        start_lsn: Lsn,
        source: &tokio_postgres::Client,
        cancel: &CancellationToken,
    ) -> Result<(), InitError> {
        let mut tracker = CatchupTracker::new(start_lsn);
        loop {
            tokio::select! {
                () = cancel.cancelled() => return Err(InitError::Cancelled),
                () = tokio::time::sleep(MONITOR_TICK) => {}
            }
            let client = self.db.get().await?;
            tracker.observe_source(SubscriptionMonitor::current_wal_lsn(source).await?);
            let received = SubscriptionMonitor::received_lsn(&**client, subscription).await?;

            let mut update = ProgressUpdate::starting(
                OperationKind::Init,
                operation_id.to_string(),
                spec.target.clone(),
            );
            update.phase = ProgressPhase::CatchingUp;
            update.overall_percent = 95.0
                + 0.05 * received.map_or(0.0, |lsn| tracker.percent(lsn)).clamp(0.0, 100.0);
            InitProgressStore::record(&**client, &update).await?;
            self.fabric.publish(update.clone());

            if received.is_some_and(|lsn| tracker.is_synchronized(lsn)) {
                RegistryStore::set_init_state(&**client, &spec.target, InitState::Synchronized, None)
                    .await?;
                let done = update.completed();
                InitProgressStore::record(&**client, &done).await?;
                self.fabric.publish(done);
                info!(target = %spec.target, operation = %operation_id, "init synchronized");
                return Ok(());
            }
        }
    }

    // ------------------------------------------------------------------
    // Shared plumbing
    // ------------------------------------------------------------------

    async fn schema_gate(
        &self,
        target: &impl tokio_postgres::GenericClient,
        source: &tokio_postgres::Client,
        mode: SchemaSyncMode,
    ) -> Result<(), InitError> {
        let local = fetch_table_columns(target, None).await?;
        let remote = fetch_table_columns(source, None).await?;
        let comparison = compare_schemas(&local, &remote);
        let warnings = gate(mode, &comparison)?;
        for warning in warnings {
            warn!(%warning, "schema gate");
        }
        Ok(())
    }

    async fn check_server_version(
        &self,
        client: &impl tokio_postgres::GenericClient,
    ) -> Result<(), InitError> {
        let version = SubscriptionMonitor::server_version_num(client).await?;
        if version < MIN_SERVER_VERSION_NUM {
            return Err(InitError::VersionTooOld { found: version });
        }
        Ok(())
    }

    async fn ensure_source_registered(
        &self,
        client: &impl tokio_postgres::GenericClient,
        source: &NodeId,
        source_conninfo: &str,
    ) -> Result<(), InitError> {
        if RegistryStore::get(client, source).await?.is_some() {
            return Ok(());
        }
        let (host, port) = parse_hostport(source_conninfo);
        RegistryStore::register(client, source, source.as_str(), &host, port, 50).await?;
        Ok(())
    }

    async fn note_resources(
        &self,
        target: &NodeId,
        slot_name: Option<String>,
        subscription: Option<String>,
    ) {
        let mut ops = self.ops.lock().await;
        if let Some(op) = ops.get_mut(target) {
            if slot_name.is_some() {
                op.slot_name = slot_name;
            }
            if subscription.is_some() {
                op.subscription = subscription;
            }
        }
    }

    async fn finish_driver(
        &self,
        target: &NodeId,
        operation_id: &str,
        result: Result<(), InitError>,
        cancel: &CancellationToken,
    ) {
        match result {
            Ok(()) => {
                self.ops.lock().await.remove(target);
            }
            Err(InitError::Cancelled) => {
                // cancel_init already removed the op and restored state.
            }
            Err(e) if cancel.is_cancelled() => {
                warn!(target = %target, error = %e, "driver error during cancellation");
            }
            Err(e) => {
                warn!(target = %target, operation = %operation_id, error = %e, "init failed");
                if let Ok(client) = self.db.get().await {
                    let _ = RegistryStore::set_init_state(&**client, target, InitState::Failed, None)
                        .await;
                    let failed = ProgressUpdate::starting(
                        OperationKind::Init,
                        operation_id.to_string(),
                        target.clone(),
                    )
                    .failed(e.to_string());
                    let _ = InitProgressStore::record(&**client, &failed).await;
                    self.fabric.publish(failed);
                }
                self.ops.lock().await.remove(target);
            }
        }
    }

    async fn partial_reinit(
        &self,
        node: &steep_registry::Node,
        tables: &[String],
        source_conninfo: &str,
    ) -> Result<(), InitError> {
        if node.init_state != InitState::Synchronized {
            return Err(InitError::WrongState {
                node: node.node_id.clone(),
                state: node.init_state,
                needed: "synchronized",
            });
        }
        let source_node = node
            .init_source_node
            .clone()
            .ok_or_else(|| InitError::UnknownNode(node.node_id.clone()))?;
        let source = connect_with_retry(source_conninfo).await?;
        let client = self.db.get().await?;
        SubscriptionManager::refresh_tables(
            &source,
            &**client,
            &subscription_name(&source_node),
            tables,
        )
        .await?;
        info!(target = %node.node_id, tables = tables.len(), "partial reinit refreshed");
        Ok(())
    }
}

async fn truncate_user_tables(
    client: &impl tokio_postgres::GenericClient,
) -> Result<(), InitError> {
    let rows = client
        .query(
            "SELECT format('%I.%I', table_schema, table_name)
             FROM information_schema.tables
             WHERE table_type = 'BASE TABLE'
               AND table_schema NOT IN ('pg_catalog', 'information_schema', 'steep_repl')",
            &[],
        )
        .await
        .map_err(steep_db::DbError::from)?;
    let tables: Vec<String> = rows.iter().map(|r| r.get(0)).collect();
    if tables.is_empty() {
        return Ok(());
    }
    client
        .batch_execute(&format!("TRUNCATE {} CASCADE", tables.join(", ")))
        .await
        .map_err(steep_db::DbError::from)?;
    Ok(())
}

fn parse_hostport(conninfo: &str) -> (String, u16) {
    let mut host = "localhost".to_string();
    let mut port = 5432u16;
    for part in conninfo.split_whitespace() {
        if let Some(value) = part.strip_prefix("host=") {
            host = value.to_string();
        } else if let Some(value) = part.strip_prefix("port=") {
            port = value.parse().unwrap_or(5432);
        }
    }
    (host, port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostport_parsing() {
        assert_eq!(
            parse_hostport("host=db-a port=5433 dbname=app user=steep"),
            ("db-a".to_string(), 5433)
        );
        assert_eq!(parse_hostport("dbname=app"), ("localhost".to_string(), 5432));
    }
}
