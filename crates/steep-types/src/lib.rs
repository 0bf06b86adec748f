//! # steep-types: Core types for steep-repl
//!
//! This crate contains shared types used across the steep-repl control plane:
//! - Identity types ([`NodeId`], [`Lsn`])
//! - Node lifecycle ([`NodeStatus`], [`InitState`], [`InitMethod`], [`ReinitScope`])
//! - Replication policy ([`OriginPolicy`], [`SchemaSyncMode`], [`ConflictStrategy`])
//! - Snapshot metadata ([`CompressionCodec`])
//! - Progress reporting ([`ProgressUpdate`], [`ProgressPhase`], [`OperationKind`])
//! - Work queue ([`WorkStatus`], [`WorkOperation`])
//! - The RPC status taxonomy ([`ErrorKind`])

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ============================================================================
// Node identity
// ============================================================================

/// Stable identifier of a participating database node.
///
/// Node ids are operator-chosen strings (UUID format recommended). They key
/// the registry and are embedded, sanitized, into replication slot names.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derives the init replication slot name for this node.
    ///
    /// Slot names follow `steep_init_<sanitized>`: the node id is lowercased,
    /// every character outside `[a-z0-9_]` becomes `_`, and the result is
    /// truncated to PostgreSQL's 63-byte identifier limit.
    ///
    /// # Examples
    ///
    /// ```
    /// # use steep_types::NodeId;
    /// let node = NodeId::new("Node-West.1");
    /// assert_eq!(node.init_slot_name(), "steep_init_node_west_1");
    /// ```
    pub fn init_slot_name(&self) -> String {
        let sanitized: String = self
            .0
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
        let mut name = format!("steep_init_{sanitized}");
        name.truncate(63);
        name
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ============================================================================
// LSN - PostgreSQL log sequence number
// ============================================================================

/// A PostgreSQL log sequence number: a monotonic 64-bit WAL position.
///
/// Rendered in PostgreSQL's `XXX/XXX` split-hex form (`pg_lsn` text format).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Lsn(u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Bytes of WAL between `self` and an earlier position.
    ///
    /// Saturates to zero when `earlier` is actually ahead, which happens when
    /// comparing positions captured on different timelines.
    pub fn delta_from(self, earlier: Lsn) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

/// Error parsing a textual LSN.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed LSN {input:?}: expected hexhi/hexlo")]
pub struct ParseLsnError {
    pub input: String,
}

impl FromStr for Lsn {
    type Err = ParseLsnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseLsnError {
            input: s.to_string(),
        };
        let (hi, lo) = s.split_once('/').ok_or_else(err)?;
        let hi = u64::from_str_radix(hi, 16).map_err(|_| err())?;
        let lo = u64::from_str_radix(lo, 16).map_err(|_| err())?;
        if hi > u64::from(u32::MAX) || lo > u64::from(u32::MAX) {
            return Err(err());
        }
        Ok(Lsn((hi << 32) | lo))
    }
}

// ============================================================================
// Node lifecycle
// ============================================================================

/// Liveness of a registered node, derived from heartbeat recency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Healthy,
    Stale,
    Unreachable,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Healthy => "healthy",
            NodeStatus::Stale => "stale",
            NodeStatus::Unreachable => "unreachable",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "healthy" => Some(NodeStatus::Healthy),
            "stale" => Some(NodeStatus::Stale),
            "unreachable" => Some(NodeStatus::Unreachable),
            _ => None,
        }
    }
}

impl Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Discrete state of a target node's initialization lifecycle.
///
/// Forward-only except for the explicit reinit paths: `Failed` and
/// `Synchronized` may enter `Reinitializing`, which resets to
/// `Uninitialized`. Any state may transition to `Failed` on error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitState {
    Uninitialized,
    Preparing,
    Copying,
    CatchingUp,
    Synchronized,
    Diverged,
    Failed,
    Reinitializing,
}

impl InitState {
    pub fn as_str(self) -> &'static str {
        match self {
            InitState::Uninitialized => "uninitialized",
            InitState::Preparing => "preparing",
            InitState::Copying => "copying",
            InitState::CatchingUp => "catching_up",
            InitState::Synchronized => "synchronized",
            InitState::Diverged => "diverged",
            InitState::Failed => "failed",
            InitState::Reinitializing => "reinitializing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "uninitialized" => Some(InitState::Uninitialized),
            "preparing" => Some(InitState::Preparing),
            "copying" => Some(InitState::Copying),
            "catching_up" => Some(InitState::CatchingUp),
            "synchronized" => Some(InitState::Synchronized),
            "diverged" => Some(InitState::Diverged),
            "failed" => Some(InitState::Failed),
            "reinitializing" => Some(InitState::Reinitializing),
            _ => None,
        }
    }

    /// Terminal states absorb until an explicit reinit or reset.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InitState::Synchronized | InitState::Failed | InitState::Diverged
        )
    }

    /// The legal transition table.
    pub fn can_transition_to(self, next: InitState) -> bool {
        use InitState::{
            CatchingUp, Copying, Diverged, Failed, Preparing, Reinitializing, Synchronized,
            Uninitialized,
        };
        // Error is reachable from every non-terminal state; Failed→Failed is
        // permitted so error recording stays idempotent.
        if next == Failed {
            return !matches!(self, Synchronized | Diverged);
        }
        match (self, next) {
            (Uninitialized, Preparing)
            | (Preparing, Copying)
            | (Preparing, CatchingUp)
            | (Preparing, Synchronized)
            | (Copying, CatchingUp)
            | (CatchingUp, Synchronized)
            | (CatchingUp, Diverged)
            | (Failed, Reinitializing)
            | (Synchronized, Reinitializing)
            | (Reinitializing, Uninitialized) => true,
            _ => false,
        }
    }
}

impl Display for InitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a target node acquires its initial copy of the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitMethod {
    /// Logical snapshot through a subscription with `copy_data = true`.
    Snapshot,
    /// Externally restored physical backup; PrepareInit/CompleteInit split.
    Manual,
    /// Self-produced file snapshot: generate, move, apply.
    TwoPhase,
    /// Like Snapshot, over a caller-supplied side-channel connection string.
    Direct,
}

impl InitMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            InitMethod::Snapshot => "snapshot",
            InitMethod::Manual => "manual",
            InitMethod::TwoPhase => "two_phase",
            InitMethod::Direct => "direct",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "snapshot" => Some(InitMethod::Snapshot),
            "manual" => Some(InitMethod::Manual),
            "two_phase" => Some(InitMethod::TwoPhase),
            "direct" => Some(InitMethod::Direct),
            _ => None,
        }
    }
}

impl Display for InitMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a reinitialization covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum ReinitScope {
    /// Reset state to Uninitialized and start over.
    Full,
    /// Re-copy the named tables; state stays Synchronized.
    Tables { tables: Vec<String> },
    /// Re-copy every table in the named schema; state stays Synchronized.
    Schema { schema: String },
}

// ============================================================================
// Replication policy
// ============================================================================

/// Origin handling for a created subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginPolicy {
    /// Fresh copy: `copy_data = true`, default origin tracking.
    CopyData,
    /// Merge mode: apply every change without origin tracking.
    OriginNone,
    /// Post-merge bidirectional: accept changes from any origin.
    OriginAny,
}

impl OriginPolicy {
    /// Value for the subscription's `origin` option.
    pub fn origin_option(self) -> &'static str {
        match self {
            OriginPolicy::CopyData | OriginPolicy::OriginNone => "none",
            OriginPolicy::OriginAny => "any",
        }
    }

    /// Whether the subscription copies pre-existing table contents.
    pub fn copy_data(self) -> bool {
        matches!(self, OriginPolicy::CopyData)
    }
}

/// Gating behavior for schema comparison before replication starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaSyncMode {
    /// Abort on any blocking difference.
    Strict,
    /// Proceed despite informational differences; abort on blocking ones.
    Auto,
    /// Skip the gate entirely. Always reported as dangerous.
    Manual,
}

impl SchemaSyncMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SchemaSyncMode::Strict => "strict",
            SchemaSyncMode::Auto => "auto",
            SchemaSyncMode::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "strict" => Some(SchemaSyncMode::Strict),
            "auto" => Some(SchemaSyncMode::Auto),
            "manual" => Some(SchemaSyncMode::Manual),
            _ => None,
        }
    }
}

/// Conflict resolution policy applied at merge time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    PreferLocal,
    PreferRemote,
    /// Latest commit timestamp wins. Requires `track_commit_timestamp = on`
    /// on both sides; merge aborts pre-flight when it is absent.
    LastModified,
    /// Record conflicts in the report table; resolve nothing.
    Manual,
}

impl ConflictStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictStrategy::PreferLocal => "prefer_local",
            ConflictStrategy::PreferRemote => "prefer_remote",
            ConflictStrategy::LastModified => "last_modified",
            ConflictStrategy::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "prefer_local" => Some(ConflictStrategy::PreferLocal),
            "prefer_remote" => Some(ConflictStrategy::PreferRemote),
            "last_modified" => Some(ConflictStrategy::LastModified),
            "manual" => Some(ConflictStrategy::Manual),
            _ => None,
        }
    }
}

// ============================================================================
// Snapshot metadata
// ============================================================================

/// Per-snapshot compression codec, applied uniformly to every data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionCodec {
    #[default]
    None,
    Gzip,
    Lz4,
    Zstd,
}

impl CompressionCodec {
    pub fn as_str(self) -> &'static str {
        match self {
            CompressionCodec::None => "none",
            CompressionCodec::Gzip => "gzip",
            CompressionCodec::Lz4 => "lz4",
            CompressionCodec::Zstd => "zstd",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(CompressionCodec::None),
            "gzip" => Some(CompressionCodec::Gzip),
            "lz4" => Some(CompressionCodec::Lz4),
            "zstd" => Some(CompressionCodec::Zstd),
            _ => None,
        }
    }

    /// File name for a table's data file under this codec.
    pub fn data_file_name(self, schema: &str, table: &str) -> String {
        match self {
            CompressionCodec::None => format!("{schema}.{table}.csv"),
            codec => format!("{schema}.{table}.csv.{}", codec.as_str()),
        }
    }
}

impl Display for CompressionCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Progress reporting
// ============================================================================

/// Kind of long-running operation a progress update belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Init,
    SnapshotGenerate,
    SnapshotApply,
    Merge,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Init => "init",
            OperationKind::SnapshotGenerate => "snapshot_generate",
            OperationKind::SnapshotApply => "snapshot_apply",
            OperationKind::Merge => "merge",
        }
    }
}

/// Phase of a long-running operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    Preparing,
    Generation,
    Application,
    Copying,
    CatchingUp,
    Complete,
    Failed,
}

impl ProgressPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ProgressPhase::Preparing => "preparing",
            ProgressPhase::Generation => "generation",
            ProgressPhase::Application => "application",
            ProgressPhase::Copying => "copying",
            ProgressPhase::CatchingUp => "catching_up",
            ProgressPhase::Complete => "complete",
            ProgressPhase::Failed => "failed",
        }
    }

    /// Complete and Failed end the stream for their operation id.
    pub fn is_terminal(self) -> bool {
        matches!(self, ProgressPhase::Complete | ProgressPhase::Failed)
    }
}

impl Display for ProgressPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One progress sample for a long-running operation.
///
/// Produced by pipeline stages, fanned out through the progress bus to RPC
/// streams, the latest-value store, and the database NOTIFY channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub operation: OperationKind,
    pub operation_id: String,
    pub node_id: NodeId,
    pub phase: ProgressPhase,
    pub overall_percent: f32,
    pub tables_total: i32,
    pub tables_completed: i32,
    pub current_table: Option<String>,
    pub current_table_percent: f32,
    pub rows_copied: i64,
    pub bytes_copied: i64,
    pub throughput_rows_sec: f32,
    pub eta_seconds: Option<i32>,
    pub parallel_workers: i32,
    pub error_message: Option<String>,
}

impl ProgressUpdate {
    /// A fresh update at the start of an operation.
    pub fn starting(operation: OperationKind, operation_id: String, node_id: NodeId) -> Self {
        Self {
            operation,
            operation_id,
            node_id,
            phase: ProgressPhase::Preparing,
            overall_percent: 0.0,
            tables_total: 0,
            tables_completed: 0,
            current_table: None,
            current_table_percent: 0.0,
            rows_copied: 0,
            bytes_copied: 0,
            throughput_rows_sec: 0.0,
            eta_seconds: None,
            parallel_workers: 1,
            error_message: None,
        }
    }

    /// Terminal success marker for this operation.
    pub fn completed(mut self) -> Self {
        self.phase = ProgressPhase::Complete;
        self.overall_percent = 100.0;
        self.eta_seconds = Some(0);
        self.error_message = None;
        self
    }

    /// Terminal failure marker carrying the error message.
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.phase = ProgressPhase::Failed;
        self.error_message = Some(error.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}

// ============================================================================
// Work queue
// ============================================================================

/// Status of a durable work queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkStatus::Pending => "pending",
            WorkStatus::Running => "running",
            WorkStatus::Completed => "completed",
            WorkStatus::Failed => "failed",
            WorkStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(WorkStatus::Pending),
            "running" => Some(WorkStatus::Running),
            "completed" => Some(WorkStatus::Completed),
            "failed" => Some(WorkStatus::Failed),
            "cancelled" => Some(WorkStatus::Cancelled),
            _ => None,
        }
    }
}

/// Asynchronous operation types carried by the work queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkOperation {
    SnapshotGenerate,
    SnapshotApply,
    BidirectionalMerge,
}

impl WorkOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkOperation::SnapshotGenerate => "snapshot_generate",
            WorkOperation::SnapshotApply => "snapshot_apply",
            WorkOperation::BidirectionalMerge => "bidirectional_merge",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "snapshot_generate" => Some(WorkOperation::SnapshotGenerate),
            "snapshot_apply" => Some(WorkOperation::SnapshotApply),
            "bidirectional_merge" => Some(WorkOperation::BidirectionalMerge),
            _ => None,
        }
    }
}

// ============================================================================
// Error taxonomy
// ============================================================================

/// The status taxonomy every steep-repl error maps onto at the RPC boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing required field, malformed LSN, unknown method/strategy.
    InvalidArgument,
    /// Unknown node id, no snapshot at path, no operation matching id.
    NotFound,
    /// Concurrent init for the same target, slot name in use.
    AlreadyExists,
    /// Schema mismatch under Strict, missing PK, version too old, quiescing
    /// not achieved, missing `track_commit_timestamp` under LastModified.
    FailedPrecondition,
    /// Peer daemon unreachable, database pool disconnected.
    Unavailable,
    /// Manifest checksum mismatch on apply.
    DataLoss,
    /// Operation cancel requested.
    Canceled,
    /// Everything else.
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::FailedPrecondition => "failed_precondition",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::DataLoss => "data_loss",
            ErrorKind::Canceled => "canceled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test]
    fn slot_name_sanitizes_and_prefixes() {
        assert_eq!(
            NodeId::new("node-a").init_slot_name(),
            "steep_init_node_a"
        );
        assert_eq!(
            NodeId::new("Node.West:1").init_slot_name(),
            "steep_init_node_west_1"
        );
        assert_eq!(NodeId::new("ümlaut").init_slot_name(), "steep_init__mlaut");
    }

    #[test]
    fn slot_name_fits_identifier_limit() {
        let long = NodeId::new("x".repeat(200));
        let slot = long.init_slot_name();
        assert!(slot.len() <= 63);
        assert!(slot.starts_with("steep_init_"));
    }

    #[test]
    fn lsn_parses_pg_text_format() {
        let lsn: Lsn = "0/1A234B00".parse().unwrap();
        assert_eq!(lsn.as_u64(), 0x1A23_4B00);
        assert_eq!(lsn.to_string(), "0/1A234B00");

        let high: Lsn = "16/B374D848".parse().unwrap();
        assert_eq!(high.as_u64(), (0x16 << 32) | 0xB374_D848);
    }

    #[test_case(""; "empty")]
    #[test_case("deadbeef"; "no slash")]
    #[test_case("0/zz"; "bad hex")]
    #[test_case("100000000/0"; "hi overflow")]
    fn lsn_rejects_malformed(input: &str) {
        assert!(input.parse::<Lsn>().is_err());
    }

    #[test]
    fn lsn_ordering_tracks_wal_position() {
        let a: Lsn = "0/1000".parse().unwrap();
        let b: Lsn = "0/2000".parse().unwrap();
        assert!(a < b);
        assert_eq!(b.delta_from(a), 0x1000);
        assert_eq!(a.delta_from(b), 0);
    }

    #[test]
    fn init_state_terminal_set() {
        assert!(InitState::Synchronized.is_terminal());
        assert!(InitState::Failed.is_terminal());
        assert!(InitState::Diverged.is_terminal());
        assert!(!InitState::Copying.is_terminal());
    }

    #[test]
    fn init_state_forward_transitions() {
        assert!(InitState::Uninitialized.can_transition_to(InitState::Preparing));
        assert!(InitState::Preparing.can_transition_to(InitState::Copying));
        assert!(InitState::Copying.can_transition_to(InitState::CatchingUp));
        assert!(InitState::CatchingUp.can_transition_to(InitState::Synchronized));
    }

    #[test]
    fn init_state_failure_reachable_from_non_terminal() {
        for state in [
            InitState::Uninitialized,
            InitState::Preparing,
            InitState::Copying,
            InitState::CatchingUp,
            InitState::Reinitializing,
            InitState::Failed,
        ] {
            assert!(state.can_transition_to(InitState::Failed), "{state}");
        }
        assert!(!InitState::Synchronized.can_transition_to(InitState::Failed));
    }

    #[test]
    fn init_state_reinit_paths_only() {
        assert!(InitState::Failed.can_transition_to(InitState::Reinitializing));
        assert!(InitState::Synchronized.can_transition_to(InitState::Reinitializing));
        assert!(InitState::Reinitializing.can_transition_to(InitState::Uninitialized));

        // No terminal state reaches Copying without passing Reinitializing.
        for terminal in [
            InitState::Synchronized,
            InitState::Failed,
            InitState::Diverged,
        ] {
            assert!(!terminal.can_transition_to(InitState::Copying));
            assert!(!terminal.can_transition_to(InitState::Preparing));
        }
    }

    #[test]
    fn origin_policy_subscription_options() {
        assert!(OriginPolicy::CopyData.copy_data());
        assert!(!OriginPolicy::OriginNone.copy_data());
        assert_eq!(OriginPolicy::OriginNone.origin_option(), "none");
        assert_eq!(OriginPolicy::OriginAny.origin_option(), "any");
    }

    #[test]
    fn codec_file_names() {
        assert_eq!(
            CompressionCodec::None.data_file_name("public", "users"),
            "public.users.csv"
        );
        assert_eq!(
            CompressionCodec::Zstd.data_file_name("public", "users"),
            "public.users.csv.zstd"
        );
    }

    #[test]
    fn progress_terminal_markers() {
        let update = ProgressUpdate::starting(
            OperationKind::Init,
            "op-1".to_string(),
            NodeId::new("node-b"),
        );
        assert!(!update.is_terminal());

        let done = update.clone().completed();
        assert_eq!(done.phase, ProgressPhase::Complete);
        assert!((done.overall_percent - 100.0).abs() < f32::EPSILON);

        let failed = update.failed("copy aborted");
        assert!(failed.is_terminal());
        assert_eq!(failed.error_message.as_deref(), Some("copy aborted"));
    }

    #[test]
    fn reinit_scope_tagged_serialization() {
        let scope = ReinitScope::Tables {
            tables: vec!["public.users".to_string()],
        };
        let json = serde_json::to_string(&scope).unwrap();
        assert!(json.contains(r#""scope":"tables""#));
        let back: ReinitScope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, scope);
    }

    proptest! {
        #[test]
        fn lsn_roundtrips_through_text(value in any::<u64>()) {
            let lsn = Lsn::new(value);
            let parsed: Lsn = lsn.to_string().parse().unwrap();
            prop_assert_eq!(parsed, lsn);
        }

        #[test]
        fn slot_names_always_valid(id in "\\PC{0,80}") {
            let slot = NodeId::new(id).init_slot_name();
            prop_assert!(slot.len() <= 63);
            prop_assert!(slot.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_'));
        }
    }
}
