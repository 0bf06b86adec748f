//! # steep-wire: Framed RPC protocol for steep-repl
//!
//! Every message is a length-prefixed frame: a `u32` big-endian payload
//! length followed by a postcard-encoded body. The same shape is used by
//! operator tools and peer daemons.
//!
//! ```text
//! ┌────────────┬──────────────────────────────┐
//! │ len: u32be │ postcard(Request | Response)  │
//! └────────────┴──────────────────────────────┘
//! ```
//!
//! Requests and responses are discriminated unions; server-streaming calls
//! emit zero or more [`ResponsePayload::Progress`] frames sharing the
//! request id, terminated by a final non-progress payload.

use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use steep_types::{
    CompressionCodec, ConflictStrategy, ErrorKind, InitMethod, InitState, Lsn, NodeId, NodeStatus,
    ProgressUpdate, ReinitScope, SchemaSyncMode,
};

/// Wire protocol version. Bumped on incompatible changes; the handshake
/// rejects mismatches.
pub const PROTOCOL_VERSION: u16 = 1;

/// Size of the frame length prefix.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Upper bound on a single frame body. Progress and control messages are
/// small; manifests are the largest payloads and stay far below this.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

// ============================================================================
// Errors
// ============================================================================

/// Errors produced while encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE}-byte limit")]
    FrameTooLarge(usize),

    #[error("postcard codec error: {0}")]
    Codec(#[from] postcard::Error),
}

/// Status code carried by [`ResponsePayload::Error`]. Mirrors the
/// control-plane error taxonomy one-to-one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    Unavailable,
    DataLoss,
    Canceled,
    Internal,
}

impl From<ErrorKind> for ErrorCode {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::InvalidArgument => ErrorCode::InvalidArgument,
            ErrorKind::NotFound => ErrorCode::NotFound,
            ErrorKind::AlreadyExists => ErrorCode::AlreadyExists,
            ErrorKind::FailedPrecondition => ErrorCode::FailedPrecondition,
            ErrorKind::Unavailable => ErrorCode::Unavailable,
            ErrorKind::DataLoss => ErrorCode::DataLoss,
            ErrorKind::Canceled => ErrorCode::Canceled,
            ErrorKind::Internal => ErrorCode::Internal,
        }
    }
}

impl From<ErrorCode> for ErrorKind {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::InvalidArgument => ErrorKind::InvalidArgument,
            ErrorCode::NotFound => ErrorKind::NotFound,
            ErrorCode::AlreadyExists => ErrorKind::AlreadyExists,
            ErrorCode::FailedPrecondition => ErrorKind::FailedPrecondition,
            ErrorCode::Unavailable => ErrorKind::Unavailable,
            ErrorCode::DataLoss => ErrorKind::DataLoss,
            ErrorCode::Canceled => ErrorKind::Canceled,
            ErrorCode::Internal => ErrorKind::Internal,
        }
    }
}

// ============================================================================
// Shared payload records
// ============================================================================

/// Full node record as exchanged by `SyncNodeMetadata` and `GetNodes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub node_name: String,
    pub host: String,
    pub port: u16,
    pub priority: i32,
    pub is_coordinator: bool,
    pub status: NodeStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub init_state: InitState,
    pub init_source_node: Option<NodeId>,
    pub init_started_at: Option<DateTime<Utc>>,
    pub init_completed_at: Option<DateTime<Utc>>,
}

/// Options accepted by `StartInit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitOptions {
    pub schema_sync: SchemaSyncMode,
    /// Side-channel PostgreSQL connection string for `InitMethod::Direct`.
    pub direct_conninfo: Option<String>,
    /// Output directory for `InitMethod::TwoPhase` generation.
    pub snapshot_dir: Option<String>,
    pub codec: CompressionCodec,
    pub parallel_workers: Option<u8>,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            schema_sync: SchemaSyncMode::Strict,
            direct_conninfo: None,
            snapshot_dir: None,
            codec: CompressionCodec::None,
            parallel_workers: None,
        }
    }
}

/// Per-table verdict from a fingerprint comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FingerprintVerdict {
    Match,
    Mismatch,
    LocalOnly,
    RemoteOnly,
}

/// One differing column from a mismatched table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDiffEntry {
    pub column_name: String,
    /// `type_change`, `nullable_change`, `missing_local`, `missing_remote`,
    /// or `default_change`.
    pub difference: String,
    /// Blocking differences gate replication; informational ones do not.
    pub blocking: bool,
    pub local_definition: Option<String>,
    pub remote_definition: Option<String>,
}

/// Per-table entry in a schema comparison report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableComparison {
    pub schema_name: String,
    pub table_name: String,
    pub verdict: FingerprintVerdict,
    pub local_fingerprint: Option<String>,
    pub remote_fingerprint: Option<String>,
    pub column_diffs: Vec<ColumnDiffEntry>,
}

/// High-level result of `CompareSchemas`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaComparisonReport {
    pub matches: u32,
    pub mismatches: u32,
    pub local_only: u32,
    pub remote_only: u32,
    /// Set when any column diff is type/nullable/presence.
    pub blocking: bool,
    pub tables: Vec<TableComparison>,
}

/// Stored fingerprint returned by `GetSchemaFingerprints`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub schema_name: String,
    pub table_name: String,
    pub fingerprint: String,
    pub column_count: u32,
    pub captured_at: DateTime<Utc>,
}

// ============================================================================
// Requests
// ============================================================================

/// Unique-per-connection request identifier, echoed by every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

/// A framed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub payload: RequestPayload,
}

impl Request {
    pub fn new(id: RequestId, payload: RequestPayload) -> Self {
        Self { id, payload }
    }
}

/// Every operation the daemon exposes over RPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestPayload {
    /// First exchange on a connection; rejects protocol mismatches.
    Handshake { protocol_version: u16 },

    // Coordinator surface
    HealthCheck,
    RegisterNode {
        node_id: NodeId,
        node_name: String,
        host: String,
        port: u16,
        priority: i32,
    },
    GetNodes {
        status_filter: Option<NodeStatus>,
    },
    Heartbeat {
        node_id: NodeId,
        pg_connected: bool,
        pg_version: Option<String>,
    },
    SyncNodeMetadata {
        node: NodeRecord,
    },

    // Init surface
    StartInit {
        target: NodeId,
        source: NodeId,
        method: InitMethod,
        options: InitOptions,
    },
    CancelInit {
        node_id: NodeId,
    },
    PrepareInit {
        node_id: NodeId,
        slot_name: Option<String>,
    },
    CompleteInit {
        target: NodeId,
        source: NodeId,
        slot_name: String,
        lsn: Lsn,
        schema_sync: SchemaSyncMode,
    },
    StartReinit {
        node_id: NodeId,
        scope: ReinitScope,
    },
    GetProgress {
        node_id: NodeId,
    },
    /// Server-streaming: progress frames until the operation terminates.
    StreamProgress {
        operation_id: Option<String>,
        node_id: Option<NodeId>,
    },

    // Schema surface
    CompareSchemas {
        local: NodeId,
        remote: NodeId,
        mode: SchemaSyncMode,
    },
    GetColumnDiff {
        peer: NodeId,
        schema_name: String,
        table_name: String,
    },
    CaptureFingerprints {
        node_id: NodeId,
        schemas: Option<Vec<String>>,
    },
    GetSchemaFingerprints {
        node_id: NodeId,
    },

    // Merge & snapshot surface
    StartBidirectionalMerge {
        local: NodeId,
        peer: NodeId,
        strategy: ConflictStrategy,
        dry_run: bool,
        quiesce_timeout_ms: u64,
    },
    /// Server-streaming.
    GenerateSnapshot {
        source: NodeId,
        output_dir: String,
        codec: CompressionCodec,
        parallel_workers: Option<u8>,
    },
    /// Server-streaming.
    ApplySnapshot {
        target: NodeId,
        snapshot_dir: String,
        verify_checksums: bool,
        /// When set, the target catches up against this source from the
        /// manifest LSN after the files load.
        source_node: Option<NodeId>,
    },
}

// ============================================================================
// Responses
// ============================================================================

/// A framed response. `id` echoes the request that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: RequestId,
    pub payload: ResponsePayload,
}

impl Response {
    pub fn new(id: RequestId, payload: ResponsePayload) -> Self {
        Self { id, payload }
    }

    pub fn error(id: RequestId, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            id,
            payload: ResponsePayload::Error {
                code,
                message: message.into(),
            },
        }
    }
}

/// Result payloads, one variant per request family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponsePayload {
    HandshakeAck {
        protocol_version: u16,
        node_id: NodeId,
    },

    Health {
        status: String,
        pg_connected: bool,
        pg_version: Option<String>,
        active_operations: u32,
    },
    NodeRegistered(NodeRecord),
    Nodes(Vec<NodeRecord>),
    HeartbeatAck {
        coordinator: Option<NodeId>,
    },
    MetadataSynced,

    InitStarted {
        operation_id: String,
    },
    InitCancelled,
    SlotPrepared {
        slot_name: String,
        lsn: Lsn,
    },
    InitCompleted {
        operation_id: String,
    },
    ReinitStarted {
        operation_id: String,
    },
    /// Latest-value snapshot; `None` once the operation has been reaped.
    ProgressSnapshot(Option<ProgressUpdate>),
    /// One streaming progress frame.
    Progress(ProgressUpdate),
    /// Terminates a `StreamProgress` subscription.
    StreamEnd,

    SchemaComparison(SchemaComparisonReport),
    ColumnDiff(Vec<ColumnDiffEntry>),
    FingerprintsCaptured {
        tables: u32,
    },
    Fingerprints(Vec<FingerprintRecord>),

    MergeStarted {
        operation_id: String,
    },
    SnapshotGenerated {
        snapshot_id: String,
        lsn: Lsn,
        tables: u32,
        bytes: u64,
    },
    SnapshotApplied {
        snapshot_id: String,
        rows: u64,
    },

    Error {
        code: ErrorCode,
        message: String,
    },
}

// ============================================================================
// Frame codec
// ============================================================================

/// Appends one framed message to `buf`.
pub fn encode_frame<T: Serialize>(message: &T, buf: &mut BytesMut) -> Result<(), WireError> {
    let body = postcard::to_allocvec(message)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(body.len()));
    }
    buf.reserve(FRAME_HEADER_SIZE + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(())
}

/// Attempts to decode one framed message from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame;
/// the caller reads more bytes and retries. Consumed bytes are advanced
/// only on a successful decode.
pub fn decode_frame<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, WireError> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(len));
    }
    if buf.len() < FRAME_HEADER_SIZE + len {
        return Ok(None);
    }
    buf.advance(FRAME_HEADER_SIZE);
    let body = buf.split_to(len);
    let message = postcard::from_bytes(&body)?;
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use steep_types::{OperationKind, ProgressPhase};

    fn roundtrip_request(payload: RequestPayload) -> Request {
        let request = Request::new(RequestId(7), payload);
        let mut buf = BytesMut::new();
        encode_frame(&request, &mut buf).unwrap();
        decode_frame::<Request>(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn request_roundtrips() {
        let decoded = roundtrip_request(RequestPayload::StartInit {
            target: NodeId::new("node-b"),
            source: NodeId::new("node-a"),
            method: InitMethod::Snapshot,
            options: InitOptions::default(),
        });
        assert_eq!(decoded.id, RequestId(7));
        match decoded.payload {
            RequestPayload::StartInit { target, method, .. } => {
                assert_eq!(target.as_str(), "node-b");
                assert_eq!(method, InitMethod::Snapshot);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn response_roundtrips_progress() {
        let mut update = ProgressUpdate::starting(
            OperationKind::SnapshotGenerate,
            "snap-1".to_string(),
            NodeId::new("node-a"),
        );
        update.phase = ProgressPhase::Generation;
        update.overall_percent = 42.5;

        let response = Response::new(RequestId(3), ResponsePayload::Progress(update.clone()));
        let mut buf = BytesMut::new();
        encode_frame(&response, &mut buf).unwrap();
        let decoded: Response = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.payload, ResponsePayload::Progress(update));
    }

    #[test]
    fn partial_frame_returns_none() {
        let response = Response::error(RequestId(1), ErrorCode::NotFound, "no such node");
        let mut full = BytesMut::new();
        encode_frame(&response, &mut full).unwrap();

        // Feed the frame one byte at a time; decode only succeeds at the end.
        let mut partial = BytesMut::new();
        let bytes = full.freeze();
        for (i, byte) in bytes.iter().enumerate() {
            partial.put_u8(*byte);
            let result = decode_frame::<Response>(&mut partial).unwrap();
            if i + 1 < bytes.len() {
                assert!(result.is_none(), "decoded early at byte {i}");
            } else {
                assert_eq!(result.unwrap(), response);
            }
        }
    }

    #[test]
    fn oversized_length_prefix_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buf.put_slice(&[0u8; 16]);
        assert!(matches!(
            decode_frame::<Response>(&mut buf),
            Err(WireError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn consecutive_frames_decode_in_order(){
        let mut buf = BytesMut::new();
        for i in 0..4u64 {
            let r = Request::new(RequestId(i), RequestPayload::HealthCheck);
            encode_frame(&r, &mut buf).unwrap();
        }
        for i in 0..4u64 {
            let decoded: Request = decode_frame(&mut buf).unwrap().unwrap();
            assert_eq!(decoded.id, RequestId(i));
        }
        assert!(decode_frame::<Request>(&mut buf).unwrap().is_none());
    }

    #[test]
    fn error_code_maps_kind_bijectively() {
        for kind in [
            ErrorKind::InvalidArgument,
            ErrorKind::NotFound,
            ErrorKind::AlreadyExists,
            ErrorKind::FailedPrecondition,
            ErrorKind::Unavailable,
            ErrorKind::DataLoss,
            ErrorKind::Canceled,
            ErrorKind::Internal,
        ] {
            assert_eq!(ErrorKind::from(ErrorCode::from(kind)), kind);
        }
    }

    proptest! {
        #[test]
        fn heartbeat_roundtrips(id in any::<u64>(), connected in any::<bool>(), version in proptest::option::of("[0-9]{2}\\.[0-9]")) {
            let request = Request::new(
                RequestId(id),
                RequestPayload::Heartbeat {
                    node_id: NodeId::new("node-prop"),
                    pg_connected: connected,
                    pg_version: version,
                },
            );
            let mut buf = BytesMut::new();
            encode_frame(&request, &mut buf).unwrap();
            let decoded: Request = decode_frame(&mut buf).unwrap().unwrap();
            prop_assert_eq!(decoded, request);
        }
    }
}
