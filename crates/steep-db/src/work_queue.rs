//! Durable work queue for asynchronous operations.
//!
//! Snapshot generation, snapshot application, and merges run as queued
//! work so a crashed daemon leaves an inspectable record. Claims use
//! `FOR UPDATE SKIP LOCKED` so concurrent dispatchers never double-claim.

use chrono::{DateTime, Utc};
use tokio_postgres::GenericClient;

use steep_types::{WorkOperation, WorkStatus};

use crate::{DbError, Notifier, WORK_CHANNEL};

/// One durable asynchronous operation.
#[derive(Debug, Clone)]
pub struct WorkQueueEntry {
    pub id: i64,
    pub operation_type: WorkOperation,
    pub operation_id: String,
    pub status: WorkStatus,
    pub params: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl WorkQueueEntry {
    fn from_row(row: &tokio_postgres::Row) -> Result<Self, DbError> {
        let operation_raw: String = row.get("operation_type");
        let status_raw: String = row.get("status");
        let operation_type =
            WorkOperation::parse(&operation_raw).ok_or_else(|| DbError::MalformedRow {
                table: "work_queue",
                detail: format!("unknown operation_type {operation_raw:?}"),
            })?;
        let status = WorkStatus::parse(&status_raw).ok_or_else(|| DbError::MalformedRow {
            table: "work_queue",
            detail: format!("unknown status {status_raw:?}"),
        })?;
        Ok(Self {
            id: row.get("id"),
            operation_type,
            operation_id: row.get("operation_id"),
            status,
            params: row.get("params"),
            created_at: row.get("created_at"),
            started_at: row.get("started_at"),
            finished_at: row.get("finished_at"),
            error_message: row.get("error_message"),
        })
    }
}

/// SQL-backed store over `steep_repl.work_queue`.
pub struct WorkQueueStore;

impl WorkQueueStore {
    /// Enqueues a pending entry and wakes the dispatcher.
    pub async fn enqueue<C: GenericClient>(
        client: &C,
        operation_type: WorkOperation,
        operation_id: &str,
        params: &serde_json::Value,
    ) -> Result<WorkQueueEntry, DbError> {
        let row = client
            .query_one(
                "INSERT INTO steep_repl.work_queue (operation_type, operation_id, params)
                 VALUES ($1, $2, $3)
                 RETURNING *",
                &[&operation_type.as_str(), &operation_id, params],
            )
            .await?;
        let entry = WorkQueueEntry::from_row(&row)?;
        Notifier::notify(client, WORK_CHANNEL, "new_work").await?;
        Ok(entry)
    }

    /// Claims the oldest pending entry, if any, marking it running.
    pub async fn claim<C: GenericClient>(client: &C) -> Result<Option<WorkQueueEntry>, DbError> {
        let row = client
            .query_opt(
                "UPDATE steep_repl.work_queue
                 SET status = 'running', started_at = now()
                 WHERE id = (
                     SELECT id FROM steep_repl.work_queue
                     WHERE status = 'pending'
                     ORDER BY id
                     FOR UPDATE SKIP LOCKED
                     LIMIT 1
                 )
                 RETURNING *",
                &[],
            )
            .await?;
        row.as_ref().map(WorkQueueEntry::from_row).transpose()
    }

    /// Marks an entry terminal.
    pub async fn finish<C: GenericClient>(
        client: &C,
        id: i64,
        status: WorkStatus,
        error_message: Option<&str>,
    ) -> Result<(), DbError> {
        debug_assert!(matches!(
            status,
            WorkStatus::Completed | WorkStatus::Failed | WorkStatus::Cancelled
        ));
        let updated = client
            .execute(
                "UPDATE steep_repl.work_queue
                 SET status = $2, finished_at = now(), error_message = $3
                 WHERE id = $1",
                &[&id, &status.as_str(), &error_message],
            )
            .await?;
        if updated == 0 {
            return Err(DbError::WorkEntryNotFound(id));
        }
        Ok(())
    }

    /// Looks an entry up by its public operation id.
    pub async fn find<C: GenericClient>(
        client: &C,
        operation_id: &str,
    ) -> Result<Option<WorkQueueEntry>, DbError> {
        let row = client
            .query_opt(
                "SELECT * FROM steep_repl.work_queue WHERE operation_id = $1",
                &[&operation_id],
            )
            .await?;
        row.as_ref().map(WorkQueueEntry::from_row).transpose()
    }

    /// Marks every running entry failed. Called once on daemon start:
    /// a running entry with no live operation means the daemon died mid-run.
    pub async fn fail_orphans<C: GenericClient>(client: &C) -> Result<u64, DbError> {
        Ok(client
            .execute(
                "UPDATE steep_repl.work_queue
                 SET status = 'failed', finished_at = now(),
                     error_message = 'daemon restarted during operation'
                 WHERE status = 'running'",
                &[],
            )
            .await?)
    }
}
