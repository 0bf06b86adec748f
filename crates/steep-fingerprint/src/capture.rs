//! Fingerprint capture against the local catalog.

use chrono::{DateTime, Utc};
use tokio_postgres::GenericClient;
use tracing::debug;

use crate::{ColumnDefinition, FingerprintError, fingerprint};

/// Schemas never fingerprinted: system catalogs and our own control schema.
const SYSTEM_SCHEMAS: [&str; 3] = ["pg_catalog", "information_schema", "steep_repl"];

/// A stored fingerprint row.
#[derive(Debug, Clone)]
pub struct StoredFingerprint {
    pub table_schema: String,
    pub table_name: String,
    pub fingerprint: String,
    pub columns: Vec<ColumnDefinition>,
    pub captured_at: DateTime<Utc>,
}

/// Reads the ordered column definitions of every user table, optionally
/// restricted to the named schemas.
pub async fn fetch_table_columns<C: GenericClient>(
    client: &C,
    schemas: Option<&[String]>,
) -> Result<Vec<(String, String, Vec<ColumnDefinition>)>, FingerprintError> {
    let rows = client
        .query(
            "SELECT c.table_schema, c.table_name, c.column_name, c.data_type,
                    c.column_default, c.is_nullable = 'YES' AS nullable,
                    c.ordinal_position::int4 AS position
             FROM information_schema.columns c
             JOIN information_schema.tables t
               ON t.table_schema = c.table_schema AND t.table_name = c.table_name
             WHERE t.table_type = 'BASE TABLE'
               AND c.table_schema <> ALL($1)
               AND ($2::text[] IS NULL OR c.table_schema = ANY($2))
             ORDER BY c.table_schema, c.table_name, c.ordinal_position",
            &[&SYSTEM_SCHEMAS.as_slice(), &schemas],
        )
        .await?;

    let mut tables: Vec<(String, String, Vec<ColumnDefinition>)> = Vec::new();
    for row in rows {
        let schema: String = row.get("table_schema");
        let table: String = row.get("table_name");
        let column = ColumnDefinition {
            name: row.get("column_name"),
            data_type: row.get("data_type"),
            default_value: row.get("column_default"),
            nullable: row.get("nullable"),
            position: row.get("position"),
        };
        match tables.last_mut() {
            Some((s, t, columns)) if *s == schema && *t == table => columns.push(column),
            _ => tables.push((schema, table, vec![column])),
        }
    }
    Ok(tables)
}

/// Captures fingerprints for every user table and upserts them into
/// `steep_repl.schema_fingerprints`. Returns the number of tables.
pub async fn capture_fingerprints<C: GenericClient>(
    client: &C,
    schemas: Option<&[String]>,
) -> Result<usize, FingerprintError> {
    let tables = fetch_table_columns(client, schemas).await?;
    for (schema, table, columns) in &tables {
        let fp = fingerprint(columns);
        let definitions =
            serde_json::to_value(columns).expect("column definitions serialize infallibly");
        client
            .execute(
                "INSERT INTO steep_repl.schema_fingerprints
                     (table_schema, table_name, fingerprint, column_count, column_definitions)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (table_schema, table_name) DO UPDATE SET
                     fingerprint = EXCLUDED.fingerprint,
                     column_count = EXCLUDED.column_count,
                     column_definitions = EXCLUDED.column_definitions,
                     captured_at = now()",
                &[schema, table, &fp, &(columns.len() as i32), &definitions],
            )
            .await?;
    }
    debug!(tables = tables.len(), "captured schema fingerprints");
    Ok(tables.len())
}

/// Read access to stored fingerprints.
pub struct FingerprintStore;

impl FingerprintStore {
    pub async fn all<C: GenericClient>(
        client: &C,
    ) -> Result<Vec<StoredFingerprint>, FingerprintError> {
        let rows = client
            .query(
                "SELECT table_schema, table_name, fingerprint, column_definitions, captured_at
                 FROM steep_repl.schema_fingerprints
                 ORDER BY table_schema, table_name",
                &[],
            )
            .await?;
        rows.into_iter()
            .map(|row| {
                let definitions: serde_json::Value = row.get("column_definitions");
                let columns = serde_json::from_value(definitions).map_err(|e| {
                    steep_db::DbError::MalformedRow {
                        table: "schema_fingerprints",
                        detail: e.to_string(),
                    }
                })?;
                Ok(StoredFingerprint {
                    table_schema: row.get("table_schema"),
                    table_name: row.get("table_name"),
                    fingerprint: row.get("fingerprint"),
                    columns,
                    captured_at: row.get("captured_at"),
                })
            })
            .collect()
    }
}
