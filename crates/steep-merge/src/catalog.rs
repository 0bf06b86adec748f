//! Catalog introspection for merge planning.

use tokio_postgres::GenericClient;

use crate::MergeError;

/// One column as the merge engine sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeColumn {
    pub name: String,
    /// Formatted type name (`format_type`), also the hash type tag.
    pub data_type: String,
    pub position: i32,
}

/// One participating table: columns in ordinal order, primary key, and
/// the tables it references through foreign keys.
#[derive(Debug, Clone)]
pub struct MergeTable {
    pub schema: String,
    pub name: String,
    pub columns: Vec<MergeColumn>,
    pub primary_key: Vec<String>,
    /// `schema.table` keys of referenced tables.
    pub references: Vec<String>,
}

impl MergeTable {
    pub fn qualified_key(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// Loads every user table with columns, PKs, and FK edges.
///
/// Fails closed on a table without a primary key: overlap analysis joins
/// on it.
pub async fn fetch_merge_tables<C: GenericClient>(
    client: &C,
) -> Result<Vec<MergeTable>, MergeError> {
    let column_rows = client
        .query(
            "SELECT n.nspname AS schema, c.relname AS table,
                    a.attname AS column, format_type(a.atttypid, a.atttypmod) AS data_type,
                    a.attnum::int4 AS position
             FROM pg_class c
             JOIN pg_namespace n ON n.oid = c.relnamespace
             JOIN pg_attribute a ON a.attrelid = c.oid
             WHERE c.relkind = 'r'
               AND a.attnum > 0 AND NOT a.attisdropped
               AND n.nspname NOT IN ('pg_catalog', 'information_schema', 'steep_repl')
             ORDER BY n.nspname, c.relname, a.attnum",
            &[],
        )
        .await?;

    let mut tables: Vec<MergeTable> = Vec::new();
    for row in column_rows {
        let schema: String = row.get("schema");
        let name: String = row.get("table");
        let column = MergeColumn {
            name: row.get("column"),
            data_type: row.get("data_type"),
            position: row.get("position"),
        };
        match tables.last_mut() {
            Some(t) if t.schema == schema && t.name == name => t.columns.push(column),
            _ => tables.push(MergeTable {
                schema,
                name,
                columns: vec![column],
                primary_key: Vec::new(),
                references: Vec::new(),
            }),
        }
    }

    let pk_rows = client
        .query(
            "SELECT n.nspname AS schema, c.relname AS table, a.attname AS column
             FROM pg_index i
             JOIN pg_class c ON c.oid = i.indrelid
             JOIN pg_namespace n ON n.oid = c.relnamespace
             JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = ANY(i.indkey)
             WHERE i.indisprimary
               AND n.nspname NOT IN ('pg_catalog', 'information_schema', 'steep_repl')
             ORDER BY n.nspname, c.relname, a.attnum",
            &[],
        )
        .await?;
    for row in pk_rows {
        let schema: String = row.get("schema");
        let name: String = row.get("table");
        if let Some(t) = tables
            .iter_mut()
            .find(|t| t.schema == schema && t.name == name)
        {
            t.primary_key.push(row.get("column"));
        }
    }

    let fk_rows = client
        .query(
            "SELECT cn.nspname AS child_schema, c.relname AS child_table,
                    pn.nspname AS parent_schema, p.relname AS parent_table
             FROM pg_constraint con
             JOIN pg_class c ON c.oid = con.conrelid
             JOIN pg_namespace cn ON cn.oid = c.relnamespace
             JOIN pg_class p ON p.oid = con.confrelid
             JOIN pg_namespace pn ON pn.oid = p.relnamespace
             WHERE con.contype = 'f'
               AND cn.nspname NOT IN ('pg_catalog', 'information_schema', 'steep_repl')",
            &[],
        )
        .await?;
    for row in fk_rows {
        let child_schema: String = row.get("child_schema");
        let child_table: String = row.get("child_table");
        let parent: String = format!(
            "{}.{}",
            row.get::<_, String>("parent_schema"),
            row.get::<_, String>("parent_table")
        );
        if let Some(t) = tables
            .iter_mut()
            .find(|t| t.schema == child_schema && t.name == child_table)
        {
            if !t.references.contains(&parent) {
                t.references.push(parent);
            }
        }
    }

    for table in &tables {
        if table.primary_key.is_empty() {
            return Err(MergeError::MissingPrimaryKey(table.qualified_key()));
        }
    }

    Ok(tables)
}

/// User-defined (non-internal) triggers on participating tables. The
/// pre-flight refuses to merge over them: an audit or replication trigger
/// firing during transfers would double-apply changes.
pub async fn fetch_user_triggers<C: GenericClient>(
    client: &C,
) -> Result<Vec<(String, String)>, MergeError> {
    let rows = client
        .query(
            "SELECT n.nspname || '.' || c.relname AS table, t.tgname AS trigger
             FROM pg_trigger t
             JOIN pg_class c ON c.oid = t.tgrelid
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE NOT t.tgisinternal
               AND t.tgname NOT LIKE 'steep_quiesce%'
               AND n.nspname NOT IN ('pg_catalog', 'information_schema', 'steep_repl')",
            &[],
        )
        .await?;
    Ok(rows
        .into_iter()
        .map(|row| (row.get("table"), row.get("trigger")))
        .collect())
}
