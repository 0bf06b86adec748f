//! Schema fingerprint engine.
//!
//! Computes per-table structural hashes over the canonical column
//! encoding, compares them across nodes, and classifies differences as
//! blocking (type, nullability, presence) or informational (default).
//! Replication is gated on the verdict according to the schema sync mode.

mod capture;
mod compare;

pub use capture::{FingerprintStore, StoredFingerprint, capture_fingerprints, fetch_table_columns};
pub use compare::{
    ColumnDiff, DiffKind, SchemaComparison, TableVerdict, Verdict, compare_schemas, diff_columns,
    gate,
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use steep_types::ErrorKind;

/// One column of a table's structural definition, in ordinal order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    pub data_type: String,
    pub default_value: Option<String>,
    pub nullable: bool,
    pub position: i32,
}

/// Canonical encoding of an ordered column sequence.
///
/// One LF-terminated line per column: `<name>|<type>|<nullable>|<position>`,
/// UTF-8, nullability rendered as `true`/`false`. The column default is
/// captured but deliberately excluded: a default change is informational
/// and must not perturb the digest. Two implementations hashing the same
/// sequence must produce bit-identical digests.
pub fn canonical_bytes(columns: &[ColumnDefinition]) -> Vec<u8> {
    let mut out = Vec::with_capacity(columns.len() * 32);
    for column in columns {
        out.extend_from_slice(column.name.as_bytes());
        out.push(b'|');
        out.extend_from_slice(column.data_type.as_bytes());
        out.push(b'|');
        out.extend_from_slice(if column.nullable { b"true" } else { b"false" });
        out.push(b'|');
        out.extend_from_slice(column.position.to_string().as_bytes());
        out.push(b'\n');
    }
    out
}

/// Table fingerprint: lowercase hex SHA-256 of the canonical encoding.
pub fn fingerprint(columns: &[ColumnDefinition]) -> String {
    let digest = Sha256::digest(canonical_bytes(columns));
    let mut hex = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        write!(hex, "{byte:02x}").expect("writing to a String cannot fail");
    }
    hex
}

/// Errors from the fingerprint engine.
#[derive(Debug, thiserror::Error)]
pub enum FingerprintError {
    #[error(transparent)]
    Db(#[from] steep_db::DbError),

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("schema mismatch blocks replication: {blocking_tables} table(s) differ structurally")]
    SchemaMismatch { blocking_tables: usize },
}

impl FingerprintError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FingerprintError::Db(e) => e.kind(),
            FingerprintError::Postgres(_) => ErrorKind::Internal,
            FingerprintError::SchemaMismatch { .. } => ErrorKind::FailedPrecondition,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn column(name: &str, data_type: &str, nullable: bool, position: i32) -> ColumnDefinition {
        ColumnDefinition {
            name: name.to_string(),
            data_type: data_type.to_string(),
            default_value: None,
            nullable,
            position,
        }
    }

    #[test]
    fn canonical_encoding_is_line_per_column() {
        let columns = vec![
            column("id", "integer", false, 1),
            column("name", "text", true, 2),
        ];
        assert_eq!(
            canonical_bytes(&columns),
            b"id|integer|false|1\nname|text|true|2\n"
        );
    }

    #[test]
    fn fingerprint_is_lowercase_hex_sha256() {
        let fp = fingerprint(&[column("id", "integer", false, 1)]);
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn default_change_does_not_perturb_digest() {
        let without = vec![column("id", "integer", false, 1)];
        let mut with = without.clone();
        with[0].default_value = Some("nextval('users_id_seq')".to_string());
        assert_eq!(fingerprint(&without), fingerprint(&with));
    }

    #[test]
    fn nullability_change_perturbs_digest() {
        let a = vec![column("name", "text", true, 1)];
        let b = vec![column("name", "text", false, 1)];
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn type_change_perturbs_digest() {
        let a = vec![column("name", "text", true, 1)];
        let b = vec![column("name", "character varying(10)", true, 1)];
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn column_order_is_part_of_identity() {
        let forward = vec![
            column("id", "integer", false, 1),
            column("name", "text", true, 2),
        ];
        let swapped = vec![
            column("name", "text", true, 1),
            column("id", "integer", false, 2),
        ];
        assert_ne!(fingerprint(&forward), fingerprint(&swapped));

        // Reordering on disk that preserves ordinal positions is invisible:
        // the encoding orders by position, so the same (name, position)
        // pairs hash identically regardless of enumeration order.
        let mut shuffled = forward.clone();
        shuffled.swap(0, 1);
        let mut by_position = shuffled;
        by_position.sort_by_key(|c| c.position);
        assert_eq!(fingerprint(&forward), fingerprint(&by_position));
    }

    proptest! {
        #[test]
        fn digest_is_deterministic(
            names in proptest::collection::vec("[a-z_][a-z0-9_]{0,20}", 1..8),
        ) {
            let columns: Vec<ColumnDefinition> = names
                .iter()
                .enumerate()
                .map(|(i, name)| column(name, "text", i % 2 == 0, i as i32 + 1))
                .collect();
            prop_assert_eq!(fingerprint(&columns), fingerprint(&columns));
        }
    }
}
