//! Cross-node comparison and replication gating.

use std::collections::BTreeMap;

use tracing::warn;

use steep_types::SchemaSyncMode;

use crate::{ColumnDefinition, FingerprintError, fingerprint};

/// Per-table verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Match,
    Mismatch,
    LocalOnly,
    RemoteOnly,
}

/// What changed about one column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffKind {
    TypeChange,
    NullableChange,
    MissingLocal,
    MissingRemote,
    DefaultChange,
}

impl DiffKind {
    /// Type, nullability, and presence changes gate replication; a default
    /// change is informational only.
    pub fn is_blocking(self) -> bool {
        !matches!(self, DiffKind::DefaultChange)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DiffKind::TypeChange => "type_change",
            DiffKind::NullableChange => "nullable_change",
            DiffKind::MissingLocal => "missing_local",
            DiffKind::MissingRemote => "missing_remote",
            DiffKind::DefaultChange => "default_change",
        }
    }
}

/// One differing column in a mismatched table.
#[derive(Debug, Clone)]
pub struct ColumnDiff {
    pub column_name: String,
    pub kind: DiffKind,
    pub local: Option<ColumnDefinition>,
    pub remote: Option<ColumnDefinition>,
}

/// One table's comparison outcome.
#[derive(Debug, Clone)]
pub struct TableVerdict {
    pub table_schema: String,
    pub table_name: String,
    pub verdict: Verdict,
    pub local_fingerprint: Option<String>,
    pub remote_fingerprint: Option<String>,
    pub column_diffs: Vec<ColumnDiff>,
}

impl TableVerdict {
    pub fn has_blocking_diff(&self) -> bool {
        self.verdict != Verdict::Match
            && (self.column_diffs.is_empty()
                || self.column_diffs.iter().any(|d| d.kind.is_blocking()))
    }
}

/// Whole-comparison summary.
#[derive(Debug, Clone)]
pub struct SchemaComparison {
    pub matches: usize,
    pub mismatches: usize,
    pub local_only: usize,
    pub remote_only: usize,
    pub tables: Vec<TableVerdict>,
}

impl SchemaComparison {
    /// True when any table carries a type/nullable/presence difference.
    pub fn blocking(&self) -> bool {
        self.tables.iter().any(TableVerdict::has_blocking_diff)
    }
}

type TableColumns = (String, String, Vec<ColumnDefinition>);

/// Compares the local and remote column inventories table by table.
pub fn compare_schemas(local: &[TableColumns], remote: &[TableColumns]) -> SchemaComparison {
    let local_map: BTreeMap<(&str, &str), &Vec<ColumnDefinition>> = local
        .iter()
        .map(|(s, t, c)| ((s.as_str(), t.as_str()), c))
        .collect();
    let remote_map: BTreeMap<(&str, &str), &Vec<ColumnDefinition>> = remote
        .iter()
        .map(|(s, t, c)| ((s.as_str(), t.as_str()), c))
        .collect();

    let mut keys: Vec<(&str, &str)> = local_map.keys().copied().collect();
    for key in remote_map.keys() {
        if !local_map.contains_key(key) {
            keys.push(*key);
        }
    }
    keys.sort_unstable();

    let mut comparison = SchemaComparison {
        matches: 0,
        mismatches: 0,
        local_only: 0,
        remote_only: 0,
        tables: Vec::with_capacity(keys.len()),
    };

    for (schema, table) in keys {
        let local_columns = local_map.get(&(schema, table));
        let remote_columns = remote_map.get(&(schema, table));
        let entry = match (local_columns, remote_columns) {
            (Some(l), Some(r)) => {
                let local_fp = fingerprint(l);
                let remote_fp = fingerprint(r);
                let verdict = if local_fp == remote_fp {
                    Verdict::Match
                } else {
                    Verdict::Mismatch
                };
                // Default-only drift leaves the fingerprints equal but is
                // still worth surfacing in the diff list.
                let column_diffs = diff_columns(l, r);
                match verdict {
                    Verdict::Match => comparison.matches += 1,
                    _ => comparison.mismatches += 1,
                }
                TableVerdict {
                    table_schema: schema.to_string(),
                    table_name: table.to_string(),
                    verdict,
                    local_fingerprint: Some(local_fp),
                    remote_fingerprint: Some(remote_fp),
                    column_diffs,
                }
            }
            (Some(l), None) => {
                comparison.local_only += 1;
                TableVerdict {
                    table_schema: schema.to_string(),
                    table_name: table.to_string(),
                    verdict: Verdict::LocalOnly,
                    local_fingerprint: Some(fingerprint(l)),
                    remote_fingerprint: None,
                    column_diffs: Vec::new(),
                }
            }
            (None, Some(r)) => {
                comparison.remote_only += 1;
                TableVerdict {
                    table_schema: schema.to_string(),
                    table_name: table.to_string(),
                    verdict: Verdict::RemoteOnly,
                    local_fingerprint: None,
                    remote_fingerprint: Some(fingerprint(r)),
                    column_diffs: Vec::new(),
                }
            }
            (None, None) => unreachable!("key came from one of the maps"),
        };
        comparison.tables.push(entry);
    }

    comparison
}

/// Column-level diff of two definitions of the same table.
pub fn diff_columns(local: &[ColumnDefinition], remote: &[ColumnDefinition]) -> Vec<ColumnDiff> {
    let remote_by_name: BTreeMap<&str, &ColumnDefinition> =
        remote.iter().map(|c| (c.name.as_str(), c)).collect();
    let local_by_name: BTreeMap<&str, &ColumnDefinition> =
        local.iter().map(|c| (c.name.as_str(), c)).collect();

    let mut diffs = Vec::new();
    for l in local {
        match remote_by_name.get(l.name.as_str()) {
            None => diffs.push(ColumnDiff {
                column_name: l.name.clone(),
                kind: DiffKind::MissingRemote,
                local: Some(l.clone()),
                remote: None,
            }),
            Some(r) => {
                let kind = if l.data_type != r.data_type {
                    Some(DiffKind::TypeChange)
                } else if l.nullable != r.nullable {
                    Some(DiffKind::NullableChange)
                } else if l.default_value != r.default_value {
                    Some(DiffKind::DefaultChange)
                } else {
                    None
                };
                if let Some(kind) = kind {
                    diffs.push(ColumnDiff {
                        column_name: l.name.clone(),
                        kind,
                        local: Some(l.clone()),
                        remote: Some((*r).clone()),
                    });
                }
            }
        }
    }
    for r in remote {
        if !local_by_name.contains_key(r.name.as_str()) {
            diffs.push(ColumnDiff {
                column_name: r.name.clone(),
                kind: DiffKind::MissingLocal,
                local: None,
                remote: Some(r.clone()),
            });
        }
    }
    diffs
}

/// Applies the schema sync mode to a comparison.
///
/// Strict aborts on any blocking difference. Auto proceeds past every
/// difference but surfaces blocking drift as warnings. Manual skips the
/// gate entirely and is always reported as dangerous. Returns warning
/// strings for the caller to surface.
pub fn gate(
    mode: SchemaSyncMode,
    comparison: &SchemaComparison,
) -> Result<Vec<String>, FingerprintError> {
    let blocking_tables = comparison
        .tables
        .iter()
        .filter(|t| t.has_blocking_diff())
        .count();
    let mut warnings = Vec::new();

    match mode {
        SchemaSyncMode::Manual => {
            warn!("schema gate skipped (manual mode): structural drift will not be detected");
            warnings
                .push("schema sync mode 'manual' skips the compatibility gate".to_string());
            if blocking_tables > 0 {
                warnings.push(format!(
                    "{blocking_tables} table(s) differ structurally; replication may fail"
                ));
            }
            Ok(warnings)
        }
        SchemaSyncMode::Strict if blocking_tables > 0 => {
            Err(FingerprintError::SchemaMismatch { blocking_tables })
        }
        SchemaSyncMode::Strict | SchemaSyncMode::Auto => {
            if blocking_tables > 0 {
                warnings.push(format!(
                    "{blocking_tables} table(s) differ structurally; proceeding under auto mode"
                ));
            }
            for table in &comparison.tables {
                for diff in &table.column_diffs {
                    if !diff.kind.is_blocking() {
                        warnings.push(format!(
                            "{}.{}.{}: default changed (informational)",
                            table.table_schema, table.table_name, diff.column_name
                        ));
                    }
                }
            }
            Ok(warnings)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, data_type: &str, nullable: bool, position: i32) -> ColumnDefinition {
        ColumnDefinition {
            name: name.to_string(),
            data_type: data_type.to_string(),
            default_value: None,
            nullable,
            position,
        }
    }

    fn users_table(name_type: &str) -> (String, String, Vec<ColumnDefinition>) {
        (
            "public".to_string(),
            "users".to_string(),
            vec![
                column("id", "integer", false, 1),
                column("name", name_type, true, 2),
            ],
        )
    }

    #[test]
    fn identical_tables_match() {
        let comparison = compare_schemas(&[users_table("text")], &[users_table("text")]);
        assert_eq!(comparison.matches, 1);
        assert_eq!(comparison.mismatches, 0);
        assert!(!comparison.blocking());
    }

    #[test]
    fn type_drift_is_blocking_mismatch() {
        let comparison =
            compare_schemas(&[users_table("text")], &[users_table("character varying(10)")]);
        assert_eq!(comparison.mismatches, 1);
        assert!(comparison.blocking());
        let diffs = &comparison.tables[0].column_diffs;
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].kind, DiffKind::TypeChange);
    }

    #[test]
    fn default_drift_is_informational() {
        let local = users_table("text");
        let mut remote = users_table("text");
        remote.2[1].default_value = Some("'anonymous'::text".to_string());

        let comparison = compare_schemas(&[local], &[remote]);
        // Defaults are excluded from the digest, so the table still matches.
        assert_eq!(comparison.matches, 1);
        assert!(!comparison.blocking());
        assert_eq!(
            comparison.tables[0].column_diffs[0].kind,
            DiffKind::DefaultChange
        );
    }

    #[test]
    fn presence_classification() {
        let extra = (
            "public".to_string(),
            "audit".to_string(),
            vec![column("id", "bigint", false, 1)],
        );
        let comparison = compare_schemas(&[users_table("text"), extra], &[users_table("text")]);
        assert_eq!(comparison.local_only, 1);
        assert!(comparison.blocking(), "presence differences block");

        let comparison = compare_schemas(
            &[users_table("text")],
            &[users_table("text"), (
                "public".to_string(),
                "audit".to_string(),
                vec![column("id", "bigint", false, 1)],
            )],
        );
        assert_eq!(comparison.remote_only, 1);
    }

    #[test]
    fn gate_strict_aborts_on_blocking_but_auto_proceeds() {
        let comparison =
            compare_schemas(&[users_table("text")], &[users_table("character varying(10)")]);
        assert!(matches!(
            gate(SchemaSyncMode::Strict, &comparison),
            Err(FingerprintError::SchemaMismatch { blocking_tables: 1 })
        ));
        let warnings = gate(SchemaSyncMode::Auto, &comparison).unwrap();
        assert!(warnings.iter().any(|w| w.contains("differ structurally")));
    }

    #[test]
    fn gate_auto_passes_informational_with_warnings() {
        let local = users_table("text");
        let mut remote = users_table("text");
        remote.2[1].default_value = Some("'x'::text".to_string());
        let comparison = compare_schemas(&[local], &[remote]);

        let warnings = gate(SchemaSyncMode::Auto, &comparison).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("informational"));
    }

    #[test]
    fn gate_manual_always_proceeds_with_danger_warning() {
        let comparison =
            compare_schemas(&[users_table("text")], &[users_table("character varying(10)")]);
        let warnings = gate(SchemaSyncMode::Manual, &comparison).unwrap();
        assert!(warnings.iter().any(|w| w.contains("skips")));
        assert!(warnings.iter().any(|w| w.contains("differ structurally")));
    }
}
