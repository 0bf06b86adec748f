//! The canonical 64-bit row hash.
//!
//! FNV-1a over the ordered non-primary-key column values, each encoded as
//! `<type-tag>:<textual-representation>|` where the type tag is the
//! column's formatted type name and the textual representation is
//! PostgreSQL's `::text` cast (the same rendering COPY text format uses).
//! NULL is encoded as the literal four-byte sequence `NULL` followed by
//! the separator, with no type tag. Composite, array, and JSONB values
//! therefore hash their canonical text forms.
//!
//! Both sides must compute the hash identically: the daemon installs
//! [`FNV1A_64_SQL`] on each node, and [`encoded_row_expr`] generates the
//! same encoding expression for the local query and the peer-side hash
//! view. [`fnv1a_64`] is the Rust reference implementation the SQL
//! function must agree with.

use std::hash::Hasher;

use fnv::FnvHasher;

use crate::{MergeColumn, quote_ident};

/// FNV-1a 64 installed on both nodes. Arithmetic runs in `numeric` so the
/// modular multiplication is exact; the XOR with each input byte only
/// touches the low 8 bits, which the mod-256 juggling reproduces.
pub const FNV1A_64_SQL: &str = r"
CREATE OR REPLACE FUNCTION steep_repl.fnv1a_64(data text) RETURNS bigint AS $$
DECLARE
    h numeric := 14695981039346656037;
    b bytea := convert_to(data, 'UTF8');
    i integer;
    lo integer;
BEGIN
    FOR i IN 0 .. octet_length(b) - 1 LOOP
        lo := (h % 256)::integer # get_byte(b, i);
        h := h - (h % 256) + lo;
        h := (h * 1099511628211) % 18446744073709551616;
    END LOOP;
    IF h >= 9223372036854775808 THEN
        h := h - 18446744073709551616;
    END IF;
    RETURN h::bigint;
END;
$$ LANGUAGE plpgsql IMMUTABLE STRICT PARALLEL SAFE;
";

/// Rust reference implementation, returned as the same signed 64-bit value
/// the SQL function yields.
pub fn fnv1a_64(data: &[u8]) -> i64 {
    let mut hasher = FnvHasher::default();
    hasher.write(data);
    hasher.finish() as i64
}

/// Encodes one row's non-PK values the canonical way. `values` pairs each
/// column's type tag with its textual representation, `None` for NULL.
pub fn encode_row(values: &[(&str, Option<&str>)]) -> String {
    let mut out = String::new();
    for (tag, value) in values {
        match value {
            Some(text) => {
                out.push_str(tag);
                out.push(':');
                out.push_str(text);
            }
            None => out.push_str("NULL"),
        }
        out.push('|');
    }
    out
}

/// SQL expression producing the canonical encoding for alias `alias`,
/// concatenating every non-PK column in ordinal order. Generated
/// identically for the local query and the peer hash view.
pub fn encoded_row_expr(columns: &[MergeColumn], pk: &[String], alias: &str) -> String {
    let parts: Vec<String> = columns
        .iter()
        .filter(|c| !pk.contains(&c.name))
        .map(|c| {
            let qualified = format!("{alias}.{}", quote_ident(&c.name));
            format!(
                "CASE WHEN {qualified} IS NULL THEN 'NULL|' ELSE {tag} || ':' || {qualified}::text || '|' END",
                tag = sql_string(&c.data_type),
            )
        })
        .collect();
    if parts.is_empty() {
        // A table that is all primary key still hashes deterministically.
        "''".to_string()
    } else {
        format!("concat({})", parts.join(", "))
    }
}

fn sql_string(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // Published FNV-1a 64 test vectors.
    #[test]
    fn fnv1a_reference_vectors() {
        assert_eq!(fnv1a_64(b"") as u64, 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a_64(b"a") as u64, 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a_64(b"foobar") as u64, 0x85944171f73967e8);
    }

    #[test]
    fn encode_row_tags_and_separators() {
        let encoded = encode_row(&[
            ("text", Some("alice")),
            ("integer", None),
            ("jsonb", Some(r#"{"a": 1}"#)),
        ]);
        assert_eq!(encoded, r#"text:alice|NULL|jsonb:{"a": 1}|"#);
    }

    #[test]
    fn null_has_no_type_tag() {
        let encoded = encode_row(&[("integer", None)]);
        assert_eq!(encoded, "NULL|");
        // Distinct from the string 'NULL'.
        assert_ne!(encoded, encode_row(&[("text", Some("NULL"))]));
    }

    #[test]
    fn different_values_hash_differently() {
        let a = fnv1a_64(encode_row(&[("text", Some("L"))]).as_bytes());
        let b = fnv1a_64(encode_row(&[("text", Some("R"))]).as_bytes());
        assert_ne!(a, b);
    }

    fn column(name: &str, data_type: &str, position: i32) -> MergeColumn {
        MergeColumn {
            name: name.to_string(),
            data_type: data_type.to_string(),
            position,
        }
    }

    #[test]
    fn expr_skips_pk_columns_and_quotes() {
        let columns = vec![
            column("id", "integer", 1),
            column("name", "text", 2),
            column("bio", "text", 3),
        ];
        let expr = encoded_row_expr(&columns, &["id".to_string()], "t");
        assert!(!expr.contains("t.\"id\""));
        assert!(expr.contains("t.\"name\""));
        assert!(expr.contains("'text' || ':' || t.\"bio\"::text || '|'"));
        assert!(expr.contains("'NULL|'"));
    }

    #[test]
    fn expr_for_pk_only_table_is_constant() {
        let columns = vec![column("id", "integer", 1)];
        assert_eq!(encoded_row_expr(&columns, &["id".to_string()], "t"), "''");
    }

    proptest! {
        #[test]
        fn rust_hash_is_deterministic(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            prop_assert_eq!(fnv1a_64(&data), fnv1a_64(&data));
        }

        // The SQL emulation's low-byte XOR trick mirrors this property: the
        // hash of a prefix extended by one byte only depends on the prefix
        // hash and that byte.
        #[test]
        fn hash_is_prefix_composable(prefix in proptest::collection::vec(any::<u8>(), 0..64), byte in any::<u8>()) {
            let mut whole = prefix.clone();
            whole.push(byte);

            let mut hasher = FnvHasher::with_key(fnv1a_64(&prefix) as u64);
            hasher.write(&[byte]);
            prop_assert_eq!(hasher.finish() as i64, fnv1a_64(&whole));
        }
    }
}
