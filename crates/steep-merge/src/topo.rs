//! Foreign-key topological ordering.

use std::collections::{HashMap, VecDeque};

use crate::MergeTable;

/// A dependency cycle among the named tables; merge cannot order them.
#[derive(Debug, Clone, thiserror::Error)]
#[error("cycle among tables: {}", tables.join(" -> "))]
pub struct CycleError {
    pub tables: Vec<String>,
}

/// Orders tables so every table comes after everything it references.
///
/// Kahn's algorithm over the FK graph; ties resolve by name so the order
/// is deterministic. References to tables outside the set (excluded
/// schemas) are ignored. On a cycle, the error names its members.
pub fn topo_order(tables: &[MergeTable]) -> Result<Vec<usize>, CycleError> {
    let index_by_key: HashMap<String, usize> = tables
        .iter()
        .enumerate()
        .map(|(i, t)| (t.qualified_key(), i))
        .collect();

    // dependents[parent] lists children waiting on it; indegree counts the
    // in-set tables each child references.
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); tables.len()];
    let mut indegree: Vec<usize> = vec![0; tables.len()];
    for (child, table) in tables.iter().enumerate() {
        for parent_key in &table.references {
            if let Some(&parent) = index_by_key.get(parent_key.as_str()) {
                if parent != child {
                    dependents[parent].push(child);
                    indegree[child] += 1;
                }
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..tables.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(tables.len());
    while let Some(next) = pop_smallest(&mut ready, tables) {
        order.push(next);
        for &child in &dependents[next] {
            indegree[child] -= 1;
            if indegree[child] == 0 {
                ready.push_back(child);
            }
        }
    }

    if order.len() == tables.len() {
        Ok(order)
    } else {
        let mut cycle: Vec<String> = (0..tables.len())
            .filter(|&i| indegree[i] > 0)
            .map(|i| tables[i].qualified_key())
            .collect();
        cycle.sort();
        Err(CycleError { tables: cycle })
    }
}

fn pop_smallest(ready: &mut VecDeque<usize>, tables: &[MergeTable]) -> Option<usize> {
    let position = ready
        .iter()
        .enumerate()
        .min_by_key(|&(_, &i)| tables[i].qualified_key())
        .map(|(pos, _)| pos)?;
    ready.remove(position)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MergeColumn;

    fn table(schema: &str, name: &str, references: &[&str]) -> MergeTable {
        MergeTable {
            schema: schema.to_string(),
            name: name.to_string(),
            columns: vec![MergeColumn {
                name: "id".to_string(),
                data_type: "integer".to_string(),
                position: 1,
            }],
            primary_key: vec!["id".to_string()],
            references: references.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    #[test]
    fn parent_strictly_before_child() {
        let tables = vec![
            table("public", "child", &["public.parent"]),
            table("public", "parent", &[]),
        ];
        let order = topo_order(&tables).unwrap();
        let parent_pos = order.iter().position(|&i| tables[i].name == "parent").unwrap();
        let child_pos = order.iter().position(|&i| tables[i].name == "child").unwrap();
        assert!(parent_pos < child_pos);
    }

    #[test]
    fn diamond_resolves_deterministically() {
        let tables = vec![
            table("public", "d", &["public.b", "public.c"]),
            table("public", "b", &["public.a"]),
            table("public", "c", &["public.a"]),
            table("public", "a", &[]),
        ];
        let order = topo_order(&tables).unwrap();
        let names: Vec<&str> = order.iter().map(|&i| tables[i].name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn cycle_aborts_naming_members() {
        let tables = vec![
            table("public", "a", &["public.b"]),
            table("public", "b", &["public.a"]),
            table("public", "standalone", &[]),
        ];
        let err = topo_order(&tables).unwrap_err();
        assert_eq!(err.tables, vec!["public.a", "public.b"]);
        assert!(err.to_string().contains("public.a"));
    }

    #[test]
    fn self_reference_is_not_a_cycle() {
        // A self-referential FK (org chart) orders fine: rows within one
        // table are handled by the transfer statements, not the scheduler.
        let tables = vec![table("public", "employees", &["public.employees"])];
        let order = topo_order(&tables).unwrap();
        assert_eq!(order, vec![0]);
    }

    #[test]
    fn references_outside_set_ignored() {
        let tables = vec![table("public", "orders", &["archive.customers"])];
        assert_eq!(topo_order(&tables).unwrap(), vec![0]);
    }
}
