//! Dependency ordering of collected rows.
//!
//! Inserts are placed parent first, deletes child first, updates in between.
//! Ordering is best effort: a cycle on the recursion stack stops the search
//! and the remaining rows keep collection order. The number of rows placed
//! that way is reported as `unresolved`.

use crate::row::{Row, RowId, RowKind};
use crate::row_manager::RowManager;
use sqlwrite_core::{Action, Mapping};
use std::collections::HashMap;

/// The ordered plan for one flush.
#[derive(Debug, Default)]
pub struct FlushOrder {
    /// Primary rows: inserts, then updates, then deletes.
    pub rows: Vec<RowId>,
    /// Corrective updates that must run before any delete.
    pub delete_updates: Vec<Row>,
    /// Rows placed by a cycle bail-out.
    pub unresolved: usize,
    ranks: HashMap<RowId, usize>,
}

impl FlushOrder {
    /// Position of a row in the final order.
    pub fn rank(&self, id: RowId) -> Option<usize> {
        self.ranks.get(&id).copied()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    OnStack,
    Done,
}

/// Depth-first placement over one action's rows.
struct Placement<'a> {
    mapping: &'a Mapping,
    rows: &'a RowManager,
    action: Action,
    marks: HashMap<RowId, Mark>,
    placed: Vec<RowId>,
}

impl<'a> Placement<'a> {
    fn new(mapping: &'a Mapping, rows: &'a RowManager, action: Action) -> Self {
        Self {
            mapping,
            rows,
            action,
            marks: HashMap::new(),
            placed: Vec::new(),
        }
    }

    /// Rows this row must follow (inserts) or precede (deletes).
    fn dependencies(&self, id: RowId) -> Vec<RowId> {
        let row = self.rows.row(id);
        let refs = match self.action {
            Action::Delete => row.foreign_keys_where(),
            _ => row.foreign_keys_set(),
        };
        refs.iter()
            .filter_map(|(fk_id, target)| {
                let fk = self.mapping.foreign_key(*fk_id);
                let constrains = match self.action {
                    Action::Delete => !fk.deferred,
                    _ => fk.constrains_order(),
                };
                if !constrains {
                    return None;
                }
                self.rows
                    .lookup(fk.referenced_table, self.action, *target)
                    .filter(|dep| *dep != id && self.rows.row(*dep).is_valid())
            })
            .collect()
    }

    /// Returns false when a cycle was hit.
    fn visit(&mut self, id: RowId) -> bool {
        match self.marks.get(&id) {
            Some(Mark::Done) => return true,
            Some(Mark::OnStack) => return false,
            None => {}
        }
        self.marks.insert(id, Mark::OnStack);
        for dep in self.dependencies(id) {
            if !self.visit(dep) {
                return false;
            }
        }
        self.marks.insert(id, Mark::Done);
        self.placed.push(id);
        true
    }

    /// Place `candidates`; returns the order and the number of bail-out rows.
    fn run(mut self, candidates: &[RowId], prepend: bool) -> (Vec<RowId>, usize) {
        let mut bailed = false;
        for &id in candidates {
            if !self.visit(id) {
                bailed = true;
                break;
            }
        }
        if prepend {
            self.placed.reverse();
        }
        if !bailed {
            return (self.placed, 0);
        }

        let remaining: Vec<RowId> = candidates
            .iter()
            .copied()
            .filter(|id| self.marks.get(id) != Some(&Mark::Done))
            .collect();
        tracing::warn!(
            action = %self.action,
            remaining = remaining.len(),
            "Foreign key cycle; placing remaining rows in collection order"
        );
        let unresolved = remaining.len();
        let mut order = self.placed;
        order.extend(remaining);
        (order, unresolved)
    }
}

fn valid(rows: &RowManager, ids: &[RowId]) -> Vec<RowId> {
    ids.iter()
        .copied()
        .filter(|id| rows.row(*id).is_valid())
        .collect()
}

/// Order the primary rows of `rows` and synthesize delete corrective updates.
#[tracing::instrument(level = "debug", skip_all)]
pub fn order(mapping: &Mapping, rows: &RowManager) -> FlushOrder {
    let (inserts, insert_unresolved) =
        Placement::new(mapping, rows, Action::Insert).run(&valid(rows, rows.inserts()), false);
    let updates = valid(rows, rows.updates());
    let (deletes, delete_unresolved) =
        Placement::new(mapping, rows, Action::Delete).run(&valid(rows, rows.deletes()), true);

    let mut order = FlushOrder {
        unresolved: insert_unresolved + delete_unresolved,
        ..FlushOrder::default()
    };
    order.rows.reserve(inserts.len() + updates.len() + deletes.len());
    order.rows.extend(inserts);
    order.rows.extend(updates);
    order.rows.extend(&deletes);
    order.ranks = order
        .rows
        .iter()
        .enumerate()
        .map(|(rank, id)| (*id, rank))
        .collect();

    order.delete_updates = delete_corrections(mapping, rows, &deletes, &order);

    tracing::debug!(
        rows = order.rows.len(),
        delete_updates = order.delete_updates.len(),
        unresolved = order.unresolved,
        "Ordered rows"
    );
    order
}

/// For a delete R referencing a row T also being deleted no later than R,
/// null R's key first.
fn delete_corrections(
    mapping: &Mapping,
    rows: &RowManager,
    deletes: &[RowId],
    order: &FlushOrder,
) -> Vec<Row> {
    let mut corrections: Vec<Row> = Vec::new();
    let mut by_row: HashMap<RowId, usize> = HashMap::new();

    for &id in deletes {
        let row = rows.row(id);
        let Some(rank) = order.rank(id) else {
            continue;
        };
        for (fk_id, target) in row.foreign_keys_where() {
            let fk = mapping.foreign_key(*fk_id);
            if fk.deferred {
                continue;
            }
            let Some(dep) = rows.lookup(fk.referenced_table, Action::Delete, *target) else {
                continue;
            };
            if dep == id && !fk.nullable {
                continue;
            }
            // Join keys are part of the identity and cannot be nulled.
            let table = mapping.table(row.table());
            if fk
                .columns
                .iter()
                .any(|c| table.primary_key_position(c).is_some())
            {
                continue;
            }
            match order.rank(dep) {
                Some(dep_rank) if dep_rank <= rank => {}
                _ => continue,
            }

            let slot = *by_row.entry(id).or_insert_with(|| {
                let mut update = Row::new(
                    row.table(),
                    Action::Update,
                    row.owner(),
                    RowKind::Primary,
                    row.index(),
                );
                update.set_key_where(true);
                update.set_failed_object(row.failed_object());
                corrections.push(update);
                corrections.len() - 1
            });
            for column in &fk.columns {
                corrections[slot].set_column(column, sqlwrite_core::Value::Null);
            }
            tracing::debug!(
                table = %table,
                foreign_key = %fk.name,
                "Nulling foreign key before delete"
            );
        }
    }
    corrections
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlwrite_core::{Column, ForeignKeyDef, MappingBuilder, ObjectId, TableDef, TableId};

    struct Fixture {
        mapping: Mapping,
        teams: TableId,
        heroes: TableId,
        nodes: TableId,
    }

    fn fixture() -> Fixture {
        let mapping = MappingBuilder::new()
            .table(TableDef::new("teams").column(Column::new("id")).primary_key(&["id"]))
            .table(
                TableDef::new("heroes")
                    .column(Column::new("id"))
                    .column(Column::new("team_id").not_null())
                    .column(Column::new("sidekick_id"))
                    .primary_key(&["id"])
                    .foreign_key(ForeignKeyDef::new("fk_team", &["team_id"], "teams"))
                    .foreign_key(ForeignKeyDef::new("fk_sidekick", &["sidekick_id"], "heroes")),
            )
            .table(
                TableDef::new("nodes")
                    .column(Column::new("id"))
                    .column(Column::new("next_id").not_null())
                    .primary_key(&["id"])
                    .foreign_key(ForeignKeyDef::new("fk_next", &["next_id"], "nodes")),
            )
            .build()
            .unwrap();
        Fixture {
            teams: mapping.table_by_name("teams").unwrap(),
            heroes: mapping.table_by_name("heroes").unwrap(),
            nodes: mapping.table_by_name("nodes").unwrap(),
            mapping,
        }
    }

    fn link(f: &Fixture, rows: &mut RowManager, table: TableId, action: Action, owner: u64, fk: &str, target: u64) {
        let id = f.mapping.foreign_key_by_name(fk).unwrap();
        let row = rows.get_or_create_row(table, action, ObjectId::new(owner));
        match action {
            Action::Delete => row.where_foreign_key(id, ObjectId::new(target)),
            _ => row.set_foreign_key(id, f.mapping.foreign_key(id), Some(ObjectId::new(target))),
        }
    }

    fn owners(rows: &RowManager, order: &[RowId]) -> Vec<u64> {
        order
            .iter()
            .map(|id| rows.row(*id).owner().unwrap().raw())
            .collect()
    }

    #[test]
    fn test_insert_parents_first() {
        let f = fixture();
        let mut rows = RowManager::new();
        link(&f, &mut rows, f.heroes, Action::Insert, 2, "fk_team", 1);
        rows.get_or_create_row(f.teams, Action::Insert, ObjectId::new(1));

        let order = order(&f.mapping, &rows);
        assert_eq!(owners(&rows, &order.rows), vec![1, 2]);
        assert_eq!(order.unresolved, 0);
    }

    #[test]
    fn test_nullable_key_imposes_no_insert_edge() {
        let f = fixture();
        let mut rows = RowManager::new();
        link(&f, &mut rows, f.heroes, Action::Insert, 1, "fk_sidekick", 2);
        rows.get_or_create_row(f.heroes, Action::Insert, ObjectId::new(2));

        let order = order(&f.mapping, &rows);
        assert_eq!(owners(&rows, &order.rows), vec![1, 2]);
    }

    #[test]
    fn test_deletes_children_first() {
        let f = fixture();
        let mut rows = RowManager::new();
        rows.get_or_create_row(f.teams, Action::Delete, ObjectId::new(1));
        link(&f, &mut rows, f.heroes, Action::Delete, 2, "fk_team", 1);

        let order = order(&f.mapping, &rows);
        assert_eq!(owners(&rows, &order.rows), vec![2, 1]);
        assert!(order.delete_updates.is_empty());
    }

    #[test]
    fn test_updates_between_inserts_and_deletes() {
        let f = fixture();
        let mut rows = RowManager::new();
        rows.get_or_create_row(f.teams, Action::Delete, ObjectId::new(3));
        rows.get_or_create_row(f.teams, Action::Update, ObjectId::new(2));
        rows.get_or_create_row(f.teams, Action::Insert, ObjectId::new(1));

        let order = order(&f.mapping, &rows);
        assert_eq!(owners(&rows, &order.rows), vec![1, 2, 3]);
        assert_eq!(order.rank(order.rows[2]), Some(2));
    }

    #[test]
    fn test_insert_cycle_bails_out_in_collection_order() {
        let f = fixture();
        let mut rows = RowManager::new();
        link(&f, &mut rows, f.nodes, Action::Insert, 1, "fk_next", 2);
        link(&f, &mut rows, f.nodes, Action::Insert, 2, "fk_next", 1);

        let order = order(&f.mapping, &rows);
        assert_eq!(owners(&rows, &order.rows), vec![1, 2]);
        assert_eq!(order.unresolved, 2);
    }

    #[test]
    fn test_self_reference_is_not_a_cycle() {
        let f = fixture();
        let mut rows = RowManager::new();
        link(&f, &mut rows, f.nodes, Action::Insert, 1, "fk_next", 1);

        let order = order(&f.mapping, &rows);
        assert_eq!(order.rows.len(), 1);
        assert_eq!(order.unresolved, 0);
    }

    #[test]
    fn test_delete_cycle_gets_corrective_update() {
        let f = fixture();
        let mut rows = RowManager::new();
        link(&f, &mut rows, f.heroes, Action::Delete, 1, "fk_sidekick", 2);
        link(&f, &mut rows, f.heroes, Action::Delete, 2, "fk_sidekick", 1);

        let order = order(&f.mapping, &rows);
        assert_eq!(order.unresolved, 2);
        assert_eq!(order.delete_updates.len(), 1);
        let update = &order.delete_updates[0];
        assert_eq!(update.action(), Action::Update);
        assert_eq!(
            update.set_values(),
            &[("sidekick_id".to_string(), sqlwrite_core::Value::Null)]
        );
    }

    #[test]
    fn test_nullable_self_reference_delete_is_nulled_first() {
        let f = fixture();
        let mut rows = RowManager::new();
        link(&f, &mut rows, f.heroes, Action::Delete, 1, "fk_sidekick", 1);
        link(&f, &mut rows, f.nodes, Action::Delete, 5, "fk_next", 5);

        let order = order(&f.mapping, &rows);
        assert_eq!(order.delete_updates.len(), 1);
        assert_eq!(order.delete_updates[0].owner(), Some(ObjectId::new(1)));
    }

    #[test]
    fn test_invalid_rows_are_not_ordered() {
        let f = fixture();
        let mut rows = RowManager::new();
        rows.get_or_create_row(f.teams, Action::Insert, ObjectId::new(1));
        rows.get_or_create_row(f.teams, Action::Insert, ObjectId::new(2));
        rows.invalidate_owner(ObjectId::new(1));

        let order = order(&f.mapping, &rows);
        assert_eq!(owners(&rows, &order.rows), vec![2]);
    }
}
