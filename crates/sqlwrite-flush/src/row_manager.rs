//! Keyed store of the rows collected for one flush.
//!
//! There is at most one row per `(table, action, owner)`; later contributions
//! for the same key merge into the existing row. Category views keep
//! discovery order.

use crate::row::{Row, RowId, RowKind, VersionCheck};
use sqlwrite_core::{Action, CustomOperation, ObjectId, TableId};
use std::collections::HashMap;

/// A strategy-supplied operation waiting for the end of the flush.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCustom {
    pub owner: ObjectId,
    pub operation: CustomOperation,
}

type RowKey = (TableId, Action, ObjectId);

#[derive(Debug, Default)]
pub struct RowManager {
    rows: Vec<Row>,
    index: HashMap<RowKey, RowId>,
    all_row_deletes: Vec<RowId>,
    all_row_updates: Vec<RowId>,
    secondary_deletes: Vec<RowId>,
    secondary_updates: Vec<RowId>,
    inserts: Vec<RowId>,
    updates: Vec<RowId>,
    deletes: Vec<RowId>,
    version_checks: Vec<VersionCheck>,
    custom_operations: Vec<PendingCustom>,
}

impl RowManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Row for `(table, action, owner)`, created as a primary row if absent.
    pub fn get_or_create_row(&mut self, table: TableId, action: Action, owner: ObjectId) -> &mut Row {
        let id = self.lookup_or_insert(table, action, owner, RowKind::Primary);
        &mut self.rows[id.0]
    }

    /// Row for `(table, action, owner)` on a secondary table, created if absent.
    pub fn get_or_create_secondary_row(
        &mut self,
        table: TableId,
        action: Action,
        owner: ObjectId,
    ) -> &mut Row {
        let id = self.lookup_or_insert(table, action, owner, RowKind::Secondary);
        &mut self.rows[id.0]
    }

    /// Existing row for `(table, action, owner)`, optionally creating a primary row.
    pub fn get_row(
        &mut self,
        table: TableId,
        action: Action,
        owner: ObjectId,
        create_if_absent: bool,
    ) -> Option<&mut Row> {
        if create_if_absent {
            return Some(self.get_or_create_row(table, action, owner));
        }
        let id = *self.index.get(&(table, action, owner))?;
        Some(&mut self.rows[id.0])
    }

    /// A fresh bulk row. All-row rows are never merged.
    pub fn create_all_rows_row(&mut self, table: TableId, action: Action) -> &mut Row {
        let id = RowId(self.rows.len());
        self.rows
            .push(Row::new(table, action, None, RowKind::AllRows, id.0));
        match action {
            Action::Delete => self.all_row_deletes.push(id),
            Action::Update | Action::Insert => self.all_row_updates.push(id),
        }
        &mut self.rows[id.0]
    }

    fn lookup_or_insert(
        &mut self,
        table: TableId,
        action: Action,
        owner: ObjectId,
        kind: RowKind,
    ) -> RowId {
        if let Some(id) = self.index.get(&(table, action, owner)) {
            return *id;
        }
        let id = RowId(self.rows.len());
        self.rows
            .push(Row::new(table, action, Some(owner), kind, id.0));
        self.index.insert((table, action, owner), id);
        let view = match (kind, action) {
            (RowKind::Secondary, Action::Delete) => &mut self.secondary_deletes,
            (RowKind::Secondary, _) => &mut self.secondary_updates,
            (_, Action::Insert) => &mut self.inserts,
            (_, Action::Update) => &mut self.updates,
            (_, Action::Delete) => &mut self.deletes,
        };
        view.push(id);
        id
    }

    /// Reverse lookup from `(table, action, owner)` to the row id.
    pub fn lookup(&self, table: TableId, action: Action, owner: ObjectId) -> Option<RowId> {
        self.index.get(&(table, action, owner)).copied()
    }

    pub fn row(&self, id: RowId) -> &Row {
        &self.rows[id.0]
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.version_checks.is_empty() && self.custom_operations.is_empty()
    }

    pub fn all_row_deletes(&self) -> &[RowId] {
        &self.all_row_deletes
    }

    pub fn all_row_updates(&self) -> &[RowId] {
        &self.all_row_updates
    }

    pub fn secondary_deletes(&self) -> &[RowId] {
        &self.secondary_deletes
    }

    /// Secondary INSERT and UPDATE rows.
    pub fn secondary_updates(&self) -> &[RowId] {
        &self.secondary_updates
    }

    pub fn inserts(&self) -> &[RowId] {
        &self.inserts
    }

    pub fn updates(&self) -> &[RowId] {
        &self.updates
    }

    pub fn deletes(&self) -> &[RowId] {
        &self.deletes
    }

    /// Mark every row owned by `owner` invalid and drop its buffered work.
    pub fn invalidate_owner(&mut self, owner: ObjectId) {
        for row in self.rows.iter_mut().filter(|r| r.owner() == Some(owner)) {
            row.invalidate();
        }
        self.version_checks.retain(|c| c.owner != owner);
        self.custom_operations.retain(|c| c.owner != owner);
    }

    pub fn add_version_check(&mut self, check: VersionCheck) {
        self.version_checks.push(check);
    }

    pub fn version_checks(&self) -> &[VersionCheck] {
        &self.version_checks
    }

    pub fn add_custom_operation(&mut self, owner: ObjectId, operation: CustomOperation) {
        self.custom_operations.push(PendingCustom { owner, operation });
    }

    pub fn custom_operations(&self) -> &[PendingCustom] {
        &self.custom_operations
    }
}
