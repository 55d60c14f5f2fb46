//! Query surface the engine consumes from a metadata store.

use serde::{Deserialize, Serialize};

use crate::{Assertion, FieldId, FieldSpec, ObjectId, ReconcileError};

/// One registry row that matched a symbolic field lookup.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FieldCandidate {
    pub field_id: FieldId,
    pub namespace: String,
    pub element: String,
    pub qualifier: Option<String>,
}

/// Read side of the store plus the entry point for a write transaction.
///
/// Reads are point-in-time and take no locks.
pub trait MetadataStore {
    type Transaction<'a>: StoreTransaction
    where
        Self: 'a;

    /// Registry rows matching `spec`: same namespace and element, and either the
    /// same qualifier or a NULL qualifier when `spec` is unqualified.
    ///
    /// # Errors
    /// Returns an error when the registry cannot be queried.
    fn field_candidates(&self, spec: &FieldSpec) -> Result<Vec<FieldCandidate>, ReconcileError>;

    /// Assertions for any of `field_ids`, optionally restricted to one object,
    /// in stable storage order.
    ///
    /// # Errors
    /// Returns an error when the value table cannot be queried.
    fn read_assertions(
        &self,
        field_ids: &[FieldId],
        object_id: Option<&ObjectId>,
    ) -> Result<Vec<Assertion>, ReconcileError>;

    /// # Errors
    /// Returns an error when the value table cannot be queried.
    fn count_assertions(&self) -> Result<u64, ReconcileError>;

    /// Number of assertions whose text equals `value` exactly, store-wide when
    /// `scope` is `None`.
    ///
    /// # Errors
    /// Returns an error when the value table cannot be queried.
    fn count_value_matches(&self, scope: Option<FieldId>, value: &str)
        -> Result<u64, ReconcileError>;

    /// Open the single transaction a live run writes through.
    ///
    /// # Errors
    /// Returns an error when the transaction cannot start.
    fn begin(&mut self) -> Result<Self::Transaction<'_>, ReconcileError>;
}

/// Writes inside one open transaction. Dropping the value without calling
/// [`StoreTransaction::commit`] must roll back.
pub trait StoreTransaction {
    /// Insert one assertion unless an identical `(object, field, value)` row
    /// already exists.
    ///
    /// # Errors
    /// Returns [`ReconcileError::WriteConflict`] when the row already exists, or
    /// another error when the write fails.
    fn insert_assertion(
        &mut self,
        object_id: &ObjectId,
        field_id: FieldId,
        value: &str,
    ) -> Result<(), ReconcileError>;

    /// Replace `old_value` with `new_value` on every exactly-matching row,
    /// store-wide when `scope` is `None`. Returns the number of rows changed.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    fn update_assertion_by_value(
        &mut self,
        scope: Option<FieldId>,
        old_value: &str,
        new_value: &str,
    ) -> Result<u64, ReconcileError>;

    /// # Errors
    /// Returns an error when the commit fails; nothing is persisted.
    fn commit(self) -> Result<(), ReconcileError>;

    /// # Errors
    /// Returns an error when the rollback fails.
    fn rollback(self) -> Result<(), ReconcileError>;
}
