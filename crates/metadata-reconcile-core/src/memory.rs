//! In-memory store used by the engine's unit tests.

use crate::store::{FieldCandidate, MetadataStore, StoreTransaction};
use crate::{Assertion, FieldId, FieldSpec, ObjectId, ReconcileError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Row {
    pub object_id: ObjectId,
    pub field_id: FieldId,
    pub text_value: String,
}

#[derive(Debug, Default)]
pub(crate) struct MemoryStore {
    pub registry: Vec<FieldCandidate>,
    pub rows: Vec<Row>,
    /// Inserting or rewriting to this value fails the write.
    pub poison_value: Option<String>,
    pub begun: usize,
}

impl MemoryStore {
    pub fn with_field(mut self, field_id: i64, spec: &str) -> Self {
        let parsed = FieldSpec::parse(spec).unwrap_or_else(|err| panic!("bad spec {spec}: {err}"));
        self.registry.push(FieldCandidate {
            field_id: FieldId(field_id),
            namespace: parsed.namespace,
            element: parsed.element,
            qualifier: parsed.qualifier,
        });
        self
    }

    pub fn with_row(mut self, object_id: &str, field_id: i64, value: &str) -> Self {
        self.rows.push(Row {
            object_id: ObjectId::new(object_id),
            field_id: FieldId(field_id),
            text_value: value.to_string(),
        });
        self
    }

    pub fn values(&self, object_id: &str, field_id: i64) -> Vec<String> {
        self.rows
            .iter()
            .filter(|row| row.object_id.as_str() == object_id && row.field_id == FieldId(field_id))
            .map(|row| row.text_value.clone())
            .collect()
    }
}

pub(crate) struct MemoryTransaction<'a> {
    store: &'a mut MemoryStore,
    staged: Vec<Row>,
}

impl MetadataStore for MemoryStore {
    type Transaction<'a> = MemoryTransaction<'a>;

    fn field_candidates(&self, spec: &FieldSpec) -> Result<Vec<FieldCandidate>, ReconcileError> {
        Ok(self
            .registry
            .iter()
            .filter(|candidate| {
                candidate.namespace == spec.namespace
                    && candidate.element == spec.element
                    && candidate.qualifier == spec.qualifier
            })
            .cloned()
            .collect())
    }

    fn read_assertions(
        &self,
        field_ids: &[FieldId],
        object_id: Option<&ObjectId>,
    ) -> Result<Vec<Assertion>, ReconcileError> {
        Ok(self
            .rows
            .iter()
            .filter(|row| field_ids.contains(&row.field_id))
            .filter(|row| object_id.map_or(true, |object| &row.object_id == object))
            .map(|row| Assertion {
                object_id: row.object_id.clone(),
                field_id: row.field_id,
                text_value: row.text_value.clone(),
            })
            .collect())
    }

    fn count_assertions(&self) -> Result<u64, ReconcileError> {
        Ok(self.rows.len() as u64)
    }

    fn count_value_matches(
        &self,
        scope: Option<FieldId>,
        value: &str,
    ) -> Result<u64, ReconcileError> {
        Ok(self
            .rows
            .iter()
            .filter(|row| scope.map_or(true, |field| row.field_id == field))
            .filter(|row| row.text_value == value)
            .count() as u64)
    }

    fn begin(&mut self) -> Result<Self::Transaction<'_>, ReconcileError> {
        self.begun += 1;
        let staged = self.rows.clone();
        Ok(MemoryTransaction { store: self, staged })
    }
}

impl MemoryTransaction<'_> {
    fn check_poison(&self, value: &str) -> Result<(), ReconcileError> {
        if self.store.poison_value.as_deref() == Some(value) {
            return Err(ReconcileError::Store(format!("forced failure writing {value:?}")));
        }
        Ok(())
    }
}

impl StoreTransaction for MemoryTransaction<'_> {
    fn insert_assertion(
        &mut self,
        object_id: &ObjectId,
        field_id: FieldId,
        value: &str,
    ) -> Result<(), ReconcileError> {
        self.check_poison(value)?;
        let row = Row { object_id: object_id.clone(), field_id, text_value: value.to_string() };
        if self.staged.contains(&row) {
            return Err(ReconcileError::WriteConflict {
                object_id: object_id.clone(),
                field_id,
                value: value.to_string(),
            });
        }
        self.staged.push(row);
        Ok(())
    }

    fn update_assertion_by_value(
        &mut self,
        scope: Option<FieldId>,
        old_value: &str,
        new_value: &str,
    ) -> Result<u64, ReconcileError> {
        self.check_poison(new_value)?;
        let mut changed = 0;
        for row in &mut self.staged {
            if scope.map_or(true, |field| row.field_id == field) && row.text_value == old_value {
                row.text_value = new_value.to_string();
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn commit(self) -> Result<(), ReconcileError> {
        self.store.rows = self.staged;
        Ok(())
    }

    fn rollback(self) -> Result<(), ReconcileError> {
        Ok(())
    }
}
