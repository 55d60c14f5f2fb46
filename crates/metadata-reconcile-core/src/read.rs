use std::collections::BTreeMap;

use crate::store::MetadataStore;
use crate::{Assertion, FieldId, ObjectId, ReconcileError};

/// Snapshot of assertions grouped as `object -> field -> [values]`.
///
/// Objects iterate in sorted order; values keep the order the store returned
/// them in, duplicates included.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectIndex {
    objects: BTreeMap<ObjectId, BTreeMap<FieldId, Vec<String>>>,
}

impl ObjectIndex {
    #[must_use]
    pub fn from_assertions<I>(assertions: I) -> Self
    where
        I: IntoIterator<Item = Assertion>,
    {
        let mut objects: BTreeMap<ObjectId, BTreeMap<FieldId, Vec<String>>> = BTreeMap::new();
        for assertion in assertions {
            objects
                .entry(assertion.object_id)
                .or_default()
                .entry(assertion.field_id)
                .or_default()
                .push(assertion.text_value);
        }
        Self { objects }
    }

    #[must_use]
    pub fn values(&self, object_id: &str, field_id: FieldId) -> &[String] {
        self.objects
            .get(object_id)
            .and_then(|fields| fields.get(&field_id))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    #[must_use]
    pub fn contains(&self, object_id: &str, field_id: FieldId, value: &str) -> bool {
        self.values(object_id, field_id).iter().any(|existing| existing == value)
    }

    #[must_use]
    pub fn contains_object(&self, object_id: &str) -> bool {
        self.objects.contains_key(object_id)
    }

    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// Point-in-time read of every assertion for `field_ids`.
///
/// # Errors
/// Returns the store's error when the read fails.
pub fn read_assertions<S: MetadataStore>(
    store: &S,
    field_ids: &[FieldId],
    object_id: Option<&ObjectId>,
) -> Result<Vec<Assertion>, ReconcileError> {
    let assertions = store.read_assertions(field_ids, object_id)?;
    tracing::info!(
        fields = ?field_ids,
        object = object_id.map(ObjectId::as_str),
        count = assertions.len(),
        "read assertions"
    );
    Ok(assertions)
}

/// Read and group assertions for several fields in one pass.
///
/// # Errors
/// Returns the store's error when the read fails.
pub fn read_index<S: MetadataStore>(
    store: &S,
    field_ids: &[FieldId],
    object_id: Option<&ObjectId>,
) -> Result<ObjectIndex, ReconcileError> {
    let assertions = read_assertions(store, field_ids, object_id)?;
    Ok(ObjectIndex::from_assertions(assertions))
}
