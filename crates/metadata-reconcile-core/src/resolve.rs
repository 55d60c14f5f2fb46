use serde::{Deserialize, Serialize};

use crate::store::MetadataStore;
use crate::{FieldId, FieldSpec, ReconcileError};

/// What to do when a symbolic name matches more than one registry row.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum AmbiguityPolicy {
    /// Take the lowest registry id and log a warning.
    #[default]
    FirstMatch,
    /// Fail the run with [`ReconcileError::AmbiguousField`].
    Strict,
}

impl AmbiguityPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FirstMatch => "first-match",
            Self::Strict => "strict",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "first-match" => Some(Self::FirstMatch),
            "strict" => Some(Self::Strict),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ResolvedField {
    pub spec: FieldSpec,
    pub field_id: FieldId,
}

/// Resolve one symbolic field to its registry id.
///
/// # Errors
/// Returns [`ReconcileError::MissingField`] when no row matches,
/// [`ReconcileError::AmbiguousField`] when several match under
/// [`AmbiguityPolicy::Strict`], or the store's error when the lookup fails.
pub fn resolve_field<S: MetadataStore>(
    store: &S,
    spec: &FieldSpec,
    policy: AmbiguityPolicy,
) -> Result<FieldId, ReconcileError> {
    let mut candidates = store.field_candidates(spec)?;
    candidates.sort_by_key(|candidate| candidate.field_id);

    match candidates.as_slice() {
        [] => Err(ReconcileError::MissingField(spec.clone())),
        [only] => Ok(only.field_id),
        [first, ..] => {
            let ids = candidates.iter().map(|candidate| candidate.field_id).collect::<Vec<_>>();
            match policy {
                AmbiguityPolicy::FirstMatch => {
                    tracing::warn!(
                        field = %spec,
                        candidates = ?ids,
                        chosen = %first.field_id,
                        "multiple registry rows match field; using the first"
                    );
                    Ok(first.field_id)
                }
                AmbiguityPolicy::Strict => {
                    Err(ReconcileError::AmbiguousField { field: spec.clone(), candidates: ids })
                }
            }
        }
    }
}

/// Resolve every field a run needs. Nothing is returned unless all resolve.
///
/// # Errors
/// Returns the first resolution failure after logging every unresolved field.
pub fn resolve_fields<S: MetadataStore>(
    store: &S,
    specs: &[FieldSpec],
    policy: AmbiguityPolicy,
) -> Result<Vec<ResolvedField>, ReconcileError> {
    let mut resolved = Vec::with_capacity(specs.len());
    let mut first_error = None;

    for spec in specs {
        match resolve_field(store, spec, policy) {
            Ok(field_id) => {
                tracing::info!(field = %spec, field_id = %field_id, "resolved field");
                resolved.push(ResolvedField { spec: spec.clone(), field_id });
            }
            Err(err) => {
                tracing::error!(field = %spec, error = %err, "could not resolve field");
                first_error.get_or_insert(err);
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(resolved),
    }
}
