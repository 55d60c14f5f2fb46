use std::borrow::Borrow;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod apply;
pub mod pipeline;
pub mod plan;
pub mod read;
pub mod resolve;
pub mod store;
pub mod transform;

#[cfg(test)]
pub(crate) mod memory;

pub use apply::{apply_plan, ApplyReport, RunMode, RunState};
pub use pipeline::{
    probe_connection, resolve_job, run_job, ConnectionReport, JobSpec, RunOptions, RunReport,
    NO_TITLE,
};
pub use plan::{
    build_plan, plan_inserts, ObjectPlan, Plan, SkipReason, SkippedValue, WriteInstruction,
};
pub use read::{read_assertions, read_index, ObjectIndex};
pub use resolve::{resolve_field, resolve_fields, AmbiguityPolicy, ResolvedField};
pub use store::{FieldCandidate, MetadataStore, StoreTransaction};
pub use transform::{extract_leaf, LabelLookup, PathRewrite, RuleKind, TransformRule};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ReconcileError {
    #[error("connectivity error: {0}")]
    Connectivity(String),
    #[error("missing field: no registry entry for {0}")]
    MissingField(FieldSpec),
    #[error("ambiguous field: {field} matches registry ids {candidates:?}")]
    AmbiguousField { field: FieldSpec, candidates: Vec<FieldId> },
    #[error("data anomaly: {value:?} re-extracts to {reextracted:?}")]
    DataAnomaly { value: String, reextracted: String },
    #[error("write conflict: {value:?} already present on {object_id} for field {field_id}")]
    WriteConflict { object_id: ObjectId, field_id: FieldId, value: String },
    #[error("transaction failed at instruction {index}: {message}")]
    Transaction { index: usize, message: String },
    #[error("store error: {0}")]
    Store(String),
    #[error("invalid field spec: {0}")]
    InvalidFieldSpec(String),
}

/// Internal registry identifier of a metadata field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct FieldId(pub i64);

impl Display for FieldId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier of the object an assertion describes. Never inspected,
/// only compared and grouped on.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ObjectId(pub String);

impl ObjectId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ObjectId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Symbolic field name, written `namespace.element[.qualifier]`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct FieldSpec {
    pub namespace: String,
    pub element: String,
    pub qualifier: Option<String>,
}

impl FieldSpec {
    #[must_use]
    pub fn new(namespace: &str, element: &str, qualifier: Option<&str>) -> Self {
        Self {
            namespace: namespace.to_string(),
            element: element.to_string(),
            qualifier: qualifier.map(str::to_string),
        }
    }

    /// Parse `dc.subject` or `local.subject.flat`.
    ///
    /// # Errors
    /// Returns [`ReconcileError::InvalidFieldSpec`] when a component is empty or
    /// the name has fewer than two or more than three components.
    pub fn parse(value: &str) -> Result<Self, ReconcileError> {
        let parts = value.trim().split('.').collect::<Vec<_>>();
        if parts.iter().any(|part| part.trim().is_empty()) {
            return Err(ReconcileError::InvalidFieldSpec(value.to_string()));
        }

        match parts.as_slice() {
            [namespace, element] => Ok(Self::new(namespace, element, None)),
            [namespace, element, qualifier] => Ok(Self::new(namespace, element, Some(qualifier))),
            _ => Err(ReconcileError::InvalidFieldSpec(value.to_string())),
        }
    }
}

impl Display for FieldSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.qualifier {
            Some(qualifier) => write!(f, "{}.{}.{}", self.namespace, self.element, qualifier),
            None => write!(f, "{}.{}", self.namespace, self.element),
        }
    }
}

impl FromStr for FieldSpec {
    type Err = ReconcileError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl TryFrom<String> for FieldSpec {
    type Error = ReconcileError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<FieldSpec> for String {
    fn from(spec: FieldSpec) -> Self {
        spec.to_string()
    }
}

/// One metadata statement: `object_id` has `text_value` for `field_id`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Assertion {
    pub object_id: ObjectId,
    pub field_id: FieldId,
    pub text_value: String,
}

impl Assertion {
    #[must_use]
    pub fn new(object_id: &str, field_id: FieldId, text_value: &str) -> Self {
        Self {
            object_id: ObjectId::new(object_id),
            field_id,
            text_value: text_value.to_string(),
        }
    }
}
