//! One reconciliation run: resolve, snapshot, plan, then apply or report.

use serde::{Deserialize, Serialize};

use crate::apply::{apply_plan, ApplyReport, RunMode};
use crate::plan::{build_plan, Plan};
use crate::read::read_index;
use crate::resolve::{resolve_field, resolve_fields, AmbiguityPolicy, ResolvedField};
use crate::store::MetadataStore;
use crate::transform::{LabelLookup, PathRewrite, RuleKind, TransformRule};
use crate::{FieldId, FieldSpec, ObjectId, ReconcileError};

/// A rule named by symbolic fields, before registry resolution.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum JobSpec {
    Flatten { source: FieldSpec, target: FieldSpec },
    LabelIdentifiers {
        source: FieldSpec,
        target: FieldSpec,
        label_fields: Vec<FieldSpec>,
        /// Fields that identify objects without labelling them.
        #[serde(default)]
        known_fields: Vec<FieldSpec>,
    },
    RewritePaths { scope: Option<FieldSpec>, entries: Vec<PathRewrite> },
}

impl JobSpec {
    #[must_use]
    pub fn kind(&self) -> RuleKind {
        match self {
            Self::Flatten { .. } => RuleKind::SuffixExtraction,
            Self::LabelIdentifiers { .. } => RuleKind::IdentifierLookup,
            Self::RewritePaths { .. } => RuleKind::PathRewrite,
        }
    }

    /// Every field the job touches, in resolution order.
    #[must_use]
    pub fn field_specs(&self) -> Vec<FieldSpec> {
        match self {
            Self::Flatten { source, target } => vec![source.clone(), target.clone()],
            Self::LabelIdentifiers { source, target, label_fields, known_fields } => {
                let mut specs = vec![source.clone(), target.clone()];
                specs.extend(label_fields.iter().cloned());
                specs.extend(known_fields.iter().cloned());
                specs
            }
            Self::RewritePaths { scope, .. } => scope.iter().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct RunOptions {
    pub mode: RunMode,
    pub policy: AmbiguityPolicy,
    /// Restrict reads and writes to one object.
    pub object: Option<ObjectId>,
    /// Field whose first value labels objects in the report.
    pub display_field: Option<FieldSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunReport {
    pub rule: RuleKind,
    pub resolved: Vec<ResolvedField>,
    pub plan: Plan,
    pub apply: ApplyReport,
}

/// Label shown for objects without a display value.
pub const NO_TITLE: &str = "No Title Found";

fn id_at(resolved: &[ResolvedField], position: usize) -> Result<FieldId, ReconcileError> {
    resolved
        .get(position)
        .map(|field| field.field_id)
        .ok_or_else(|| ReconcileError::Store(format!("field {position} was not resolved")))
}

/// Resolve every field of `job` and build the concrete rule.
///
/// The identifier lookup table is read here, across all objects, since the
/// referenced objects are generally not the ones being updated. Known fields
/// are read with the label fields so that objects lacking every label are
/// still recognised.
///
/// # Errors
/// Returns the first resolution error, or the store's error when the lookup
/// snapshot cannot be read.
pub fn resolve_job<S: MetadataStore>(
    store: &S,
    job: &JobSpec,
    policy: AmbiguityPolicy,
) -> Result<(TransformRule, Vec<ResolvedField>), ReconcileError> {
    let resolved = resolve_fields(store, &job.field_specs(), policy)?;

    let rule = match job {
        JobSpec::Flatten { .. } => TransformRule::SuffixExtraction {
            source: id_at(&resolved, 0)?,
            target: id_at(&resolved, 1)?,
        },
        JobSpec::LabelIdentifiers { label_fields, .. } => {
            let indexed = resolved.iter().skip(2).map(|field| field.field_id).collect::<Vec<_>>();
            let index = read_index(store, &indexed, None)?;
            let label_fields = indexed.iter().take(label_fields.len()).copied().collect();
            TransformRule::IdentifierLookup {
                source: id_at(&resolved, 0)?,
                target: id_at(&resolved, 1)?,
                lookup: LabelLookup::new(label_fields, index),
            }
        }
        JobSpec::RewritePaths { scope, entries } => TransformRule::PathRewrite {
            scope: if scope.is_some() { Some(id_at(&resolved, 0)?) } else { None },
            entries: entries.clone(),
        },
    };

    Ok((rule, resolved))
}

/// Run `job` end to end.
///
/// # Errors
/// Returns a resolution error before anything is read, a store error when a
/// snapshot cannot be taken, or [`ReconcileError::Transaction`] when the
/// apply phase rolls back.
pub fn run_job<S: MetadataStore>(
    store: &mut S,
    job: &JobSpec,
    options: &RunOptions,
) -> Result<RunReport, ReconcileError> {
    tracing::info!(
        rule = job.kind().as_str(),
        mode = options.mode.as_str(),
        object = options.object.as_ref().map(ObjectId::as_str),
        "starting run"
    );

    let display_field = match &options.display_field {
        Some(spec) if job.kind() != RuleKind::PathRewrite => {
            Some(resolve_field(store, spec, options.policy)?)
        }
        _ => None,
    };

    let (rule, resolved) = resolve_job(store, job, options.policy)?;
    let mut plan = build_plan(store, &rule, options.object.as_ref())?;

    if let Some(display_id) = display_field {
        if !plan.pending_object_ids().is_empty() {
            let index = read_index(store, &[display_id], options.object.as_ref())?;
            plan.attach_display_labels(&index, display_id);
        }
        for object in plan.objects.iter().filter(|object| !object.pending.is_empty()) {
            tracing::info!(
                object = %object.object_id,
                label = object.display_label.as_deref().unwrap_or(NO_TITLE),
                pending = ?object.pending,
                "object has pending values"
            );
        }
    }

    let apply = apply_plan(store, &plan, options.mode)?;
    Ok(RunReport { rule: rule.kind(), resolved, plan, apply })
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConnectionReport {
    pub assertion_count: u64,
    pub sample_term: Option<String>,
    pub sample_term_matches: Option<u64>,
}

/// Confirm the store answers a trivial query and, optionally, how often a
/// sample term occurs.
///
/// # Errors
/// Returns [`ReconcileError::Connectivity`] when either query fails.
pub fn probe_connection<S: MetadataStore>(
    store: &S,
    sample_term: Option<&str>,
) -> Result<ConnectionReport, ReconcileError> {
    let assertion_count =
        store.count_assertions().map_err(|err| ReconcileError::Connectivity(err.to_string()))?;
    let sample_term_matches = sample_term
        .map(|term| store.count_value_matches(None, term))
        .transpose()
        .map_err(|err| ReconcileError::Connectivity(err.to_string()))?;

    tracing::info!(
        assertions = assertion_count,
        sample_term,
        matches = sample_term_matches,
        "connection ok"
    );
    Ok(ConnectionReport {
        assertion_count,
        sample_term: sample_term.map(str::to_string),
        sample_term_matches,
    })
}
