//! Reconciliation planning: what a run would write, computed from one snapshot.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::read::{read_assertions, read_index, ObjectIndex};
use crate::store::MetadataStore;
use crate::transform::{self, DerivedValues, PathRewrite, RuleKind, TransformRule};
use crate::{FieldId, ObjectId, ReconcileError};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WriteInstruction {
    Insert {
        object_id: ObjectId,
        field_id: FieldId,
        value: String,
    },
    Rewrite {
        scope: Option<FieldId>,
        match_value: String,
        replacement: String,
        matched_rows: u64,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    EmptyLeaf,
    DataAnomaly,
    NoLabel,
    TermNotFound,
    DuplicateTerm,
    NoOpRewrite,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SkippedValue {
    pub object_id: Option<ObjectId>,
    pub value: String,
    pub reason: SkipReason,
    pub detail: Option<String>,
}

impl SkippedValue {
    #[must_use]
    pub fn new(
        object_id: Option<&ObjectId>,
        value: &str,
        reason: SkipReason,
        detail: Option<String>,
    ) -> Self {
        Self { object_id: object_id.cloned(), value: value.to_string(), reason, detail }
    }
}

/// Derived values of one object split into already-present and to-insert.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ObjectPlan {
    pub object_id: ObjectId,
    pub display_label: Option<String>,
    pub satisfied: Vec<String>,
    pub pending: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Plan {
    pub rule: RuleKind,
    pub objects: Vec<ObjectPlan>,
    pub instructions: Vec<WriteInstruction>,
    pub skipped: Vec<SkippedValue>,
}

impl Plan {
    #[must_use]
    pub fn empty(rule: RuleKind) -> Self {
        Self { rule, objects: Vec::new(), instructions: Vec::new(), skipped: Vec::new() }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.instructions.len()
    }

    #[must_use]
    pub fn satisfied_count(&self) -> usize {
        self.objects.iter().map(|object| object.satisfied.len()).sum()
    }

    /// `sha256:<hex>` over the serialized instructions. Identical snapshots
    /// give identical fingerprints.
    ///
    /// # Errors
    /// Returns an error when the instructions cannot be serialized.
    pub fn fingerprint(&self) -> Result<String, serde_json::Error> {
        let bytes = serde_json::to_vec(&self.instructions)?;
        let mut hasher = Sha256::new();
        hasher.update(self.rule.as_str().as_bytes());
        hasher.update(&bytes);
        Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
    }

    /// Attach the first value of `display_field` to every object that has
    /// pending writes.
    pub fn attach_display_labels(&mut self, index: &ObjectIndex, display_field: FieldId) {
        for object in &mut self.objects {
            if object.pending.is_empty() {
                continue;
            }
            object.display_label =
                index.values(object.object_id.as_str(), display_field).first().cloned();
        }
    }

    #[must_use]
    pub fn pending_object_ids(&self) -> Vec<ObjectId> {
        self.objects
            .iter()
            .filter(|object| !object.pending.is_empty())
            .map(|object| object.object_id.clone())
            .collect()
    }
}

/// Set difference `derived − existing` per object, on exact string equality.
#[must_use]
pub fn plan_inserts(
    rule: RuleKind,
    target: FieldId,
    derived: &DerivedValues,
    existing: &ObjectIndex,
) -> Plan {
    let mut plan = Plan::empty(rule);

    for (object_id, values) in derived {
        let mut object = ObjectPlan {
            object_id: object_id.clone(),
            display_label: None,
            satisfied: Vec::new(),
            pending: Vec::new(),
        };

        for value in values {
            if existing.contains(object_id.as_str(), target, value) {
                tracing::info!(object = %object_id, value = %value, "already satisfied");
                object.satisfied.push(value.clone());
            } else {
                object.pending.push(value.clone());
                plan.instructions.push(WriteInstruction::Insert {
                    object_id: object_id.clone(),
                    field_id: target,
                    value: value.clone(),
                });
            }
        }

        plan.objects.push(object);
    }

    tracing::info!(
        rule = rule.as_str(),
        objects = plan.objects.len(),
        pending = plan.pending_count(),
        satisfied = plan.satisfied_count(),
        "planned inserts"
    );
    plan
}

/// Plan the store-wide exact-match rewrite. Each leaf is counted against the
/// current snapshot; leaves with no match produce no instruction.
///
/// # Errors
/// Returns the store's error when a match count cannot be read.
pub fn plan_rewrites<S: MetadataStore>(
    store: &S,
    scope: Option<FieldId>,
    entries: &[PathRewrite],
) -> Result<Plan, ReconcileError> {
    let mut plan = Plan::empty(RuleKind::PathRewrite);
    let mut seen = std::collections::BTreeSet::new();

    for entry in entries {
        if entry.leaf == entry.full_path {
            plan.skipped.push(SkippedValue::new(None, &entry.leaf, SkipReason::NoOpRewrite, None));
            continue;
        }

        if let Err(err) = entry.check() {
            tracing::error!(
                term = %entry.leaf,
                path = %entry.full_path,
                error = %err,
                "skipping anomalous rewrite"
            );
            plan.skipped.push(SkippedValue::new(
                None,
                &entry.leaf,
                SkipReason::DataAnomaly,
                Some(err.to_string()),
            ));
            continue;
        }

        if !seen.insert(entry.leaf.clone()) {
            tracing::warn!(
                term = %entry.leaf,
                path = %entry.full_path,
                "term already planned; keeping the first path"
            );
            plan.skipped.push(SkippedValue::new(
                None,
                &entry.leaf,
                SkipReason::DuplicateTerm,
                Some(entry.full_path.clone()),
            ));
            continue;
        }

        let matched_rows = store.count_value_matches(scope, &entry.leaf)?;
        if matched_rows == 0 {
            tracing::info!(term = %entry.leaf, "term not found");
            plan.skipped.push(SkippedValue::new(None, &entry.leaf, SkipReason::TermNotFound, None));
            continue;
        }

        plan.instructions.push(WriteInstruction::Rewrite {
            scope,
            match_value: entry.leaf.clone(),
            replacement: entry.full_path.clone(),
            matched_rows,
        });
    }

    tracing::info!(
        entries = entries.len(),
        pending = plan.pending_count(),
        skipped = plan.skipped.len(),
        "planned rewrites"
    );
    Ok(plan)
}

/// Read, derive, and plan for one resolved rule.
///
/// # Errors
/// Returns the store's error when any snapshot read fails.
pub fn build_plan<S: MetadataStore>(
    store: &S,
    rule: &TransformRule,
    object_id: Option<&ObjectId>,
) -> Result<Plan, ReconcileError> {
    match rule {
        TransformRule::SuffixExtraction { source, target } => {
            let assertions = read_assertions(store, &[*source], object_id)?;
            let (derived, skipped) = transform::derive_leaves(&assertions);
            let existing = read_index(store, &[*target], object_id)?;
            let mut plan = plan_inserts(rule.kind(), *target, &derived, &existing);
            plan.skipped = skipped;
            Ok(plan)
        }
        TransformRule::IdentifierLookup { source, target, lookup } => {
            let assertions = read_assertions(store, &[*source], object_id)?;
            let (derived, skipped) = transform::derive_labels(lookup, &assertions);
            let existing = read_index(store, &[*target], object_id)?;
            let mut plan = plan_inserts(rule.kind(), *target, &derived, &existing);
            plan.skipped = skipped;
            Ok(plan)
        }
        TransformRule::PathRewrite { scope, entries } => plan_rewrites(store, *scope, entries),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::memory::MemoryStore;
    use crate::Assertion;

    fn derived(entries: &[(&str, &[&str])]) -> DerivedValues {
        entries
            .iter()
            .map(|(object, values)| {
                (ObjectId::new(*object), values.iter().map(|value| (*value).to_string()).collect())
            })
            .collect()
    }

    #[test]
    fn planner_emits_exactly_the_set_difference() {
        let derived = derived(&[("a", &["x", "y", "z"]), ("b", &["y"])]);
        let existing = ObjectIndex::from_assertions(vec![
            Assertion::new("a", FieldId(20), "y"),
            Assertion::new("b", FieldId(20), "q"),
            Assertion::new("b", FieldId(99), "y"),
        ]);

        let plan = plan_inserts(RuleKind::SuffixExtraction, FieldId(20), &derived, &existing);

        let inserts = plan
            .instructions
            .iter()
            .map(|instruction| match instruction {
                WriteInstruction::Insert { object_id, value, .. } => {
                    (object_id.to_string(), value.clone())
                }
                WriteInstruction::Rewrite { .. } => panic!("unexpected rewrite"),
            })
            .collect::<Vec<_>>();
        assert_eq!(
            inserts,
            vec![
                ("a".to_string(), "x".to_string()),
                ("a".to_string(), "z".to_string()),
                ("b".to_string(), "y".to_string()),
            ]
        );
        assert_eq!(plan.objects[0].satisfied, vec!["y".to_string()]);
        assert_eq!(plan.satisfied_count(), 1);
    }

    proptest! {
        #[test]
        fn property_plan_inserts_exactly_derived_minus_existing(
            derived_pairs in proptest::collection::vec(("o[1-3]", "[a-d]"), 0..12),
            existing_pairs in proptest::collection::vec(
                ("o[1-3]", "[a-d]", proptest::bool::ANY),
                0..12,
            ),
        ) {
            let mut derived = DerivedValues::new();
            for (object, value) in &derived_pairs {
                let values = derived.entry(ObjectId::new(object.as_str())).or_default();
                if !values.contains(value) {
                    values.push(value.clone());
                }
            }
            let on_target = |object: &str, value: &str| {
                existing_pairs
                    .iter()
                    .any(|(o, v, target)| *target && o.as_str() == object && v.as_str() == value)
            };
            let existing = ObjectIndex::from_assertions(existing_pairs.iter().map(
                |(object, value, target)| {
                    let field_id = if *target { FieldId(20) } else { FieldId(99) };
                    Assertion::new(object.as_str(), field_id, value.as_str())
                },
            ));

            let plan = plan_inserts(RuleKind::SuffixExtraction, FieldId(20), &derived, &existing);

            let mut expected = Vec::new();
            for (object_id, values) in &derived {
                let pending = values
                    .iter()
                    .filter(|value| !on_target(object_id.as_str(), value.as_str()));
                for value in pending {
                    expected.push(WriteInstruction::Insert {
                        object_id: object_id.clone(),
                        field_id: FieldId(20),
                        value: value.clone(),
                    });
                }
            }
            prop_assert_eq!(&plan.instructions, &expected);

            let total = derived.values().map(Vec::len).sum::<usize>();
            prop_assert_eq!(plan.pending_count() + plan.satisfied_count(), total);
            for object in &plan.objects {
                for value in &object.satisfied {
                    prop_assert!(on_target(object.object_id.as_str(), value.as_str()));
                }
            }
        }
    }

    #[test]
    fn identical_snapshots_give_identical_fingerprints() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStore::default()
            .with_row("o2", 10, "P::Q")
            .with_row("o1", 10, "A::B")
            .with_row("o1", 10, "C::B");
        let rule = TransformRule::SuffixExtraction { source: FieldId(10), target: FieldId(20) };

        let first = build_plan(&store, &rule, None)?;
        let second = build_plan(&store, &rule, None)?;

        assert_eq!(first, second);
        assert_eq!(first.fingerprint()?, second.fingerprint()?);
        assert_eq!(first.pending_count(), 2);
        Ok(())
    }

    #[test]
    fn rewrite_plan_skips_missing_duplicate_and_anomalous_terms() -> Result<(), ReconcileError> {
        let store = MemoryStore::default()
            .with_row("o1", 10, "Leaf")
            .with_row("o2", 11, "Leaf")
            .with_row("o3", 10, "Other");
        let entries = vec![
            PathRewrite::new("Leaf", "Root::Leaf"),
            PathRewrite::new("Leaf", "Elsewhere::Leaf"),
            PathRewrite::new("Missing", "Root::Missing"),
            PathRewrite::new("Other", "Root::Different"),
            PathRewrite::new("Root", "Root"),
        ];

        let plan = plan_rewrites(&store, None, &entries)?;

        assert_eq!(
            plan.instructions,
            vec![WriteInstruction::Rewrite {
                scope: None,
                match_value: "Leaf".to_string(),
                replacement: "Root::Leaf".to_string(),
                matched_rows: 2,
            }]
        );
        let reasons = plan.skipped.iter().map(|skip| skip.reason).collect::<Vec<_>>();
        assert_eq!(
            reasons,
            vec![
                SkipReason::DuplicateTerm,
                SkipReason::TermNotFound,
                SkipReason::DataAnomaly,
                SkipReason::NoOpRewrite,
            ]
        );
        Ok(())
    }

    #[test]
    fn scoped_rewrite_counts_only_the_scoped_field() -> Result<(), ReconcileError> {
        let store = MemoryStore::default().with_row("o1", 10, "Leaf").with_row("o2", 11, "Leaf");
        let plan =
            plan_rewrites(&store, Some(FieldId(11)), &[PathRewrite::new("Leaf", "Root::Leaf")])?;
        assert!(matches!(
            plan.instructions.as_slice(),
            [WriteInstruction::Rewrite { matched_rows: 1, scope: Some(FieldId(11)), .. }]
        ));
        Ok(())
    }
}
