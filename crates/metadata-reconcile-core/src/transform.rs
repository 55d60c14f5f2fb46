//! Value derivation rules.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::plan::{SkipReason, SkippedValue};
use crate::read::ObjectIndex;
use crate::{Assertion, FieldId, ObjectId, ReconcileError};

pub const PATH_SEPARATOR: &str = "::";
pub const IDENTIFIER_SEPARATOR: char = ',';
pub const LABEL_SEPARATOR: &str = ";";

/// Derived values per object, first-encounter order, no duplicates.
pub type DerivedValues = BTreeMap<ObjectId, Vec<String>>;

/// Final component of a `::` path. Components are trimmed and empty ones
/// ignored; `None` when nothing is left.
#[must_use]
pub fn extract_leaf(raw: &str) -> Option<String> {
    raw.rsplit(PATH_SEPARATOR)
        .map(str::trim)
        .find(|component| !component.is_empty())
        .map(str::to_string)
}

/// A leaf must extract to itself.
///
/// # Errors
/// Returns [`ReconcileError::DataAnomaly`] when re-extraction changes `leaf`.
pub fn check_leaf(leaf: &str) -> Result<(), ReconcileError> {
    match extract_leaf(leaf) {
        Some(reextracted) if reextracted == leaf => Ok(()),
        other => Err(ReconcileError::DataAnomaly {
            value: leaf.to_string(),
            reextracted: other.unwrap_or_default(),
        }),
    }
}

/// Identifier to label table built from a multi-field snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelLookup {
    label_fields: Vec<FieldId>,
    index: ObjectIndex,
}

impl LabelLookup {
    /// `label_fields` is the precedence order: the first field holding a value
    /// for an identifier supplies its label.
    #[must_use]
    pub fn new(label_fields: Vec<FieldId>, index: ObjectIndex) -> Self {
        Self { label_fields, index }
    }

    #[must_use]
    pub fn label_fields(&self) -> &[FieldId] {
        &self.label_fields
    }

    #[must_use]
    pub fn label_for(&self, identifier: &str) -> Option<&str> {
        self.label_fields
            .iter()
            .find_map(|field_id| self.index.values(identifier, *field_id).first())
            .map(String::as_str)
    }

    /// Known to the snapshot through some field, yet holding no label value.
    #[must_use]
    pub fn is_unlabelled(&self, identifier: &str) -> bool {
        self.index.contains_object(identifier) && self.label_for(identifier).is_none()
    }

    /// Identifiers of `cell` that are known objects without a label.
    #[must_use]
    pub fn unlabelled_in(&self, cell: &str) -> Vec<String> {
        cell.split(IDENTIFIER_SEPARATOR)
            .map(str::trim)
            .filter(|identifier| self.is_unlabelled(identifier))
            .map(str::to_string)
            .collect()
    }

    /// Map a comma-separated cell of identifiers to a semicolon-separated cell
    /// of labels. Unmapped identifiers are kept verbatim.
    #[must_use]
    pub fn map_cell(&self, cell: &str) -> String {
        self.map_cell_counted(cell).0
    }

    /// Like [`LabelLookup::map_cell`], also returning how many identifiers
    /// were replaced by a label.
    #[must_use]
    pub fn map_cell_counted(&self, cell: &str) -> (String, usize) {
        let mut mapped = 0;
        let values = cell
            .split(IDENTIFIER_SEPARATOR)
            .map(str::trim)
            .map(|identifier| match self.label_for(identifier) {
                Some(label) => {
                    mapped += 1;
                    label.to_string()
                }
                None => {
                    if self.index.contains_object(identifier) {
                        tracing::info!(identifier, "identifier has no title");
                    }
                    identifier.to_string()
                }
            })
            .collect::<Vec<_>>();
        (values.join(LABEL_SEPARATOR), mapped)
    }
}

/// Replace every assertion exactly equal to `leaf` with `full_path`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PathRewrite {
    pub leaf: String,
    pub full_path: String,
}

impl PathRewrite {
    #[must_use]
    pub fn new(leaf: &str, full_path: &str) -> Self {
        Self { leaf: leaf.to_string(), full_path: full_path.to_string() }
    }

    /// The leaf must be a fixed point and must be what `full_path` extracts to.
    ///
    /// # Errors
    /// Returns [`ReconcileError::DataAnomaly`] when either check fails.
    pub fn check(&self) -> Result<(), ReconcileError> {
        check_leaf(&self.leaf)?;
        match extract_leaf(&self.full_path) {
            Some(leaf) if leaf == self.leaf => Ok(()),
            other => Err(ReconcileError::DataAnomaly {
                value: self.full_path.clone(),
                reextracted: other.unwrap_or_default(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    SuffixExtraction,
    IdentifierLookup,
    PathRewrite,
}

impl RuleKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SuffixExtraction => "suffix_extraction",
            Self::IdentifierLookup => "identifier_lookup",
            Self::PathRewrite => "path_rewrite",
        }
    }
}

/// A resolved rule with the field ids it reads and writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformRule {
    /// Copy the leaf of each `source` path into `target`.
    SuffixExtraction { source: FieldId, target: FieldId },
    /// Copy the labels of the identifiers held in `source` into `target`.
    IdentifierLookup { source: FieldId, target: FieldId, lookup: LabelLookup },
    /// Rewrite leaf terms to full paths in place. Matches on text alone, across
    /// all objects, restricted to `scope` when set.
    PathRewrite { scope: Option<FieldId>, entries: Vec<PathRewrite> },
}

impl TransformRule {
    #[must_use]
    pub fn kind(&self) -> RuleKind {
        match self {
            Self::SuffixExtraction { .. } => RuleKind::SuffixExtraction,
            Self::IdentifierLookup { .. } => RuleKind::IdentifierLookup,
            Self::PathRewrite { .. } => RuleKind::PathRewrite,
        }
    }
}

fn push_unique(derived: &mut DerivedValues, object_id: &ObjectId, value: String) {
    let values = derived.entry(object_id.clone()).or_default();
    if !values.contains(&value) {
        values.push(value);
    }
}

/// Leaf of every source assertion, skipping empty and anomalous leaves.
#[must_use]
pub fn derive_leaves(source: &[Assertion]) -> (DerivedValues, Vec<SkippedValue>) {
    let mut derived = DerivedValues::new();
    let mut skipped = Vec::new();

    for assertion in source {
        let Some(leaf) = extract_leaf(&assertion.text_value) else {
            tracing::warn!(
                object = %assertion.object_id,
                value = %assertion.text_value,
                "empty leaf; skipping"
            );
            skipped.push(SkippedValue::new(
                Some(&assertion.object_id),
                &assertion.text_value,
                SkipReason::EmptyLeaf,
                None,
            ));
            continue;
        };

        if let Err(err) = check_leaf(&leaf) {
            tracing::error!(object = %assertion.object_id, error = %err, "skipping anomalous leaf");
            skipped.push(SkippedValue::new(
                Some(&assertion.object_id),
                &leaf,
                SkipReason::DataAnomaly,
                Some(err.to_string()),
            ));
            continue;
        }

        push_unique(&mut derived, &assertion.object_id, leaf);
    }

    (derived, skipped)
}

/// Mapped label cell of every source assertion. Cells where no identifier
/// maps to a label are skipped rather than copied verbatim.
#[must_use]
pub fn derive_labels(
    lookup: &LabelLookup,
    source: &[Assertion],
) -> (DerivedValues, Vec<SkippedValue>) {
    let mut derived = DerivedValues::new();
    let mut skipped = Vec::new();

    for assertion in source {
        let (cell, mapped) = lookup.map_cell_counted(&assertion.text_value);
        if mapped == 0 {
            tracing::info!(
                object = %assertion.object_id,
                value = %assertion.text_value,
                "no label found; skipping"
            );
            let unlabelled = lookup.unlabelled_in(&assertion.text_value);
            let detail = (!unlabelled.is_empty())
                .then(|| format!("known without label: {}", unlabelled.join(", ")));
            skipped.push(SkippedValue::new(
                Some(&assertion.object_id),
                &assertion.text_value,
                SkipReason::NoLabel,
                detail,
            ));
            continue;
        }
        push_unique(&mut derived, &assertion.object_id, cell);
    }

    (derived, skipped)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn lookup_fixture() -> LabelLookup {
        let index = ObjectIndex::from_assertions(vec![
            Assertion::new("u1", FieldId(73), "Title A"),
            Assertion::new("u3", FieldId(211), "Org Unit C"),
            Assertion::new("u4", FieldId(73), "Title D"),
            Assertion::new("u4", FieldId(211), "Org Unit D"),
            Assertion::new("u5", FieldId(7), "unrelated"),
        ]);
        LabelLookup::new(vec![FieldId(73), FieldId(211)], index)
    }

    #[test]
    fn leaf_is_last_trimmed_component() {
        assert_eq!(extract_leaf("A::B::C").as_deref(), Some("C"));
        assert_eq!(extract_leaf("  Top :: Mid ::  Leaf  ").as_deref(), Some("Leaf"));
        assert_eq!(extract_leaf("  Plain term ").as_deref(), Some("Plain term"));
        assert_eq!(extract_leaf("A::B::").as_deref(), Some("B"));
        assert_eq!(extract_leaf("   "), None);
        assert_eq!(extract_leaf(":: ::"), None);
    }

    #[test]
    fn check_leaf_flags_values_that_are_not_fixed_points() {
        assert!(check_leaf("Leaf").is_ok());
        assert_eq!(
            check_leaf(" Leaf"),
            Err(ReconcileError::DataAnomaly {
                value: " Leaf".to_string(),
                reextracted: "Leaf".to_string()
            })
        );
        assert!(matches!(check_leaf("A::B"), Err(ReconcileError::DataAnomaly { .. })));
    }

    #[test]
    fn lookup_maps_known_identifiers_and_passes_unknown_through() {
        let index =
            ObjectIndex::from_assertions(vec![Assertion::new("u1", FieldId(73), "Title A")]);
        let lookup = LabelLookup::new(vec![FieldId(73)], index);
        assert_eq!(lookup.map_cell("u1,u2"), "Title A;u2");
    }

    #[test]
    fn lookup_uses_fallback_field_only_when_primary_is_absent() {
        let lookup = lookup_fixture();
        assert_eq!(lookup.label_for("u3"), Some("Org Unit C"));
        assert_eq!(lookup.label_for("u4"), Some("Title D"));
        assert_eq!(lookup.label_for("u5"), None);
        assert_eq!(
            lookup.map_cell_counted(" u4 , u5,u3"),
            ("Title D;u5;Org Unit C".to_string(), 2)
        );
    }

    #[test]
    fn derive_leaves_dedups_per_object_and_skips_empty_values() {
        let source = vec![
            Assertion::new("obj1", FieldId(10), "A::B::C"),
            Assertion::new("obj1", FieldId(10), "X::C"),
            Assertion::new("obj1", FieldId(10), "A::D"),
            Assertion::new("obj2", FieldId(10), " :: "),
        ];

        let (derived, skipped) = derive_leaves(&source);

        assert_eq!(derived.len(), 1);
        assert_eq!(derived[&ObjectId::new("obj1")], vec!["C".to_string(), "D".to_string()]);
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].reason, SkipReason::EmptyLeaf);
    }

    #[test]
    fn derive_labels_skips_cells_without_any_label() {
        let source = vec![
            Assertion::new("pub1", FieldId(300), "u1,u9"),
            Assertion::new("pub2", FieldId(300), "u9"),
        ];

        let (derived, skipped) = derive_labels(&lookup_fixture(), &source);

        assert_eq!(derived[&ObjectId::new("pub1")], vec!["Title A;u9".to_string()]);
        assert!(!derived.contains_key("pub2"));
        assert_eq!(skipped[0].reason, SkipReason::NoLabel);
        assert_eq!(skipped[0].detail, None);
    }

    #[test]
    fn objects_known_only_through_other_fields_are_reported_unlabelled() {
        let lookup = lookup_fixture();
        assert!(lookup.is_unlabelled("u5"));
        assert!(!lookup.is_unlabelled("u1"));
        assert!(!lookup.is_unlabelled("u9"));
        assert_eq!(lookup.unlabelled_in("u9, u5,u1"), vec!["u5".to_string()]);

        let source = vec![Assertion::new("pub1", FieldId(300), "u5,u9")];
        let (derived, skipped) = derive_labels(&lookup, &source);

        assert!(derived.is_empty());
        assert_eq!(skipped[0].detail.as_deref(), Some("known without label: u5"));
    }

    fn component() -> impl Strategy<Value = String> {
        "[A-Za-z0-9 ]{0,8}[A-Za-z0-9][A-Za-z0-9 ]{0,8}"
    }

    proptest! {
        #[test]
        fn property_leaf_is_trimmed_text_after_last_separator(
            head in proptest::collection::vec(component(), 1..5),
            last in component(),
        ) {
            let path = format!("{}{PATH_SEPARATOR}{last}", head.join(PATH_SEPARATOR));
            prop_assert_eq!(extract_leaf(&path), Some(last.trim().to_string()));
        }

        #[test]
        fn property_value_without_separator_is_trimmed_whole(value in component()) {
            prop_assert_eq!(extract_leaf(&value), Some(value.trim().to_string()));
        }

        #[test]
        fn property_extracted_leaf_is_a_fixed_point(path in "[A-Za-z:  ]{1,40}") {
            if let Some(leaf) = extract_leaf(&path) {
                prop_assert!(check_leaf(&leaf).is_ok());
            }
        }
    }
}
