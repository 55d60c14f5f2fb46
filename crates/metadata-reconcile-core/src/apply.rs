//! Executes a plan: report-only in dry-run mode, one all-or-nothing
//! transaction in apply mode.

use serde::{Deserialize, Serialize};

use crate::plan::{Plan, WriteInstruction};
use crate::store::{MetadataStore, StoreTransaction};
use crate::ReconcileError;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    DryRun,
    #[default]
    Apply,
}

impl RunMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DryRun => "dry-run",
            Self::Apply => "apply",
        }
    }
}

/// `Planned -> Reported` for dry runs;
/// `Planned -> Applying -> Committed | Failed -> RolledBack` for live runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Planned,
    Reported,
    Applying,
    Committed,
    Failed,
    RolledBack,
}

impl RunState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Reported => "reported",
            Self::Applying => "applying",
            Self::Committed => "committed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Reported | Self::Committed | Self::RolledBack)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ApplyReport {
    pub mode: RunMode,
    pub state: RunState,
    pub executed: usize,
    pub inserted: usize,
    pub already_satisfied: usize,
    pub rows_rewritten: u64,
}

impl ApplyReport {
    fn new(mode: RunMode) -> Self {
        Self {
            mode,
            state: RunState::Planned,
            executed: 0,
            inserted: 0,
            already_satisfied: 0,
            rows_rewritten: 0,
        }
    }

    fn transition(&mut self, next: RunState) {
        tracing::debug!(from = self.state.as_str(), to = next.as_str(), "run state");
        self.state = next;
    }
}

/// Consume `plan` against `store`.
///
/// # Errors
/// Returns [`ReconcileError::Transaction`] when any write, the commit, or the
/// transaction start fails. Every write of the run is rolled back first.
pub fn apply_plan<S: MetadataStore>(
    store: &mut S,
    plan: &Plan,
    mode: RunMode,
) -> Result<ApplyReport, ReconcileError> {
    let mut report = ApplyReport::new(mode);

    match mode {
        RunMode::DryRun => {
            for instruction in &plan.instructions {
                log_would_execute(instruction);
            }
            report.transition(RunState::Reported);
            tracing::info!(
                pending = plan.pending_count(),
                "dry run completed; no changes were made"
            );
            Ok(report)
        }
        RunMode::Apply => apply_live(store, plan, report),
    }
}

fn apply_live<S: MetadataStore>(
    store: &mut S,
    plan: &Plan,
    mut report: ApplyReport,
) -> Result<ApplyReport, ReconcileError> {
    if plan.is_empty() {
        report.transition(RunState::Committed);
        tracing::info!("nothing to apply");
        return Ok(report);
    }

    let mut tx = store.begin().map_err(|err| as_transaction_error(0, err))?;
    report.transition(RunState::Applying);

    for (index, instruction) in plan.instructions.iter().enumerate() {
        if let Err(err) = execute(&mut tx, instruction, &mut report) {
            report.transition(RunState::Failed);
            tracing::error!(index, error = %err, "write failed; rolling back");
            if let Err(rollback_err) = tx.rollback() {
                tracing::error!(error = %rollback_err, "rollback reported an error");
            }
            report.transition(RunState::RolledBack);
            tracing::info!("rolled back every change made by this run");
            return Err(as_transaction_error(index, err));
        }
        report.executed += 1;
    }

    tx.commit().map_err(|err| as_transaction_error(plan.instructions.len(), err))?;
    report.transition(RunState::Committed);
    tracing::info!(
        inserted = report.inserted,
        already_satisfied = report.already_satisfied,
        rows_rewritten = report.rows_rewritten,
        "all updates committed"
    );
    Ok(report)
}

fn execute<T: StoreTransaction>(
    tx: &mut T,
    instruction: &WriteInstruction,
    report: &mut ApplyReport,
) -> Result<(), ReconcileError> {
    match instruction {
        WriteInstruction::Insert { object_id, field_id, value } => {
            match tx.insert_assertion(object_id, *field_id, value) {
                Ok(()) => {
                    report.inserted += 1;
                    tracing::info!(
                        object = %object_id,
                        field_id = %field_id,
                        value = %value,
                        "inserted"
                    );
                    Ok(())
                }
                Err(ReconcileError::WriteConflict { .. }) => {
                    report.already_satisfied += 1;
                    tracing::info!(
                        object = %object_id,
                        field_id = %field_id,
                        value = %value,
                        "already present at write time; skipped"
                    );
                    Ok(())
                }
                Err(err) => Err(err),
            }
        }
        WriteInstruction::Rewrite { scope, match_value, replacement, matched_rows } => {
            let changed = tx.update_assertion_by_value(*scope, match_value, replacement)?;
            report.rows_rewritten += changed;
            if changed == 0 {
                tracing::info!(term = %match_value, "term not found at write time");
            } else {
                tracing::info!(
                    term = %match_value,
                    path = %replacement,
                    rows = changed,
                    planned_rows = matched_rows,
                    "rewritten"
                );
            }
            Ok(())
        }
    }
}

fn log_would_execute(instruction: &WriteInstruction) {
    match instruction {
        WriteInstruction::Insert { object_id, field_id, value } => {
            tracing::info!(
                object = %object_id,
                field_id = %field_id,
                value = %value,
                "would insert"
            );
        }
        WriteInstruction::Rewrite { match_value, replacement, matched_rows, .. } => {
            tracing::info!(
                term = %match_value,
                path = %replacement,
                rows = matched_rows,
                "would rewrite"
            );
        }
    }
}

fn as_transaction_error(index: usize, err: ReconcileError) -> ReconcileError {
    match err {
        ReconcileError::Transaction { .. } => err,
        other => ReconcileError::Transaction { index, message: other.to_string() },
    }
}
