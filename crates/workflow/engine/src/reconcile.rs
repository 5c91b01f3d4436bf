//! Gateway reconciliation
//!
//! After an exclusive gateway completes, the tasks it made READY are
//! reconciled so that exactly one branch survives. With condition
//! evaluation there is only ever one candidate; with eager activation every
//! outgoing flow produced a task and all but one must be cancelled.

use crate::expression::evaluate;
use procflow_types::{DataBag, TaskId};

/// A READY task produced by a gateway, with the flow that produced it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BranchCandidate {
    pub task: TaskId,
    pub flow_id: String,
    pub condition: Option<String>,
    pub is_default: bool,
}

impl BranchCandidate {
    fn is_fallback(&self) -> bool {
        self.is_default || self.condition.is_none()
    }
}

/// The outcome of reconciling one gateway's candidates
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// `None` when no candidate qualifies
    pub keep: Option<TaskId>,
    pub cancel: Vec<TaskId>,
    pub warnings: Vec<String>,
}

impl Reconciliation {
    /// Keep `task` and cancel every other candidate
    pub fn keeping(task: TaskId, candidates: &[BranchCandidate]) -> Self {
        Self {
            keep: Some(task),
            cancel: candidates
                .iter()
                .map(|c| c.task)
                .filter(|t| *t != task)
                .collect(),
            warnings: Vec::new(),
        }
    }

    fn with_warning(mut self, warning: String) -> Self {
        self.warnings.push(warning);
        self
    }
}

/// Chooses the surviving branch of a gateway
pub trait BranchReconciler: Send + Sync {
    fn reconcile(
        &self,
        gateway: &str,
        candidates: &[BranchCandidate],
        data: &DataBag,
    ) -> Reconciliation;
}

/// Keeps the first candidate whose condition holds, else the default
///
/// Conditions are tried in flow order. When every condition fails to
/// evaluate and there is no default, the first candidate is kept with a
/// warning. When conditions evaluate but none holds and there is no
/// default, nothing is kept.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConditionReconciler;

impl BranchReconciler for ConditionReconciler {
    fn reconcile(
        &self,
        gateway: &str,
        candidates: &[BranchCandidate],
        data: &DataBag,
    ) -> Reconciliation {
        match candidates {
            [] => return Reconciliation::default(),
            [only] => return Reconciliation::keeping(only.task, candidates),
            _ => {}
        }

        let mut warnings = Vec::new();
        let mut evaluated = 0;
        let mut failed = 0;

        for candidate in candidates {
            let Some(condition) = candidate.condition.as_deref() else {
                continue;
            };
            evaluated += 1;
            match evaluate(condition, data) {
                Ok(true) => {
                    let mut outcome = Reconciliation::keeping(candidate.task, candidates);
                    outcome.warnings = warnings;
                    return outcome;
                }
                Ok(false) => {}
                Err(e) => {
                    failed += 1;
                    warnings.push(format!(
                        "condition on flow '{}' failed: {}",
                        candidate.flow_id, e
                    ));
                }
            }
        }

        let mut outcome = if let Some(default) = candidates.iter().find(|c| c.is_fallback()) {
            Reconciliation::keeping(default.task, candidates)
        } else if evaluated > 0 && failed == evaluated {
            Reconciliation::keeping(candidates[0].task, candidates).with_warning(format!(
                "no condition on gateway '{}' could be evaluated, keeping flow '{}'",
                gateway, candidates[0].flow_id
            ))
        } else {
            Reconciliation {
                keep: None,
                cancel: candidates.iter().map(|c| c.task).collect(),
                warnings: Vec::new(),
            }
        };
        warnings.append(&mut outcome.warnings);
        outcome.warnings = warnings;
        outcome
    }
}
