//! Optimization run outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::sample::SolverMethod;

/// Unique optimization run identifier.
pub type OptimizationId = Uuid;

/// How an optimization left its iteration phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    Converged,
    MaxIterHit,
    Aborted,
    Failed,
}

impl Termination {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Converged)
    }
}

/// Final report of a single-leaf or coupled optimization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub id: OptimizationId,
    /// Objective name; for coupled runs `"<obj> (<sample>), ..."`.
    pub objective: String,
    /// Objective value at the optimum, in the user's sign convention.
    pub value: f64,
    pub variables: BTreeMap<String, f64>,
    /// Variables that ended at or beyond one of their bounds.
    pub out_of_bounds: BTreeMap<String, f64>,
    pub solver: SolverMethod,
    pub maximize: bool,
    pub success: bool,
    pub termination: Termination,
    pub message: String,
    pub iterations: usize,
    pub evaluations: usize,
    /// Solver-native details.
    pub payload: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl OptimizationResult {
    pub fn new(objective: impl Into<String>, solver: SolverMethod, maximize: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            objective: objective.into(),
            value: f64::NAN,
            variables: BTreeMap::new(),
            out_of_bounds: BTreeMap::new(),
            solver,
            maximize,
            success: false,
            termination: Termination::Failed,
            message: String::new(),
            iterations: 0,
            evaluations: 0,
            payload: serde_json::Value::Null,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Record the solver's minimum. `minimized` is the value the solver saw,
    /// which is negated back when maximizing.
    pub fn record_optimum(&mut self, minimized: f64) {
        self.value = if self.maximize { -minimized } else { minimized };
    }

    /// Record final variable values and flag those at or outside `(min, max)`.
    pub fn record_variables<'a, I>(&mut self, values: I)
    where
        I: IntoIterator<Item = (&'a str, f64, (f64, f64))>,
    {
        for (name, value, (min, max)) in values {
            self.variables.insert(name.to_string(), value);
            if value >= max || value <= min {
                self.out_of_bounds.insert(name.to_string(), value);
            }
        }
    }

    pub fn mark_finished(&mut self, termination: Termination, message: impl Into<String>) {
        self.termination = termination;
        self.success = termination.is_success();
        self.message = message.into();
        self.finished_at = Some(Utc::now());
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }
}
