//! Messages exchanged between the executor, drivers and workers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::input::InputContainer;
use crate::optimization::OptimizationResult;

/// Named scalar results of one module run.
pub type ResultsMap = BTreeMap<String, f64>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotSeries {
    pub label: String,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

/// Data for a figure. Rendering is left to the consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotData {
    pub title: String,
    pub x_label: String,
    pub y_label: String,
    pub series: Vec<PlotSeries>,
    /// Keep the figure after the run instead of replacing it on the next update.
    pub persist: bool,
}

impl PlotData {
    pub fn new(title: impl Into<String>, x_label: impl Into<String>, y_label: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            x_label: x_label.into(),
            y_label: y_label.into(),
            series: Vec::new(),
            persist: false,
        }
    }

    pub fn with_series(mut self, label: impl Into<String>, x: Vec<f64>, y: Vec<f64>) -> Self {
        self.series.push(PlotSeries {
            label: label.into(),
            x,
            y,
        });
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persist = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabularResult {
    pub title: String,
    pub row_labels: Vec<String>,
    pub column_labels: Vec<String>,
    pub values: Vec<Vec<f64>>,
}

/// Why a worker left its service loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerExit {
    /// Poison pill received.
    Completed,
    /// Stop signal observed before the poison pill.
    Stopped,
    Crashed { reason: String },
}

/// Outcome of one evaluation, sent to the driver waiting on the feedback channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub results: ResultsMap,
    /// Name of the fit value, reported by fitter modules.
    pub fit_value_name: Option<String>,
    /// Set when a pipeline stage failed.
    pub error: Option<String>,
}

impl EvaluationReport {
    pub fn success(results: ResultsMap, fit_value_name: Option<String>) -> Self {
        Self {
            results,
            fit_value_name,
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Messages a leaf publishes on its result channel, in publication order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LeafMessage {
    Plot(PlotData),
    Table(TabularResult),
    OptimizationSummary(OptimizationResult),
    Callback {
        title: String,
        message: String,
    },
    Evaluation {
        variable_values: Vec<(String, f64)>,
        results: ResultsMap,
    },
    /// Last message of every worker.
    Finished(WorkerExit),
}

impl LeafMessage {
    pub fn callback(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Callback {
            title: title.into(),
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished(_))
    }
}

/// Messages on a leaf's input channel.
#[derive(Debug, Clone, PartialEq)]
pub enum LeafInput {
    Evaluate {
        container: InputContainer,
        /// Also send an [`EvaluationReport`] on the feedback channel.
        feedback: bool,
    },
    PoisonPill,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_finished_is_terminal() {
        assert!(LeafMessage::Finished(WorkerExit::Completed).is_terminal());
        assert!(!LeafMessage::callback("t", "m").is_terminal());
    }

    #[test]
    fn leaf_message_serializes_externally_tagged() {
        let msg = LeafMessage::Finished(WorkerExit::Crashed {
            reason: "boom".into(),
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["Finished"]["Crashed"]["reason"], "boom");
    }

    #[test]
    fn failed_report_is_not_ok() {
        assert!(!EvaluationReport::failure("run failed").is_ok());
        assert!(EvaluationReport::success(ResultsMap::new(), None).is_ok());
    }
}
