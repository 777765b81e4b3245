//! Per-leaf service loop owning one module instance.

use crossbeam_channel::{RecvTimeoutError, Sender};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use sr_types::{
    EvaluationReport, InputContainer, LeafInput, LeafMessage, Module, ModuleContext, ModuleError,
    ModuleFactory, ResultsMap, WorkerExit,
};

use crate::leaf::{StopSignal, WorkerEndpoints};

/// How a worker waits for its next input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    /// Blocking receive until the poison pill.
    FixedCount,
    /// Timed receive, checking the stop signal between waits.
    Cooperative { poll_interval: Duration },
}

/// Evaluation pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ApplyGeneric,
    ApplyEvaluationSet,
    ApplyLayers,
    Run,
    CollectResults,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::ApplyGeneric => "apply generic parameters",
            Stage::ApplyEvaluationSet => "apply evaluation set",
            Stage::ApplyLayers => "apply layers",
            Stage::Run => "run",
            Stage::CollectResults => "collect results",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct StageFailure {
    stage: Stage,
    error: ModuleError,
}

trait StageResult<T> {
    fn at(self, stage: Stage) -> Result<T, StageFailure>;
}

impl<T> StageResult<T> for Result<T, ModuleError> {
    fn at(self, stage: Stage) -> Result<T, StageFailure> {
        self.map_err(|error| StageFailure { stage, error })
    }
}

/// Everything a pool thread needs to run one leaf.
pub struct WorkerSpec {
    pub path: String,
    pub factory: ModuleFactory,
    pub output_dir: PathBuf,
    pub endpoints: WorkerEndpoints,
    pub stop: StopSignal,
    pub mode: WorkerMode,
}

pub struct Worker {
    path: String,
    module: Box<dyn Module>,
    context: ModuleContext,
    endpoints: WorkerEndpoints,
    stop: StopSignal,
    mode: WorkerMode,
    current: Option<InputContainer>,
    evaluations: usize,
}

impl Worker {
    /// Instantiate a fresh module and bind its context.
    pub fn new(spec: WorkerSpec) -> Self {
        let context = ModuleContext::new(
            spec.path.clone(),
            spec.output_dir,
            spec.endpoints.results.clone(),
        );
        Self {
            module: (spec.factory)(),
            path: spec.path,
            context,
            endpoints: spec.endpoints,
            stop: spec.stop,
            mode: spec.mode,
            current: None,
            evaluations: 0,
        }
    }

    /// Serve inputs until the poison pill, a stop request or a disconnect.
    pub fn serve(&mut self) -> WorkerExit {
        loop {
            let message = match self.mode {
                WorkerMode::FixedCount => match self.endpoints.input.recv() {
                    Ok(message) => message,
                    Err(_) => return WorkerExit::Stopped,
                },
                WorkerMode::Cooperative { poll_interval } => {
                    if self.stop.is_triggered() {
                        return WorkerExit::Stopped;
                    }
                    match self.endpoints.input.recv_timeout(poll_interval) {
                        Ok(message) => message,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => return WorkerExit::Stopped,
                    }
                }
            };

            match message {
                LeafInput::PoisonPill => return WorkerExit::Completed,
                LeafInput::Evaluate { container, feedback } => self.evaluate(container, feedback),
            }
        }
    }

    fn evaluate(&mut self, container: InputContainer, feedback: bool) {
        let started = Instant::now();
        match self.current.as_mut() {
            Some(current) => current.merge(&container),
            None => self.current = Some(container),
        }
        self.evaluations += 1;

        match self.pipeline() {
            Ok((results, fit_value_name)) => {
                let variable_values = self
                    .current
                    .as_ref()
                    .map(|c| c.variable_values.clone())
                    .unwrap_or_default();
                debug!(
                    leaf = %self.path,
                    evaluation = self.evaluations,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "evaluation finished"
                );
                self.emit(LeafMessage::Evaluation {
                    variable_values,
                    results: results.clone(),
                });
                if feedback {
                    let _ = self
                        .endpoints
                        .feedback
                        .send(EvaluationReport::success(results, fit_value_name));
                }
            }
            Err(failure) => {
                let message = failure.error.to_string();
                self.emit(LeafMessage::callback(
                    format!("{} failed", failure.stage),
                    message.clone(),
                ));
                if feedback {
                    let _ = self.endpoints.feedback.send(EvaluationReport::failure(format!(
                        "{}: {message}",
                        failure.stage
                    )));
                }
            }
        }
    }

    /// Apply the merged configuration, run the module and collect its results.
    fn pipeline(&mut self) -> Result<(ResultsMap, Option<String>), StageFailure> {
        let Some(config) = self.current.as_ref() else {
            return Ok((ResultsMap::new(), None));
        };

        self.module
            .configure_generic(&config.generic)
            .at(Stage::ApplyGeneric)?;
        if let Some(values) = &config.evaluation_set {
            self.module
                .configure_evaluation_set(values)
                .at(Stage::ApplyEvaluationSet)?;
        }
        if !config.layers.is_empty() {
            self.module
                .configure_layers(&config.layers)
                .at(Stage::ApplyLayers)?;
        }
        self.module.run(&self.context).at(Stage::Run)?;

        let results = self.module.results().unwrap_or_default();
        let fit_value_name = self.module.fit_value_name();
        if let Some(name) = &fit_value_name {
            if !results.contains_key(name) {
                return Err(StageFailure {
                    stage: Stage::CollectResults,
                    error: ModuleError::RunFailed {
                        message: format!("fit value '{name}' missing from results"),
                    },
                });
            }
        }
        Ok((results, fit_value_name))
    }

    fn emit(&self, message: LeafMessage) {
        match &message {
            LeafMessage::Callback { title, message } => {
                warn!(leaf = %self.path, %title, %message, "worker callback")
            }
            LeafMessage::Finished(exit) => info!(leaf = %self.path, exit = ?exit, "worker finished"),
            _ => {}
        }
        // Best-effort send; the receiver is gone once the run is torn down.
        let _ = self.endpoints.results.send(message);
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "worker panicked".to_string())
}

/// Run one leaf to completion. Always publishes exactly one `Finished`.
pub fn run_worker(spec: WorkerSpec) -> WorkerExit {
    let results: Sender<LeafMessage> = spec.endpoints.results.clone();
    let path = spec.path.clone();

    let exit = match panic::catch_unwind(AssertUnwindSafe(move || {
        let mut worker = Worker::new(spec);
        let exit = worker.serve();
        (worker, exit)
    })) {
        Ok((worker, exit)) => {
            worker.emit(LeafMessage::Finished(exit.clone()));
            return exit;
        }
        Err(payload) => WorkerExit::Crashed {
            reason: panic_reason(payload.as_ref()),
        },
    };

    error!(leaf = %path, exit = ?exit, "worker crashed");
    let _ = results.send(LeafMessage::Finished(exit.clone()));
    exit
}
