//! Optimization drivers.
//!
//! A driver treats one leaf, or a coupled group of leaves, as the objective
//! of a bounded minimizer. Every objective call round-trips through the
//! leaves' input and feedback channels, one outstanding report per leaf.
//!
//! Both drivers move through the same states:
//! `WarmingUp -> Iterating -> {Converged | MaxIterHit | Aborted | Failed}
//! -> Publishing -> Terminating`. Leaves get their poison pill in every
//! outcome.

use crossbeam_channel::Sender;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

use sr_optimizer::{minimize, Bounds, MinimizeOptions, ObjectiveError, VariationResolver};
use sr_types::{
    EvaluationReport, LeafInput, LeafMessage, OptimizationError, OptimizationResult,
    OptimizationSettings, PlotData, Termination,
};

use crate::leaf::{LeafLink, StopSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    WarmingUp,
    Iterating,
    Converged,
    MaxIterHit,
    Aborted,
    Failed,
    Publishing,
    Terminating,
}

impl From<Termination> for DriverState {
    fn from(termination: Termination) -> Self {
        match termination {
            Termination::Converged => Self::Converged,
            Termination::MaxIterHit => Self::MaxIterHit,
            Termination::Aborted => Self::Aborted,
            Termination::Failed => Self::Failed,
        }
    }
}

/// Knobs shared by both drivers.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub settings: OptimizationSettings,
    /// Fitter modules are always minimized.
    pub minimize_only: bool,
    pub feedback_timeout: Option<Duration>,
}

impl DriverOptions {
    pub fn new(settings: OptimizationSettings) -> Self {
        Self {
            settings,
            minimize_only: false,
            feedback_timeout: None,
        }
    }

    pub fn with_minimize_only(mut self, minimize_only: bool) -> Self {
        self.minimize_only = minimize_only;
        self
    }

    pub fn with_feedback_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.feedback_timeout = timeout;
        self
    }

    fn maximize(&self) -> bool {
        self.settings.maximize && !self.minimize_only
    }

    /// The iteration cap also bounds objective evaluations.
    fn minimize_options(&self) -> MinimizeOptions {
        MinimizeOptions::default()
            .with_max_iterations(self.settings.max_iterations)
            .with_max_evaluations(self.settings.max_iterations)
    }
}

/// Objective value `name` from a leaf's report.
fn objective_value(report: &EvaluationReport, leaf: &str, name: &str) -> Result<f64, ObjectiveError> {
    if let Some(message) = &report.error {
        return Err(ObjectiveError::Failed(
            OptimizationError::EvaluationFailed {
                leaf: leaf.to_string(),
                message: message.clone(),
            }
            .to_string(),
        ));
    }
    report.results.get(name).copied().ok_or_else(|| {
        ObjectiveError::Failed(
            OptimizationError::MissingObjective {
                leaf: leaf.to_string(),
                name: name.to_string(),
            }
            .to_string(),
        )
    })
}

/// Solver proposals and the objective values they produced.
#[derive(Debug, Default)]
struct StepLog {
    points: Vec<Vec<f64>>,
    values: Vec<f64>,
}

impl StepLog {
    fn record(&mut self, x: &[f64], value: f64) {
        self.points.push(x.to_vec());
        self.values.push(value);
    }

    fn len(&self) -> usize {
        self.values.len()
    }

    /// Best step in the user's sign convention.
    fn best(&self, maximize: bool) -> Option<(&[f64], f64)> {
        let signed = |v: f64| if maximize { -v } else { v };
        self.values
            .iter()
            .enumerate()
            .min_by(|a, b| signed(*a.1).total_cmp(&signed(*b.1)))
            .map(|(i, v)| (self.points[i].as_slice(), *v))
    }

    fn plots(&self, objective: &str, names: &[String]) -> Vec<PlotData> {
        let steps: Vec<f64> = (1..=self.len()).map(|i| i as f64).collect();
        let progress = PlotData::new("Optimization progress", "step", objective).with_series(
            objective,
            steps.clone(),
            self.values.clone(),
        );
        let trajectory = names.iter().enumerate().fold(
            PlotData::new("Variable trajectory", "step", "value"),
            |plot, (i, name)| {
                plot.with_series(
                    name.clone(),
                    steps.clone(),
                    self.points.iter().map(|p| p[i]).collect(),
                )
            },
        );
        vec![progress, trajectory]
    }

    fn to_json(&self) -> serde_json::Value {
        json!({ "x": self.points, "fun": self.values })
    }
}

fn publish_steps(publisher: &Sender<LeafMessage>, steps: &StepLog, objective: &str, names: &[String]) {
    for plot in steps.plots(objective, names) {
        let _ = publisher.send(LeafMessage::Plot(plot));
    }
}

/// Fold a solver run into `result` and return the state it ends in.
fn conclude(
    result: &mut OptimizationResult,
    outcome: Result<sr_optimizer::MinimizeOutcome, ObjectiveError>,
    names: &[String],
    bounds: &[(f64, f64)],
    steps: &StepLog,
) -> DriverState {
    let maximize = result.maximize;
    match outcome {
        Ok(outcome) => {
            result.record_optimum(outcome.fun);
            result.record_variables(
                names
                    .iter()
                    .zip(&outcome.x)
                    .zip(bounds)
                    .map(|((name, value), range)| (name.as_str(), *value, *range)),
            );
            result.iterations = outcome.iterations;
            result.evaluations = outcome.evaluations;
            let mut payload = outcome.to_payload(result.solver);
            payload["steps"] = steps.to_json();
            result.payload = payload;
            result.mark_finished(outcome.termination, outcome.message);
            outcome.termination.into()
        }
        Err(error) => {
            if let Some((x, value)) = steps.best(maximize) {
                result.value = value;
                result.record_variables(
                    names
                        .iter()
                        .zip(x)
                        .zip(bounds)
                        .map(|((name, value), range)| (name.as_str(), *value, *range)),
                );
            }
            result.evaluations = steps.len();
            result.payload = json!({ "steps": steps.to_json() });
            let termination = match error {
                ObjectiveError::Stopped => Termination::Aborted,
                ObjectiveError::Failed(_) => Termination::Failed,
            };
            result.mark_finished(termination, error.to_string());
            termination.into()
        }
    }
}

/// Drives one leaf.
pub struct SingleLeafDriver {
    link: LeafLink,
    resolver: VariationResolver,
    options: DriverOptions,
    stop: StopSignal,
    state: DriverState,
}

impl SingleLeafDriver {
    pub fn new(link: LeafLink, resolver: VariationResolver, options: DriverOptions, stop: StopSignal) -> Self {
        Self {
            link,
            resolver,
            options,
            stop,
            state: DriverState::WarmingUp,
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    fn transition(&mut self, next: DriverState) {
        debug!(leaf = %self.link.path, from = ?self.state, to = ?next, "optimization state");
        self.state = next;
    }

    /// Optimize, publish the summary and release the worker.
    pub fn run(mut self) -> OptimizationResult {
        info!(
            leaf = %self.link.path,
            method = %self.options.settings.method,
            variables = self.resolver.varied_variables().len(),
            "optimization started"
        );
        let result = self.optimize();

        self.transition(DriverState::Publishing);
        match result.termination {
            Termination::Converged | Termination::MaxIterHit => info!(
                leaf = %self.link.path,
                objective = %result.objective,
                value = result.value,
                termination = ?result.termination,
                "optimization finished"
            ),
            _ => warn!(
                leaf = %self.link.path,
                termination = ?result.termination,
                message = %result.message,
                "optimization did not finish"
            ),
        }
        self.link
            .publish(LeafMessage::OptimizationSummary(result.clone()));

        self.transition(DriverState::Terminating);
        if let Err(error) = self.link.send(LeafInput::PoisonPill) {
            debug!(leaf = %self.link.path, %error, "leaf already gone");
        }
        result
    }

    fn fail(&mut self, mut result: OptimizationResult, error: ObjectiveError) -> OptimizationResult {
        let termination = match error {
            ObjectiveError::Stopped => Termination::Aborted,
            ObjectiveError::Failed(_) => Termination::Failed,
        };
        self.transition(termination.into());
        result.mark_finished(termination, error.to_string());
        result
    }

    fn warm_up(&self, x0: &[f64]) -> Result<EvaluationReport, ObjectiveError> {
        if self.stop.is_triggered() {
            return Err(ObjectiveError::Stopped);
        }
        let container = self
            .resolver
            .optimization(x0, true)
            .map_err(|e| ObjectiveError::Failed(e.to_string()))?;
        self.link.send(LeafInput::Evaluate {
            container,
            feedback: true,
        })?;
        let report = self.link.await_report(self.options.feedback_timeout, &self.stop)?;
        if let Some(message) = &report.error {
            return Err(ObjectiveError::Failed(message.clone()));
        }
        Ok(report)
    }

    fn optimize(&mut self) -> OptimizationResult {
        let settings = self.options.settings.clone();
        let mut result =
            OptimizationResult::new(settings.objective.clone(), settings.method, self.options.maximize());

        let x0 = self.resolver.current_values();
        let report = match self.warm_up(&x0) {
            Ok(report) => report,
            Err(error) => return self.fail(result, error),
        };

        // fitters name their own fit value and are always minimized
        if let Some(name) = report.fit_value_name {
            result.objective = name;
            result.maximize = false;
        }
        if result.objective.is_empty() {
            let error = OptimizationError::NoObjective {
                sample: self.resolver.sample_name().to_string(),
            };
            return self.fail(result, ObjectiveError::Failed(error.to_string()));
        }
        if x0.is_empty() {
            let error = OptimizationError::NothingToOptimize {
                leaf: self.link.path.clone(),
            };
            return self.fail(result, ObjectiveError::Failed(error.to_string()));
        }

        self.transition(DriverState::Iterating);
        let names: Vec<String> = self.resolver.varied_names().into_iter().map(String::from).collect();
        let bounds = self.resolver.bounds();
        let mut steps = StepLog::default();

        let outcome = {
            let link = &self.link;
            let resolver = &self.resolver;
            let stop = &self.stop;
            let timeout = self.options.feedback_timeout;
            let objective = result.objective.clone();
            let maximize = result.maximize;
            let steps = &mut steps;
            minimize(
                settings.method,
                |x| {
                    if stop.is_triggered() {
                        return Err(ObjectiveError::Stopped);
                    }
                    let container = resolver
                        .optimization(x, false)
                        .map_err(|e| ObjectiveError::Failed(e.to_string()))?;
                    link.send(LeafInput::Evaluate {
                        container,
                        feedback: true,
                    })?;
                    let report = link.await_report(timeout, stop)?;
                    let value = objective_value(&report, &link.path, &objective)?;
                    steps.record(x, value);
                    publish_steps(&link.publisher, steps, &objective, &names);
                    Ok(if maximize { -value } else { value })
                },
                &x0,
                &Bounds::new(&bounds),
                &self.options.minimize_options(),
            )
        };

        let state = conclude(&mut result, outcome, &names, &bounds, &steps);
        self.transition(state);
        result
    }
}

/// One leaf of a coupled group.
pub struct CoupledMember {
    pub link: LeafLink,
    pub resolver: VariationResolver,
    /// Objective name configured for this sample.
    pub objective: String,
}

/// Combined solver vector of a coupled group.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotLayout {
    pub names: Vec<String>,
    pub x0: Vec<f64>,
    pub bounds: Vec<(f64, f64)>,
    /// For each member, the combined index of each of its varied variables.
    pub member_slots: Vec<Vec<usize>>,
}

impl SlotLayout {
    /// Shared variables get one slot; every other variable gets a
    /// `"<name> (<sample>)"` slot per member.
    pub fn build<F>(resolvers: &[&VariationResolver], is_shared: F) -> Self
    where
        F: Fn(&str) -> bool,
    {
        let mut layout = Self {
            names: Vec::new(),
            x0: Vec::new(),
            bounds: Vec::new(),
            member_slots: Vec::with_capacity(resolvers.len()),
        };
        for resolver in resolvers {
            let mut slots = Vec::new();
            for variable in resolver.varied_variables() {
                let name = if is_shared(&variable.name) {
                    variable.name.clone()
                } else {
                    format!("{} ({})", variable.name, resolver.sample_name())
                };
                let index = match layout.names.iter().position(|n| *n == name) {
                    Some(index) => index,
                    None => {
                        layout.names.push(name);
                        layout.x0.push(variable.value);
                        layout.bounds.push(variable.bounds());
                        layout.names.len() - 1
                    }
                };
                slots.push(index);
            }
            layout.member_slots.push(slots);
        }
        layout
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn slice(&self, member: usize, x: &[f64]) -> Vec<f64> {
        self.member_slots[member].iter().map(|&i| x[i]).collect()
    }
}

/// Drives a group of leaves whose objectives are summed.
pub struct CoupledDriver {
    members: Vec<CoupledMember>,
    layout: SlotLayout,
    global: Sender<LeafMessage>,
    group: String,
    options: DriverOptions,
    stop: StopSignal,
    state: DriverState,
}

impl CoupledDriver {
    /// `global` publishes on the group's GlobalLeaf.
    pub fn new<F>(
        members: Vec<CoupledMember>,
        is_shared: F,
        global: Sender<LeafMessage>,
        group: impl Into<String>,
        options: DriverOptions,
        stop: StopSignal,
    ) -> Self
    where
        F: Fn(&str) -> bool,
    {
        let resolvers: Vec<&VariationResolver> = members.iter().map(|m| &m.resolver).collect();
        let layout = SlotLayout::build(&resolvers, is_shared);
        Self {
            members,
            layout,
            global,
            group: group.into(),
            options,
            stop,
            state: DriverState::WarmingUp,
        }
    }

    pub fn layout(&self) -> &SlotLayout {
        &self.layout
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    fn transition(&mut self, next: DriverState) {
        debug!(group = %self.group, from = ?self.state, to = ?next, "coupled optimization state");
        self.state = next;
    }

    pub fn run(mut self) -> OptimizationResult {
        info!(
            group = %self.group,
            leaves = self.members.len(),
            slots = self.layout.len(),
            method = %self.options.settings.method,
            "coupled optimization started"
        );
        let result = self.optimize();

        self.transition(DriverState::Publishing);
        if result.success {
            info!(group = %self.group, value = result.value, "coupled optimization finished");
        } else {
            warn!(
                group = %self.group,
                termination = ?result.termination,
                message = %result.message,
                "coupled optimization did not converge"
            );
        }
        if let Err(error) = self
            .global
            .send(LeafMessage::OptimizationSummary(result.clone()))
        {
            debug!(group = %self.group, %error, "optimization summary not delivered");
        }

        self.transition(DriverState::Terminating);
        for member in &self.members {
            if let Err(error) = member.link.send(LeafInput::PoisonPill) {
                debug!(group = %self.group, leaf = %member.link.path, %error, "leaf already gone");
            }
        }
        result
    }

    fn label(&self, objectives: &[Option<String>]) -> String {
        self.members
            .iter()
            .zip(objectives)
            .map(|(member, resolved)| {
                let name = resolved.as_deref().unwrap_or(&member.objective);
                format!("{name} ({})", member.resolver.sample_name())
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn optimize(&mut self) -> OptimizationResult {
        let settings = self.options.settings.clone();
        let maximize = self.options.maximize();
        let mut objectives: Vec<Option<String>> = vec![None; self.members.len()];
        let mut result = OptimizationResult::new(self.label(&objectives), settings.method, maximize);

        if self.layout.is_empty() {
            self.transition(DriverState::Failed);
            let error = OptimizationError::NothingToOptimize {
                leaf: self.group.clone(),
            };
            result.mark_finished(Termination::Failed, error.to_string());
            return result;
        }

        self.transition(DriverState::Iterating);
        let mut initialized = vec![false; self.members.len()];
        let mut steps = StepLog::default();

        let outcome = {
            let members = &self.members;
            let layout = &self.layout;
            let stop = &self.stop;
            let global = &self.global;
            let timeout = self.options.feedback_timeout;
            let objectives = &mut objectives;
            let steps = &mut steps;
            minimize(
                settings.method,
                |x| {
                    if stop.is_triggered() {
                        return Err(ObjectiveError::Stopped);
                    }
                    for (index, member) in members.iter().enumerate() {
                        let container = member
                            .resolver
                            .optimization(&layout.slice(index, x), !initialized[index])
                            .map_err(|e| ObjectiveError::Failed(e.to_string()))?;
                        // a cooperative leaf may already have left on the stop request
                        member
                            .link
                            .send(LeafInput::Evaluate {
                                container,
                                feedback: true,
                            })
                            .map_err(|error| {
                                if stop.is_triggered() {
                                    ObjectiveError::Stopped
                                } else {
                                    error
                                }
                            })?;
                        initialized[index] = true;
                    }

                    let mut total = 0.0;
                    for (index, member) in members.iter().enumerate() {
                        let report = member.link.await_report(timeout, stop)?;
                        let name = objectives[index]
                            .get_or_insert_with(|| {
                                report
                                    .fit_value_name
                                    .clone()
                                    .unwrap_or_else(|| member.objective.clone())
                            })
                            .clone();
                        if name.is_empty() {
                            return Err(ObjectiveError::Failed(
                                OptimizationError::NoObjective {
                                    sample: member.resolver.sample_name().to_string(),
                                }
                                .to_string(),
                            ));
                        }
                        total += objective_value(&report, &member.link.path, &name)?;
                    }

                    steps.record(x, total);
                    publish_steps(global, steps, "total objective", &layout.names);
                    Ok(if maximize { -total } else { total })
                },
                &layout.x0,
                &Bounds::new(&layout.bounds),
                &self.options.minimize_options(),
            )
        };

        result.objective = self.label(&objectives);
        let names = self.layout.names.clone();
        let bounds = self.layout.bounds.clone();
        let state = conclude(&mut result, outcome, &names, &bounds, &steps);
        self.transition(state);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leaf::{leaf_channels, LeafHandle, WorkerEndpoints};
    use crate::worker::{run_worker, WorkerMode, WorkerSpec};
    use sr_optimizer::SampleVariation;
    use sr_types::{
        GlobalSettings, ModuleContext, ModuleDescriptor, ModuleError, ModuleFactory, ModuleKind,
        ParameterValue, ParameterValues, ResultsMap, Sample, SolverMethod, Variable, WorkerExit,
    };
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use std::thread;

    /// `(a - 3)^2 + (b + 1)^2`
    struct Quadratic {
        a: f64,
        b: f64,
    }

    impl sr_types::Module for Quadratic {
        fn configure_generic(&mut self, values: &ParameterValues) -> Result<(), ModuleError> {
            self.a = values.require_float("a")?;
            self.b = values.require_float("b")?;
            Ok(())
        }

        fn run(&mut self, _context: &ModuleContext) -> Result<(), ModuleError> {
            Ok(())
        }

        fn results(&self) -> Option<ResultsMap> {
            Some(ResultsMap::from([(
                "chi2".to_string(),
                (self.a - 3.0).powi(2) + (self.b + 1.0).powi(2),
            )]))
        }
    }

    fn descriptor() -> ModuleDescriptor {
        ModuleDescriptor::new("quadratic", ModuleKind::Simulator)
    }

    fn sample_with_range(name: &str, a_max: f64) -> Sample {
        Sample::new(name)
            .with_generic("a", ParameterValue::bound("A"))
            .with_generic("b", ParameterValue::bound("B"))
            .with_variable(Variable::new("A", 0.0).with_range(-10.0, a_max, 1.0).varying(true))
            .with_variable(Variable::new("B", 0.0).with_range(-10.0, 10.0, 1.0).varying(true))
    }

    fn sample(name: &str) -> Sample {
        sample_with_range(name, 10.0)
    }

    fn resolver(sample: &Sample, globals: &GlobalSettings) -> VariationResolver {
        SampleVariation::resolve(sample, globals, &descriptor())
            .unwrap()
            .resolvers
            .remove(0)
    }

    /// Start a worker thread. Every input is logged as
    /// `(includes_fixed, variable vector)` before the worker sees it.
    fn spawn_leaf(
        path: &str,
        seen: Arc<Mutex<Vec<(bool, Vec<f64>)>>>,
        stop: StopSignal,
        mode: WorkerMode,
    ) -> (LeafHandle, thread::JoinHandle<WorkerExit>) {
        let (handle, endpoints) = leaf_channels(1, path);
        let (tap_tx, tap_rx) = crossbeam_channel::unbounded::<LeafInput>();
        let source = endpoints.input;
        thread::spawn(move || {
            while let Ok(input) = source.recv() {
                if let LeafInput::Evaluate { container, .. } = &input {
                    seen.lock()
                        .unwrap()
                        .push((container.includes_fixed, container.variable_vector()));
                }
                let last = input == LeafInput::PoisonPill;
                if tap_tx.send(input).is_err() || last {
                    break;
                }
            }
        });
        let factory: ModuleFactory =
            Arc::new(|| Box::new(Quadratic { a: 0.0, b: 0.0 }) as Box<dyn sr_types::Module>);
        let spec = WorkerSpec {
            path: path.to_string(),
            factory,
            output_dir: PathBuf::from("."),
            endpoints: WorkerEndpoints {
                input: tap_rx,
                results: endpoints.results,
                feedback: endpoints.feedback,
            },
            stop,
            mode,
        };
        (handle, thread::spawn(move || run_worker(spec)))
    }

    #[test]
    fn single_leaf_sends_one_full_then_bounded_deltas() {
        let globals = GlobalSettings::default();
        let sample = sample("s1");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let stop = StopSignal::new();
        let (mut handle, worker) = spawn_leaf("s1", seen.clone(), stop.clone(), WorkerMode::FixedCount);

        let settings = OptimizationSettings::default()
            .with_objective("chi2", false)
            .with_max_iterations(50);
        let driver = SingleLeafDriver::new(
            handle.link().unwrap(),
            resolver(&sample, &globals),
            DriverOptions::new(settings),
            stop,
        );
        let result = driver.run();

        assert_eq!(worker.join().unwrap(), WorkerExit::Completed);
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], (true, vec![0.0, 0.0]));
        let deltas = &seen[1..];
        assert!(!deltas.is_empty() && deltas.len() <= 50);
        assert!(deltas.iter().all(|(full, _)| !full));
        assert!(deltas
            .iter()
            .all(|(_, x)| x.iter().all(|v| (-10.0..=10.0).contains(v))));

        // the recorded steps are exactly the proposals sent to the leaf
        let recorded: Vec<Vec<f64>> =
            serde_json::from_value(result.payload["steps"]["x"].clone()).unwrap();
        assert_eq!(recorded.len(), deltas.len());
        for (step, (_, x)) in recorded.iter().zip(deltas) {
            assert!(step.iter().zip(x).all(|(a, b)| (a - b).abs() < 1e-12));
        }
        assert!(result.evaluations <= 50);
        assert_eq!(result.objective, "chi2");

        let messages: Vec<LeafMessage> = handle.results.try_iter().collect();
        assert!(messages
            .iter()
            .any(|m| matches!(m, LeafMessage::OptimizationSummary(_))));
        assert_eq!(
            messages.last(),
            Some(&LeafMessage::Finished(WorkerExit::Completed))
        );
    }

    #[test]
    fn single_leaf_converges_and_flags_bounds() {
        let globals = GlobalSettings::default();
        let sample = sample_with_range("s1", 2.0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let stop = StopSignal::new();
        let (mut handle, worker) = spawn_leaf("s1", seen, stop.clone(), WorkerMode::FixedCount);

        let settings = OptimizationSettings::default()
            .with_objective("chi2", false)
            .with_method(SolverMethod::Powell)
            .with_max_iterations(500);
        let result = SingleLeafDriver::new(
            handle.link().unwrap(),
            resolver(&sample, &globals),
            DriverOptions::new(settings),
            stop,
        )
        .run();
        worker.join().unwrap();

        // the unconstrained optimum a = 3 lies outside the box
        assert_eq!(result.variables.len(), 2);
        assert!((result.variables["A"] - 2.0).abs() < 1e-2);
        assert!((result.variables["B"] + 1.0).abs() < 1e-2);
        assert!((result.value - 1.0).abs() < 1e-2);
    }

    #[test]
    fn stop_aborts_before_next_send_and_releases_leaf() {
        let globals = GlobalSettings::default();
        let sample = sample("s1");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let stop = StopSignal::new();
        let (mut handle, worker) = spawn_leaf("s1", seen.clone(), stop.clone(), WorkerMode::FixedCount);

        // stop after the fifth evaluation reaches the worker
        let trigger = stop.clone();
        let watcher_seen = seen.clone();
        let watcher = thread::spawn(move || loop {
            if watcher_seen.lock().unwrap().len() >= 5 {
                trigger.trigger();
                break;
            }
            thread::sleep(Duration::from_millis(1));
        });

        let settings = OptimizationSettings::default()
            .with_objective("chi2", false)
            .with_max_iterations(10_000);
        let result = SingleLeafDriver::new(
            handle.link().unwrap(),
            resolver(&sample, &globals),
            DriverOptions::new(settings),
            stop,
        )
        .run();
        watcher.join().unwrap();

        assert_eq!(result.termination, Termination::Aborted);
        assert!(!result.success);
        assert_eq!(worker.join().unwrap(), WorkerExit::Completed);
        assert!(seen.lock().unwrap().len() < 10_000);
    }

    #[test]
    fn coupled_layout_shares_only_global_variables() {
        let globals = GlobalSettings::default()
            .with_variable(Variable::new("G0", 1.0).with_range(0.0, 2.0, 1.0).varying(true));
        let first = Sample::new("s1")
            .with_generic("a", ParameterValue::bound("G0"))
            .with_generic("b", ParameterValue::bound("x"))
            .with_variable(Variable::new("x", 0.5).with_range(0.0, 1.0, 0.5).varying(true));
        let second = Sample::new("s2")
            .with_generic("a", ParameterValue::bound("G0"))
            .with_generic("b", ParameterValue::bound("x"))
            .with_variable(Variable::new("x", 0.25).with_range(0.0, 1.0, 0.5).varying(true));
        let r1 = resolver(&first, &globals);
        let r2 = resolver(&second, &globals);

        let layout = SlotLayout::build(&[&r1, &r2], |name| globals.is_global_variable(name));

        assert_eq!(layout.names, vec!["G0", "x (s1)", "x (s2)"]);
        assert_eq!(layout.x0, vec![1.0, 0.5, 0.25]);
        assert_eq!(layout.member_slots, vec![vec![0, 1], vec![0, 2]]);
        assert_eq!(layout.slice(1, &[1.5, 0.1, 0.9]), vec![1.5, 0.9]);
    }

    #[test]
    fn coupled_driver_sums_objectives_and_releases_all_leaves() {
        let globals = GlobalSettings::default()
            .with_variable(Variable::new("A", 0.0).with_range(-10.0, 10.0, 1.0).varying(true));
        let stop = StopSignal::new();
        let mode = WorkerMode::Cooperative {
            poll_interval: Duration::from_millis(2),
        };
        let mut members = Vec::new();
        let mut workers = Vec::new();
        let mut logs = Vec::new();
        let mut handles = Vec::new();
        for name in ["s1", "s2"] {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let (mut handle, worker) = spawn_leaf(name, seen.clone(), stop.clone(), mode);
            members.push(CoupledMember {
                link: handle.link().unwrap(),
                resolver: resolver(&sample(name), &globals),
                objective: "chi2".into(),
            });
            workers.push(worker);
            logs.push(seen);
            handles.push(handle);
        }
        let (global_tx, global_rx) = crossbeam_channel::unbounded();
        let settings = OptimizationSettings::default()
            .with_objective("chi2", false)
            .with_max_iterations(40);

        let driver = CoupledDriver::new(
            members,
            |name| globals.is_global_variable(name),
            global_tx,
            "global",
            DriverOptions::new(settings),
            stop,
        );
        assert_eq!(driver.layout().names, vec!["A", "B (s1)", "B (s2)"]);
        let result = driver.run();

        for worker in workers {
            assert_eq!(worker.join().unwrap(), WorkerExit::Completed);
        }
        assert_eq!(result.objective, "chi2 (s1), chi2 (s2)");
        assert!(result.evaluations <= 40);
        for log in &logs {
            let log = log.lock().unwrap();
            assert!(log[0].0);
            assert!(log[1..].iter().all(|(full, _)| !full));
        }
        let summaries: Vec<_> = global_rx
            .try_iter()
            .filter(|m| matches!(m, LeafMessage::OptimizationSummary(_)))
            .collect();
        assert_eq!(summaries.len(), 1);
        drop(handles);
    }

    /// Two cooperative leaves over `sample(name)` sharing the global `A`.
    fn spawn_group(
        globals: &GlobalSettings,
        stop: &StopSignal,
    ) -> (
        Vec<CoupledMember>,
        Vec<thread::JoinHandle<WorkerExit>>,
        Vec<Arc<Mutex<Vec<(bool, Vec<f64>)>>>>,
        Vec<LeafHandle>,
    ) {
        let mode = WorkerMode::Cooperative {
            poll_interval: Duration::from_millis(2),
        };
        let (mut members, mut workers, mut logs, mut handles) =
            (Vec::new(), Vec::new(), Vec::new(), Vec::new());
        for name in ["s1", "s2"] {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let (mut handle, worker) = spawn_leaf(name, seen.clone(), stop.clone(), mode);
            members.push(CoupledMember {
                link: handle.link().unwrap(),
                resolver: resolver(&sample(name), globals),
                objective: "chi2".into(),
            });
            workers.push(worker);
            logs.push(seen);
            handles.push(handle);
        }
        (members, workers, logs, handles)
    }

    #[test]
    fn coupled_stop_aborts_and_releases_every_leaf() {
        let globals = GlobalSettings::default()
            .with_variable(Variable::new("A", 0.0).with_range(-10.0, 10.0, 1.0).varying(true));
        let stop = StopSignal::new();
        let (members, workers, logs, handles) = spawn_group(&globals, &stop);

        // stop once five inputs have reached the first leaf
        let trigger = stop.clone();
        let watched = logs[0].clone();
        let watcher = thread::spawn(move || loop {
            if watched.lock().unwrap().len() >= 5 {
                trigger.trigger();
                break;
            }
            thread::sleep(Duration::from_millis(1));
        });

        let (global_tx, global_rx) = crossbeam_channel::unbounded();
        let settings = OptimizationSettings::default()
            .with_objective("chi2", false)
            .with_max_iterations(10_000);
        let result = CoupledDriver::new(
            members,
            |name| globals.is_global_variable(name),
            global_tx,
            "global",
            DriverOptions::new(settings),
            stop,
        )
        .run();
        watcher.join().unwrap();

        assert_eq!(result.termination, Termination::Aborted);
        assert!(!result.success);
        // a cooperative leaf either takes its pill or notices the stop first
        for worker in workers {
            let exit = worker.join().unwrap();
            assert!(matches!(exit, WorkerExit::Completed | WorkerExit::Stopped), "{exit:?}");
        }
        assert!(logs.iter().all(|log| log.lock().unwrap().len() < 10_000));
        let summaries: Vec<_> = global_rx
            .try_iter()
            .filter(|m| matches!(m, LeafMessage::OptimizationSummary(_)))
            .collect();
        assert_eq!(summaries.len(), 1);
        drop(handles);
    }

    #[test]
    fn coupled_driver_finishes_without_a_global_listener() {
        let globals = GlobalSettings::default()
            .with_variable(Variable::new("A", 0.0).with_range(-10.0, 10.0, 1.0).varying(true));
        let stop = StopSignal::new();
        let (members, workers, _logs, handles) = spawn_group(&globals, &stop);

        let (global_tx, global_rx) = crossbeam_channel::unbounded();
        drop(global_rx);
        let settings = OptimizationSettings::default()
            .with_objective("chi2", false)
            .with_max_iterations(20);
        let result = CoupledDriver::new(
            members,
            |name| globals.is_global_variable(name),
            global_tx,
            "global",
            DriverOptions::new(settings),
            stop,
        )
        .run();

        assert!(result.evaluations <= 20);
        for worker in workers {
            assert_eq!(worker.join().unwrap(), WorkerExit::Completed);
        }
        drop(handles);
    }
}
