//! Run orchestration.
//!
//! [`Executor::start`] resolves the samples, builds the execution tree and
//! hands the leaves to a dispatcher thread, which feeds fixed-count workers
//! or starts optimization drivers. The returned [`RunHandle`] drains every
//! leaf's result channel into the aggregator without blocking.

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use sr_optimizer::{resolve_samples, SampleVariation};
use sr_types::{
    internal_error, ExecutionMode, GlobalSettings, LeafInput, LeafMessage, ModuleFactory,
    ModuleKind, ModuleRegistry, OptimizationResult, OptimizationSettings, Sample, SrResult,
    TreeError, WorkerExit,
};

use crate::aggregator::{GroupView, LeafView, ResultRow, ResultsAggregator};
use crate::config::EngineConfig;
use crate::leaf::{leaf_channels, LeafHandle, LeafLink, StopSignal, WorkerEndpoints};
use crate::optimization::{CoupledDriver, CoupledMember, DriverOptions, SingleLeafDriver};
use crate::pool::WorkerPool;
use crate::tree::{build_plan, ExecutionPlan, LeafSpec, NodeId, NodeKind};
use crate::worker::{run_worker, WorkerMode, WorkerSpec};

/// Something that happened during a run, tagged with the leaf it concerns.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    /// A leaf published a plot, table, notice, summary or its exit.
    Message {
        leaf: NodeId,
        path: String,
        message: LeafMessage,
    },
    /// A sample leaf produced results.
    ResultsUpdated {
        leaf: NodeId,
        path: String,
        /// Path of the group's GlobalLeaf, when the group has one.
        group_path: Option<String>,
        view: LeafView,
        group: GroupView,
    },
    /// Run-level notice not tied to a leaf.
    Callback { title: String, message: String },
}

/// Final state of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunFinished {
    pub run_id: Uuid,
    pub module: String,
    pub mode: ExecutionMode,
    /// Exit of every sample leaf, in tree order.
    pub exits: Vec<(String, WorkerExit)>,
    pub optimizations: Vec<OptimizationResult>,
    pub stopped: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunFinished {
    pub fn crashed(&self) -> Vec<&str> {
        self.exits
            .iter()
            .filter(|(_, exit)| matches!(exit, WorkerExit::Crashed { .. }))
            .map(|(path, _)| path.as_str())
            .collect()
    }

    pub fn all_completed(&self) -> bool {
        self.exits.iter().all(|(_, exit)| *exit == WorkerExit::Completed)
    }
}

/// Starts runs of registered modules.
#[derive(Debug, Clone)]
pub struct Executor {
    config: EngineConfig,
    registry: ModuleRegistry,
}

impl Executor {
    pub fn new(config: EngineConfig, registry: ModuleRegistry) -> Self {
        Self { config, registry }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Resolve `samples`, build the tree and start dispatching.
    ///
    /// Resolution errors of any sample fail the whole run here, before any
    /// worker starts.
    pub fn start(
        &self,
        module: &str,
        samples: &[Sample],
        globals: &GlobalSettings,
    ) -> SrResult<RunHandle> {
        let descriptor = self.registry.descriptor(module)?.clone();
        let factory = self.registry.factory(module)?;
        if !samples.iter().any(|sample| sample.enabled) {
            return Err(TreeError::NoSamples.into());
        }

        let mode = globals.mode;
        let variations = resolve_samples(samples, globals, &descriptor)?;
        let plan = build_plan(&descriptor, mode, &variations);

        if self.config.export_tree {
            if let Err(error) = plan.tree.save(&self.config.output_dir(), module) {
                warn!(module, %error, "could not export execution tree");
            }
        }

        let mut capacity = self
            .config
            .max_parallel
            .unwrap_or_else(WorkerPool::default_capacity);
        if mode == ExecutionMode::CoupledOptimization {
            // every leaf of a coupled group must be live at once
            capacity = capacity.max(plan.largest_group());
        }
        let pool = Arc::new(WorkerPool::new(capacity)?);

        let run_id = Uuid::new_v4();
        let stop = StopSignal::new();
        let mut leaves = Vec::new();
        let mut aggregator = ResultsAggregator::new();
        let mut groups = Vec::with_capacity(plan.groups.len());
        let mut group_paths = HashMap::new();

        for group in &plan.groups {
            let global_path = group.global.map(|id| plan.tree.path(id)).transpose()?;
            let mut dispatch = DispatchGroup {
                path: global_path
                    .clone()
                    .unwrap_or_else(|| plan.tree.path(group.fork).unwrap_or_default()),
                global: None,
                jobs: Vec::with_capacity(group.leaves.len()),
            };

            if let Some(global) = group.global {
                let (handle, _endpoints) = leaf_channels(global, global_path.clone().unwrap_or_default());
                dispatch.global = Some(handle.publisher.clone());
                leaves.push(handle);
            }

            let mut rows = Vec::with_capacity(group.leaves.len());
            for &leaf in &group.leaves {
                let spec = plan.tree.leaf_spec(leaf)?;
                let path = plan.tree.path(leaf)?;
                let (mut handle, endpoints) = leaf_channels(leaf, path.clone());
                let link = if mode.is_optimization() {
                    handle.link()
                } else {
                    None
                };
                dispatch.jobs.push(LeafJob {
                    node: leaf,
                    path: path.clone(),
                    spec,
                    input: handle.input.clone(),
                    publisher: handle.publisher.clone(),
                    endpoints,
                    link,
                });
                rows.push(initial_row(&plan, &variations, mode, leaf, spec)?);
                group_paths.insert(leaf, global_path.clone());
                leaves.push(handle);
            }
            aggregator.add_group(rows, mode == ExecutionMode::Variation);
            groups.push(dispatch);
        }

        let mut backlog = Vec::new();
        if !plan.empty_samples.is_empty() {
            backlog.push(RunEvent::Callback {
                title: "Samples skipped".to_string(),
                message: format!(
                    "No executable leaves for: {}",
                    plan.empty_samples.join(", ")
                ),
            });
        }

        let pending = groups.iter().map(|g| g.jobs.len()).sum();
        info!(
            run = %run_id,
            module,
            mode = ?mode,
            leaves = pending,
            groups = groups.len(),
            workers = pool.capacity(),
            "run started"
        );

        let dispatcher = Dispatcher {
            mode,
            minimize_only: descriptor.kind == ModuleKind::Fitter,
            factory,
            output_dir: self.config.output_dir(),
            poll_interval: self.config.poll_interval(),
            feedback_timeout: self.config.feedback_timeout(),
            globals: globals.clone(),
            variations,
            pool: pool.clone(),
            stop: stop.clone(),
        };
        let dispatcher = thread::Builder::new()
            .name("simrun-dispatch".to_string())
            .spawn(move || dispatcher.run(groups))
            .map_err(|e| internal_error!("failed to spawn dispatcher: {e}"))?;

        Ok(RunHandle {
            run_id,
            module: module.to_string(),
            mode,
            plan,
            leaves,
            group_paths,
            aggregator,
            stop,
            pool,
            dispatcher: Some(dispatcher),
            backlog,
            pending,
            exits: HashMap::new(),
            optimizations: Vec::new(),
            poll_interval: self.config.poll_interval(),
            started_at: Utc::now(),
            finished: None,
        })
    }
}

/// Aggregator row of a sample leaf before any result arrives.
fn initial_row(
    plan: &ExecutionPlan,
    variations: &[SampleVariation],
    mode: ExecutionMode,
    leaf: NodeId,
    spec: LeafSpec,
) -> SrResult<ResultRow> {
    let node = plan.tree.node(leaf)?;
    let row = ResultRow::new(leaf, node.name.clone());
    let Some(resolver) = variations
        .get(spec.sample)
        .and_then(|sample| sample.resolver(spec.evaluation_set))
    else {
        return Ok(row);
    };
    let names = resolver.varied_names().into_iter().map(String::from).collect();
    let values = match (mode, spec.variation_row) {
        (ExecutionMode::Variation, Some(index)) => resolver.grid().row(index)?.to_vec(),
        _ => resolver.current_values(),
    };
    Ok(row.with_variables(names, values))
}

struct LeafJob {
    node: NodeId,
    path: String,
    spec: LeafSpec,
    input: Sender<LeafInput>,
    publisher: Sender<LeafMessage>,
    endpoints: WorkerEndpoints,
    link: Option<LeafLink>,
}

impl LeafJob {
    /// Settle a leaf without starting its worker.
    fn abandon(self, exit: WorkerExit) {
        let _ = self.publisher.send(LeafMessage::Finished(exit));
    }
}

struct DispatchGroup {
    path: String,
    global: Option<Sender<LeafMessage>>,
    jobs: Vec<LeafJob>,
}

struct Dispatcher {
    mode: ExecutionMode,
    minimize_only: bool,
    factory: ModuleFactory,
    output_dir: PathBuf,
    poll_interval: Duration,
    feedback_timeout: Option<Duration>,
    globals: GlobalSettings,
    variations: Vec<SampleVariation>,
    pool: Arc<WorkerPool>,
    stop: StopSignal,
}

impl Dispatcher {
    fn run(self, groups: Vec<DispatchGroup>) {
        let mut drivers = Vec::new();
        for group in groups {
            if self.mode == ExecutionMode::CoupledOptimization {
                drivers.extend(self.dispatch_coupled(group));
            } else {
                for job in group.jobs {
                    drivers.extend(self.dispatch_leaf(job));
                }
            }
        }
        debug!(drivers = drivers.len(), "dispatch complete");
        for driver in drivers {
            if driver.join().is_err() {
                error!("optimization driver thread failed");
            }
        }
    }

    fn settings_for(&self, spec: LeafSpec) -> OptimizationSettings {
        self.variations
            .get(spec.sample)
            .map(|variation| self.globals.optimization_settings_for(&variation.sample))
            .unwrap_or_default()
    }

    fn driver_options(&self, settings: OptimizationSettings) -> DriverOptions {
        DriverOptions::new(settings)
            .with_minimize_only(self.minimize_only)
            .with_feedback_timeout(self.feedback_timeout)
    }

    fn dispatch_leaf(&self, job: LeafJob) -> Option<JoinHandle<()>> {
        if self.stop.is_triggered() {
            job.abandon(WorkerExit::Stopped);
            return None;
        }
        let Some(resolver) = self
            .variations
            .get(job.spec.sample)
            .and_then(|variation| variation.resolver(job.spec.evaluation_set))
        else {
            error!(leaf = %job.path, "no resolver for leaf");
            job.abandon(WorkerExit::Crashed {
                reason: "no resolver for leaf".to_string(),
            });
            return None;
        };

        let LeafJob {
            node,
            path,
            spec,
            input,
            publisher,
            endpoints,
            link,
        } = job;

        if self.mode.is_optimization() {
            let Some(link) = link else {
                let _ = input.send(LeafInput::PoisonPill);
                self.start_worker(path, publisher, endpoints, WorkerMode::FixedCount);
                return None;
            };
            let driver = SingleLeafDriver::new(
                link,
                resolver.clone(),
                self.driver_options(self.settings_for(spec)),
                self.stop.clone(),
            );
            self.start_worker(path, publisher, endpoints, WorkerMode::FixedCount);
            return self.spawn_driver(format!("simrun-driver-{node}"), vec![input], move || {
                driver.run();
            });
        }

        let container = match spec.variation_row {
            Some(row) if self.mode == ExecutionMode::Variation => resolver.variation(row),
            _ => resolver.single(),
        };
        match container {
            Ok(container) => {
                let _ = input.send(LeafInput::Evaluate {
                    container,
                    feedback: false,
                });
            }
            Err(error) => {
                warn!(leaf = %path, %error, "could not materialize inputs");
                let _ = publisher.send(LeafMessage::callback(
                    "Parameter resolution failed",
                    error.to_string(),
                ));
            }
        }
        let _ = input.send(LeafInput::PoisonPill);
        self.start_worker(path, publisher, endpoints, WorkerMode::FixedCount);
        None
    }

    fn dispatch_coupled(&self, group: DispatchGroup) -> Option<JoinHandle<()>> {
        let DispatchGroup { path, global, jobs } = group;
        let Some(global) = global.filter(|_| !self.stop.is_triggered()) else {
            for job in jobs {
                job.abandon(WorkerExit::Stopped);
            }
            return None;
        };
        let settings = jobs
            .first()
            .map(|job| self.settings_for(job.spec))
            .unwrap_or_default();

        let mut members = Vec::with_capacity(jobs.len());
        let mut inputs = Vec::with_capacity(jobs.len());
        for job in jobs {
            let resolver = self
                .variations
                .get(job.spec.sample)
                .and_then(|variation| variation.resolver(job.spec.evaluation_set))
                .cloned();
            let objective = self.settings_for(job.spec).objective;
            let LeafJob {
                path: leaf_path,
                input,
                publisher,
                endpoints,
                link,
                ..
            } = job;

            inputs.push(input.clone());
            self.start_worker(
                leaf_path,
                publisher,
                endpoints,
                WorkerMode::Cooperative {
                    poll_interval: self.poll_interval,
                },
            );
            match (link, resolver) {
                (Some(link), Some(resolver)) => members.push(CoupledMember {
                    link,
                    resolver,
                    objective,
                }),
                _ => {
                    let _ = input.send(LeafInput::PoisonPill);
                }
            }
        }

        let driver = CoupledDriver::new(
            members,
            |name| self.globals.is_global_variable(name),
            global,
            path.clone(),
            self.driver_options(settings),
            self.stop.clone(),
        );
        self.spawn_driver(format!("simrun-coupled-{path}"), inputs, move || {
            driver.run();
        })
    }

    fn start_worker(
        &self,
        path: String,
        publisher: Sender<LeafMessage>,
        endpoints: WorkerEndpoints,
        mode: WorkerMode,
    ) {
        let spec = WorkerSpec {
            path: path.clone(),
            factory: self.factory.clone(),
            output_dir: self.output_dir.clone(),
            endpoints,
            stop: self.stop.clone(),
            mode,
        };
        if let Err(error) = self.pool.start(move || {
            run_worker(spec);
        }) {
            error!(leaf = %path, %error, "could not start worker");
            let _ = publisher.send(LeafMessage::Finished(WorkerExit::Crashed {
                reason: error.to_string(),
            }));
        }
    }

    /// Run a driver on its own thread. Its leaves get a poison pill if the
    /// driver dies before sending one.
    fn spawn_driver<F>(
        &self,
        name: String,
        inputs: Vec<Sender<LeafInput>>,
        body: F,
    ) -> Option<JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        let fallback = inputs.clone();
        let spawned = thread::Builder::new().name(name).spawn(move || {
            if panic::catch_unwind(AssertUnwindSafe(body)).is_err() {
                error!("optimization driver panicked");
                for input in &inputs {
                    let _ = input.send(LeafInput::PoisonPill);
                }
            }
        });
        match spawned {
            Ok(handle) => Some(handle),
            Err(error) => {
                error!(%error, "could not spawn optimization driver");
                for input in fallback {
                    let _ = input.send(LeafInput::PoisonPill);
                }
                None
            }
        }
    }
}

/// Handle of a running run.
pub struct RunHandle {
    run_id: Uuid,
    module: String,
    mode: ExecutionMode,
    plan: ExecutionPlan,
    leaves: Vec<LeafHandle>,
    group_paths: HashMap<NodeId, Option<String>>,
    aggregator: ResultsAggregator,
    stop: StopSignal,
    pool: Arc<WorkerPool>,
    dispatcher: Option<JoinHandle<()>>,
    backlog: Vec<RunEvent>,
    pending: usize,
    exits: HashMap<NodeId, WorkerExit>,
    optimizations: Vec<OptimizationResult>,
    poll_interval: Duration,
    started_at: DateTime<Utc>,
    finished: Option<RunFinished>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn aggregator(&self) -> &ResultsAggregator {
        &self.aggregator
    }

    pub fn pool_capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Request a cooperative stop. Optimizations abort before their next
    /// evaluation; leaves not yet dispatched are settled as stopped.
    pub fn stop(&self) {
        if !self.stop.is_triggered() {
            info!(run = %self.run_id, "stop requested");
        }
        self.stop.trigger();
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    pub fn finished(&self) -> Option<&RunFinished> {
        self.finished.as_ref()
    }

    /// Drain every leaf's result channel without blocking.
    pub fn poll(&mut self) -> Vec<RunEvent> {
        let mut events = std::mem::take(&mut self.backlog);
        if self.finished.is_some() {
            return events;
        }
        self.drain(&mut events);
        if self.pending == 0 {
            // pick up messages published just before the last exit
            self.drain(&mut events);
            self.finish();
        }
        events
    }

    /// Poll until the run finishes, handing every event to `on_event`.
    pub fn wait_with<F>(&mut self, mut on_event: F) -> Option<&RunFinished>
    where
        F: FnMut(RunEvent),
    {
        loop {
            for event in self.poll() {
                on_event(event);
            }
            if self.finished.is_some() {
                return self.finished.as_ref();
            }
            thread::sleep(self.poll_interval);
        }
    }

    /// Poll until the run finishes and return every event.
    pub fn wait(&mut self) -> Vec<RunEvent> {
        let mut events = Vec::new();
        self.wait_with(|event| events.push(event));
        events
    }

    fn drain(&mut self, events: &mut Vec<RunEvent>) {
        for index in 0..self.leaves.len() {
            while let Ok(message) = self.leaves[index].results.try_recv() {
                self.handle(index, message, events);
            }
        }
    }

    fn handle(&mut self, index: usize, message: LeafMessage, events: &mut Vec<RunEvent>) {
        let leaf = self.leaves[index].node;
        let path = self.leaves[index].path.clone();
        match message {
            LeafMessage::Evaluation {
                variable_values,
                results,
            } => match self.aggregator.update(leaf, Some(variable_values.as_slice()), &results) {
                Ok((view, group)) => events.push(RunEvent::ResultsUpdated {
                    leaf,
                    group_path: self.group_paths.get(&leaf).cloned().flatten(),
                    path,
                    view,
                    group,
                }),
                Err(error) => warn!(leaf = %path, %error, "results for unknown leaf"),
            },
            LeafMessage::Finished(exit) => {
                let is_sample_leaf = matches!(
                    self.plan.tree.node(leaf).map(|n| &n.kind),
                    Ok(NodeKind::SampleLeaf(_))
                );
                if is_sample_leaf && !self.exits.contains_key(&leaf) {
                    self.exits.insert(leaf, exit.clone());
                    self.pending = self.pending.saturating_sub(1);
                }
                events.push(RunEvent::Message {
                    leaf,
                    path,
                    message: LeafMessage::Finished(exit),
                });
            }
            LeafMessage::OptimizationSummary(result) => {
                self.optimizations.push(result.clone());
                events.push(RunEvent::Message {
                    leaf,
                    path,
                    message: LeafMessage::OptimizationSummary(result),
                });
            }
            message => events.push(RunEvent::Message {
                leaf,
                path,
                message,
            }),
        }
    }

    fn finish(&mut self) {
        if let Some(dispatcher) = self.dispatcher.take() {
            if dispatcher.join().is_err() {
                error!(run = %self.run_id, "dispatcher thread failed");
            }
        }
        let exits: Vec<(String, WorkerExit)> = self
            .plan
            .tree
            .sample_leaves()
            .into_iter()
            .filter_map(|leaf| {
                let exit = self.exits.get(&leaf)?.clone();
                Some((self.plan.tree.path(leaf).ok()?, exit))
            })
            .collect();
        let finished = RunFinished {
            run_id: self.run_id,
            module: self.module.clone(),
            mode: self.mode,
            exits,
            optimizations: std::mem::take(&mut self.optimizations),
            stopped: self.stop.is_triggered(),
            started_at: self.started_at,
            finished_at: Utc::now(),
        };
        let crashed = finished.crashed().len();
        if crashed > 0 {
            warn!(run = %self.run_id, crashed, "run finished with crashed workers");
        } else {
            info!(
                run = %self.run_id,
                leaves = finished.exits.len(),
                stopped = finished.stopped,
                "run finished"
            );
        }
        self.finished = Some(finished);
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        if self.finished.is_none() {
            self.stop.trigger();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::{demo_registry, GAUSSIAN, PARABOLA_FIT};
    use sr_types::{
        Layer, LayerKind, ModuleContext, ModuleDescriptor, ModuleError, ParameterSet,
        ParameterValue, ParameterValues, ResultsMap, SolverMethod, SrError, Termination, Variable,
    };

    fn config() -> EngineConfig {
        EngineConfig::default()
            .with_max_parallel(2)
            .with_poll_interval(2)
    }

    fn gaussian_sample(name: &str) -> Sample {
        Sample::new(name)
            .with_generic("amplitude", ParameterValue::bound("A"))
            .with_generic("position", ParameterValue::bound("P"))
            .with_generic("width", 1.0)
            .with_generic("points", 11.0)
            .with_variable(Variable::new("A", 1.0).with_range(1.0, 3.0, 1.0).varying(true))
            .with_variable(Variable::new("P", 0.0).with_range(0.0, 3.0, 1.0).varying(true))
    }

    fn parabola_sample(name: &str, target: f64) -> Sample {
        Sample::new(name)
            .with_generic("center", ParameterValue::bound("C"))
            .with_generic("curvature", ParameterValue::bound("K"))
            .with_evaluation_set(
                ParameterSet::new()
                    .with("target_center", target)
                    .with("target_curvature", 0.5)
                    .with("points", 21.0),
            )
            .with_layer(Layer::new("baseline", LayerKind::Standard).with("offset", 0.0))
            .with_variable(Variable::new("C", 0.0).with_range(-5.0, 5.0, 1.0).varying(true))
            .with_variable(Variable::new("K", 0.5).with_range(0.5, 0.5, 1.0))
            .with_optimization(
                OptimizationSettings::default()
                    .with_method(SolverMethod::NelderMead)
                    .with_max_iterations(50),
            )
    }

    #[test]
    fn variation_run_fills_one_row_per_grid_point() {
        let executor = Executor::new(config(), demo_registry());
        let globals = GlobalSettings::new(ExecutionMode::Variation);

        let mut run = executor.start(GAUSSIAN, &[gaussian_sample("s1")], &globals).unwrap();
        let group = &run.plan().groups[0];
        assert!(group.global.is_some());
        assert_eq!(group.leaves.len(), 12);

        let events = run.wait();
        let finished = run.finished().unwrap().clone();

        assert_eq!(finished.exits.len(), 12);
        assert!(finished.all_completed());
        let updates = events
            .iter()
            .filter(|e| matches!(e, RunEvent::ResultsUpdated { .. }))
            .count();
        assert_eq!(updates, 12);

        let view = run.aggregator().group(0).unwrap();
        assert!(view.show_variables);
        assert!(view.rows.iter().all(|row| row.results.contains_key("peak")));
        let last = &view.rows[11];
        assert_eq!(last.variable_values, vec![3.0, 3.0]);
        assert_eq!(last.results["peak"], 3.0);
        assert!(events.iter().any(|e| matches!(
            e,
            RunEvent::ResultsUpdated { group_path: Some(p), .. } if p == "s1/global"
        )));
    }

    #[test]
    fn single_run_settles_every_leaf() {
        let executor = Executor::new(config(), demo_registry());
        let globals = GlobalSettings::new(ExecutionMode::Single);
        let samples = [gaussian_sample("a"), gaussian_sample("b"), gaussian_sample("c")];

        let mut run = executor.start(GAUSSIAN, &samples, &globals).unwrap();
        let events = run.wait();

        let finished = run.finished().unwrap();
        let paths: Vec<&str> = finished.exits.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["a", "b", "c"]);
        assert!(events.iter().any(|e| matches!(
            e,
            RunEvent::Message { message: LeafMessage::Plot(_), .. }
        )));
        // calculators get an aggregate leaf in single mode
        assert_eq!(run.plan().tree.global_leaves().len(), 1);
    }

    #[test]
    fn optimization_run_publishes_summary_and_completes() {
        let executor = Executor::new(config(), demo_registry());
        let globals = GlobalSettings::new(ExecutionMode::Optimization);

        let mut run = executor
            .start(PARABOLA_FIT, &[parabola_sample("s1", 1.5)], &globals)
            .unwrap();
        let events = run.wait();
        let finished = run.finished().unwrap();

        assert!(finished.all_completed());
        assert_eq!(finished.optimizations.len(), 1);
        let result = &finished.optimizations[0];
        assert_eq!(result.objective, "chi2");
        assert!(!result.maximize);
        assert!(result.evaluations <= 50);
        assert!(result.variables.contains_key("C"));
        // warm-up plus at most fifty solver evaluations
        let updates = events
            .iter()
            .filter(|e| matches!(e, RunEvent::ResultsUpdated { .. }))
            .count();
        assert!(updates >= 2 && updates <= 51);
    }

    #[test]
    fn coupled_run_reports_on_global_leaf() {
        let executor = Executor::new(config().with_max_parallel(1), demo_registry());
        let globals = GlobalSettings::new(ExecutionMode::CoupledOptimization)
            .with_variable(Variable::new("K", 0.5).with_range(0.1, 1.0, 0.1).varying(true));

        let mut run = executor
            .start(
                PARABOLA_FIT,
                &[parabola_sample("s1", 1.0), parabola_sample("s2", -1.0)],
                &globals,
            )
            .unwrap();
        // the pool grows to hold the whole group
        assert_eq!(run.pool_capacity(), 2);
        let events = run.wait();
        let finished = run.finished().unwrap();

        assert!(finished.all_completed());
        assert_eq!(finished.optimizations.len(), 1);
        assert_eq!(finished.optimizations[0].objective, "chi2 (s1), chi2 (s2)");
        assert!(finished.optimizations[0].variables.contains_key("C (s2)"));
        assert!(events.iter().any(|e| matches!(
            e,
            RunEvent::Message { path, message: LeafMessage::OptimizationSummary(_), .. }
                if path == "evaluation_set_0/global"
        )));
    }

    #[derive(Default)]
    struct Slow {
        x: f64,
    }

    impl sr_types::Module for Slow {
        fn configure_generic(&mut self, values: &ParameterValues) -> Result<(), ModuleError> {
            self.x = values.require_float("x")?;
            Ok(())
        }

        fn run(&mut self, _context: &ModuleContext) -> Result<(), ModuleError> {
            thread::sleep(Duration::from_millis(20));
            Ok(())
        }

        fn results(&self) -> Option<ResultsMap> {
            Some(ResultsMap::from([("cost".to_string(), (self.x - 7.3).powi(2))]))
        }
    }

    struct Explodes;

    impl sr_types::Module for Explodes {
        fn configure_generic(&mut self, _values: &ParameterValues) -> Result<(), ModuleError> {
            Ok(())
        }

        fn run(&mut self, _context: &ModuleContext) -> Result<(), ModuleError> {
            panic!("solver diverged");
        }
    }

    fn test_registry() -> ModuleRegistry {
        let mut registry = demo_registry();
        registry.register(ModuleDescriptor::new("slow", ModuleKind::Simulator), || {
            Box::new(Slow::default())
        });
        registry.register(ModuleDescriptor::new("explodes", ModuleKind::Simulator), || {
            Box::new(Explodes)
        });
        registry
    }

    #[test]
    fn stop_aborts_optimization_and_releases_leaves() {
        let executor = Executor::new(config(), test_registry());
        let globals = GlobalSettings::new(ExecutionMode::Optimization);
        let sample = Sample::new("s1")
            .with_generic("x", ParameterValue::bound("X"))
            .with_variable(Variable::new("X", 1.0).with_range(0.0, 10.0, 1.0).varying(true))
            .with_optimization(
                OptimizationSettings::default()
                    .with_objective("cost", false)
                    .with_max_iterations(100_000),
            );

        let mut run = executor.start("slow", &[sample], &globals).unwrap();
        let mut updates = 0;
        while updates < 3 && !run.is_finished() {
            updates += run
                .poll()
                .iter()
                .filter(|e| matches!(e, RunEvent::ResultsUpdated { .. }))
                .count();
            thread::sleep(Duration::from_millis(1));
        }
        run.stop();
        run.wait();

        let finished = run.finished().unwrap();
        assert!(finished.stopped);
        assert!(finished.all_completed());
        assert_eq!(finished.optimizations[0].termination, Termination::Aborted);
    }

    #[test]
    fn stop_aborts_coupled_optimization_and_releases_every_leaf() {
        let executor = Executor::new(config(), test_registry());
        let globals = GlobalSettings::new(ExecutionMode::CoupledOptimization);
        let slow_sample = |name: &str| {
            Sample::new(name)
                .with_generic("x", ParameterValue::bound("X"))
                .with_variable(Variable::new("X", 1.0).with_range(0.0, 10.0, 1.0).varying(true))
                .with_optimization(
                    OptimizationSettings::default()
                        .with_objective("cost", false)
                        .with_max_iterations(100_000),
                )
        };

        let mut run = executor
            .start("slow", &[slow_sample("s1"), slow_sample("s2")], &globals)
            .unwrap();
        let mut updates = 0;
        while updates < 4 && !run.is_finished() {
            updates += run
                .poll()
                .iter()
                .filter(|e| matches!(e, RunEvent::ResultsUpdated { .. }))
                .count();
            thread::sleep(Duration::from_millis(1));
        }
        run.stop();
        run.wait();

        let finished = run.finished().unwrap();
        assert!(finished.stopped);
        assert_eq!(finished.exits.len(), 2);
        // a cooperative leaf either takes its pill or notices the stop first
        assert!(finished
            .exits
            .iter()
            .all(|(_, exit)| matches!(exit, WorkerExit::Completed | WorkerExit::Stopped)));
        assert_eq!(finished.optimizations.len(), 1);
        assert_eq!(finished.optimizations[0].termination, Termination::Aborted);
        assert_eq!(finished.optimizations[0].objective, "cost (s1), cost (s2)");
    }

    #[test]
    fn crashed_worker_still_finishes_run() {
        let executor = Executor::new(config(), test_registry());
        let globals = GlobalSettings::new(ExecutionMode::Single);

        let mut run = executor
            .start("explodes", &[Sample::new("a"), Sample::new("b")], &globals)
            .unwrap();
        run.wait();

        let finished = run.finished().unwrap();
        assert_eq!(finished.crashed(), vec!["a", "b"]);
        assert!(!finished.all_completed());
    }

    #[test]
    fn start_rejects_bad_input() {
        let executor = Executor::new(config(), demo_registry());
        let globals = GlobalSettings::new(ExecutionMode::Single);

        assert!(matches!(
            executor.start("missing", &[Sample::new("a")], &globals),
            Err(SrError::Module(_))
        ));
        assert!(matches!(
            executor.start(GAUSSIAN, &[Sample::new("a").disabled()], &globals),
            Err(SrError::Tree(TreeError::NoSamples))
        ));
        let unbound = Sample::new("a").with_generic("amplitude", ParameterValue::bound("NOPE"));
        assert!(matches!(
            executor.start(GAUSSIAN, &[unbound], &globals),
            Err(SrError::Resolution(_))
        ));
    }

    #[test]
    fn skipped_samples_are_announced_and_tree_exported() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Executor::new(
            config().with_output_dir(dir.path()).with_tree_export(true),
            demo_registry(),
        );
        let globals = GlobalSettings::new(ExecutionMode::Single);

        let mut run = executor
            .start(
                PARABOLA_FIT,
                &[parabola_sample("fit", 0.0), Sample::new("bare")],
                &globals,
            )
            .unwrap();
        let events = run.wait();

        assert!(matches!(
            &events[0],
            RunEvent::Callback { message, .. } if message.ends_with("bare")
        ));
        assert!(dir.path().join("parabola_fit_tree.txt").exists());
        assert_eq!(run.finished().unwrap().exits.len(), 1);
    }
}
