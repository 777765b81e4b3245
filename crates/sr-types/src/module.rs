//! The module interface and the registry that resolves module names.

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::errors::ModuleError;
use crate::messages::{LeafMessage, PlotData, ResultsMap, TabularResult};
use crate::parameters::{LayerKind, LayerValues, ParameterValues};

/// Closed set of module roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    Reader,
    Simulator,
    Fitter,
    Calculator,
}

/// Static facts about a module the engine needs before instantiating it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub name: String,
    pub kind: ModuleKind,
    pub has_evaluation_set_parameters: bool,
    /// Layer kinds the module accepts. Empty means the module takes no layers.
    pub layer_kinds: Vec<LayerKind>,
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>, kind: ModuleKind) -> Self {
        Self {
            name: name.into(),
            kind,
            has_evaluation_set_parameters: false,
            layer_kinds: Vec::new(),
        }
    }

    pub fn with_evaluation_sets(mut self) -> Self {
        self.has_evaluation_set_parameters = true;
        self
    }

    pub fn with_layer_kinds(mut self, kinds: Vec<LayerKind>) -> Self {
        self.layer_kinds = kinds;
        self
    }

    pub fn accepts_layer(&self, kind: LayerKind) -> bool {
        self.layer_kinds.contains(&kind)
    }
}

/// Handle a module uses to publish figures and notices for its leaf.
#[derive(Debug, Clone)]
pub struct ModuleContext {
    leaf: String,
    output_dir: PathBuf,
    results: Sender<LeafMessage>,
}

impl ModuleContext {
    pub fn new(leaf: impl Into<String>, output_dir: PathBuf, results: Sender<LeafMessage>) -> Self {
        Self {
            leaf: leaf.into(),
            output_dir,
            results,
        }
    }

    pub fn leaf(&self) -> &str {
        &self.leaf
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn publish_plot(&self, plot: PlotData) {
        self.publish(LeafMessage::Plot(plot));
    }

    pub fn publish_table(&self, table: TabularResult) {
        self.publish(LeafMessage::Table(table));
    }

    pub fn callback(&self, title: impl Into<String>, message: impl Into<String>) {
        self.publish(LeafMessage::callback(title, message));
    }

    pub fn publish(&self, message: LeafMessage) {
        // Best-effort: a dropped receiver means the run is being torn down.
        let _ = self.results.send(message);
    }
}

/// A user computation the engine can configure and run.
///
/// The configure methods receive the worker's merged configuration; entries
/// flagged `updated` changed since the previous run.
pub trait Module: Send {
    fn configure_generic(&mut self, values: &ParameterValues) -> Result<(), ModuleError>;

    fn configure_evaluation_set(&mut self, _values: &ParameterValues) -> Result<(), ModuleError> {
        Ok(())
    }

    fn configure_layers(&mut self, _layers: &[LayerValues]) -> Result<(), ModuleError> {
        Ok(())
    }

    fn run(&mut self, context: &ModuleContext) -> Result<(), ModuleError>;

    /// Named scalar results of the last run, if the module produces any.
    fn results(&self) -> Option<ResultsMap> {
        None
    }

    /// Result name holding the fit quality. Only fitters report one.
    fn fit_value_name(&self) -> Option<String> {
        None
    }
}

pub type ModuleFactory = Arc<dyn Fn() -> Box<dyn Module> + Send + Sync>;

struct RegisteredModule {
    descriptor: ModuleDescriptor,
    factory: ModuleFactory,
}

/// Resolves module names to descriptors and fresh instances.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, Arc<RegisteredModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, descriptor: ModuleDescriptor, factory: F)
    where
        F: Fn() -> Box<dyn Module> + Send + Sync + 'static,
    {
        self.modules.insert(
            descriptor.name.clone(),
            Arc::new(RegisteredModule {
                descriptor,
                factory: Arc::new(factory),
            }),
        );
    }

    pub fn descriptor(&self, name: &str) -> Result<&ModuleDescriptor, ModuleError> {
        self.modules
            .get(name)
            .map(|m| &m.descriptor)
            .ok_or_else(|| ModuleError::NotFound {
                name: name.to_string(),
            })
    }

    pub fn factory(&self, name: &str) -> Result<ModuleFactory, ModuleError> {
        self.modules
            .get(name)
            .map(|m| m.factory.clone())
            .ok_or_else(|| ModuleError::NotFound {
                name: name.to_string(),
            })
    }

    pub fn instantiate(&self, name: &str) -> Result<Box<dyn Module>, ModuleError> {
        Ok((self.factory(name)?)())
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.modules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.names())
            .finish()
    }
}
