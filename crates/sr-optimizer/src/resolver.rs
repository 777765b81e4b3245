//! Splits a sample's bindable parameters into fixed and varied ones and
//! materializes input containers from them.

use rayon::prelude::*;
use std::collections::HashMap;
use tracing::debug;

use sr_types::{
    Expression, Formula, GlobalSettings, InputContainer, LayerKind, LayerValues,
    ModuleDescriptor, ParameterSet, ParameterValue, ParameterValues, ResolutionError,
    ResolvedValue, Sample, Variable,
};

use crate::grid::VariationGrid;

/// Name lookup over sample-local and global definitions.
#[derive(Clone, Copy)]
enum Definition<'a> {
    Variable(&'a Variable),
    Expression(&'a Expression),
}

/// How one parameter slot is filled at materialization time.
#[derive(Debug, Clone)]
enum Slot {
    Fixed(ResolvedValue),
    Variable(String),
    Expression { name: String, formula: Formula },
}

impl Slot {
    fn is_fixed(&self) -> bool {
        matches!(self, Slot::Fixed(_))
    }
}

#[derive(Debug, Clone, Default)]
struct CollectionTemplate {
    slots: Vec<(String, Slot)>,
}

#[derive(Debug, Clone)]
struct LayerTemplate {
    name: String,
    kind: LayerKind,
    collection: CollectionTemplate,
}

/// Classification state shared while walking the parameter collections.
struct Classifier<'a> {
    sample: &'a str,
    definitions: HashMap<&'a str, Definition<'a>>,
    varied_variables: Vec<Variable>,
    fixed_variables: HashMap<String, f64>,
}

impl<'a> Classifier<'a> {
    fn new(sample: &'a Sample, globals: &'a GlobalSettings) -> Self {
        let mut definitions = HashMap::new();
        // Global definitions are inserted last and shadow sample-local ones of
        // either kind.
        for (variables, expressions) in [
            (&sample.variables, &sample.expressions),
            (&globals.variables, &globals.expressions),
        ] {
            for variable in variables {
                definitions.insert(variable.name.as_str(), Definition::Variable(variable));
            }
            for expression in expressions {
                definitions.insert(expression.name.as_str(), Definition::Expression(expression));
            }
        }
        Self {
            sample: &sample.name,
            definitions,
            varied_variables: Vec::new(),
            fixed_variables: HashMap::new(),
        }
    }

    fn collection(&mut self, set: &ParameterSet) -> Result<CollectionTemplate, ResolutionError> {
        let mut template = CollectionTemplate::default();
        for parameter in set.iter() {
            let slot = self.slot(&parameter.name, &parameter.value)?;
            template.slots.push((parameter.name.clone(), slot));
        }
        Ok(template)
    }

    fn slot(&mut self, parameter: &str, value: &ParameterValue) -> Result<Slot, ResolutionError> {
        if let Some(resolved) = ResolvedValue::from_declared(value) {
            return Ok(Slot::Fixed(resolved));
        }
        let name = value.binding().unwrap_or_default();

        match self.definitions.get(name).copied() {
            Some(Definition::Variable(variable)) => {
                if variable.vary {
                    self.add_varied(variable);
                    Ok(Slot::Variable(variable.name.clone()))
                } else {
                    self.fixed_variables
                        .insert(variable.name.clone(), variable.value);
                    Ok(Slot::Fixed(ResolvedValue::Float(variable.value)))
                }
            }
            Some(Definition::Expression(expression)) => self.expression_slot(expression),
            None => Err(ResolutionError::UnknownBinding {
                sample: self.sample.to_string(),
                parameter: parameter.to_string(),
                name: name.to_string(),
            }),
        }
    }

    fn expression_slot(&mut self, expression: &Expression) -> Result<Slot, ResolutionError> {
        let expression_error = |source| ResolutionError::Expression {
            sample: self.sample.to_string(),
            name: expression.name.clone(),
            formula: expression.formula.clone(),
            source,
        };

        let formula = expression.parse().map_err(expression_error)?;

        let mut varying = Vec::new();
        for reference in formula.references() {
            match self.definitions.get(reference.as_str()).copied() {
                Some(Definition::Variable(variable)) if variable.vary => varying.push(variable),
                Some(Definition::Variable(variable)) => {
                    self.fixed_variables
                        .insert(variable.name.clone(), variable.value);
                }
                _ => {
                    return Err(expression_error(sr_types::ExpressionError::UnknownReference {
                        name: reference,
                    }))
                }
            }
        }

        if varying.is_empty() {
            let value = formula
                .evaluate(|name| self.fixed_variables.get(name).copied())
                .map_err(expression_error)?;
            return Ok(Slot::Fixed(ResolvedValue::Float(value)));
        }

        for variable in varying {
            self.add_varied(variable);
        }
        Ok(Slot::Expression {
            name: expression.name.clone(),
            formula,
        })
    }

    fn add_varied(&mut self, variable: &Variable) {
        if !self.varied_variables.iter().any(|v| v.name == variable.name) {
            self.varied_variables.push(variable.clone());
        }
    }
}

/// Resolution of one sample for one evaluation set.
#[derive(Debug, Clone)]
pub struct VariationResolver {
    sample: String,
    evaluation_set_index: Option<usize>,
    generic: CollectionTemplate,
    evaluation_set: Option<CollectionTemplate>,
    layers: Vec<LayerTemplate>,
    varied_variables: Vec<Variable>,
    fixed_variables: HashMap<String, f64>,
    grid: VariationGrid,
}

impl VariationResolver {
    /// Classify every bindable slot of `sample` visible to the module.
    ///
    /// Disabled layers and layer kinds the module does not accept are skipped.
    pub fn new(
        sample: &Sample,
        evaluation_set_index: Option<usize>,
        globals: &GlobalSettings,
        descriptor: &ModuleDescriptor,
    ) -> Result<Self, ResolutionError> {
        let mut classifier = Classifier::new(sample, globals);

        let generic = classifier.collection(&sample.generic)?;

        let evaluation_set = match evaluation_set_index {
            Some(index) => {
                let set = sample.evaluation_sets.get(index).ok_or_else(|| {
                    ResolutionError::EvaluationSetOutOfRange {
                        sample: sample.name.clone(),
                        index,
                        available: sample.evaluation_sets.len(),
                    }
                })?;
                Some(classifier.collection(set)?)
            }
            None => None,
        };

        let mut layers = Vec::new();
        for layer in &sample.layers {
            if !layer.enabled || !descriptor.accepts_layer(layer.kind) {
                continue;
            }
            layers.push(LayerTemplate {
                name: layer.name.clone(),
                kind: layer.kind,
                collection: classifier.collection(&layer.parameters)?,
            });
        }

        let grid = VariationGrid::for_variables(&classifier.varied_variables)?;

        debug!(
            sample = %sample.name,
            evaluation_set = ?evaluation_set_index,
            varied = classifier.varied_variables.len(),
            grid_rows = grid.len(),
            "resolved sample"
        );

        Ok(Self {
            sample: sample.name.clone(),
            evaluation_set_index,
            generic,
            evaluation_set,
            layers,
            varied_variables: classifier.varied_variables,
            fixed_variables: classifier.fixed_variables,
            grid,
        })
    }

    pub fn sample_name(&self) -> &str {
        &self.sample
    }

    pub fn evaluation_set_index(&self) -> Option<usize> {
        self.evaluation_set_index
    }

    /// Varied variables in first-discovered order.
    pub fn varied_variables(&self) -> &[Variable] {
        &self.varied_variables
    }

    pub fn varied_names(&self) -> Vec<&str> {
        self.varied_variables.iter().map(|v| v.name.as_str()).collect()
    }

    pub fn current_values(&self) -> Vec<f64> {
        self.varied_variables.iter().map(|v| v.value).collect()
    }

    pub fn bounds(&self) -> Vec<(f64, f64)> {
        self.varied_variables.iter().map(Variable::bounds).collect()
    }

    pub fn fixed_variables(&self) -> &HashMap<String, f64> {
        &self.fixed_variables
    }

    pub fn grid(&self) -> &VariationGrid {
        &self.grid
    }

    /// Whether the named slot resolved to a fixed value.
    pub fn is_fixed(&self, parameter: &str) -> bool {
        self.all_slots()
            .find(|(name, _)| name == parameter)
            .map(|(_, slot)| slot.is_fixed())
            .unwrap_or(false)
    }

    /// Full container at the varied variables' current values.
    pub fn single(&self) -> Result<InputContainer, ResolutionError> {
        self.materialize(&self.current_values(), true)
    }

    /// Full container at grid row `row`.
    pub fn variation(&self, row: usize) -> Result<InputContainer, ResolutionError> {
        let values = self.grid.row(row)?.to_vec();
        self.materialize(&values, true)
    }

    /// Container for a solver proposal aligned with [`Self::varied_variables`].
    pub fn optimization(
        &self,
        vector: &[f64],
        include_fixed: bool,
    ) -> Result<InputContainer, ResolutionError> {
        if vector.len() != self.varied_variables.len() {
            return Err(ResolutionError::VectorLength {
                expected: self.varied_variables.len(),
                actual: vector.len(),
            });
        }
        self.materialize(vector, include_fixed)
    }

    fn all_slots(&self) -> impl Iterator<Item = &(String, Slot)> {
        self.generic
            .slots
            .iter()
            .chain(self.evaluation_set.iter().flat_map(|c| c.slots.iter()))
            .chain(self.layers.iter().flat_map(|l| l.collection.slots.iter()))
    }

    fn materialize(
        &self,
        values: &[f64],
        include_fixed: bool,
    ) -> Result<InputContainer, ResolutionError> {
        let mut lookup = self.fixed_variables.clone();
        let variable_values: Vec<(String, f64)> = self
            .varied_variables
            .iter()
            .zip(values)
            .map(|(variable, value)| (variable.name.clone(), *value))
            .collect();
        for (name, value) in &variable_values {
            lookup.insert(name.clone(), *value);
        }

        let generic = self.fill(&self.generic, &lookup, include_fixed)?;
        let evaluation_set = self
            .evaluation_set
            .as_ref()
            .map(|c| self.fill(c, &lookup, include_fixed))
            .transpose()?;
        let layers = self
            .layers
            .iter()
            .map(|layer| {
                Ok(LayerValues {
                    name: layer.name.clone(),
                    kind: layer.kind,
                    values: self.fill(&layer.collection, &lookup, include_fixed)?,
                })
            })
            .collect::<Result<Vec<_>, ResolutionError>>()?;

        Ok(InputContainer {
            generic,
            evaluation_set,
            layers,
            includes_fixed: include_fixed,
            variable_values,
        })
    }

    fn fill(
        &self,
        template: &CollectionTemplate,
        lookup: &HashMap<String, f64>,
        include_fixed: bool,
    ) -> Result<ParameterValues, ResolutionError> {
        let mut values = ParameterValues::new();
        for (name, slot) in &template.slots {
            let value = match slot {
                Slot::Fixed(value) if include_fixed => value.clone(),
                Slot::Fixed(_) => continue,
                Slot::Variable(variable) => {
                    ResolvedValue::Float(lookup.get(variable).copied().unwrap_or(f64::NAN))
                }
                Slot::Expression {
                    name: expression,
                    formula,
                } => ResolvedValue::Float(formula.evaluate_with(lookup).map_err(|source| {
                    ResolutionError::Expression {
                        sample: self.sample.clone(),
                        name: expression.clone(),
                        formula: formula.source().to_string(),
                        source,
                    }
                })?),
            };
            values.insert(name.clone(), value);
        }
        Ok(values)
    }
}

/// All resolvers of one sample: one per evaluation set, or a single one.
#[derive(Debug, Clone)]
pub struct SampleVariation {
    pub sample: Sample,
    pub resolvers: Vec<VariationResolver>,
}

impl SampleVariation {
    pub fn resolve(
        sample: &Sample,
        globals: &GlobalSettings,
        descriptor: &ModuleDescriptor,
    ) -> Result<Self, ResolutionError> {
        let resolvers = if descriptor.has_evaluation_set_parameters && !sample.evaluation_sets.is_empty()
        {
            (0..sample.evaluation_sets.len())
                .map(|index| VariationResolver::new(sample, Some(index), globals, descriptor))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            vec![VariationResolver::new(sample, None, globals, descriptor)?]
        };
        Ok(Self {
            sample: sample.clone(),
            resolvers,
        })
    }

    pub fn name(&self) -> &str {
        &self.sample.name
    }

    pub fn evaluation_set_count(&self) -> usize {
        self.sample.evaluation_sets.len()
    }

    pub fn resolver(&self, evaluation_set: Option<usize>) -> Option<&VariationResolver> {
        match evaluation_set {
            Some(index) => self
                .resolvers
                .iter()
                .find(|r| r.evaluation_set_index() == Some(index)),
            None => self.resolvers.first(),
        }
    }
}

/// Resolve every enabled sample in parallel, preserving input order.
pub fn resolve_samples(
    samples: &[Sample],
    globals: &GlobalSettings,
    descriptor: &ModuleDescriptor,
) -> Result<Vec<SampleVariation>, ResolutionError> {
    samples
        .par_iter()
        .filter(|sample| sample.enabled)
        .map(|sample| SampleVariation::resolve(sample, globals, descriptor))
        .collect()
}
