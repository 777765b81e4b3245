use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::OptimizationError;
use crate::parameters::{Expression, Layer, ParameterSet, ParameterValue, Variable};

/// How a run decomposes its samples into work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Single,
    Variation,
    Optimization,
    CoupledOptimization,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::Single
    }
}

impl ExecutionMode {
    pub fn is_optimization(&self) -> bool {
        matches!(self, Self::Optimization | Self::CoupledOptimization)
    }
}

/// Minimizer selection, named the way users know them from scipy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SolverMethod {
    #[serde(rename = "Nelder-Mead")]
    NelderMead,
    Powell,
    #[serde(rename = "CG")]
    ConjugateGradient,
    #[serde(rename = "BFGS")]
    Bfgs,
    #[serde(rename = "L-BFGS-B")]
    LBfgsB,
    #[serde(rename = "TNC")]
    Tnc,
    #[serde(rename = "SLSQP")]
    Slsqp,
    #[serde(rename = "trust-constr")]
    TrustConstr,
}

impl SolverMethod {
    pub const ALL: [SolverMethod; 8] = [
        Self::NelderMead,
        Self::Powell,
        Self::ConjugateGradient,
        Self::Bfgs,
        Self::LBfgsB,
        Self::Tnc,
        Self::Slsqp,
        Self::TrustConstr,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NelderMead => "Nelder-Mead",
            Self::Powell => "Powell",
            Self::ConjugateGradient => "CG",
            Self::Bfgs => "BFGS",
            Self::LBfgsB => "L-BFGS-B",
            Self::Tnc => "TNC",
            Self::Slsqp => "SLSQP",
            Self::TrustConstr => "trust-constr",
        }
    }

    /// Whether the method needs (numerical) gradients.
    pub fn is_gradient_based(&self) -> bool {
        !matches!(self, Self::NelderMead | Self::Powell)
    }
}

impl Default for SolverMethod {
    fn default() -> Self {
        Self::NelderMead
    }
}

impl fmt::Display for SolverMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SolverMethod {
    type Err = OptimizationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|m| m.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| OptimizationError::UnknownMethod {
                method: s.to_string(),
            })
    }
}

/// Objective and solver settings of an optimization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationSettings {
    /// Result name to optimize.
    pub objective: String,
    pub maximize: bool,
    pub method: SolverMethod,
    pub max_iterations: usize,
}

impl Default for OptimizationSettings {
    fn default() -> Self {
        Self {
            objective: String::new(),
            maximize: false,
            method: SolverMethod::NelderMead,
            max_iterations: 1000,
        }
    }
}

impl OptimizationSettings {
    pub fn with_objective(mut self, objective: &str, maximize: bool) -> Self {
        self.objective = objective.to_string();
        self.maximize = maximize;
        self
    }

    pub fn with_method(mut self, method: SolverMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n;
        self
    }
}

fn default_enabled() -> bool {
    true
}

/// One sample: a full module configuration plus its free parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub generic: ParameterSet,
    #[serde(default)]
    pub evaluation_sets: Vec<ParameterSet>,
    #[serde(default)]
    pub layers: Vec<Layer>,
    #[serde(default)]
    pub variables: Vec<Variable>,
    #[serde(default)]
    pub expressions: Vec<Expression>,
    #[serde(default)]
    pub optimization: OptimizationSettings,
}

impl Sample {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            generic: ParameterSet::new(),
            evaluation_sets: Vec::new(),
            layers: Vec::new(),
            variables: Vec::new(),
            expressions: Vec::new(),
            optimization: OptimizationSettings::default(),
        }
    }

    pub fn with_generic(mut self, name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.generic.insert(name, value);
        self
    }

    pub fn with_evaluation_set(mut self, set: ParameterSet) -> Self {
        self.evaluation_sets.push(set);
        self
    }

    pub fn with_layer(mut self, layer: Layer) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn with_variable(mut self, variable: Variable) -> Self {
        self.variables.push(variable);
        self
    }

    pub fn with_expression(mut self, expression: Expression) -> Self {
        self.expressions.push(expression);
        self
    }

    pub fn with_optimization(mut self, settings: OptimizationSettings) -> Self {
        self.optimization = settings;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Run-wide settings shared by every sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSettings {
    pub mode: ExecutionMode,
    pub variables: Vec<Variable>,
    pub expressions: Vec<Expression>,
    pub optimization: OptimizationSettings,
    /// Use the global method/maximize/iteration cap instead of each sample's.
    pub use_global_optimization_settings: bool,
}

impl GlobalSettings {
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn with_variable(mut self, variable: Variable) -> Self {
        self.variables.push(variable);
        self
    }

    pub fn with_expression(mut self, expression: Expression) -> Self {
        self.expressions.push(expression);
        self
    }

    pub fn with_optimization(mut self, settings: OptimizationSettings, use_global: bool) -> Self {
        self.optimization = settings;
        self.use_global_optimization_settings = use_global;
        self
    }

    pub fn is_global_variable(&self, name: &str) -> bool {
        self.variables.iter().any(|v| v.name == name)
    }

    /// Effective settings for `sample`. The objective name always comes from the sample.
    pub fn optimization_settings_for(&self, sample: &Sample) -> OptimizationSettings {
        if self.use_global_optimization_settings {
            OptimizationSettings {
                objective: sample.optimization.objective.clone(),
                ..self.optimization.clone()
            }
        } else {
            sample.optimization.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solver_method_round_trips_names() {
        for method in SolverMethod::ALL {
            let parsed: SolverMethod = method.as_str().parse().unwrap();
            assert_eq!(parsed, method);
            let json = serde_json::to_string(&method).unwrap();
            assert_eq!(json, format!("\"{}\"", method.as_str()));
        }
        assert!("simplex".parse::<SolverMethod>().is_err());
        assert_eq!("nelder-mead".parse::<SolverMethod>().unwrap(), SolverMethod::NelderMead);
    }

    #[test]
    fn global_settings_override_keeps_sample_objective() {
        let sample = Sample::new("a").with_optimization(
            OptimizationSettings::default()
                .with_objective("chi2", false)
                .with_max_iterations(10),
        );
        let global = GlobalSettings::new(ExecutionMode::Optimization).with_optimization(
            OptimizationSettings::default()
                .with_objective("ignored", true)
                .with_method(SolverMethod::Powell)
                .with_max_iterations(50),
            true,
        );

        let effective = global.optimization_settings_for(&sample);
        assert_eq!(effective.objective, "chi2");
        assert!(effective.maximize);
        assert_eq!(effective.method, SolverMethod::Powell);
        assert_eq!(effective.max_iterations, 50);

        let local = GlobalSettings {
            use_global_optimization_settings: false,
            ..global
        };
        assert_eq!(local.optimization_settings_for(&sample).max_iterations, 10);
    }

    #[test]
    fn sample_deserializes_with_defaults() {
        let json = r#"{
            "name": "s1",
            "generic": [{"name": "width", "value": {"bindable": "VAR_0"}}],
            "variables": [{"name": "VAR_0", "value": 1.0, "min": 0.5, "max": 2.0, "step": 0.5, "vary": true}]
        }"#;
        let sample: Sample = serde_json::from_str(json).unwrap();
        assert!(sample.enabled);
        assert_eq!(sample.generic.get("width"), Some(&ParameterValue::bound("VAR_0")));
        assert_eq!(sample.optimization.max_iterations, 1000);
    }
}
