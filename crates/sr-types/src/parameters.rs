use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{ExpressionError, ModuleError};
use crate::expression::Formula;

/// A named free parameter that can be swept or optimized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub value: f64,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    #[serde(default)]
    pub vary: bool,
}

impl Variable {
    /// A non-varying variable pinned at `value`.
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            min: value,
            max: value,
            step: 1.0,
            vary: false,
        }
    }

    pub fn with_range(mut self, min: f64, max: f64, step: f64) -> Self {
        self.min = min;
        self.max = max;
        self.step = step;
        self
    }

    pub fn varying(mut self, vary: bool) -> Self {
        self.vary = vary;
        self
    }

    pub fn set_value(&mut self, value: f64) {
        self.value = value;
    }

    pub fn bounds(&self) -> (f64, f64) {
        (self.min, self.max)
    }
}

/// A named formula over variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expression {
    pub name: String,
    pub formula: String,
}

impl Expression {
    pub fn new(name: impl Into<String>, formula: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            formula: formula.into(),
        }
    }

    pub fn parse(&self) -> Result<Formula, ExpressionError> {
        Formula::parse(&self.formula)
    }
}

/// A float slot that either holds a literal or names a variable/expression.
///
/// Serialized untagged: a JSON number is `Fixed`, a JSON string is `Bound`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BindableFloat {
    Fixed(f64),
    Bound(String),
}

impl BindableFloat {
    pub fn bound(name: impl Into<String>) -> Self {
        Self::Bound(name.into())
    }

    pub fn binding(&self) -> Option<&str> {
        match self {
            Self::Fixed(_) => None,
            Self::Bound(name) => Some(name),
        }
    }
}

impl From<f64> for BindableFloat {
    fn from(value: f64) -> Self {
        Self::Fixed(value)
    }
}

impl fmt::Display for BindableFloat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(v) => write!(f, "{v}"),
            Self::Bound(name) => f.write_str(name),
        }
    }
}

/// Declared value of a parameter slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterValue {
    Bindable(BindableFloat),
    Bool(bool),
    Text(String),
    Range { start: f64, stop: f64, step: f64 },
    List(Vec<f64>),
}

impl ParameterValue {
    pub fn fixed(value: f64) -> Self {
        Self::Bindable(BindableFloat::Fixed(value))
    }

    pub fn bound(name: impl Into<String>) -> Self {
        Self::Bindable(BindableFloat::bound(name))
    }

    /// Variable or expression name of a bound slot.
    pub fn binding(&self) -> Option<&str> {
        match self {
            Self::Bindable(value) => value.binding(),
            _ => None,
        }
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        Self::fixed(value)
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<BindableFloat> for ParameterValue {
    fn from(value: BindableFloat) -> Self {
        Self::Bindable(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: ParameterValue,
}

/// Ordered collection of declared parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet {
    parameters: Vec<Parameter>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Insert or replace in place, keeping declaration order.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ParameterValue>) {
        let name = name.into();
        let value = value.into();
        match self.parameters.iter_mut().find(|p| p.name == name) {
            Some(existing) => existing.value = value,
            None => self.parameters.push(Parameter { name, value }),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| &p.value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.parameters.iter()
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }
}

/// Physical role of a layer in a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Standard,
    Coherent,
    Semi,
    Substrate,
    Electrode,
    Interface,
    Transport,
    Emission,
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Standard => "standard",
            Self::Coherent => "coherent",
            Self::Semi => "semi",
            Self::Substrate => "substrate",
            Self::Electrode => "electrode",
            Self::Interface => "interface",
            Self::Transport => "transport",
            Self::Emission => "emission",
        };
        f.write_str(name)
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub name: String,
    pub kind: LayerKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub parameters: ParameterSet,
}

impl Layer {
    pub fn new(name: impl Into<String>, kind: LayerKind) -> Self {
        Self {
            name: name.into(),
            kind,
            enabled: true,
            parameters: ParameterSet::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.parameters.insert(name, value);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

// ---------------------------------------------------------------------------
// Resolved values handed to modules
// ---------------------------------------------------------------------------

/// A concrete value after bindings have been resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResolvedValue {
    Float(f64),
    Bool(bool),
    Text(String),
    Range { start: f64, stop: f64, step: f64 },
    List(Vec<f64>),
}

impl ResolvedValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Verbatim conversion of a non-bindable declared value.
    ///
    /// Returns `None` for bindable slots, which need resolution first.
    pub fn from_declared(value: &ParameterValue) -> Option<Self> {
        match value {
            ParameterValue::Bindable(BindableFloat::Fixed(v)) => Some(Self::Float(*v)),
            ParameterValue::Bindable(BindableFloat::Bound(_)) => None,
            ParameterValue::Bool(b) => Some(Self::Bool(*b)),
            ParameterValue::Text(t) => Some(Self::Text(t.clone())),
            ParameterValue::Range { start, stop, step } => Some(Self::Range {
                start: *start,
                stop: *stop,
                step: *step,
            }),
            ParameterValue::List(values) => Some(Self::List(values.clone())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueEntry {
    pub name: String,
    pub value: ResolvedValue,
    /// Set when the entry was touched by the most recent container.
    pub updated: bool,
}

/// Ordered resolved values of one parameter collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterValues {
    entries: Vec<ValueEntry>,
}

impl ParameterValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry, marking it updated.
    pub fn insert(&mut self, name: impl Into<String>, value: ResolvedValue) {
        let name = name.into();
        match self.entries.iter_mut().find(|e| e.name == name) {
            Some(entry) => {
                entry.value = value;
                entry.updated = true;
            }
            None => self.entries.push(ValueEntry {
                name,
                value,
                updated: true,
            }),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: ResolvedValue) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ResolvedValue> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| &e.value)
    }

    pub fn get_float(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(ResolvedValue::as_f64)
    }

    /// Fetch a float a module cannot run without.
    pub fn require_float(&self, name: &str) -> Result<f64, ModuleError> {
        match self.get(name) {
            None => Err(ModuleError::MissingParameter {
                parameter: name.to_string(),
            }),
            Some(value) => value.as_f64().ok_or_else(|| ModuleError::InvalidParameter {
                parameter: name.to_string(),
                message: format!("expected a float, got {value:?}"),
            }),
        }
    }

    pub fn is_updated(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name && e.updated)
    }

    pub fn any_updated(&self) -> bool {
        self.entries.iter().any(|e| e.updated)
    }

    /// Apply a delta: only the entries present in `delta` end up updated.
    pub fn merge(&mut self, delta: &ParameterValues) {
        for entry in &mut self.entries {
            entry.updated = false;
        }
        for entry in &delta.entries {
            self.insert(entry.name.clone(), entry.value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValueEntry> {
        self.entries.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolved values of one enabled, accepted layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerValues {
    pub name: String,
    pub kind: LayerKind,
    pub values: ParameterValues,
}
