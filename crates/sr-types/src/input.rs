use serde::{Deserialize, Serialize};

use crate::parameters::{LayerValues, ParameterValues};

/// A materialized configuration ready to be applied to a module.
///
/// A *full* container (`includes_fixed == true`) carries every resolved value.
/// A *delta* container carries only the varied entries; the worker merges it
/// into the configuration it already holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputContainer {
    pub generic: ParameterValues,
    pub evaluation_set: Option<ParameterValues>,
    pub layers: Vec<LayerValues>,
    pub includes_fixed: bool,
    /// Varied variable values this container was built from, in varied order.
    pub variable_values: Vec<(String, f64)>,
}

impl InputContainer {
    pub fn variable_vector(&self) -> Vec<f64> {
        self.variable_values.iter().map(|(_, v)| *v).collect()
    }

    /// Merge `delta` into this configuration.
    ///
    /// Afterwards only values carried by `delta` are flagged as updated.
    pub fn merge(&mut self, delta: &InputContainer) {
        self.generic.merge(&delta.generic);

        match (&mut self.evaluation_set, &delta.evaluation_set) {
            (Some(current), Some(incoming)) => current.merge(incoming),
            (None, Some(incoming)) => self.evaluation_set = Some(incoming.clone()),
            (Some(current), None) => current.merge(&ParameterValues::new()),
            (None, None) => {}
        }

        for (index, incoming) in delta.layers.iter().enumerate() {
            match self.layers.get_mut(index) {
                Some(current) => {
                    current.kind = incoming.kind;
                    current.values.merge(&incoming.values);
                }
                None => self.layers.push(incoming.clone()),
            }
        }
        for current in self.layers.iter_mut().skip(delta.layers.len()) {
            current.values.merge(&ParameterValues::new());
        }

        self.includes_fixed |= delta.includes_fixed;
        self.variable_values = delta.variable_values.clone();
    }

    pub fn layers_updated(&self) -> bool {
        self.layers.iter().any(|l| l.values.any_updated())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::{LayerKind, ResolvedValue};

    fn full() -> InputContainer {
        InputContainer {
            generic: ParameterValues::new()
                .with("amplitude", ResolvedValue::Float(1.0))
                .with("width", ResolvedValue::Float(2.0)),
            evaluation_set: None,
            layers: vec![LayerValues {
                name: "layer_0".into(),
                kind: LayerKind::Standard,
                values: ParameterValues::new().with("thickness", ResolvedValue::Float(100.0)),
            }],
            includes_fixed: true,
            variable_values: vec![("VAR_0".into(), 2.0)],
        }
    }

    #[test]
    fn delta_merge_updates_only_varied_entries() {
        let mut current = full();
        let delta = InputContainer {
            generic: ParameterValues::new().with("width", ResolvedValue::Float(3.0)),
            evaluation_set: None,
            layers: vec![LayerValues {
                name: "layer_0".into(),
                kind: LayerKind::Standard,
                values: ParameterValues::new(),
            }],
            includes_fixed: false,
            variable_values: vec![("VAR_0".into(), 3.0)],
        };

        current.merge(&delta);

        assert_eq!(current.generic.get_float("amplitude"), Some(1.0));
        assert_eq!(current.generic.get_float("width"), Some(3.0));
        assert!(current.generic.is_updated("width"));
        assert!(!current.generic.is_updated("amplitude"));
        assert!(!current.layers_updated());
        assert!(current.includes_fixed);
        assert_eq!(current.variable_vector(), vec![3.0]);
    }
}
