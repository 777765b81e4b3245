//! Built-in demo modules.
//!
//! `gaussian` is a calculator over a single peak. `parabola_fit` is a fitter
//! that compares a parabola against the "measured" one described by each
//! evaluation set.

use std::f64::consts::PI;

use sr_types::{
    LayerKind, LayerValues, Module, ModuleContext, ModuleDescriptor, ModuleError, ModuleKind,
    ModuleRegistry, ParameterValues, PlotData, ResultsMap,
};

pub const GAUSSIAN: &str = "gaussian";
pub const PARABOLA_FIT: &str = "parabola_fit";

const DEFAULT_POINTS: usize = 101;

fn points(values: &ParameterValues) -> Result<usize, ModuleError> {
    match values.get_float("points") {
        None => Ok(DEFAULT_POINTS),
        Some(n) if n >= 2.0 && n.fract() == 0.0 => Ok(n as usize),
        Some(n) => Err(ModuleError::InvalidParameter {
            parameter: "points".into(),
            message: format!("expected an integer of at least 2, got {n}"),
        }),
    }
}

fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    let step = (stop - start) / (n - 1) as f64;
    (0..n).map(|i| start + step * i as f64).collect()
}

#[derive(Debug, Default)]
pub struct GaussianCalculator {
    amplitude: f64,
    position: f64,
    width: f64,
    points: usize,
}

impl GaussianCalculator {
    pub fn descriptor() -> ModuleDescriptor {
        ModuleDescriptor::new(GAUSSIAN, ModuleKind::Calculator)
    }

    fn value_at(&self, x: f64) -> f64 {
        self.amplitude * (-(x - self.position).powi(2) / (2.0 * self.width.powi(2))).exp()
    }
}

impl Module for GaussianCalculator {
    fn configure_generic(&mut self, values: &ParameterValues) -> Result<(), ModuleError> {
        self.amplitude = values.require_float("amplitude")?;
        self.position = values.require_float("position")?;
        self.width = values.require_float("width")?;
        self.points = points(values)?;
        if self.width <= 0.0 {
            return Err(ModuleError::InvalidParameter {
                parameter: "width".into(),
                message: format!("must be positive, got {}", self.width),
            });
        }
        Ok(())
    }

    fn run(&mut self, context: &ModuleContext) -> Result<(), ModuleError> {
        let x = linspace(
            self.position - 5.0 * self.width,
            self.position + 5.0 * self.width,
            self.points,
        );
        let y = x.iter().map(|x| self.value_at(*x)).collect();
        context.publish_plot(PlotData::new("Gaussian", "x", "intensity").with_series(
            context.leaf(),
            x,
            y,
        ));
        Ok(())
    }

    fn results(&self) -> Option<ResultsMap> {
        Some(ResultsMap::from([
            ("peak".to_string(), self.amplitude),
            (
                "area".to_string(),
                self.amplitude * self.width * (2.0 * PI).sqrt(),
            ),
            (
                "fwhm".to_string(),
                2.0 * (2.0 * 2.0_f64.ln()).sqrt() * self.width,
            ),
            ("value_at_origin".to_string(), self.value_at(0.0)),
        ]))
    }
}

#[derive(Debug, Default)]
pub struct ParabolaFitter {
    center: f64,
    curvature: f64,
    offset: f64,
    x: Vec<f64>,
    measured: Vec<f64>,
    chi2: f64,
}

impl ParabolaFitter {
    pub fn descriptor() -> ModuleDescriptor {
        ModuleDescriptor::new(PARABOLA_FIT, ModuleKind::Fitter)
            .with_evaluation_sets()
            .with_layer_kinds(vec![LayerKind::Standard])
    }

    fn model(&self, x: f64) -> f64 {
        self.curvature * (x - self.center).powi(2) + self.offset
    }
}

impl Module for ParabolaFitter {
    fn configure_generic(&mut self, values: &ParameterValues) -> Result<(), ModuleError> {
        self.center = values.require_float("center")?;
        self.curvature = values.require_float("curvature")?;
        Ok(())
    }

    fn configure_evaluation_set(&mut self, values: &ParameterValues) -> Result<(), ModuleError> {
        // the measured curve only changes when the evaluation set does
        if !values.any_updated() && !self.measured.is_empty() {
            return Ok(());
        }
        let center = values.require_float("target_center")?;
        let curvature = values.require_float("target_curvature")?;
        self.x = linspace(-5.0, 5.0, points(values)?);
        self.measured = self
            .x
            .iter()
            .map(|x| curvature * (x - center).powi(2))
            .collect();
        Ok(())
    }

    fn configure_layers(&mut self, layers: &[LayerValues]) -> Result<(), ModuleError> {
        self.offset = layers
            .iter()
            .filter_map(|layer| layer.values.get_float("offset"))
            .sum();
        Ok(())
    }

    fn run(&mut self, _context: &ModuleContext) -> Result<(), ModuleError> {
        if self.measured.is_empty() {
            return Err(ModuleError::MissingParameter {
                parameter: "target_center".into(),
            });
        }
        self.chi2 = self
            .x
            .iter()
            .zip(&self.measured)
            .map(|(x, y)| (self.model(*x) - y).powi(2))
            .sum::<f64>()
            / self.x.len() as f64;
        Ok(())
    }

    fn results(&self) -> Option<ResultsMap> {
        Some(ResultsMap::from([
            ("chi2".to_string(), self.chi2),
            ("center".to_string(), self.center),
            ("curvature".to_string(), self.curvature),
        ]))
    }

    fn fit_value_name(&self) -> Option<String> {
        Some("chi2".to_string())
    }
}

pub fn register_demo_modules(registry: &mut ModuleRegistry) {
    registry.register(GaussianCalculator::descriptor(), || {
        Box::new(GaussianCalculator::default())
    });
    registry.register(ParabolaFitter::descriptor(), || Box::new(ParabolaFitter::default()));
}

pub fn demo_registry() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    register_demo_modules(&mut registry);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use sr_types::{LeafMessage, ResolvedValue};
    use std::path::PathBuf;

    fn floats(pairs: &[(&str, f64)]) -> ParameterValues {
        pairs.iter().fold(ParameterValues::new(), |values, (name, value)| {
            values.with(*name, ResolvedValue::Float(*value))
        })
    }

    #[test]
    fn gaussian_reports_peak_metrics() {
        let (tx, rx) = unbounded();
        let context = ModuleContext::new("s1", PathBuf::from("."), tx);
        let mut module = GaussianCalculator::default();
        module
            .configure_generic(&floats(&[
                ("amplitude", 2.0),
                ("position", 0.0),
                ("width", 1.0),
                ("points", 11.0),
            ]))
            .unwrap();
        module.run(&context).unwrap();

        let results = module.results().unwrap();
        assert_eq!(results["value_at_origin"], 2.0);
        assert!((results["fwhm"] - 2.354_82).abs() < 1e-4);
        match rx.try_recv().unwrap() {
            LeafMessage::Plot(plot) => assert_eq!(plot.series[0].x.len(), 11),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn gaussian_rejects_non_positive_width() {
        let mut module = GaussianCalculator::default();
        let err = module
            .configure_generic(&floats(&[("amplitude", 1.0), ("position", 0.0), ("width", 0.0)]))
            .unwrap_err();
        assert!(matches!(err, ModuleError::InvalidParameter { parameter, .. } if parameter == "width"));
    }

    #[test]
    fn parabola_fit_is_zero_at_target() {
        let (tx, _rx) = unbounded();
        let context = ModuleContext::new("s1", PathBuf::from("."), tx);
        let mut module = ParabolaFitter::default();
        module
            .configure_generic(&floats(&[("center", 1.0), ("curvature", 0.5)]))
            .unwrap();
        module
            .configure_evaluation_set(&floats(&[("target_center", 1.0), ("target_curvature", 0.5)]))
            .unwrap();
        module.run(&context).unwrap();
        assert_eq!(module.results().unwrap()["chi2"], 0.0);

        module
            .configure_layers(&[LayerValues {
                name: "layer_0".into(),
                kind: LayerKind::Standard,
                values: floats(&[("offset", 1.0)]),
            }])
            .unwrap();
        module.run(&context).unwrap();
        assert!((module.results().unwrap()["chi2"] - 1.0).abs() < 1e-12);
        assert_eq!(module.fit_value_name().as_deref(), Some("chi2"));
    }

    #[test]
    fn registry_contains_both_demos() {
        let registry = demo_registry();
        assert_eq!(registry.names(), vec![GAUSSIAN, PARABOLA_FIT]);
        assert!(registry.descriptor(PARABOLA_FIT).unwrap().has_evaluation_set_parameters);
    }
}
