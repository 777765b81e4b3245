//! Range expansion and the Cartesian variation grid.

use serde::{Deserialize, Serialize};

use sr_types::{ResolutionError, Variable};

/// Relative tolerance used when deciding whether `stop` lies on a step boundary.
const BOUNDARY_EPSILON: f64 = 1e-9;

/// Upper bound on the values of one axis and on the rows of a whole grid.
pub const MAX_GRID_ROWS: usize = 1_000_000;

/// Expand `start..stop` by `step`.
///
/// `start == stop` yields `[start]`. Otherwise the values `start, start+step, ...`
/// strictly before `stop` are produced and `stop` itself is appended when it
/// lies exactly one step past the last value. Returns `None` for a zero,
/// non-finite or wrongly-signed step, and for ranges that would produce more
/// than [`MAX_GRID_ROWS`] values.
pub fn expand(start: f64, stop: f64, step: f64) -> Option<Vec<f64>> {
    if !(start.is_finite() && stop.is_finite() && step.is_finite()) {
        return None;
    }
    if start == stop {
        return Some(vec![start]);
    }
    if step == 0.0 || (stop - start).signum() != step.signum() {
        return None;
    }

    let ratio = (stop - start) / step;
    if ratio >= MAX_GRID_ROWS as f64 {
        return None;
    }
    let below = (ratio - BOUNDARY_EPSILON).ceil().max(0.0) as usize;
    let mut values: Vec<f64> = (0..below).map(|i| start + i as f64 * step).collect();
    if (ratio - below as f64).abs() <= BOUNDARY_EPSILON * ratio.max(1.0) {
        values.push(stop);
    }
    Some(values)
}

/// Expand a variable's `(min, max, step)` range.
pub fn expand_variable(variable: &Variable) -> Result<Vec<f64>, ResolutionError> {
    expand(variable.min, variable.max, variable.step).ok_or_else(|| ResolutionError::InvalidRange {
        variable: variable.name.clone(),
        start: variable.min,
        stop: variable.max,
        step: variable.step,
    })
}

/// Ordered grid rows, first axis varying slowest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariationGrid {
    rows: Vec<Vec<f64>>,
}

impl VariationGrid {
    /// Cartesian product of `axes`. No axes gives an empty grid.
    pub fn from_axes(axes: &[Vec<f64>]) -> Self {
        if axes.is_empty() {
            return Self::default();
        }

        let mut rows: Vec<Vec<f64>> = vec![Vec::with_capacity(axes.len())];
        for axis in axes {
            let mut next = Vec::with_capacity(rows.len() * axis.len());
            for existing in &rows {
                for value in axis {
                    let mut row = existing.clone();
                    row.push(*value);
                    next.push(row);
                }
            }
            rows = next;
        }

        Self { rows }
    }

    /// Grid over the ranges of `variables`. Fails when a range is invalid or
    /// the product of the axes exceeds [`MAX_GRID_ROWS`].
    pub fn for_variables(variables: &[Variable]) -> Result<Self, ResolutionError> {
        let mut axes = Vec::with_capacity(variables.len());
        let mut rows: usize = 1;
        for variable in variables {
            let axis = expand_variable(variable)?;
            rows = rows
                .checked_mul(axis.len())
                .filter(|rows| *rows <= MAX_GRID_ROWS)
                .ok_or_else(|| ResolutionError::InvalidRange {
                    variable: variable.name.clone(),
                    start: variable.min,
                    stop: variable.max,
                    step: variable.step,
                })?;
            axes.push(axis);
        }
        Ok(Self::from_axes(&axes))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, index: usize) -> Result<&[f64], ResolutionError> {
        self.rows
            .get(index)
            .map(Vec::as_slice)
            .ok_or(ResolutionError::RowOutOfRange {
                row: index,
                rows: self.rows.len(),
            })
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }
}
