//! Bounded minimizers driven by a fallible objective.
//!
//! The objective is a black box that may fail or be stopped; either unwinds
//! the solver through [`ObjectiveError`]. Every method honours an evaluation
//! budget: once it is spent the best point seen so far is returned with
//! [`Termination::MaxIterHit`].

mod nelder_mead;
mod powell;
mod quasi_newton;

pub use nelder_mead::NelderMead;
pub use powell::Powell;
pub use quasi_newton::ProjectedBfgs;

use serde_json::json;
use thiserror::Error;

use sr_types::{SolverMethod, Termination};

/// Failure raised from inside the objective.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ObjectiveError {
    #[error("Optimization stopped on request")]
    Stopped,

    #[error("Objective evaluation failed: {0}")]
    Failed(String),
}

/// Box constraints, one `(lower, upper)` pair per dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct Bounds {
    lower: Vec<f64>,
    upper: Vec<f64>,
}

impl Bounds {
    pub fn new(pairs: &[(f64, f64)]) -> Self {
        Self {
            lower: pairs.iter().map(|(lo, hi)| lo.min(*hi)).collect(),
            upper: pairs.iter().map(|(lo, hi)| hi.max(*lo)).collect(),
        }
    }

    pub fn unbounded(dimensions: usize) -> Self {
        Self {
            lower: vec![f64::NEG_INFINITY; dimensions],
            upper: vec![f64::INFINITY; dimensions],
        }
    }

    pub fn len(&self) -> usize {
        self.lower.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lower.is_empty()
    }

    pub fn lower(&self, i: usize) -> f64 {
        self.lower[i]
    }

    pub fn upper(&self, i: usize) -> f64 {
        self.upper[i]
    }

    /// Clip `x` into the box in place.
    pub fn project(&self, x: &mut [f64]) {
        for (i, value) in x.iter_mut().enumerate() {
            *value = value.clamp(self.lower[i], self.upper[i]);
        }
    }

    pub fn projected(&self, x: &[f64]) -> Vec<f64> {
        let mut out = x.to_vec();
        self.project(&mut out);
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MinimizeOptions {
    pub max_iterations: usize,
    /// Cap on objective evaluations. `None` means unlimited.
    pub max_evaluations: Option<usize>,
    pub xtol: f64,
    pub ftol: f64,
    pub gtol: f64,
}

impl Default for MinimizeOptions {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            max_evaluations: None,
            xtol: 1e-4,
            ftol: 1e-4,
            gtol: 1e-5,
        }
    }
}

impl MinimizeOptions {
    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n;
        self
    }

    pub fn with_max_evaluations(mut self, n: usize) -> Self {
        self.max_evaluations = Some(n);
        self
    }
}

/// Result of a solver run that was not unwound by the objective.
#[derive(Debug, Clone, PartialEq)]
pub struct MinimizeOutcome {
    pub x: Vec<f64>,
    pub fun: f64,
    pub termination: Termination,
    pub iterations: usize,
    pub evaluations: usize,
    pub message: String,
}

impl MinimizeOutcome {
    pub fn success(&self) -> bool {
        self.termination.is_success()
    }

    /// Solver-native summary in the usual `x/fun/nit/nfev` shape.
    pub fn to_payload(&self, method: SolverMethod) -> serde_json::Value {
        json!({
            "method": method.as_str(),
            "x": self.x,
            "fun": self.fun,
            "nit": self.iterations,
            "nfev": self.evaluations,
            "success": self.success(),
            "message": self.message,
        })
    }
}

/// Why a solver left its loop early.
#[derive(Debug)]
pub enum Interrupt {
    BudgetSpent,
    Objective(ObjectiveError),
}

impl From<ObjectiveError> for Interrupt {
    fn from(err: ObjectiveError) -> Self {
        Interrupt::Objective(err)
    }
}

/// How a solver finished on its own.
#[derive(Debug, Clone, PartialEq)]
pub struct Finish {
    pub termination: Termination,
    pub message: String,
}

impl Finish {
    pub fn converged(message: impl Into<String>) -> Self {
        Self {
            termination: Termination::Converged,
            message: message.into(),
        }
    }

    pub fn max_iterations() -> Self {
        Self {
            termination: Termination::MaxIterHit,
            message: "Maximum number of iterations has been exceeded.".to_string(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            termination: Termination::Failed,
            message: message.into(),
        }
    }
}

/// Objective wrapper that projects, counts and remembers the best point.
pub struct Evaluator<'f> {
    objective: &'f mut dyn FnMut(&[f64]) -> Result<f64, ObjectiveError>,
    bounds: Bounds,
    max_evaluations: Option<usize>,
    evaluations: usize,
    iterations: usize,
    best: Option<(Vec<f64>, f64)>,
}

impl<'f> Evaluator<'f> {
    fn new(
        objective: &'f mut dyn FnMut(&[f64]) -> Result<f64, ObjectiveError>,
        bounds: Bounds,
        max_evaluations: Option<usize>,
    ) -> Self {
        Self {
            objective,
            bounds,
            max_evaluations,
            evaluations: 0,
            iterations: 0,
            best: None,
        }
    }

    pub fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    /// Evaluate at the projection of `x`. Non-finite values count as +inf.
    pub fn eval(&mut self, x: &[f64]) -> Result<f64, Interrupt> {
        if let Some(limit) = self.max_evaluations {
            if self.evaluations >= limit {
                return Err(Interrupt::BudgetSpent);
            }
        }
        let x = self.bounds.projected(x);
        self.evaluations += 1;
        let value = (self.objective)(&x)?;
        let value = if value.is_finite() { value } else { f64::INFINITY };

        let improves = match &self.best {
            None => true,
            Some((_, best)) => value < *best,
        };
        if improves {
            self.best = Some((x, value));
        }
        Ok(value)
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn next_iteration(&mut self) {
        self.iterations += 1;
    }
}

/// Common interface of all minimizers.
pub trait Minimizer: Send + Sync {
    /// Run until convergence or the iteration cap. Interrupts unwind via `Err`.
    fn run(
        &self,
        evaluator: &mut Evaluator<'_>,
        x0: &[f64],
        options: &MinimizeOptions,
    ) -> Result<Finish, Interrupt>;

    fn name(&self) -> &str;
}

/// Solver backing each method name.
pub fn minimizer_for(method: SolverMethod) -> Box<dyn Minimizer> {
    match method {
        SolverMethod::NelderMead => Box::new(NelderMead::default()),
        SolverMethod::Powell => Box::new(Powell::default()),
        SolverMethod::ConjugateGradient
        | SolverMethod::Bfgs
        | SolverMethod::LBfgsB
        | SolverMethod::Tnc
        | SolverMethod::Slsqp
        | SolverMethod::TrustConstr => Box::new(ProjectedBfgs::default()),
    }
}

/// Minimize `objective` from `x0` inside `bounds` with the given method.
///
/// Returns `Err` only when the objective itself failed or was stopped.
pub fn minimize<F>(
    method: SolverMethod,
    mut objective: F,
    x0: &[f64],
    bounds: &Bounds,
    options: &MinimizeOptions,
) -> Result<MinimizeOutcome, ObjectiveError>
where
    F: FnMut(&[f64]) -> Result<f64, ObjectiveError>,
{
    let minimizer = minimizer_for(method);
    let x0 = bounds.projected(x0);
    let mut evaluator = Evaluator::new(&mut objective, bounds.clone(), options.max_evaluations);

    let finish = match minimizer.run(&mut evaluator, &x0, options) {
        Ok(finish) => finish,
        Err(Interrupt::BudgetSpent) => Finish {
            termination: Termination::MaxIterHit,
            message: "Maximum number of function evaluations has been exceeded.".to_string(),
        },
        Err(Interrupt::Objective(err)) => return Err(err),
    };

    let (x, fun) = evaluator.best.take().unwrap_or((x0, f64::NAN));
    tracing::debug!(
        solver = minimizer.name(),
        iterations = evaluator.iterations,
        evaluations = evaluator.evaluations,
        fun,
        "minimizer finished"
    );

    Ok(MinimizeOutcome {
        x,
        fun,
        termination: finish.termination,
        iterations: evaluator.iterations,
        evaluations: evaluator.evaluations,
        message: finish.message,
    })
}
