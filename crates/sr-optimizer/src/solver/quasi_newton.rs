use super::{Bounds, Evaluator, Finish, Interrupt, MinimizeOptions, Minimizer};

/// Projected BFGS with forward-difference gradients.
///
/// Serves the gradient-based method names. Components pinned at an active
/// bound are frozen for the step, the trial point is projected back into the
/// box and an Armijo backtracking search picks the step length.
#[derive(Debug, Clone)]
pub struct ProjectedBfgs {
    armijo: f64,
    max_backtracks: usize,
}

impl Default for ProjectedBfgs {
    fn default() -> Self {
        Self {
            armijo: 1e-4,
            max_backtracks: 30,
        }
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn identity(n: usize) -> Vec<Vec<f64>> {
    (0..n)
        .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect()
}

/// Whether component `i` sits on a bound the gradient pushes against.
fn is_active(x: &[f64], g: &[f64], bounds: &Bounds, i: usize) -> bool {
    (x[i] <= bounds.lower(i) && g[i] > 0.0) || (x[i] >= bounds.upper(i) && g[i] < 0.0)
}

impl ProjectedBfgs {
    fn gradient(
        &self,
        evaluator: &mut Evaluator<'_>,
        x: &[f64],
        fx: f64,
    ) -> Result<Vec<f64>, Interrupt> {
        let mut g = vec![0.0; x.len()];
        for i in 0..x.len() {
            let h = f64::EPSILON.sqrt() * x[i].abs().max(1.0);
            let mut probe = x.to_vec();
            // step backwards when a forward step would leave the box
            let signed_h = if x[i] + h > evaluator.bounds().upper(i) { -h } else { h };
            probe[i] += signed_h;
            let f_probe = evaluator.eval(&probe)?;
            g[i] = (f_probe - fx) / signed_h;
        }
        Ok(g)
    }
}

impl Minimizer for ProjectedBfgs {
    fn run(
        &self,
        evaluator: &mut Evaluator<'_>,
        x0: &[f64],
        options: &MinimizeOptions,
    ) -> Result<Finish, Interrupt> {
        let n = x0.len();
        let bounds = evaluator.bounds().clone();
        let mut x = x0.to_vec();
        let mut fx = evaluator.eval(&x)?;
        if n == 0 {
            return Ok(Finish::converged("Nothing to optimize."));
        }

        let mut h_inv = identity(n);
        let mut g = self.gradient(evaluator, &x, fx)?;

        loop {
            let projected_norm = (0..n)
                .filter(|&i| !is_active(&x, &g, &bounds, i))
                .map(|i| g[i].abs())
                .fold(0.0_f64, f64::max);
            if projected_norm <= options.gtol {
                return Ok(Finish::converged("Projected gradient below tolerance."));
            }
            if evaluator.iterations() >= options.max_iterations {
                return Ok(Finish::max_iterations());
            }
            evaluator.next_iteration();

            let mut direction: Vec<f64> = h_inv.iter().map(|row| -dot(row, &g)).collect();
            for i in 0..n {
                if is_active(&x, &g, &bounds, i) {
                    direction[i] = 0.0;
                }
            }
            if dot(&direction, &g) >= 0.0 {
                // not a descent direction; fall back to steepest descent
                h_inv = identity(n);
                direction = (0..n)
                    .map(|i| if is_active(&x, &g, &bounds, i) { 0.0 } else { -g[i] })
                    .collect();
            }

            let mut alpha = 1.0;
            let mut accepted = None;
            for _ in 0..self.max_backtracks {
                let trial = bounds.projected(
                    &x.iter()
                        .zip(&direction)
                        .map(|(xi, di)| xi + alpha * di)
                        .collect::<Vec<_>>(),
                );
                let s: Vec<f64> = trial.iter().zip(&x).map(|(a, b)| a - b).collect();
                let f_trial = evaluator.eval(&trial)?;
                if f_trial <= fx + self.armijo * dot(&g, &s) && f_trial < fx {
                    accepted = Some((trial, s, f_trial));
                    break;
                }
                alpha *= 0.5;
            }

            let Some((x_new, s, f_new)) = accepted else {
                return Ok(Finish::failed(
                    "Desired error not necessarily achieved due to precision loss.",
                ));
            };

            let g_new = self.gradient(evaluator, &x_new, f_new)?;
            let y: Vec<f64> = g_new.iter().zip(&g).map(|(a, b)| a - b).collect();
            let sy = dot(&s, &y);

            let f_change = (fx - f_new).abs();
            x = x_new;
            g = g_new;
            let f_old = fx;
            fx = f_new;

            if f_change <= options.ftol * 1e-4 * f_old.abs().max(fx.abs()).max(1.0) {
                return Ok(Finish::converged("Relative reduction of f below tolerance."));
            }

            if sy > 1e-12 {
                if evaluator.iterations() == 1 {
                    // scale the initial inverse Hessian to the observed curvature
                    let scale = sy / dot(&y, &y);
                    h_inv = identity(n)
                        .into_iter()
                        .map(|row| row.into_iter().map(|v| v * scale).collect())
                        .collect();
                }
                // H <- (I - rho s y^T) H (I - rho y s^T) + rho s s^T
                let rho = 1.0 / sy;
                let hy: Vec<f64> = h_inv.iter().map(|row| dot(row, &y)).collect();
                let yhy = dot(&y, &hy);
                for i in 0..n {
                    for j in 0..n {
                        h_inv[i][j] += -rho * (s[i] * hy[j] + hy[i] * s[j])
                            + (rho * rho * yhy + rho) * s[i] * s[j];
                    }
                }
            }
        }
    }

    fn name(&self) -> &str {
        "projected-BFGS"
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_functions::rosenbrock;
    use super::super::{minimize, Bounds, MinimizeOptions};
    use super::*;
    use sr_types::SolverMethod;

    #[test]
    fn active_bounds_are_detected() {
        let bounds = Bounds::new(&[(0.0, 1.0), (0.0, 1.0)]);
        assert!(is_active(&[0.0, 0.5], &[1.0, 1.0], &bounds, 0));
        assert!(!is_active(&[0.0, 0.5], &[-1.0, 1.0], &bounds, 0));
        assert!(is_active(&[0.5, 1.0], &[0.0, -2.0], &bounds, 1));
    }

    #[test]
    fn rosenbrock_reaches_valley_floor() {
        let outcome = minimize(
            SolverMethod::Bfgs,
            |x| Ok(rosenbrock(x)),
            &[-1.2, 1.0],
            &Bounds::new(&[(-5.0, 5.0), (-5.0, 5.0)]),
            &MinimizeOptions::default(),
        )
        .unwrap();
        assert!(outcome.fun < 1e-3, "fun = {}", outcome.fun);
    }
}
