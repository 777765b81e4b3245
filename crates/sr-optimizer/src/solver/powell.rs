use super::{Bounds, Evaluator, Finish, Interrupt, MinimizeOptions, Minimizer};

const GOLDEN: f64 = 0.381_966_011_250_105;

/// Direction-set method with golden-section line searches confined to the box.
#[derive(Debug, Clone)]
pub struct Powell {
    /// Relative tolerance of each line search.
    line_tolerance: f64,
    max_line_steps: usize,
}

impl Default for Powell {
    fn default() -> Self {
        Self {
            line_tolerance: 1e-5,
            max_line_steps: 40,
        }
    }
}

/// Feasible step interval `[t_lo, t_hi]` along `direction` from `x`.
fn feasible_interval(x: &[f64], direction: &[f64], bounds: &Bounds) -> (f64, f64) {
    let mut t_lo = f64::NEG_INFINITY;
    let mut t_hi = f64::INFINITY;
    for (i, d) in direction.iter().enumerate() {
        if *d == 0.0 {
            continue;
        }
        let a = (bounds.lower(i) - x[i]) / d;
        let b = (bounds.upper(i) - x[i]) / d;
        t_lo = t_lo.max(a.min(b));
        t_hi = t_hi.min(a.max(b));
    }
    // unbounded directions get a finite search window
    let span = x.iter().map(|v| v.abs()).fold(1.0_f64, f64::max) * 10.0;
    (t_lo.max(-span), t_hi.min(span))
}

fn step(x: &[f64], direction: &[f64], t: f64) -> Vec<f64> {
    x.iter().zip(direction).map(|(xi, di)| xi + t * di).collect()
}

impl Powell {
    /// Minimize along `direction`, returning the step and the value reached.
    fn line_search(
        &self,
        evaluator: &mut Evaluator<'_>,
        x: &[f64],
        fx: f64,
        direction: &[f64],
    ) -> Result<(f64, f64), Interrupt> {
        let (mut a, mut b) = feasible_interval(x, direction, evaluator.bounds());
        if !(b - a).is_finite() || b - a <= f64::EPSILON {
            return Ok((0.0, fx));
        }

        let tolerance = self.line_tolerance * (b - a).max(1e-12);
        let mut c = a + GOLDEN * (b - a);
        let mut d = b - GOLDEN * (b - a);
        let mut fc = evaluator.eval(&step(x, direction, c))?;
        let mut fd = evaluator.eval(&step(x, direction, d))?;

        for _ in 0..self.max_line_steps {
            if b - a <= tolerance {
                break;
            }
            if fc <= fd {
                b = d;
                d = c;
                fd = fc;
                c = a + GOLDEN * (b - a);
                fc = evaluator.eval(&step(x, direction, c))?;
            } else {
                a = c;
                c = d;
                fc = fd;
                d = b - GOLDEN * (b - a);
                fd = evaluator.eval(&step(x, direction, d))?;
            }
        }

        let (t, ft) = if fc <= fd { (c, fc) } else { (d, fd) };
        if ft < fx {
            Ok((t, ft))
        } else {
            Ok((0.0, fx))
        }
    }
}

impl Minimizer for Powell {
    fn run(
        &self,
        evaluator: &mut Evaluator<'_>,
        x0: &[f64],
        options: &MinimizeOptions,
    ) -> Result<Finish, Interrupt> {
        let n = x0.len();
        let mut x = x0.to_vec();
        let mut fx = evaluator.eval(&x)?;
        if n == 0 {
            return Ok(Finish::converged("Nothing to optimize."));
        }

        let mut directions: Vec<Vec<f64>> = (0..n)
            .map(|i| {
                let mut d = vec![0.0; n];
                d[i] = 1.0;
                d
            })
            .collect();

        loop {
            if evaluator.iterations() >= options.max_iterations {
                return Ok(Finish::max_iterations());
            }
            evaluator.next_iteration();

            let x_start = x.clone();
            let f_start = fx;
            let mut biggest_drop = 0.0;
            let mut biggest_index = 0;

            for (i, direction) in directions.iter().enumerate() {
                let before = fx;
                let (t, ft) = self.line_search(evaluator, &x, fx, direction)?;
                if t != 0.0 {
                    x = evaluator.bounds().projected(&step(&x, direction, t));
                    fx = ft;
                }
                if before - fx > biggest_drop {
                    biggest_drop = before - fx;
                    biggest_index = i;
                }
            }

            if 2.0 * (f_start - fx) <= options.ftol * (f_start.abs() + fx.abs()) + 1e-20 {
                return Ok(Finish::converged("Optimization terminated successfully."));
            }

            // try the overall displacement as a new conjugate direction
            let displacement: Vec<f64> = x.iter().zip(&x_start).map(|(a, b)| a - b).collect();
            let extrapolated =
                evaluator.bounds().projected(&step(&x, &displacement, 1.0));
            let f_extrapolated = evaluator.eval(&extrapolated)?;
            if f_extrapolated < f_start {
                let t = 2.0 * (f_start - 2.0 * fx + f_extrapolated)
                    * (f_start - fx - biggest_drop).powi(2)
                    - biggest_drop * (f_start - f_extrapolated).powi(2);
                if t < 0.0 {
                    let (s, fs) = self.line_search(evaluator, &x, fx, &displacement)?;
                    if s != 0.0 {
                        x = evaluator.bounds().projected(&step(&x, &displacement, s));
                        fx = fs;
                    }
                    directions[biggest_index] = directions[n - 1].clone();
                    directions[n - 1] = displacement;
                }
            }
        }
    }

    fn name(&self) -> &str {
        "Powell"
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_functions::{bowl, rosenbrock};
    use super::super::{minimize, Bounds, MinimizeOptions};
    use super::*;
    use sr_types::SolverMethod;

    #[test]
    fn feasible_interval_respects_box() {
        let bounds = Bounds::new(&[(0.0, 10.0), (0.0, 10.0)]);
        let (lo, hi) = feasible_interval(&[2.0, 5.0], &[1.0, -1.0], &bounds);
        assert_eq!(lo, -2.0);
        assert_eq!(hi, 5.0);
    }

    #[test]
    fn minimizes_bowl_in_few_iterations() {
        let outcome = minimize(
            SolverMethod::Powell,
            |x| Ok(bowl(x)),
            &[0.0, 0.0],
            &Bounds::new(&[(-10.0, 10.0), (-10.0, 10.0)]),
            &MinimizeOptions::default(),
        )
        .unwrap();
        assert!(outcome.success());
        assert!(outcome.iterations <= 10);
        assert!((outcome.x[0] - 1.0).abs() < 1e-2);
    }

    #[test]
    fn makes_progress_on_rosenbrock() {
        let start = [-1.2, 1.0];
        let outcome = minimize(
            SolverMethod::Powell,
            |x| Ok(rosenbrock(x)),
            &start,
            &Bounds::new(&[(-5.0, 5.0), (-5.0, 5.0)]),
            &MinimizeOptions::default(),
        )
        .unwrap();
        assert!(outcome.fun < rosenbrock(&start) / 10.0);
    }
}
