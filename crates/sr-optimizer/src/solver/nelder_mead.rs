use super::{Bounds, Evaluator, Finish, Interrupt, MinimizeOptions, Minimizer};

/// Downhill simplex. Trial points are clipped into the bounds.
#[derive(Debug, Clone)]
pub struct NelderMead {
    reflection: f64,
    expansion: f64,
    contraction: f64,
    shrink: f64,
}

impl Default for NelderMead {
    fn default() -> Self {
        Self {
            reflection: 1.0,
            expansion: 2.0,
            contraction: 0.5,
            shrink: 0.5,
        }
    }
}

impl NelderMead {
    fn initial_simplex(&self, bounds: &Bounds, x0: &[f64]) -> Vec<Vec<f64>> {
        let mut simplex = vec![x0.to_vec()];
        for i in 0..x0.len() {
            let mut vertex = x0.to_vec();
            let step = if x0[i] != 0.0 { 0.05 * x0[i] } else { 0.00025 };
            vertex[i] = x0[i] + step;
            if vertex[i] > bounds.upper(i) || vertex[i] < bounds.lower(i) {
                vertex[i] = x0[i] - step;
            }
            bounds.project(&mut vertex);
            // keep the simplex non-degenerate when x0 sits in a narrow box
            if vertex[i] == x0[i] {
                vertex[i] = 0.5 * (bounds.lower(i) + bounds.upper(i));
            }
            simplex.push(vertex);
        }
        simplex
    }
}

/// `a + t * (b - a)`, clipped into `bounds`.
fn combine(a: &[f64], b: &[f64], t: f64, bounds: &Bounds) -> Vec<f64> {
    let mut x: Vec<f64> = a.iter().zip(b).map(|(ai, bi)| ai + t * (bi - ai)).collect();
    bounds.project(&mut x);
    x
}

impl Minimizer for NelderMead {
    fn run(
        &self,
        evaluator: &mut Evaluator<'_>,
        x0: &[f64],
        options: &MinimizeOptions,
    ) -> Result<Finish, Interrupt> {
        let n = x0.len();
        if n == 0 {
            evaluator.eval(x0)?;
            return Ok(Finish::converged("Nothing to optimize."));
        }

        let bounds = evaluator.bounds().clone();
        let mut simplex = self.initial_simplex(&bounds, x0);
        let mut values = Vec::with_capacity(n + 1);
        for vertex in &simplex {
            values.push(evaluator.eval(vertex)?);
        }

        loop {
            // sort vertices by objective value
            let mut order: Vec<usize> = (0..=n).collect();
            order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
            simplex = order.iter().map(|&i| simplex[i].clone()).collect();
            values = order.iter().map(|&i| values[i]).collect();

            let x_spread = simplex[1..]
                .iter()
                .flat_map(|v| v.iter().zip(&simplex[0]).map(|(a, b)| (a - b).abs()))
                .fold(0.0_f64, f64::max);
            let f_spread = values[1..]
                .iter()
                .map(|v| (v - values[0]).abs())
                .fold(0.0_f64, f64::max);
            if x_spread <= options.xtol && f_spread <= options.ftol {
                return Ok(Finish::converged("Optimization terminated successfully."));
            }
            if evaluator.iterations() >= options.max_iterations {
                return Ok(Finish::max_iterations());
            }
            evaluator.next_iteration();

            let mut centroid = vec![0.0; n];
            for vertex in &simplex[..n] {
                for (c, v) in centroid.iter_mut().zip(vertex) {
                    *c += v / n as f64;
                }
            }
            let worst = simplex[n].clone();

            let reflected = combine(&centroid, &worst, -self.reflection, &bounds);
            let f_reflected = evaluator.eval(&reflected)?;

            if f_reflected < values[0] {
                let expanded =
                    combine(&centroid, &worst, -self.reflection * self.expansion, &bounds);
                let f_expanded = evaluator.eval(&expanded)?;
                if f_expanded < f_reflected {
                    simplex[n] = expanded;
                    values[n] = f_expanded;
                } else {
                    simplex[n] = reflected;
                    values[n] = f_reflected;
                }
                continue;
            }

            if f_reflected < values[n - 1] {
                simplex[n] = reflected;
                values[n] = f_reflected;
                continue;
            }

            let shrink_needed = if f_reflected < values[n] {
                // outside contraction
                let contracted =
                    combine(&centroid, &worst, -self.reflection * self.contraction, &bounds);
                let f_contracted = evaluator.eval(&contracted)?;
                if f_contracted <= f_reflected {
                    simplex[n] = contracted;
                    values[n] = f_contracted;
                    false
                } else {
                    true
                }
            } else {
                // inside contraction
                let contracted = combine(&centroid, &worst, self.contraction, &bounds);
                let f_contracted = evaluator.eval(&contracted)?;
                if f_contracted < values[n] {
                    simplex[n] = contracted;
                    values[n] = f_contracted;
                    false
                } else {
                    true
                }
            };

            if shrink_needed {
                let best = simplex[0].clone();
                for j in 1..=n {
                    simplex[j] = combine(&best, &simplex[j], self.shrink, &bounds);
                    values[j] = evaluator.eval(&simplex[j])?;
                }
            }
        }
    }

    fn name(&self) -> &str {
        "Nelder-Mead"
    }
}
