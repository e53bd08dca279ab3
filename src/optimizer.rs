//! Design update rules for a single volume constraint.

use log::{debug, warn};

use crate::error::TopOptError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    OptimalityCriteria,
    MovingAsymptotes,
}

impl Method {
    pub fn from_name(name: &str) -> Result<Method, TopOptError> {
        match name.trim().to_uppercase().as_str() {
            "OC" => Ok(Method::OptimalityCriteria),
            "MMA" => Ok(Method::MovingAsymptotes),
            _ => Err(TopOptError::Config(format!(
                "Unknown optimizer '{name}', expected OC or MMA"
            ))),
        }
    }
}

/// Tunables of the optimality criteria update
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OcParams {
    /// Largest density change per iteration
    pub move_limit: f64,
    pub x_min: f64,
    /// Initial multiplier bracket
    pub lambda_lower: f64,
    pub lambda_upper: f64,
    /// Relative bracket width that ends the bisection
    pub tolerance: f64,
    pub max_bisections: usize,
    /// Fail instead of returning the last candidate when the bisection stalls
    pub strict: bool,
}

impl Default for OcParams {
    fn default() -> Self {
        OcParams {
            move_limit: 0.2,
            x_min: 1e-3,
            lambda_lower: 0.0,
            lambda_upper: 1e9,
            tolerance: 1e-4,
            max_bisections: 200,
            strict: false,
        }
    }
}

fn check_lengths(densities: &[f64], sensitivities: &[f64], volumes: &[f64]) -> Result<(), TopOptError> {
    if densities.len() != sensitivities.len() || densities.len() != volumes.len() {
        return Err(TopOptError::Config(format!(
            "Optimizer inputs disagree: {} densities, {} sensitivities, {} volumes",
            densities.len(),
            sensitivities.len(),
            volumes.len()
        )));
    }
    if densities.is_empty() {
        return Err(TopOptError::Config("Empty design field".to_owned()));
    }
    Ok(())
}

/// Bounds of the next density: the box `[x_min, 1]` intersected with the move limit
fn move_bounds(x: f64, move_limit: f64, x_min: f64) -> (f64, f64) {
    let lower = f64::max(x_min, x - move_limit);
    let upper = f64::min(1.0, x + move_limit);
    if lower <= upper {
        (lower, upper)
    } else {
        (x_min, 1.0)
    }
}

fn volume(densities: &[f64], volumes: &[f64]) -> f64 {
    densities.iter().zip(volumes).map(|(x, v)| x * v).sum()
}

/// Updates the design with the optimality criteria rule.
///
/// The volume multiplier is found by bisection. Positive sensitivities carry
/// no information for compliance minimization and are treated as zero.
///
/// # Arguments
/// * `densities` - The current design field
/// * `volume_fraction` - The target volume fraction
/// * `sensitivities` - The filtered objective sensitivities
/// * `volumes` - The element volumes
/// * `params` - Move limit, bounds and bisection settings
///
/// # Returns
/// The new design field
pub fn update(
    densities: &[f64],
    volume_fraction: f64,
    sensitivities: &[f64],
    volumes: &[f64],
    params: &OcParams,
) -> Result<Vec<f64>, TopOptError> {
    check_lengths(densities, sensitivities, volumes)?;

    let mean_volume = volumes.iter().sum::<f64>() / volumes.len() as f64;
    let target = volume_fraction * volumes.iter().sum::<f64>();

    let candidate = |lambda: f64| -> Vec<f64> {
        densities
            .iter()
            .zip(sensitivities)
            .zip(volumes)
            .map(|((x, dc), v)| {
                let ratio = f64::max(-dc, 0.0) / (lambda * v / mean_volume);
                let (lower, upper) = move_bounds(*x, params.move_limit, params.x_min);
                (x * ratio.sqrt()).max(lower).min(upper)
            })
            .collect()
    };

    let mut l1 = params.lambda_lower;
    let mut l2 = params.lambda_upper;
    let mut x_new = densities.to_vec();

    for bisection in 0..params.max_bisections {
        let lmid = f64::max(0.5 * (l1 + l2), f64::MIN_POSITIVE);
        x_new = candidate(lmid);

        if volume(&x_new, volumes) > target {
            l1 = lmid;
        } else {
            l2 = lmid;
        }

        if l2 - l1 <= params.tolerance * (l1 + l2) {
            debug!("optimality criteria multiplier {lmid:e} after {} bisections", bisection + 1);
            return Ok(x_new);
        }
    }

    if params.strict {
        return Err(TopOptError::NonConvergence {
            stage: "optimality criteria multiplier search",
            iterations: params.max_bisections,
            residual: (l2 - l1) / (l1 + l2),
        });
    }
    warn!(
        "multiplier search did not converge in {} bisections, keeping the last candidate",
        params.max_bisections
    );
    Ok(x_new)
}

/// Tunables of the method of moving asymptotes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MmaParams {
    pub move_limit: f64,
    pub x_min: f64,
    pub asymptote_init: f64,
    pub asymptote_increase: f64,
    pub asymptote_decrease: f64,
    /// Keeps the subproblem bounds away from the asymptotes
    pub albefa: f64,
    pub tolerance: f64,
    pub max_bisections: usize,
}

impl Default for MmaParams {
    fn default() -> Self {
        MmaParams {
            move_limit: 0.2,
            x_min: 1e-3,
            asymptote_init: 0.5,
            asymptote_increase: 1.2,
            asymptote_decrease: 0.7,
            albefa: 0.1,
            tolerance: 1e-10,
            max_bisections: 200,
        }
    }
}

/// History carried between MMA iterations
#[derive(Debug, Clone, Default)]
pub struct MmaState {
    xold1: Vec<f64>,
    xold2: Vec<f64>,
    low: Vec<f64>,
    upp: Vec<f64>,
    iteration: usize,
}

impl MmaState {
    pub fn new() -> MmaState {
        MmaState::default()
    }

    fn update_asymptotes(&mut self, x: &[f64], params: &MmaParams) {
        let range = 1.0 - params.x_min;

        if self.iteration < 2 {
            self.low = x.iter().map(|xj| xj - params.asymptote_init * range).collect();
            self.upp = x.iter().map(|xj| xj + params.asymptote_init * range).collect();
            return;
        }

        for j in 0..x.len() {
            let trend = (x[j] - self.xold1[j]) * (self.xold1[j] - self.xold2[j]);
            let gamma = if trend < 0.0 {
                params.asymptote_decrease
            } else if trend > 0.0 {
                params.asymptote_increase
            } else {
                1.0
            };
            let low = x[j] - gamma * (self.xold1[j] - self.low[j]);
            let upp = x[j] + gamma * (self.upp[j] - self.xold1[j]);
            self.low[j] = low.max(x[j] - 10.0 * range).min(x[j] - 0.01 * range);
            self.upp[j] = upp.max(x[j] + 0.01 * range).min(x[j] + 10.0 * range);
        }
    }

    /// Updates the design by solving the MMA subproblem of the volume
    /// constrained problem. The scalar dual is found by bisection.
    ///
    /// # Arguments
    /// * `densities` - The current design field
    /// * `volume_fraction` - The target volume fraction
    /// * `sensitivities` - The filtered objective sensitivities
    /// * `volumes` - The element volumes
    /// * `params` - MMA tunables
    ///
    /// # Returns
    /// The new design field
    pub fn update(
        &mut self,
        densities: &[f64],
        volume_fraction: f64,
        sensitivities: &[f64],
        volumes: &[f64],
        params: &MmaParams,
    ) -> Result<Vec<f64>, TopOptError> {
        check_lengths(densities, sensitivities, volumes)?;
        let n = densities.len();
        let x = densities;

        if self.iteration > 0 && self.xold1.len() != n {
            return Err(TopOptError::Config(
                "Design size changed between MMA iterations".to_owned(),
            ));
        }

        self.update_asymptotes(x, params);

        let range = 1.0 - params.x_min;
        let eps_range = f64::max(range, 1e-5);
        let raa0 = 1e-5;
        let total_volume: f64 = volumes.iter().sum();
        let constraint = volume(x, volumes) / (volume_fraction * total_volume) - 1.0;

        let mut alpha = vec![0.0; n];
        let mut beta = vec![0.0; n];
        let mut p0 = vec![0.0; n];
        let mut q0 = vec![0.0; n];
        let mut p1 = vec![0.0; n];
        let mut q1 = vec![0.0; n];
        let mut r1 = constraint;

        for j in 0..n {
            let (lower, upper) = move_bounds(x[j], params.move_limit, params.x_min);
            alpha[j] = f64::max(lower, self.low[j] + params.albefa * (x[j] - self.low[j]));
            beta[j] = f64::min(upper, self.upp[j] - params.albefa * (self.upp[j] - x[j]));

            let ux1 = self.upp[j] - x[j];
            let xl1 = x[j] - self.low[j];
            let df = sensitivities[j];
            let dg = volumes[j] / (volume_fraction * total_volume);

            p0[j] = ux1 * ux1 * (1.001 * df.max(0.0) + 0.001 * (-df).max(0.0) + raa0 / eps_range);
            q0[j] = xl1 * xl1 * (0.001 * df.max(0.0) + 1.001 * (-df).max(0.0) + raa0 / eps_range);
            p1[j] = ux1 * ux1 * (1.001 * dg + raa0 / eps_range);
            q1[j] = xl1 * xl1 * (0.001 * dg + raa0 / eps_range);
            r1 -= p1[j] / ux1 + q1[j] / xl1;
        }

        let primal = |lambda: f64| -> Vec<f64> {
            (0..n)
                .map(|j| {
                    let sp = f64::sqrt(p0[j] + lambda * p1[j]);
                    let sq = f64::sqrt(q0[j] + lambda * q1[j]);
                    let xj = (sp * self.low[j] + sq * self.upp[j]) / (sp + sq);
                    xj.max(alpha[j]).min(beta[j])
                })
                .collect()
        };
        let approx_constraint = |xs: &[f64]| -> f64 {
            r1 + (0..n)
                .map(|j| p1[j] / (self.upp[j] - xs[j]) + q1[j] / (xs[j] - self.low[j]))
                .sum::<f64>()
        };

        let mut x_new = primal(0.0);
        if approx_constraint(&x_new) > 0.0 {
            let mut lo = 0.0;
            let mut hi = 1.0;
            let mut expansions = 0;
            let mut feasible = true;
            while approx_constraint(&primal(hi)) > 0.0 {
                lo = hi;
                hi *= 2.0;
                expansions += 1;
                if expansions >= params.max_bisections {
                    feasible = false;
                    break;
                }
            }

            if feasible {
                for _ in 0..params.max_bisections {
                    let mid = 0.5 * (lo + hi);
                    if approx_constraint(&primal(mid)) > 0.0 {
                        lo = mid;
                    } else {
                        hi = mid;
                    }
                    if hi - lo <= params.tolerance * (hi + lo) {
                        break;
                    }
                }
            } else {
                warn!("volume target is out of reach within the move limit, taking the smallest admissible step");
            }
            x_new = primal(hi);
            debug!("MMA dual variable {hi:e}");
        }

        self.xold2 = std::mem::replace(&mut self.xold1, x.to_vec());
        self.iteration += 1;

        Ok(x_new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_sensitivities(n: usize) -> Vec<f64> {
        (0..n).map(|i| -((i % 7) as f64 + 0.5) * 1e-3).collect()
    }

    #[test]
    fn oc_respects_box_and_move_limit() {
        let n = 50;
        let params = OcParams::default();
        let densities: Vec<f64> = (0..n).map(|i| 0.001 + 0.999 * (i as f64) / (n - 1) as f64).collect();
        let volumes = vec![1.0; n];

        let cases: Vec<Vec<f64>> = vec![
            synthetic_sensitivities(n),
            (0..n).map(|i| if i % 2 == 0 { 1e6 } else { -1e-9 }).collect(),
            vec![0.0; n],
            (0..n).map(|i| -1e12 * (i + 1) as f64).collect(),
        ];

        for dc in cases {
            let updated = update(&densities, 0.4, &dc, &volumes, &params).unwrap();
            for (old, new) in densities.iter().zip(&updated) {
                assert!(*new >= params.x_min && *new <= 1.0);
                assert!((new - old).abs() <= params.move_limit + 1e-12);
            }
        }
    }

    #[test]
    fn oc_matches_target_volume() {
        let n = 40;
        let densities = vec![0.3; n];
        let volumes: Vec<f64> = (0..n).map(|i| 1.0 + 0.5 * (i % 3) as f64).collect();
        let dc = synthetic_sensitivities(n);
        let updated = update(&densities, 0.3, &dc, &volumes, &OcParams::default()).unwrap();

        let fraction = volume(&updated, &volumes) / volumes.iter().sum::<f64>();
        assert!((fraction - 0.3).abs() < 1e-3);
        // stiffer regions gain material
        assert!(updated[6] > updated[0]);
    }

    #[test]
    fn strict_oc_reports_nonconvergence() {
        let params = OcParams {
            max_bisections: 3,
            strict: true,
            ..Default::default()
        };
        let result = update(&[0.5; 4], 0.5, &[-1.0; 4], &[1.0; 4], &params);
        assert!(matches!(result, Err(TopOptError::NonConvergence { .. })));

        let lenient = OcParams {
            max_bisections: 3,
            ..Default::default()
        };
        assert_eq!(update(&[0.5; 4], 0.5, &[-1.0; 4], &[1.0; 4], &lenient).unwrap().len(), 4);
    }

    #[test]
    fn mma_respects_box_and_move_limit() {
        let n = 30;
        let params = MmaParams::default();
        let mut state = MmaState::new();
        let volumes = vec![1.0; n];
        let mut x = vec![0.5; n];

        for _ in 0..5 {
            let dc = synthetic_sensitivities(n);
            let next = state.update(&x, 0.5, &dc, &volumes, &params).unwrap();
            for (old, new) in x.iter().zip(&next) {
                assert!(*new >= params.x_min && *new <= 1.0);
                assert!((new - old).abs() <= params.move_limit + 1e-12);
            }
            x = next;
        }
    }

    #[test]
    fn mma_removes_excess_volume() {
        let n = 20;
        let mut state = MmaState::new();
        let volumes = vec![1.0; n];
        let x = vec![0.9; n];
        let next = state
            .update(&x, 0.5, &vec![-1.0; n], &volumes, &MmaParams::default())
            .unwrap();
        assert!(volume(&next, &volumes) < volume(&x, &volumes));
    }

    #[test]
    fn method_names() {
        assert_eq!(Method::from_name("oc").unwrap(), Method::OptimalityCriteria);
        assert_eq!(Method::from_name("MMA").unwrap(), Method::MovingAsymptotes);
        assert!(Method::from_name("SLP").is_err());
    }
}
