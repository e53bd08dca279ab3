use indicatif::ProgressBar;
use log::{debug, info, warn};
use nalgebra::DVector;
use rayon::prelude::*;

use crate::{
    error::TopOptError,
    solver::{Equilibrium, FeModel},
};

/// Relative discrepancy above which the finite difference check warns
pub const SENSITIVITY_TOLERANCE: f64 = 0.05;

/// Computes the compliance sensitivity of every element with the adjoint method.
///
/// With `K_T λ = F`, the derivative of the compliance with respect to the
/// element density reduces to `λ_eᵀ ∂R_e/∂x_e`.
///
/// # Arguments
/// * `densities` - The design field the equilibrium was solved for
/// * `residual_derivative` - Per element derivative of the residual
/// * `adjoint` - The global adjoint vector
/// * `edof` - The 0-based element dof table
///
/// # Returns
/// The raw sensitivity of each element
pub fn sensitivities(
    densities: &[f64],
    residual_derivative: &[DVector<f64>],
    adjoint: &DVector<f64>,
    edof: &[Vec<usize>],
) -> Result<Vec<f64>, TopOptError> {
    if densities.len() != edof.len() || residual_derivative.len() != edof.len() {
        return Err(TopOptError::Config(format!(
            "Sensitivity inputs disagree: {} densities, {} residual derivatives, {} elements",
            densities.len(),
            residual_derivative.len(),
            edof.len()
        )));
    }

    Ok(edof
        .par_iter()
        .zip(residual_derivative.par_iter())
        .map(|(dofs, dr)| dofs.iter().zip(dr.iter()).map(|(d, r)| adjoint[*d] * r).sum())
        .collect())
}

/// Shorthand for [`sensitivities`] on a solved equilibrium
pub fn from_equilibrium(
    densities: &[f64],
    equilibrium: &Equilibrium,
    edof: &[Vec<usize>],
) -> Result<Vec<f64>, TopOptError> {
    sensitivities(
        densities,
        &equilibrium.residual_derivative,
        &equilibrium.adjoint,
        edof,
    )
}

/// Computes sensitivities by central differences of the compliance.
///
/// Every element needs two extra equilibrium solves, so this is only used to
/// verify the adjoint sensitivities.
///
/// # Arguments
/// * `model` - The finite element model
/// * `densities` - The design field
/// * `penalty` - The SIMP penalty exponent
/// * `loads` - The global load vector
/// * `step` - The density perturbation
/// * `initial` - Optional warm start for the perturbed solves
pub fn finite_difference(
    model: &FeModel,
    densities: &[f64],
    penalty: f64,
    loads: &DVector<f64>,
    step: f64,
    initial: Option<&DVector<f64>>,
) -> Result<Vec<f64>, TopOptError> {
    let bar = ProgressBar::new(densities.len() as u64);
    let mut result: Vec<f64> = Vec::with_capacity(densities.len());

    for e in 0..densities.len() {
        let mut forward = densities.to_vec();
        let mut backward = densities.to_vec();
        forward[e] += step;
        backward[e] -= step;

        let c_forward = model.compliance(&forward, penalty, loads, initial)?;
        let c_backward = model.compliance(&backward, penalty, loads, initial)?;
        result.push((c_forward - c_backward) / (2.0 * step));
        bar.inc(1);
    }
    bar.finish_and_clear();

    Ok(result)
}

/// Relative error of each adjoint sensitivity against a reference
pub fn relative_errors(adjoint: &[f64], reference: &[f64]) -> Vec<f64> {
    adjoint
        .iter()
        .zip(reference)
        .map(|(a, r)| {
            let scale = f64::max(r.abs(), f64::MIN_POSITIVE);
            (a - r).abs() / scale
        })
        .collect()
}

/// Compares the adjoint sensitivities with finite differences and logs the
/// outcome.
///
/// # Returns
/// The largest relative error over elements with a non-negligible reference
pub fn verify(
    model: &FeModel,
    densities: &[f64],
    penalty: f64,
    loads: &DVector<f64>,
    equilibrium: &Equilibrium,
) -> Result<f64, TopOptError> {
    info!("checking {} sensitivities by finite differences...", densities.len());

    let adjoint = from_equilibrium(densities, equilibrium, &model.mesh().edof)?;
    let numerical = finite_difference(
        model,
        densities,
        penalty,
        loads,
        1e-6,
        Some(&equilibrium.displacement),
    )?;

    let errors = relative_errors(&adjoint, &numerical);
    for (e, err) in errors.iter().enumerate() {
        debug!(
            "element {e}: adjoint {:e}, finite difference {:e}, relative error {err:e}",
            adjoint[e], numerical[e]
        );
    }

    let largest = numerical.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    let max_error = errors
        .into_iter()
        .zip(&numerical)
        .filter(|(_, r)| r.abs() > 1e-6 * largest)
        .fold(0.0_f64, |m, (err, _)| m.max(err));

    if max_error > SENSITIVITY_TOLERANCE {
        warn!(
            "adjoint sensitivities deviate from finite differences by up to {:.2}%",
            100.0 * max_error
        );
    } else {
        info!(
            "adjoint sensitivities agree with finite differences within {:.3}%",
            100.0 * max_error
        );
    }

    Ok(max_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjoint_inner_product_per_element() {
        let edof = vec![vec![0, 1], vec![1, 2]];
        let dr = vec![
            DVector::from_vec(vec![1.0, 2.0]),
            DVector::from_vec(vec![-1.0, 0.5]),
        ];
        let adjoint = DVector::from_vec(vec![3.0, 4.0, 5.0]);
        let dc = sensitivities(&[1.0, 1.0], &dr, &adjoint, &edof).unwrap();
        assert_eq!(dc, vec![11.0, -1.5]);
    }

    #[test]
    fn mismatched_inputs() {
        let edof = vec![vec![0, 1]];
        let adjoint = DVector::from_vec(vec![1.0, 1.0]);
        assert!(sensitivities(&[1.0, 1.0], &[], &adjoint, &edof).is_err());
    }

    #[test]
    fn relative_errors_against_reference() {
        let errors = relative_errors(&[1.0, -2.1], &[1.0, -2.0]);
        assert_eq!(errors[0], 0.0);
        assert!((errors[1] - 0.05).abs() < 1e-12);
    }
}
