//! Constitutive models.
//!
//! Strains and stresses are 6-component Voigt vectors ordered
//! `[xx, yy, zz, xy, xz, yz]` with engineering shear strains. Plane strain
//! elements only populate the `xx`, `yy` and `xy` strain components.

use nalgebra::{Matrix6, Vector6};

use crate::{datatypes::MaterialParams, error::TopOptError};

/// Step used by the central difference tangent
pub const NUMERICAL_TANGENT_STEP: f64 = 1e-8;

/// Voigt indices of the in-plane components
pub const PLANE_COMPONENTS: [usize; 3] = [0, 1, 3];

#[derive(Debug, Clone, PartialEq)]
pub enum MaterialModel {
    Elastic,
    Bilinear,
    ModifiedHooke,
    /// Wraps a model and replaces its tangent with a central difference
    Numerical(Box<MaterialModel>),
}

impl MaterialModel {
    pub fn from_name(name: &str) -> Result<MaterialModel, TopOptError> {
        let lowered = name.trim().to_lowercase();
        if let Some(inner) = lowered.strip_prefix("numerical:") {
            return Ok(MaterialModel::Numerical(Box::new(MaterialModel::from_name(
                inner,
            )?)));
        }
        match lowered.as_str() {
            "elastic" => Ok(MaterialModel::Elastic),
            "bilinear" => Ok(MaterialModel::Bilinear),
            "modifiedhooke" | "modified_hooke" => Ok(MaterialModel::ModifiedHooke),
            _ => Err(TopOptError::Config(format!(
                "Unknown material model '{name}'"
            ))),
        }
    }

    pub fn name(&self) -> String {
        match self {
            MaterialModel::Elastic => "elastic".to_owned(),
            MaterialModel::Bilinear => "bilinear".to_owned(),
            MaterialModel::ModifiedHooke => "modified_hooke".to_owned(),
            MaterialModel::Numerical(inner) => format!("numerical:{}", inner.name()),
        }
    }

    /// True when the stress is a linear function of strain
    pub fn is_linear(&self) -> bool {
        match self {
            MaterialModel::Elastic => true,
            MaterialModel::Numerical(inner) => inner.is_linear(),
            _ => false,
        }
    }

    /// Evaluates the material response at a strain state
    ///
    /// # Arguments
    /// * `strain` - The Voigt strain vector
    /// * `mp` - The material parameters
    ///
    /// # Returns
    /// The Voigt stress vector and the 6x6 tangent modulus, in that order
    pub fn evaluate(
        &self,
        strain: &Vector6<f64>,
        mp: &MaterialParams,
    ) -> (Vector6<f64>, Matrix6<f64>) {
        match self {
            MaterialModel::Elastic => elastic(strain, mp),
            MaterialModel::Bilinear => bilinear(strain, mp),
            MaterialModel::ModifiedHooke => modified_hooke(strain, mp),
            MaterialModel::Numerical(inner) => {
                let (stress, _) = inner.evaluate(strain, mp);
                (stress, numerical_tangent(inner, strain, mp))
            }
        }
    }
}

/// `m mᵀ` with `m` the Voigt identity
fn volumetric_projector() -> Matrix6<f64> {
    let mut mm = Matrix6::zeros();
    for i in 0..3 {
        for j in 0..3 {
            mm[(i, j)] = 1.0;
        }
    }
    mm
}

/// Deviatoric operator in engineering-shear Voigt notation.
///
/// For any strain `e`, `P e` holds twice the deviatoric normal strains and
/// the engineering shears, so that `σ_dev = G P e`.
fn deviatoric_operator() -> Matrix6<f64> {
    let mut p = Matrix6::zeros();
    for i in 0..3 {
        for j in 0..3 {
            p[(i, j)] = if i == j { 4.0 / 3.0 } else { -2.0 / 3.0 };
        }
        p[(i + 3, i + 3)] = 1.0;
    }
    p
}

/// Calculates the isotropic 3D stress-strain matrix
///
/// # Arguments
/// * `mp` - The material parameters
///
/// # Returns
/// A 6x6 stress-strain matrix
pub fn compute_stress_strain_matrix(mp: &MaterialParams) -> Matrix6<f64> {
    volumetric_projector() * mp.bulk_modulus() + deviatoric_operator() * mp.shear_modulus()
}

fn elastic(strain: &Vector6<f64>, mp: &MaterialParams) -> (Vector6<f64>, Matrix6<f64>) {
    let d = compute_stress_strain_matrix(mp);
    (d * strain, d)
}

/// Bilinear response along the energy norm of the strain.
///
/// The effective strain is `e = sqrt(εᵀ D ε / E)`. Up to the yield strain the
/// response is elastic; beyond it the secant stiffness drops so that the
/// effective stress grows with `hardening_ratio * E`. The response derives
/// from a strain energy, which keeps the tangent symmetric.
fn bilinear(strain: &Vector6<f64>, mp: &MaterialParams) -> (Vector6<f64>, Matrix6<f64>) {
    let d = compute_stress_strain_matrix(mp);
    let d_strain = d * strain;
    let effective = f64::sqrt(f64::max(strain.dot(&d_strain) / mp.youngs_modulus, 0.0));

    if effective <= mp.yield_strain || effective == 0.0 {
        return (d_strain, d);
    }

    let alpha = mp.hardening_ratio;
    let scale = alpha + (1.0 - alpha) * mp.yield_strain / effective;
    let scale_rate = -(1.0 - alpha) * mp.yield_strain / f64::powi(effective, 2);

    let stress = d_strain * scale;
    let tangent = d * scale
        + (d_strain * d_strain.transpose()) * (scale_rate / (mp.youngs_modulus * effective));
    (stress, tangent)
}

/// Hooke's law with a shear modulus that stiffens with the deviatoric strain.
///
/// `G(e) = G0 (1 + k e²)` where `e²` is the squared deviatoric strain norm and
/// `k` is `stiffening`. The bulk response stays linear.
fn modified_hooke(strain: &Vector6<f64>, mp: &MaterialParams) -> (Vector6<f64>, Matrix6<f64>) {
    let volumetric = volumetric_projector() * mp.bulk_modulus();
    let p = deviatoric_operator();
    let g0 = mp.shear_modulus();

    let q = p * strain;
    let deviatoric_sq = 0.5 * strain.dot(&q);
    let shear_modulus = g0 * (1.0 + mp.stiffening * deviatoric_sq);

    let stress = volumetric * strain + q * shear_modulus;
    let tangent = volumetric + p * shear_modulus + (q * q.transpose()) * (g0 * mp.stiffening);
    (stress, tangent)
}

/// Calculates the tangent modulus of a model by central differences.
///
/// Column `i` holds the derivative of the stress with respect to strain
/// component `i`. Intended for verification.
pub fn numerical_tangent(
    model: &MaterialModel,
    strain: &Vector6<f64>,
    mp: &MaterialParams,
) -> Matrix6<f64> {
    let step = NUMERICAL_TANGENT_STEP * f64::max(1.0, strain.amax());
    let mut tangent = Matrix6::zeros();

    for i in 0..6 {
        let mut forward = *strain;
        let mut backward = *strain;
        forward[i] += step;
        backward[i] -= step;

        let (stress_forward, _) = model.evaluate(&forward, mp);
        let (stress_backward, _) = model.evaluate(&backward, mp);
        tangent.set_column(i, &((stress_forward - stress_backward) / (2.0 * step)));
    }

    tangent
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> MaterialParams {
        MaterialParams {
            youngs_modulus: 210e9,
            poisson_ratio: 0.3,
            yield_strain: 1e-4,
            hardening_ratio: 0.1,
            stiffening: 5e5,
        }
    }

    fn sample_strain() -> Vector6<f64> {
        Vector6::new(3e-4, -1e-4, 0.0, 2e-4, 0.0, 0.0)
    }

    fn relative_difference(a: &Matrix6<f64>, b: &Matrix6<f64>) -> f64 {
        (a - b).norm() / b.norm()
    }

    #[test]
    fn hooke_matrix_matches_lame_constants() {
        let mp = params();
        let d = compute_stress_strain_matrix(&mp);
        let e = mp.youngs_modulus;
        let nu = mp.poisson_ratio;
        let lambda = e * nu / ((1.0 + nu) * (1.0 - 2.0 * nu));
        let mu = e / (2.0 * (1.0 + nu));

        assert!((d[(0, 0)] - (lambda + 2.0 * mu)).abs() / e < 1e-12);
        assert!((d[(0, 1)] - lambda).abs() / e < 1e-12);
        assert!((d[(3, 3)] - mu).abs() / e < 1e-12);
        assert!(d[(0, 3)].abs() < 1e-3);
    }

    #[test]
    fn analytic_tangents_match_numerical() {
        let mp = params();
        for model in [
            MaterialModel::Elastic,
            MaterialModel::Bilinear,
            MaterialModel::ModifiedHooke,
        ] {
            let strain = sample_strain();
            let (_, analytic) = model.evaluate(&strain, &mp);
            let numerical = numerical_tangent(&model, &strain, &mp);
            assert!(
                relative_difference(&numerical, &analytic) < 1e-4,
                "tangent mismatch for {}",
                model.name()
            );
        }
    }

    #[test]
    fn tangents_are_symmetric() {
        let mp = params();
        for model in [MaterialModel::Bilinear, MaterialModel::ModifiedHooke] {
            let (_, tangent) = model.evaluate(&sample_strain(), &mp);
            assert!((tangent - tangent.transpose()).norm() / tangent.norm() < 1e-12);
        }
    }

    #[test]
    fn bilinear_is_elastic_below_yield() {
        let mp = params();
        let strain = sample_strain() * 1e-2;
        let (stress, tangent) = MaterialModel::Bilinear.evaluate(&strain, &mp);
        let (elastic_stress, d) = MaterialModel::Elastic.evaluate(&strain, &mp);
        assert!((stress - elastic_stress).norm() <= 1e-9 * elastic_stress.norm());
        assert_eq!(tangent, d);
    }

    #[test]
    fn bilinear_softens_beyond_yield() {
        let mp = params();
        let strain = sample_strain() * 10.0;
        let (stress, _) = MaterialModel::Bilinear.evaluate(&strain, &mp);
        let (elastic_stress, _) = MaterialModel::Elastic.evaluate(&strain, &mp);
        assert!(stress.norm() < elastic_stress.norm());
        assert!(stress.norm() > mp.hardening_ratio * elastic_stress.norm());
    }

    #[test]
    fn numerical_wrapper_keeps_stress() {
        let mp = params();
        let model = MaterialModel::from_name("numerical:elastic").unwrap();
        let (stress, tangent) = model.evaluate(&sample_strain(), &mp);
        let (elastic_stress, d) = MaterialModel::Elastic.evaluate(&sample_strain(), &mp);
        assert_eq!(stress, elastic_stress);
        assert!(relative_difference(&tangent, &d) < 1e-6);
        assert!(model.is_linear());
    }

    #[test]
    fn zero_strain_gives_zero_stress() {
        let mp = params();
        for model in [
            MaterialModel::Elastic,
            MaterialModel::Bilinear,
            MaterialModel::ModifiedHooke,
        ] {
            let (stress, _) = model.evaluate(&Vector6::zeros(), &mp);
            assert_eq!(stress.norm(), 0.0);
        }
    }

    #[test]
    fn unknown_model_name() {
        assert!(MaterialModel::from_name("plastic").is_err());
    }
}
