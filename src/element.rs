use nalgebra::{DMatrix, DVector, Matrix2, Vector6};

use crate::{
    datatypes::{AnalysisType, ElementKind, ElementParams, IntegrationRule, MaterialParams, DOF},
    error::TopOptError,
    material::{MaterialModel, PLANE_COMPONENTS},
};

/// Jacobian determinants at or below this value mark a degenerate element
pub const MIN_JACOBIAN_DETERMINANT: f64 = 1e-10;

/// Element arrays produced by one element evaluation
#[derive(Debug, Clone)]
pub struct ElementResponse {
    pub stiffness: DMatrix<f64>,
    pub internal_force: DVector<f64>,
    pub external_force: DVector<f64>,
    /// Stress at the first integration point
    pub stress: Vector6<f64>,
    /// Strain at the first integration point
    pub strain: Vector6<f64>,
}

#[derive(Debug, Clone, Copy)]
struct GaussPoint {
    xi: f64,
    eta: f64,
    weight: f64,
}

fn gauss_points(kind: ElementKind, rule: IntegrationRule) -> Result<Vec<GaussPoint>, TopOptError> {
    let gp = |xi: f64, eta: f64, weight: f64| GaussPoint { xi, eta, weight };

    match (kind, rule) {
        (_, IntegrationRule::HigherOrder) => Err(TopOptError::NotImplemented(
            "higher order quadrature (integration rule 3)".to_owned(),
        )),
        (ElementKind::Tri3, IntegrationRule::OnePoint) => Ok(vec![gp(1. / 3., 1. / 3., 0.5)]),
        (ElementKind::Tri3, IntegrationRule::Full) => Ok(vec![
            gp(1. / 6., 1. / 6., 1. / 6.),
            gp(2. / 3., 1. / 6., 1. / 6.),
            gp(1. / 6., 2. / 3., 1. / 6.),
        ]),
        (ElementKind::Quad4, IntegrationRule::OnePoint) => Ok(vec![gp(0.0, 0.0, 4.0)]),
        (ElementKind::Quad4, IntegrationRule::Full) => {
            let g = 1.0 / f64::sqrt(3.0);
            Ok(vec![
                gp(-g, -g, 1.0),
                gp(g, -g, 1.0),
                gp(g, g, 1.0),
                gp(-g, g, 1.0),
            ])
        }
    }
}

/// Evaluates shape functions and their parametric derivatives
///
/// # Returns
/// The shape function values and a 2 x n matrix of derivatives with respect
/// to `xi` (row 0) and `eta` (row 1)
fn shape_functions(kind: ElementKind, xi: f64, eta: f64) -> (DVector<f64>, DMatrix<f64>) {
    match kind {
        ElementKind::Tri3 => (
            DVector::from_vec(vec![1.0 - xi - eta, xi, eta]),
            DMatrix::from_row_slice(2, 3, &[-1.0, 1.0, 0.0, -1.0, 0.0, 1.0]),
        ),
        ElementKind::Quad4 => {
            let corners = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];
            let mut n = DVector::zeros(4);
            let mut dnr = DMatrix::zeros(2, 4);
            for (i, (xi_i, eta_i)) in corners.iter().enumerate() {
                n[i] = 0.25 * (1.0 + xi * xi_i) * (1.0 + eta * eta_i);
                dnr[(0, i)] = 0.25 * xi_i * (1.0 + eta * eta_i);
                dnr[(1, i)] = 0.25 * eta_i * (1.0 + xi * xi_i);
            }
            (n, dnr)
        }
    }
}

fn check_analysis(params: &ElementParams) -> Result<(), TopOptError> {
    match (params.analysis, params.integration) {
        (AnalysisType::PlaneStrain, _) => Ok(()),
        (AnalysisType::PlaneStrainSelectiveReduced, IntegrationRule::Full) => Err(
            TopOptError::NotImplemented("selectively reduced integration".to_owned()),
        ),
        (analysis, _) => Err(TopOptError::UnsupportedAnalysis(format!(
            "{:?}, only plane strain is supported",
            analysis
        ))),
    }
}

/// Evaluates the stiffness matrix, force vectors and stress of one element.
///
/// # Arguments
/// * `kind` - The element type
/// * `ue` - The element nodal displacements `[ux0, uy0, ux1, uy1, ...]`
/// * `ex` - The nodal x coordinates
/// * `ey` - The nodal y coordinates
/// * `params` - Analysis type, thickness and integration rule
/// * `mp` - The material parameters
/// * `material` - The material model
/// * `body_load` - Optional distributed load per unit volume
///
/// # Returns
/// An ElementResponse with stress and strain taken at the first Gauss point
#[allow(clippy::too_many_arguments)]
pub fn evaluate(
    kind: ElementKind,
    ue: &DVector<f64>,
    ex: &[f64],
    ey: &[f64],
    params: &ElementParams,
    mp: &MaterialParams,
    material: &MaterialModel,
    body_load: Option<[f64; 2]>,
) -> Result<ElementResponse, TopOptError> {
    check_analysis(params)?;

    let nodes = kind.nodes();
    let dofs = kind.dofs();
    if ex.len() != nodes || ey.len() != nodes || ue.len() != dofs {
        return Err(TopOptError::Config(format!(
            "{:?} element expects {} nodes and {} dofs, got {} x, {} y and {} displacements",
            kind,
            nodes,
            dofs,
            ex.len(),
            ey.len(),
            ue.len()
        )));
    }

    let b = body_load.unwrap_or([0.0, 0.0]);
    let coords = DMatrix::from_fn(nodes, 2, |i, j| if j == 0 { ex[i] } else { ey[i] });
    let thickness = params.thickness;

    let mut stiffness: DMatrix<f64> = DMatrix::zeros(dofs, dofs);
    let mut internal_force: DVector<f64> = DVector::zeros(dofs);
    let mut external_force: DVector<f64> = DVector::zeros(dofs);
    let mut first_point: Option<(Vector6<f64>, Vector6<f64>)> = None;

    for point in gauss_points(kind, params.integration)? {
        let (n, dnr) = shape_functions(kind, point.xi, point.eta);

        let jt = &dnr * &coords;
        let jacobian = Matrix2::new(jt[(0, 0)], jt[(0, 1)], jt[(1, 0)], jt[(1, 1)]);
        let det_j = jacobian.determinant();
        if det_j <= MIN_JACOBIAN_DETERMINANT {
            return Err(TopOptError::DegenerateElement { element: None, det_j });
        }
        let jacobian_inv = match jacobian.try_inverse() {
            Some(inv) => inv,
            None => return Err(TopOptError::DegenerateElement { element: None, det_j }),
        };

        // derivatives with respect to x (row 0) and y (row 1)
        let dnx = DMatrix::from_fn(2, nodes, |r, c| {
            jacobian_inv[(r, 0)] * dnr[(0, c)] + jacobian_inv[(r, 1)] * dnr[(1, c)]
        });

        let mut strain_displacement_mat: DMatrix<f64> = DMatrix::zeros(3, dofs);
        let mut shape_mat: DMatrix<f64> = DMatrix::zeros(2, dofs);
        for i in 0..nodes {
            strain_displacement_mat[(0, DOF * i)] = dnx[(0, i)];
            strain_displacement_mat[(1, DOF * i + 1)] = dnx[(1, i)];
            strain_displacement_mat[(2, DOF * i)] = dnx[(1, i)];
            strain_displacement_mat[(2, DOF * i + 1)] = dnx[(0, i)];

            shape_mat[(0, DOF * i)] = n[i];
            shape_mat[(1, DOF * i + 1)] = n[i];
        }

        let plane_strain = &strain_displacement_mat * ue;
        let mut strain: Vector6<f64> = Vector6::zeros();
        for (k, component) in PLANE_COMPONENTS.iter().enumerate() {
            strain[*component] = plane_strain[k];
        }

        let (stress, tangent) = material.evaluate(&strain, mp);
        if first_point.is_none() {
            first_point = Some((stress, strain));
        }

        let d_plane = DMatrix::from_fn(3, 3, |r, c| {
            tangent[(PLANE_COMPONENTS[r], PLANE_COMPONENTS[c])]
        });
        let stress_plane = DVector::from_fn(3, |r, _| stress[PLANE_COMPONENTS[r]]);
        let factor = det_j * point.weight * thickness;

        stiffness += strain_displacement_mat.transpose() * d_plane * &strain_displacement_mat * factor;
        internal_force += strain_displacement_mat.transpose() * stress_plane * factor;
        external_force += shape_mat.transpose() * DVector::from_vec(b.to_vec()) * factor;
    }

    let (stress, strain) = first_point.unwrap_or((Vector6::zeros(), Vector6::zeros()));

    Ok(ElementResponse {
        stiffness,
        internal_force,
        external_force,
        stress,
        strain,
    })
}
