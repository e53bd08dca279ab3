//! Finite-difference checks of the adjoint compliance sensitivities.
//!
//! A coarse cantilever is solved at a non-uniform design and every adjoint
//! sensitivity is compared against a central-difference estimate
//!
//!     dc/dx_e  ≈  [ c(x + h e_e) − c(x − h e_e) ] / 2h
//!
//! for a linear elastic and a stiffening (nonlinear) material.

use nalgebra::DVector;
use simp_topopt::{
    datatypes::{ElementKind, ElementParams, ForceSpec, MaterialParams, Mesh, Vertex},
    material::MaterialModel,
    mesher::{self, EdgeMarkers, PointMarker, Rectangle},
    sensitivity,
    solver::{load_vector, FeModel, NewtonConfig},
};

const PENALTY: f64 = 3.0;

fn coarse_cantilever(kind: ElementKind) -> Mesh {
    let rectangle = Rectangle {
        width: 2.0,
        height: 0.8,
        edges: EdgeMarkers {
            left: Some(4),
            ..Default::default()
        },
        points: vec![PointMarker {
            vertex: Vertex { x: 2.0, y: 0.4 },
            marker: 9,
        }],
    };
    mesher::run(&rectangle, 0.4, kind).unwrap()
}

fn tip_load(mesh: &Mesh, magnitude: f64) -> DVector<f64> {
    load_vector(
        mesh,
        &ForceSpec {
            magnitude,
            markers: vec![9],
            direction: 2,
        },
    )
    .unwrap()
}

/// Deterministic, non-uniform design in [0.3, 0.9]
fn design(n: usize) -> Vec<f64> {
    (0..n).map(|e| 0.3 + 0.6 * ((e * 7 + 3) % 11) as f64 / 10.0).collect()
}

fn tight() -> NewtonConfig {
    NewtonConfig {
        tolerance: 1e-11,
        max_iterations: 40,
        ..Default::default()
    }
}

/// Largest relative error over elements with a non-negligible reference
fn max_relative_error(adjoint: &[f64], reference: &[f64]) -> f64 {
    let largest = reference.iter().fold(0.0_f64, |m, r| m.max(r.abs()));
    sensitivity::relative_errors(adjoint, reference)
        .into_iter()
        .zip(reference)
        .filter(|(_, r)| r.abs() > 1e-3 * largest)
        .fold(0.0, |m, (err, _)| f64::max(m, err))
}

fn check(
    mesh: &Mesh,
    material: MaterialModel,
    mp: MaterialParams,
    params: ElementParams,
    load: f64,
) -> (f64, Vec<f64>) {
    let fixed = mesh.marker_dofs(&[4]).unwrap();
    let model = FeModel::new(mesh, params, &material, mp, &fixed, tight()).unwrap();
    let loads = tip_load(mesh, load);
    let x = design(mesh.num_elements());

    let eq = model.solve(&x, PENALTY, &loads, None).unwrap();
    let adjoint = sensitivity::from_equilibrium(&x, &eq, &mesh.edof).unwrap();
    let fd = sensitivity::finite_difference(
        &model,
        &x,
        PENALTY,
        &loads,
        1e-5,
        Some(&eq.displacement),
    )
    .unwrap();

    (max_relative_error(&adjoint, &fd), adjoint)
}

#[test]
fn elastic_adjoint_matches_finite_differences() {
    for kind in [ElementKind::Tri3, ElementKind::Quad4] {
        let mesh = coarse_cantilever(kind);
        let (error, adjoint) = check(
            &mesh,
            MaterialModel::Elastic,
            MaterialParams::new(210e9, 0.3, 0.0),
            ElementParams::default(),
            -4e5,
        );
        assert!(error < 0.05, "{kind:?}: max relative error {error}");
        // adding material never raises the linear compliance
        assert!(adjoint.iter().all(|dc| *dc <= 0.0));
    }
}

#[test]
fn stiffening_adjoint_matches_finite_differences() {
    let mesh = coarse_cantilever(ElementKind::Quad4);
    let mut mp = MaterialParams::new(210e9, 0.3, 0.0);
    mp.stiffening = 1e4;
    let params = ElementParams {
        linear: false,
        ..Default::default()
    };
    let (error, _) = check(&mesh, MaterialModel::ModifiedHooke, mp, params, -2e6);
    assert!(error < 0.05, "max relative error {error}");
}

#[test]
fn numerical_tangent_gives_same_sensitivities() {
    let mesh = coarse_cantilever(ElementKind::Tri3);
    let mut mp = MaterialParams::new(210e9, 0.3, 0.0);
    mp.stiffening = 1e4;
    let params = ElementParams {
        linear: false,
        ..Default::default()
    };
    let (error, _) = check(
        &mesh,
        MaterialModel::Numerical(Box::new(MaterialModel::ModifiedHooke)),
        mp,
        params,
        -2e6,
    );
    assert!(error < 0.05, "max relative error {error}");
}

#[test]
fn verify_reports_agreement() {
    let mesh = coarse_cantilever(ElementKind::Quad4);
    let material = MaterialModel::Elastic;
    let fixed = mesh.marker_dofs(&[4]).unwrap();
    let model = FeModel::new(
        &mesh,
        ElementParams::default(),
        &material,
        MaterialParams::new(210e9, 0.3, 0.0),
        &fixed,
        tight(),
    )
    .unwrap();
    let loads = tip_load(&mesh, -4e5);
    let x = design(mesh.num_elements());
    let eq = model.solve(&x, PENALTY, &loads, None).unwrap();

    let error = sensitivity::verify(&model, &x, PENALTY, &loads, &eq).unwrap();
    assert!(error < sensitivity::SENSITIVITY_TOLERANCE);
}
