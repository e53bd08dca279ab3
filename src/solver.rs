use log::debug;
use nalgebra::DVector;
use rayon::prelude::*;

use crate::{
    datatypes::{ElementParams, ForceSpec, MaterialParams, Mesh, DOF},
    element::{self, ElementResponse},
    error::TopOptError,
    linalg::{self, LinearSolver},
    material::MaterialModel,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NewtonConfig {
    /// Residual norm relative to the external load norm
    pub tolerance: f64,
    pub max_iterations: usize,
    pub linear_solver: LinearSolver,
}

impl Default for NewtonConfig {
    fn default() -> Self {
        NewtonConfig {
            tolerance: 1e-8,
            max_iterations: 25,
            linear_solver: LinearSolver::Cholesky,
        }
    }
}

/// Converged state of one equilibrium solve
#[derive(Debug, Clone)]
pub struct Equilibrium {
    pub displacement: DVector<f64>,
    /// Derivative of the element residual with respect to the element density
    pub residual_derivative: Vec<DVector<f64>>,
    /// Adjoint vector of the compliance objective
    pub adjoint: DVector<f64>,
    pub compliance: f64,
    /// Final residual norm relative to the external load norm
    pub residual_norm: f64,
    pub iterations: usize,
}

/// Finite element model of a design domain
pub struct FeModel<'a> {
    mesh: &'a Mesh,
    params: ElementParams,
    material: &'a MaterialModel,
    material_params: MaterialParams,
    body_load: Option<[f64; 2]>,
    fixed: Vec<bool>,
    config: NewtonConfig,
}

impl<'a> FeModel<'a> {
    pub fn new(
        mesh: &'a Mesh,
        params: ElementParams,
        material: &'a MaterialModel,
        material_params: MaterialParams,
        fixed_dofs: &[usize],
        config: NewtonConfig,
    ) -> Result<FeModel<'a>, TopOptError> {
        material_params.validate()?;
        if !(params.thickness > 0.0) {
            return Err(TopOptError::Config(format!(
                "Element thickness must be positive, got {}",
                params.thickness
            )));
        }

        let mut fixed = vec![false; mesh.num_dofs];
        for dof in fixed_dofs {
            match fixed.get_mut(*dof) {
                Some(f) => *f = true,
                None => {
                    return Err(TopOptError::Config(format!(
                        "Fixed dof {dof} is outside the mesh"
                    )))
                }
            }
        }

        Ok(FeModel {
            mesh,
            params,
            material,
            material_params,
            body_load: None,
            fixed,
            config,
        })
    }

    pub fn with_body_load(mut self, body_load: Option<[f64; 2]>) -> FeModel<'a> {
        self.body_load = body_load;
        self
    }

    pub fn mesh(&self) -> &Mesh {
        self.mesh
    }

    pub fn material(&self) -> &MaterialModel {
        self.material
    }

    pub fn params(&self) -> &ElementParams {
        &self.params
    }

    fn gather(&self, element: usize, u: &DVector<f64>) -> DVector<f64> {
        DVector::from_iterator(
            self.mesh.kind.dofs(),
            self.mesh.edof[element].iter().map(|d| u[*d]),
        )
    }

    /// Evaluates every element at the displacement `u`.
    ///
    /// Elements are independent, so the loop runs in parallel; the results
    /// are reduced into global arrays by the caller.
    fn evaluate_elements(&self, u: &DVector<f64>) -> Result<Vec<ElementResponse>, TopOptError> {
        (0..self.mesh.num_elements())
            .into_par_iter()
            .map(|e| {
                let (ex, ey) = self.mesh.element_coords(e);
                element::evaluate(
                    self.mesh.kind,
                    &self.gather(e, u),
                    &ex,
                    &ey,
                    &self.params,
                    &self.material_params,
                    self.material,
                    self.body_load,
                )
                .map_err(|err| err.at_element(e))
            })
            .collect()
    }

    /// Compiles penalized element contributions into the global tangent and
    /// internal force. Rows and columns of fixed dofs are replaced by a unit
    /// diagonal.
    fn assemble(
        &self,
        densities: &[f64],
        penalty: f64,
        responses: &[ElementResponse],
    ) -> (nalgebra_sparse::CscMatrix<f64>, DVector<f64>) {
        let n = self.mesh.num_dofs;
        let dofs = self.mesh.kind.dofs();
        let mut triplets: Vec<(usize, usize, f64)> =
            Vec::with_capacity(responses.len() * dofs * dofs + n);
        let mut internal_force: DVector<f64> = DVector::zeros(n);

        for (e, response) in responses.iter().enumerate() {
            let scale = densities[e].powf(penalty);
            let edof = &self.mesh.edof[e];

            for (local_row, global_row) in edof.iter().enumerate() {
                internal_force[*global_row] += scale * response.internal_force[local_row];
                if self.fixed[*global_row] {
                    continue;
                }
                for (local_col, global_col) in edof.iter().enumerate() {
                    if self.fixed[*global_col] {
                        continue;
                    }
                    triplets.push((
                        *global_row,
                        *global_col,
                        scale * response.stiffness[(local_row, local_col)],
                    ));
                }
            }
        }

        for (dof, fixed) in self.fixed.iter().enumerate() {
            if *fixed {
                triplets.push((dof, dof, 1.0));
            }
        }

        (linalg::assemble(n, &triplets), internal_force)
    }

    fn body_force(&self, responses: &[ElementResponse]) -> DVector<f64> {
        let mut force: DVector<f64> = DVector::zeros(self.mesh.num_dofs);
        if self.body_load.is_none() {
            return force;
        }
        for (e, response) in responses.iter().enumerate() {
            for (local, global) in self.mesh.edof[e].iter().enumerate() {
                force[*global] += response.external_force[local];
            }
        }
        force
    }

    fn zero_fixed(&self, v: &mut DVector<f64>) {
        for (dof, fixed) in self.fixed.iter().enumerate() {
            if *fixed {
                v[dof] = 0.0;
            }
        }
    }

    /// Solves for equilibrium of the penalized structure with Newton's method.
    ///
    /// # Arguments
    /// * `densities` - One design variable per element
    /// * `penalty` - The SIMP penalty exponent
    /// * `loads` - The global nodal load vector
    /// * `initial` - Optional starting displacement, e.g. the previous design's
    ///
    /// # Returns
    /// The converged Equilibrium with residual derivatives and adjoint vector
    pub fn solve(
        &self,
        densities: &[f64],
        penalty: f64,
        loads: &DVector<f64>,
        initial: Option<&DVector<f64>>,
    ) -> Result<Equilibrium, TopOptError> {
        let n = self.mesh.num_dofs;
        if densities.len() != self.mesh.num_elements() {
            return Err(TopOptError::Config(format!(
                "Expected {} densities, got {}",
                self.mesh.num_elements(),
                densities.len()
            )));
        }
        if loads.len() != n {
            return Err(TopOptError::Config(format!(
                "Expected a load vector of length {n}, got {}",
                loads.len()
            )));
        }

        let mut u: DVector<f64> = match initial {
            Some(u0) if u0.len() == n => u0.clone(),
            _ => DVector::zeros(n),
        };
        self.zero_fixed(&mut u);

        let mut external: Option<DVector<f64>> = None;
        let mut iterations = 0;

        let (tangent, responses, external, residual_norm) = loop {
            let responses = self.evaluate_elements(&u)?;
            let external = external
                .get_or_insert_with(|| {
                    let mut f = loads + self.body_force(&responses);
                    self.zero_fixed(&mut f);
                    f
                })
                .clone();
            let scale = f64::max(external.norm(), f64::MIN_POSITIVE);

            let (tangent, internal_force) = self.assemble(densities, penalty, &responses);
            let mut residual = &external - internal_force;
            self.zero_fixed(&mut residual);

            let residual_norm = residual.norm() / scale;
            debug!("newton iteration {iterations}: relative residual {residual_norm:e}");

            if residual_norm <= self.config.tolerance {
                break (tangent, responses, external, residual_norm);
            }
            if iterations >= self.config.max_iterations {
                return Err(TopOptError::NonConvergence {
                    stage: "Newton equilibrium iteration",
                    iterations,
                    residual: residual_norm,
                });
            }

            let increment = self.config.linear_solver.factor(&tangent)?.solve(&residual)?;
            u += increment;
            iterations += 1;
        };

        // compliance c = Fᵀu, so the adjoint load is F itself
        let adjoint = self.config.linear_solver.factor(&tangent)?.solve(&external)?;

        let residual_derivative: Vec<DVector<f64>> = responses
            .par_iter()
            .enumerate()
            .map(|(e, response)| {
                &response.internal_force * (-penalty * densities[e].powf(penalty - 1.0))
            })
            .collect();

        Ok(Equilibrium {
            compliance: external.dot(&u),
            displacement: u,
            residual_derivative,
            adjoint,
            residual_norm,
            iterations,
        })
    }

    /// Compliance of a design, used by the finite difference check
    pub fn compliance(
        &self,
        densities: &[f64],
        penalty: f64,
        loads: &DVector<f64>,
        initial: Option<&DVector<f64>>,
    ) -> Result<f64, TopOptError> {
        Ok(self.solve(densities, penalty, loads, initial)?.compliance)
    }
}

/// Builds the global load vector from a force specification.
///
/// The magnitude is added to every dof of the marked nodes along the given
/// direction: 1 for x, 2 for y, 0 for both.
pub fn load_vector(mesh: &Mesh, force: &ForceSpec) -> Result<DVector<f64>, TopOptError> {
    let mut f: DVector<f64> = DVector::zeros(mesh.num_dofs);
    for dof in mesh.marker_dofs(&force.markers)? {
        let applies = match force.direction {
            0 => true,
            1 => dof % DOF == 0,
            2 => dof % DOF == 1,
            d => {
                return Err(TopOptError::Config(format!(
                    "Force direction must be 0, 1 or 2, got {d}"
                )))
            }
        };
        if applies {
            f[dof] += force.magnitude;
        }
    }
    Ok(f)
}
