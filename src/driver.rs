use log::{debug, info};
use nalgebra::DVector;

use crate::{
    datatypes::Mesh,
    error::TopOptError,
    filter::{self, WeightMatrix},
    input::ProblemDefinition,
    mesher,
    optimizer::{self, Method, MmaParams, MmaState, OcParams},
    sensitivity,
    solver::{self, Equilibrium, FeModel},
};

/// User facing run settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Settings {
    pub volume_fraction: f64,
    /// Target element size handed to the mesher
    pub mesh_size: f64,
    pub filter_radius: f64,
    /// Largest density change at which the design counts as converged
    pub change_limit: f64,
    pub penalty: f64,
    pub method: Method,
    /// Cross-checks the adjoint sensitivities against finite differences
    pub debug: bool,
    pub max_iterations: usize,
}

impl Settings {
    pub fn validate(&self) -> Result<(), TopOptError> {
        if !(self.volume_fraction > 0.0 && self.volume_fraction < 1.0) {
            return Err(TopOptError::Config(format!(
                "Volume fraction must lie in (0, 1), got {}",
                self.volume_fraction
            )));
        }
        if !(self.mesh_size > 0.0) {
            return Err(TopOptError::Config(format!(
                "Mesh size must be positive, got {}",
                self.mesh_size
            )));
        }
        if !(self.filter_radius > 0.0) {
            return Err(TopOptError::Config(format!(
                "Filter radius must be positive, got {}",
                self.filter_radius
            )));
        }
        if !(self.change_limit >= 0.0) {
            return Err(TopOptError::Config(format!(
                "Change limit must be non-negative, got {}",
                self.change_limit
            )));
        }
        if !(self.penalty >= 1.0) {
            return Err(TopOptError::Config(format!(
                "Penalty exponent must be at least 1, got {}",
                self.penalty
            )));
        }
        if self.max_iterations == 0 {
            return Err(TopOptError::Config(
                "Iteration cap must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OptimizerParams {
    pub oc: OcParams,
    pub mma: MmaParams,
}

/// Summary of one outer iteration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationRecord {
    pub iteration: usize,
    pub compliance: f64,
    /// Volume fraction of the design the compliance was evaluated for
    pub volume_fraction: f64,
    /// Largest density change made by the update
    pub change: f64,
    pub newton_iterations: usize,
    pub residual_norm: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Converged,
    /// The iteration cap was reached before the change dropped below the limit
    IterationCap,
}

#[derive(Debug, Clone)]
pub struct OptimizationResult {
    pub densities: Vec<f64>,
    /// Displacement of the last analysed design
    pub displacement: DVector<f64>,
    pub history: Vec<IterationRecord>,
    pub termination: Termination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Initialize,
    Solve,
    Sensitize,
    Filter,
    Update,
    CheckConvergence,
    Terminate(Termination),
}

/// Volume fraction of a design, weighted by element volume
pub fn volume_fraction(densities: &[f64], volumes: &[f64]) -> f64 {
    let total: f64 = volumes.iter().sum();
    densities.iter().zip(volumes).map(|(x, v)| x * v).sum::<f64>() / total
}

struct Run<'r, 'm> {
    model: &'r FeModel<'m>,
    loads: &'r DVector<f64>,
    settings: &'r Settings,
    params: &'r OptimizerParams,
    volumes: Vec<f64>,
    weights: WeightMatrix,
    mma: MmaState,
    densities: Vec<f64>,
    equilibrium: Option<Equilibrium>,
    raw: Vec<f64>,
    filtered: Vec<f64>,
    change: f64,
    iteration: usize,
    history: Vec<IterationRecord>,
}

impl<'r, 'm> Run<'r, 'm> {
    fn equilibrium(&self) -> Result<&Equilibrium, TopOptError> {
        self.equilibrium
            .as_ref()
            .ok_or_else(|| TopOptError::Solver("No equilibrium has been solved yet".to_owned()))
    }

    fn step(&mut self, phase: Phase) -> Result<Phase, TopOptError> {
        let next = match phase {
            Phase::Initialize => {
                self.densities = vec![self.settings.volume_fraction; self.volumes.len()];
                self.equilibrium = None;
                self.iteration = 0;
                self.history.clear();
                Phase::Solve
            }
            Phase::Solve => {
                self.iteration += 1;
                let warm_start = self.equilibrium.as_ref().map(|eq| &eq.displacement);
                let equilibrium = self.model.solve(
                    &self.densities,
                    self.settings.penalty,
                    self.loads,
                    warm_start,
                )?;
                if self.settings.debug && self.iteration == 1 {
                    sensitivity::verify(
                        self.model,
                        &self.densities,
                        self.settings.penalty,
                        self.loads,
                        &equilibrium,
                    )?;
                }
                self.equilibrium = Some(equilibrium);
                Phase::Sensitize
            }
            Phase::Sensitize => {
                self.raw = sensitivity::from_equilibrium(
                    &self.densities,
                    self.equilibrium()?,
                    &self.model.mesh().edof,
                )?;
                Phase::Filter
            }
            Phase::Filter => {
                let x_min = match self.settings.method {
                    Method::OptimalityCriteria => self.params.oc.x_min,
                    Method::MovingAsymptotes => self.params.mma.x_min,
                };
                self.filtered = filter::filter(&self.densities, &self.raw, &self.weights, x_min)?;
                Phase::Update
            }
            Phase::Update => {
                let updated = match self.settings.method {
                    Method::OptimalityCriteria => optimizer::update(
                        &self.densities,
                        self.settings.volume_fraction,
                        &self.filtered,
                        &self.volumes,
                        &self.params.oc,
                    )?,
                    Method::MovingAsymptotes => self.mma.update(
                        &self.densities,
                        self.settings.volume_fraction,
                        &self.filtered,
                        &self.volumes,
                        &self.params.mma,
                    )?,
                };
                self.change = self
                    .densities
                    .iter()
                    .zip(&updated)
                    .fold(0.0_f64, |m, (old, new)| m.max((new - old).abs()));

                let equilibrium = self.equilibrium()?;
                let record = IterationRecord {
                    iteration: self.iteration,
                    compliance: equilibrium.compliance,
                    volume_fraction: volume_fraction(&self.densities, &self.volumes),
                    change: self.change,
                    newton_iterations: equilibrium.iterations,
                    residual_norm: equilibrium.residual_norm,
                };
                self.history.push(record);
                self.densities = updated;
                Phase::CheckConvergence
            }
            Phase::CheckConvergence => {
                if let Some(record) = self.history.last() {
                    info!(
                        "it. {:>4}  compliance {:.6e}  vol. {:.4}  change {:.4}  newton {}",
                        record.iteration,
                        record.compliance,
                        record.volume_fraction,
                        record.change,
                        record.newton_iterations
                    );
                }
                if self.change <= self.settings.change_limit {
                    Phase::Terminate(Termination::Converged)
                } else if self.iteration >= self.settings.max_iterations {
                    Phase::Terminate(Termination::IterationCap)
                } else {
                    Phase::Solve
                }
            }
            Phase::Terminate(reason) => Phase::Terminate(reason),
        };
        debug!("{phase:?} -> {next:?}");
        Ok(next)
    }
}

/// Runs the SIMP compliance minimization.
///
/// The design starts uniform at the target volume fraction and cycles through
/// equilibrium, sensitivity, filtering and update until the largest density
/// change falls to the change limit or the iteration cap is hit. Reaching the
/// cap is a normal termination.
///
/// # Arguments
/// * `model` - The finite element model of the design domain
/// * `loads` - The global load vector
/// * `settings` - The run settings
/// * `params` - Optimizer tunables
///
/// # Returns
/// The final design, its history and the termination reason
pub fn optimize(
    model: &FeModel,
    loads: &DVector<f64>,
    settings: &Settings,
    params: &OptimizerParams,
) -> Result<OptimizationResult, TopOptError> {
    settings.validate()?;

    if settings.method == Method::MovingAsymptotes
        && !(model.params().linear && model.material().is_linear())
    {
        return Err(TopOptError::NotImplemented(format!(
            "MMA with the nonlinear '{}' material response",
            model.material().name()
        )));
    }

    let mesh = model.mesh();
    info!(
        "optimizing {} elements for volume fraction {} with {:?}",
        mesh.num_elements(),
        settings.volume_fraction,
        settings.method
    );

    let mut run = Run {
        model,
        loads,
        settings,
        params,
        volumes: mesh.element_areas(),
        weights: WeightMatrix::new(&mesh.centroids(), settings.filter_radius)?,
        mma: MmaState::new(),
        densities: Vec::new(),
        equilibrium: None,
        raw: Vec::new(),
        filtered: Vec::new(),
        change: f64::INFINITY,
        iteration: 0,
        history: Vec::new(),
    };

    let mut phase = Phase::Initialize;
    let termination = loop {
        phase = run.step(phase)?;
        if let Phase::Terminate(reason) = phase {
            break reason;
        }
    };

    match termination {
        Termination::Converged => info!("converged after {} iterations", run.iteration),
        Termination::IterationCap => info!(
            "stopped at the iteration cap of {} with change {:.4}",
            settings.max_iterations, run.change
        ),
    }

    let displacement = run.equilibrium()?.displacement.clone();
    Ok(OptimizationResult {
        densities: run.densities,
        displacement,
        history: run.history,
        termination,
    })
}

/// Meshes the domain of a problem definition and optimizes it
///
/// # Arguments
/// * `problem` - The loaded problem definition
///
/// # Returns
/// The mesh and the optimization result on it
pub fn run(problem: &ProblemDefinition) -> Result<(Mesh, OptimizationResult), TopOptError> {
    let mesh = mesher::run(
        &problem.geometry,
        problem.settings.mesh_size,
        problem.element_kind,
    )?;
    let fixed = mesh.marker_dofs(&problem.supports)?;
    let loads = solver::load_vector(&mesh, &problem.force)?;

    let result = {
        let model = FeModel::new(
            &mesh,
            problem.element_params,
            &problem.material,
            problem.material_params,
            &fixed,
            problem.newton,
        )?
        .with_body_load(problem.body_load);
        optimize(&model, &loads, &problem.settings, &problem.optimizer)?
    };

    Ok((mesh, result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        datatypes::{ElementKind, ElementParams, ForceSpec, MaterialParams, Mesh, Vertex},
        material::MaterialModel,
        mesher::{self, EdgeMarkers, PointMarker, Rectangle},
        solver::{load_vector, NewtonConfig},
    };

    fn beam() -> Mesh {
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
        mesher::run(&rectangle, 0.2, ElementKind::Quad4).unwrap()
    }

    fn settings() -> Settings {
        Settings {
            volume_fraction: 0.4,
            mesh_size: 0.2,
            filter_radius: 0.3,
            change_limit: 0.01,
            penalty: 3.0,
            method: Method::OptimalityCriteria,
            debug: false,
            max_iterations: 100,
        }
    }

    fn loads(mesh: &Mesh) -> DVector<f64> {
        load_vector(
            mesh,
            &ForceSpec {
                magnitude: -4e5,
                markers: vec![9],
                direction: 2,
            },
        )
        .unwrap()
    }

    #[test]
    fn iteration_cap_is_a_normal_stop() {
        let mesh = beam();
        let material = MaterialModel::Elastic;
        let fixed = mesh.marker_dofs(&[4]).unwrap();
        let model = FeModel::new(
            &mesh,
            ElementParams::default(),
            &material,
            MaterialParams::new(210e9, 0.3, 0.0),
            &fixed,
            NewtonConfig::default(),
        )
        .unwrap();

        let capped = Settings {
            max_iterations: 3,
            change_limit: 0.0,
            ..settings()
        };
        let result = optimize(&model, &loads(&mesh), &capped, &OptimizerParams::default()).unwrap();
        assert_eq!(result.termination, Termination::IterationCap);
        assert_eq!(result.history.len(), 3);
        assert_eq!(result.history[0].iteration, 1);
        assert!((result.history[0].volume_fraction - 0.4).abs() < 1e-12);
    }

    #[test]
    fn mma_drives_the_same_loop() {
        let mesh = beam();
        let material = MaterialModel::Elastic;
        let fixed = mesh.marker_dofs(&[4]).unwrap();
        let model = FeModel::new(
            &mesh,
            ElementParams::default(),
            &material,
            MaterialParams::new(210e9, 0.3, 0.0),
            &fixed,
            NewtonConfig::default(),
        )
        .unwrap();

        let mma = Settings {
            method: Method::MovingAsymptotes,
            max_iterations: 5,
            ..settings()
        };
        let result = optimize(&model, &loads(&mesh), &mma, &OptimizerParams::default()).unwrap();
        assert!(!result.history.is_empty());
        for x in &result.densities {
            assert!(*x >= 1e-3 && *x <= 1.0);
        }
    }

    #[test]
    fn mma_rejects_nonlinear_material() {
        let mesh = beam();
        let material = MaterialModel::Bilinear;
        let fixed = mesh.marker_dofs(&[4]).unwrap();
        let params = ElementParams {
            linear: false,
            ..Default::default()
        };
        let model = FeModel::new(
            &mesh,
            params,
            &material,
            MaterialParams::new(210e9, 0.3, 1e-3),
            &fixed,
            NewtonConfig::default(),
        )
        .unwrap();

        let mma = Settings {
            method: Method::MovingAsymptotes,
            ..settings()
        };
        let result = optimize(&model, &loads(&mesh), &mma, &OptimizerParams::default());
        assert!(matches!(result, Err(TopOptError::NotImplemented(_))));
    }

    #[test]
    fn settings_are_validated() {
        assert!(settings().validate().is_ok());
        for bad in [
            Settings { volume_fraction: 1.0, ..settings() },
            Settings { filter_radius: 0.0, ..settings() },
            Settings { penalty: 0.5, ..settings() },
            Settings { max_iterations: 0, ..settings() },
        ] {
            assert!(matches!(bad.validate(), Err(TopOptError::Config(_))));
        }
    }

    #[test]
    fn area_weighted_volume() {
        assert!((volume_fraction(&[1.0, 0.0], &[3.0, 1.0]) - 0.75).abs() < 1e-12);
    }
}
