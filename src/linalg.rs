use argmin::{
    core::{
        observers::{Observe, ObserverMode},
        Error, Executor, Operator, State, KV,
    },
    solver::conjugategradient::ConjugateGradient,
};
use log::debug;
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::{factorization::CscCholesky, CooMatrix, CscMatrix};

use crate::error::TopOptError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LinearSolver {
    /// Sparse Cholesky factorization
    Cholesky,
    /// Conjugate gradient with a relative residual tolerance
    ConjugateGradient { max_iters: u64, tolerance: f64 },
}

impl Default for LinearSolver {
    fn default() -> Self {
        LinearSolver::Cholesky
    }
}

impl LinearSolver {
    pub fn from_name(name: &str) -> Result<LinearSolver, TopOptError> {
        match name.trim().to_lowercase().as_str() {
            "cholesky" => Ok(LinearSolver::Cholesky),
            "cg" | "conjugate_gradient" => Ok(LinearSolver::ConjugateGradient {
                max_iters: 100_000,
                tolerance: 1e-10,
            }),
            _ => Err(TopOptError::Config(format!("Unknown linear solver '{name}'"))),
        }
    }

    /// Prepares a symmetric positive definite matrix for repeated solves
    pub fn factor<'a>(&self, a: &'a CscMatrix<f64>) -> Result<FactoredSystem<'a>, TopOptError> {
        match *self {
            LinearSolver::Cholesky => match CscCholesky::factor(a) {
                Ok(factor) => Ok(FactoredSystem::Cholesky(factor)),
                Err(err) => Err(TopOptError::Solver(format!(
                    "Cholesky factorization failed: {err:?}"
                ))),
            },
            LinearSolver::ConjugateGradient {
                max_iters,
                tolerance,
            } => Ok(FactoredSystem::Iterative {
                a,
                max_iters,
                tolerance,
            }),
        }
    }
}

pub enum FactoredSystem<'a> {
    Cholesky(CscCholesky<f64>),
    Iterative {
        a: &'a CscMatrix<f64>,
        max_iters: u64,
        tolerance: f64,
    },
}

impl<'a> FactoredSystem<'a> {
    /// Returns `x` in `Ax=b`
    pub fn solve(&self, b: &DVector<f64>) -> Result<DVector<f64>, TopOptError> {
        match self {
            FactoredSystem::Cholesky(factor) => {
                let rhs = DMatrix::from_column_slice(b.nrows(), 1, b.as_slice());
                let x = factor.solve(&rhs);
                Ok(DVector::from_column_slice(x.as_slice()))
            }
            FactoredSystem::Iterative {
                a,
                max_iters,
                tolerance,
            } => run_conjugate_gradient(a, b, *max_iters, *tolerance),
        }
    }
}

/// Builds a compressed matrix from triplets; duplicate entries are summed
pub fn assemble(n: usize, triplets: &[(usize, usize, f64)]) -> CscMatrix<f64> {
    let mut coo = CooMatrix::new(n, n);
    for (row, col, value) in triplets {
        coo.push(*row, *col, *value);
    }
    CscMatrix::from(&coo)
}

/// Runs multiplication for Conjugate Gradient Solver
struct ConjugateGradientOperator<'a> {
    a: &'a CscMatrix<f64>,
}

impl<'a> Operator for ConjugateGradientOperator<'a> {
    type Param = Vec<f64>;
    type Output = Vec<f64>;

    fn apply(&self, x: &Self::Param) -> Result<Self::Output, Error> {
        Ok((self.a * &DVector::from_vec(x.clone())).as_slice().to_vec())
    }
}

/// Logs the residual of the argmin solver
struct ConjugateGradientLogger;

impl<I> Observe<I> for ConjugateGradientLogger
where
    I: State<Float = f64>,
{
    fn observe_iter(&mut self, state: &I, _kv: &KV) -> Result<(), Error> {
        debug!(
            "conjugate gradient iteration {}: squared residual {:e}",
            state.get_iter(),
            state.get_cost()
        );
        Ok(())
    }
}

/// Solves a system of equations using the conjugate gradient method.
///
/// # Arguments
/// * `a` - A sparse square positive definite matrix
/// * `b` - The right hand side
/// * `max_iters` - The iteration cap
/// * `tolerance` - Target residual relative to the norm of `b`
///
/// # Returns
/// A DVector that represents `x` from the system
fn run_conjugate_gradient(
    a: &CscMatrix<f64>,
    b: &DVector<f64>,
    max_iters: u64,
    tolerance: f64,
) -> Result<DVector<f64>, TopOptError> {
    let b_norm = b.norm();
    if b_norm == 0.0 {
        return Ok(DVector::zeros(b.nrows()));
    }

    let b_flat: Vec<f64> = b.iter().copied().collect();
    let solver: ConjugateGradient<_, f64> = ConjugateGradient::new(b_flat);
    let initial_guess: Vec<f64> = vec![0.0; b.nrows()];
    let operator = ConjugateGradientOperator { a };

    let res = match Executor::new(operator, solver)
        .configure(|state| {
            state
                .param(initial_guess)
                .max_iters(max_iters)
                .target_cost((tolerance * b_norm).powi(2))
        })
        .add_observer(ConjugateGradientLogger, ObserverMode::Every(100))
        .run()
    {
        Ok(r) => r,
        Err(err) => {
            return Err(TopOptError::Solver(format!(
                "Conjugate Gradient error: {err}"
            )))
        }
    };

    let x = match res.state().get_param() {
        Some(vec) => DVector::from_vec(vec.clone()),
        None => {
            return Err(TopOptError::Solver(
                "Conjugate Gradient could not produce a parameter".to_owned(),
            ))
        }
    };

    let residual = (b - a * &x).norm() / b_norm;
    if residual > 100.0 * tolerance {
        return Err(TopOptError::NonConvergence {
            stage: "conjugate gradient",
            iterations: res.state().get_iter() as usize,
            residual,
        });
    }

    Ok(x)
}
