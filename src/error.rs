use std::fmt::Display;

#[derive(Debug, Clone, PartialEq)]
pub enum TopOptError {
    Input(String),
    Config(String),
    UnsupportedAnalysis(String),
    DegenerateElement {
        element: Option<usize>,
        det_j: f64,
    },
    NonConvergence {
        stage: &'static str,
        iterations: usize,
        residual: f64,
    },
    NotImplemented(String),
    Solver(String),
    PostProcessor(String),
}

impl TopOptError {
    /// Attaches the element index to errors raised inside an element routine
    pub fn at_element(self, index: usize) -> TopOptError {
        match self {
            TopOptError::DegenerateElement { element: None, det_j } => {
                TopOptError::DegenerateElement {
                    element: Some(index),
                    det_j,
                }
            }
            other => other,
        }
    }
}

impl Display for TopOptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopOptError::Input(v) => write!(f, "Input error: {}", v),
            TopOptError::Config(v) => write!(f, "Configuration error: {}", v),
            TopOptError::UnsupportedAnalysis(v) => {
                write!(f, "Configuration error: unsupported analysis type ({})", v)
            }
            TopOptError::DegenerateElement { element, det_j } => match element {
                Some(e) => write!(
                    f,
                    "Element error: degenerate element {} (Jacobian determinant {:e})",
                    e, det_j
                ),
                None => write!(
                    f,
                    "Element error: degenerate element (Jacobian determinant {:e})",
                    det_j
                ),
            },
            TopOptError::NonConvergence {
                stage,
                iterations,
                residual,
            } => write!(
                f,
                "Nonconvergence: {} did not converge after {} iterations (residual {:e})",
                stage, iterations, residual
            ),
            TopOptError::NotImplemented(v) => write!(f, "Not implemented: {}", v),
            TopOptError::Solver(v) => write!(f, "Solver error: {}", v),
            TopOptError::PostProcessor(v) => write!(f, "Post Processor error: {}", v),
        }
    }
}

impl std::error::Error for TopOptError {}
