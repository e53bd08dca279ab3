use std::collections::BTreeMap;

use crate::error::TopOptError;

pub const DOF: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vertex {
    pub x: f64,
    pub y: f64,
}

impl Vertex {
    pub fn distance(&self, other: &Vertex) -> f64 {
        f64::sqrt(f64::powi(self.x - other.x, 2) + f64::powi(self.y - other.y, 2))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Tri3,
    Quad4,
}

impl ElementKind {
    /// Resolves the element kind from the width of an element dof row
    pub fn from_dofs_per_element(width: usize) -> Result<ElementKind, TopOptError> {
        match width {
            6 => Ok(ElementKind::Tri3),
            8 => Ok(ElementKind::Quad4),
            _ => Err(TopOptError::Config(format!(
                "Unrecognized element shape with {width} dofs per element, check the edof table"
            ))),
        }
    }

    pub fn nodes(&self) -> usize {
        match self {
            ElementKind::Tri3 => 3,
            ElementKind::Quad4 => 4,
        }
    }

    pub fn dofs(&self) -> usize {
        self.nodes() * DOF
    }
}

/// Analysis type, numbered after the legacy `ptype` codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisType {
    PlaneStress,
    PlaneStrain,
    PlaneStrainSelectiveReduced,
}

impl AnalysisType {
    pub fn from_code(code: i64) -> Result<AnalysisType, TopOptError> {
        match code {
            1 => Ok(AnalysisType::PlaneStress),
            2 => Ok(AnalysisType::PlaneStrain),
            3 => Ok(AnalysisType::PlaneStrainSelectiveReduced),
            _ => Err(TopOptError::UnsupportedAnalysis(format!(
                "analysis type code {code}"
            ))),
        }
    }
}

/// Integration rule selector, numbered after the legacy `ir` codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrationRule {
    /// Single point at the element center
    OnePoint,
    /// 3 points on triangles, 2x2 on quads
    Full,
    HigherOrder,
}

impl IntegrationRule {
    pub fn from_code(code: i64) -> Result<IntegrationRule, TopOptError> {
        match code {
            1 => Ok(IntegrationRule::OnePoint),
            2 => Ok(IntegrationRule::Full),
            3 => Ok(IntegrationRule::HigherOrder),
            _ => Err(TopOptError::Config(format!(
                "Invalid integration rule {code}. Expected 1, 2 or 3"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElementParams {
    pub analysis: AnalysisType,
    pub thickness: f64,
    pub integration: IntegrationRule,
    /// Declares the material response linear
    pub linear: bool,
}

impl Default for ElementParams {
    fn default() -> Self {
        ElementParams {
            analysis: AnalysisType::PlaneStrain,
            thickness: 1.0,
            integration: IntegrationRule::Full,
            linear: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaterialParams {
    pub youngs_modulus: f64,
    pub poisson_ratio: f64,
    /// Yield strain of the bilinear model
    pub yield_strain: f64,
    /// Post-yield to elastic stiffness ratio of the bilinear model
    pub hardening_ratio: f64,
    /// Shear stiffening coefficient of the modified Hooke model
    pub stiffening: f64,
}

impl MaterialParams {
    pub fn new(youngs_modulus: f64, poisson_ratio: f64, yield_strain: f64) -> MaterialParams {
        MaterialParams {
            youngs_modulus,
            poisson_ratio,
            yield_strain,
            hardening_ratio: 0.1,
            stiffening: 0.0,
        }
    }

    pub fn validate(&self) -> Result<(), TopOptError> {
        if !(self.youngs_modulus > 0.0) {
            return Err(TopOptError::Config(format!(
                "Young's modulus must be positive, got {}",
                self.youngs_modulus
            )));
        }
        if !(self.poisson_ratio > -1.0 && self.poisson_ratio < 0.5) {
            return Err(TopOptError::Config(format!(
                "Poisson's ratio must lie in (-1, 0.5), got {}",
                self.poisson_ratio
            )));
        }
        if !(self.yield_strain >= 0.0) {
            return Err(TopOptError::Config(format!(
                "Yield strain must be non-negative, got {}",
                self.yield_strain
            )));
        }
        if !(self.hardening_ratio > 0.0 && self.hardening_ratio <= 1.0) {
            return Err(TopOptError::Config(format!(
                "Hardening ratio must lie in (0, 1], got {}",
                self.hardening_ratio
            )));
        }
        if !(self.stiffening >= 0.0) {
            return Err(TopOptError::Config(format!(
                "Stiffening coefficient must be non-negative, got {}",
                self.stiffening
            )));
        }
        Ok(())
    }

    pub fn shear_modulus(&self) -> f64 {
        self.youngs_modulus / (2.0 * (1.0 + self.poisson_ratio))
    }

    pub fn bulk_modulus(&self) -> f64 {
        self.youngs_modulus / (3.0 * (1.0 - 2.0 * self.poisson_ratio))
    }
}

/// Load of `magnitude` applied at the dofs of `markers` along `direction`
/// (0 both, 1 x, 2 y)
#[derive(Debug, Clone, PartialEq)]
pub struct ForceSpec {
    pub magnitude: f64,
    pub markers: Vec<u32>,
    pub direction: u8,
}

/// Mesh as produced by the mesh provider: dof numbers are 1-based
#[derive(Debug, Clone)]
pub struct LegacyMesh {
    pub coords: Vec<Vertex>,
    pub edof: Vec<Vec<usize>>,
    pub boundary_dofs: BTreeMap<u32, Vec<usize>>,
}

/// Immutable mesh with 0-based dof numbering
#[derive(Debug, Clone)]
pub struct Mesh {
    pub coords: Vec<Vertex>,
    pub kind: ElementKind,
    pub edof: Vec<Vec<usize>>,
    pub num_dofs: usize,
    pub boundary_dofs: BTreeMap<u32, Vec<usize>>,
}

impl Mesh {
    /// Ingests a mesh from the mesh provider.
    ///
    /// This is the only place where the provider's 1-based dof numbers are
    /// shifted to 0-based storage. Boundary dof groups receive the same shift.
    ///
    /// # Arguments
    /// * `legacy` - The mesh in the provider's numbering
    ///
    /// # Returns
    /// A Mesh whose dofs index directly into global vectors
    pub fn from_legacy(legacy: LegacyMesh) -> Result<Mesh, TopOptError> {
        let width = match legacy.edof.first() {
            Some(row) => row.len(),
            None => return Err(TopOptError::Input("Mesh has no elements".to_owned())),
        };
        let kind = ElementKind::from_dofs_per_element(width)?;
        let num_dofs = legacy.coords.len() * DOF;

        let shift = |dof: usize| -> Result<usize, TopOptError> {
            if dof == 0 || dof > num_dofs {
                return Err(TopOptError::Input(format!(
                    "Dof {dof} is outside the 1-based range 1..={num_dofs}"
                )));
            }
            Ok(dof - 1)
        };

        let mut edof: Vec<Vec<usize>> = Vec::with_capacity(legacy.edof.len());
        for (i, row) in legacy.edof.iter().enumerate() {
            if row.len() != width {
                return Err(TopOptError::Config(format!(
                    "Element {i} has {} dofs, expected {width}",
                    row.len()
                )));
            }
            edof.push(row.iter().map(|d| shift(*d)).collect::<Result<_, _>>()?);
        }

        let mut boundary_dofs = BTreeMap::new();
        for (marker, dofs) in legacy.boundary_dofs {
            let shifted: Vec<usize> = dofs.iter().map(|d| shift(*d)).collect::<Result<_, _>>()?;
            boundary_dofs.insert(marker, shifted);
        }

        Ok(Mesh {
            coords: legacy.coords,
            kind,
            edof,
            num_dofs,
            boundary_dofs,
        })
    }

    pub fn num_elements(&self) -> usize {
        self.edof.len()
    }

    /// Node indices of an element, recovered from its x-dofs
    pub fn element_nodes(&self, element: usize) -> Vec<usize> {
        self.edof[element].iter().step_by(DOF).map(|d| d / DOF).collect()
    }

    /// Nodal x and y coordinates of an element, in that order
    pub fn element_coords(&self, element: usize) -> (Vec<f64>, Vec<f64>) {
        self.element_nodes(element)
            .into_iter()
            .map(|n| (self.coords[n].x, self.coords[n].y))
            .unzip()
    }

    pub fn centroids(&self) -> Vec<Vertex> {
        (0..self.num_elements())
            .map(|e| {
                let (ex, ey) = self.element_coords(e);
                let n = ex.len() as f64;
                Vertex {
                    x: ex.iter().sum::<f64>() / n,
                    y: ey.iter().sum::<f64>() / n,
                }
            })
            .collect()
    }

    /// Calculates the area of every element with the shoelace formula
    pub fn element_areas(&self) -> Vec<f64> {
        (0..self.num_elements())
            .map(|e| {
                let (ex, ey) = self.element_coords(e);
                let n = ex.len();
                let twice_area: f64 = (0..n)
                    .map(|i| ex[i] * ey[(i + 1) % n] - ex[(i + 1) % n] * ey[i])
                    .sum();
                0.5 * twice_area.abs()
            })
            .collect()
    }

    /// Collects the dofs attached to a set of markers, sorted and unique
    pub fn marker_dofs(&self, markers: &[u32]) -> Result<Vec<usize>, TopOptError> {
        let mut dofs: Vec<usize> = Vec::new();
        for marker in markers {
            match self.boundary_dofs.get(marker) {
                Some(d) => dofs.extend_from_slice(d),
                None => {
                    return Err(TopOptError::Input(format!(
                        "Marker {marker} is not present in the mesh"
                    )))
                }
            }
        }
        dofs.sort_unstable();
        dofs.dedup();
        Ok(dofs)
    }
}
