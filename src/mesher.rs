use std::collections::BTreeMap;

use log::{info, warn};

use crate::{
    datatypes::{ElementKind, LegacyMesh, Mesh, Vertex, DOF},
    error::TopOptError,
};

/// Markers assigned to the four edges of a rectangle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EdgeMarkers {
    pub bottom: Option<u32>,
    pub right: Option<u32>,
    pub top: Option<u32>,
    pub left: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PointMarker {
    pub vertex: Vertex,
    pub marker: u32,
}

/// Axis-aligned rectangle with its lower left corner at the origin
#[derive(Debug, Clone, PartialEq)]
pub struct Rectangle {
    pub width: f64,
    pub height: f64,
    pub edges: EdgeMarkers,
    pub points: Vec<PointMarker>,
}

/// Legacy 1-based dof numbers of a node
fn node_dofs(node: usize) -> [usize; DOF] {
    [DOF * node + 1, DOF * node + 2]
}

fn push_marker(boundary_dofs: &mut BTreeMap<u32, Vec<usize>>, marker: u32, node: usize) {
    let dofs = boundary_dofs.entry(marker).or_default();
    for dof in node_dofs(node) {
        if !dofs.contains(&dof) {
            dofs.push(dof);
        }
    }
}

/// Meshes a rectangle with a structured grid in the mesh provider's format.
///
/// Quads are numbered counter-clockwise from their lower left node. Each
/// cell is split into two counter-clockwise triangles for `Tri3`.
///
/// # Arguments
/// * `rectangle` - The geometry with its markers
/// * `element_size` - The target element edge length
/// * `kind` - The element type to produce
///
/// # Returns
/// A LegacyMesh with 1-based dofs
pub fn mesh_rectangle(
    rectangle: &Rectangle,
    element_size: f64,
    kind: ElementKind,
) -> Result<LegacyMesh, TopOptError> {
    if !(rectangle.width > 0.0 && rectangle.height > 0.0) {
        return Err(TopOptError::Input(format!(
            "Rectangle must have positive extents, got {} x {}",
            rectangle.width, rectangle.height
        )));
    }
    if !(element_size > 0.0) {
        return Err(TopOptError::Config(format!(
            "Element size must be positive, got {element_size}"
        )));
    }

    let nx = f64::max((rectangle.width / element_size).round(), 1.0) as usize;
    let ny = f64::max((rectangle.height / element_size).round(), 1.0) as usize;
    let dx = rectangle.width / nx as f64;
    let dy = rectangle.height / ny as f64;
    let node = |i: usize, j: usize| j * (nx + 1) + i;

    let mut coords: Vec<Vertex> = Vec::with_capacity((nx + 1) * (ny + 1));
    for j in 0..=ny {
        for i in 0..=nx {
            coords.push(Vertex {
                x: i as f64 * dx,
                y: j as f64 * dy,
            });
        }
    }

    let mut edof: Vec<Vec<usize>> = Vec::new();
    for j in 0..ny {
        for i in 0..nx {
            let n0 = node(i, j);
            let n1 = node(i + 1, j);
            let n2 = node(i + 1, j + 1);
            let n3 = node(i, j + 1);

            let cells: Vec<Vec<usize>> = match kind {
                ElementKind::Tri3 => vec![vec![n0, n1, n2], vec![n0, n2, n3]],
                ElementKind::Quad4 => vec![vec![n0, n1, n2, n3]],
            };
            for cell in cells {
                edof.push(cell.into_iter().flat_map(node_dofs).collect());
            }
        }
    }

    let mut boundary_dofs: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
    let edges = &rectangle.edges;
    for i in 0..=nx {
        if let Some(m) = edges.bottom {
            push_marker(&mut boundary_dofs, m, node(i, 0));
        }
        if let Some(m) = edges.top {
            push_marker(&mut boundary_dofs, m, node(i, ny));
        }
    }
    for j in 0..=ny {
        if let Some(m) = edges.left {
            push_marker(&mut boundary_dofs, m, node(0, j));
        }
        if let Some(m) = edges.right {
            push_marker(&mut boundary_dofs, m, node(nx, j));
        }
    }

    // snap point markers to the closest node
    for point in &rectangle.points {
        let (closest, distance) = coords
            .iter()
            .enumerate()
            .map(|(n, v)| (n, v.distance(&point.vertex)))
            .fold((0, f64::MAX), |best, cur| if cur.1 < best.1 { cur } else { best });

        if distance > 0.5 * f64::max(dx, dy) {
            warn!(
                "point marker {} at ({}, {}) snapped {:.3e} away to node {}",
                point.marker, point.vertex.x, point.vertex.y, distance, closest
            );
        }
        push_marker(&mut boundary_dofs, point.marker, closest);
    }

    info!(
        "meshed {} x {} rectangle into {} nodes and {} elements",
        rectangle.width,
        rectangle.height,
        coords.len(),
        edof.len()
    );

    Ok(LegacyMesh {
        coords,
        edof,
        boundary_dofs,
    })
}

/// Runs the mesher and ingests its output
pub fn run(rectangle: &Rectangle, element_size: f64, kind: ElementKind) -> Result<Mesh, TopOptError> {
    Mesh::from_legacy(mesh_rectangle(rectangle, element_size, kind)?)
}
