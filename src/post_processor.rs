use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use log::info;

use crate::{
    datatypes::{Mesh, DOF},
    driver::OptimizationResult,
    error::TopOptError,
};

fn create(path: &Path) -> Result<BufWriter<File>, TopOptError> {
    match File::create(path) {
        Ok(f) => Ok(BufWriter::new(f)),
        Err(err) => Err(TopOptError::PostProcessor(format!(
            "Failed to create {}: {err}",
            path.display()
        ))),
    }
}

fn write_line(file: &mut BufWriter<File>, line: String, path: &Path) -> Result<(), TopOptError> {
    file.write_all(line.as_bytes()).map_err(|err| {
        TopOptError::PostProcessor(format!("Failed to write {}: {err}", path.display()))
    })
}

/// Writes the optimized design to three CSV files
///
/// # Arguments
/// * `mesh` - The mesh the design lives on
/// * `result` - The optimization result
/// * `output_dir` - The directory receiving nodes.csv, elements.csv and history.csv
pub fn csv_output(
    mesh: &Mesh,
    result: &OptimizationResult,
    output_dir: &Path,
) -> Result<(), TopOptError> {
    if let Err(err) = std::fs::create_dir_all(output_dir) {
        return Err(TopOptError::PostProcessor(format!(
            "Failed to create output directory {}: {err}",
            output_dir.display()
        )));
    }
    if result.densities.len() != mesh.num_elements() {
        return Err(TopOptError::PostProcessor(format!(
            "Result has {} densities for {} elements",
            result.densities.len(),
            mesh.num_elements()
        )));
    }

    // Write nodes
    let nodes_output = output_dir.join("nodes.csv");
    let mut nodes_file = create(&nodes_output)?;
    write_line(&mut nodes_file, "x,y,ux,uy\n".to_owned(), &nodes_output)?;
    for (n, vertex) in mesh.coords.iter().enumerate() {
        let ux = result.displacement.get(DOF * n).copied().unwrap_or(0.0);
        let uy = result.displacement.get(DOF * n + 1).copied().unwrap_or(0.0);
        write_line(
            &mut nodes_file,
            format!("{x},{y},{ux},{uy}\n", x = vertex.x, y = vertex.y),
            &nodes_output,
        )?;
    }

    // Write elements
    let elements_output = output_dir.join("elements.csv");
    let mut elements_file = create(&elements_output)?;
    let header: Vec<String> = (0..mesh.kind.nodes()).map(|i| format!("n{i}")).collect();
    write_line(
        &mut elements_file,
        format!("{},density\n", header.join(",")),
        &elements_output,
    )?;
    for (e, density) in result.densities.iter().enumerate() {
        let nodes: Vec<String> = mesh.element_nodes(e).iter().map(|n| n.to_string()).collect();
        write_line(
            &mut elements_file,
            format!("{},{density}\n", nodes.join(",")),
            &elements_output,
        )?;
    }

    // Write history
    let history_output = output_dir.join("history.csv");
    let mut history_file = create(&history_output)?;
    write_line(
        &mut history_file,
        "iteration,compliance,volume_fraction,change,newton_iterations,residual_norm\n".to_owned(),
        &history_output,
    )?;
    for record in &result.history {
        write_line(
            &mut history_file,
            format!(
                "{},{},{},{},{},{}\n",
                record.iteration,
                record.compliance,
                record.volume_fraction,
                record.change,
                record.newton_iterations,
                record.residual_norm
            ),
            &history_output,
        )?;
    }

    for file in [&mut nodes_file, &mut elements_file, &mut history_file] {
        if let Err(err) = file.flush() {
            return Err(TopOptError::PostProcessor(format!(
                "Failed to flush output: {err}"
            )));
        }
    }

    info!("wrote output to {}", output_dir.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        datatypes::ElementKind,
        driver::{IterationRecord, Termination},
        mesher::{self, EdgeMarkers, Rectangle},
    };
    use nalgebra::DVector;

    #[test]
    fn writes_three_tables() {
        let rectangle = Rectangle {
            width: 1.0,
            height: 1.0,
            edges: EdgeMarkers {
                left: Some(1),
                ..Default::default()
            },
            points: Vec::new(),
        };
        let mesh = mesher::run(&rectangle, 0.5, ElementKind::Quad4).unwrap();
        let result = OptimizationResult {
            densities: vec![0.25, 0.5, 0.75, 1.0],
            displacement: DVector::zeros(mesh.num_dofs),
            history: vec![IterationRecord {
                iteration: 1,
                compliance: 2.0,
                volume_fraction: 0.5,
                change: 0.2,
                newton_iterations: 1,
                residual_norm: 0.0,
            }],
            termination: Termination::Converged,
        };

        let dir = std::env::temp_dir().join(format!("simp-topopt-csv-{}", std::process::id()));
        csv_output(&mesh, &result, &dir).unwrap();

        let nodes = std::fs::read_to_string(dir.join("nodes.csv")).unwrap();
        assert_eq!(nodes.lines().count(), 1 + mesh.coords.len());
        let elements = std::fs::read_to_string(dir.join("elements.csv")).unwrap();
        assert_eq!(elements.lines().next(), Some("n0,n1,n2,n3,density"));
        assert!(elements.lines().nth(4).unwrap().ends_with(",1"));
        let history = std::fs::read_to_string(dir.join("history.csv")).unwrap();
        assert_eq!(history.lines().count(), 2);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
