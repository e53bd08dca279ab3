use indicatif::ProgressBar;
use log::info;
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use rayon::prelude::*;

use crate::{datatypes::Vertex, error::TopOptError};

/// Distance weights between element centroids, constant for a run
#[derive(Debug, Clone)]
pub struct WeightMatrix {
    weights: CsrMatrix<f64>,
    row_sums: Vec<f64>,
}

impl WeightMatrix {
    /// Builds `w(i, j) = max(r_min - dist(i, j), 0)` from element centroids
    ///
    /// # Arguments
    /// * `centroids` - One centroid per element
    /// * `r_min` - The filter radius
    pub fn new(centroids: &[Vertex], r_min: f64) -> Result<WeightMatrix, TopOptError> {
        if !(r_min > 0.0) {
            return Err(TopOptError::Config(format!(
                "Filter radius must be positive, got {r_min}"
            )));
        }

        let n = centroids.len();
        info!("building filter weights for {n} elements with radius {r_min}...");
        let bar = ProgressBar::new(n as u64);

        let rows: Vec<Vec<(usize, f64)>> = centroids
            .par_iter()
            .map(|ci| {
                let row = centroids
                    .iter()
                    .enumerate()
                    .filter_map(|(j, cj)| {
                        let weight = r_min - ci.distance(cj);
                        if weight > 0.0 {
                            Some((j, weight))
                        } else {
                            None
                        }
                    })
                    .collect();
                bar.inc(1);
                row
            })
            .collect();
        bar.finish_and_clear();

        let mut coo = CooMatrix::new(n, n);
        let mut row_sums = vec![0.0; n];
        for (i, row) in rows.into_iter().enumerate() {
            for (j, weight) in row {
                coo.push(i, j, weight);
                row_sums[i] += weight;
            }
        }

        Ok(WeightMatrix {
            weights: CsrMatrix::from(&coo),
            row_sums,
        })
    }

    fn len(&self) -> usize {
        self.row_sums.len()
    }

    /// Column indices and weights of row `i`
    fn row(&self, i: usize) -> (&[usize], &[f64]) {
        let (offsets, cols, values) = self.weights.csr_data();
        let range = offsets[i]..offsets[i + 1];
        (&cols[range.clone()], &values[range])
    }
}

/// Applies the density weighted sensitivity filter
///
/// # Arguments
/// * `densities` - The current design field
/// * `raw` - The raw sensitivities
/// * `weights` - The precomputed weight matrix
/// * `x_min` - Lower bound on the density in the denominator, the run's minimum density
///
/// # Returns
/// The filtered sensitivities
pub fn filter(
    densities: &[f64],
    raw: &[f64],
    weights: &WeightMatrix,
    x_min: f64,
) -> Result<Vec<f64>, TopOptError> {
    if !(x_min > 0.0) {
        return Err(TopOptError::Config(format!(
            "Filter density floor must be positive, got {x_min}"
        )));
    }
    if densities.len() != weights.len() || raw.len() != weights.len() {
        return Err(TopOptError::Config(format!(
            "Filter expects {} values, got {} densities and {} sensitivities",
            weights.len(),
            densities.len(),
            raw.len()
        )));
    }

    Ok((0..weights.len())
        .into_par_iter()
        .map(|e| {
            let (cols, values) = weights.row(e);
            let numerator: f64 = cols
                .iter()
                .zip(values)
                .map(|(j, w)| w * densities[*j] * raw[*j])
                .sum();
            let denominator = f64::max(densities[e], x_min) * weights.row_sums[e];
            if denominator > 0.0 {
                numerator / denominator
            } else {
                raw[e]
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weight(weights: &WeightMatrix, i: usize, j: usize) -> f64 {
        let (cols, values) = weights.row(i);
        cols.iter()
            .position(|c| *c == j)
            .map(|k| values[k])
            .unwrap_or(0.0)
    }

    fn grid(nx: usize, ny: usize) -> Vec<Vertex> {
        let mut centroids = Vec::new();
        for j in 0..ny {
            for i in 0..nx {
                centroids.push(Vertex {
                    x: i as f64 + 0.5,
                    y: j as f64 + 0.5,
                });
            }
        }
        centroids
    }

    #[test]
    fn weights_are_symmetric_and_local() {
        let weights = WeightMatrix::new(&grid(6, 4), 1.5).unwrap();
        for i in 0..weights.len() {
            assert!((weight(&weights, i, i) - 1.5).abs() < 1e-12);
            for j in 0..weights.len() {
                assert_eq!(weight(&weights, i, j), weight(&weights, j, i));
            }
        }
        // direct neighbour at distance 1, diagonal at sqrt(2), next at 2
        assert!((weight(&weights, 0, 1) - 0.5).abs() < 1e-12);
        assert!(weight(&weights, 0, 7) > 0.0);
        assert_eq!(weight(&weights, 0, 2), 0.0);
    }

    #[test]
    fn filtered_values_stay_within_neighbourhood_range() {
        let centroids = grid(8, 5);
        let weights = WeightMatrix::new(&centroids, 2.2).unwrap();
        let raw: Vec<f64> = (0..centroids.len())
            .map(|i| -1.0 - ((i * 37) % 11) as f64)
            .collect();
        let densities = vec![0.4; centroids.len()];
        let filtered = filter(&densities, &raw, &weights, 1e-3).unwrap();

        for e in 0..centroids.len() {
            let (neighbours, _) = weights.row(e);
            let min = neighbours.iter().map(|j| raw[*j]).fold(f64::MAX, f64::min);
            let max = neighbours.iter().map(|j| raw[*j]).fold(f64::MIN, f64::max);
            assert!(filtered[e] >= min - 1e-12 && filtered[e] <= max + 1e-12);
        }
    }

    #[test]
    fn tiny_radius_is_identity() {
        let centroids = grid(3, 3);
        let weights = WeightMatrix::new(&centroids, 0.5).unwrap();
        let raw = vec![-3.0, -1.0, -2.0, -5.0, -4.0, -6.0, -7.0, -8.0, -9.0];
        let densities = vec![0.7; 9];
        let filtered = filter(&densities, &raw, &weights, 1e-3).unwrap();
        for (f, r) in filtered.iter().zip(&raw) {
            assert!((f - r).abs() < 1e-12);
        }
    }

    #[test]
    fn void_densities_are_floored_at_x_min() {
        let centroids = grid(4, 3);
        let weights = WeightMatrix::new(&centroids, 1.2).unwrap();
        let raw: Vec<f64> = (0..centroids.len()).map(|i| -1.0 - i as f64).collect();
        let densities = vec![5e-4; centroids.len()];

        // a uniform field above the floor cancels out of the filter
        let filtered = filter(&densities, &raw, &weights, 1e-4).unwrap();
        for e in 0..centroids.len() {
            let (cols, values) = weights.row(e);
            let expected: f64 = cols.iter().zip(values).map(|(j, w)| w * raw[*j]).sum::<f64>()
                / values.iter().sum::<f64>();
            assert!((filtered[e] - expected).abs() < 1e-10);
        }

        // a floor above the field scales the result down
        let floored = filter(&densities, &raw, &weights, 1e-3).unwrap();
        for (f, g) in floored.iter().zip(&filtered) {
            assert!((f - 0.5 * g).abs() < 1e-10);
        }

        assert!(filter(&densities, &raw, &weights, 0.0).is_err());
    }

    #[test]
    fn radius_must_be_positive() {
        assert!(WeightMatrix::new(&grid(2, 2), 0.0).is_err());
    }
}
