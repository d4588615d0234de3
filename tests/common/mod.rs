// Fixtures shared by the integration tests.

use ldgm::{BlockDescriptor, Edge, PrecisionOperator, VariantRecord, VariantTable};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Uniform};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn records(prefix: &str, n: usize) -> Vec<VariantRecord> {
    (0..n)
        .map(|row| VariantRecord {
            site_id: format!("{prefix}_rs{row}"),
            chromosome: 1,
            position: 1_000 + 10 * row as u64,
            ref_allele: "A".to_string(),
            alt_allele: "G".to_string(),
        })
        .collect()
}

/// Edges of a random banded, strictly diagonally dominant (hence positive definite)
/// precision matrix.
pub fn banded_edges(n: usize, bandwidth: usize, seed: u64) -> Vec<Edge> {
    let mut rng = StdRng::seed_from_u64(seed);
    let coupling = Uniform::new(-0.3, 0.3);
    let mut row_sums = vec![0.0f64; n];
    let mut edges = Vec::new();
    for row in 0..n {
        for col in row + 1..(row + 1 + bandwidth).min(n) {
            let value: f64 = coupling.sample(&mut rng);
            row_sums[row] += value.abs();
            row_sums[col] += value.abs();
            edges.push(Edge { row, col, value });
        }
    }
    for (row, sum) in row_sums.iter().enumerate() {
        edges.push(Edge {
            row,
            col: row,
            value: 1.0 + sum,
        });
    }
    edges
}

pub fn banded_descriptor(id: &str, n: usize, seed: u64) -> BlockDescriptor {
    BlockDescriptor {
        id: id.to_string(),
        region: None,
        dimension: n,
        edges: banded_edges(n, 3, seed),
        variants: records(id, n),
        columns: Vec::new(),
    }
}

pub fn banded_operator(n: usize, seed: u64) -> PrecisionOperator {
    PrecisionOperator::from_descriptor(&banded_descriptor("block", n, seed)).unwrap()
}

/// The 2x2 matrix `[[2, -1], [-1, 2]]` scaled by `scale`.
pub fn two_by_two(scale: f64) -> PrecisionOperator {
    let edges = vec![(0, 0, 2.0 * scale), (1, 1, 2.0 * scale), (0, 1, -scale)];
    PrecisionOperator::from_edges(2, edges, VariantTable::new(records("pair", 2))).unwrap()
}
