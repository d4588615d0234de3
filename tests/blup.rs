mod common;

use approx::assert_relative_eq;
use common::{banded_descriptor, init_logging};
use ldgm::blup::{BlupBlock, BlupError, BlupParams, BlupRow, compute_blup};
use ldgm::parallel::{PoolConfig, PoolError};
use ldgm::{BlockDescriptor, PrecisionOperator};
use ndarray::{Array1, Array2, Axis};
use ndarray_linalg::{Inverse, Solve};

const PARAMS: BlupParams = BlupParams {
    sigmasq: 0.1,
    sample_size: 1000.0,
};

/// `√n σ² (S + nσ² I)⁻¹ S z`, with `S` the dense marginal precision of `rows`.
fn dense_blup(descriptor: &BlockDescriptor, rows: &[usize], z: &[f64]) -> Array1<f64> {
    let full = PrecisionOperator::from_descriptor(descriptor).unwrap().to_dense();
    let marginal: Array2<f64> = full
        .inv()
        .unwrap()
        .select(Axis(0), rows)
        .select(Axis(1), rows)
        .inv()
        .unwrap();
    let z = Array1::from(z.to_vec());
    let ridge = PARAMS.sample_size * PARAMS.sigmasq;
    let shifted = &marginal + &(Array2::<f64>::eye(rows.len()) * ridge);
    let solved = shifted.solve(&marginal.dot(&z)).unwrap();
    solved * (PARAMS.sample_size.sqrt() * PARAMS.sigmasq)
}

fn matched_block(first_input_row: usize, z: &[f64]) -> BlupBlock {
    BlupBlock {
        rows: z
            .iter()
            .enumerate()
            .map(|(offset, &z)| BlupRow {
                input_row: first_input_row + offset,
                z,
                matrix_row: Some(offset),
            })
            .collect(),
    }
}

#[test]
fn two_blocks_are_solved_independently() {
    init_logging();
    let descriptors = vec![banded_descriptor("b1", 3, 5), banded_descriptor("b2", 2, 6)];
    let z1 = [1.5, -0.7, 2.2];
    let z2 = [0.3, -1.1];
    let inputs = vec![matched_block(0, &z1), matched_block(3, &z2)];

    let beta = compute_blup(&descriptors, &inputs, 5, PARAMS, PoolConfig::serial()).unwrap();
    assert_eq!(beta.len(), 5);
    let expected_first = dense_blup(&descriptors[0], &[0, 1, 2], &z1);
    let expected_second = dense_blup(&descriptors[1], &[0, 1], &z2);
    for i in 0..3 {
        assert_relative_eq!(beta[i], expected_first[i], max_relative = 1e-10);
    }
    for i in 0..2 {
        assert_relative_eq!(beta[3 + i], expected_second[i], max_relative = 1e-10);
    }

    for workers in [1, 2, 4] {
        let parallel =
            compute_blup(&descriptors, &inputs, 5, PARAMS, PoolConfig::with_workers(workers)).unwrap();
        assert_eq!(parallel, beta);
    }

    // Changing block 2's input leaves block 1's output untouched.
    let altered = vec![matched_block(0, &z1), matched_block(3, &[9.0, 9.0])];
    let beta_altered =
        compute_blup(&descriptors, &altered, 5, PARAMS, PoolConfig::with_workers(2)).unwrap();
    assert_eq!(beta_altered.slice(ndarray::s![..3]), beta.slice(ndarray::s![..3]));
    assert_ne!(beta_altered[3], beta[3]);
}

#[test]
fn unmatched_and_duplicate_rows_get_zero_and_unassigned_inputs_stay_zero() {
    let descriptors = vec![banded_descriptor("b1", 6, 8)];
    let rows = vec![
        BlupRow { input_row: 6, z: 0.8, matrix_row: Some(4) },
        BlupRow { input_row: 0, z: -1.2, matrix_row: None },
        BlupRow { input_row: 2, z: 0.5, matrix_row: Some(1) },
        BlupRow { input_row: 3, z: 3.0, matrix_row: Some(4) },
        BlupRow { input_row: 5, z: 1.1, matrix_row: Some(2) },
    ];
    let inputs = vec![BlupBlock { rows }];

    let beta = compute_blup(&descriptors, &inputs, 8, PARAMS, PoolConfig::with_workers(2)).unwrap();
    let expected = dense_blup(&descriptors[0], &[4, 1, 2], &[0.8, 0.5, 1.1]);

    assert_relative_eq!(beta[6], expected[0], max_relative = 1e-10);
    assert_relative_eq!(beta[2], expected[1], max_relative = 1e-10);
    assert_relative_eq!(beta[5], expected[2], max_relative = 1e-10);
    for row in [0, 1, 3, 4, 7] {
        assert_eq!(beta[row], 0.0, "row {row} should be zero");
    }
}

#[test]
fn invalid_inputs_are_rejected_before_running() {
    let descriptors = vec![banded_descriptor("b1", 2, 1)];
    let inputs = vec![matched_block(0, &[1.0, 2.0])];

    let bad = BlupParams {
        sigmasq: -1.0,
        ..PARAMS
    };
    assert!(matches!(
        compute_blup(&descriptors, &inputs, 2, bad, PoolConfig::serial()),
        Err(BlupError::InvalidParameter(_))
    ));
    assert!(matches!(
        compute_blup(&descriptors, &inputs, 1, PARAMS, PoolConfig::serial()),
        Err(BlupError::Pool(PoolError::InvalidInputRow { row: 1, input_len: 1 }))
    ));
    assert!(matches!(
        compute_blup(&[], &inputs, 2, PARAMS, PoolConfig::serial()),
        Err(BlupError::Pool(PoolError::BlockCountMismatch { .. }))
    ));
}

#[test]
fn out_of_range_matrix_rows_fail_the_block() {
    let descriptors = vec![banded_descriptor("b1", 2, 1)];
    let inputs = vec![BlupBlock {
        rows: vec![BlupRow { input_row: 0, z: 1.0, matrix_row: Some(7) }],
    }];
    match compute_blup(&descriptors, &inputs, 1, PARAMS, PoolConfig::serial()) {
        Err(BlupError::Pool(PoolError::WorkerFailure { failures, .. })) => {
            assert!(failures[0].message.contains("matched row 7"));
        }
        other => panic!("expected a worker failure, got {other:?}"),
    }
}
