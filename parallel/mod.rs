// ========================================================================================
//
//                        Block-parallel execution framework
//
// ========================================================================================
//
// A run takes a list of independent LD blocks, one block-local input per block and a
// partition of one shared output buffer. Workers claim blocks from an atomic cursor,
// load each block's operator themselves, and write results straight into their block's
// range of the buffer. A supervisor waits on completion events and worker liveness.

pub mod buffer;
pub mod config;
pub mod partition;
pub mod pool;

pub use buffer::{BlockOutput, SharedOutputBuffer};
pub use config::{Parallelism, PoolConfig};
pub use partition::{
    BlockPartition, InputAlignment, partition_rows_by_descriptor, partition_rows_by_region,
};
pub use pool::BlockWorkerPool;

use crate::operator::PrecisionOperator;
use crate::types::BlockDescriptor;
use std::fmt;
use std::ops::Range;
use thiserror::Error;

/// The phases a worker moves through for every block it claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    ClaimingTask,
    Loading,
    Computing,
    Writing,
    Terminated,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::ClaimingTask => "claiming a task",
            Self::Loading => "loading",
            Self::Computing => "computing",
            Self::Writing => "writing",
            Self::Terminated => "terminated",
        };
        f.write_str(label)
    }
}

/// One block that did not complete, and where it stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockFailure {
    pub block: usize,
    pub block_id: String,
    pub worker: usize,
    pub phase: WorkerState,
    pub message: String,
}

impl fmt::Display for BlockFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "block {} ('{}') failed on worker {} while {}: {}",
            self.block, self.block_id, self.worker, self.phase, self.message
        )
    }
}

fn describe_failures(failures: &[BlockFailure], missing_blocks: &[usize]) -> String {
    let mut lines: Vec<String> = failures.iter().map(ToString::to_string).collect();
    let unreported: Vec<String> = missing_blocks
        .iter()
        .filter(|block| !failures.iter().any(|failure| failure.block == **block))
        .map(ToString::to_string)
        .collect();
    if !unreported.is_empty() {
        lines.push(format!(
            "blocks never completed: {}",
            unreported.join(", ")
        ));
    }
    format!(
        "{} of the run's blocks did not complete:\n  {}",
        missing_blocks.len(),
        lines.join("\n  ")
    )
}

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("The partition covers {found} values but the output buffer holds {expected}.")]
    PartitionMismatch { expected: usize, found: usize },

    #[error("Output ranges of blocks {first} and {second} overlap.")]
    OverlappingRanges { first: usize, second: usize },

    #[error("Output range {range:?} does not fit in a buffer of {total_len} values.")]
    RangeOutOfBounds {
        range: Range<usize>,
        total_len: usize,
    },

    #[error("Output field '{0}' is declared more than once.")]
    DuplicateField(String),

    #[error("Unknown output field '{0}'.")]
    UnknownField(String),

    #[error("Block {0} does not exist in the partition.")]
    UnknownBlock(usize),

    #[error("Output range of block {0} was already claimed.")]
    BlockAlreadyClaimed(usize),

    #[error(
        "Got {descriptors} block descriptors, {inputs} block inputs and {ranges} output ranges; they must match."
    )]
    BlockCountMismatch {
        descriptors: usize,
        inputs: usize,
        ranges: usize,
    },

    #[error("Block {block} wrote {found} values to field '{field}', expected {expected}.")]
    FieldLength {
        field: String,
        block: usize,
        expected: usize,
        found: usize,
    },

    #[error("Block {block} ('{block_id}') has no genomic region to assign input rows to.")]
    MissingRegion { block: usize, block_id: String },

    #[error("Input row {row} is out of range or assigned twice (input length {input_len}).")]
    InvalidInputRow { row: usize, input_len: usize },

    #[error("{}", describe_failures(.failures, .missing_blocks))]
    WorkerFailure {
        failures: Vec<BlockFailure>,
        missing_blocks: Vec<usize>,
    },

    #[error("Failed to allocate the shared output buffer: {0}")]
    Allocation(#[source] std::io::Error),

    #[error("Failed to spawn a worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Invalid pool configuration: {0}")]
    Config(String),
}

/// Everything a worker knows about the block it is processing.
#[derive(Debug)]
pub struct BlockTask<'a, B> {
    pub index: usize,
    pub descriptor: &'a BlockDescriptor,
    pub data: &'a B,
    /// This block's range of the output buffer.
    pub range: Range<usize>,
}

impl<B> BlockTask<'_, B> {
    #[inline]
    pub fn offset(&self) -> usize {
        self.range.start
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.range.len()
    }
}

/// The per-block computation a pool runs.
///
/// Implementations must only depend on their arguments: the same block must produce
/// the same output regardless of which worker runs it, or in which order.
pub trait BlockProcessor: Sync {
    /// Block-local input records.
    type Block: Sync;
    /// Parameters shared read-only by every worker.
    type Params: Sync;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Names of the fields allocated in the output buffer.
    fn output_fields(&self) -> Vec<String>;

    fn process_block(
        &self,
        operator: &mut PrecisionOperator,
        task: &BlockTask<'_, Self::Block>,
        output: &mut BlockOutput<'_>,
        params: &Self::Params,
    ) -> Result<(), Self::Error>;
}

/// The validated inputs of one run.
#[derive(Debug)]
pub struct BlockJob<'a, B, P> {
    descriptors: &'a [BlockDescriptor],
    blocks: &'a [B],
    partition: BlockPartition,
    params: &'a P,
}

impl<'a, B, P> BlockJob<'a, B, P> {
    /// Pairs block `b`'s descriptor with `blocks[b]` and output range `b`. The partition
    /// must cover exactly `total_len` values.
    pub fn new(
        descriptors: &'a [BlockDescriptor],
        blocks: &'a [B],
        partition: BlockPartition,
        total_len: usize,
        params: &'a P,
    ) -> Result<Self, PoolError> {
        if descriptors.len() != blocks.len() || blocks.len() != partition.len() {
            return Err(PoolError::BlockCountMismatch {
                descriptors: descriptors.len(),
                inputs: blocks.len(),
                ranges: partition.len(),
            });
        }
        if partition.total_len() != total_len {
            return Err(PoolError::PartitionMismatch {
                expected: total_len,
                found: partition.total_len(),
            });
        }
        Ok(Self {
            descriptors,
            blocks,
            partition,
            params,
        })
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn partition(&self) -> &BlockPartition {
        &self.partition
    }

    fn task(&self, index: usize) -> Option<BlockTask<'a, B>> {
        Some(BlockTask {
            index,
            descriptor: self.descriptors.get(index)?,
            data: self.blocks.get(index)?,
            range: self.partition.range(index)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_counts_and_length_are_validated() {
        let descriptors: Vec<BlockDescriptor> = Vec::new();
        let blocks: Vec<()> = vec![()];
        let err = BlockJob::new(&descriptors, &blocks, BlockPartition::from_sizes(&[1]), 1, &())
            .unwrap_err();
        assert!(matches!(err, PoolError::BlockCountMismatch { descriptors: 0, inputs: 1, ranges: 1 }));

        let err = BlockJob::new(&descriptors, &[] as &[()], BlockPartition::from_sizes(&[]), 3, &())
            .unwrap_err();
        assert!(matches!(err, PoolError::PartitionMismatch { expected: 3, found: 0 }));
    }

    #[test]
    fn worker_failure_lists_failed_and_silent_blocks() {
        let err = PoolError::WorkerFailure {
            failures: vec![BlockFailure {
                block: 1,
                block_id: "chr1_b".to_string(),
                worker: 0,
                phase: WorkerState::Computing,
                message: "boom".to_string(),
            }],
            missing_blocks: vec![1, 3],
        };
        let text = err.to_string();
        assert!(text.starts_with("2 of the run's blocks"));
        assert!(text.contains("block 1 ('chr1_b') failed on worker 0 while computing: boom"));
        assert!(text.contains("blocks never completed: 3"));
    }
}
