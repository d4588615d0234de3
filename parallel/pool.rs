// ========================================================================================
//
//                     Worker pool and completion supervisor
//
// ========================================================================================

use super::{
    BlockFailure, BlockJob, BlockProcessor, PoolError, SharedOutputBuffer, WorkerState,
    config::PoolConfig,
};
use crate::operator::PrecisionOperator;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::any::Any;
use std::io::IsTerminal;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, ScopedJoinHandle};
use std::time::Instant;

/// Shared state of one run: the task cursor and one completion flag per block.
struct RunState {
    cursor: AtomicUsize,
    completed: Vec<AtomicBool>,
}

impl RunState {
    fn new(blocks: usize) -> Self {
        Self {
            cursor: AtomicUsize::new(0),
            completed: (0..blocks).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    /// Hands out every block index exactly once across all callers.
    fn claim(&self) -> Option<usize> {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed);
        (index < self.completed.len()).then_some(index)
    }

    fn mark_complete(&self, index: usize) {
        // Pairs with the acquire loads below: a set flag publishes the block's writes.
        self.completed[index].store(true, Ordering::Release);
    }

    fn all_complete(&self) -> bool {
        self.completed
            .iter()
            .all(|flag| flag.load(Ordering::Acquire))
    }

    fn missing(&self) -> Vec<usize> {
        self.completed
            .iter()
            .enumerate()
            .filter(|(_, flag)| !flag.load(Ordering::Acquire))
            .map(|(index, _)| index)
            .collect()
    }
}

enum WorkerEvent {
    Completed { block: usize, worker: usize },
    Failed(BlockFailure),
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked with a non-string payload".to_string()
    }
}

/// Runs a [`BlockProcessor`] over every block of a job.
pub struct BlockWorkerPool<'p, P: BlockProcessor> {
    processor: &'p P,
    config: PoolConfig,
}

impl<'p, P: BlockProcessor> BlockWorkerPool<'p, P> {
    pub fn new(processor: &'p P, config: PoolConfig) -> Self {
        Self { processor, config }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Processes every block and returns the filled buffer.
    ///
    /// Fails with [`PoolError::WorkerFailure`] when any block did not complete; the
    /// other blocks still run to completion first.
    pub fn run(
        &self,
        job: BlockJob<'_, P::Block, P::Params>,
    ) -> Result<SharedOutputBuffer, PoolError> {
        let blocks = job.block_count();
        let buffer =
            SharedOutputBuffer::allocate(&self.processor.output_fields(), job.partition().clone())?;
        if blocks == 0 {
            log::info!("No blocks to process.");
            return Ok(buffer);
        }

        let state = RunState::new(blocks);
        let progress = self.progress_bar(blocks);
        let started = Instant::now();
        let result = match self.config.parallelism.worker_count() {
            None => {
                log::info!("Processing {blocks} block(s) serially.");
                self.run_serial(&job, &buffer, &state, &progress)
            }
            Some(requested) => {
                let workers = requested.min(blocks);
                log::info!("Processing {blocks} block(s) with {workers} worker(s).");
                self.run_parallel(&job, &buffer, &state, &progress, workers)
            }
        };
        progress.finish_and_clear();
        result?;

        log::info!(
            "All {blocks} block(s) completed in {:.2?}.",
            started.elapsed()
        );
        Ok(buffer)
    }

    fn progress_bar(&self, blocks: usize) -> ProgressBar {
        let draw_target = if self.config.show_progress && std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let pb = ProgressBar::with_draw_target(Some(blocks as u64), draw_target);
        if let Ok(style) = ProgressStyle::with_template(
            "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        ) {
            pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
        }
        pb.set_message("LD blocks");
        pb
    }

    fn run_serial(
        &self,
        job: &BlockJob<'_, P::Block, P::Params>,
        buffer: &SharedOutputBuffer,
        state: &RunState,
        progress: &ProgressBar,
    ) -> Result<(), PoolError> {
        while let Some(index) = state.claim() {
            if let Err(failure) = self.execute_block(job, buffer, state, index, 0) {
                log::warn!("{failure}");
                return Err(PoolError::WorkerFailure {
                    failures: vec![failure],
                    missing_blocks: state.missing(),
                });
            }
            progress.inc(1);
        }
        Ok(())
    }

    fn run_parallel(
        &self,
        job: &BlockJob<'_, P::Block, P::Params>,
        buffer: &SharedOutputBuffer,
        state: &RunState,
        progress: &ProgressBar,
        workers: usize,
    ) -> Result<(), PoolError> {
        let (sender, receiver) = crossbeam_channel::unbounded::<WorkerEvent>();

        let mut failures = thread::scope(|scope| -> Result<Vec<BlockFailure>, PoolError> {
            let mut handles = Vec::with_capacity(workers);
            for worker in 0..workers {
                let events = sender.clone();
                let handle = thread::Builder::new()
                    .name(format!("ldgm-worker-{worker}"))
                    .spawn_scoped(scope, move || {
                        self.worker_loop(worker, job, buffer, state, &events)
                    })
                    .map_err(PoolError::Spawn)?;
                handles.push(handle);
            }
            // Once every worker has exited the channel disconnects.
            drop(sender);

            let failures = self.supervise(&receiver, &handles, state, progress);
            for (worker, handle) in handles.into_iter().enumerate() {
                if handle.join().is_err() {
                    log::warn!("Worker {worker} panicked outside block processing.");
                }
            }
            Ok(failures)
        })?;

        let missing_blocks = state.missing();
        if missing_blocks.is_empty() {
            return Ok(());
        }
        failures.sort_by_key(|failure| failure.block);
        Err(PoolError::WorkerFailure {
            failures,
            missing_blocks,
        })
    }

    fn worker_loop(
        &self,
        worker: usize,
        job: &BlockJob<'_, P::Block, P::Params>,
        buffer: &SharedOutputBuffer,
        state: &RunState,
        events: &Sender<WorkerEvent>,
    ) {
        log::trace!("worker {worker}: {}", WorkerState::Idle);
        loop {
            log::trace!("worker {worker}: {}", WorkerState::ClaimingTask);
            let Some(block) = state.claim() else {
                break;
            };
            match self.execute_block(job, buffer, state, block, worker) {
                Ok(()) => {
                    if events.send(WorkerEvent::Completed { block, worker }).is_err() {
                        log::debug!(
                            "worker {worker}: supervisor hung up before block {block} was reported complete"
                        );
                    }
                    log::trace!("worker {worker}: {}", WorkerState::Idle);
                }
                Err(failure) => {
                    log::warn!("{failure}");
                    if events.send(WorkerEvent::Failed(failure)).is_err() {
                        log::debug!(
                            "worker {worker}: supervisor hung up before block {block} was reported failed"
                        );
                    }
                    break;
                }
            }
        }
        log::trace!("worker {worker}: {}", WorkerState::Terminated);
    }

    /// Waits until every block is complete or no worker is left to complete them.
    fn supervise(
        &self,
        receiver: &Receiver<WorkerEvent>,
        handles: &[ScopedJoinHandle<'_, ()>],
        state: &RunState,
        progress: &ProgressBar,
    ) -> Vec<BlockFailure> {
        let mut failures = Vec::new();
        let mut record = |event: WorkerEvent| match event {
            WorkerEvent::Completed { block, worker } => {
                log::trace!("supervisor: block {block} completed by worker {worker}");
                progress.inc(1);
            }
            WorkerEvent::Failed(failure) => failures.push(failure),
        };

        while !state.all_complete() {
            match receiver.recv_timeout(self.config.poll_interval()) {
                Ok(event) => record(event),
                Err(RecvTimeoutError::Timeout) => {
                    let alive = handles.iter().filter(|handle| !handle.is_finished()).count();
                    if alive == 0 {
                        log::debug!("supervisor: no live workers remain");
                        break;
                    }
                    log::trace!("supervisor: {alive} worker(s) alive");
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        for event in receiver.try_iter() {
            record(event);
        }
        failures
    }

    /// Load, compute and publish one block. Used by both the serial and the threaded
    /// schedulers, so they produce identical output.
    fn execute_block(
        &self,
        job: &BlockJob<'_, P::Block, P::Params>,
        buffer: &SharedOutputBuffer,
        state: &RunState,
        index: usize,
        worker: usize,
    ) -> Result<(), BlockFailure> {
        let Some(task) = job.task(index) else {
            return Err(BlockFailure {
                block: index,
                block_id: String::new(),
                worker,
                phase: WorkerState::ClaimingTask,
                message: "block index outside the job".to_string(),
            });
        };
        let failure = |phase: WorkerState, message: String| BlockFailure {
            block: index,
            block_id: task.descriptor.id.clone(),
            worker,
            phase,
            message,
        };
        let started = Instant::now();

        log::trace!("worker {worker}: {} block {index}", WorkerState::Loading);
        let mut operator =
            match catch_unwind(AssertUnwindSafe(|| PrecisionOperator::from_descriptor(task.descriptor))) {
                Ok(Ok(operator)) => operator,
                Ok(Err(err)) => return Err(failure(WorkerState::Loading, err.to_string())),
                Err(payload) => return Err(failure(WorkerState::Loading, panic_message(&*payload))),
            };

        log::trace!("worker {worker}: {} block {index}", WorkerState::Computing);
        let mut output = buffer
            .claim_block(index)
            .map_err(|err| failure(WorkerState::Computing, err.to_string()))?;
        let computed = catch_unwind(AssertUnwindSafe(|| {
            self.processor
                .process_block(&mut operator, &task, &mut output, job.params)
        }));
        match computed {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(failure(WorkerState::Computing, err.to_string())),
            Err(payload) => return Err(failure(WorkerState::Computing, panic_message(&*payload))),
        }
        drop(output);
        drop(operator);

        log::trace!("worker {worker}: {} block {index}", WorkerState::Writing);
        state.mark_complete(index);
        log::debug!(
            "Block {index} ('{}', {} rows) finished on worker {worker} in {:.2?}.",
            task.descriptor.id,
            task.size(),
            started.elapsed()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::{BlockOutput, BlockPartition, BlockTask};
    use crate::types::{BlockDescriptor, Edge};
    use crate::variants::VariantRecord;

    #[test]
    fn claims_hand_out_each_block_once_then_run_dry() {
        let state = RunState::new(3);
        let claimed: Vec<usize> = std::iter::from_fn(|| state.claim()).collect();
        assert_eq!(claimed, vec![0, 1, 2]);
        assert_eq!(state.claim(), None);
        assert_eq!(state.claim(), None);
    }

    #[test]
    fn completion_flags_track_missing_blocks() {
        let state = RunState::new(3);
        assert!(!state.all_complete());
        state.mark_complete(2);
        state.mark_complete(0);
        assert_eq!(state.missing(), vec![1]);
        state.mark_complete(1);
        assert!(state.all_complete());
        assert!(state.missing().is_empty());
        assert!(RunState::new(0).all_complete());
    }

    #[test]
    fn panic_payloads_become_messages() {
        let literal: Box<dyn Any + Send> = Box::new("index out of bounds");
        assert_eq!(panic_message(&*literal), "panicked: index out of bounds");
        let formatted: Box<dyn Any + Send> = Box::new(format!("block {}", 7));
        assert_eq!(panic_message(&*formatted), "panicked: block 7");
        let opaque: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(&*opaque), "panicked with a non-string payload");
    }

    struct Dimension;

    impl BlockProcessor for Dimension {
        type Block = ();
        type Params = ();
        type Error = PoolError;

        fn output_fields(&self) -> Vec<String> {
            vec!["dimension".to_string()]
        }

        fn process_block(
            &self,
            operator: &mut PrecisionOperator,
            task: &BlockTask<'_, ()>,
            output: &mut BlockOutput<'_>,
            params: &(),
        ) -> Result<(), PoolError> {
            let value = operator.full_dimension() as f64;
            output.write("dimension", &vec![value; task.size()])?;
            Ok(*params)
        }
    }

    fn diagonal_block(id: &str, n: usize) -> BlockDescriptor {
        BlockDescriptor {
            id: id.to_string(),
            region: None,
            dimension: n,
            edges: (0..n)
                .map(|row| Edge {
                    row,
                    col: row,
                    value: 1.0,
                })
                .collect(),
            variants: (0..n)
                .map(|row| VariantRecord {
                    site_id: format!("{id}:{row}"),
                    chromosome: 1,
                    position: row as u64,
                    ref_allele: "A".to_string(),
                    alt_allele: "G".to_string(),
                })
                .collect(),
            columns: Vec::new(),
        }
    }

    #[test]
    fn worker_keeps_going_after_the_supervisor_hangs_up() {
        let descriptors = vec![diagonal_block("a", 2), diagonal_block("b", 3)];
        let inputs = vec![(), ()];
        let partition = BlockPartition::from_sizes(&[1, 2]);
        let job = BlockJob::new(&descriptors, &inputs, partition.clone(), 3, &()).unwrap();
        let mut buffer = SharedOutputBuffer::allocate(&Dimension.output_fields(), partition).unwrap();
        let state = RunState::new(2);
        let pool = BlockWorkerPool::new(&Dimension, PoolConfig::serial());

        let (sender, receiver) = crossbeam_channel::unbounded();
        drop(receiver);
        pool.worker_loop(0, &job, &buffer, &state, &sender);

        assert!(state.all_complete());
        assert_eq!(buffer.field("dimension").unwrap().to_vec(), vec![2.0, 3.0, 3.0]);
    }
}
