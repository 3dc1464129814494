//! Persistent analysis worker pool.
//!
//! A fixed set of workers is spawned at engine startup and joined at
//! shutdown. Batches are sharded by block id (`block_id % W`), which keeps
//! every CTA's records on one worker in input order: shared-memory
//! classification requires intra-CTA ordering, and global-memory ancestry
//! stays deterministic given the input order.
//!
//! Coordination is a single mutex with two condition variables: workers
//! block on `jobs_available` until the job generation advances, and the
//! producer blocks on `jobs_complete` until every non-empty shard has been
//! drained. The shards and the batch descriptor live under that same
//! mutex, so a worker always observes the shards belonging to the
//! generation it woke up for.

use crate::dependency::{self, BatchContext, WorkerState};
use crate::model::MemAccessRecord;
use crate::shadow::DeviceShadow;
use crate::sync::{Arc, Condvar, Mutex};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("worker pool shut down while a batch was pending")]
    Shutdown,
}

/// Number of analysis workers: `NUM_THREADS` when set, otherwise the
/// physical core count.
pub fn get_num_threads() -> Result<usize, std::num::ParseIntError> {
    let count = std::env::var("NUM_THREADS")
        .ok()
        .as_deref()
        .map(str::parse)
        .transpose()?
        .unwrap_or_else(num_cpus::get_physical);
    Ok(count.max(1))
}

/// Borrowed view of the batch buffer, valid until the producer's batch
/// wait returns.
#[derive(Debug, Clone, Copy)]
struct RawBatch {
    records: *const MemAccessRecord,
    len: usize,
    generation: u8,
}

// The producer blocks until every non-empty shard has been drained (even
// when shutting down), so the pointer never outlives the caller's buffer.
unsafe impl Send for RawBatch {}

#[derive(Default)]
struct PoolState {
    job_generation: u64,
    pending: usize,
    shutdown: bool,
    job: Option<RawBatch>,
    /// Record indices per worker, rebuilt by the producer for every batch.
    partitions: Vec<Vec<u32>>,
}

struct Shared {
    state: Mutex<PoolState>,
    jobs_available: Condvar,
    jobs_complete: Condvar,
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    /// Kernel-scoped analysis state, one slot per worker. Touched only by
    /// its worker between dispatch and completion, and by the producer
    /// outside of a batch (merge, kernel boundaries).
    slots: Vec<Arc<Mutex<WorkerState>>>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(num_workers: usize, device: Arc<DeviceShadow>) -> Self {
        let num_workers = num_workers.max(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                partitions: vec![Vec::new(); num_workers],
                ..PoolState::default()
            }),
            jobs_available: Condvar::new(),
            jobs_complete: Condvar::new(),
        });
        let slots: Vec<_> = (0..num_workers)
            .map(|_| Arc::new(Mutex::new(WorkerState::default())))
            .collect();

        let handles = slots
            .iter()
            .enumerate()
            .map(|(worker_id, slot)| {
                let shared = Arc::clone(&shared);
                let slot = Arc::clone(slot);
                let device = Arc::clone(&device);
                std::thread::Builder::new()
                    .name(format!("gpudep-worker-{worker_id}"))
                    .spawn(move || worker_loop(worker_id, &shared, &slot, &device))
                    .expect("spawn analysis worker")
            })
            .collect();

        log::debug!("started worker pool with {num_workers} workers");
        Self {
            shared,
            slots,
            handles,
        }
    }

    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn slots(&self) -> &[Arc<Mutex<WorkerState>>] {
        &self.slots
    }

    /// Shard `records` across the workers, run the batch, and wait for
    /// completion.
    ///
    /// Per-batch buffers are cleared up front; the workers' dependency /
    /// flags / sector tables hold exactly this batch's partial results
    /// when this returns, ready to be merged in worker order.
    pub fn run_batch(&self, records: &[MemAccessRecord], generation: u8) -> Result<(), Error> {
        let num_workers = self.slots.len();
        for slot in &self.slots {
            slot.lock().clear_batch();
        }

        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(Error::Shutdown);
        }

        for partition in &mut state.partitions {
            partition.clear();
        }
        for (index, record) in records.iter().enumerate() {
            let worker = (record.block_id % num_workers as u64) as usize;
            state.partitions[worker].push(index as u32);
        }
        let non_empty = state.partitions.iter().filter(|p| !p.is_empty()).count();
        if non_empty == 0 {
            return Ok(());
        }

        state.job = Some(RawBatch {
            records: records.as_ptr(),
            len: records.len(),
            generation,
        });
        state.job_generation += 1;
        state.pending = non_empty;
        self.shared.jobs_available.notify_all();

        // wait for the last worker; on shutdown keep waiting until the
        // in-flight shards drain so the batch buffer may be released
        while state.pending > 0 {
            state = self.shared.jobs_complete.wait(state);
        }
        state.job = None;
        if state.shutdown {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    /// Clear every worker's kernel-scoped state (tables and shared-memory
    /// shadows). Called at kernel boundaries, never with a batch in
    /// flight.
    pub fn clear_kernel_state(&self) {
        for slot in &self.slots {
            slot.lock().clear_kernel();
        }
    }

    fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
        }
        self.shared.jobs_available.notify_all();
        self.shared.jobs_complete.notify_all();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
        for handle in self.handles.drain(..) {
            if let Err(err) = handle.join() {
                log::error!("analysis worker panicked: {err:?}");
            }
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("num_workers", &self.slots.len())
            .finish_non_exhaustive()
    }
}

fn worker_loop(
    worker_id: usize,
    shared: &Shared,
    slot: &Mutex<WorkerState>,
    device: &DeviceShadow,
) {
    let mut seen_generation = 0u64;
    loop {
        let (job, indices) = {
            let mut state = shared.state.lock();
            loop {
                // drain a pending shard before honoring shutdown, so the
                // producer's completion wait always terminates
                if state.job_generation != seen_generation {
                    seen_generation = state.job_generation;
                    let indices = std::mem::take(&mut state.partitions[worker_id]);
                    if indices.is_empty() {
                        // not part of `pending` for this generation; a
                        // stale or cleared job descriptor is fine here
                        continue;
                    }
                    // a non-empty shard keeps the producer waiting, so the
                    // descriptor is the live one
                    break (
                        state.job.expect("batch descriptor for pending shard"),
                        indices,
                    );
                }
                if state.shutdown {
                    return;
                }
                state = shared.jobs_available.wait(state);
            }
        };

        {
            let records = unsafe { std::slice::from_raw_parts(job.records, job.len) };
            let regions = device.regions.read();
            let arenas = device.arenas.read();
            let ctx = BatchContext {
                regions: &regions,
                arenas: &arenas,
                generation: job.generation,
                unknown_mem_type: &device.unknown_mem_type,
            };
            let mut state = slot.lock();
            for &index in &indices {
                dependency::process_record(&ctx, &mut state, &records[index as usize]);
            }
        }

        let mut state = shared.state.lock();
        // hand the shard buffer back to keep its capacity
        state.partitions[worker_id] = indices;
        state.pending -= 1;
        if state.pending == 0 {
            shared.jobs_complete.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AccessFlags, MemoryType, WARP_SIZE};
    use crate::stats::PcDependencyTable;

    fn record(pc: u64, block: u64, addr: u64) -> MemAccessRecord {
        let mut addrs = [0u64; WARP_SIZE];
        addrs[0] = addr;
        MemAccessRecord {
            pc,
            block_id: block,
            warp_id: 0,
            active_mask: 0x1,
            access_size: 4,
            flags: AccessFlags::READ.bits(),
            distinct_sectors: 1,
            mem_type: MemoryType::Global as u32,
            addrs,
        }
    }

    fn merged_deps(pool: &WorkerPool) -> PcDependencyTable {
        let mut deps = PcDependencyTable::default();
        for slot in pool.slots() {
            deps += std::mem::take(&mut slot.lock().deps);
        }
        deps
    }

    #[test]
    fn empty_batch_completes() {
        let device = Arc::new(DeviceShadow::default());
        let pool = WorkerPool::new(4, device);
        assert_eq!(pool.run_batch(&[], 1), Ok(()));
    }

    #[test]
    fn batch_produces_one_increment_per_stride() {
        let device = Arc::new(DeviceShadow::default());
        device.insert_region(0x1000, 0x1000).unwrap();
        let pool = WorkerPool::new(4, Arc::clone(&device));

        let records: Vec<_> = (0..64)
            .map(|i| record(0xaa, i % 8, 0x1000 + i * 16))
            .collect();
        pool.run_batch(&records, 1).unwrap();

        assert_eq!(merged_deps(&pool).total(), 64);
    }

    #[test]
    fn same_block_records_stay_ordered() {
        let device = Arc::new(DeviceShadow::default());
        device.insert_region(0x1000, 0x1000).unwrap();
        let pool = WorkerPool::new(4, Arc::clone(&device));

        // all in block 3: one worker processes them in input order
        let records = vec![
            record(0xaa, 3, 0x1000),
            record(0xbb, 3, 0x1000),
            record(0xcc, 3, 0x1000),
        ];
        pool.run_batch(&records, 1).unwrap();

        let deps = merged_deps(&pool);
        assert_eq!(deps.get(0xaa, 0).unwrap().0, [1, 0, 0, 0]);
        assert_eq!(deps.get(0xbb, 0xaa).unwrap().0, [1, 0, 0, 0]);
        assert_eq!(deps.get(0xcc, 0xbb).unwrap().0, [1, 0, 0, 0]);
    }

    #[test]
    fn consecutive_batches_accumulate_worker_history() {
        let device = Arc::new(DeviceShadow::default());
        device.insert_region(0x1000, 0x1000).unwrap();
        let pool = WorkerPool::new(2, Arc::clone(&device));

        pool.run_batch(&[record(0xaa, 0, 0x1000)], 1).unwrap();
        let first = merged_deps(&pool);
        assert_eq!(first.get(0xaa, 0).unwrap().0, [1, 0, 0, 0]);

        // second batch: the shadow cell still remembers the first batch
        pool.run_batch(&[record(0xbb, 0, 0x1000)], 1).unwrap();
        let second = merged_deps(&pool);
        assert!(second.get(0xbb, 0).is_none());
        assert_eq!(second.get(0xbb, 0xaa).unwrap().0, [1, 0, 0, 0]);
    }

    #[test]
    fn many_batches_reuse_the_same_workers() {
        let device = Arc::new(DeviceShadow::default());
        device.insert_region(0x1000, 0x10000).unwrap();
        let pool = WorkerPool::new(3, Arc::clone(&device));

        // alternate shard populations so workers repeatedly see empty and
        // non-empty shards across generations
        for batch in 0..50u64 {
            let records: Vec<_> = (0..=(batch % 3))
                .map(|block| record(0xaa, block, 0x1000 + batch * 64 + block * 8))
                .collect();
            pool.run_batch(&records, 1).unwrap();
        }

        let total: u64 = (0..50u64).map(|batch| batch % 3 + 1).sum();
        assert_eq!(merged_deps(&pool).total(), total);
    }

    #[test]
    fn drop_joins_workers() {
        let device = Arc::new(DeviceShadow::default());
        let pool = WorkerPool::new(2, device);
        drop(pool);
    }
}
