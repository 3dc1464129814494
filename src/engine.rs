//! The PC-dependency analysis engine.
//!
//! Owns the device shadow state, the worker pool, and the kernel-scoped
//! statistics tables. Event callbacks and batch analysis are serialized
//! by the caller (the event bus); only the batch analysis itself fans out
//! across workers.

use crate::config::Options;
use crate::event::{Event, KernelLaunch, Tool};
use crate::model::MemAccessRecord;
use crate::output::{self, KernelMeta, Report};
use crate::pool::{self, WorkerPool};
use crate::shadow::DeviceShadow;
use crate::stats::{FlagsRegistry, PcDependencyTable, SectorHistogram};
use crate::sync::Arc;
use color_eyre::eyre;
use std::path::{Path, PathBuf};

/// Relative event/access timeline. Orders kernel launches against
/// allocation events without wall-clock timestamps.
#[derive(Debug, Default, Clone, Copy)]
struct Timer {
    access: u64,
    event: u64,
}

impl Timer {
    fn increment(&mut self, is_event: bool) {
        if is_event {
            self.event += 1;
        } else {
            self.access += 1;
        }
    }

    fn get(&self) -> u64 {
        self.access + self.event
    }
}

#[derive(Debug, Clone)]
struct KernelScope {
    id: u64,
    launch: KernelLaunch,
    started_at: u64,
}

#[derive(Debug)]
pub struct PcDependencyEngine {
    options: Options,
    output_dir: PathBuf,
    device: Arc<DeviceShadow>,
    pool: WorkerPool,
    /// Current shadow generation; 0 only before the first kernel.
    generation: u8,
    next_kernel_id: u64,
    kernel: Option<KernelScope>,
    timer: Timer,
    deps: PcDependencyTable,
    flags: FlagsRegistry,
    sectors: SectorHistogram,
}

impl PcDependencyEngine {
    pub fn new(options: Options) -> eyre::Result<Self> {
        let output_dir = options.output_root.join(options.output_directory_name());
        crate::fs::create_dirs(&output_dir)?;
        log::info!(
            "pc dependency analysis writing to {}",
            output_dir.display()
        );

        let device = Arc::new(DeviceShadow::default());
        let pool = WorkerPool::new(options.num_threads, Arc::clone(&device));

        Ok(Self {
            options,
            output_dir,
            device,
            pool,
            generation: 0,
            next_kernel_id: 0,
            kernel: None,
            timer: Timer::default(),
            deps: PcDependencyTable::default(),
            flags: FlagsRegistry::default(),
            sectors: SectorHistogram::default(),
        })
    }

    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    #[must_use]
    pub fn dependency_table(&self) -> &PcDependencyTable {
        &self.deps
    }

    #[must_use]
    pub fn flags_registry(&self) -> &FlagsRegistry {
        &self.flags
    }

    #[must_use]
    pub fn sector_histogram(&self) -> &SectorHistogram {
        &self.sectors
    }

    #[must_use]
    pub fn current_kernel_id(&self) -> Option<u64> {
        self.kernel.as_ref().map(|scope| scope.id)
    }

    fn kernel_launch(&mut self, launch: KernelLaunch) {
        let id = self.next_kernel_id;
        self.next_kernel_id += 1;

        self.deps.clear();
        self.flags.clear();
        self.sectors.clear();
        self.pool.clear_kernel_state();

        // a stamped generation is never 0, so the rollover to 0 forces a
        // physical pass over every arena
        self.generation = self.generation.wrapping_add(1);
        if self.generation == 0 {
            log::info!("shadow generation wrapped, resetting arenas");
            self.device.reset_arenas();
            self.generation = 1;
        }

        log::debug!(
            "kernel {id} ({}) started, shadow generation {}",
            launch.kernel_name,
            self.generation
        );
        self.kernel = Some(KernelScope {
            id,
            launch,
            started_at: self.timer.get(),
        });
        self.timer.increment(true);
    }

    fn kernel_end(&mut self) {
        let Some(scope) = self.kernel.take() else {
            log::warn!("kernel end without a matching launch");
            return;
        };

        self.pool.clear_kernel_state();

        if let Err(err) = self.flush_kernel(&scope) {
            // drop this kernel's results so the next one starts clean
            log::error!("failed to flush kernel {}: {err}", scope.id);
        }
        self.deps.clear();
        self.flags.clear();
        self.sectors.clear();

        log::debug!(
            "kernel {} finished after {} timeline steps",
            scope.id,
            self.timer.get() - scope.started_at
        );
        self.timer.increment(true);

        if let Some(max_kernels) = self.options.max_kernels {
            if scope.id + 1 >= max_kernels {
                log::info!("monitored {max_kernels} kernels, stopping");
                std::process::exit(0);
            }
        }
    }

    fn flush_kernel(&self, scope: &KernelScope) -> eyre::Result<()> {
        let kernel = KernelMeta::new(
            scope.id,
            scope.launch.kernel_name.clone(),
            scope.launch.device_id,
            scope.launch.kernel_pc,
        );
        let report = Report::new(kernel, &self.deps, &self.flags, &self.sectors);
        output::write_reports(&self.output_dir, &report)
    }

    fn mem_alloc(&mut self, addr: u64, size: u64) {
        self.device.insert_region(addr, size);
        self.timer.increment(true);
    }

    fn mem_free(&mut self, addr: u64) {
        self.device.remove_region(addr);
        self.timer.increment(true);
    }

    /// Analyze one trace batch: shard across the workers, then merge the
    /// per-worker tables in worker order.
    pub fn analyze(&mut self, records: &[MemAccessRecord]) -> Result<(), pool::Error> {
        if self.kernel.is_none() {
            log::warn!(
                "dropping batch of {} records outside any kernel",
                records.len()
            );
            return Ok(());
        }

        self.pool.run_batch(records, self.generation)?;

        for slot in self.pool.slots() {
            let mut state = slot.lock();
            self.deps += std::mem::take(&mut state.deps);
            self.flags += std::mem::take(&mut state.flags);
            self.sectors += std::mem::take(&mut state.sectors);
        }
        self.timer.increment(false);
        Ok(())
    }
}

impl Tool for PcDependencyEngine {
    fn on_event(&mut self, event: Event) {
        match event {
            Event::KernelLaunch(launch) => self.kernel_launch(launch),
            Event::KernelEnd(_) => self.kernel_end(),
            Event::MemAlloc(alloc) => self.mem_alloc(alloc.addr, alloc.size),
            Event::MemFree(free) => self.mem_free(free.addr),
            Event::TenAlloc(alloc) => self.mem_alloc(alloc.addr, alloc.size.max(0) as u64),
            Event::TenFree(free) => self.mem_free(free.addr),
            Event::MemCopy(_) | Event::MemSet(_) | Event::OpStart(_) | Event::OpEnd(_) => {
                log::trace!("ignoring {} event", event.kind());
            }
        }
    }

    fn on_batch(&mut self, records: &[MemAccessRecord]) -> eyre::Result<()> {
        self.analyze(records)?;
        Ok(())
    }

    fn on_flush(&mut self) -> eyre::Result<()> {
        // per-kernel results are flushed on kernel end; nothing is held
        // back here
        Ok(())
    }
}
