//! Lifecycle controller
//!
//! Top-level entry point of the engine. Each [`LifecycleController::run`]
//! decides between a full reinitialization, a buffer-only resize or plain
//! reuse of the bound target, then executes the batch.
//!
//! ```text
//!                 run(concurrency changed)
//!        ┌────────────── teardown ◄──────────────┐
//!        ▼                                       │
//! Uninitialized ── bind + allocate ──► Ready ────┤ capacity changed: release + allocate
//!                                                │ otherwise: reuse
//!                                                ▼
//!                                             execute
//! ```

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::batch::{self, HostData};
use crate::buffers::BufferManager;
use crate::config::{ByteSize, HarnessConfig, Vectorization};
use crate::error::{HarnessError, Result};
use crate::kernel::KernelSignature;
use crate::target::{ComputeTarget, Concurrency};

/// Whether the target is bound and buffers are allocated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Ready,
}

/// What a run had to do before executing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// First bind and allocation
    Initialized,
    /// Concurrency changed: torn down, bound and allocated again
    Reinitialized,
    /// Capacity changed: buffers reallocated on the same binding
    Resized,
    /// Nothing changed
    Reused,
}

/// Outcome of one [`LifecycleController::run`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunReport {
    pub transition: Transition,
    pub capacity: usize,
    pub chunks: usize,
    /// Time spent binding and allocating
    pub setup: Duration,
    /// Time spent in the batch
    pub runtime: Duration,
}

/// Counters of the work done across runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LifecycleStats {
    pub binds: u64,
    pub allocations: u64,
    pub buffer_releases: u64,
    pub teardowns: u64,
    pub executions: u64,
}

/// Engine settings that do not depend on the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControllerSettings {
    pub max_per_run: usize,
    pub vectorization: Vectorization,
    pub array_ceiling: ByteSize,
}

impl ControllerSettings {
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            max_per_run: config.max_per_run,
            vectorization: config.vectorization,
            array_ceiling: config.array_ceiling,
        }
    }
}

/// Owns a target and its buffers, plus the state of the previous run.
pub struct LifecycleController<T: ComputeTarget> {
    target: T,
    buffers: BufferManager<T>,
    max_per_run: usize,
    vectorization: Vectorization,
    state: LifecycleState,
    concurrency_store: Option<Concurrency>,
    capacity_store: Option<usize>,
    stats: LifecycleStats,
}

impl<T: ComputeTarget> LifecycleController<T> {
    pub fn new(target: T, signature: KernelSignature, settings: ControllerSettings) -> Result<Self> {
        if settings.max_per_run == 0 {
            return Err(HarnessError::invalid_config("max_per_run must be at least 1"));
        }
        settings.vectorization.validate()?;
        Ok(Self {
            target,
            buffers: BufferManager::new(signature, settings.array_ceiling),
            max_per_run: settings.max_per_run,
            vectorization: settings.vectorization,
            state: LifecycleState::Uninitialized,
            concurrency_store: None,
            capacity_store: None,
            stats: LifecycleStats::default(),
        })
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn stats(&self) -> LifecycleStats {
        self.stats
    }

    pub fn concurrency_store(&self) -> Option<Concurrency> {
        self.concurrency_store
    }

    pub fn capacity_store(&self) -> Option<usize> {
        self.capacity_store
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn buffers(&self) -> &BufferManager<T> {
        &self.buffers
    }

    /// Run `problem_size` conditions from `host` with `concurrency`.
    pub fn run(&mut self, problem_size: usize, concurrency: Concurrency, host: &mut HostData<'_>) -> Result<RunReport> {
        if problem_size == 0 {
            return Err(HarnessError::invalid_config("problem size must be at least 1"));
        }
        let capacity = self.max_per_run.min(problem_size);
        let setup_start = Instant::now();

        let transition = match self.prepare(capacity, concurrency) {
            Ok(transition) => transition,
            Err(err) => {
                warn!(error = %err, "setup failed, tearing down");
                self.teardown();
                return Err(err);
            }
        };
        // Stored before execution: a failed batch leaves a valid binding.
        self.concurrency_store = Some(concurrency);
        self.capacity_store = Some(capacity);
        let setup = setup_start.elapsed();

        let run_start = Instant::now();
        let chunks = batch::execute(
            &mut self.target,
            &mut self.buffers,
            problem_size,
            capacity,
            self.vectorization,
            host,
        )?;
        let runtime = run_start.elapsed();
        self.stats.executions += 1;

        info!(
            problem_size,
            capacity,
            chunks,
            ?transition,
            setup_ms = setup.as_secs_f64() * 1e3,
            runtime_ms = runtime.as_secs_f64() * 1e3,
            "run complete"
        );
        Ok(RunReport {
            transition,
            capacity,
            chunks,
            setup,
            runtime,
        })
    }

    fn prepare(&mut self, capacity: usize, concurrency: Concurrency) -> Result<Transition> {
        let mut transition = Transition::Initialized;

        if self.state == LifecycleState::Ready {
            if self.concurrency_store != Some(concurrency) {
                info!(
                    previous = ?self.concurrency_store,
                    requested = %concurrency,
                    "concurrency changed, reinitializing"
                );
                self.teardown();
                transition = Transition::Reinitialized;
            } else if self.capacity_store != Some(capacity) {
                debug!(previous = ?self.capacity_store, capacity, "capacity changed, resizing buffers");
                self.buffers.release(&mut self.target);
                self.stats.buffer_releases += 1;
                self.buffers.allocate(&mut self.target, capacity)?;
                self.stats.allocations += 1;
                return Ok(Transition::Resized);
            } else {
                return Ok(Transition::Reused);
            }
        }

        self.target.bind(concurrency)?;
        self.stats.binds += 1;
        self.buffers.allocate(&mut self.target, capacity)?;
        self.stats.allocations += 1;
        self.state = LifecycleState::Ready;
        Ok(transition)
    }

    /// Release buffers and the binding. Safe to call in any state.
    pub fn teardown(&mut self) {
        let was_ready = self.state == LifecycleState::Ready;
        if self.buffers.is_allocated() || !self.buffers.buffers().is_empty() {
            self.buffers.release(&mut self.target);
            self.stats.buffer_releases += 1;
        }
        self.target.release();
        self.state = LifecycleState::Uninitialized;
        self.concurrency_store = None;
        self.capacity_store = None;
        if was_ready {
            self.stats.teardowns += 1;
            debug!(backend = self.target.backend(), "torn down");
        }
    }
}

impl<T: ComputeTarget> Drop for LifecycleController<T> {
    fn drop(&mut self) {
        self.teardown();
    }
}
