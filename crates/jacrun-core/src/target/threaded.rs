//! Multi-threaded host backend
//!
//! Buffers are plain host vectors. Binding builds a rayon pool of exactly the
//! requested width; each launch runs the [`HostKernel`] inside
//! `ThreadPool::install`, which returns only once the kernel is done.

use std::fmt;
use std::sync::Arc;

use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info};

use super::{expect_concurrency, ComputeTarget, Concurrency, ConcurrencyKind, LaunchShape};
use crate::error::{HarnessError, NativeResultExt, Result};
use crate::kernel::{HostKernel, KernelCall};

/// Rayon-backed [`ComputeTarget`].
pub struct ThreadedTarget {
    kernel: Arc<dyn HostKernel>,
    pool: Option<ThreadPool>,
    max_threads: usize,
}

impl ThreadedTarget {
    pub fn new(kernel: impl HostKernel + 'static) -> Self {
        Self::from_arc(Arc::new(kernel))
    }

    /// Share one kernel between several targets.
    pub fn from_arc(kernel: Arc<dyn HostKernel>) -> Self {
        let max_threads = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self {
            kernel,
            pool: None,
            max_threads,
        }
    }

    /// Override the platform-reported thread limit.
    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Width of the bound pool.
    pub fn threads(&self) -> Option<usize> {
        self.pool.as_ref().map(ThreadPool::current_num_threads)
    }
}

impl fmt::Debug for ThreadedTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadedTarget")
            .field("kernel", &self.kernel.name())
            .field("threads", &self.threads())
            .field("max_threads", &self.max_threads)
            .finish()
    }
}

fn check_range(offset: usize, len: usize, size: usize) -> Result<()> {
    if offset + len > size {
        return Err(HarnessError::BufferOutOfBounds { offset, len, size });
    }
    Ok(())
}

impl ComputeTarget for ThreadedTarget {
    type Buffer = Vec<f64>;

    fn backend(&self) -> &'static str {
        "threaded"
    }

    fn concurrency_kind(&self) -> ConcurrencyKind {
        ConcurrencyKind::Threads
    }

    fn bind(&mut self, concurrency: Concurrency) -> Result<()> {
        let threads = expect_concurrency(self.backend(), self.concurrency_kind(), concurrency)?;
        if threads > self.max_threads {
            return Err(HarnessError::ThreadLimit {
                requested: threads,
                max: self.max_threads,
            });
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("jacrun-worker-{index}"))
            .build()
            .native("ThreadPoolBuilder::build")?;
        self.pool = Some(pool);
        info!(threads, kernel = self.kernel.name(), "bound threaded target");
        Ok(())
    }

    fn is_bound(&self) -> bool {
        self.pool.is_some()
    }

    fn release(&mut self) {
        if self.pool.take().is_some() {
            debug!("released thread pool");
        }
    }

    fn allocate(&mut self, _name: &str, elements: usize) -> Result<Vec<f64>> {
        Ok(vec![0.0; elements])
    }

    fn fill_zero(&mut self, buffer: &mut Vec<f64>) -> Result<()> {
        buffer.fill(0.0);
        Ok(())
    }

    fn write(&mut self, buffer: &mut Vec<f64>, offset: usize, data: &[f64]) -> Result<()> {
        check_range(offset, data.len(), buffer.len())?;
        buffer[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read(&mut self, buffer: &Vec<f64>, offset: usize, out: &mut [f64]) -> Result<()> {
        check_range(offset, out.len(), buffer.len())?;
        out.copy_from_slice(&buffer[offset..offset + out.len()]);
        Ok(())
    }

    fn set_arg(&mut self, _slot: u32, _buffer: &Vec<f64>) -> Result<()> {
        // Host kernels receive their buffers positionally at launch.
        Ok(())
    }

    fn launch(&mut self, shape: &LaunchShape, buffers: &mut [Vec<f64>]) -> Result<()> {
        let pool = self.pool.as_ref().ok_or(HarnessError::NotBound)?;
        let kernel = &self.kernel;
        pool.install(|| {
            kernel.execute(KernelCall {
                problem_size: shape.items,
                capacity: shape.capacity,
                args: buffers,
            })
        })
    }

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}
