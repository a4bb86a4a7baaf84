//! Compute targets
//!
//! A [`ComputeTarget`] owns the execution resources of one backend (a bound
//! OpenCL device or a rayon thread pool) and exposes the buffer primitives
//! that [`crate::buffers::BufferManager`] and [`crate::batch`] drive.
//!
//! ```text
//! LifecycleController
//! ├── ComputeTarget      bind / launch / release
//! │   ├── AcceleratorTarget   OpenCL device, queue, program, kernel
//! │   └── ThreadedTarget      rayon pool + HostKernel
//! └── BufferManager      allocate / release through the target
//! ```

mod opencl;
mod threaded;

use std::fmt;
use std::str::FromStr;

use crate::config::Vectorization;
use crate::error::{HarnessError, Result};

pub use opencl::{check_device_request, compile_kernel_binaries, AcceleratorSettings, AcceleratorTarget};
pub use threaded::ThreadedTarget;

/// Which meaning a concurrency count has for a target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConcurrencyKind {
    LogicalCores,
    Devices,
    Threads,
}

impl fmt::Display for ConcurrencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::LogicalCores => "logical-core",
            Self::Devices => "device-count",
            Self::Threads => "thread-count",
        })
    }
}

/// Requested parallelism, tagged with what the count means.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Concurrency {
    /// Compute units of a CPU sub-device
    LogicalCores(usize),
    /// Whole GPU/accelerator devices
    Devices(usize),
    /// Worker threads of the threaded backend
    Threads(usize),
}

impl Concurrency {
    /// Tag `count` with `kind`.
    pub fn of_kind(kind: ConcurrencyKind, count: usize) -> Self {
        match kind {
            ConcurrencyKind::LogicalCores => Self::LogicalCores(count),
            ConcurrencyKind::Devices => Self::Devices(count),
            ConcurrencyKind::Threads => Self::Threads(count),
        }
    }

    pub fn kind(self) -> ConcurrencyKind {
        match self {
            Self::LogicalCores(_) => ConcurrencyKind::LogicalCores,
            Self::Devices(_) => ConcurrencyKind::Devices,
            Self::Threads(_) => ConcurrencyKind::Threads,
        }
    }

    pub fn count(self) -> usize {
        match self {
            Self::LogicalCores(n) | Self::Devices(n) | Self::Threads(n) => n,
        }
    }
}

impl fmt::Display for Concurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.count(), self.kind())
    }
}

/// Check that `concurrency` has the kind `backend` accepts and is nonzero.
pub fn expect_concurrency(backend: &'static str, expected: ConcurrencyKind, concurrency: Concurrency) -> Result<usize> {
    if concurrency.kind() != expected {
        return Err(HarnessError::ConcurrencyMismatch {
            backend,
            expected,
            actual: concurrency.kind(),
        });
    }
    match concurrency.count() {
        0 => Err(HarnessError::invalid_config("concurrency must be at least 1")),
        n => Ok(n),
    }
}

/// Backend selector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackendKind {
    #[default]
    Threaded,
    OpenCl,
}

impl FromStr for BackendKind {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "threaded" | "openmp" | "cpu" => Ok(Self::Threaded),
            "opencl" | "ocl" => Ok(Self::OpenCl),
            other => Err(HarnessError::BackendUnavailable(format!("unknown backend {other:?}"))),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Threaded => "threaded",
            Self::OpenCl => "opencl",
        })
    }
}

/// Work shape of one chunk launch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LaunchShape {
    /// Conditions in this chunk
    pub items: usize,
    /// Conditions the buffers are sized for
    pub capacity: usize,
    /// Physical global work size
    pub global: usize,
    /// Work-group size, `None` lets the runtime choose
    pub local: Option<usize>,
}

impl LaunchShape {
    /// Wide and deep vectorization launch `width` lanes per condition in
    /// work-groups of `width`.
    pub fn new(items: usize, capacity: usize, vectorization: Vectorization) -> Self {
        match vectorization.width() {
            Some(width) => Self {
                items,
                capacity,
                global: items * width,
                local: Some(width),
            },
            None => Self {
                items,
                capacity,
                global: items,
                local: None,
            },
        }
    }
}

/// One execution backend.
///
/// All methods take `&mut self`: a target is driven by a single control
/// thread. Offsets and lengths are in `f64` elements.
pub trait ComputeTarget {
    /// Handle to one argument buffer
    type Buffer;

    /// Short backend name for logs and errors.
    fn backend(&self) -> &'static str;

    /// The concurrency kind [`Self::bind`] accepts.
    fn concurrency_kind(&self) -> ConcurrencyKind;

    /// Acquire the device or thread pool for `concurrency`.
    fn bind(&mut self, concurrency: Concurrency) -> Result<()>;

    fn is_bound(&self) -> bool;

    /// Drop everything `bind` acquired. Safe when unbound.
    fn release(&mut self);

    /// Allocate an uninitialized buffer of `elements` values.
    fn allocate(&mut self, name: &str, elements: usize) -> Result<Self::Buffer>;

    /// Free a buffer.
    fn free(&mut self, buffer: Self::Buffer) {
        drop(buffer);
    }

    fn fill_zero(&mut self, buffer: &mut Self::Buffer) -> Result<()>;

    /// Copy `data` into the buffer at `offset`. The write may complete
    /// asynchronously; `data` must stay untouched until the next blocking
    /// [`Self::read`] or [`Self::finish`].
    fn write(&mut self, buffer: &mut Self::Buffer, offset: usize, data: &[f64]) -> Result<()>;

    /// Blocking copy from the buffer at `offset` into `out`.
    fn read(&mut self, buffer: &Self::Buffer, offset: usize, out: &mut [f64]) -> Result<()>;

    /// Bind `buffer` to kernel argument `slot` (slot 0 is the problem size).
    fn set_arg(&mut self, slot: u32, buffer: &Self::Buffer) -> Result<()>;

    /// Run the kernel over one chunk. Sets slot 0 to `shape.items`.
    fn launch(&mut self, shape: &LaunchShape, buffers: &mut [Self::Buffer]) -> Result<()>;

    /// Wait for all queued work.
    fn finish(&mut self) -> Result<()>;
}
