//! # jacrun-core
//!
//! Batch dispatch and resource lifecycle engine for per-condition chemistry
//! kernels. An opaque kernel (OpenCL program binary or host function) is run
//! over a large array of independent thermochemical conditions in
//! capacity-bounded chunks.
//!
//! ## Architecture
//!
//! ```text
//! LifecycleController ── bind / resize / reuse decisions
//!   ├── ComputeTarget      AcceleratorTarget (opencl) | ThreadedTarget (rayon)
//!   ├── BufferManager      per-argument buffers, ceiling checks, slot binding
//!   └── batch::execute     chunk loop: write, launch, read
//! loader::load_conditions  binary condition file → host arrays
//! ```
//!
//! ## Example
//!
//! ```rust
//! use jacrun_core::{
//!     ByteSize, Concurrency, ControllerSettings, DataOrder, HostData, KernelCall, KernelSignature,
//!     LifecycleController, ThreadedTarget, Vectorization,
//! };
//!
//! # fn main() -> jacrun_core::Result<()> {
//! let negate = |call: KernelCall<'_>| -> jacrun_core::Result<()> {
//!     let n = call.problem_size;
//!     let (input, output) = call.args.split_at_mut(1);
//!     for (y, x) in output[0][..n].iter_mut().zip(&input[0][..n]) {
//!         *y = -x;
//!     }
//!     Ok(())
//! };
//!
//! let signature = KernelSignature::new().input("x", 1).output("y", 1, false);
//! let settings = ControllerSettings {
//!     max_per_run: 2,
//!     vectorization: Vectorization::Parallel,
//!     array_ceiling: ByteSize(1 << 20),
//! };
//! let mut controller = LifecycleController::new(ThreadedTarget::new(negate), signature, settings)?;
//!
//! let x = [1.0, 2.0, 3.0];
//! let mut y = [0.0; 3];
//! let mut host = HostData::new(DataOrder::ConditionMajor).input(&x).output(&mut y);
//! let report = controller.run(3, Concurrency::Threads(1), &mut host)?;
//! assert_eq!(report.chunks, 2);
//! drop(host);
//! assert_eq!(y, [-1.0, -2.0, -3.0]);
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod buffers;
pub mod config;
pub mod error;
pub mod kernel;
pub mod layout;
pub mod lifecycle;
pub mod loader;
pub mod output;
pub mod target;

pub use batch::{chunk_plan, execute, Chunk, HostData};
pub use buffers::BufferManager;
pub use config::{ByteSize, DeviceClass, HarnessConfig, Vectorization};
pub use error::{HarnessError, NativeResultExt, Result};
pub use kernel::{ArgKind, ArgSpec, DylibKernel, HostKernel, KernelCall, KernelSignature};
pub use layout::DataOrder;
pub use lifecycle::{ControllerSettings, LifecycleController, LifecycleState, LifecycleStats, RunReport, Transition};
pub use loader::{load_conditions, ConditionSet};
pub use output::OutputWriter;
pub use target::{
    AcceleratorSettings, AcceleratorTarget, BackendKind, ComputeTarget, Concurrency, ConcurrencyKind, LaunchShape,
    ThreadedTarget,
};
