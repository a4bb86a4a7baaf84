//! Kernel argument signatures and host-side kernels
//!
//! A [`KernelSignature`] lists the kernel's array arguments in slot order.
//! Slot 0 is always the scalar per-chunk problem size, so argument `k` of
//! the signature is bound to slot `k + 1`.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;
use tracing::{debug, info};

use crate::config::HarnessConfig;
use crate::error::{HarnessError, NativeResultExt, Result};

/// Names of the three condition inputs, in slot order.
pub const TEMPERATURE: &str = "T";
pub const PRESSURE: &str = "P";
pub const CONCENTRATIONS: &str = "conc";

/// What an argument carries and how it is sized.
#[derive(Clone, Debug, PartialEq)]
pub enum ArgKind {
    /// Host data copied in per chunk
    Input { per_condition: usize },
    /// Copied back to the host per chunk
    Output { per_condition: usize, zero_init: bool },
    /// Fixed data copied once per allocation
    Constant(Arc<[f64]>),
    /// Device-only work space, zeroed once per allocation
    Scratch { per_condition: usize },
}

/// One kernel argument.
#[derive(Clone, Debug, PartialEq)]
pub struct ArgSpec {
    pub name: String,
    pub kind: ArgKind,
}

impl ArgSpec {
    /// Values per condition, `None` for constants.
    pub fn per_condition(&self) -> Option<usize> {
        match &self.kind {
            ArgKind::Input { per_condition }
            | ArgKind::Output { per_condition, .. }
            | ArgKind::Scratch { per_condition } => Some(*per_condition),
            ArgKind::Constant(_) => None,
        }
    }

    /// Elements of a buffer sized for `capacity` conditions.
    pub fn elements(&self, capacity: usize) -> usize {
        match &self.kind {
            ArgKind::Constant(data) => data.len(),
            _ => self.per_condition().unwrap_or(0) * capacity,
        }
    }

    /// Whether the buffer is zeroed once per allocation.
    pub fn zero_init(&self) -> bool {
        matches!(
            self.kind,
            ArgKind::Scratch { .. } | ArgKind::Output { zero_init: true, .. }
        )
    }

    pub fn is_input(&self) -> bool {
        matches!(self.kind, ArgKind::Input { .. })
    }

    pub fn is_output(&self) -> bool {
        matches!(self.kind, ArgKind::Output { .. })
    }
}

/// Ordered kernel arguments.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KernelSignature {
    args: Vec<ArgSpec>,
}

impl KernelSignature {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard condition inputs `T`, `P` and `conc`.
    pub fn with_conditions(num_species: usize) -> Self {
        Self::new()
            .input(TEMPERATURE, 1)
            .input(PRESSURE, 1)
            .input(CONCENTRATIONS, num_species)
    }

    pub fn input(mut self, name: impl Into<String>, per_condition: usize) -> Self {
        self.push(name, ArgKind::Input { per_condition });
        self
    }

    pub fn output(mut self, name: impl Into<String>, per_condition: usize, zero_init: bool) -> Self {
        self.push(
            name,
            ArgKind::Output {
                per_condition,
                zero_init,
            },
        );
        self
    }

    pub fn constant(mut self, name: impl Into<String>, data: impl Into<Arc<[f64]>>) -> Self {
        self.push(name, ArgKind::Constant(data.into()));
        self
    }

    pub fn scratch(mut self, name: impl Into<String>, per_condition: usize) -> Self {
        self.push(name, ArgKind::Scratch { per_condition });
        self
    }

    fn push(&mut self, name: impl Into<String>, kind: ArgKind) {
        self.args.push(ArgSpec {
            name: name.into(),
            kind,
        });
    }

    /// Condition inputs, then outputs, constants and scratch arrays in
    /// configuration order. Constant files are read here.
    pub fn from_config(config: &HarnessConfig) -> Result<Self> {
        let mut signature = Self::with_conditions(config.num_species);
        for output in &config.outputs {
            signature = signature.output(&output.name, output.per_condition, output.zero_init);
        }
        for constant in &config.constants {
            let data = read_f64_file(&constant.path)?;
            debug!(name = %constant.name, len = data.len(), "loaded constant argument");
            signature = signature.constant(&constant.name, data);
        }
        for scratch in &config.scratch {
            signature = signature.scratch(&scratch.name, scratch.per_condition);
        }
        Ok(signature)
    }

    pub fn args(&self) -> &[ArgSpec] {
        &self.args
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Kernel slot of argument `index`.
    pub fn slot(index: usize) -> u32 {
        index as u32 + 1
    }
}

/// Read a flat native-endian `f64` file.
pub fn read_f64_file(path: &Path) -> Result<Vec<f64>> {
    let bytes = fs::read(path).map_err(|source| HarnessError::io(path, source))?;
    if bytes.len() % std::mem::size_of::<f64>() != 0 {
        return Err(HarnessError::invalid_config(format!(
            "{} is not a whole number of f64 values",
            path.display()
        )));
    }
    Ok(bytes
        .chunks_exact(std::mem::size_of::<f64>())
        .map(bytemuck::pod_read_unaligned::<f64>)
        .collect())
}

/// Arguments of one host launch. `args[k]` is signature argument `k`, sized
/// for `capacity` conditions; only the first `problem_size` are live.
pub struct KernelCall<'a> {
    pub problem_size: usize,
    pub capacity: usize,
    pub args: &'a mut [Vec<f64>],
}

/// Kernel executed by the threaded backend.
///
/// Runs inside the target's rayon pool, so `rayon` parallel iterators used
/// by the implementation fan out over exactly the bound thread count.
pub trait HostKernel: Send + Sync {
    fn name(&self) -> &str {
        "host"
    }

    fn execute(&self, call: KernelCall<'_>) -> Result<()>;
}

impl<F> HostKernel for F
where
    F: Fn(KernelCall<'_>) -> Result<()> + Send + Sync,
{
    fn execute(&self, call: KernelCall<'_>) -> Result<()> {
        self(call)
    }
}

type RawKernel = unsafe extern "C" fn(i32, i32, *const *mut f64, i32) -> i32;

/// Host kernel loaded from a shared library.
///
/// The exported symbol must have the C signature
/// `int32_t f(int32_t problem_size, int32_t capacity, double *const *args, int32_t n_args)`
/// and return 0 on success.
pub struct DylibKernel {
    name: String,
    path: PathBuf,
    entry: RawKernel,
    // Keeps `entry` valid.
    _library: Library,
}

impl DylibKernel {
    pub fn open(path: impl AsRef<Path>, symbol: &str) -> Result<Self> {
        let path = path.as_ref();
        // SAFETY: runs the library's initializers.
        let library = unsafe { Library::new(path) }.native("dlopen")?;
        let entry = {
            let sym = unsafe { library.get::<RawKernel>(symbol.as_bytes()) }.native("dlsym")?;
            *sym
        };
        info!(path = %path.display(), symbol, "loaded host kernel");
        Ok(Self {
            name: symbol.to_string(),
            path: path.to_path_buf(),
            entry,
            _library: library,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Debug for DylibKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DylibKernel")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn to_c_int(what: &str, value: usize) -> Result<i32> {
    i32::try_from(value).map_err(|_| HarnessError::invalid_config(format!("{what} {value} does not fit a C int")))
}

impl HostKernel for DylibKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, call: KernelCall<'_>) -> Result<()> {
        let problem_size = to_c_int("problem size", call.problem_size)?;
        let capacity = to_c_int("capacity", call.capacity)?;
        let n_args = to_c_int("argument count", call.args.len())?;
        let pointers: Vec<*mut f64> = call.args.iter_mut().map(|arg| arg.as_mut_ptr()).collect();

        // SAFETY: every pointer addresses a live buffer of
        // `capacity * per_condition` values for the duration of the call.
        let status = unsafe { (self.entry)(problem_size, capacity, pointers.as_ptr(), n_args) };
        if status != 0 {
            return Err(HarnessError::Kernel {
                name: self.name.clone(),
                status,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConstantSpec, OutputSpec, ScratchSpec};
    use std::io::Write;

    #[test]
    fn signature_orders_arguments_and_sizes_them() {
        let signature = KernelSignature::with_conditions(4)
            .output("jac", 25, true)
            .constant("coeffs", vec![1.0, 2.0, 3.0])
            .scratch("work", 7);

        let names: Vec<_> = signature.args().iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["T", "P", "conc", "jac", "coeffs", "work"]);

        let sizes: Vec<_> = signature.args().iter().map(|a| a.elements(10)).collect();
        assert_eq!(sizes, [10, 10, 40, 250, 3, 70]);

        let zeroed: Vec<_> = signature.args().iter().map(ArgSpec::zero_init).collect();
        assert_eq!(zeroed, [false, false, false, true, false, true]);
        assert_eq!(KernelSignature::slot(0), 1);
    }

    #[test]
    fn from_config_reads_constant_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytemuck::cast_slice::<f64, u8>(&[0.5, 1.5])).unwrap();
        file.flush().unwrap();

        let config = HarnessConfig {
            num_species: 2,
            outputs: vec![OutputSpec {
                name: "dy".into(),
                per_condition: 3,
                zero_init: false,
            }],
            constants: vec![ConstantSpec {
                name: "A".into(),
                path: file.path().to_path_buf(),
            }],
            scratch: vec![ScratchSpec {
                name: "rwk".into(),
                per_condition: 4,
            }],
            ..HarnessConfig::default()
        };
        let signature = KernelSignature::from_config(&config).unwrap();
        assert_eq!(signature.len(), 6);
        assert_eq!(signature.args()[4].kind, ArgKind::Constant(Arc::from(vec![0.5, 1.5])));
    }

    #[test]
    fn ragged_constant_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 12]).unwrap();
        file.flush().unwrap();
        assert!(matches!(
            read_f64_file(file.path()),
            Err(HarnessError::InvalidConfig(_))
        ));
    }

    #[test]
    fn closures_are_host_kernels() {
        let kernel = |call: KernelCall<'_>| -> Result<()> {
            for value in call.args[0].iter_mut().take(call.problem_size) {
                *value *= 2.0;
            }
            Ok(())
        };
        let mut args = vec![vec![1.0, 2.0, 3.0]];
        kernel
            .execute(KernelCall {
                problem_size: 2,
                capacity: 3,
                args: &mut args,
            })
            .unwrap();
        assert_eq!(args[0], vec![2.0, 4.0, 3.0]);
        assert_eq!(HostKernel::name(&kernel), "host");
    }

    #[test]
    fn missing_library_is_native_error() {
        let err = DylibKernel::open("/nonexistent/libkernel.so", "jacobian").unwrap_err();
        assert!(matches!(err, HarnessError::Native { call: "dlopen", .. }));
    }
}
