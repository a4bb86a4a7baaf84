//! Error types for the dispatch harness

use std::fmt;
use std::panic::Location;
use std::path::PathBuf;

use crate::target::ConcurrencyKind;

/// Result type for harness operations
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Every failure the harness can report.
///
/// There is no recovery path: callers propagate with `?` and the CLI logs
/// the error and exits nonzero.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// A file could not be opened, read or written
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The condition file ended early
    #[error(
        "malformed condition file {}: record {record} truncated, expected {expected} values, read {actual}",
        path.display()
    )]
    Format {
        path: PathBuf,
        record: usize,
        expected: usize,
        actual: usize,
    },

    /// No platform vendor matched the configured substring
    #[error("no OpenCL platform with vendor matching {vendor:?}")]
    PlatformNotFound { vendor: String },

    /// The matched platform has no device of the requested class
    #[error("no {class} device on platform {platform:?}")]
    DeviceNotFound { class: String, platform: String },

    /// CPU sub-partition request larger than the device
    #[error("requested {requested} compute units but the device has {max}")]
    ComputeUnitLimit { requested: usize, max: usize },

    /// Sub-device partitioning failed or produced nothing
    #[error("sub-device partitioning failed: {0}")]
    SubDevicePartition(String),

    /// Device count at or above the supported bound
    #[error("requested {requested} devices but at most {max} are supported")]
    DeviceLimit { requested: usize, max: usize },

    /// Thread count above what the platform reports
    #[error("requested {requested} threads but the platform supports {max}")]
    ThreadLimit { requested: usize, max: usize },

    /// The concurrency value has the wrong kind for this target
    #[error("{backend} target expects {expected} concurrency, got {actual}")]
    ConcurrencyMismatch {
        backend: &'static str,
        expected: ConcurrencyKind,
        actual: ConcurrencyKind,
    },

    /// Program build failed; carries the full build log
    #[error("program build failed with status {status}:\n{log}")]
    Build { status: i32, log: String },

    /// A buffer would exceed the per-array byte ceiling
    #[error("buffer {name:?} needs {bytes} bytes, above the {ceiling} byte ceiling")]
    BufferCeiling { name: String, bytes: u64, ceiling: u64 },

    /// A native API call returned a failure status
    #[error("{call} failed with status {status} at {location}: {detail}")]
    Native {
        call: &'static str,
        status: i32,
        detail: String,
        location: &'static Location<'static>,
    },

    /// Buffer access out of bounds
    #[error("buffer access out of bounds: offset {offset} + len {len} > buffer size {size}")]
    BufferOutOfBounds { offset: usize, len: usize, size: usize },

    /// A host array does not match the problem shape
    #[error("host array {name:?} has {actual} values, expected {expected}")]
    HostArrayLength {
        name: String,
        expected: usize,
        actual: usize,
    },

    /// The host kernel reported a nonzero status
    #[error("kernel {name:?} returned status {status}")]
    Kernel { name: String, status: i32 },

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The configuration file is not valid JSON for the schema
    #[error("configuration parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// A target operation was used before `bind`
    #[error("compute target is not bound")]
    NotBound,

    /// The selected backend is not compiled in or not usable
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
}

impl HarnessError {
    /// Create an I/O error naming the path
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

/// Status code carried by a native library error.
pub trait NativeStatus {
    fn status(&self) -> i32;
}

#[cfg(feature = "opencl")]
impl NativeStatus for opencl3::error_codes::ClError {
    fn status(&self) -> i32 {
        self.0
    }
}

impl NativeStatus for rayon::ThreadPoolBuildError {
    fn status(&self) -> i32 {
        -1
    }
}

impl NativeStatus for libloading::Error {
    fn status(&self) -> i32 {
        -1
    }
}

/// The single checking primitive for native calls.
///
/// Converts a native failure into [`HarnessError::Native`] carrying the call
/// name, the status code and the caller's source location, and logs it.
pub trait NativeResultExt<T> {
    fn native(self, call: &'static str) -> Result<T>;
}

impl<T, E> NativeResultExt<T> for std::result::Result<T, E>
where
    E: NativeStatus + fmt::Display,
{
    #[track_caller]
    fn native(self, call: &'static str) -> Result<T> {
        match self {
            Ok(value) => Ok(value),
            Err(err) => {
                let location = Location::caller();
                let status = err.status();
                tracing::error!(call, status, %location, error = %err, "native call failed");
                Err(HarnessError::Native {
                    call,
                    status,
                    detail: err.to_string(),
                    location,
                })
            }
        }
    }
}
