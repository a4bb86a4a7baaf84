//! Harness configuration
//!
//! Loaded from a JSON file (`--config` or `JACRUN_CONFIG`), then patched from
//! `JACRUN_*` environment variables, then validated.

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{HarnessError, Result};
use crate::layout::DataOrder;

/// Memory amount that accepts either a byte count or a string such as
/// `"4 GB"`. Units are decimal: `KB = 1000 B`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "ByteSizeRepr", into = "u64")]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub fn bytes(self) -> u64 {
        self.0
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ByteSizeRepr {
    Bytes(u64),
    Text(String),
}

impl TryFrom<ByteSizeRepr> for ByteSize {
    type Error = String;

    fn try_from(repr: ByteSizeRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            ByteSizeRepr::Bytes(bytes) => Ok(ByteSize(bytes)),
            ByteSizeRepr::Text(text) => text.parse(),
        }
    }
}

impl From<ByteSize> for u64 {
    fn from(size: ByteSize) -> u64 {
        size.0
    }
}

impl FromStr for ByteSize {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        let (number, unit) = s.split_at(split);
        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid byte size {s:?}: missing number"))?;
        let scale = match unit.trim().to_ascii_uppercase().as_str() {
            "" | "B" => 1.0,
            "KB" => 1e3,
            "MB" => 1e6,
            "GB" => 1e9,
            other => return Err(format!("invalid byte size {s:?}: unknown unit {other:?}")),
        };
        Ok(ByteSize((value * scale).round() as u64))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} B", self.0)
    }
}

/// How conditions map to work-items.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Vectorization {
    /// One condition per work-item
    #[default]
    Parallel,
    /// `width` conditions per work-group, one per lane
    Wide { width: usize },
    /// `width` lanes cooperate on each condition
    Deep { width: usize },
}

impl Vectorization {
    /// Lane count for the vectorized kinds.
    pub fn width(self) -> Option<usize> {
        match self {
            Self::Parallel => None,
            Self::Wide { width } | Self::Deep { width } => Some(width),
        }
    }

    /// Widths must be a power of two or 3.
    pub fn validate(self) -> Result<()> {
        match self.width() {
            Some(width) if !(width == 3 || width.is_power_of_two()) => Err(HarnessError::invalid_config(format!(
                "vector width {width} must be a power of two or 3"
            ))),
            _ => Ok(()),
        }
    }
}

/// Class of OpenCL device to bind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    #[default]
    Cpu,
    Gpu,
    Accelerator,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cpu => "CPU",
            Self::Gpu => "GPU",
            Self::Accelerator => "accelerator",
        })
    }
}

/// A kernel output array.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub name: String,
    /// Values per condition
    pub per_condition: usize,
    /// Zero the buffer once per allocation
    #[serde(default)]
    pub zero_init: bool,
}

/// A constant kernel argument read from a binary `f64` file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstantSpec {
    pub name: String,
    pub path: PathBuf,
}

/// A per-condition work array the kernel uses internally.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScratchSpec {
    pub name: String,
    pub per_condition: usize,
}

/// Everything the harness needs besides the CLI arguments.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    /// Species count `NS`
    pub num_species: usize,
    /// Conditions per launch, at least 1
    pub max_per_run: usize,
    pub vectorization: Vectorization,
    /// Order the condition file was written in
    pub native_order: DataOrder,
    /// Order the kernel expects
    pub data_order: DataOrder,
    /// Per-array byte ceiling
    pub array_ceiling: ByteSize,

    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub outputs: Vec<OutputSpec>,
    pub constants: Vec<ConstantSpec>,
    pub scratch: Vec<ScratchSpec>,

    /// Substring matched against platform vendor strings
    pub platform_vendor: String,
    pub device_class: DeviceClass,
    pub build_options: String,
    pub kernel_sources: Vec<PathBuf>,
    pub kernel_binaries: Vec<PathBuf>,
    pub kernel_name: String,
    /// Exclusive bound on GPU/accelerator device counts
    pub max_devices: usize,

    /// Shared library exporting the threaded kernel
    pub library: Option<PathBuf>,
    pub symbol: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            num_species: 0,
            max_per_run: 8192,
            vectorization: Vectorization::Parallel,
            native_order: DataOrder::ConditionMajor,
            data_order: DataOrder::ConditionMajor,
            array_ceiling: ByteSize(4_000_000_000),
            input: PathBuf::from("data.bin"),
            output_dir: PathBuf::from("."),
            outputs: Vec::new(),
            constants: Vec::new(),
            scratch: Vec::new(),
            platform_vendor: String::new(),
            device_class: DeviceClass::Cpu,
            build_options: String::new(),
            kernel_sources: Vec::new(),
            kernel_binaries: Vec::new(),
            kernel_name: "jacobian".to_string(),
            max_devices: 2,
            library: None,
            symbol: "jacobian".to_string(),
        }
    }
}

impl HarnessConfig {
    /// Parse a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| HarnessError::io(path, source))?;
        let config = serde_json::from_str(&text)?;
        debug!(path = %path.display(), "loaded configuration file");
        Ok(config)
    }

    /// Load from `JACRUN_CONFIG` when set (defaults otherwise) and apply the
    /// environment overrides.
    ///
    /// # Environment Variables
    ///
    /// - `JACRUN_CONFIG` - JSON configuration file
    /// - `JACRUN_NUM_SPECIES`, `JACRUN_MAX_PER_RUN` - integers
    /// - `JACRUN_ARRAY_CEILING` - byte size such as `2 GB`
    /// - `JACRUN_INPUT`, `JACRUN_OUTPUT_DIR`, `JACRUN_KERNEL_LIBRARY` - paths
    /// - `JACRUN_PLATFORM_VENDOR`, `JACRUN_BUILD_OPTIONS` - strings
    pub fn from_env() -> Result<Self> {
        let mut config = match env::var_os("JACRUN_CONFIG") {
            Some(path) => Self::from_file(PathBuf::from(path))?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Patch fields from `JACRUN_*` variables.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(value) = env_parsed::<usize>("JACRUN_NUM_SPECIES")? {
            self.num_species = value;
        }
        if let Some(value) = env_parsed::<usize>("JACRUN_MAX_PER_RUN")? {
            self.max_per_run = value;
        }
        if let Some(value) = env_parsed::<ByteSize>("JACRUN_ARRAY_CEILING")? {
            self.array_ceiling = value;
        }
        if let Some(value) = env::var_os("JACRUN_INPUT") {
            self.input = PathBuf::from(value);
        }
        if let Some(value) = env::var_os("JACRUN_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(value);
        }
        if let Some(value) = env::var_os("JACRUN_KERNEL_LIBRARY") {
            self.library = Some(PathBuf::from(value));
        }
        if let Ok(value) = env::var("JACRUN_PLATFORM_VENDOR") {
            self.platform_vendor = value;
        }
        if let Ok(value) = env::var("JACRUN_BUILD_OPTIONS") {
            self.build_options = value;
        }
        Ok(())
    }

    /// Reject configurations the harness cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.num_species == 0 {
            return Err(HarnessError::invalid_config("num_species must be at least 1"));
        }
        if self.max_per_run == 0 {
            return Err(HarnessError::invalid_config("max_per_run must be at least 1"));
        }
        self.vectorization.validate()?;
        if !self.kernel_sources.is_empty() && self.kernel_sources.len() != self.kernel_binaries.len() {
            return Err(HarnessError::invalid_config(format!(
                "{} kernel sources but {} kernel binaries",
                self.kernel_sources.len(),
                self.kernel_binaries.len()
            )));
        }
        if let Some(output) = self.outputs.iter().find(|o| o.per_condition == 0) {
            return Err(HarnessError::invalid_config(format!(
                "output {:?} has zero values per condition",
                output.name
            )));
        }
        Ok(())
    }
}

fn env_parsed<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|err| HarnessError::invalid_config(format!("{key}={raw:?}: {err}"))),
        Err(_) => Ok(None),
    }
}
