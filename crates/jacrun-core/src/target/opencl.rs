//! OpenCL accelerator backend
//!
//! Binds exactly one device of the configured class on the first platform
//! whose vendor matches, builds the kernel program from precompiled binaries
//! and drives it through a single in-order command queue.
//!
//! # Architecture
//!
//! ```text
//! AcceleratorTarget
//! └── BoundDevice        dropped in field order
//!     ├── Kernel
//!     ├── Program(s)
//!     ├── CommandQueue   in-order
//!     ├── Context
//!     └── SubDevice      CPU class only
//! ```
//!
//! Requires the `opencl` feature; without it [`AcceleratorTarget::new`] and
//! [`compile_kernel_binaries`] report [`HarnessError::BackendUnavailable`].

use std::path::PathBuf;

use crate::config::{DeviceClass, HarnessConfig};
use crate::error::{HarnessError, Result};

#[cfg(feature = "opencl")]
use super::{expect_concurrency, ComputeTarget, Concurrency, ConcurrencyKind, LaunchShape};
#[cfg(feature = "opencl")]
use crate::error::NativeResultExt;
#[cfg(feature = "opencl")]
use std::{fs, path::Path, ptr};
#[cfg(feature = "opencl")]
use tracing::{debug, error, info, warn};

#[cfg(feature = "opencl")]
use opencl3::{
    command_queue::CommandQueue,
    context::Context,
    device::{
        Device, SubDevice, CL_DEVICE_PARTITION_BY_COUNTS, CL_DEVICE_PARTITION_BY_COUNTS_LIST_END,
        CL_DEVICE_TYPE_ACCELERATOR, CL_DEVICE_TYPE_CPU, CL_DEVICE_TYPE_GPU,
    },
    error_codes::{ClError, CL_DEVICE_NOT_FOUND, CL_INVALID_KERNEL_NAME},
    kernel::Kernel,
    memory::{Buffer, CL_MEM_READ_WRITE},
    platform::{get_platforms, Platform},
    program::Program,
    types::{cl_device_id, cl_device_partition_property, cl_device_type, cl_double, cl_int, CL_BLOCKING, CL_NON_BLOCKING},
};

/// Device selection and program inputs for the accelerator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcceleratorSettings {
    /// Substring matched against platform vendor strings
    pub platform_vendor: String,
    pub device_class: DeviceClass,
    pub build_options: String,
    pub kernel_sources: Vec<PathBuf>,
    pub kernel_binaries: Vec<PathBuf>,
    pub kernel_name: String,
    /// Exclusive bound on GPU/accelerator device counts
    pub max_devices: usize,
}

impl AcceleratorSettings {
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            platform_vendor: config.platform_vendor.clone(),
            device_class: config.device_class,
            build_options: config.build_options.clone(),
            kernel_sources: config.kernel_sources.clone(),
            kernel_binaries: config.kernel_binaries.clone(),
            kernel_name: config.kernel_name.clone(),
            max_devices: config.max_devices,
        }
    }
}

/// Validate a concurrency request against the device limits.
///
/// CPU requests are compute units and may not exceed `max_compute_units`.
/// GPU and accelerator requests are device counts: at least `max_devices` is
/// rejected, and exactly one device can be bound.
pub fn check_device_request(
    class: DeviceClass,
    count: usize,
    max_devices: usize,
    max_compute_units: usize,
) -> Result<()> {
    match class {
        DeviceClass::Cpu => {
            if count > max_compute_units {
                return Err(HarnessError::ComputeUnitLimit {
                    requested: count,
                    max: max_compute_units,
                });
            }
        }
        DeviceClass::Gpu | DeviceClass::Accelerator => {
            if count >= max_devices {
                return Err(HarnessError::DeviceLimit {
                    requested: count,
                    max: max_devices,
                });
            }
            if count != 1 {
                return Err(HarnessError::invalid_config(format!(
                    "exactly one device can be bound, {count} requested"
                )));
            }
        }
    }
    Ok(())
}

/// Device buffer plus its length in elements.
#[cfg(feature = "opencl")]
pub struct ClBuffer {
    inner: Buffer<cl_double>,
    len: usize,
}

#[cfg(feature = "opencl")]
struct BoundDevice {
    kernel: Kernel,
    _programs: Vec<Program>,
    queue: CommandQueue,
    context: Context,
    _sub_device: Option<SubDevice>,
}

/// OpenCL [`ComputeTarget`].
#[cfg(feature = "opencl")]
pub struct AcceleratorTarget {
    settings: AcceleratorSettings,
    bound: Option<BoundDevice>,
}

#[cfg(feature = "opencl")]
impl AcceleratorTarget {
    pub fn new(settings: AcceleratorSettings) -> Result<Self> {
        if settings.kernel_binaries.is_empty() {
            return Err(HarnessError::invalid_config("accelerator backend needs kernel_binaries"));
        }
        Ok(Self { settings, bound: None })
    }

    pub fn settings(&self) -> &AcceleratorSettings {
        &self.settings
    }

    fn bound(&self) -> Result<&BoundDevice> {
        self.bound.as_ref().ok_or(HarnessError::NotBound)
    }

    fn check_range(buffer: &ClBuffer, offset: usize, len: usize) -> Result<()> {
        if offset + len > buffer.len {
            return Err(HarnessError::BufferOutOfBounds {
                offset,
                len,
                size: buffer.len,
            });
        }
        Ok(())
    }

    /// Device for `concurrency`, sub-partitioned for the CPU class.
    fn select_device(&self, platform: &Platform, count: usize) -> Result<(cl_device_id, Option<SubDevice>)> {
        let settings = &self.settings;
        match settings.device_class {
            DeviceClass::Cpu => {
                let root = Device::new(first_device(platform, settings.device_class)?);
                let max = root.max_compute_units().native("clGetDeviceInfo")? as usize;
                check_device_request(settings.device_class, count, settings.max_devices, max)?;
                let properties: [cl_device_partition_property; 4] = [
                    CL_DEVICE_PARTITION_BY_COUNTS,
                    count as cl_device_partition_property,
                    CL_DEVICE_PARTITION_BY_COUNTS_LIST_END,
                    0,
                ];
                let mut partitions = root
                    .create_sub_devices(&properties)
                    .native("clCreateSubDevices")?
                    .into_iter()
                    .map(SubDevice::new);
                let sub_device = partitions
                    .next()
                    .ok_or_else(|| HarnessError::SubDevicePartition(format!("no sub-device with {count} compute units")))?;
                // Only one partition is used; the rest are released here.
                partitions.for_each(drop);
                debug!(compute_units = count, max, "partitioned CPU device");
                Ok((sub_device.id(), Some(sub_device)))
            }
            DeviceClass::Gpu | DeviceClass::Accelerator => {
                check_device_request(settings.device_class, count, settings.max_devices, 0)?;
                Ok((first_device(platform, settings.device_class)?, None))
            }
        }
    }
}

#[cfg(feature = "opencl")]
fn device_type(class: DeviceClass) -> cl_device_type {
    match class {
        DeviceClass::Cpu => CL_DEVICE_TYPE_CPU,
        DeviceClass::Gpu => CL_DEVICE_TYPE_GPU,
        DeviceClass::Accelerator => CL_DEVICE_TYPE_ACCELERATOR,
    }
}

/// First platform whose vendor string contains `vendor`.
#[cfg(feature = "opencl")]
fn find_platform(vendor: &str) -> Result<Platform> {
    for platform in get_platforms().native("clGetPlatformIDs")? {
        let name = platform.vendor().native("clGetPlatformInfo")?;
        if name.contains(vendor) {
            info!(vendor = %name, "selected OpenCL platform");
            return Ok(platform);
        }
    }
    Err(HarnessError::PlatformNotFound {
        vendor: vendor.to_string(),
    })
}

#[cfg(feature = "opencl")]
fn first_device(platform: &Platform, class: DeviceClass) -> Result<cl_device_id> {
    let devices = match platform.get_devices(device_type(class)) {
        Ok(devices) => devices,
        Err(ClError(CL_DEVICE_NOT_FOUND)) => Vec::new(),
        Err(err) => return Err(err).native("clGetDeviceIDs"),
    };
    devices.first().copied().ok_or_else(|| HarnessError::DeviceNotFound {
        class: class.to_string(),
        platform: platform.name().unwrap_or_default(),
    })
}

/// Kernel `name` from the first program that defines it.
#[cfg(feature = "opencl")]
fn find_kernel(programs: &[Program], name: &str) -> Result<Kernel> {
    for program in programs {
        match Kernel::create(program, name) {
            Ok(kernel) => return Ok(kernel),
            Err(ClError(CL_INVALID_KERNEL_NAME)) => continue,
            Err(err) => return Err(err).native("clCreateKernel"),
        }
    }
    Err(HarnessError::invalid_config(format!("no program defines kernel {name:?}")))
}

/// Surface the build log and status of a failed build.
#[cfg(feature = "opencl")]
fn build_failure(program: &Program, device_id: cl_device_id, err: ClError) -> HarnessError {
    let log = program.get_build_log(device_id).unwrap_or_default();
    let status = program.get_build_status(device_id).unwrap_or(err.0);
    error!(status, "program build failed:\n{log}");
    HarnessError::Build { status, log }
}

#[cfg(feature = "opencl")]
fn build_from_binaries(
    context: &Context,
    device_id: cl_device_id,
    binaries: &[PathBuf],
    options: &str,
) -> Result<Vec<Program>> {
    binaries
        .iter()
        .map(|path| {
            let binary = fs::read(path).map_err(|source| HarnessError::io(path, source))?;
            #[allow(unused_unsafe)]
            let mut program = unsafe { Program::create_from_binary(context, &[device_id], &[binary.as_slice()]) }
                .native("clCreateProgramWithBinary")?;
            program
                .build(&[device_id], options)
                .map_err(|err| build_failure(&program, device_id, err))?;
            debug!(path = %path.display(), "built program from binary");
            Ok(program)
        })
        .collect()
}

#[cfg(feature = "opencl")]
impl ComputeTarget for AcceleratorTarget {
    type Buffer = ClBuffer;

    fn backend(&self) -> &'static str {
        "opencl"
    }

    fn concurrency_kind(&self) -> ConcurrencyKind {
        match self.settings.device_class {
            DeviceClass::Cpu => ConcurrencyKind::LogicalCores,
            DeviceClass::Gpu | DeviceClass::Accelerator => ConcurrencyKind::Devices,
        }
    }

    fn bind(&mut self, concurrency: Concurrency) -> Result<()> {
        let count = expect_concurrency(self.backend(), self.concurrency_kind(), concurrency)?;
        if self.bound.is_some() {
            warn!("rebinding an already bound accelerator target");
            self.release();
        }

        let platform = find_platform(&self.settings.platform_vendor)?;
        let (device_id, sub_device) = self.select_device(&platform, count)?;
        let device = Device::new(device_id);

        let context = Context::from_device(&device).native("clCreateContext")?;
        let queue = CommandQueue::create_default_with_properties(&context, 0, 0).native("clCreateCommandQueue")?;
        let programs = build_from_binaries(
            &context,
            device_id,
            &self.settings.kernel_binaries,
            &self.settings.build_options,
        )?;

        let name = &self.settings.kernel_name;
        let kernel = find_kernel(&programs, name)?;

        info!(
            device = %device.name().unwrap_or_default(),
            %concurrency,
            kernel = %name,
            "bound accelerator target"
        );
        self.bound = Some(BoundDevice {
            kernel,
            _programs: programs,
            queue,
            context,
            _sub_device: sub_device,
        });
        Ok(())
    }

    fn is_bound(&self) -> bool {
        self.bound.is_some()
    }

    fn release(&mut self) {
        if let Some(bound) = self.bound.take() {
            if let Err(err) = bound.queue.finish() {
                warn!(status = err.0, "clFinish failed during release");
            }
            drop(bound);
            debug!("released accelerator device");
        }
    }

    fn allocate(&mut self, name: &str, elements: usize) -> Result<ClBuffer> {
        let bound = self.bound()?;
        // OpenCL rejects zero-sized buffers.
        let count = elements.max(1);
        let inner = unsafe { Buffer::<cl_double>::create(&bound.context, CL_MEM_READ_WRITE, count, ptr::null_mut()) }
            .native("clCreateBuffer")?;
        debug!(name, elements, "allocated device buffer");
        Ok(ClBuffer { inner, len: elements })
    }

    fn fill_zero(&mut self, buffer: &mut ClBuffer) -> Result<()> {
        let bound = self.bound()?;
        if buffer.len == 0 {
            return Ok(());
        }
        let bytes = buffer.len * std::mem::size_of::<cl_double>();
        let filled = unsafe { bound.queue.enqueue_fill_buffer(&mut buffer.inner, &[0.0], 0, bytes, &[]) };
        if let Err(err) = filled {
            debug!(status = err.0, "fill unavailable, writing zeros");
            let zeros = vec![0.0; buffer.len];
            unsafe { bound.queue.enqueue_write_buffer(&mut buffer.inner, CL_BLOCKING, 0, &zeros, &[]) }
                .native("clEnqueueWriteBuffer")?;
        }
        Ok(())
    }

    fn write(&mut self, buffer: &mut ClBuffer, offset: usize, data: &[f64]) -> Result<()> {
        Self::check_range(buffer, offset, data.len())?;
        let bound = self.bound()?;
        let offset_bytes = offset * std::mem::size_of::<cl_double>();
        unsafe { bound.queue.enqueue_write_buffer(&mut buffer.inner, CL_NON_BLOCKING, offset_bytes, data, &[]) }
            .native("clEnqueueWriteBuffer")?;
        Ok(())
    }

    fn read(&mut self, buffer: &ClBuffer, offset: usize, out: &mut [f64]) -> Result<()> {
        Self::check_range(buffer, offset, out.len())?;
        let bound = self.bound()?;
        let offset_bytes = offset * std::mem::size_of::<cl_double>();
        unsafe { bound.queue.enqueue_read_buffer(&buffer.inner, CL_BLOCKING, offset_bytes, out, &[]) }
            .native("clEnqueueReadBuffer")?;
        Ok(())
    }

    fn set_arg(&mut self, slot: u32, buffer: &ClBuffer) -> Result<()> {
        let bound = self.bound()?;
        unsafe { bound.kernel.set_arg(slot, &buffer.inner.get()) }.native("clSetKernelArg")?;
        Ok(())
    }

    fn launch(&mut self, shape: &LaunchShape, _buffers: &mut [ClBuffer]) -> Result<()> {
        let bound = self.bound()?;
        let items = cl_int::try_from(shape.items)
            .map_err(|_| HarnessError::invalid_config(format!("chunk of {} conditions overflows cl_int", shape.items)))?;
        unsafe { bound.kernel.set_arg(0, &items) }.native("clSetKernelArg")?;

        let global = [shape.global];
        let local = shape.local.map(|width| [width]);
        let local_ptr = local.as_ref().map_or(ptr::null(), |l| l.as_ptr());
        unsafe {
            bound
                .queue
                .enqueue_nd_range_kernel(bound.kernel.get(), 1, ptr::null(), global.as_ptr(), local_ptr, &[])
        }
        .native("clEnqueueNDRangeKernel")?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.bound()?.queue.finish().native("clFinish")
    }
}

#[cfg(feature = "opencl")]
impl Drop for AcceleratorTarget {
    fn drop(&mut self) {
        self.release();
    }
}

/// Build each configured source file for the matched platform and device
/// and write the program binaries to the matching `kernel_binaries` path.
#[cfg(feature = "opencl")]
pub fn compile_kernel_binaries(settings: &AcceleratorSettings) -> Result<()> {
    if settings.kernel_sources.len() != settings.kernel_binaries.len() {
        return Err(HarnessError::invalid_config(format!(
            "{} kernel sources but {} kernel binaries",
            settings.kernel_sources.len(),
            settings.kernel_binaries.len()
        )));
    }
    let platform = find_platform(&settings.platform_vendor)?;
    let device_id = first_device(&platform, settings.device_class)?;
    let device = Device::new(device_id);
    let context = Context::from_device(&device).native("clCreateContext")?;

    for (source_path, binary_path) in settings.kernel_sources.iter().zip(&settings.kernel_binaries) {
        compile_one(&context, device_id, source_path, binary_path, &settings.build_options)?;
    }
    Ok(())
}

#[cfg(feature = "opencl")]
fn compile_one(
    context: &Context,
    device_id: cl_device_id,
    source_path: &Path,
    binary_path: &Path,
    options: &str,
) -> Result<()> {
    let source = fs::read_to_string(source_path).map_err(|source| HarnessError::io(source_path, source))?;
    let mut program = Program::create_from_sources(context, &[source.as_str()]).native("clCreateProgramWithSource")?;
    program
        .build(&[device_id], options)
        .map_err(|err| build_failure(&program, device_id, err))?;

    let binaries = program.get_binaries().native("clGetProgramInfo")?;
    let binary = binaries
        .into_iter()
        .next()
        .ok_or_else(|| HarnessError::Build {
            status: 0,
            log: format!("no binary produced for {}", source_path.display()),
        })?;
    fs::write(binary_path, &binary).map_err(|source| HarnessError::io(binary_path, source))?;
    info!(
        source = %source_path.display(),
        binary = %binary_path.display(),
        bytes = binary.len(),
        "compiled kernel binary"
    );
    Ok(())
}

/// Placeholder when the `opencl` feature is disabled.
#[cfg(not(feature = "opencl"))]
#[derive(Debug)]
pub struct AcceleratorTarget;

#[cfg(not(feature = "opencl"))]
impl AcceleratorTarget {
    pub fn new(_settings: AcceleratorSettings) -> Result<Self> {
        Err(HarnessError::BackendUnavailable(
            "OpenCL backend requires the 'opencl' feature".into(),
        ))
    }
}

#[cfg(not(feature = "opencl"))]
pub fn compile_kernel_binaries(_settings: &AcceleratorSettings) -> Result<()> {
    Err(HarnessError::BackendUnavailable(
        "OpenCL backend requires the 'opencl' feature".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_follow_config() {
        let config = HarnessConfig {
            platform_vendor: "Intel".into(),
            device_class: DeviceClass::Gpu,
            kernel_binaries: vec!["jac.bin".into()],
            ..HarnessConfig::default()
        };
        let settings = AcceleratorSettings::from_config(&config);
        assert_eq!(settings.platform_vendor, "Intel");
        assert_eq!(settings.device_class, DeviceClass::Gpu);
        assert_eq!(settings.kernel_binaries, vec![PathBuf::from("jac.bin")]);
    }

    #[test]
    fn device_count_at_bound_is_rejected() {
        assert!(matches!(
            check_device_request(DeviceClass::Gpu, 2, 2, 0),
            Err(HarnessError::DeviceLimit { requested: 2, max: 2 })
        ));
        assert!(check_device_request(DeviceClass::Gpu, 1, 2, 0).is_ok());
        assert!(check_device_request(DeviceClass::Accelerator, 1, 2, 0).is_ok());
    }

    #[test]
    fn more_than_one_device_is_a_config_error() {
        assert!(matches!(
            check_device_request(DeviceClass::Gpu, 2, 3, 0),
            Err(HarnessError::InvalidConfig(_))
        ));
    }

    #[test]
    fn cpu_request_is_bounded_by_compute_units() {
        assert!(check_device_request(DeviceClass::Cpu, 8, 2, 8).is_ok());
        assert!(matches!(
            check_device_request(DeviceClass::Cpu, 9, 2, 8),
            Err(HarnessError::ComputeUnitLimit { requested: 9, max: 8 })
        ));
    }

    #[cfg(not(feature = "opencl"))]
    #[test]
    fn unavailable_without_feature() {
        let settings = AcceleratorSettings::from_config(&HarnessConfig::default());
        assert!(matches!(
            AcceleratorTarget::new(settings.clone()),
            Err(HarnessError::BackendUnavailable(_))
        ));
        assert!(matches!(
            compile_kernel_binaries(&settings),
            Err(HarnessError::BackendUnavailable(_))
        ));
    }

    #[cfg(feature = "opencl")]
    #[test]
    fn requires_binaries() {
        let settings = AcceleratorSettings::from_config(&HarnessConfig::default());
        assert!(matches!(
            AcceleratorTarget::new(settings),
            Err(HarnessError::InvalidConfig(_))
        ));
    }
}
