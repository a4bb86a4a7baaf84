//! `jacrun`: run a batched kernel over a condition file and print timings.
//!
//! ```text
//! jacrun <problem_size> <concurrency> [compile] [--backend threaded|opencl] [--config harness.json]
//! ```
//!
//! Prints one CSV line `problem_size,compilation_time,setup_time,runtime`
//! (milliseconds) on stdout. Logs go to stderr.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{ArgAction, Parser};
use jacrun_core::target::compile_kernel_binaries;
use jacrun_core::{
    load_conditions, AcceleratorSettings, AcceleratorTarget, BackendKind, ComputeTarget, ConditionSet, Concurrency,
    ControllerSettings, DylibKernel, HarnessConfig, HarnessError, HostData, KernelSignature, LifecycleController,
    OutputWriter, Result, RunReport, ThreadedTarget,
};
use jacrun_tracing::{init_global_tracing, timed_block, TracingConfig};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "jacrun", version, about = "Batch dispatch harness for per-condition chemistry kernels")]
struct Cli {
    /// Number of conditions to evaluate
    problem_size: usize,

    /// Threads (threaded), logical cores (OpenCL CPU) or devices (OpenCL GPU)
    concurrency: usize,

    /// Compile kernel sources to binaries first: 0/1/true/false (OpenCL only)
    #[arg(action = ArgAction::Set, default_value = "1", value_parser = parse_flag)]
    compile: bool,

    /// Execution backend: threaded or opencl
    #[arg(long, default_value = "threaded", value_parser = parse_backend)]
    backend: BackendKind,

    /// JSON configuration file (defaults to $JACRUN_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn parse_backend(raw: &str) -> std::result::Result<BackendKind, String> {
    raw.parse().map_err(|err: HarnessError| err.to_string())
}

fn parse_flag(raw: &str) -> std::result::Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        other => Err(format!("expected 0, 1, true or false, got {other:?}")),
    }
}

/// Wall-clock phases reported on stdout.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Timings {
    problem_size: usize,
    compilation: Option<Duration>,
    setup: Duration,
    runtime: Duration,
}

impl Timings {
    fn csv(&self) -> String {
        let ms = |d: Duration| d.as_secs_f64() * 1e3;
        let compilation = match self.compilation {
            Some(d) => format!("{:.6}", ms(d)),
            None => "-1".to_string(),
        };
        format!(
            "{},{},{:.6},{:.6}",
            self.problem_size,
            compilation,
            ms(self.setup),
            ms(self.runtime)
        )
    }
}

fn load_config(cli: &Cli) -> Result<HarnessConfig> {
    let config = match &cli.config {
        Some(path) => {
            let mut config = HarnessConfig::from_file(path)?;
            config.apply_env_overrides()?;
            config
        }
        None => HarnessConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

/// Run the controller once and write the configured outputs.
fn execute<T: ComputeTarget>(
    target: T,
    config: &HarnessConfig,
    set: &ConditionSet,
    concurrency: usize,
) -> Result<RunReport> {
    let signature = KernelSignature::from_config(config)?;
    let concurrency = Concurrency::of_kind(target.concurrency_kind(), concurrency);
    let mut controller = LifecycleController::new(target, signature, ControllerSettings::from_config(config))?;

    let mut outputs: Vec<Vec<f64>> = config
        .outputs
        .iter()
        .map(|spec| vec![0.0; spec.per_condition * set.num])
        .collect();
    let mut host = HostData::new(set.order)
        .input(&set.temperature)
        .input(&set.pressure)
        .input(&set.concentrations);
    for output in outputs.iter_mut() {
        host = host.output(output);
    }

    let report = controller.run(set.num, concurrency, &mut host)?;
    drop(host);
    controller.teardown();

    let writer = OutputWriter::new(&config.output_dir, set.order, config.data_order, set.num);
    for (spec, data) in config.outputs.iter().zip(&outputs) {
        writer.write(&spec.name, spec.per_condition, data)?;
    }
    Ok(report)
}

fn run(cli: &Cli) -> Result<Timings> {
    if cli.problem_size == 0 {
        return Err(HarnessError::invalid_config("problem_size must be at least 1"));
    }
    let config = load_config(cli)?;
    info!(backend = %cli.backend, problem_size = cli.problem_size, concurrency = cli.concurrency, "starting");

    let mut compilation = None;
    if cli.backend == BackendKind::OpenCl && cli.compile {
        if config.kernel_sources.is_empty() {
            warn!("compile requested but no kernel_sources configured, skipping");
        } else {
            let settings = AcceleratorSettings::from_config(&config);
            let (result, elapsed) = timed_block!("compile", { compile_kernel_binaries(&settings) });
            result?;
            compilation = Some(elapsed);
        }
    }

    let set = load_conditions(
        &config.input,
        cli.problem_size,
        config.num_species,
        config.native_order,
        config.data_order,
    )?;

    let report = match cli.backend {
        BackendKind::Threaded => {
            let library = config
                .library
                .as_ref()
                .ok_or_else(|| HarnessError::invalid_config("threaded backend needs `library`"))?;
            let kernel = DylibKernel::open(library, &config.symbol)?;
            execute(ThreadedTarget::new(kernel), &config, &set, cli.concurrency)?
        }
        BackendKind::OpenCl => {
            let target = AcceleratorTarget::new(AcceleratorSettings::from_config(&config))?;
            execute_accelerator(target, &config, &set, cli.concurrency)?
        }
    };

    Ok(Timings {
        problem_size: cli.problem_size,
        compilation,
        setup: report.setup,
        runtime: report.runtime,
    })
}

#[cfg(feature = "opencl")]
fn execute_accelerator(
    target: AcceleratorTarget,
    config: &HarnessConfig,
    set: &ConditionSet,
    concurrency: usize,
) -> Result<RunReport> {
    execute(target, config, set, concurrency)
}

#[cfg(not(feature = "opencl"))]
fn execute_accelerator(
    _target: AcceleratorTarget,
    _config: &HarnessConfig,
    _set: &ConditionSet,
    _concurrency: usize,
) -> Result<RunReport> {
    Err(HarnessError::BackendUnavailable(
        "rebuild jacrun with the 'opencl' feature".into(),
    ))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = init_global_tracing(&TracingConfig::from_env()) {
        eprintln!("jacrun: tracing disabled: {err}");
    }

    match run(&cli) {
        Ok(timings) => {
            println!("{}", timings.csv());
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "jacrun failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn compile_flag_defaults_on() {
        let cli = Cli::try_parse_from(["jacrun", "1000", "4"]).unwrap();
        assert_eq!(cli.problem_size, 1000);
        assert_eq!(cli.concurrency, 4);
        assert!(cli.compile);
        assert_eq!(cli.backend, BackendKind::Threaded);
    }

    #[test]
    fn compile_flag_accepts_words_and_digits() {
        for (raw, expected) in [("0", false), ("false", false), ("1", true), ("TRUE", true)] {
            let cli = Cli::try_parse_from(["jacrun", "10", "1", raw, "--backend", "opencl"]).unwrap();
            assert_eq!(cli.compile, expected, "{raw}");
            assert_eq!(cli.backend, BackendKind::OpenCl);
        }
        assert!(Cli::try_parse_from(["jacrun", "10", "1", "maybe"]).is_err());
    }

    #[test]
    fn compile_flag_can_be_turned_off_positionally() {
        let cli = Cli::try_parse_from(["jacrun", "10", "1", "0"]).unwrap();
        assert!(!cli.compile);
        assert_eq!(cli.problem_size, 10);
    }

    #[test]
    fn backend_accepts_aliases_and_rejects_unknown() {
        let cli = Cli::try_parse_from(["jacrun", "10", "1", "--backend", "ocl"]).unwrap();
        assert_eq!(cli.backend, BackendKind::OpenCl);
        let cli = Cli::try_parse_from(["jacrun", "10", "1", "--backend", "openmp"]).unwrap();
        assert_eq!(cli.backend, BackendKind::Threaded);
        assert!(Cli::try_parse_from(["jacrun", "10", "1", "--backend", "cuda"]).is_err());
    }

    #[test]
    fn csv_reports_skipped_compile_as_minus_one() {
        let timings = Timings {
            problem_size: 64,
            compilation: None,
            setup: Duration::from_micros(1500),
            runtime: Duration::from_millis(20),
        };
        assert_eq!(timings.csv(), "64,-1,1.500000,20.000000");

        let compiled = Timings {
            compilation: Some(Duration::from_millis(3)),
            ..timings
        };
        assert_eq!(compiled.csv(), "64,3.000000,1.500000,20.000000");
    }

    #[test]
    fn threaded_run_without_library_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("data.bin");
        std::fs::write(&input, [0u8; 32]).unwrap();
        let config = dir.path().join("harness.json");
        std::fs::write(
            &config,
            format!(r#"{{"num_species": 2, "input": {:?}}}"#, input.display().to_string()),
        )
        .unwrap();

        let cli = Cli::try_parse_from([
            "jacrun".to_string(),
            "1".to_string(),
            "1".to_string(),
            "--config".to_string(),
            config.display().to_string(),
        ])
        .unwrap();
        let err = run(&cli).unwrap_err();
        assert!(matches!(err, HarnessError::InvalidConfig(msg) if msg.contains("library")));
    }

    #[test]
    fn zero_problem_size_is_rejected() {
        let cli = Cli::try_parse_from(["jacrun", "0", "1"]).unwrap();
        assert!(matches!(run(&cli), Err(HarnessError::InvalidConfig(_))));
    }
}
