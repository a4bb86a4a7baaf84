//! End-to-end dispatch from a condition file through both data orders.

mod common;

use common::{condition_file, Event, RecordingTarget};
use jacrun_core::{
    load_conditions, ByteSize, Concurrency, ControllerSettings, DataOrder, HarnessError, HostData, KernelCall,
    KernelSignature, LifecycleController, OutputWriter, Result, ThreadedTarget, Vectorization,
};

const NS: usize = 3;

/// `out[i] = T + P + sum(conc)`, reading `conc` in either layout with the
/// device stride `capacity`.
fn summing_kernel(order: DataOrder) -> impl Fn(KernelCall<'_>) -> Result<()> + Send + Sync {
    move |call: KernelCall<'_>| {
        let n = call.problem_size;
        let cap = call.capacity;
        for i in 0..n {
            let conc: f64 = (0..NS).map(|j| call.args[2][order.index(i, j, cap, NS)]).sum();
            call.args[3][i] = call.args[0][i] + call.args[1][i] + conc;
        }
        Ok(())
    }
}

fn records(num: usize) -> Vec<Vec<f64>> {
    (0..num)
        .map(|i| {
            let i = i as f64;
            vec![300.0 + i, 1e5 + i, 0.1 * i, 0.2 * i, 0.3 * i]
        })
        .collect()
}

fn expected(num: usize) -> Vec<f64> {
    records(num)
        .iter()
        .map(|r| r[0] + r[1] + r[2..].iter().sum::<f64>())
        .collect()
}

fn writes_to(events: &[Event], name: &str) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, Event::Write { name: n, .. } if n == name))
        .count()
}

fn settings(max_per_run: usize) -> ControllerSettings {
    ControllerSettings {
        max_per_run,
        vectorization: Vectorization::Parallel,
        array_ceiling: ByteSize(1 << 30),
    }
}

fn dispatch(native: DataOrder, requested: DataOrder, num: usize, max_per_run: usize) -> (Vec<f64>, Vec<Event>) {
    let file = condition_file(&records(num));
    let set = load_conditions(file.path(), num, NS, native, requested).unwrap();

    let signature = KernelSignature::with_conditions(NS).output("sum", 1, false);
    let target = RecordingTarget::new(summing_kernel(set.order));
    let mut controller = LifecycleController::new(target, signature, settings(max_per_run)).unwrap();

    let mut out = vec![0.0; num];
    let mut host = HostData::new(set.order)
        .input(&set.temperature)
        .input(&set.pressure)
        .input(&set.concentrations)
        .output(&mut out);
    controller.run(num, Concurrency::Threads(1), &mut host).unwrap();
    drop(host);

    (out, controller.target().events.clone())
}

#[test]
fn condition_major_matches_reference() {
    let (out, events) = dispatch(DataOrder::ConditionMajor, DataOrder::ConditionMajor, 10, 4);
    assert_eq!(out, expected(10));
    // one block per chunk for conc
    assert_eq!(writes_to(&events, "conc"), 3);
}

#[test]
fn species_major_matches_reference() {
    let (out, events) = dispatch(DataOrder::ConditionMajor, DataOrder::SpeciesMajor, 10, 4);
    assert_eq!(out, expected(10));
    // one segment per species plane per chunk
    assert_eq!(writes_to(&events, "conc"), 3 * NS);
    assert!(events.contains(&Event::Write {
        name: "conc".into(),
        offset: 4,
        len: 2,
    }));
}

#[test]
fn chunk_launches_cover_problem() {
    let (_, events) = dispatch(DataOrder::ConditionMajor, DataOrder::ConditionMajor, 10, 4);
    let items: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            Event::Launch(shape) => Some((shape.items, shape.capacity)),
            _ => None,
        })
        .collect();
    assert_eq!(items, [(4, 4), (4, 4), (2, 4)]);
}

#[test]
fn threaded_target_runs_wide_vectorization() {
    let num = 37;
    let file = condition_file(&records(num));
    let set = load_conditions(file.path(), num, NS, DataOrder::ConditionMajor, DataOrder::SpeciesMajor).unwrap();

    let signature = KernelSignature::with_conditions(NS).output("sum", 1, false);
    let target = ThreadedTarget::new(summing_kernel(set.order)).with_max_threads(2);
    let settings = ControllerSettings {
        vectorization: Vectorization::Wide { width: 4 },
        ..settings(16)
    };
    let mut controller = LifecycleController::new(target, signature, settings).unwrap();

    let mut out = vec![0.0; num];
    let mut host = HostData::new(set.order)
        .input(&set.temperature)
        .input(&set.pressure)
        .input(&set.concentrations)
        .output(&mut out);
    let report = controller.run(num, Concurrency::Threads(2), &mut host).unwrap();
    drop(host);

    assert_eq!(report.chunks, 3);
    assert_eq!(out, expected(num));
}

#[test]
fn kernel_failure_aborts_batch_after_completed_chunks() {
    let failing = |call: KernelCall<'_>| -> Result<()> {
        if call.args[0][0] >= 4.0 {
            return Err(HarnessError::Kernel {
                name: "failing".into(),
                status: 7,
            });
        }
        let n = call.problem_size;
        let (input, output) = call.args.split_at_mut(1);
        output[0][..n].copy_from_slice(&input[0][..n]);
        Ok(())
    };
    let signature = KernelSignature::new().input("x", 1).output("y", 1, false);
    let mut controller = LifecycleController::new(RecordingTarget::new(failing), signature, settings(2)).unwrap();

    let x: Vec<f64> = (0..6).map(f64::from).collect();
    let mut y = vec![-1.0; 6];
    let mut host = HostData::new(DataOrder::ConditionMajor).input(&x).output(&mut y);
    let err = controller.run(6, Concurrency::Threads(1), &mut host).unwrap_err();
    drop(host);

    assert!(matches!(err, HarnessError::Kernel { status: 7, .. }));
    assert_eq!(y, [0.0, 1.0, 2.0, 3.0, -1.0, -1.0]);
}

#[test]
fn outputs_written_in_configured_order() {
    let dir = tempfile::tempdir().unwrap();
    let writer = OutputWriter::new(dir.path(), DataOrder::ConditionMajor, DataOrder::SpeciesMajor, 2);
    let path = writer.write("jac", 2, &[1.0, 2.0, 3.0, 4.0]).unwrap();
    let values = jacrun_core::kernel::read_f64_file(&path).unwrap();
    assert_eq!(values, [1.0, 3.0, 2.0, 4.0]);
}
