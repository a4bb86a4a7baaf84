//! Chunked batch execution
//!
//! The total condition count is cut into capacity-bounded chunks. Each chunk
//! is copied into the capacity-sized buffers, launched and copied back to the
//! host arrays at its offset.

use jacrun_tracing::perf_span;
use tracing::{debug, trace};

use crate::buffers::BufferManager;
use crate::config::Vectorization;
use crate::error::{HarnessError, Result};
use crate::kernel::KernelSignature;
use crate::layout::{chunk_segments, DataOrder};
use crate::target::{ComputeTarget, LaunchShape};

/// Conditions `[offset, offset + len)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub offset: usize,
    pub len: usize,
}

/// Chunks covering `[0, total)` in order, each of at most `capacity`
/// conditions and never empty.
///
/// # Panics
///
/// Panics if `capacity == 0`.
pub fn chunk_plan(total: usize, capacity: usize) -> impl Iterator<Item = Chunk> {
    assert!(capacity > 0, "chunk capacity must be at least 1");
    (0..total).step_by(capacity).map(move |offset| Chunk {
        offset,
        len: capacity.min(total - offset),
    })
}

/// Host arrays for one batch, matched positionally to the signature's inputs
/// and outputs. All arrays share one [`DataOrder`].
pub struct HostData<'a> {
    pub order: DataOrder,
    pub inputs: Vec<&'a [f64]>,
    pub outputs: Vec<&'a mut [f64]>,
}

impl<'a> HostData<'a> {
    pub fn new(order: DataOrder) -> Self {
        Self {
            order,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn input(mut self, data: &'a [f64]) -> Self {
        self.inputs.push(data);
        self
    }

    pub fn output(mut self, data: &'a mut [f64]) -> Self {
        self.outputs.push(data);
        self
    }

    /// Every array must hold `per_condition * total` values.
    pub fn validate(&self, signature: &KernelSignature, total: usize) -> Result<()> {
        let inputs = signature.args().iter().filter(|arg| arg.is_input());
        let outputs = signature.args().iter().filter(|arg| arg.is_output());
        let expected_inputs = inputs.clone().count();
        let expected_outputs = outputs.clone().count();
        if self.inputs.len() != expected_inputs || self.outputs.len() != expected_outputs {
            return Err(HarnessError::invalid_config(format!(
                "kernel takes {expected_inputs} inputs and {expected_outputs} outputs, host supplied {} and {}",
                self.inputs.len(),
                self.outputs.len()
            )));
        }

        let lens = self
            .inputs
            .iter()
            .map(|a| a.len())
            .chain(self.outputs.iter().map(|a| a.len()));
        for (arg, actual) in inputs.chain(outputs).zip(lens) {
            let expected = arg.per_condition().unwrap_or(0) * total;
            if actual != expected {
                return Err(HarnessError::HostArrayLength {
                    name: arg.name.clone(),
                    expected,
                    actual,
                });
            }
        }
        Ok(())
    }
}

/// Run `total` conditions through `target` in chunks of at most `capacity`.
///
/// Returns the number of chunks launched. The first error aborts the batch;
/// host outputs of chunks that already completed keep their results.
pub fn execute<T: ComputeTarget>(
    target: &mut T,
    buffers: &mut BufferManager<T>,
    total: usize,
    capacity: usize,
    vectorization: Vectorization,
    host: &mut HostData<'_>,
) -> Result<usize> {
    if buffers.capacity() != Some(capacity) {
        return Err(HarnessError::invalid_config(format!(
            "buffers sized for {:?} conditions, batch needs {capacity}",
            buffers.capacity()
        )));
    }
    let (signature, device) = buffers.parts_mut();
    host.validate(signature, total)?;

    let order = host.order;
    let mut chunks = 0;
    for chunk in chunk_plan(total, capacity) {
        let _timer = perf_span!("chunk", offset = chunk.offset, len = chunk.len);

        let mut inputs = host.inputs.iter();
        for (arg, buffer) in signature.args().iter().zip(device.iter_mut()) {
            if !arg.is_input() {
                continue;
            }
            let (Some(src), Some(width)) = (inputs.next(), arg.per_condition()) else {
                continue;
            };
            for seg in chunk_segments(order, chunk.offset, chunk.len, total, capacity, width) {
                target.write(buffer, seg.device_offset, &src[seg.host_offset..seg.host_offset + seg.len])?;
            }
        }

        let shape = LaunchShape::new(chunk.len, capacity, vectorization);
        trace!(?shape, "launching chunk");
        target.launch(&shape, device)?;

        let mut outputs = host.outputs.iter_mut();
        for (arg, buffer) in signature.args().iter().zip(device.iter()) {
            if !arg.is_output() {
                continue;
            }
            let (Some(dst), Some(width)) = (outputs.next(), arg.per_condition()) else {
                continue;
            };
            for seg in chunk_segments(order, chunk.offset, chunk.len, total, capacity, width) {
                target.read(buffer, seg.device_offset, &mut dst[seg.host_offset..seg.host_offset + seg.len])?;
            }
        }
        chunks += 1;
    }

    debug!(total, capacity, chunks, backend = target.backend(), "batch complete");
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn ten_conditions_in_fours() {
        let plan: Vec<_> = chunk_plan(10, 4).collect();
        let offsets: Vec<_> = plan.iter().map(|c| c.offset).collect();
        let sizes: Vec<_> = plan.iter().map(|c| c.len).collect();
        assert_eq!(offsets, [0, 4, 8]);
        assert_eq!(sizes, [4, 4, 2]);
    }

    #[test]
    fn empty_problem_has_no_chunks() {
        assert_eq!(chunk_plan(0, 4).count(), 0);
    }

    #[test]
    fn host_arrays_are_checked_against_signature() {
        let signature = KernelSignature::new().input("x", 2).output("y", 1, false);
        let x = vec![0.0; 6];
        let mut y = vec![0.0; 2];
        let host = HostData::new(DataOrder::ConditionMajor).input(&x).output(&mut y);
        match host.validate(&signature, 3).unwrap_err() {
            HarnessError::HostArrayLength { name, expected, actual } => {
                assert_eq!(name, "y");
                assert_eq!(expected, 3);
                assert_eq!(actual, 2);
            }
            other => panic!("unexpected error: {other}"),
        }

        let host = HostData::new(DataOrder::ConditionMajor).input(&x);
        assert!(matches!(
            host.validate(&signature, 3),
            Err(HarnessError::InvalidConfig(_))
        ));
    }

    proptest! {
        #[test]
        fn chunks_partition_the_range(total in 0usize..5_000, capacity in 1usize..700) {
            let mut next = 0;
            let plan: Vec<_> = chunk_plan(total, capacity).collect();
            for chunk in &plan {
                prop_assert_eq!(chunk.offset, next);
                prop_assert!(chunk.len >= 1 && chunk.len <= capacity);
                next += chunk.len;
            }
            prop_assert_eq!(next, total);
            if let Some(last) = plan.last() {
                prop_assert!(last.len >= 1 && last.len <= capacity);
            }
            prop_assert_eq!(plan.len(), total.div_ceil(capacity));
        }
    }
}
