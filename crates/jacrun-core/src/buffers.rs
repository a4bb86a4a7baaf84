//! Kernel argument buffers
//!
//! [`BufferManager`] owns one buffer per signature argument, sized for the
//! current batch capacity. Each `allocate` starts a new epoch: constants are
//! written and zero-initialized buffers cleared exactly once per epoch, and
//! every buffer is bound to its kernel slot before `allocate` returns.

use tracing::{debug, info};

use crate::config::ByteSize;
use crate::error::{HarnessError, Result};
use crate::kernel::{ArgKind, KernelSignature};
use crate::target::ComputeTarget;

const F64_BYTES: u64 = std::mem::size_of::<f64>() as u64;

/// Owner of all buffer handles for one target.
pub struct BufferManager<T: ComputeTarget> {
    signature: KernelSignature,
    ceiling: ByteSize,
    buffers: Vec<T::Buffer>,
    capacity: Option<usize>,
    epoch: u64,
}

impl<T: ComputeTarget> BufferManager<T> {
    pub fn new(signature: KernelSignature, ceiling: ByteSize) -> Self {
        Self {
            signature,
            ceiling,
            buffers: Vec::new(),
            capacity: None,
            epoch: 0,
        }
    }

    pub fn signature(&self) -> &KernelSignature {
        &self.signature
    }

    /// Capacity of the live allocation.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Number of completed allocations.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_allocated(&self) -> bool {
        self.capacity.is_some()
    }

    pub fn buffers(&self) -> &[T::Buffer] {
        &self.buffers
    }

    /// Signature and buffers, borrowed together.
    pub fn parts_mut(&mut self) -> (&KernelSignature, &mut [T::Buffer]) {
        (&self.signature, &mut self.buffers)
    }

    /// Reject any argument whose buffer would exceed the byte ceiling.
    pub fn check_ceiling(&self, capacity: usize) -> Result<()> {
        for arg in self.signature.args() {
            let bytes = arg.elements(capacity) as u64 * F64_BYTES;
            if bytes > self.ceiling.bytes() {
                return Err(HarnessError::BufferCeiling {
                    name: arg.name.clone(),
                    bytes,
                    ceiling: self.ceiling.bytes(),
                });
            }
        }
        Ok(())
    }

    /// Allocate, initialize and bind every argument buffer for `capacity`
    /// conditions. A live allocation is released first.
    ///
    /// On error the buffers created so far stay owned by the manager until
    /// [`Self::release`].
    pub fn allocate(&mut self, target: &mut T, capacity: usize) -> Result<()> {
        if !self.buffers.is_empty() {
            self.release(target);
        }
        self.check_ceiling(capacity)?;

        for arg in self.signature.args() {
            let buffer = target.allocate(&arg.name, arg.elements(capacity))?;
            self.buffers.push(buffer);
        }

        for (index, (arg, buffer)) in self.signature.args().iter().zip(self.buffers.iter_mut()).enumerate() {
            if let ArgKind::Constant(data) = &arg.kind {
                target.write(buffer, 0, data)?;
            }
            if arg.zero_init() {
                target.fill_zero(buffer)?;
            }
            target.set_arg(KernelSignature::slot(index), buffer)?;
        }
        target.finish()?;

        self.capacity = Some(capacity);
        self.epoch += 1;
        info!(
            backend = target.backend(),
            capacity,
            buffers = self.signature.len(),
            epoch = self.epoch,
            "allocated kernel buffers"
        );
        Ok(())
    }

    /// Free everything the last `allocate` created. Safe to call repeatedly.
    pub fn release(&mut self, target: &mut T) {
        if self.buffers.is_empty() && self.capacity.is_none() {
            return;
        }
        let count = self.buffers.len();
        for buffer in self.buffers.drain(..) {
            target.free(buffer);
        }
        self.capacity = None;
        debug!(backend = target.backend(), count, "released kernel buffers");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelCall;
    use crate::target::ThreadedTarget;

    fn target() -> ThreadedTarget {
        ThreadedTarget::new(|_: KernelCall<'_>| -> Result<()> { Ok(()) })
    }

    #[test]
    fn sizes_per_condition_and_constant_buffers() {
        let signature = KernelSignature::with_conditions(3)
            .output("jac", 16, false)
            .constant("A", vec![1.0, 2.0])
            .scratch("work", 5);
        let mut target = target();
        let mut manager = BufferManager::new(signature, ByteSize(1 << 20));

        manager.allocate(&mut target, 8).unwrap();
        let lens: Vec<_> = manager.buffers().iter().map(Vec::len).collect();
        assert_eq!(lens, [8, 8, 24, 128, 2, 40]);
        assert_eq!(manager.buffers()[4], vec![1.0, 2.0]);
        assert_eq!(manager.capacity(), Some(8));
        assert_eq!(manager.epoch(), 1);
    }

    #[test]
    fn ceiling_is_checked_before_allocating() {
        let signature = KernelSignature::with_conditions(100);
        let mut target = target();
        // conc at capacity 10 needs 8000 bytes
        let mut manager = BufferManager::new(signature, ByteSize(7999));

        let err = manager.allocate(&mut target, 10).unwrap_err();
        match err {
            HarnessError::BufferCeiling { name, bytes, ceiling } => {
                assert_eq!(name, "conc");
                assert_eq!(bytes, 8000);
                assert_eq!(ceiling, 7999);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(manager.buffers().is_empty());
        assert!(!manager.is_allocated());
    }

    #[test]
    fn reallocation_zeroes_scratch_again() {
        let signature = KernelSignature::new().scratch("work", 2);
        let mut target = target();
        let mut manager = BufferManager::new(signature, ByteSize(1 << 20));

        manager.allocate(&mut target, 4).unwrap();
        manager.parts_mut().1[0].fill(9.0);
        manager.allocate(&mut target, 2).unwrap();
        assert_eq!(manager.buffers()[0], vec![0.0; 4]);
        assert_eq!(manager.epoch(), 2);
    }

    #[test]
    fn release_is_idempotent() {
        let mut target = target();
        let mut manager = BufferManager::new(KernelSignature::with_conditions(2), ByteSize(1 << 20));
        manager.release(&mut target);
        manager.allocate(&mut target, 4).unwrap();
        manager.release(&mut target);
        manager.release(&mut target);
        assert!(manager.buffers().is_empty());
        assert_eq!(manager.capacity(), None);
    }
}
