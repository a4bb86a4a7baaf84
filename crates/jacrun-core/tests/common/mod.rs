//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::io::Write;
use std::sync::Arc;

use jacrun_core::{
    ComputeTarget, Concurrency, ConcurrencyKind, HarnessError, HostKernel, KernelCall, LaunchShape, Result,
};

/// Buffer handle that remembers which argument it was created for.
#[derive(Debug)]
pub struct RecordedBuffer {
    pub id: usize,
    pub name: String,
    pub data: Vec<f64>,
}

/// Everything a [`RecordingTarget`] was asked to do.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Bind(Concurrency),
    Release,
    Allocate { name: String, elements: usize },
    Free { name: String },
    FillZero { name: String },
    Write { name: String, offset: usize, len: usize },
    Read { name: String, offset: usize, len: usize },
    SetArg { slot: u32, name: String },
    Launch(LaunchShape),
}

/// Host target that runs a [`HostKernel`] inline and logs every call.
pub struct RecordingTarget {
    kernel: Arc<dyn HostKernel>,
    bound: Option<Concurrency>,
    next_id: usize,
    pub events: Vec<Event>,
}

impl RecordingTarget {
    pub fn new(kernel: impl HostKernel + 'static) -> Self {
        Self {
            kernel: Arc::new(kernel),
            bound: None,
            next_id: 0,
            events: Vec::new(),
        }
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.iter().filter(|e| pred(e)).count()
    }

    pub fn binds(&self) -> usize {
        self.count(|e| matches!(e, Event::Bind(_)))
    }

    pub fn allocations(&self) -> usize {
        self.count(|e| matches!(e, Event::Allocate { .. }))
    }

    pub fn releases(&self) -> usize {
        self.count(|e| matches!(e, Event::Release))
    }

    pub fn writes_to(&self, name: &str) -> usize {
        self.count(|e| matches!(e, Event::Write { name: n, .. } if n == name))
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

impl ComputeTarget for RecordingTarget {
    type Buffer = RecordedBuffer;

    fn backend(&self) -> &'static str {
        "recording"
    }

    fn concurrency_kind(&self) -> ConcurrencyKind {
        ConcurrencyKind::Threads
    }

    fn bind(&mut self, concurrency: Concurrency) -> Result<()> {
        jacrun_core::target::expect_concurrency(self.backend(), self.concurrency_kind(), concurrency)?;
        self.events.push(Event::Bind(concurrency));
        self.bound = Some(concurrency);
        Ok(())
    }

    fn is_bound(&self) -> bool {
        self.bound.is_some()
    }

    fn release(&mut self) {
        if self.bound.take().is_some() {
            self.events.push(Event::Release);
        }
    }

    fn allocate(&mut self, name: &str, elements: usize) -> Result<RecordedBuffer> {
        self.events.push(Event::Allocate {
            name: name.to_string(),
            elements,
        });
        self.next_id += 1;
        Ok(RecordedBuffer {
            id: self.next_id,
            name: name.to_string(),
            data: vec![f64::NAN; elements],
        })
    }

    fn free(&mut self, buffer: RecordedBuffer) {
        self.events.push(Event::Free { name: buffer.name });
    }

    fn fill_zero(&mut self, buffer: &mut RecordedBuffer) -> Result<()> {
        self.events.push(Event::FillZero {
            name: buffer.name.clone(),
        });
        buffer.data.fill(0.0);
        Ok(())
    }

    fn write(&mut self, buffer: &mut RecordedBuffer, offset: usize, data: &[f64]) -> Result<()> {
        self.events.push(Event::Write {
            name: buffer.name.clone(),
            offset,
            len: data.len(),
        });
        buffer.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read(&mut self, buffer: &RecordedBuffer, offset: usize, out: &mut [f64]) -> Result<()> {
        self.events.push(Event::Read {
            name: buffer.name.clone(),
            offset,
            len: out.len(),
        });
        out.copy_from_slice(&buffer.data[offset..offset + out.len()]);
        Ok(())
    }

    fn set_arg(&mut self, slot: u32, buffer: &RecordedBuffer) -> Result<()> {
        self.events.push(Event::SetArg {
            slot,
            name: buffer.name.clone(),
        });
        Ok(())
    }

    fn launch(&mut self, shape: &LaunchShape, buffers: &mut [RecordedBuffer]) -> Result<()> {
        if self.bound.is_none() {
            return Err(HarnessError::NotBound);
        }
        self.events.push(Event::Launch(*shape));
        let mut args: Vec<Vec<f64>> = buffers.iter_mut().map(|b| std::mem::take(&mut b.data)).collect();
        let result = self.kernel.execute(KernelCall {
            problem_size: shape.items,
            capacity: shape.capacity,
            args: &mut args,
        });
        for (buffer, data) in buffers.iter_mut().zip(args) {
            buffer.data = data;
        }
        result
    }

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Write `records` as a raw condition file.
pub fn condition_file(records: &[Vec<f64>]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    for record in records {
        file.write_all(bytemuck::cast_slice::<f64, u8>(record)).unwrap();
    }
    file.flush().unwrap();
    file
}
