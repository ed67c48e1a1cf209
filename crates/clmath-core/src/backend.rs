//! The driver capability the session is built on.
//!
//! One method per driver entry point the session needs. Handles are
//! associated types and release their driver object when dropped, so the
//! order in which a struct declares its handles is the order they are
//! released in.

use crate::ClError;

/// How a device buffer is created.
#[derive(Debug, Clone, Copy)]
pub enum MemAccess<'a> {
    /// Read-only for kernels, filled from the host slice at creation.
    ReadOnly(&'a [u8]),
    /// Write-only for kernels, `len` bytes, contents undefined until written.
    WriteOnly(usize),
}

impl MemAccess<'_> {
    pub fn len(&self) -> usize {
        match self {
            MemAccess::ReadOnly(data) => data.len(),
            MemAccess::WriteOnly(len) => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A single kernel argument.
#[derive(Debug)]
pub enum KernelArg<'a, M> {
    Mem(&'a M),
    Int(i32),
}

pub trait ComputeBackend: Send + Sync + Sized {
    type Platform: Copy + Send + Sync;
    type Device: Copy + Send + Sync;
    type Context: Send + Sync;
    type Queue: Send + Sync;
    type Program: Send + Sync;
    type Kernel: Send;
    type Mem: Send + Sync;

    /// First platform reported by the driver.
    fn platform(&self) -> Result<Self::Platform, ClError>;

    /// All GPU-class devices of `platform`, in driver order.
    fn gpu_devices(&self, platform: Self::Platform) -> Result<Vec<Self::Device>, ClError>;

    fn create_context(&self, devices: &[Self::Device]) -> Result<Self::Context, ClError>;

    fn create_queue(
        &self,
        context: &Self::Context,
        device: Self::Device,
    ) -> Result<Self::Queue, ClError>;

    /// Compiles `source` for every device in `devices`.
    fn build_program(
        &self,
        context: &Self::Context,
        devices: &[Self::Device],
        source: &str,
    ) -> Result<Self::Program, ClError>;

    fn create_kernel(&self, program: &Self::Program, name: &str) -> Result<Self::Kernel, ClError>;

    fn create_buffer(
        &self,
        context: &Self::Context,
        access: MemAccess<'_>,
    ) -> Result<Self::Mem, ClError>;

    fn set_kernel_arg(
        &self,
        kernel: &mut Self::Kernel,
        index: u32,
        arg: KernelArg<'_, Self::Mem>,
    ) -> Result<(), ClError>;

    /// Enqueues a 1-D range of `global_size` work-items. Does not wait.
    fn enqueue_kernel(
        &self,
        queue: &Self::Queue,
        kernel: &Self::Kernel,
        global_size: usize,
    ) -> Result<(), ClError>;

    /// Blocks until everything enqueued on `queue` has completed.
    fn finish(&self, queue: &Self::Queue) -> Result<(), ClError>;

    /// Blocking read of `out.len()` bytes from the start of `mem`.
    fn read_buffer(
        &self,
        queue: &Self::Queue,
        mem: &Self::Mem,
        out: &mut [u8],
    ) -> Result<(), ClError>;

    fn device_name(&self, device: Self::Device) -> Result<String, ClError>;
}
