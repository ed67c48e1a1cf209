//! In-process software driver.
//!
//! Implements [`ComputeBackend`] without any GPU: buffers are host byte
//! vectors, kernels run synchronously on `enqueue_kernel` through the same
//! host routines the reducer and matcher expose. Counters in [`SoftStats`]
//! make the session lifecycle observable, and failures can be injected.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicUsize, Ordering},
};

use bytemuck::{Pod, bytes_of, pod_read_unaligned};
use tracing::trace;

use crate::{
    ClError,
    backend::{ComputeBackend, KernelArg, MemAccess},
    matcher::{Image, WindowResult, score_window},
    reduce::ReduceOp,
    session::SLIDE_KERNEL,
};

const CL_INVALID_VALUE: i32 = -30;
const CL_INVALID_KERNEL_NAME: i32 = -46;
const CL_INVALID_KERNEL_ARGS: i32 = -52;
const CL_INVALID_BUFFER_SIZE: i32 = -61;

// ─── Counters ─────────────────────────────────────────────────────────

/// Object counters shared by a [`SoftBackend`] and every handle it creates.
#[derive(Debug, Default)]
pub struct SoftStats {
    contexts_created: AtomicUsize,
    contexts_live: AtomicUsize,
    queues_live: AtomicUsize,
    programs_built: AtomicUsize,
    kernels_live: AtomicUsize,
    buffers_created: AtomicUsize,
    buffers_live: AtomicUsize,
    dispatches: AtomicUsize,
}

impl SoftStats {
    pub fn contexts_created(&self) -> usize {
        self.contexts_created.load(Ordering::SeqCst)
    }

    pub fn contexts_live(&self) -> usize {
        self.contexts_live.load(Ordering::SeqCst)
    }

    pub fn queues_live(&self) -> usize {
        self.queues_live.load(Ordering::SeqCst)
    }

    pub fn programs_built(&self) -> usize {
        self.programs_built.load(Ordering::SeqCst)
    }

    pub fn kernels_live(&self) -> usize {
        self.kernels_live.load(Ordering::SeqCst)
    }

    pub fn buffers_created(&self) -> usize {
        self.buffers_created.load(Ordering::SeqCst)
    }

    pub fn buffers_live(&self) -> usize {
        self.buffers_live.load(Ordering::SeqCst)
    }

    pub fn dispatches(&self) -> usize {
        self.dispatches.load(Ordering::SeqCst)
    }
}

/// Decrements its counter when dropped.
struct Live {
    stats: Arc<SoftStats>,
    counter: fn(&SoftStats) -> &AtomicUsize,
}

impl Live {
    fn new(stats: &Arc<SoftStats>, counter: fn(&SoftStats) -> &AtomicUsize) -> Self {
        counter(stats).fetch_add(1, Ordering::SeqCst);
        Self { stats: Arc::clone(stats), counter }
    }
}

impl std::fmt::Debug for Live {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Live")
    }
}

impl Drop for Live {
    fn drop(&mut self) {
        (self.counter)(&self.stats).fetch_sub(1, Ordering::SeqCst);
    }
}

// ─── Handles ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftPlatform;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftDevice(usize);

#[derive(Debug)]
pub struct SoftContext {
    _live: Live,
}

#[derive(Debug)]
pub struct SoftQueue {
    device: usize,
    _live: Live,
}

#[derive(Debug)]
pub struct SoftProgram {
    source: String,
}

#[derive(Debug)]
pub struct SoftKernel {
    name: String,
    args: Vec<Option<SoftArg>>,
    _live: Live,
}

#[derive(Debug, Clone)]
enum SoftArg {
    Mem(Arc<Mutex<Vec<u8>>>),
    Int(i32),
}

#[derive(Debug)]
pub struct SoftMem {
    bytes: Arc<Mutex<Vec<u8>>>,
    _live: Live,
}

// ─── Backend ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SoftBackend {
    device_names: Vec<String>,
    fail_build: bool,
    stats: Arc<SoftStats>,
}

impl SoftBackend {
    /// One simulated GPU per name.
    pub fn new<I, S>(device_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            device_names: device_names.into_iter().map(Into::into).collect(),
            fail_build: false,
            stats: Arc::default(),
        }
    }

    /// Shares `stats` with other backends, e.g. across session rebuilds.
    pub fn with_stats(mut self, stats: Arc<SoftStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Every program build fails.
    pub fn failing_build(mut self) -> Self {
        self.fail_build = true;
        self
    }

    pub fn stats(&self) -> &Arc<SoftStats> {
        &self.stats
    }
}

fn lock(bytes: &Mutex<Vec<u8>>) -> std::sync::MutexGuard<'_, Vec<u8>> {
    bytes.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_pod<T: Pod>(bytes: &[u8], count: usize) -> Result<Vec<T>, ClError> {
    let size = size_of::<T>();
    let needed = count.checked_mul(size).ok_or(ClError::Api(CL_INVALID_VALUE))?;
    if bytes.len() < needed {
        return Err(ClError::Api(CL_INVALID_VALUE));
    }
    Ok(bytes[..needed].chunks_exact(size).map(pod_read_unaligned).collect())
}

fn write_pod<T: Pod>(bytes: &mut [u8], index: usize, value: &T) -> Result<(), ClError> {
    let size = size_of::<T>();
    let start = index * size;
    let slot = bytes.get_mut(start..start + size).ok_or(ClError::Api(CL_INVALID_VALUE))?;
    slot.copy_from_slice(bytes_of(value));
    Ok(())
}

impl SoftKernel {
    fn int(&self, index: usize) -> Result<i32, ClError> {
        match self.args.get(index) {
            Some(Some(SoftArg::Int(v))) => Ok(*v),
            _ => Err(ClError::Api(CL_INVALID_KERNEL_ARGS)),
        }
    }

    fn mem(&self, index: usize) -> Result<&Arc<Mutex<Vec<u8>>>, ClError> {
        match self.args.get(index) {
            Some(Some(SoftArg::Mem(m))) => Ok(m),
            _ => Err(ClError::Api(CL_INVALID_KERNEL_ARGS)),
        }
    }

    fn run_reduce(&self, op: ReduceOp) -> Result<(), ClError> {
        let n = usize::try_from(self.int(0)?).map_err(|_| ClError::Api(CL_INVALID_VALUE))?;
        let values: Vec<f64> = read_pod(&lock(self.mem(1)?), n)?;
        let result = op.fold(&values);
        write_pod(&mut lock(self.mem(2)?), 0, &result)
    }

    fn run_slide(&self, global_size: usize) -> Result<(), ClError> {
        let dim = |index| {
            usize::try_from(self.int(index)?).map_err(|_| ClError::Api(CL_INVALID_VALUE))
        };
        let (big_w, big_h) = (dim(1)?, dim(2)?);
        let (tpl_w, tpl_h) = (dim(4)?, dim(5)?);
        let (rows, cols) = (dim(6)?, dim(7)?);
        let (stride_x, stride_y) = (dim(8)?, dim(9)?);
        let max_sad = i64::from(self.int(10)?);

        let big_px: Vec<i32> = read_pod(&lock(self.mem(0)?), big_h * big_w)?;
        let tpl_px: Vec<i32> = read_pod(&lock(self.mem(3)?), tpl_h * tpl_w)?;
        let big = Image::new(&big_px, big_h, big_w)?;
        let template = Image::new(&tpl_px, tpl_h, tpl_w)?;

        let mut scores = lock(self.mem(11)?);
        let mut infos = lock(self.mem(12)?);
        for gid in 0..global_size.min(rows * cols) {
            let (row, col) = (gid / cols, gid % cols);
            let hit: WindowResult =
                score_window(&big, &template, col * stride_x, row * stride_y, max_sad);
            write_pod(&mut scores, gid, &hit.score)?;
            write_pod(&mut infos, gid, &hit.geometry())?;
        }
        Ok(())
    }
}

impl ComputeBackend for SoftBackend {
    type Platform = SoftPlatform;
    type Device = SoftDevice;
    type Context = SoftContext;
    type Queue = SoftQueue;
    type Program = SoftProgram;
    type Kernel = SoftKernel;
    type Mem = SoftMem;

    fn platform(&self) -> Result<SoftPlatform, ClError> {
        Ok(SoftPlatform)
    }

    fn gpu_devices(&self, _platform: SoftPlatform) -> Result<Vec<SoftDevice>, ClError> {
        if self.device_names.is_empty() {
            return Err(ClError::NoDevices);
        }
        Ok((0..self.device_names.len()).map(SoftDevice).collect())
    }

    fn create_context(&self, _devices: &[SoftDevice]) -> Result<SoftContext, ClError> {
        self.stats.contexts_created.fetch_add(1, Ordering::SeqCst);
        Ok(SoftContext { _live: Live::new(&self.stats, |s| &s.contexts_live) })
    }

    fn create_queue(&self, _context: &SoftContext, device: SoftDevice) -> Result<SoftQueue, ClError> {
        Ok(SoftQueue { device: device.0, _live: Live::new(&self.stats, |s| &s.queues_live) })
    }

    fn build_program(
        &self,
        _context: &SoftContext,
        _devices: &[SoftDevice],
        source: &str,
    ) -> Result<SoftProgram, ClError> {
        if self.fail_build {
            return Err(ClError::Build("soft backend: build failure injected".into()));
        }
        self.stats.programs_built.fetch_add(1, Ordering::SeqCst);
        Ok(SoftProgram { source: source.to_owned() })
    }

    fn create_kernel(&self, program: &SoftProgram, name: &str) -> Result<SoftKernel, ClError> {
        if !program.source.contains(&format!("void {name}(")) {
            return Err(ClError::Api(CL_INVALID_KERNEL_NAME));
        }
        Ok(SoftKernel {
            name: name.to_owned(),
            args: Vec::new(),
            _live: Live::new(&self.stats, |s| &s.kernels_live),
        })
    }

    fn create_buffer(&self, _context: &SoftContext, access: MemAccess<'_>) -> Result<SoftMem, ClError> {
        let bytes = match access {
            MemAccess::ReadOnly(data) => data.to_vec(),
            MemAccess::WriteOnly(len) => vec![0u8; len],
        };
        if bytes.is_empty() {
            return Err(ClError::Api(CL_INVALID_BUFFER_SIZE));
        }
        self.stats.buffers_created.fetch_add(1, Ordering::SeqCst);
        Ok(SoftMem {
            bytes: Arc::new(Mutex::new(bytes)),
            _live: Live::new(&self.stats, |s| &s.buffers_live),
        })
    }

    fn set_kernel_arg(
        &self,
        kernel: &mut SoftKernel,
        index: u32,
        arg: KernelArg<'_, SoftMem>,
    ) -> Result<(), ClError> {
        let index = index as usize;
        if kernel.args.len() <= index {
            kernel.args.resize(index + 1, None);
        }
        kernel.args[index] = Some(match arg {
            KernelArg::Mem(mem) => SoftArg::Mem(Arc::clone(&mem.bytes)),
            KernelArg::Int(v) => SoftArg::Int(v),
        });
        Ok(())
    }

    fn enqueue_kernel(
        &self,
        queue: &SoftQueue,
        kernel: &SoftKernel,
        global_size: usize,
    ) -> Result<(), ClError> {
        trace!(kernel = %kernel.name, device = queue.device, global_size, "soft dispatch");
        self.stats.dispatches.fetch_add(1, Ordering::SeqCst);
        if kernel.name == SLIDE_KERNEL {
            return kernel.run_slide(global_size);
        }
        match ReduceOp::from_kernel_name(&kernel.name) {
            Some(op) => kernel.run_reduce(op),
            None => Err(ClError::Api(CL_INVALID_KERNEL_NAME)),
        }
    }

    fn finish(&self, _queue: &SoftQueue) -> Result<(), ClError> {
        Ok(())
    }

    fn read_buffer(&self, _queue: &SoftQueue, mem: &SoftMem, out: &mut [u8]) -> Result<(), ClError> {
        let bytes = lock(&mem.bytes);
        let src = bytes.get(..out.len()).ok_or(ClError::Api(CL_INVALID_VALUE))?;
        out.copy_from_slice(src);
        Ok(())
    }

    fn device_name(&self, device: SoftDevice) -> Result<String, ClError> {
        self.device_names.get(device.0).cloned().ok_or(ClError::Api(CL_INVALID_VALUE))
    }
}
