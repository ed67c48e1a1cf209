//! Device session: platform, devices, shared context, one queue per device,
//! the compiled program and its five kernels.
//!
//! A [`Session`] is either fully built or not there at all. [`SessionCell`]
//! creates it lazily under a mutex, hands out shared references, and drops
//! it on [`SessionCell::dispose`]; the next call builds a fresh one.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, info_span};

use crate::{ClError, backend::ComputeBackend, reduce::ReduceOp};

/// Source of the fixed program built for every device.
pub const PROGRAM_SOURCE: &str = include_str!("kernels.cl");

/// Entry point of the sliding-window kernel.
pub const SLIDE_KERNEL: &str = "slide_k";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelKind {
    Reduce(ReduceOp),
    Slide,
}

impl KernelKind {
    pub fn name(self) -> &'static str {
        match self {
            KernelKind::Reduce(op) => op.kernel_name(),
            KernelKind::Slide => SLIDE_KERNEL,
        }
    }
}

struct KernelSet<K> {
    add: Mutex<K>,
    sub: Mutex<K>,
    mul: Mutex<K>,
    div: Mutex<K>,
    slide: Mutex<K>,
}

impl<K> KernelSet<K> {
    fn extract<B>(backend: &B, program: &B::Program) -> Result<Self, ClError>
    where
        B: ComputeBackend<Kernel = K>,
    {
        let get = |kind: KernelKind| {
            debug!(kernel = kind.name(), "extracting kernel");
            backend.create_kernel(program, kind.name()).map(Mutex::new)
        };
        Ok(Self {
            add: get(KernelKind::Reduce(ReduceOp::Add))?,
            sub: get(KernelKind::Reduce(ReduceOp::Sub))?,
            mul: get(KernelKind::Reduce(ReduceOp::Mul))?,
            div: get(KernelKind::Reduce(ReduceOp::Div))?,
            slide: get(KernelKind::Slide)?,
        })
    }

    fn get(&self, kind: KernelKind) -> &Mutex<K> {
        match kind {
            KernelKind::Reduce(ReduceOp::Add) => &self.add,
            KernelKind::Reduce(ReduceOp::Sub) => &self.sub,
            KernelKind::Reduce(ReduceOp::Mul) => &self.mul,
            KernelKind::Reduce(ReduceOp::Div) => &self.div,
            KernelKind::Slide => &self.slide,
        }
    }
}

/// An initialized device session.
///
/// Fields drop top to bottom: queues, kernels, program, context, devices,
/// and finally the backend itself.
pub struct Session<B: ComputeBackend> {
    queues: Vec<B::Queue>,
    kernels: KernelSet<B::Kernel>,
    program: B::Program,
    context: B::Context,
    devices: Vec<B::Device>,
    #[allow(dead_code)]
    platform: B::Platform,
    backend: B,
}

impl<B: ComputeBackend> Session<B> {
    /// Runs every setup step in order. Whatever was created before a failing
    /// step is released on the way out.
    pub fn open(backend: B) -> Result<Self, ClError> {
        let platform = backend.platform()?;
        let devices = backend.gpu_devices(platform)?;
        debug!(devices = devices.len(), "GPU devices enumerated");

        let context = backend.create_context(&devices)?;
        let queues = devices
            .iter()
            .map(|&device| backend.create_queue(&context, device))
            .collect::<Result<Vec<_>, _>>()?;

        let program = backend.build_program(&context, &devices, PROGRAM_SOURCE)?;
        debug!("program built");
        let kernels = KernelSet::extract(&backend, &program)?;

        Ok(Self { queues, kernels, program, context, devices, platform, backend })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn context(&self) -> &B::Context {
        &self.context
    }

    pub fn program(&self) -> &B::Program {
        &self.program
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn device(&self, index: usize) -> Result<B::Device, ClError> {
        self.devices
            .get(index)
            .copied()
            .ok_or(ClError::DeviceOutOfRange { index: index as i64, count: self.devices.len() })
    }

    /// Command queue of device `index`.
    pub fn queue(&self, index: usize) -> Result<&B::Queue, ClError> {
        self.queues
            .get(index)
            .ok_or(ClError::DeviceOutOfRange { index: index as i64, count: self.queues.len() })
    }

    pub fn device_name(&self, index: usize) -> Result<String, ClError> {
        let device = self.device(index)?;
        self.backend.device_name(device)
    }

    /// Exclusive use of one kernel: argument binding and enqueue of a single
    /// dispatch happen under this guard.
    pub fn lock_kernel(&self, kind: KernelKind) -> MutexGuard<'_, B::Kernel> {
        self.kernels.get(kind).lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ─── SessionCell ─────────────────────────────────────────────────────

type Loader<B> = Box<dyn Fn() -> Result<B, ClError> + Send + Sync>;

/// Lazily-initialized, mutex-guarded home of one [`Session`].
pub struct SessionCell<B: ComputeBackend> {
    loader: Loader<B>,
    slot: Mutex<Option<Arc<Session<B>>>>,
}

impl<B: ComputeBackend> SessionCell<B> {
    /// `loader` binds the backend; it runs once per initialization.
    pub fn new<F>(loader: F) -> Self
    where
        F: Fn() -> Result<B, ClError> + Send + Sync + 'static,
    {
        Self { loader: Box::new(loader), slot: Mutex::new(None) }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<Session<B>>>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the live session, building it first if there is none.
    /// Concurrent first callers wait on the lock; exactly one of them builds.
    pub fn ensure_initialized(&self) -> Result<Arc<Session<B>>, ClError> {
        let mut slot = self.slot();
        if let Some(session) = slot.as_ref() {
            return Ok(Arc::clone(session));
        }

        let span = info_span!("session_init");
        let _enter = span.enter();
        let backend = (self.loader)()?;
        let session = Arc::new(Session::open(backend)?);
        info!(devices = session.device_count(), "device session ready");

        *slot = Some(Arc::clone(&session));
        Ok(session)
    }

    pub fn is_initialized(&self) -> bool {
        self.slot().is_some()
    }

    /// Drops the session. No-op when none exists. Device objects are
    /// released once the last in-flight user lets go of its reference.
    pub fn dispose(&self) {
        let session = self.slot().take();
        if let Some(session) = session {
            let devices = session.device_count();
            drop(session);
            info!(devices, "device session disposed");
        }
    }

    pub fn device_count(&self) -> Result<usize, ClError> {
        Ok(self.ensure_initialized()?.device_count())
    }

    pub fn device_name(&self, index: usize) -> Result<String, ClError> {
        self.ensure_initialized()?.device_name(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft::SoftBackend;

    #[test]
    fn kernel_names_are_in_program_source() {
        let kinds = ReduceOp::ALL
            .into_iter()
            .map(KernelKind::Reduce)
            .chain([KernelKind::Slide]);
        for kind in kinds {
            let signature = format!("__kernel void {}(", kind.name());
            assert!(PROGRAM_SOURCE.contains(&signature), "{} missing", kind.name());
        }
    }

    #[test]
    fn open_builds_one_queue_per_device() {
        let session = Session::open(SoftBackend::new(["a", "b", "c"])).unwrap();
        assert_eq!(session.device_count(), 3);
        assert!(session.queue(2).is_ok());
        assert!(matches!(
            session.queue(3),
            Err(ClError::DeviceOutOfRange { index: 3, count: 3 })
        ));
        assert_eq!(session.device_name(1).unwrap(), "b");
    }

    #[test]
    fn failed_open_releases_partial_state() {
        let backend = SoftBackend::new(["gpu"]).failing_build();
        let stats = Arc::clone(backend.stats());
        assert!(matches!(Session::open(backend), Err(ClError::Build(_))));
        assert_eq!(stats.contexts_created(), 1);
        assert_eq!(stats.contexts_live(), 0);
        assert_eq!(stats.queues_live(), 0);
    }

    #[test]
    fn dispose_on_fresh_cell_is_noop() {
        let cell = SessionCell::new(|| Ok(SoftBackend::new(["gpu"])));
        cell.dispose();
        cell.dispose();
        assert!(!cell.is_initialized());
    }
}
