//! Typestate wrapper around device buffers.
//!
//! `Queued` → `InFlight` → `Ready`. Output buffers start `Queued`, are
//! `launch`ed when bound to a kernel, and only turn `Ready` with a
//! [`Finished`] proof, which is produced by finishing the queue. Only `Ready`
//! buffers can be read back, so a result can never be read before the device
//! is done writing it.

use std::marker::PhantomData;

#[cfg(feature = "metrics")]
use std::sync::atomic::Ordering;

use crate::{
    ClError,
    backend::{ComputeBackend, MemAccess},
};

// ─── Typ‑State‑Marker ────────────────────────────────────────────────
mod sealed {
    pub trait Sealed {}
}

pub trait State: sealed::Sealed {}

pub struct Queued;
impl sealed::Sealed for Queued {}
impl State for Queued {}

pub struct InFlight;
impl sealed::Sealed for InFlight {}
impl State for InFlight {}

pub struct Ready;
impl sealed::Sealed for Ready {}
impl State for Ready {}

// ─── Fence ───────────────────────────────────────────────────────────

/// Proof that a queue was drained with `finish`.
#[derive(Debug)]
pub struct Finished {
    _private: (),
}

impl Finished {
    /// Blocks until all work on `queue` is complete.
    pub fn wait<B: ComputeBackend>(backend: &B, queue: &B::Queue) -> Result<Self, ClError> {
        backend.finish(queue)?;
        Ok(Self { _private: () })
    }
}

// ─── Allocation counter ──────────────────────────────────────────────

struct AllocTicket {
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    len: usize,
}

impl AllocTicket {
    fn issue(len: usize) -> Self {
        #[cfg(feature = "metrics")]
        {
            crate::ALLOCS.fetch_add(1, Ordering::Relaxed);
            crate::ALLOCS_TOTAL.fetch_add(1, Ordering::Relaxed);
            crate::ALLOC_BYTES.fetch_add(len, Ordering::Relaxed);
        }
        Self { len }
    }
}

#[cfg(feature = "metrics")]
impl Drop for AllocTicket {
    fn drop(&mut self) {
        crate::ALLOCS.fetch_sub(1, Ordering::Relaxed);
        crate::ALLOC_BYTES.fetch_sub(self.len, Ordering::Relaxed);
    }
}

// ─── DeviceBuffer ────────────────────────────────────────────────────

pub struct DeviceBuffer<B: ComputeBackend, S> {
    mem: B::Mem,
    len: usize,
    _ticket: AllocTicket,
    _state: PhantomData<S>,
}

impl<B: ComputeBackend, S> std::fmt::Debug for DeviceBuffer<B, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("len", &self.len)
            .field("state", &std::any::type_name::<S>())
            .finish()
    }
}

impl<B: ComputeBackend, S> DeviceBuffer<B, S> {
    fn create(backend: &B, context: &B::Context, access: MemAccess<'_>) -> Result<Self, ClError> {
        let len = access.len();
        if len == 0 {
            return Err(ClError::InvalidArgument("device buffer size must be non-zero"));
        }
        let mem = backend.create_buffer(context, access)?;
        Ok(Self {
            mem,
            len,
            _ticket: AllocTicket::issue(len),
            _state: PhantomData,
        })
    }

    fn into_state<T>(self) -> DeviceBuffer<B, T> {
        DeviceBuffer {
            mem: self.mem,
            len: self.len,
            _ticket: self._ticket,
            _state: PhantomData,
        }
    }

    /// The backend memory object, for binding as a kernel argument.
    #[inline(always)]
    pub fn raw(&self) -> &B::Mem {
        &self.mem
    }

    /// Size in bytes.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

// ── Queued ───────────────────────────────────────────────────────────
impl<B: ComputeBackend> DeviceBuffer<B, Queued> {
    /// Write-only output buffer of `len` bytes.
    pub fn new(backend: &B, context: &B::Context, len: usize) -> Result<Self, ClError> {
        Self::create(backend, context, MemAccess::WriteOnly(len))
    }

    /// Hands the buffer to a kernel that is about to be enqueued.
    #[inline(always)]
    pub fn launch(self) -> DeviceBuffer<B, InFlight> {
        self.into_state()
    }
}

// ── InFlight ─────────────────────────────────────────────────────────
impl<B: ComputeBackend> DeviceBuffer<B, InFlight> {
    #[inline(always)]
    pub fn into_ready(self, _fence: &Finished) -> DeviceBuffer<B, Ready> {
        self.into_state()
    }
}

// ── Ready ────────────────────────────────────────────────────────────
impl<B: ComputeBackend> DeviceBuffer<B, Ready> {
    /// Read-only input buffer, filled from `host` at creation.
    pub fn from_slice(backend: &B, context: &B::Context, host: &[u8]) -> Result<Self, ClError> {
        Self::create(backend, context, MemAccess::ReadOnly(host))
    }

    /// Blocking copy of the whole buffer into `host_out`.
    pub fn read_into(
        &self,
        backend: &B,
        queue: &B::Queue,
        host_out: &mut [u8],
    ) -> Result<(), ClError> {
        if host_out.len() != self.len {
            return Err(ClError::InvalidArgument("host buffer length differs from device buffer"));
        }
        backend.read_buffer(queue, &self.mem, host_out)
    }
}
