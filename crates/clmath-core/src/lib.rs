//! OpenCL compute backend, bound to the driver at runtime.
//!
//! One device session per process: the driver library is loaded lazily, a
//! fixed program (four reductions and a sliding-window matcher) is built for
//! every GPU on the first platform, and the results are handed back as plain
//! data. The [`ffi`] module exposes the same operations as a flat C ABI.

// ─── Feature‑Module ───────────────────────────────────────────────────
#[cfg(feature = "metrics")]
mod metrics;
#[cfg(feature = "metrics")]
pub use metrics::*;

pub mod backend;
pub mod buffer;
pub mod config;
pub mod ffi;
pub mod loader;
pub mod matcher;
pub mod reduce;
pub mod session;
pub mod soft;

pub use backend::{ComputeBackend, KernelArg, MemAccess};
pub use buffer::{DeviceBuffer, Finished, InFlight, Queued, Ready};
pub use config::BackendConfig;
pub use loader::{ClApi, DynamicBackend, is_driver_available};
pub use matcher::{Image, WindowResult, WindowTiling, search, search_host, search_on};
pub use reduce::{ReduceOp, reduce};
pub use session::{Session, SessionCell};
pub use soft::{SoftBackend, SoftStats};

// ─── Fehler‑Typ & cl_try! ─────────────────────────────────────────────
#[derive(thiserror::Error, Debug)]
pub enum ClError {
    #[error("OpenCL API error: {0}")]
    Api(i32),
    #[error("no OpenCL driver library could be loaded (tried {0})")]
    LibraryNotFound(String),
    #[error("OpenCL driver is missing entry point `{0}`")]
    MissingSymbol(&'static str),
    #[error("no OpenCL platform available")]
    NoPlatform,
    #[error("no GPU device found on the OpenCL platform")]
    NoDevices,
    #[error("program build failed: {0}")]
    Build(String),
    #[error("device index {index} out of range (0..{count})")]
    DeviceOutOfRange { index: i64, count: usize },
    #[error("reduction input is empty")]
    EmptyInput,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// Makro: wandelt cl_int in Result
macro_rules! cl_try {
    ($expr:expr) => {
        let err = unsafe { $expr };
        if err != 0 {
            return Err(crate::ClError::Api(err));
        }
    };
}
pub(crate) use cl_try;

impl From<i32> for ClError {
    #[inline]
    fn from(code: i32) -> Self {
        ClError::Api(code)
    }
}
