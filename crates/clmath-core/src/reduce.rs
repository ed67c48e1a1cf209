//! Single-device folds over a sequence of doubles.

#[cfg(feature = "metrics")]
use std::time::Instant;

use crate::{
    ClError,
    backend::{ComputeBackend, KernelArg},
    buffer::{DeviceBuffer, Finished, Queued, Ready},
    session::{KernelKind, Session},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl ReduceOp {
    pub const ALL: [ReduceOp; 4] = [ReduceOp::Add, ReduceOp::Sub, ReduceOp::Mul, ReduceOp::Div];

    pub fn kernel_name(self) -> &'static str {
        match self {
            ReduceOp::Add => "add_k",
            ReduceOp::Sub => "sub_k",
            ReduceOp::Mul => "mul_k",
            ReduceOp::Div => "div_k",
        }
    }

    pub fn from_kernel_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.kernel_name() == name)
    }

    /// Host fold with the kernel's semantics. Sub and Div start from the
    /// first element; on an empty slice they yield NaN.
    pub fn fold(self, values: &[f64]) -> f64 {
        match self {
            ReduceOp::Add => values.iter().fold(0.0, |acc, v| acc + v),
            ReduceOp::Mul => values.iter().fold(1.0, |acc, v| acc * v),
            ReduceOp::Sub => match values.split_first() {
                Some((first, rest)) => rest.iter().fold(*first, |acc, v| acc - v),
                None => f64::NAN,
            },
            ReduceOp::Div => match values.split_first() {
                Some((first, rest)) => rest.iter().fold(*first, |acc, v| acc / v),
                None => f64::NAN,
            },
        }
    }
}

/// Folds `values` with `op` on device `device_index`.
///
/// Division by zero is not an error; the IEEE result comes back unchanged.
#[tracing::instrument(level = "debug", skip(session, values), fields(len = values.len()))]
pub fn reduce<B: ComputeBackend>(
    session: &Session<B>,
    op: ReduceOp,
    values: &[f64],
    device_index: usize,
) -> Result<f64, ClError> {
    if values.is_empty() {
        return Err(ClError::EmptyInput);
    }
    let queue = session.queue(device_index)?;
    let count = i32::try_from(values.len())
        .map_err(|_| ClError::InvalidArgument("reduction input longer than i32::MAX"))?;

    #[cfg(feature = "metrics")]
    let t = Instant::now();

    let backend = session.backend();
    let input = DeviceBuffer::<B, Ready>::from_slice(
        backend,
        session.context(),
        bytemuck::cast_slice(values),
    )?;
    let result = DeviceBuffer::<B, Queued>::new(backend, session.context(), size_of::<f64>())?
        .launch();

    {
        let mut kernel = session.lock_kernel(KernelKind::Reduce(op));
        backend.set_kernel_arg(&mut kernel, 0, KernelArg::Int(count))?;
        backend.set_kernel_arg(&mut kernel, 1, KernelArg::Mem(input.raw()))?;
        backend.set_kernel_arg(&mut kernel, 2, KernelArg::Mem(result.raw()))?;
        backend.enqueue_kernel(queue, &kernel, 1)?;
    }

    let fence = Finished::wait(backend, queue)?;
    let result = result.into_ready(&fence);
    let mut out = [0.0f64; 1];
    result.read_into(backend, queue, bytemuck::cast_slice_mut(&mut out))?;

    #[cfg(feature = "metrics")]
    crate::record("reduce", t);

    Ok(out[0])
}
