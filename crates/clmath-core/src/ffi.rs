//! Flat C ABI over the process-wide session.
//!
//! Every entry point initializes the session on first use. Errors cannot
//! cross the boundary, so they become sentinel returns (documented per
//! function) and the message is kept for `clm_last_error` on the calling
//! thread.

use std::{
    cell::RefCell,
    ffi::c_char,
    slice,
};

use once_cell::sync::Lazy;
use tracing::{Level, debug, error, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    ClError,
    backend::ComputeBackend,
    config::BackendConfig,
    loader::{DynamicBackend, is_driver_available},
    matcher::{Image, search},
    reduce::{ReduceOp, reduce},
    session::SessionCell,
};

/// Filter variable read by [`clm_init_logging`].
pub const LOG_ENV: &str = "CLMATH_LOG";

static SESSION: Lazy<SessionCell<DynamicBackend>> =
    Lazy::new(|| SessionCell::new(|| DynamicBackend::load(&BackendConfig::from_env())));

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Severity a failed call is logged at. Setup failures are errors, a
/// device index miss is routine for callers probing the device list.
fn log_level(err: &ClError) -> Level {
    match err {
        ClError::LibraryNotFound(_)
        | ClError::MissingSymbol(_)
        | ClError::NoPlatform
        | ClError::NoDevices
        | ClError::Build(_)
        | ClError::Api(_) => Level::ERROR,
        ClError::DeviceOutOfRange { .. } => Level::DEBUG,
        ClError::EmptyInput | ClError::InvalidArgument(_) => Level::WARN,
    }
}

fn record_error(op: &'static str, err: &ClError) {
    match log_level(err) {
        Level::ERROR => error!(op, %err, "call failed"),
        Level::WARN => warn!(op, %err, "call rejected"),
        _ => debug!(op, %err, "call missed"),
    }
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(err.to_string()));
}

/// Copies `text` into `buf`, truncated to `cap - 1` bytes plus a NUL.
/// Returns the number of bytes copied, not counting the NUL.
///
/// # Safety
/// `buf` must be null or valid for `cap` bytes of writes.
unsafe fn copy_c_string(text: &str, buf: *mut c_char, cap: i32) -> i32 {
    if buf.is_null() || cap <= 0 {
        return 0;
    }
    let n = text.len().min(cap as usize - 1);
    unsafe {
        let out = slice::from_raw_parts_mut(buf.cast::<u8>(), n + 1);
        out[..n].copy_from_slice(&text.as_bytes()[..n]);
        out[n] = 0;
    }
    n as i32
}

fn device_index(index: i32, count: usize) -> Result<usize, ClError> {
    usize::try_from(index)
        .ok()
        .filter(|&i| i < count)
        .ok_or(ClError::DeviceOutOfRange { index: i64::from(index), count })
}

// ─── Generic bodies ──────────────────────────────────────────────────

pub(crate) fn device_count_in<B: ComputeBackend>(cell: &SessionCell<B>) -> i32 {
    match cell.device_count() {
        Ok(n) => i32::try_from(n).unwrap_or(i32::MAX),
        Err(err) => {
            record_error("device_count", &err);
            -1
        }
    }
}

pub(crate) unsafe fn device_name_in<B: ComputeBackend>(
    cell: &SessionCell<B>,
    index: i32,
    buf: *mut c_char,
    cap: i32,
) -> i32 {
    let name = cell
        .ensure_initialized()
        .and_then(|s| s.device_name(device_index(index, s.device_count())?));
    match name {
        Ok(name) => unsafe { copy_c_string(&name, buf, cap) },
        Err(err) => {
            record_error("device_name", &err);
            0
        }
    }
}

pub(crate) unsafe fn reduce_in<B: ComputeBackend>(
    cell: &SessionCell<B>,
    op: ReduceOp,
    values: *const f64,
    count: i32,
    device: i32,
) -> f64 {
    let run = || -> Result<f64, ClError> {
        let session = cell.ensure_initialized()?;
        if count <= 0 {
            return Err(ClError::EmptyInput);
        }
        if values.is_null() {
            return Err(ClError::InvalidArgument("values pointer is null"));
        }
        let device = device_index(device, session.device_count())?;
        let values = unsafe { slice::from_raw_parts(values, count as usize) };
        reduce(&session, op, values, device)
    };
    run().unwrap_or_else(|err| {
        record_error(op.kernel_name(), &err);
        f64::NAN
    })
}

#[allow(clippy::too_many_arguments)]
pub(crate) unsafe fn slide_in<B: ComputeBackend>(
    cell: &SessionCell<B>,
    big: *const i32,
    big_h: i32,
    big_w: i32,
    tpl: *const i32,
    tpl_h: i32,
    tpl_w: i32,
    times: i32,
    scores: *mut f32,
    infos: *mut i32,
    capacity: i32,
) -> i32 {
    let run = || -> Result<i32, ClError> {
        let session = cell.ensure_initialized()?;
        let positive = |v: i32, what: &'static str| {
            usize::try_from(v).ok().filter(|&v| v > 0).ok_or(ClError::InvalidArgument(what))
        };
        let (big_h, big_w) = (positive(big_h, "big_h")?, positive(big_w, "big_w")?);
        let (tpl_h, tpl_w) = (positive(tpl_h, "tpl_h")?, positive(tpl_w, "tpl_w")?);
        let times = positive(times, "times")?;
        let capacity = usize::try_from(capacity)
            .map_err(|_| ClError::InvalidArgument("capacity is negative"))?;
        if big.is_null() || tpl.is_null() || scores.is_null() || infos.is_null() {
            return Err(ClError::InvalidArgument("null image or output pointer"));
        }
        let big_len = big_h
            .checked_mul(big_w)
            .ok_or(ClError::InvalidArgument("big image too large"))?;
        let tpl_len = tpl_h
            .checked_mul(tpl_w)
            .ok_or(ClError::InvalidArgument("template too large"))?;

        let big_px = unsafe { slice::from_raw_parts(big, big_len) };
        let tpl_px = unsafe { slice::from_raw_parts(tpl, tpl_len) };
        let hits = search(
            &session,
            Image::new(big_px, big_h, big_w)?,
            Image::new(tpl_px, tpl_h, tpl_w)?,
            times,
        )?;

        let n = hits.len().min(capacity);
        if n < hits.len() {
            warn!(valid = hits.len(), capacity, "slide results truncated to capacity");
        }
        let (scores, infos) = unsafe {
            (slice::from_raw_parts_mut(scores, n), slice::from_raw_parts_mut(infos, n * 4))
        };
        for (i, hit) in hits.iter().take(n).enumerate() {
            scores[i] = hit.score;
            infos[i * 4..i * 4 + 4].copy_from_slice(&hit.geometry());
        }
        Ok(n as i32)
    };
    run().unwrap_or_else(|err| {
        record_error("slide_once", &err);
        -1
    })
}

// ─── Exports ─────────────────────────────────────────────────────────

/// Number of GPU devices, or -1 when the session cannot be initialized.
#[unsafe(no_mangle)]
pub extern "C" fn clm_device_count() -> i32 {
    device_count_in(&SESSION)
}

/// Writes the NUL-terminated name of device `index` into `buf` (at most
/// `cap - 1` bytes) and returns its length. Returns 0 on any failure.
///
/// # Safety
/// `buf` must be null or valid for `cap` bytes of writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn clm_device_name(index: i32, buf: *mut c_char, cap: i32) -> i32 {
    unsafe { device_name_in(&SESSION, index, buf, cap) }
}

/// Sum of `values[..count]` on `device`. NaN on error.
///
/// # Safety
/// `values` must be valid for `count` reads.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn clm_add(values: *const f64, count: i32, device: i32) -> f64 {
    unsafe { reduce_in(&SESSION, ReduceOp::Add, values, count, device) }
}

/// `values[0] - values[1] - ...` on `device`. NaN on error.
///
/// # Safety
/// `values` must be valid for `count` reads.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn clm_sub(values: *const f64, count: i32, device: i32) -> f64 {
    unsafe { reduce_in(&SESSION, ReduceOp::Sub, values, count, device) }
}

/// Product of `values[..count]` on `device`. NaN on error.
///
/// # Safety
/// `values` must be valid for `count` reads.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn clm_mul(values: *const f64, count: i32, device: i32) -> f64 {
    unsafe { reduce_in(&SESSION, ReduceOp::Mul, values, count, device) }
}

/// `values[0] / values[1] / ...` on `device`. NaN on error.
///
/// # Safety
/// `values` must be valid for `count` reads.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn clm_div(values: *const f64, count: i32, device: i32) -> f64 {
    unsafe { reduce_in(&SESSION, ReduceOp::Div, values, count, device) }
}

/// Sliding-window search on device 0. Writes up to `capacity` scores and
/// `(x, y, width, height)` quadruples and returns how many were written,
/// or -1 on error.
///
/// At most `times` windows are valid. With `capacity < times` the result is
/// cut to the first `capacity` windows in scan order and the return value
/// cannot tell a full buffer from a complete result; pass
/// `capacity >= times` to receive every valid window.
///
/// # Safety
/// `big` must hold `big_h * big_w` values, `tpl` `tpl_h * tpl_w` values,
/// `scores` `capacity` slots and `infos` `4 * capacity` slots.
#[allow(clippy::too_many_arguments)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn clm_slide_once(
    big: *const i32,
    big_h: i32,
    big_w: i32,
    tpl: *const i32,
    tpl_h: i32,
    tpl_w: i32,
    times: i32,
    scores: *mut f32,
    infos: *mut i32,
    capacity: i32,
) -> i32 {
    unsafe {
        slide_in(&SESSION, big, big_h, big_w, tpl, tpl_h, tpl_w, times, scores, infos, capacity)
    }
}

/// Releases every device object and unloads the driver. Safe to call at any
/// quiescent point, any number of times.
#[unsafe(no_mangle)]
pub extern "C" fn clm_dispose() {
    SESSION.dispose();
}

/// 1 when an OpenCL driver can be loaded and bound, else 0.
#[unsafe(no_mangle)]
pub extern "C" fn clm_driver_available() -> i32 {
    i32::from(is_driver_available(&BackendConfig::from_env()))
}

/// Copies the last error message of the calling thread into `buf`.
/// Returns its length, or 0 when there is none.
///
/// # Safety
/// `buf` must be null or valid for `cap` bytes of writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn clm_last_error(buf: *mut c_char, cap: i32) -> i32 {
    LAST_ERROR.with(|slot| match slot.borrow().as_deref() {
        Some(msg) => unsafe { copy_c_string(msg, buf, cap) },
        None => 0,
    })
}

/// Installs a `tracing` subscriber filtered by `CLMATH_LOG` (default
/// `warn`). Later calls, or a subscriber installed by the host, win.
#[unsafe(no_mangle)]
pub extern "C" fn clm_init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft::{SoftBackend, SoftStats};
    use std::{ffi::CStr, sync::Arc};

    fn soft_cell(names: &'static [&'static str]) -> SessionCell<SoftBackend> {
        SessionCell::new(move || Ok(SoftBackend::new(names.iter().copied())))
    }

    fn last_error() -> String {
        let mut buf = [0 as c_char; 256];
        let n = unsafe { clm_last_error(buf.as_mut_ptr(), buf.len() as i32) };
        assert!(n >= 0);
        unsafe { CStr::from_ptr(buf.as_ptr()) }.to_string_lossy().into_owned()
    }

    #[test]
    fn device_name_truncates_and_terminates() {
        let cell = soft_cell(&["Soft Radeon Pro", "Soft Arc"]);
        let mut buf = [0x7f as c_char; 8];
        let n = unsafe { device_name_in(&cell, 0, buf.as_mut_ptr(), buf.len() as i32) };
        assert_eq!(n, 7);
        let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
        assert_eq!(name.to_str().unwrap(), "Soft Ra");

        let mut big = [0 as c_char; 64];
        let n = unsafe { device_name_in(&cell, 1, big.as_mut_ptr(), big.len() as i32) };
        assert_eq!(n, 8);
    }

    #[test]
    fn device_name_misses_return_zero() {
        let cell = soft_cell(&["gpu"]);
        let mut buf = [0 as c_char; 16];
        let count = device_count_in(&cell);
        assert_eq!(count, 1);
        assert_eq!(unsafe { device_name_in(&cell, count, buf.as_mut_ptr(), 16) }, 0);
        assert!(last_error().contains("out of range"));
        assert_eq!(unsafe { device_name_in(&cell, -1, buf.as_mut_ptr(), 16) }, 0);
        assert_eq!(unsafe { device_name_in(&cell, 0, std::ptr::null_mut(), 16) }, 0);
        assert_eq!(unsafe { device_name_in(&cell, 0, buf.as_mut_ptr(), 0) }, 0);
    }

    #[test]
    fn reductions_through_the_abi() {
        let cell = soft_cell(&["gpu"]);
        let run = |op, v: &[f64]| unsafe { reduce_in(&cell, op, v.as_ptr(), v.len() as i32, 0) };
        assert_eq!(run(ReduceOp::Add, &[1.0, 2.0, 3.0, 4.0]), 10.0);
        assert_eq!(run(ReduceOp::Sub, &[10.0, 2.0, 3.0]), 5.0);
        assert_eq!(run(ReduceOp::Mul, &[2.0, 3.0, 4.0]), 24.0);
        assert_eq!(run(ReduceOp::Div, &[100.0, 5.0, 2.0]), 10.0);
    }

    #[test]
    fn reduction_errors_become_nan() {
        let cell = soft_cell(&["gpu"]);
        let v = [1.0, 2.0];
        assert!(unsafe { reduce_in(&cell, ReduceOp::Add, v.as_ptr(), 2, 1) }.is_nan());
        assert!(last_error().contains("device index 1"));
        assert!(unsafe { reduce_in(&cell, ReduceOp::Add, v.as_ptr(), 0, 0) }.is_nan());
        assert!(last_error().contains("empty"));
        assert!(unsafe { reduce_in(&cell, ReduceOp::Add, std::ptr::null(), 2, 0) }.is_nan());
    }

    #[test]
    fn slide_writes_compacted_results() {
        let cell = soft_cell(&["gpu"]);
        let big: Vec<i32> = (0..16).collect();
        let tpl = [10, 11, 14, 15];
        let mut scores = [0f32; 4];
        let mut infos = [0i32; 16];
        let n = unsafe {
            slide_in(
                &cell, big.as_ptr(), 4, 4, tpl.as_ptr(), 2, 2, 4,
                scores.as_mut_ptr(), infos.as_mut_ptr(), 4,
            )
        };
        assert_eq!(n, 4);
        assert_eq!(scores[3], 1.0);
        assert_eq!(&infos[12..16], &[2, 2, 2, 2]);
        assert_eq!(&infos[0..4], &[0, 0, 2, 2]);
    }

    #[test]
    fn slide_respects_capacity_and_rejects_bad_shapes() {
        let cell = soft_cell(&["gpu"]);
        let big = [0i32; 16];
        let tpl = [0i32; 4];
        let mut scores = [0f32; 2];
        let mut infos = [0i32; 8];
        let n = unsafe {
            slide_in(
                &cell, big.as_ptr(), 4, 4, tpl.as_ptr(), 2, 2, 4,
                scores.as_mut_ptr(), infos.as_mut_ptr(), 2,
            )
        };
        assert_eq!(n, 2);

        let n = unsafe {
            slide_in(
                &cell, big.as_ptr(), 0, 4, tpl.as_ptr(), 2, 2, 4,
                scores.as_mut_ptr(), infos.as_mut_ptr(), 2,
            )
        };
        assert_eq!(n, -1);
        assert!(last_error().contains("big_h"));
    }

    #[test]
    fn failed_initialization_is_reported_as_minus_one() {
        let stats = Arc::new(SoftStats::default());
        let shared = Arc::clone(&stats);
        let cell = SessionCell::new(move || {
            Ok(SoftBackend::new(["gpu"]).with_stats(Arc::clone(&shared)).failing_build())
        });
        assert_eq!(device_count_in(&cell), -1);
        assert!(last_error().contains("build failed"));
        assert!(!cell.is_initialized());
        assert_eq!(stats.contexts_live(), 0);
    }

    #[test]
    fn truncation_keeps_the_leading_windows() {
        let cell = soft_cell(&["gpu"]);
        let big: Vec<i32> = (0..16).collect();
        let tpl = [0, 1, 4, 5];
        let mut scores = [9f32; 3];
        let mut infos = [9i32; 12];
        let n = unsafe {
            slide_in(
                &cell, big.as_ptr(), 4, 4, tpl.as_ptr(), 2, 2, 4,
                scores.as_mut_ptr(), infos.as_mut_ptr(), 1,
            )
        };
        assert_eq!(n, 1);
        assert_eq!(scores[0], 1.0);
        assert_eq!(&infos[0..4], &[0, 0, 2, 2]);
        // Slots past `capacity` are left alone.
        assert_eq!(scores[1], 9.0);
        assert_eq!(&infos[4..8], &[9, 9, 9, 9]);
    }

    #[test]
    fn initialization_failure_wins_over_argument_errors() {
        let cell: SessionCell<SoftBackend> =
            SessionCell::new(|| Err(ClError::LibraryNotFound("libOpenCL.so.1".into())));

        assert!(unsafe { reduce_in(&cell, ReduceOp::Add, std::ptr::null(), 0, 0) }.is_nan());
        assert!(last_error().contains("driver library"));

        let mut scores = [0f32; 1];
        let mut infos = [0i32; 4];
        let n = unsafe {
            slide_in(
                &cell, std::ptr::null(), 0, 0, std::ptr::null(), 0, 0, 0,
                scores.as_mut_ptr(), infos.as_mut_ptr(), 1,
            )
        };
        assert_eq!(n, -1);
        assert!(last_error().contains("driver library"));
    }

    #[test]
    fn device_misses_log_below_setup_failures() {
        assert_eq!(
            log_level(&ClError::DeviceOutOfRange { index: 3, count: 1 }),
            Level::DEBUG
        );
        assert_eq!(log_level(&ClError::EmptyInput), Level::WARN);
        assert_eq!(log_level(&ClError::InvalidArgument("times")), Level::WARN);
        for err in [
            ClError::LibraryNotFound("libOpenCL.so".into()),
            ClError::MissingSymbol("clFinish"),
            ClError::NoPlatform,
            ClError::NoDevices,
            ClError::Build("status -11".into()),
        ] {
            assert_eq!(log_level(&err), Level::ERROR, "{err}");
        }
    }

    #[test]
    fn copy_c_string_with_exact_fit() {
        let mut buf = [1 as c_char; 4];
        let n = unsafe { copy_c_string("abc", buf.as_mut_ptr(), 4) };
        assert_eq!(n, 3);
        assert_eq!(buf[3], 0);
    }
}
