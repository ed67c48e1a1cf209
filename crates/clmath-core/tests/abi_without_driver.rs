//! Exported C surface on a machine where no OpenCL driver can be loaded.
//! Returns early when a driver is present.

use std::ffi::{CStr, c_char};

use clmath_core::{
    BackendConfig,
    ffi::{clm_add, clm_device_count, clm_device_name, clm_dispose, clm_driver_available, clm_last_error},
    is_driver_available,
};

fn last_error() -> String {
    let mut buf = [0 as c_char; 256];
    let n = unsafe { clm_last_error(buf.as_mut_ptr(), buf.len() as i32) };
    assert!(n > 0);
    unsafe { CStr::from_ptr(buf.as_ptr()) }.to_string_lossy().into_owned()
}

#[test]
fn every_entry_point_reports_the_missing_driver() {
    if is_driver_available(&BackendConfig::from_env()) {
        eprintln!("OpenCL driver present, skipping");
        return;
    }

    assert_eq!(clm_driver_available(), 0);

    assert_eq!(clm_device_count(), -1);
    assert!(last_error().contains("no OpenCL driver library could be loaded"));

    let mut name = [0 as c_char; 32];
    assert_eq!(unsafe { clm_device_name(0, name.as_mut_ptr(), 32) }, 0);
    assert!(last_error().contains("driver library"));

    let values = [1.0, 2.0];
    assert!(unsafe { clm_add(values.as_ptr(), 2, 0) }.is_nan());
    assert!(last_error().contains("driver library"));

    // Empty input still reports the setup failure, not the argument.
    assert!(unsafe { clm_add(values.as_ptr(), 0, 0) }.is_nan());
    assert!(last_error().contains("driver library"));

    clm_dispose();
    clm_dispose();
    assert_eq!(clm_device_count(), -1);
}
