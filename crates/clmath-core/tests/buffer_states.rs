// Typestate walk of a device buffer on the software backend.

use bytemuck::{cast_slice, cast_slice_mut};
use clmath_core::{
    ClError, ComputeBackend, DeviceBuffer, Finished, KernelArg, Queued, Ready, Session,
    SoftBackend,
};
use clmath_core::session::KernelKind;
use clmath_core::ReduceOp;

#[test]
fn queued_inflight_ready_then_read() {
    let session = Session::open(SoftBackend::new(["gpu"])).unwrap();
    let backend = session.backend();
    let queue = session.queue(0).unwrap();

    let values = [3.0_f64, 4.0, 5.0];
    let input: DeviceBuffer<SoftBackend, Ready> =
        DeviceBuffer::from_slice(backend, session.context(), cast_slice(&values)).unwrap();
    let output: DeviceBuffer<SoftBackend, Queued> =
        DeviceBuffer::new(backend, session.context(), 8).unwrap();
    assert_eq!(output.len(), 8);

    let in_flight = output.launch();
    {
        let mut kernel = session.lock_kernel(KernelKind::Reduce(ReduceOp::Mul));
        backend.set_kernel_arg(&mut kernel, 0, KernelArg::Int(3)).unwrap();
        backend.set_kernel_arg(&mut kernel, 1, KernelArg::Mem(input.raw())).unwrap();
        backend.set_kernel_arg(&mut kernel, 2, KernelArg::Mem(in_flight.raw())).unwrap();
        backend.enqueue_kernel(queue, &kernel, 1).unwrap();
    }
    let fence = Finished::wait(backend, queue).unwrap();
    let ready = in_flight.into_ready(&fence);

    let mut out = [0.0_f64; 1];
    ready.read_into(backend, queue, cast_slice_mut(&mut out)).unwrap();
    assert_eq!(out[0], 60.0);
}

#[test]
fn zero_sized_buffer_is_rejected() {
    let session = Session::open(SoftBackend::new(["gpu"])).unwrap();
    let err = DeviceBuffer::<SoftBackend, Queued>::new(session.backend(), session.context(), 0)
        .unwrap_err();
    assert!(matches!(err, ClError::InvalidArgument(_)));
}

#[test]
fn read_into_checks_host_length() {
    let session = Session::open(SoftBackend::new(["gpu"])).unwrap();
    let buf = DeviceBuffer::<SoftBackend, Ready>::from_slice(
        session.backend(),
        session.context(),
        &[1, 2, 3, 4],
    )
    .unwrap();
    let mut short = [0u8; 2];
    assert!(buf.read_into(session.backend(), session.queue(0).unwrap(), &mut short).is_err());
}

#[test]
fn buffers_are_released_on_drop() {
    let backend = SoftBackend::new(["gpu"]);
    let stats = std::sync::Arc::clone(backend.stats());
    let session = Session::open(backend).unwrap();
    {
        let _a = DeviceBuffer::<SoftBackend, Queued>::new(session.backend(), session.context(), 16)
            .unwrap()
            .launch();
        assert_eq!(stats.buffers_live(), 1);
    }
    assert_eq!(stats.buffers_live(), 0);
}
