use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use comm_overlapped::sys::sim::{Completion, Sim, SimDevice};
use comm_overlapped::sys::{
    EV_RXCHAR, FILE_FLAG_OVERLAPPED, GENERIC_READ, GENERIC_WRITE, OPEN_EXISTING,
};
use comm_overlapped::{
    Device, ErrorCode, Kernel, NativeBuffer, OverlappedRequest, Progress, Timeout, WaitOutcome,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn setup(flags: u32) -> (Sim, SimDevice, Kernel, Device) {
    init_logging();
    let sim = Sim::new();
    let port = sim.add_device("COM1");
    let kernel = Kernel::from(sim.clone());
    let dev = kernel
        .open(
            r"\\.\COM1",
            GENERIC_READ | GENERIC_WRITE,
            0,
            OPEN_EXISTING,
            flags,
        )
        .unwrap();
    (sim, port, kernel, dev)
}

#[test]
fn synchronous_write_returns_count() {
    let (_sim, port, kernel, dev) = setup(0);
    assert!(!dev.is_overlapped());
    let mut req = OverlappedRequest::new(&kernel).unwrap();

    let data = vec![0x5a; 300];
    let r = dev.write(&mut req, NativeBuffer::from_slice(&data));
    assert!(r.success);
    assert_eq!(r.bytes_transferred, 300);
    assert_eq!(r.last_error, ErrorCode::SUCCESS);
    assert_eq!(port.take_written(), data);
}

#[test]
fn synchronous_read_returns_what_is_queued() {
    let (_sim, port, kernel, dev) = setup(0);
    let mut req = OverlappedRequest::new(&kernel).unwrap();
    port.inject(b"abcdef");

    let r = dev.read(&mut req, NativeBuffer::new(4), 4);
    assert!(r.success);
    assert_eq!(r.bytes_transferred, 4);
    assert_eq!(req.take_buffer().unwrap().as_slice(), b"abcd");
    assert_eq!(port.queued_input(), 2);
}

#[test]
fn overlapped_write_pends_then_completes() {
    let (_sim, port, kernel, dev) = setup(FILE_FLAG_OVERLAPPED);
    let mut req = OverlappedRequest::new(&kernel).unwrap();

    let r = dev.write(&mut req, NativeBuffer::from_slice(b"0123456789"));
    assert!(!r.success);
    assert_eq!(r.last_error, ErrorCode::IO_PENDING);
    assert_eq!(r.into_result().unwrap(), Progress::Pending);

    let r = dev.wait_for_completion(&mut req, true);
    assert!(r.success);
    assert_eq!(r.bytes_transferred, 10);
    assert_eq!(r.into_result().unwrap(), Progress::Done(10));
    assert_eq!(port.take_written(), b"0123456789");
}

#[test]
fn immediate_completion_skips_pending() {
    let (_sim, port, kernel, dev) = setup(FILE_FLAG_OVERLAPPED);
    port.set_completion(Completion::Immediate);
    let mut req = OverlappedRequest::new(&kernel).unwrap();

    let r = dev.write(&mut req, NativeBuffer::from_slice(b"now"));
    assert!(r.success);
    assert_eq!(r.bytes_transferred, 3);
    assert!(!req.is_pending());
    assert_eq!(dev.wait_for_completion(&mut req, false), r);
}

#[test]
fn read_completes_when_data_arrives_from_another_thread() {
    let (_sim, port, kernel, dev) = setup(FILE_FLAG_OVERLAPPED);
    let mut req = OverlappedRequest::new(&kernel).unwrap();

    let r = dev.read(&mut req, NativeBuffer::new(32), 32);
    assert!(r.is_pending());

    let feeder = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        port.inject(b"late data");
    });

    let r = dev.wait_for_completion(&mut req, true);
    feeder.join().unwrap();
    assert!(r.success);
    assert_eq!(r.bytes_transferred, 9);
    assert_eq!(req.buffer().unwrap().as_slice(), b"late data");
}

#[test]
fn closing_from_another_thread_aborts_a_blocked_read() {
    let (sim, _port, kernel, dev) = setup(FILE_FLAG_OVERLAPPED);
    let dev = Arc::new(dev);
    let mut req = OverlappedRequest::new(&kernel).unwrap();

    assert!(dev.read(&mut req, NativeBuffer::new(8), 8).is_pending());

    let closer = {
        let dev = dev.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            dev.close().unwrap();
        })
    };

    let r = dev.wait_for_completion(&mut req, true);
    closer.join().unwrap();
    assert!(!r.success);
    assert_eq!(r.bytes_transferred, 0);
    assert_eq!(r.last_error, ErrorCode::INVALID_HANDLE);
    assert!(!req.is_pending());
    assert_eq!(sim.pending_operations(), 0);
}

#[test]
fn signaling_the_event_wakes_the_waiter_without_completing() {
    let (_sim, port, kernel, dev) = setup(FILE_FLAG_OVERLAPPED);
    port.set_completion(Completion::Manual);
    let event = Arc::new(kernel.create_event(true, false, None).unwrap());
    let mut req = OverlappedRequest::borrowing(&event);

    assert!(dev.write(&mut req, NativeBuffer::from_slice(b"z")).is_pending());

    let signaler = {
        let event = event.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            event.set().unwrap();
        })
    };

    let r = dev.wait_for_completion(&mut req, true);
    signaler.join().unwrap();
    assert!(r.is_pending());
    assert_eq!(r.last_error, ErrorCode::IO_PENDING);
    assert!(req.is_pending());

    port.complete_pending();
    assert!(dev.wait_for_completion(&mut req, true).success);
}

#[test]
fn poll_of_unfinished_operation_reports_io_pending() {
    let (_sim, port, kernel, dev) = setup(FILE_FLAG_OVERLAPPED);
    port.set_completion(Completion::Manual);
    let mut req = OverlappedRequest::new(&kernel).unwrap();

    dev.read(&mut req, NativeBuffer::new(4), 4);
    let r = dev.wait_for_completion(&mut req, false);
    assert!(!r.success);
    assert_eq!(r.last_error, ErrorCode::IO_PENDING);
    assert_eq!(r.into_result().unwrap(), Progress::Pending);
}

#[test]
fn blocking_completion_after_the_auto_reset_signal_was_consumed() {
    let (_sim, port, kernel, dev) = setup(FILE_FLAG_OVERLAPPED);
    port.set_completion(Completion::Manual);
    let event = kernel.create_event(false, false, None).unwrap();
    let mut req = OverlappedRequest::with_event(event);

    assert!(dev.write(&mut req, NativeBuffer::from_slice(b"done")).is_pending());
    port.complete_pending();
    assert_eq!(req.event().wait(Timeout::POLL), WaitOutcome::Signaled);

    let (tx, rx) = mpsc::channel();
    let waiter = thread::spawn(move || {
        let r = dev.wait_for_completion(&mut req, true);
        tx.send(r).unwrap();
    });
    let r = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    waiter.join().unwrap();
    assert!(r.success);
    assert_eq!(r.bytes_transferred, 4);
}

#[test]
fn dropping_a_finished_request_after_reset_returns() {
    let (sim, port, kernel, dev) = setup(FILE_FLAG_OVERLAPPED);
    port.set_completion(Completion::Manual);
    let mut req = OverlappedRequest::new(&kernel).unwrap();

    assert!(dev.read(&mut req, NativeBuffer::new(8), 8).is_pending());
    port.inject(b"x");
    port.complete_pending();
    req.event().reset().unwrap();

    let (tx, rx) = mpsc::channel();
    let dropper = thread::spawn(move || {
        drop(req);
        tx.send(()).unwrap();
    });
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    dropper.join().unwrap();
    assert_eq!(sim.pending_operations(), 0);
    assert!(!dev.is_closed());
}

#[test]
fn timed_out_wait_leaves_the_operation_pending() {
    let (_sim, port, kernel, dev) = setup(FILE_FLAG_OVERLAPPED);
    port.set_completion(Completion::Manual);
    let mut req = OverlappedRequest::new(&kernel).unwrap();

    dev.write(&mut req, NativeBuffer::from_slice(b"slow"));
    assert_eq!(req.event().wait(Timeout::Millis(20)), WaitOutcome::Timeout);
    assert!(req.is_pending());

    port.complete_pending();
    assert_eq!(req.event().wait(Timeout::Millis(20)), WaitOutcome::Signaled);
    assert_eq!(dev.wait_for_completion(&mut req, false).bytes_transferred, 4);
}

#[test]
fn distinct_requests_are_outstanding_together() {
    let (_sim, port, kernel, dev) = setup(FILE_FLAG_OVERLAPPED);
    port.set_completion(Completion::Manual);
    let mut read = OverlappedRequest::new(&kernel).unwrap();
    let mut write = OverlappedRequest::new(&kernel).unwrap();

    assert!(dev.read(&mut read, NativeBuffer::new(16), 16).is_pending());
    assert!(dev
        .write(&mut write, NativeBuffer::from_slice(b"out"))
        .is_pending());
    assert_eq!(port.pending(), 2);

    port.inject(b"in");
    assert_eq!(port.complete_pending(), 2);

    assert_eq!(dev.wait_for_completion(&mut write, false).bytes_transferred, 3);
    assert_eq!(dev.wait_for_completion(&mut read, false).bytes_transferred, 2);
    assert_eq!(read.buffer().unwrap().as_slice(), b"in");
}

#[test]
fn request_is_reusable_after_completion() {
    let (_sim, port, kernel, dev) = setup(FILE_FLAG_OVERLAPPED);
    port.set_loopback(true);
    let mut req = OverlappedRequest::new(&kernel).unwrap();

    for chunk in [&b"one"[..], &b"three"[..]].iter() {
        dev.write(&mut req, NativeBuffer::from_slice(chunk));
        assert!(dev.wait_for_completion(&mut req, true).success);
        let buffer = req.take_buffer().unwrap();
        dev.read(&mut req, buffer, chunk.len());
        let r = dev.wait_for_completion(&mut req, true);
        assert_eq!(r.bytes_transferred as usize, chunk.len());
        assert_eq!(req.buffer().unwrap().as_slice(), *chunk);
    }
}

#[test]
#[should_panic(expected = "pending")]
fn reusing_a_pending_request_panics() {
    let (_sim, port, kernel, dev) = setup(FILE_FLAG_OVERLAPPED);
    port.set_completion(Completion::Manual);
    let mut req = OverlappedRequest::new(&kernel).unwrap();
    dev.write(&mut req, NativeBuffer::from_slice(b"a"));
    dev.write(&mut req, NativeBuffer::from_slice(b"b"));
}

#[test]
fn dropping_a_pending_request_cancels_it() {
    let (sim, port, kernel, dev) = setup(FILE_FLAG_OVERLAPPED);
    port.set_completion(Completion::Manual);
    {
        let mut req = OverlappedRequest::new(&kernel).unwrap();
        assert!(dev.read(&mut req, NativeBuffer::new(64), 64).is_pending());
        assert_eq!(sim.pending_operations(), 1);
    }
    assert_eq!(sim.pending_operations(), 0);

    // The device stays usable.
    port.set_completion(Completion::OnWait);
    let mut req = OverlappedRequest::new(&kernel).unwrap();
    dev.write(&mut req, NativeBuffer::from_slice(b"ok"));
    assert!(dev.wait_for_completion(&mut req, true).success);
}

#[test]
fn comm_event_reports_received_characters() {
    let (_sim, port, kernel, dev) = setup(FILE_FLAG_OVERLAPPED);
    let mut req = OverlappedRequest::new(&kernel).unwrap();

    dev.set_comm_mask(EV_RXCHAR).unwrap();
    assert_eq!(port.comm_mask(), EV_RXCHAR);
    assert!(dev.wait_comm_event(&mut req).is_pending());
    assert_eq!(req.event_mask(), None);

    port.inject(b"!");
    let r = dev.wait_for_completion(&mut req, true);
    assert!(r.success);
    assert_eq!(req.event_mask(), Some(EV_RXCHAR));
    assert_eq!(dev.clear_comm_error().unwrap().in_queue, 1);
}

#[test]
fn changing_the_mask_releases_a_comm_event_wait() {
    let (_sim, _port, kernel, dev) = setup(FILE_FLAG_OVERLAPPED);
    let mut req = OverlappedRequest::new(&kernel).unwrap();

    dev.set_comm_mask(EV_RXCHAR).unwrap();
    assert!(dev.wait_comm_event(&mut req).is_pending());
    dev.set_comm_mask(0).unwrap();

    let r = dev.wait_for_completion(&mut req, true);
    assert!(r.success);
    assert_eq!(req.event_mask(), Some(0));

    let r = dev.wait_comm_event(&mut req);
    assert_eq!(r.last_error, ErrorCode::INVALID_PARAMETER);
}
