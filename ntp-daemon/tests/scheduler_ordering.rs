//! Exercises the scheduler's documented dispatch order from outside the
//! crate, against the real `libc::poll` loop (spec §4.2: "fds before
//! timers, both in deterministic order").

use std::cell::RefCell;
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;

use ntp_daemon::Scheduler;
use ntp_proto::clock::TestClock;
use ntp_proto::NtpDuration;

fn scheduler() -> Scheduler<TestClock> {
    Scheduler::new(TestClock::new()).unwrap()
}

#[test]
fn a_ready_fd_is_dispatched_before_an_already_due_timer() {
    let mut sched = scheduler();
    let (mut writer, mut reader) = UnixStream::pair().unwrap();
    writer.set_nonblocking(true).unwrap();
    reader.set_nonblocking(true).unwrap();

    let order = Rc::new(RefCell::new(Vec::new()));

    let order_fd = order.clone();
    sched.add_input_handler(reader.as_raw_fd(), move |_, _, _| {
        let mut buf = [0u8; 8];
        let _ = reader.read(&mut buf);
        order_fd.borrow_mut().push("fd");
    });

    let order_timer = order.clone();
    sched.add_timeout(NtpDuration::ZERO, move |_, _, _| {
        order_timer.borrow_mut().push("timer");
    });

    writer.write_all(b"x").unwrap();

    sched.run_once().unwrap();

    assert_eq!(*order.borrow(), vec!["fd", "timer"]);
}

#[test]
fn run_once_with_only_a_due_timer_fires_it() {
    let mut sched = scheduler();
    let fired = Rc::new(RefCell::new(false));
    let fired_handle = fired.clone();
    sched.add_timeout(NtpDuration::ZERO, move |_, _, _| {
        *fired_handle.borrow_mut() = true;
    });

    sched.run_once().unwrap();

    assert!(*fired.borrow());
}

#[test]
fn run_once_leaves_a_far_future_timer_pending() {
    let mut sched = scheduler();
    let fired = Rc::new(RefCell::new(false));
    let fired_handle = fired.clone();
    let (mut writer, reader) = UnixStream::pair().unwrap();
    reader.set_nonblocking(true).unwrap();
    sched.add_input_handler(reader.as_raw_fd(), |_, _, _| {});
    sched.add_timeout(NtpDuration::from_seconds(3600.0), move |_, _, _| {
        *fired_handle.borrow_mut() = true;
    });

    writer.write_all(b"x").unwrap();
    sched.run_once().unwrap();

    assert!(!*fired.borrow(), "a timer an hour out must not fire on this wake");
}
