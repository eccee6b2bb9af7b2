//! Single-threaded cooperative event loop (spec §4.2). Two registries —
//! readable file descriptors and pending timers — are driven by one
//! `libc::poll` call per wake. No handler may block; the loop itself is
//! the only suspension point.

use std::os::unix::io::RawFd;

use ntp_proto::{LocalClock, NtpDuration, NtpTimestamp};
use rand::Rng;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("poll(2) failed")]
    Poll(#[source] std::io::Error),
}

/// Opaque handle for a pending timeout. Ids are handed out from a
/// monotonic counter and never reused, so a stale id is always safe to
/// pass to `remove_timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutId(u64);

/// Handle for a group of timers that share a minimum inter-event
/// spacing (e.g. all poll transmits, so broadcasts spread out).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerClassId(usize);

type InputHandler<C> = Box<dyn FnMut(&mut Scheduler<C>, RawFd, NtpTimestamp)>;
type TimeoutHandler<C> = Box<dyn FnMut(&mut Scheduler<C>, TimeoutId, NtpTimestamp)>;

struct InputSource<C> {
    fd: RawFd,
    handler: InputHandler<C>,
}

struct Timer<C> {
    id: TimeoutId,
    deadline: NtpTimestamp,
    seq: u64,
    handler: TimeoutHandler<C>,
}

struct ClassState {
    min_spacing: NtpDuration,
    last_scheduled: Option<NtpTimestamp>,
}

/// Drives input and timer dispatch for one process. Owns the
/// [`LocalClock`] so every handler observes the same "now" captured at
/// the top of the current wake (`get_last_event_time`).
pub struct Scheduler<C> {
    clock: C,
    inputs: Vec<InputSource<C>>,
    timers: Vec<Timer<C>>,
    classes: Vec<ClassState>,
    next_timeout_id: u64,
    next_seq: u64,
    last_event_time: NtpTimestamp,
}

impl<C: LocalClock> Scheduler<C> {
    pub fn new(clock: C) -> Result<Self, C::Error> {
        let now = clock.now()?;
        Ok(Self {
            clock,
            inputs: Vec::new(),
            timers: Vec::new(),
            classes: Vec::new(),
            next_timeout_id: 0,
            next_seq: 0,
            last_event_time: now,
        })
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut C {
        &mut self.clock
    }

    pub fn get_last_event_time(&self) -> NtpTimestamp {
        self.last_event_time
    }

    /// At most one handler per fd; registering a second handler for an
    /// already-registered fd replaces the first.
    pub fn add_input_handler(
        &mut self,
        fd: RawFd,
        handler: impl FnMut(&mut Scheduler<C>, RawFd, NtpTimestamp) + 'static,
    ) {
        self.remove_input_handler(fd);
        self.inputs.push(InputSource {
            fd,
            handler: Box::new(handler),
        });
    }

    pub fn remove_input_handler(&mut self, fd: RawFd) {
        self.inputs.retain(|source| source.fd != fd);
    }

    pub fn new_timer_class(&mut self, min_spacing: NtpDuration) -> TimerClassId {
        self.classes.push(ClassState {
            min_spacing,
            last_scheduled: None,
        });
        TimerClassId(self.classes.len() - 1)
    }

    pub fn add_timeout(
        &mut self,
        after: NtpDuration,
        handler: impl FnMut(&mut Scheduler<C>, TimeoutId, NtpTimestamp) + 'static,
    ) -> TimeoutId {
        let deadline = self.last_event_time + after;
        self.insert_timer(deadline, handler)
    }

    pub fn add_timeout_in_class(
        &mut self,
        after: NtpDuration,
        class: TimerClassId,
        randomness: f64,
        handler: impl FnMut(&mut Scheduler<C>, TimeoutId, NtpTimestamp) + 'static,
    ) -> TimeoutId {
        let mut deadline = self.last_event_time + after;
        let state = &mut self.classes[class.0];
        if let Some(last) = state.last_scheduled {
            let min_deadline = last + state.min_spacing;
            if deadline < min_deadline {
                deadline = min_deadline;
            }
        }
        state.last_scheduled = Some(deadline);

        let jitter_bound = (after.to_seconds() * randomness).max(0.0);
        let jitter = if jitter_bound > 0.0 {
            rand::thread_rng().gen_range(0.0..=jitter_bound)
        } else {
            0.0
        };
        deadline = deadline + NtpDuration::from_seconds(jitter);

        self.insert_timer(deadline, handler)
    }

    fn insert_timer(
        &mut self,
        deadline: NtpTimestamp,
        handler: impl FnMut(&mut Scheduler<C>, TimeoutId, NtpTimestamp) + 'static,
    ) -> TimeoutId {
        let id = TimeoutId(self.next_timeout_id);
        self.next_timeout_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.timers.push(Timer {
            id,
            deadline,
            seq,
            handler: Box::new(handler),
        });
        id
    }

    /// Idempotent: a no-longer-live id (already fired, or never issued
    /// by this scheduler) is simply ignored.
    pub fn remove_timeout(&mut self, id: TimeoutId) {
        self.timers.retain(|timer| timer.id != id);
    }

    /// Shifts every pending deadline (and class bookkeeping) by `delta`
    /// so a clock step doesn't stall dispatch for the magnitude of the
    /// jump (spec §5, "Timeouts").
    pub fn reanchor_after_step(&mut self, delta: NtpDuration) {
        for timer in &mut self.timers {
            timer.deadline = timer.deadline + delta;
        }
        for class in &mut self.classes {
            if let Some(last) = class.last_scheduled {
                class.last_scheduled = Some(last + delta);
            }
        }
    }

    /// Runs one iteration: blocks in `poll(2)` until an fd is readable
    /// or the earliest timer is due, then dispatches everything that's
    /// ready — fds before timers, both in deterministic order.
    pub fn run_once(&mut self) -> Result<(), SchedulerError> {
        if self.inputs.is_empty() && self.timers.is_empty() {
            return Ok(());
        }

        let mut pollfds: Vec<libc::pollfd> = self
            .inputs
            .iter()
            .map(|source| libc::pollfd {
                fd: source.fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();

        let timeout_ms = self.compute_timeout_ms();

        let rc = loop {
            let rc = unsafe {
                libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms)
            };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(SchedulerError::Poll(err));
            }
            break rc;
        };

        self.last_event_time = self
            .clock
            .now()
            .map_err(|_| {
                SchedulerError::Poll(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "local clock read failed",
                ))
            })?;
        let now = self.last_event_time;

        if rc > 0 {
            self.dispatch_ready_inputs(&pollfds, now);
        }
        self.dispatch_expired_timers(now);

        Ok(())
    }

    fn compute_timeout_ms(&self) -> libc::c_int {
        match self.timers.iter().map(|t| t.deadline).min() {
            None => -1,
            Some(deadline) => {
                let remaining = (deadline - self.last_event_time).to_seconds();
                let ms = (remaining * 1000.0).ceil();
                if ms <= 0.0 {
                    0
                } else {
                    ms.min(i32::MAX as f64) as libc::c_int
                }
            }
        }
    }

    /// Ready fds are dispatched in registration order. A handler may
    /// legally remove itself (or others) mid-dispatch; the handler is
    /// taken out of storage before being called so that's never a
    /// borrow conflict.
    fn dispatch_ready_inputs(&mut self, pollfds: &[libc::pollfd], now: NtpTimestamp) {
        let ready: Vec<RawFd> = pollfds
            .iter()
            .filter(|pfd| pfd.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0)
            .map(|pfd| pfd.fd)
            .collect();

        for fd in ready {
            let Some(index) = self.inputs.iter().position(|source| source.fd == fd) else {
                continue;
            };
            let mut source = self.inputs.remove(index);
            (source.handler)(self, fd, now);
            if !self.inputs.iter().any(|s| s.fd == fd) {
                self.inputs.push(source);
            } else {
                // a handler re-registered this fd itself during the call;
                // honor that registration instead of the one we took out.
                drop(source);
            }
        }
    }

    /// Expired timers fire in `(deadline, insertion order)` order,
    /// matching the spec's stable tie-break.
    fn dispatch_expired_timers(&mut self, now: NtpTimestamp) {
        loop {
            let next = self
                .timers
                .iter()
                .enumerate()
                .filter(|(_, timer)| timer.deadline <= now)
                .min_by(|(_, a), (_, b)| {
                    a.deadline
                        .cmp(&b.deadline)
                        .then_with(|| a.seq.cmp(&b.seq))
                });
            let Some((index, _)) = next else {
                break;
            };
            let mut timer = self.timers.remove(index);
            (timer.handler)(self, timer.id, now);
        }
    }
}

impl std::fmt::Debug for TimeoutId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TimeoutId({})", self.0)
    }
}
