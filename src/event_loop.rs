//! Owns one poller, runs the reactor loop, executes cross-thread queued
//! tasks, owns a wake-up fd.

use std::cell::Cell;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use log::trace;

use crate::channel::{self, Channel, PollerStatus, SharedChannel};
use crate::poller::Poller;
use crate::syscall;

const POLL_TIMEOUT: Duration = Duration::from_secs(10);

type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    static LOOP_IN_THIS_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Tracks which channel dispatch is currently in flight, so `remove_channel`
/// can tell an in-handler self-removal from an attempt to yank an
/// unprocessed peer out from under the loop.
struct DispatchState {
    active_channels: Vec<SharedChannel>,
    current_index: Option<usize>,
}

struct EventLoopInner {
    thread_id: ThreadId,
    poller: Mutex<Poller>,
    dispatch: Mutex<DispatchState>,
    pending_tasks: Mutex<Vec<Task>>,
    looping: AtomicBool,
    quit: AtomicBool,
    event_handling: AtomicBool,
    calling_pending_functors: AtomicBool,
    iteration: AtomicU64,
    last_poll_return: Mutex<Instant>,
    wakeup_fd: OwnedFd,
    wakeup_channel: Mutex<Option<SharedChannel>>,
}

/// A non-owning back-reference from a [`Channel`] to the loop it belongs
/// to. The loop is guaranteed to outlive every channel it owns (channels
/// must be removed before the loop drops), so `upgrade` never fails in
/// practice. It panics rather than silently doing nothing if that
/// invariant is ever broken.
#[derive(Clone)]
pub(crate) struct LoopHandle(Weak<EventLoopInner>);

impl LoopHandle {
    pub(crate) fn upgrade(&self) -> EventLoop {
        EventLoop(
            self.0
                .upgrade()
                .expect("EventLoop dropped while one of its channels was still alive"),
        )
    }
}

/// One reactor: a poller, a cross-thread task queue, and a wake-up fd.
/// Cheaply cloneable: every clone refers to the same underlying loop.
#[derive(Clone)]
pub struct EventLoop(Arc<EventLoopInner>);

impl EventLoop {
    /// Binds a new loop to the calling thread. Panics if this thread
    /// already has one.
    pub fn new() -> EventLoop {
        LOOP_IN_THIS_THREAD.with(|flag| {
            assert!(
                !flag.get(),
                "EventLoop already exists for this thread ({:?})",
                thread::current().id()
            );
            flag.set(true);
        });

        let poller = Poller::new().expect("failed to create epoll instance");
        let wakeup_fd = create_eventfd().expect("failed to create eventfd");
        let wakeup_raw = wakeup_fd.as_raw_fd();

        let inner = Arc::new(EventLoopInner {
            thread_id: thread::current().id(),
            poller: Mutex::new(poller),
            dispatch: Mutex::new(DispatchState {
                active_channels: Vec::new(),
                current_index: None,
            }),
            pending_tasks: Mutex::new(Vec::new()),
            looping: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            event_handling: AtomicBool::new(false),
            calling_pending_functors: AtomicBool::new(false),
            iteration: AtomicU64::new(0),
            last_poll_return: Mutex::new(Instant::now()),
            wakeup_fd,
            wakeup_channel: Mutex::new(None),
        });

        let handle = LoopHandle(Arc::downgrade(&inner));
        let wakeup_channel = Channel::new(handle, wakeup_raw);
        {
            let mut c = wakeup_channel.lock().unwrap();
            c.set_read_callback(Box::new(move |_ts| {
                drain_wakeup(wakeup_raw);
            }));
        }
        wakeup_channel.lock().unwrap().enable_reading();
        *inner.wakeup_channel.lock().unwrap() = Some(wakeup_channel);

        EventLoop(inner)
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.0.thread_id
    }

    pub(crate) fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "EventLoop operation invoked off its owning thread"
        );
    }

    /// Runs the reactor: poll, dispatch readiness, run queued tasks, repeat
    /// until `quit()`.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        assert!(
            !self.0.looping.swap(true, Ordering::SeqCst),
            "EventLoop::run called while already looping"
        );
        self.0.quit.store(false, Ordering::SeqCst);
        trace!("EventLoop started looping on {:?}", self.0.thread_id);

        while !self.0.quit.load(Ordering::SeqCst) {
            let (receive_time, active) = {
                let mut poller = self.0.poller.lock().unwrap();
                poller
                    .poll(POLL_TIMEOUT)
                    .expect("epoll_wait failed unexpectedly")
            };
            *self.0.last_poll_return.lock().unwrap() = receive_time;

            {
                let mut dispatch = self.0.dispatch.lock().unwrap();
                dispatch.active_channels = active;
                dispatch.current_index = None;
            }

            self.0.event_handling.store(true, Ordering::SeqCst);
            let count = self.0.dispatch.lock().unwrap().active_channels.len();
            for i in 0..count {
                self.0.dispatch.lock().unwrap().current_index = Some(i);
                let channel = self.0.dispatch.lock().unwrap().active_channels[i].clone();
                channel::dispatch_channel_event(&channel, receive_time);
            }
            self.0.dispatch.lock().unwrap().current_index = None;
            self.0.event_handling.store(false, Ordering::SeqCst);

            self.0.iteration.fetch_add(1, Ordering::SeqCst);
            self.do_pending_tasks();
        }

        self.0.looping.store(false, Ordering::SeqCst);
        trace!("EventLoop stopped looping on {:?}", self.0.thread_id);
    }

    /// Requests termination after the current iteration. Safe to call from
    /// any thread; wakes the loop if called cross-thread.
    pub fn quit(&self) {
        self.0.quit.store(true, Ordering::SeqCst);
        if !self.is_in_loop_thread() {
            self.wake_up();
        }
    }

    /// Runs `f` synchronously if called from the loop's own thread,
    /// otherwise hands it off via [`EventLoop::queue_in_loop`].
    pub fn run_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            f();
        } else {
            self.queue_in_loop(f);
        }
    }

    /// Appends `f` to the pending-task queue, waking the loop if the caller
    /// is off-thread or the loop is mid-drain of its own queue (otherwise a
    /// task enqueued by a task would wait a whole extra iteration).
    pub fn queue_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        self.0.pending_tasks.lock().unwrap().push(Box::new(f));
        if !self.is_in_loop_thread() || self.0.calling_pending_functors.load(Ordering::SeqCst) {
            self.wake_up();
        }
    }

    fn do_pending_tasks(&self) {
        let tasks = {
            let mut queue = self.0.pending_tasks.lock().unwrap();
            std::mem::take(&mut *queue)
        };
        self.0.calling_pending_functors.store(true, Ordering::SeqCst);
        for task in tasks {
            task();
        }
        self.0.calling_pending_functors.store(false, Ordering::SeqCst);
    }

    fn wake_up(&self) {
        let mut file = borrow_fd(self.0.wakeup_fd.as_raw_fd());
        match file.write(&1u64.to_ne_bytes()) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                drain_wakeup(self.0.wakeup_fd.as_raw_fd());
            }
            Err(e) => panic!("write to wake-up fd failed: {e}"),
        }
    }

    pub(crate) fn has_channel(&self, fd: RawFd) -> bool {
        self.0.poller.lock().unwrap().has_channel(fd)
    }

    /// See [`Channel::update`]: `channel` is used for map storage only,
    /// never re-locked here.
    pub(crate) fn update_channel(
        &self,
        channel: SharedChannel,
        fd: RawFd,
        events: u32,
        status: PollerStatus,
    ) -> PollerStatus {
        self.assert_in_loop_thread();
        self.0
            .poller
            .lock()
            .unwrap()
            .update_channel(channel, fd, events, status)
    }

    pub(crate) fn remove_channel(&self, channel: SharedChannel, fd: RawFd, status: PollerStatus) {
        self.assert_in_loop_thread();
        if self.0.event_handling.load(Ordering::SeqCst) {
            let dispatch = self.0.dispatch.lock().unwrap();
            if let Some(idx) = dispatch.current_index {
                let is_current = Arc::ptr_eq(&dispatch.active_channels[idx], &channel);
                let is_unprocessed_peer = dispatch.active_channels[idx + 1..]
                    .iter()
                    .any(|c| Arc::ptr_eq(c, &channel));
                assert!(
                    is_current || !is_unprocessed_peer,
                    "channel removed while still an unprocessed peer in the active list"
                );
            }
        }
        self.0.poller.lock().unwrap().remove_channel(fd, status);
    }

    pub(crate) fn new_channel(&self, fd: RawFd) -> SharedChannel {
        Channel::new(LoopHandle(Arc::downgrade(&self.0)), fd)
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventLoopInner {
    fn drop(&mut self) {
        LOOP_IN_THIS_THREAD.with(|flag| flag.set(false));
    }
}

fn create_eventfd() -> io::Result<OwnedFd> {
    let raw = syscall!(eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC))?;
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

fn drain_wakeup(fd: RawFd) {
    let mut buf = [0u8; 8];
    let mut file = borrow_fd(fd);
    match file.read(&mut buf) {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => trace!("wake-up fd drain failed: {e}"),
    }
}

/// Borrows a fd we don't own (the wake-up fd lives in `EventLoopInner`) for
/// the duration of one read/write syscall.
fn borrow_fd(fd: RawFd) -> std::mem::ManuallyDrop<std::fs::File> {
    use std::os::fd::FromRawFd;
    std::mem::ManuallyDrop::new(unsafe { std::fs::File::from_raw_fd(fd) })
}
