//! Binds one fd to its owning loop and routes readiness bits to callbacks.

use std::any::Any;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use log::warn;

use crate::event_loop::LoopHandle;

pub(crate) const READ_EVENTS: u32 = (libc::EPOLLIN | libc::EPOLLPRI) as u32;
pub(crate) const WRITE_EVENTS: u32 = libc::EPOLLOUT as u32;
const NONE_EVENTS: u32 = 0;

/// Where a [`Channel`] stands with respect to the poller's fd→channel map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollerStatus {
    /// Never registered.
    New,
    /// Present in the map and in the kernel's interest list.
    Added,
    /// Present in the map but currently `DisableAll`'d (`EPOLL_CTL_DEL`'d).
    Deleted,
}

type ReadCallback = Box<dyn FnMut(Instant) + Send>;
type EventCallback = Box<dyn FnMut() + Send>;

/// Shared handle to a [`Channel`]; the poller's map and a loop's active list
/// both hold clones of this, never the `Channel` itself.
pub(crate) type SharedChannel = Arc<Mutex<Channel>>;

pub(crate) struct Channel {
    loop_handle: LoopHandle,
    self_weak: Weak<Mutex<Channel>>,
    fd: RawFd,
    events: u32,
    revents: u32,
    status: PollerStatus,
    tie: Option<Weak<dyn Any + Send + Sync>>,
    event_handling: bool,
    read_callback: Option<ReadCallback>,
    write_callback: Option<EventCallback>,
    close_callback: Option<EventCallback>,
    error_callback: Option<EventCallback>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("events", &self.events)
            .field("revents", &self.revents)
            .field("status", &self.status)
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(loop_handle: LoopHandle, fd: RawFd) -> SharedChannel {
        Arc::new_cyclic(|weak| {
            Mutex::new(Channel {
                loop_handle,
                self_weak: weak.clone(),
                fd,
                events: NONE_EVENTS,
                revents: NONE_EVENTS,
                status: PollerStatus::New,
                tie: None,
                event_handling: false,
                read_callback: None,
                write_callback: None,
                close_callback: None,
                error_callback: None,
            })
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn events(&self) -> u32 {
        self.events
    }

    pub(crate) fn status(&self) -> PollerStatus {
        self.status
    }

    pub(crate) fn set_revents(&mut self, revents: u32) {
        self.revents = revents;
    }

    pub(crate) fn is_none_event(&self) -> bool {
        self.events == NONE_EVENTS
    }

    pub(crate) fn is_event_handling(&self) -> bool {
        self.event_handling
    }

    pub(crate) fn set_read_callback(&mut self, cb: ReadCallback) {
        self.read_callback = Some(cb);
    }

    pub(crate) fn set_write_callback(&mut self, cb: EventCallback) {
        self.write_callback = Some(cb);
    }

    pub(crate) fn set_close_callback(&mut self, cb: EventCallback) {
        self.close_callback = Some(cb);
    }

    pub(crate) fn set_error_callback(&mut self, cb: EventCallback) {
        self.error_callback = Some(cb);
    }

    /// Weak back-reference used to guard readiness dispatch against a
    /// vanished owner; see [`dispatch_channel_event`].
    pub(crate) fn tie(&mut self, owner: Weak<dyn Any + Send + Sync>) {
        self.tie = Some(owner);
    }

    fn self_arc(&self) -> SharedChannel {
        self.self_weak
            .upgrade()
            .expect("channel outlives its own Arc")
    }

    pub(crate) fn enable_reading(&mut self) {
        self.events |= READ_EVENTS;
        self.update();
    }

    pub(crate) fn disable_reading(&mut self) {
        self.events &= !READ_EVENTS;
        self.update();
    }

    pub(crate) fn enable_writing(&mut self) {
        self.events |= WRITE_EVENTS;
        self.update();
    }

    pub(crate) fn disable_writing(&mut self) {
        self.events &= !WRITE_EVENTS;
        self.update();
    }

    pub(crate) fn is_writing(&self) -> bool {
        self.events & WRITE_EVENTS != 0
    }

    pub(crate) fn disable_all(&mut self) {
        self.events = NONE_EVENTS;
        self.update();
    }

    /// Synchronizes `events`/`status` with the poller. Takes the Arc for
    /// map storage only, never re-locks `self`, since the caller already
    /// holds this channel's mutex.
    fn update(&mut self) {
        let new_status = self
            .loop_handle
            .upgrade()
            .update_channel(self.self_arc(), self.fd, self.events, self.status);
        self.status = new_status;
    }

    pub(crate) fn remove(&self) {
        assert!(self.is_none_event(), "channel must be DisableAll'd before remove");
        self.loop_handle
            .upgrade()
            .remove_channel(self.self_arc(), self.fd, self.status);
    }
}

/// Dispatches one readiness notification for `channel`. Order is
/// significant: a tie upgrade failure (owner already gone) short-circuits
/// everything else. Callbacks are taken out of the channel before being
/// invoked so a callback that re-enters this channel (e.g. `disable_all`)
/// never tries to re-lock a mutex this call is already holding.
pub(crate) fn dispatch_channel_event(channel: &SharedChannel, receive_time: Instant) {
    let (tie, revents, fd) = {
        let c = channel.lock().unwrap();
        (c.tie.clone(), c.revents, c.fd)
    };
    let _keep_alive = match &tie {
        Some(weak) => match weak.upgrade() {
            Some(strong) => Some(strong),
            None => return,
        },
        None => None,
    };

    channel.lock().unwrap().event_handling = true;

    if revents & libc::EPOLLHUP as u32 != 0 && revents & libc::EPOLLIN as u32 == 0 {
        let taken = channel.lock().unwrap().close_callback.take();
        if let Some(mut cb) = taken {
            cb();
            restore_event_cb(channel, |c| &mut c.close_callback, cb);
        }
    }
    if revents & libc::EPOLLERR as u32 != 0 {
        let taken = channel.lock().unwrap().error_callback.take();
        if let Some(mut cb) = taken {
            cb();
            restore_event_cb(channel, |c| &mut c.error_callback, cb);
        }
    }
    if revents & (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP) as u32 != 0 {
        let taken = channel.lock().unwrap().read_callback.take();
        match taken {
            Some(mut cb) => {
                cb(receive_time);
                restore_read_cb(channel, cb);
            }
            None => warn!("channel fd={fd} readable with no read callback set"),
        }
    }
    if revents & libc::EPOLLOUT as u32 != 0 {
        let taken = channel.lock().unwrap().write_callback.take();
        if let Some(mut cb) = taken {
            cb();
            restore_event_cb(channel, |c| &mut c.write_callback, cb);
        }
    }

    channel.lock().unwrap().event_handling = false;
}

fn restore_event_cb(
    channel: &SharedChannel,
    slot: impl FnOnce(&mut Channel) -> &mut Option<EventCallback>,
    cb: EventCallback,
) {
    let mut c = channel.lock().unwrap();
    let slot = slot(&mut c);
    if slot.is_none() {
        *slot = Some(cb);
    }
}

fn restore_read_cb(channel: &SharedChannel, cb: ReadCallback) {
    let mut c = channel.lock().unwrap();
    if c.read_callback.is_none() {
        c.read_callback = Some(cb);
    }
}
