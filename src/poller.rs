//! Registers/updates channels with epoll and returns the active set.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use log::{error, trace};

use crate::channel::{PollerStatus, SharedChannel};
use crate::syscall;

const INITIAL_EVENT_LIST_SIZE: usize = 16;

pub(crate) struct Poller {
    epoll_fd: OwnedFd,
    channels: HashMap<RawFd, SharedChannel>,
    event_list: Vec<libc::epoll_event>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        let raw = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(Poller {
            epoll_fd: unsafe { OwnedFd::from_raw_fd(raw) },
            channels: HashMap::new(),
            event_list: vec![unsafe { std::mem::zeroed() }; INITIAL_EVENT_LIST_SIZE],
        })
    }

    pub(crate) fn has_channel(&self, fd: RawFd) -> bool {
        self.channels.contains_key(&fd)
    }

    /// Blocks up to `timeout`, returns the wall-clock time of return and the
    /// channels that became ready.
    pub(crate) fn poll(&mut self, timeout: Duration) -> io::Result<(Instant, Vec<SharedChannel>)> {
        let n = match syscall!(epoll_wait(
            self.epoll_fd.as_raw_fd(),
            self.event_list.as_mut_ptr(),
            self.event_list.len() as libc::c_int,
            timeout.as_millis() as libc::c_int,
        )) {
            Ok(n) => n as usize,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                return Ok((Instant::now(), Vec::new()));
            }
            Err(e) => return Err(e),
        };
        let receive_time = Instant::now();

        let mut active = Vec::with_capacity(n);
        for ev in &self.event_list[..n] {
            let fd = ev.u64 as RawFd;
            if let Some(channel) = self.channels.get(&fd) {
                channel.lock().unwrap().set_revents(ev.events as u32);
                active.push(channel.clone());
            }
        }

        if n == self.event_list.len() {
            self.event_list.resize(n * 2, unsafe { std::mem::zeroed() });
        }

        Ok((receive_time, active))
    }

    /// Takes `fd`/`events`/`status` by value rather than re-reading them off
    /// `channel`; the caller already holds that channel's mutex, and
    /// locking it again here would deadlock. `channel` itself is only used
    /// for map storage. Returns the channel's new status.
    pub(crate) fn update_channel(
        &mut self,
        channel: SharedChannel,
        fd: RawFd,
        events: u32,
        status: PollerStatus,
    ) -> PollerStatus {
        match status {
            PollerStatus::New | PollerStatus::Deleted => {
                if matches!(status, PollerStatus::New) {
                    self.channels.insert(fd, channel);
                }
                self.ctl(libc::EPOLL_CTL_ADD, fd, events);
                PollerStatus::Added
            }
            PollerStatus::Added => {
                if events == 0 {
                    self.ctl(libc::EPOLL_CTL_DEL, fd, events);
                    PollerStatus::Deleted
                } else {
                    self.ctl(libc::EPOLL_CTL_MOD, fd, events);
                    PollerStatus::Added
                }
            }
        }
    }

    pub(crate) fn remove_channel(&mut self, fd: RawFd, status: PollerStatus) {
        self.channels.remove(&fd);
        if matches!(status, PollerStatus::Added) {
            self.ctl(libc::EPOLL_CTL_DEL, fd, 0);
        }
    }

    /// `epoll_ctl(ADD|MOD)` failure is a design-invariant violation and is
    /// fatal; `DEL` failure is merely logged (the fd may already be gone).
    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let result = syscall!(epoll_ctl(self.epoll_fd.as_raw_fd(), op, fd, &mut ev));
        match (op, result) {
            (libc::EPOLL_CTL_DEL, Err(e)) => {
                error!("epoll_ctl(DEL) failed for fd={fd}: {e}");
            }
            (_, Err(e)) => {
                panic!("epoll_ctl({op}) failed for fd={fd}: {e}");
            }
            (_, Ok(_)) => {
                trace!("epoll_ctl({op}) fd={fd} events={events:#x}");
            }
        }
    }
}
