//! One dedicated OS thread per `EventLoop`.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::event_loop::EventLoop;

type InitCallback = Box<dyn FnOnce(&EventLoop) + Send>;

struct Shared {
    mutex: Mutex<Option<EventLoop>>,
    condvar: Condvar,
}

/// Starts a thread that constructs an `EventLoop`, runs an optional init
/// callback on it, publishes the loop, then enters `EventLoop::run`.
pub struct EventLoopThread {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    pub fn new(name: impl Into<String>, init_callback: Option<InitCallback>) -> EventLoopThread {
        let shared = Arc::new(Shared {
            mutex: Mutex::new(None),
            condvar: Condvar::new(),
        });
        let thread_shared = shared.clone();

        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                let ev_loop = EventLoop::new();
                if let Some(cb) = init_callback {
                    cb(&ev_loop);
                }
                {
                    let mut slot = thread_shared.mutex.lock().unwrap();
                    *slot = Some(ev_loop.clone());
                    thread_shared.condvar.notify_one();
                }
                ev_loop.run();
            })
            .expect("failed to spawn event loop thread");

        EventLoopThread {
            shared,
            handle: Some(handle),
        }
    }

    /// Blocks until the spawned thread has published its loop, then
    /// returns a handle to it.
    pub fn start_loop(&self) -> EventLoop {
        let mut slot = self.shared.mutex.lock().unwrap();
        while slot.is_none() {
            slot = self.shared.condvar.wait(slot).unwrap();
        }
        slot.clone().unwrap()
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(ev_loop) = self.shared.mutex.lock().unwrap().clone() {
            ev_loop.quit();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_loop_blocks_until_published() {
        let thread = EventLoopThread::new("test-loop", None);
        let ev_loop = thread.start_loop();
        assert!(!ev_loop.is_in_loop_thread());
    }
}
