//! Base loop plus N worker `EventLoopThread`s, round-robin dispatched.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::event_loop::EventLoop;
use crate::event_loop_thread::EventLoopThread;

type InitCallback = Arc<dyn Fn(&EventLoop) + Send + Sync>;

pub struct EventLoopThreadPool {
    base_loop: EventLoop,
    num_threads: usize,
    threads: Vec<EventLoopThread>,
    worker_loops: Vec<EventLoop>,
    next: AtomicUsize,
    started: AtomicBool,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: EventLoop, num_threads: usize) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop,
            num_threads,
            threads: Vec::new(),
            worker_loops: Vec::new(),
            next: AtomicUsize::new(0),
            started: AtomicBool::new(false),
        }
    }

    /// May be called only once; starts `num_threads` worker threads, each
    /// running `init` (if given) before entering its reactor loop.
    pub fn start(&mut self, init: Option<InitCallback>) {
        self.base_loop.assert_in_loop_thread();
        assert!(
            !self.started.swap(true, Ordering::SeqCst),
            "EventLoopThreadPool::start called more than once"
        );

        for i in 0..self.num_threads {
            let name = format!("reactor-core-worker-{i}");
            let init_for_thread = init.clone();
            let thread = EventLoopThread::new(
                name,
                init_for_thread.map(|cb| -> Box<dyn FnOnce(&EventLoop) + Send> {
                    Box::new(move |l: &EventLoop| cb(l))
                }),
            );
            let worker_loop = thread.start_loop();
            self.worker_loops.push(worker_loop);
            self.threads.push(thread);
        }

        if self.num_threads == 0 {
            if let Some(cb) = init {
                cb(&self.base_loop);
            }
        }
    }

    /// Round-robins across worker loops; returns the base loop if there are
    /// no workers. Must be called on the base loop's thread.
    pub fn next_loop(&self) -> EventLoop {
        self.base_loop.assert_in_loop_thread();
        if self.worker_loops.is_empty() {
            return self.base_loop.clone();
        }
        let idx = self.next.fetch_add(1, Ordering::SeqCst) % self.worker_loops.len();
        self.worker_loops[idx].clone()
    }
}
