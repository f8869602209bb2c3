use std::io;
use std::sync::Arc;

use crate::event_loop::LoopHandle;
use crate::event_loop_thread::EventLoopThread;

/// A fixed set of I/O loops fed from a base loop.
///
/// With `thread_num == 0` every lookup returns the base loop (everything
/// shares one reactor); otherwise `thread_num` dedicated loop threads are
/// spawned and handed out round-robin, or by hash for callers that need a
/// stable mapping.
pub struct EventLoopThreadPool {
    base: LoopHandle,
    name: String,
    started: bool,
    thread_num: usize,
    next: usize,
    threads: Vec<EventLoopThread>,
    loops: Vec<LoopHandle>,
}

impl EventLoopThreadPool {
    pub fn new(base: LoopHandle, name: &str) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base,
            name: name.to_owned(),
            started: false,
            thread_num: 0,
            next: 0,
            threads: Vec::new(),
            loops: Vec::new(),
        }
    }

    pub fn set_thread_num(&mut self, thread_num: usize) {
        assert!(!self.started, "set_thread_num after start");
        self.thread_num = thread_num;
    }

    pub fn start(&mut self) -> io::Result<()> {
        self.start_with_init(None)
    }

    /// Start the pool, running `init` on each loop thread (and on the base
    /// loop when there are no dedicated threads) before it serves events.
    pub fn start_with_init(
        &mut self,
        init: Option<Arc<dyn Fn() + Send + Sync>>,
    ) -> io::Result<()> {
        assert!(!self.started, "EventLoopThreadPool started twice");
        self.started = true;

        for i in 0..self.thread_num {
            let name = format!("{}{}", self.name, i);
            let mut thread = match &init {
                Some(init) => {
                    let init = init.clone();
                    EventLoopThread::with_init(&name, move |_| init())
                }
                None => EventLoopThread::new(&name),
            };
            self.loops.push(thread.start_loop()?);
            self.threads.push(thread);
        }
        if self.thread_num == 0 {
            if let Some(init) = init {
                self.base.run_in_loop(move || init());
            }
        }
        Ok(())
    }

    /// Round-robin loop assignment; valid after `start`.
    pub fn get_next_loop(&mut self) -> LoopHandle {
        assert!(self.started);
        if self.loops.is_empty() {
            return self.base.clone();
        }
        let handle = self.loops[self.next].clone();
        self.next = (self.next + 1) % self.loops.len();
        handle
    }

    /// Hash-stable assignment: the same `key` maps to the same loop across
    /// successive lookups.
    pub fn get_loop_for_hash(&self, key: u64) -> LoopHandle {
        assert!(self.started);
        if self.loops.is_empty() {
            return self.base.clone();
        }
        self.loops[(key % self.loops.len() as u64) as usize].clone()
    }

    pub fn all_loops(&self) -> Vec<LoopHandle> {
        assert!(self.started);
        if self.loops.is_empty() {
            vec![self.base.clone()]
        } else {
            self.loops.clone()
        }
    }

    pub fn base_loop(&self) -> &LoopHandle {
        &self.base
    }
}
