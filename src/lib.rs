// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A fixed-size worker pool for self-spawning tasks that detects its own
//! quiescence.
//!
//! The pool runs a fixed number of worker threads over a shared FIFO task
//! queue. Executing a task may produce follow-up tasks, which the pool feeds
//! back into the same queue. Because new work appears as a side effect of
//! running existing work, nobody can tell the pool "that was the last task".
//! Instead the pool watches for the moment the queue is empty while every
//! worker is simultaneously blocked waiting: at that point no task is in
//! flight, so nothing can ever repopulate the queue, and the pool shuts
//! itself down. [`Pool::join`] blocks the caller until that happens.
//!
//! A workload plugs in through the [`Worker`] trait:
//!
//! ```rust
//! pub trait Worker: Send + Sync + 'static {
//!     type Task: Send + 'static;
//!
//!     fn execute(&self, task: Self::Task) -> Vec<Self::Task>;
//! }
//! ```
//!
//! `execute` returns the follow-up tasks instead of pushing them itself, so
//! workload code never touches the queue and can be unit-tested in
//! isolation. One worker instance is shared by every thread in the pool;
//! shared mutable state (accumulators, visit marks) lives behind the
//! worker's own locks.
//!
//! # Examples
//!
//! A worker that splits every task in two until the payload reaches zero.
//! However the resulting task tree is scheduled across the threads, the
//! pool quiesces only after all `2^(n + 1) - 1` tasks have run:
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! use quiesce::{Pool, Worker};
//!
//! struct Splitter {
//!     executed: AtomicUsize,
//! }
//!
//! impl Worker for Splitter {
//!     type Task = u32;
//!
//!     fn execute(&self, depth: u32) -> Vec<u32> {
//!         self.executed.fetch_add(1, Ordering::SeqCst);
//!         if depth == 0 {
//!             Vec::new()
//!         } else {
//!             vec![depth - 1, depth - 1]
//!         }
//!     }
//! }
//!
//! let worker = Arc::new(Splitter {
//!     executed: AtomicUsize::new(0),
//! });
//! let pool = Pool::new(4, Arc::clone(&worker));
//! pool.spawn(7);
//! pool.join();
//! assert_eq!(worker.executed.load(Ordering::SeqCst), 255);
//! ```
//!
//! The [`graph`] module ships the driving workload: a parallel graph
//! traversal that sums the values of every node reachable from a root.
//!
//! ```
//! use std::sync::Arc;
//!
//! use quiesce::graph::{Graph, Traversal};
//! use quiesce::Pool;
//!
//! // Two paths lead to node 2; its value is counted once.
//! let graph = Graph::new(vec![1, 2, 3], &[(0, 1), (0, 2), (1, 2)]);
//! let traversal = Arc::new(Traversal::new(graph));
//!
//! let pool = Pool::new(4, Arc::clone(&traversal));
//! pool.spawn(0);
//! pool.join();
//!
//! assert_eq!(traversal.sum(), 6);
//! ```

pub mod graph;

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

/// A workload executed by the pool's threads.
///
/// Every thread in the pool calls [`execute`] on the same shared instance,
/// so implementations guard their mutable state with interior locks. The
/// returned vector holds follow-up tasks; the pool pushes them onto its
/// queue after `execute` returns, so no pool lock is ever held across
/// workload code.
///
/// [`execute`]: Worker::execute
pub trait Worker: Send + Sync + 'static {
    /// The typed, owned payload of a single task.
    type Task: Send + 'static;

    /// Run one task to completion and return the tasks it spawns.
    fn execute(&self, task: Self::Task) -> Vec<Self::Task>;
}

/// State guarded by the single pool lock.
///
/// The quiescence protocol has to observe the queue contents and the
/// waiting-worker count atomically, so they live behind one mutex.
struct PoolState<T> {
    queue: VecDeque<T>,
    /// Workers currently blocked with no task available.
    waiting: usize,
    /// Set by the first push. Until then an empty queue with every worker
    /// parked means "not started yet", not "finished".
    seeded: bool,
    /// Latched once quiescence is declared; never cleared.
    done: bool,
}

struct PoolSharedData<W>
where
    W: Worker,
{
    name: Option<String>,
    stack_size: Option<usize>,
    worker: Arc<W>,
    state: Mutex<PoolState<W::Task>>,
    /// Workers park here when the queue is empty; the initiator parks here
    /// in `join`. Woken one at a time on push, broadcast on quiescence.
    quiescent: Condvar,
    worker_count: usize,
    panic_count: AtomicUsize,
    /// Handles of every live worker thread. Replacement threads spawned
    /// after a panic are appended by the dying thread's sentinel.
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl<W: Worker> PoolSharedData<W> {
    /// Blocking pop. Returns `None` once global quiescence is declared.
    ///
    /// A worker that finds the queue empty counts itself as waiting. The
    /// worker whose wait brings the count to the full pool size is the one
    /// that proves quiescence: the queue is empty, every other worker is
    /// parked, and it itself runs nothing, so no future push is possible.
    /// It latches `done` and broadcasts so the remaining workers and the
    /// initiator all observe the shutdown.
    fn next_task(&self) -> Option<W::Task> {
        let mut state = self.state.lock();
        loop {
            if state.done {
                return None;
            }
            if let Some(task) = state.queue.pop_front() {
                return Some(task);
            }
            state.waiting += 1;
            if state.seeded && state.waiting == self.worker_count {
                // Undo our own increment: this worker never blocks, and
                // the woken waiters undo theirs as they exit, so the
                // count drains to zero by the time every thread is
                // joined.
                state.waiting -= 1;
                state.done = true;
                self.quiescent.notify_all();
                return None;
            }
            self.quiescent.wait(&mut state);
            // The wait is over, whether a task arrived or the pool shut
            // down, so this worker no longer counts as blocked.
            state.waiting -= 1;
        }
    }

    /// Append tasks to the queue tail and wake one waiter per task.
    fn push_all(&self, tasks: Vec<W::Task>) {
        if tasks.is_empty() {
            return;
        }
        let wakeups = tasks.len();
        let mut state = self.state.lock();
        state.seeded = true;
        state.queue.extend(tasks);
        for _ in 0..wakeups {
            self.quiescent.notify_one();
        }
    }

    /// Block until quiescence has been declared.
    ///
    /// A pool that was never seeded can never declare quiescence on its
    /// own, so the initiator latches the shutdown itself and returns
    /// immediately.
    fn wait_quiescent(&self) {
        let mut state = self.state.lock();
        if !state.seeded {
            state.done = true;
            self.quiescent.notify_all();
            return;
        }
        while !state.done {
            self.quiescent.wait(&mut state);
        }
    }

    /// Force shutdown, discarding any tasks still queued.
    fn shutdown(&self) {
        let mut state = self.state.lock();
        state.done = true;
        state.queue.clear();
        self.quiescent.notify_all();
    }
}

fn spawn_in_pool<W>(shared_data: Arc<PoolSharedData<W>>)
where
    W: Worker,
{
    let mut builder = thread::Builder::new();
    if let Some(ref name) = shared_data.name {
        builder = builder.name(name.clone());
    }
    if let Some(stack_size) = shared_data.stack_size {
        builder = builder.stack_size(stack_size);
    }
    let worker_data = Arc::clone(&shared_data);
    let handle = builder
        .spawn(move || {
            // Will spawn a replacement thread on panic unless it is
            // cancelled.
            let sentinel = Sentinel::<W>::new(Arc::clone(&worker_data));

            while let Some(task) = worker_data.next_task() {
                let followups = worker_data.worker.execute(task);
                worker_data.push_all(followups);
            }

            sentinel.cancel();
        })
        .expect("quiesce: failed to spawn worker thread");
    shared_data.handles.lock().push(handle);
}

struct Sentinel<W>
where
    W: Worker,
{
    shared_data: Arc<PoolSharedData<W>>,
    active: bool,
}

impl<W: Worker> Sentinel<W> {
    fn new(shared_data: Arc<PoolSharedData<W>>) -> Sentinel<W> {
        Sentinel {
            shared_data,
            active: true,
        }
    }

    /// Cancel and destroy this sentinel.
    fn cancel(mut self) {
        self.active = false;
    }
}

impl<W: Worker> Drop for Sentinel<W> {
    fn drop(&mut self) {
        if self.active {
            if thread::panicking() {
                self.shared_data.panic_count.fetch_add(1, Ordering::SeqCst);
            }
            // The waiting count is compared against the full pool size, so
            // a lost thread must be replaced or the pool would never again
            // see every worker parked at once.
            spawn_in_pool::<W>(Arc::clone(&self.shared_data));
        }
    }
}

/// [`Pool`] factory, which can be used in order to configure the properties
/// of the [`Pool`].
///
/// The three configuration options available:
///
/// * `num_threads`: number of worker threads spawned by the built [`Pool`]
/// * `thread_name`: thread name for each of the threads spawned by the built
///   [`Pool`]
/// * `thread_stack_size`: stack size (in bytes) for each of the threads
///   spawned by the built [`Pool`]
///
/// # Examples
///
/// Build a [`Pool`] of eight threads, each with a 8 MB stack:
///
/// ```
/// # use std::sync::Arc;
/// # use quiesce::{Builder, Worker};
/// # struct Nop;
/// # impl Worker for Nop {
/// #     type Task = ();
/// #     fn execute(&self, _: ()) -> Vec<()> {
/// #         Vec::new()
/// #     }
/// # }
/// let pool = Builder::new()
///     .num_threads(8)
///     .thread_stack_size(8_000_000)
///     .build(Arc::new(Nop));
/// # pool.join();
/// ```
#[derive(Clone, Default)]
pub struct Builder {
    num_threads: Option<usize>,
    thread_name: Option<String>,
    thread_stack_size: Option<usize>,
}

impl Builder {
    /// Initiate a new [`Builder`].
    pub fn new() -> Builder {
        Builder {
            num_threads: None,
            thread_name: None,
            thread_stack_size: None,
        }
    }

    /// Set the number of worker threads spawned by the built [`Pool`]. If
    /// not specified, defaults to the number of CPUs.
    ///
    /// The pool size is fixed for the pool's whole life; quiescence
    /// detection counts idle workers against it.
    ///
    /// # Panics
    ///
    /// This method will panic if `num_threads` is 0.
    pub fn num_threads(mut self, num_threads: usize) -> Builder {
        assert!(num_threads > 0);
        self.num_threads = Some(num_threads);
        self
    }

    /// Set the thread name for each of the threads spawned by the built
    /// [`Pool`]. If not specified, the threads are unnamed.
    ///
    /// # Examples
    ///
    /// ```
    /// # use std::sync::Arc;
    /// # use quiesce::{Builder, Worker};
    /// # struct Named;
    /// # impl Worker for Named {
    /// #     type Task = ();
    /// #     fn execute(&self, _: ()) -> Vec<()> {
    /// #         assert_eq!(std::thread::current().name(), Some("visitor"));
    /// #         Vec::new()
    /// #     }
    /// # }
    /// let pool = Builder::new()
    ///     .thread_name("visitor".into())
    ///     .build(Arc::new(Named));
    /// pool.spawn(());
    /// pool.join();
    /// ```
    pub fn thread_name(mut self, name: String) -> Builder {
        self.thread_name = Some(name);
        self
    }

    /// Set the stack size (in bytes) for each of the threads spawned by the
    /// built [`Pool`]. If not specified, threads get the [`std::thread`]
    /// default.
    pub fn thread_stack_size(mut self, size: usize) -> Builder {
        self.thread_stack_size = Some(size);
        self
    }

    /// Finalize the [`Builder`] and build the [`Pool`] around the given
    /// shared worker.
    ///
    /// The worker threads start immediately and park until the first task
    /// is [spawned](Pool::spawn).
    pub fn build<W>(self, worker: Arc<W>) -> Pool<W>
    where
        W: Worker,
    {
        let num_threads = self.num_threads.unwrap_or_else(num_cpus::get);

        let shared_data = Arc::new(PoolSharedData {
            name: self.thread_name,
            stack_size: self.thread_stack_size,
            worker,
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                waiting: 0,
                seeded: false,
                done: false,
            }),
            quiescent: Condvar::new(),
            worker_count: num_threads,
            panic_count: AtomicUsize::new(0),
            handles: Mutex::new(Vec::with_capacity(num_threads)),
        });

        for _ in 0..num_threads {
            spawn_in_pool::<W>(Arc::clone(&shared_data));
        }

        Pool { shared_data }
    }
}

/// A fixed-size pool of worker threads that runs self-spawning tasks to
/// quiescence.
///
/// The pool is one-shot: seed it with [`spawn`], let the task graph fan
/// out, and call [`join`] to block until no further work can ever be
/// produced. After quiescence the worker threads have exited and later
/// spawns are never run.
///
/// [`spawn`]: Pool::spawn
/// [`join`]: Pool::join
pub struct Pool<W>
where
    W: Worker,
{
    shared_data: Arc<PoolSharedData<W>>,
}

impl<W: Worker> Pool<W> {
    /// Creates a new pool of `num_threads` worker threads around the given
    /// shared worker.
    ///
    /// # Panics
    ///
    /// This function will panic if `num_threads` is 0.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    ///
    /// use quiesce::graph::{Graph, Traversal};
    /// use quiesce::Pool;
    ///
    /// let graph = Graph::new(vec![5], &[]);
    /// let traversal = Arc::new(Traversal::new(graph));
    /// let pool = Pool::new(4, Arc::clone(&traversal));
    /// pool.spawn(0);
    /// pool.join();
    /// assert_eq!(traversal.sum(), 5);
    /// ```
    pub fn new(num_threads: usize, worker: Arc<W>) -> Pool<W> {
        Builder::new().num_threads(num_threads).build(worker)
    }

    /// Push a task onto the queue and wake one idle worker.
    ///
    /// Non-blocking beyond lock contention. The first spawn arms
    /// quiescence detection: from then on, an empty queue with every
    /// worker idle shuts the pool down. A task spawned after the pool has
    /// quiesced is never run.
    pub fn spawn(&self, task: W::Task) {
        self.shared_data.push_all(vec![task]);
    }

    /// Returns the number of tasks waiting in the queue.
    pub fn queued_count(&self) -> usize {
        self.shared_data.state.lock().queue.len()
    }

    /// Returns the number of workers currently blocked with no task
    /// available.
    pub fn waiting_count(&self) -> usize {
        self.shared_data.state.lock().waiting
    }

    /// Returns the fixed number of worker threads in the pool.
    pub fn worker_count(&self) -> usize {
        self.shared_data.worker_count
    }

    /// Returns the number of panicked tasks over the lifetime of the pool.
    ///
    /// A panicking task is treated as having completed with no follow-ups:
    /// its thread is replaced and the pool keeps running.
    ///
    /// # Examples
    ///
    /// ```
    /// # use std::sync::Arc;
    /// # use quiesce::{Pool, Worker};
    /// # struct Faulty;
    /// # impl Worker for Faulty {
    /// #     type Task = u32;
    /// #     fn execute(&self, n: u32) -> Vec<u32> {
    /// #         if n % 2 == 0 {
    /// #             panic!("intentional panic");
    /// #         }
    /// #         Vec::new()
    /// #     }
    /// # }
    /// let pool = Pool::new(4, Arc::new(Faulty));
    /// for n in 0..10 {
    ///     pool.spawn(n);
    /// }
    /// pool.join();
    /// assert_eq!(5, pool.panic_count());
    /// ```
    pub fn panic_count(&self) -> usize {
        self.shared_data.panic_count.load(Ordering::Relaxed)
    }

    /// Block the current thread until the pool is quiescent, then join
    /// every worker thread.
    ///
    /// Quiescence holds when the queue is empty and all workers are
    /// simultaneously idle; only then is it certain that no in-flight task
    /// can produce more work. Calling `join` on a pool that was never
    /// seeded returns immediately.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::atomic::{AtomicUsize, Ordering};
    /// use std::sync::Arc;
    ///
    /// use quiesce::{Pool, Worker};
    ///
    /// struct Chain(AtomicUsize);
    ///
    /// impl Worker for Chain {
    ///     type Task = u32;
    ///
    ///     fn execute(&self, remaining: u32) -> Vec<u32> {
    ///         self.0.fetch_add(1, Ordering::SeqCst);
    ///         if remaining == 0 {
    ///             Vec::new()
    ///         } else {
    ///             vec![remaining - 1]
    ///         }
    ///     }
    /// }
    ///
    /// let worker = Arc::new(Chain(AtomicUsize::new(0)));
    /// let pool = Pool::new(2, Arc::clone(&worker));
    /// pool.spawn(41);
    /// pool.join();
    /// assert_eq!(42, worker.0.load(Ordering::SeqCst));
    /// ```
    pub fn join(&self) {
        self.shared_data.wait_quiescent();
        self.join_workers();
    }

    /// Join every live worker thread.
    ///
    /// A panicked worker respawns its replacement from the dying thread,
    /// so new handles can appear while earlier ones are being joined; keep
    /// draining until a round comes up empty.
    fn join_workers(&self) {
        loop {
            let handles: Vec<_> = {
                let mut handles = self.shared_data.handles.lock();
                handles.drain(..).collect()
            };
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                let _ = handle.join();
            }
        }
    }
}

impl<W: Worker> Drop for Pool<W> {
    /// Dropping a pool that was not joined shuts it down immediately:
    /// queued tasks are discarded (their payloads dropped) and the worker
    /// threads are joined. In-flight tasks still run to completion.
    fn drop(&mut self) {
        self.shared_data.shutdown();
        self.join_workers();
    }
}

impl<W: Worker> fmt::Debug for Pool<W> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.shared_data.name)
            .field("queued_count", &self.queued_count())
            .field("workers", &self.worker_count())
            .finish()
    }
}
