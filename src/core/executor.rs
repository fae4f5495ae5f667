//! Execution context: tempat job dijalankan
//!
//! `ThreadPool` adalah implementasi default: N worker thread yang
//! mengambil job dari satu queue, ditambah satu timer thread untuk job
//! yang ditunda (`async_delay`).

use std::cell::Cell;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use super::future::{Future, Promise};
use crate::error::StrandError;

/// Unit kerja untuk execution context
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Interface thread pool yang dipakai oleh `Strand`
pub trait ExecutionContext: Send + Sync {
    /// Jalankan `job` secepatnya.
    ///
    /// `Err(job)` jika context sudah berhenti dan job tidak akan pernah
    /// dijalankan.
    fn post(&self, job: Job) -> Result<(), Job>;

    /// Jalankan `job` tidak lebih awal dari `delay`.
    ///
    /// Future selesai setelah job berjalan; cancel sebelum itu membuat
    /// job tidak dijalankan.
    fn async_delay(&self, job: Job, delay: Duration) -> Future<()>;

    /// Jalankan `job` tidak lebih awal dari `deadline` (monotonic)
    fn async_at(&self, job: Job, deadline: Instant) -> Future<()> {
        self.async_delay(job, deadline.saturating_duration_since(Instant::now()))
    }

    /// Apakah thread pemanggil adalah thread milik context ini
    fn is_in_current_context(&self) -> bool;
}

/// Pesan panic sebagai string
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "callback panicked".to_string()
    }
}

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// Id pool pemilik thread ini (0 = bukan worker)
    static CURRENT_POOL: Cell<usize> = Cell::new(0);
}

struct JobQueue {
    jobs: VecDeque<Job>,
    stopping: bool,
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    job: Job,
    promise: Promise<()>,
    canceled: Arc<AtomicBool>,
}

// Min-heap berdasarkan (deadline, seq)
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
    stopping: bool,
}

struct PoolInner {
    id: usize,
    queue: Mutex<JobQueue>,
    job_ready: Condvar,
    timers: Mutex<TimerQueue>,
    timer_changed: Condvar,
}

impl PoolInner {
    fn push(&self, job: Job) -> Result<(), Job> {
        let mut queue = self.queue.lock();
        if queue.stopping {
            debug!(pool = self.id, "pool stopping, rejecting posted job");
            return Err(job);
        }
        queue.jobs.push_back(job);
        drop(queue);
        self.job_ready.notify_one();
        Ok(())
    }

    fn worker_loop(&self) {
        CURRENT_POOL.with(|c| c.set(self.id));
        loop {
            let job = {
                let mut queue = self.queue.lock();
                loop {
                    if let Some(job) = queue.jobs.pop_front() {
                        break Some(job);
                    }
                    if queue.stopping {
                        break None;
                    }
                    self.job_ready.wait(&mut queue);
                }
            };
            let Some(job) = job else { break };
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                warn!(
                    pool = self.id,
                    "job panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
        CURRENT_POOL.with(|c| c.set(0));
    }

    fn timer_loop(&self) {
        loop {
            let due = {
                let mut timers = self.timers.lock();
                loop {
                    if timers.stopping {
                        return;
                    }
                    let next = timers.heap.peek().map(|entry| entry.deadline);
                    match next {
                        Some(deadline) if deadline <= Instant::now() => break timers.heap.pop(),
                        Some(deadline) => {
                            self.timer_changed.wait_until(&mut timers, deadline);
                        }
                        None => self.timer_changed.wait(&mut timers),
                    }
                }
            };
            let Some(entry) = due else { continue };
            if entry.canceled.load(Ordering::Acquire) {
                trace!(pool = self.id, seq = entry.seq, "delayed job canceled");
                continue;
            }
            let TimerEntry { job, promise, .. } = entry;
            let rejected = promise.clone();
            let pushed = self.push(Box::new(move || {
                match panic::catch_unwind(AssertUnwindSafe(job)) {
                    Ok(()) => {
                        promise.set_value(());
                    }
                    Err(payload) => {
                        promise.set_error(StrandError::CallbackFailed(panic_message(
                            payload.as_ref(),
                        )));
                    }
                }
            }));
            if pushed.is_err() {
                rejected.set_error(StrandError::Dying);
            }
        }
    }
}

/// Thread pool dengan timer
pub struct ThreadPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadPool {
    /// Membuat pool dengan `threads` worker (minimal 1)
    pub fn new(threads: usize) -> io::Result<Self> {
        let inner = Arc::new(PoolInner {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            queue: Mutex::new(JobQueue {
                jobs: VecDeque::new(),
                stopping: false,
            }),
            job_ready: Condvar::new(),
            timers: Mutex::new(TimerQueue {
                heap: BinaryHeap::new(),
                next_seq: 0,
                stopping: false,
            }),
            timer_changed: Condvar::new(),
        });

        let pool = Self {
            inner: inner.clone(),
            workers: Mutex::new(Vec::new()),
            timer: Mutex::new(None),
        };

        for index in 0..threads.max(1) {
            let worker = inner.clone();
            let handle = thread::Builder::new()
                .name(format!("courier-pool-{}-{}", inner.id, index))
                .spawn(move || worker.worker_loop())?;
            pool.workers.lock().push(handle);
        }

        let timer = inner.clone();
        let handle = thread::Builder::new()
            .name(format!("courier-timer-{}", inner.id))
            .spawn(move || timer.timer_loop())?;
        *pool.timer.lock() = Some(handle);

        debug!(pool = inner.id, threads = threads.max(1), "thread pool started");
        Ok(pool)
    }

    /// Pool dengan satu worker per CPU
    pub fn with_default_size() -> io::Result<Self> {
        let threads = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self::new(threads)
    }

    /// Jumlah job yang menunggu di queue
    pub fn pending_jobs(&self) -> usize {
        self.inner.queue.lock().jobs.len()
    }

    /// Hentikan semua thread. Job yang sudah di queue tetap dijalankan,
    /// delayed job yang belum jatuh tempo gagal dengan `Dying`.
    pub fn stop(&self) {
        self.inner.queue.lock().stopping = true;
        self.inner.job_ready.notify_all();

        let pending = {
            let mut timers = self.inner.timers.lock();
            timers.stopping = true;
            std::mem::take(&mut timers.heap)
        };
        self.inner.timer_changed.notify_all();
        for entry in pending.into_vec() {
            entry.promise.set_error(StrandError::Dying);
        }

        let current = thread::current().id();
        let mut handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        handles.extend(self.timer.lock().take());
        for handle in handles {
            // Pool di-drop dari dalam job-nya sendiri: jangan join diri sendiri
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!(pool = self.inner.id, "pool thread panicked");
            }
        }
    }
}

impl ExecutionContext for ThreadPool {
    fn post(&self, job: Job) -> Result<(), Job> {
        self.inner.push(job)
    }

    fn async_delay(&self, job: Job, delay: Duration) -> Future<()> {
        let canceled = Arc::new(AtomicBool::new(false));
        let slot: Arc<Mutex<Option<Promise<()>>>> = Arc::new(Mutex::new(None));

        let flag = canceled.clone();
        let weak_slot = Arc::downgrade(&slot);
        let promise = Promise::with_cancel(move || {
            flag.store(true, Ordering::Release);
            if let Some(slot) = weak_slot.upgrade() {
                if let Some(promise) = slot.lock().take() {
                    promise.set_canceled();
                }
            }
        });
        *slot.lock() = Some(promise.clone());
        let future = promise.future();

        let mut timers = self.inner.timers.lock();
        if timers.stopping {
            drop(timers);
            promise.set_error(StrandError::Dying);
            return future;
        }
        let seq = timers.next_seq;
        timers.next_seq += 1;
        timers.heap.push(TimerEntry {
            deadline: Instant::now() + delay,
            seq,
            job,
            promise,
            canceled,
        });
        drop(timers);
        self.inner.timer_changed.notify_one();

        // Slot hanya perlu hidup selama future bisa di-cancel
        future.on_settled(move |_| drop(slot));
        future
    }

    fn is_in_current_context(&self) -> bool {
        CURRENT_POOL.with(|c| c.get()) == self.inner.id
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_post_runs_on_worker() {
        let pool = ThreadPool::new(2).unwrap();
        assert!(!pool.is_in_current_context());

        let (tx, rx) = mpsc::channel();
        let pool = Arc::new(pool);
        let p = pool.clone();
        let posted = pool.post(Box::new(move || {
            tx.send(p.is_in_current_context()).unwrap();
        }));
        assert!(posted.is_ok());
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let pool = ThreadPool::new(1).unwrap();
        let (tx, rx) = mpsc::channel();
        assert!(pool.post(Box::new(|| panic!("boom"))).is_ok());
        assert!(pool.post(Box::new(move || tx.send(42).unwrap())).is_ok());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }

    #[test]
    fn test_async_delay_respects_deadline() {
        let pool = ThreadPool::new(1).unwrap();
        let start = Instant::now();
        let (tx, rx) = mpsc::channel();
        let future = pool.async_delay(
            Box::new(move || tx.send(Instant::now()).unwrap()),
            Duration::from_millis(30),
        );
        assert_eq!(future.wait(), Ok(()));
        let ran_at = rx.recv().unwrap();
        assert!(ran_at.duration_since(start) >= Duration::from_millis(30));
    }

    #[test]
    fn test_delayed_jobs_ordered_by_deadline() {
        let pool = ThreadPool::new(1).unwrap();
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        let late = pool.async_delay(Box::new(move || tx.send(2).unwrap()), Duration::from_millis(40));
        let early = pool.async_delay(Box::new(move || tx2.send(1).unwrap()), Duration::from_millis(5));
        early.wait().unwrap();
        late.wait().unwrap();
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_cancel_delayed_job() {
        let pool = ThreadPool::new(1).unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        let future = pool.async_delay(
            Box::new(move || r.store(true, Ordering::SeqCst)),
            Duration::from_millis(50),
        );
        future.cancel();
        assert_eq!(future.wait(), Err(StrandError::Canceled));
        thread::sleep(Duration::from_millis(100));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_stop_fails_pending_timers() {
        let pool = ThreadPool::new(1).unwrap();
        let future = pool.async_delay(Box::new(|| {}), Duration::from_secs(60));
        drop(pool);
        assert_eq!(future.wait(), Err(StrandError::Dying));
    }

    #[test]
    fn test_post_after_stop_is_rejected() {
        let pool = ThreadPool::new(1).unwrap();
        pool.stop();
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        let rejected = pool.post(Box::new(move || r.store(true, Ordering::SeqCst)));
        let Err(job) = rejected else {
            panic!("stopped pool accepted a job");
        };
        // Job dikembalikan utuh ke pemanggil
        job();
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(
            pool.async_delay(Box::new(|| {}), Duration::from_millis(1)).result(),
            Some(Err(StrandError::Dying))
        );
    }
}
