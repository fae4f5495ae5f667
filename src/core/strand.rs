//! Strand: antrian FIFO per-owner di atas `ExecutionContext`
//!
//! Jaminan:
//! - Tidak ada dua task dari strand yang sama berjalan bersamaan
//! - Task yang siap dijalankan sesuai urutan masuk
//! - Task boleh submit task baru ke strand yang sama (reentrant)
//! - `join()` dari dalam strand tidak deadlock
//!
//! Semua state dijaga satu mutex. Callback user, settle promise dan
//! cancel timer selalu dilakukan setelah lock dilepas.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use super::executor::{panic_message, ExecutionContext, Job};
use super::future::{Future, Promise};
use crate::config::StrandConfig;
use crate::error::StrandError;

/// Perilaku task yang di-cancel sebelum sempat berjalan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CancelOption {
    /// Future jadi canceled dan callback tidak pernah dijalankan
    #[default]
    Skip,
    /// Future jadi canceled, tapi callback tetap dijalankan
    /// (untuk cleanup yang wajib terjadi)
    NeverSkip,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionOptions {
    pub on_cancel: CancelOption,
}

impl ExecutionOptions {
    pub fn never_skip() -> Self {
        Self {
            on_cancel: CancelOption::NeverSkip,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    /// Terdaftar, menunggu timer
    None,
    Scheduled,
    Running,
    /// Di-cancel dengan `NeverSkip`: tetap dijalankan
    Canceled,
}

type Callback = Box<dyn FnOnce() -> Result<(), String> + Send>;

struct Task {
    state: TaskState,
    callback: Option<Callback>,
    promise: Promise<()>,
    options: ExecutionOptions,
    /// Timer execution context untuk task yang ditunda
    timer: Option<Future<()>>,
}

struct StrandState {
    tasks: HashMap<u32, Task>,
    queue: VecDeque<u32>,
    next_id: u32,
    processing: bool,
    dying: bool,
}

static NEXT_STRAND_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// Strand yang sedang diproses di thread ini (bisa bertumpuk)
    static CURRENT_STRANDS: RefCell<Vec<usize>> = RefCell::new(Vec::new());
}

/// Menandai thread sebagai "di dalam strand" selama guard hidup
struct ContextMarker;

impl ContextMarker {
    fn enter(id: usize) -> Self {
        CURRENT_STRANDS.with(|s| s.borrow_mut().push(id));
        ContextMarker
    }
}

impl Drop for ContextMarker {
    fn drop(&mut self) {
        CURRENT_STRANDS.with(|s| {
            s.borrow_mut().pop();
        });
    }
}

/// Satu putaran `process` yang di-post ke execution context.
///
/// Di-drop tanpa dijalankan (context berhenti atau membuang job-nya)
/// berarti `processing` tidak akan pernah di-reset, jadi strand
/// di-abandon.
struct ProcessJob(Option<Arc<StrandInner>>);

impl ProcessJob {
    fn run(mut self) {
        if let Some(inner) = self.0.take() {
            inner.process();
        }
    }
}

impl Drop for ProcessJob {
    fn drop(&mut self) {
        if let Some(inner) = self.0.take() {
            inner.abandon();
        }
    }
}

enum LoopExit {
    Idle,
    Dying,
    QuantumExpired,
}

fn run_callback(callback: Callback) -> Result<(), StrandError> {
    match panic::catch_unwind(AssertUnwindSafe(callback)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(msg)) => Err(StrandError::CallbackFailed(msg)),
        Err(payload) => Err(StrandError::CallbackFailed(panic_message(payload.as_ref()))),
    }
}

struct StrandInner {
    id: usize,
    context: Arc<dyn ExecutionContext>,
    quantum: Duration,
    state: Mutex<StrandState>,
    process_finished: Condvar,
}

impl StrandInner {
    fn is_in_this_context(&self) -> bool {
        CURRENT_STRANDS.with(|s| s.borrow().contains(&self.id))
    }

    /// Daftarkan task baru dengan state `None`
    fn register(
        self: &Arc<Self>,
        callback: Callback,
        options: ExecutionOptions,
    ) -> Result<(u32, Future<()>), StrandError> {
        let mut state = self.state.lock();
        if state.dying {
            return Err(StrandError::Dying);
        }
        let id = state.next_id;
        state.next_id = state.next_id.wrapping_add(1);

        let weak: Weak<StrandInner> = Arc::downgrade(self);
        let promise = Promise::with_cancel(move || {
            if let Some(inner) = weak.upgrade() {
                inner.cancel(id);
            }
        });
        let future = promise.future();
        state.tasks.insert(
            id,
            Task {
                state: TaskState::None,
                callback: Some(callback),
                promise,
                options,
                timer: None,
            },
        );
        Ok((id, future))
    }

    fn submit(
        self: &Arc<Self>,
        callback: Callback,
        delay: Duration,
        options: ExecutionOptions,
        allow_inline: bool,
    ) -> Future<()> {
        if allow_inline && delay.is_zero() && self.is_in_this_context() {
            if self.state.lock().dying {
                return Future::failed(StrandError::Dying);
            }
            trace!(strand = self.id, "running task inline");
            let promise = Promise::new();
            promise.set_result(run_callback(callback));
            return promise.future();
        }

        let (id, future) = match self.register(callback, options) {
            Ok(registered) => registered,
            Err(err) => return Future::failed(err),
        };

        if delay.is_zero() {
            self.enqueue(id);
            return future;
        }

        trace!(strand = self.id, task = id, ?delay, "scheduling delayed task");
        let weak = Arc::downgrade(self);
        let timer = self.context.async_delay(
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.enqueue(id);
                }
            }),
            delay,
        );
        if let Some(task) = self.state.lock().tasks.get_mut(&id) {
            task.timer = Some(timer.clone());
        }
        let weak = Arc::downgrade(self);
        timer.on_settled(move |result| {
            if matches!(result, Err(StrandError::Dying)) {
                if let Some(inner) = weak.upgrade() {
                    inner.fail_unscheduled(id);
                }
            }
        });
        future
    }

    /// Pindahkan task ke queue dan jadwalkan processing jika perlu
    fn enqueue(self: &Arc<Self>, id: u32) {
        let schedule = {
            let mut state = self.state.lock();
            let dying = state.dying;
            let Some(task) = state.tasks.get_mut(&id) else {
                trace!(strand = self.id, task = id, "task gone, not enqueueing");
                return;
            };
            match task.state {
                TaskState::None | TaskState::Canceled => {}
                _ => return,
            }
            if dying {
                let task = state.tasks.remove(&id);
                drop(state);
                if let Some(task) = task {
                    task.promise.set_error(StrandError::Dying);
                }
                return;
            }
            if task.state == TaskState::None {
                task.state = TaskState::Scheduled;
            }
            state.queue.push_back(id);
            trace!(strand = self.id, task = id, "task enqueued");

            if state.processing {
                false
            } else {
                state.processing = true;
                true
            }
        };
        if schedule {
            self.schedule_process();
        }
    }

    fn schedule_process(self: &Arc<Self>) {
        let job = ProcessJob(Some(self.clone()));
        if let Err(rejected) = self.context.post(Box::new(move || job.run())) {
            debug!(strand = self.id, "execution context rejected process job");
            drop(rejected);
        }
    }

    /// Tidak ada lagi yang akan menjalankan queue: strand jadi dying dan
    /// semua task gagal dengan `Dying`.
    fn abandon(&self) {
        warn!(strand = self.id, "process job dropped by execution context, failing pending tasks");
        let drained = {
            let mut state = self.state.lock();
            state.dying = true;
            state.processing = false;
            self.process_finished.notify_all();
            take_all(&mut state)
        };
        settle_dying(drained);
    }

    /// Timer task gagal tanpa pernah men-enqueue task-nya
    fn fail_unscheduled(&self, id: u32) {
        let task = {
            let mut state = self.state.lock();
            match state.tasks.get(&id) {
                Some(task) if matches!(task.state, TaskState::None | TaskState::Canceled) => {
                    state.tasks.remove(&id)
                }
                _ => None,
            }
        };
        if let Some(task) = task {
            debug!(strand = self.id, task = id, "delay timer failed, task dropped");
            task.promise.set_error(StrandError::Dying);
        }
    }

    fn process(self: &Arc<Self>) {
        let start = Instant::now();
        let exit = {
            let _marker = ContextMarker::enter(self.id);
            loop {
                let (id, callback, promise) = {
                    let mut state = self.state.lock();
                    if state.dying {
                        break LoopExit::Dying;
                    }
                    let Some(id) = state.queue.pop_front() else {
                        state.processing = false;
                        self.process_finished.notify_all();
                        break LoopExit::Idle;
                    };
                    let Some(task) = state.tasks.get_mut(&id) else {
                        // Di-cancel setelah masuk queue
                        continue;
                    };
                    if !matches!(task.state, TaskState::Scheduled | TaskState::Canceled) {
                        continue;
                    }
                    task.state = TaskState::Running;
                    (id, task.callback.take(), task.promise.clone())
                };

                trace!(strand = self.id, task = id, "executing task");
                let result = match callback {
                    Some(callback) => run_callback(callback),
                    None => Ok(()),
                };
                if let Err(err) = &result {
                    warn!(strand = self.id, task = id, "task failed: {}", err);
                }
                self.state.lock().tasks.remove(&id);
                promise.set_result(result);

                if start.elapsed() >= self.quantum {
                    break LoopExit::QuantumExpired;
                }
            }
        };

        match exit {
            LoopExit::Idle => {}
            LoopExit::Dying => {
                debug!(strand = self.id, "strand is dying, stopping process");
                let drained = {
                    let mut state = self.state.lock();
                    let drained = take_all(&mut state);
                    state.processing = false;
                    self.process_finished.notify_all();
                    drained
                };
                settle_dying(drained);
            }
            LoopExit::QuantumExpired => {
                let drained = {
                    let mut state = self.state.lock();
                    if !state.dying && !state.queue.is_empty() {
                        // `processing` tetap true sampai putaran berikutnya
                        drop(state);
                        trace!(strand = self.id, "quantum expired, rescheduling");
                        self.schedule_process();
                        return;
                    }
                    state.processing = false;
                    self.process_finished.notify_all();
                    take_all_if_dying(&mut state)
                };
                settle_dying(drained);
            }
        }
    }

    fn cancel(&self, id: u32) {
        let (promise, timer, callback) = {
            let mut state = self.state.lock();
            let Some(task) = state.tasks.get_mut(&id) else {
                return;
            };
            match (task.state, task.options.on_cancel) {
                (TaskState::None | TaskState::Scheduled, CancelOption::Skip) => {
                    debug!(strand = self.id, task = id, "task canceled before running");
                    match state.tasks.remove(&id) {
                        Some(task) => (task.promise, task.timer, task.callback),
                        None => return,
                    }
                }
                (TaskState::None | TaskState::Scheduled, CancelOption::NeverSkip) => {
                    debug!(strand = self.id, task = id, "task canceled, still executing");
                    task.state = TaskState::Canceled;
                    (task.promise.clone(), None, None)
                }
                _ => {
                    trace!(strand = self.id, task = id, "too late for canceling");
                    return;
                }
            }
        };
        // Callback yang di-skip di-drop di luar lock
        drop(callback);
        if let Some(timer) = timer {
            timer.cancel();
        }
        promise.set_canceled();
    }

    fn join(&self) {
        let drained = {
            let mut state = self.state.lock();
            debug!(
                strand = self.id,
                processing = state.processing,
                tasks = state.tasks.len(),
                "joining"
            );
            state.dying = true;

            if self.is_in_this_context() {
                debug!(strand = self.id, "joining from inside the strand");
                return;
            }

            while state.processing {
                self.process_finished.wait(&mut state);
            }
            take_all(&mut state)
        };
        if !drained.is_empty() {
            debug!(strand = self.id, remaining = drained.len(), "joined with pending tasks");
        }
        settle_dying(drained);
    }
}

/// Ambil semua task yang tersisa, urut sesuai id
fn take_all(state: &mut StrandState) -> Vec<Task> {
    state.queue.clear();
    let mut tasks: Vec<(u32, Task)> = state.tasks.drain().collect();
    tasks.sort_by_key(|(id, _)| *id);
    tasks.into_iter().map(|(_, task)| task).collect()
}

fn take_all_if_dying(state: &mut StrandState) -> Vec<Task> {
    if state.dying {
        take_all(state)
    } else {
        Vec::new()
    }
}

fn settle_dying(tasks: Vec<Task>) {
    for task in tasks {
        if let Some(timer) = task.timer {
            timer.cancel();
        }
        task.promise.set_error(StrandError::Dying);
    }
}

/// Eksekutor serial: task-task yang dikirim ke satu strand tidak pernah
/// berjalan bersamaan, dan dijalankan sesuai urutan masuk.
///
/// Strand di-join saat di-drop.
pub struct Strand {
    inner: Arc<StrandInner>,
}

impl Strand {
    /// Strand di atas `context` dengan konfigurasi dari environment
    pub fn new(context: Arc<dyn ExecutionContext>) -> Self {
        Self::with_config(context, StrandConfig::from_env())
    }

    pub fn with_config(context: Arc<dyn ExecutionContext>, config: StrandConfig) -> Self {
        let id = NEXT_STRAND_ID.fetch_add(1, Ordering::Relaxed);
        debug!(strand = id, quantum = ?config.quantum, "new strand");
        Self {
            inner: Arc::new(StrandInner {
                id,
                context,
                quantum: config.quantum,
                state: Mutex::new(StrandState {
                    tasks: HashMap::new(),
                    queue: VecDeque::new(),
                    next_id: 1,
                    processing: false,
                    dying: false,
                }),
                process_finished: Condvar::new(),
            }),
        }
    }

    /// Fire-and-forget. Panic di dalam `f` ditangkap dan di-log.
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let future = self.async_call(f);
        if future.has_error() && !future.is_canceled() {
            debug!(strand = self.inner.id, "post on a dying strand ignored");
        }
    }

    /// Jadwalkan `f`. Future selesai setelah `f` berjalan.
    pub fn async_call<F>(&self, f: F) -> Future<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.async_call_with(f, ExecutionOptions::default())
    }

    pub fn async_call_with<F>(&self, f: F, options: ExecutionOptions) -> Future<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner
            .submit(wrap(f), Duration::ZERO, options, false)
    }

    /// Seperti `async_call`, tapi error dari `f` men-settle future
    /// dengan `CallbackFailed`.
    pub fn try_async_call<F, E>(&self, f: F) -> Future<()>
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
        E: Display,
    {
        let callback: Callback = Box::new(move || f().map_err(|e| e.to_string()));
        self.inner
            .submit(callback, Duration::ZERO, ExecutionOptions::default(), false)
    }

    /// Jalankan `f` tidak lebih awal dari `delay`.
    ///
    /// Delay nol dari dalam strand ini dijalankan langsung (inline).
    pub fn async_delay<F>(&self, f: F, delay: Duration) -> Future<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.async_delay_with(f, delay, ExecutionOptions::default())
    }

    pub fn async_delay_with<F>(&self, f: F, delay: Duration, options: ExecutionOptions) -> Future<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.submit(wrap(f), delay, options, true)
    }

    /// Jalankan `f` tidak lebih awal dari `deadline` (monotonic)
    pub fn async_at<F>(&self, f: F, deadline: Instant) -> Future<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.async_at_with(f, deadline, ExecutionOptions::default())
    }

    pub fn async_at_with<F>(&self, f: F, deadline: Instant, options: ExecutionOptions) -> Future<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let delay = deadline.saturating_duration_since(Instant::now());
        self.inner.submit(wrap(f), delay, options, true)
    }

    /// Seperti `async_delay` tapi tidak pernah inline, selalu lewat queue
    pub fn defer<F>(&self, f: F, delay: Duration) -> Future<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.defer_with(f, delay, ExecutionOptions::default())
    }

    pub fn defer_with<F>(&self, f: F, delay: Duration, options: ExecutionOptions) -> Future<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.submit(wrap(f), delay, options, false)
    }

    /// Bungkus `f` menjadi fungsi yang menjalankan `f` di strand ini.
    ///
    /// Fungsi hasil tidak menahan strand tetap hidup; setelah strand
    /// di-join atau di-drop, hasilnya `Dying`.
    pub fn scheduler_for<A, F>(&self, f: F) -> impl Fn(A) -> Future<()> + Send + Sync + 'static
    where
        A: Send + 'static,
        F: Fn(A) + Send + Sync + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        let f = Arc::new(f);
        move |arg: A| match weak.upgrade() {
            Some(inner) => {
                let f = f.clone();
                inner.submit(
                    Box::new(move || {
                        f(arg);
                        Ok(())
                    }),
                    Duration::ZERO,
                    ExecutionOptions::default(),
                    false,
                )
            }
            None => Future::failed(StrandError::Dying),
        }
    }

    /// Tandai strand sebagai dying, tunggu quantum yang sedang berjalan,
    /// lalu gagalkan semua task yang tersisa dengan `Dying`.
    ///
    /// Dari dalam task strand ini, `join` langsung kembali dan sisa
    /// pekerjaan diselesaikan setelah task tersebut selesai.
    ///
    /// Jangan panggil dari worker satu-satunya milik execution context:
    /// quantum yang sedang berjalan butuh worker itu untuk selesai.
    pub fn join(&self) {
        self.inner.join();
    }

    pub fn is_in_this_context(&self) -> bool {
        self.inner.is_in_this_context()
    }

    /// Jumlah task yang belum selesai (queued, delayed, atau running)
    pub fn pending_tasks(&self) -> usize {
        self.inner.state.lock().tasks.len()
    }

    pub fn is_dying(&self) -> bool {
        self.inner.state.lock().dying
    }
}

fn wrap<F>(f: F) -> Callback
where
    F: FnOnce() + Send + 'static,
{
    Box::new(move || {
        f();
        Ok(())
    })
}

impl ExecutionContext for Strand {
    fn post(&self, job: Job) -> Result<(), Job> {
        if self.is_dying() {
            return Err(job);
        }
        Strand::post(self, job);
        Ok(())
    }

    fn async_delay(&self, job: Job, delay: Duration) -> Future<()> {
        Strand::async_delay(self, job, delay)
    }

    fn is_in_current_context(&self) -> bool {
        self.is_in_this_context()
    }
}

impl Drop for Strand {
    fn drop(&mut self) {
        self.join();
    }
}
