//! Promise / Future dengan semantik settle-once
//!
//! `Promise` adalah sisi producer, `Future` sisi consumer. Keduanya
//! berbagi satu slot hasil; hanya settle pertama yang menang, settle
//! berikutnya mengembalikan `false`.
//!
//! Tidak ada callback (cancel handler, continuation) yang dijalankan
//! sambil memegang lock internal.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::StrandError;

/// Error yang punya representasi "canceled"
pub trait Cancellation {
    fn canceled() -> Self;
    fn is_canceled(&self) -> bool;
}

type CancelHandler = Box<dyn FnOnce() + Send>;
type Continuation<T, E> = Box<dyn FnOnce(&Result<T, E>) + Send>;

struct State<T, E> {
    result: Option<Arc<Result<T, E>>>,
    cancel_handler: Option<CancelHandler>,
    continuations: Vec<Continuation<T, E>>,
}

struct Shared<T, E> {
    state: Mutex<State<T, E>>,
    settled: Condvar,
}

impl<T, E> Shared<T, E> {
    fn settle(&self, result: Result<T, E>) -> bool {
        let (result, continuations) = {
            let mut state = self.state.lock();
            if state.result.is_some() {
                return false;
            }
            let result = Arc::new(result);
            state.result = Some(result.clone());
            state.cancel_handler = None;
            (result, std::mem::take(&mut state.continuations))
        };
        self.settled.notify_all();
        for continuation in continuations {
            continuation(&result);
        }
        true
    }
}

/// Sisi producer
pub struct Promise<T, E = StrandError> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T, E> Default for Promise<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Promise<T, E> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    result: None,
                    cancel_handler: None,
                    continuations: Vec::new(),
                }),
                settled: Condvar::new(),
            }),
        }
    }

    /// Promise dengan handler yang dipanggil saat `Future::cancel()`.
    ///
    /// Handler dipanggil paling banyak sekali, dan hanya jika promise
    /// belum settle. Handler yang memutuskan apakah promise di-settle.
    pub fn with_cancel<F>(handler: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let promise = Self::new();
        promise.shared.state.lock().cancel_handler = Some(Box::new(handler));
        promise
    }

    pub fn future(&self) -> Future<T, E> {
        Future {
            shared: self.shared.clone(),
        }
    }

    /// Returns `false` jika promise sudah settle sebelumnya
    pub fn set_value(&self, value: T) -> bool {
        self.shared.settle(Ok(value))
    }

    pub fn set_error(&self, error: E) -> bool {
        self.shared.settle(Err(error))
    }

    pub fn set_result(&self, result: Result<T, E>) -> bool {
        self.shared.settle(result)
    }

    pub fn is_settled(&self) -> bool {
        self.shared.state.lock().result.is_some()
    }
}

impl<T, E: Cancellation> Promise<T, E> {
    pub fn set_canceled(&self) -> bool {
        self.shared.settle(Err(E::canceled()))
    }
}

/// Sisi consumer. Bisa di-clone; semua clone melihat hasil yang sama.
pub struct Future<T, E = StrandError> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Clone for Future<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Future<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl<T, E> Future<T, E> {
    /// Future yang sudah selesai dengan `value`
    pub fn ready(value: T) -> Self {
        let promise = Promise::new();
        promise.set_value(value);
        promise.future()
    }

    /// Future yang sudah gagal dengan `error`
    pub fn failed(error: E) -> Self {
        let promise = Promise::new();
        promise.set_error(error);
        promise.future()
    }

    #[inline(always)]
    pub fn is_ready(&self) -> bool {
        self.shared.state.lock().result.is_some()
    }

    pub fn has_value(&self) -> bool {
        matches!(self.shared.state.lock().result.as_deref(), Some(Ok(_)))
    }

    pub fn has_error(&self) -> bool {
        matches!(self.shared.state.lock().result.as_deref(), Some(Err(_)))
    }

    /// Minta pembatalan. Tidak berpengaruh jika sudah settle atau tidak
    /// ada cancel handler.
    pub fn cancel(&self) {
        let handler = self.shared.state.lock().cancel_handler.take();
        if let Some(handler) = handler {
            handler();
        }
    }

    /// Jalankan `f` saat future settle. Jika sudah settle, `f` langsung
    /// dijalankan di thread pemanggil.
    pub fn on_settled<F>(&self, f: F)
    where
        F: FnOnce(&Result<T, E>) + Send + 'static,
    {
        let result = {
            let mut state = self.shared.state.lock();
            match &state.result {
                Some(result) => result.clone(),
                None => {
                    state.continuations.push(Box::new(f));
                    return;
                }
            }
        };
        f(&result);
    }

    fn wait_shared(&self, deadline: Option<Instant>) -> Option<Arc<Result<T, E>>> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(result) = &state.result {
                return Some(result.clone());
            }
            match deadline {
                Some(deadline) => {
                    if self.shared.settled.wait_until(&mut state, deadline).timed_out() {
                        return state.result.clone();
                    }
                }
                None => self.shared.settled.wait(&mut state),
            }
        }
    }
}

impl<T: Clone, E: Clone> Future<T, E> {
    /// Block sampai settle.
    ///
    /// Deadlock jika dipanggil dari thread yang harus menjalankan
    /// pekerjaan yang men-settle future ini.
    pub fn wait(&self) -> Result<T, E> {
        loop {
            if let Some(result) = self.wait_shared(None) {
                return (*result).clone();
            }
        }
    }

    /// Block paling lama `timeout`. `None` jika belum settle.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, E>> {
        self.wait_shared(Some(Instant::now() + timeout))
            .map(|result| (*result).clone())
    }

    /// Hasil jika sudah settle, tanpa blocking
    pub fn result(&self) -> Option<Result<T, E>> {
        self.shared
            .state
            .lock()
            .result
            .as_deref()
            .cloned()
    }
}

impl<T, E: Cancellation> Future<T, E> {
    /// Apakah future settle sebagai canceled
    pub fn is_canceled(&self) -> bool {
        matches!(
            self.shared.state.lock().result.as_deref(),
            Some(Err(e)) if e.is_canceled()
        )
    }
}
