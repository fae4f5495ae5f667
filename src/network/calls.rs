//! Tracking RPC call yang sedang berjalan
//!
//! Setiap `Call` yang dikirim didaftarkan dengan (connection, message id).
//! Response dengan id yang sama (`Reply`, `Error`, `Canceled`) men-settle
//! future-nya. Connection yang mati menggagalkan semua call-nya.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use super::connection::ConnectionId;
use super::server::TransportHandle;
use crate::core::{Future, Promise};
use crate::error::{CallError, TransportError};
use crate::protocol::{Message, MessageType, Value};

type CallKey = (ConnectionId, u32);
type CallMap = Mutex<HashMap<CallKey, Promise<Value, CallError>>>;

/// Call yang menunggu response
#[derive(Clone, Default)]
pub struct PendingCalls {
    calls: Arc<CallMap>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Daftarkan `call` yang akan dikirim lewat `conn`.
    ///
    /// Cancel pada future menghapus call secara lokal; kirim
    /// `call.cancel_request()` untuk memberi tahu remote.
    pub fn track(&self, conn: ConnectionId, call: &Message) -> Future<Value, CallError> {
        let key = (conn, call.id());
        let weak: Weak<CallMap> = Arc::downgrade(&self.calls);
        let promise = Promise::with_cancel(move || {
            let Some(calls) = weak.upgrade() else { return };
            let promise = calls.lock().remove(&key);
            if let Some(promise) = promise {
                promise.set_canceled();
            }
        });
        let future = promise.future();
        self.calls.lock().insert(key, promise);
        future
    }

    /// Daftarkan `call` lalu kirim lewat `handle`.
    ///
    /// Jika transport menolak message, future langsung gagal:
    /// `Disconnected` untuk connection yang sudah tutup, `SendFailed`
    /// untuk penolakan lain (misalnya payload terlalu besar).
    pub fn send_call(
        &self,
        handle: &TransportHandle,
        conn: ConnectionId,
        call: Message,
    ) -> Future<Value, CallError> {
        let future = self.track(conn, &call);
        let id = call.id();
        if let Err(err) = handle.send(conn, call) {
            debug!(%conn, id, "call rejected by transport: {}", err);
            let error = match err {
                TransportError::NotConnected => CallError::Disconnected,
                other => CallError::SendFailed(other.to_string()),
            };
            let promise = self.calls.lock().remove(&(conn, id));
            if let Some(promise) = promise {
                promise.set_error(error);
            }
        }
        future
    }

    /// Settle call yang cocok dengan `response`.
    ///
    /// Returns `false` jika message bukan response atau tidak ada call
    /// dengan id tersebut.
    pub fn resolve(&self, conn: ConnectionId, response: &Message) -> bool {
        if !response.msg_type().is_response() {
            return false;
        }
        let promise = self.calls.lock().remove(&(conn, response.id()));
        let Some(promise) = promise else {
            debug!(%conn, id = response.id(), "response for unknown call");
            return false;
        };

        match response.msg_type() {
            MessageType::Reply => {
                promise.set_result(response.value().map_err(CallError::from));
            }
            MessageType::Error => {
                let message = response
                    .error_message()
                    .unwrap_or_else(|| "malformed error payload".to_string());
                promise.set_error(CallError::Remote(message));
            }
            _ => {
                promise.set_canceled();
            }
        }
        true
    }

    /// Gagalkan semua call di `conn` dengan `Disconnected`
    pub fn fail_connection(&self, conn: ConnectionId) -> usize {
        let failed: Vec<_> = {
            let mut calls = self.calls.lock();
            let keys: Vec<CallKey> = calls.keys().filter(|(c, _)| *c == conn).copied().collect();
            keys.iter().filter_map(|key| calls.remove(key)).collect()
        };
        if !failed.is_empty() {
            debug!(%conn, count = failed.len(), "failing in-flight calls");
        }
        for promise in &failed {
            promise.set_error(CallError::Disconnected);
        }
        failed.len()
    }

    /// Gagalkan semua call (transport berhenti)
    pub fn fail_all(&self) -> usize {
        let failed: Vec<_> = self.calls.lock().drain().map(|(_, p)| p).collect();
        for promise in &failed {
            promise.set_error(CallError::Disconnected);
        }
        failed.len()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }
}
