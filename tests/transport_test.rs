//! Transport Test - loopback TCP antara dua TransportServer
//!
//! Server echo di 127.0.0.1:0, client tanpa listener. Semua menunggu
//! lewat channel dengan timeout supaya test yang gagal tidak hang.
//!
//! Usage:
//!   cargo test --test transport_test
//!   RUST_LOG=courier=debug cargo test --test transport_test -- --nocapture

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use courier::core::{ExecutionContext, Strand, ThreadPool};
use courier::network::{ConnectionId, MessageHandler, PendingCalls, TransportHandle, TransportServer};
use courier::protocol::{Message, MessageType, Value};
use courier::{CallError, DisconnectReason, TransportConfig, TransportError};
use parking_lot::Mutex;

const TIMEOUT: Duration = Duration::from_secs(5);

const SERVICE: u32 = 1;
const OBJECT: u32 = 1;
const ACTION_ECHO: u32 = 100;
const ACTION_FAIL: u32 = 101;
const ACTION_HANG_UP: u32 = 102;

fn init_tracing() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

fn loopback() -> TransportConfig {
    TransportConfig::default().listen_on("127.0.0.1:0".parse().unwrap())
}

/// Polling sampai `cond` true atau timeout
fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Server: echo, error, atau tutup connection tergantung action
struct EchoHandler {
    handle: TransportHandle,
}

impl MessageHandler for EchoHandler {
    fn on_message(&self, conn: ConnectionId, message: Message) {
        if message.msg_type() != MessageType::Call {
            return;
        }
        match message.action() {
            ACTION_ECHO => {
                let mut reply = message.response(MessageType::Reply);
                reply.set_payload(message.payload().clone());
                let _ = self.handle.send(conn, reply);
            }
            ACTION_FAIL => {
                let mut reply = message.response(MessageType::Error);
                reply.set_error("boom").unwrap();
                let _ = self.handle.send(conn, reply);
            }
            ACTION_HANG_UP => self.handle.close(conn),
            _ => {}
        }
    }
}

fn start_echo_server(config: TransportConfig) -> TransportServer {
    init_tracing();
    TransportServer::start_with(config, |handle| Arc::new(EchoHandler { handle })).unwrap()
}

#[derive(Debug)]
enum ClientEvent {
    Connected(ConnectionId),
    Disconnected(ConnectionId, String),
}

/// Client: resolve reply ke `PendingCalls`, laporkan lifecycle lewat channel
struct ClientHandler {
    calls: PendingCalls,
    events: Mutex<mpsc::Sender<ClientEvent>>,
}

impl MessageHandler for ClientHandler {
    fn on_connected(&self, conn: ConnectionId) {
        let _ = self.events.lock().send(ClientEvent::Connected(conn));
    }

    fn on_message(&self, conn: ConnectionId, message: Message) {
        self.calls.resolve(conn, &message);
    }

    fn on_disconnected(&self, conn: ConnectionId, reason: &DisconnectReason) {
        self.calls.fail_connection(conn);
        let _ = self
            .events
            .lock()
            .send(ClientEvent::Disconnected(conn, reason.to_string()));
    }
}

struct Client {
    transport: TransportServer,
    calls: PendingCalls,
    events: mpsc::Receiver<ClientEvent>,
}

impl Client {
    fn start() -> Self {
        Self::start_with(TransportConfig::default())
    }

    fn start_with(config: TransportConfig) -> Self {
        let calls = PendingCalls::new();
        let (tx, events) = mpsc::channel();
        let handler = Arc::new(ClientHandler {
            calls: calls.clone(),
            events: Mutex::new(tx),
        });
        let transport = TransportServer::start(config, handler).unwrap();
        Self {
            transport,
            calls,
            events,
        }
    }

    fn connect(&self, addr: SocketAddr) -> ConnectionId {
        let conn = self.transport.handle().connect(addr).unwrap();
        match self.events.recv_timeout(TIMEOUT).unwrap() {
            ClientEvent::Connected(id) => assert_eq!(id, conn),
            other => panic!("unexpected event {:?}", other),
        }
        conn
    }

    fn call(&self, conn: ConnectionId, action: u32, value: &Value) -> courier::Future<Value, CallError> {
        let mut message = Message::call(SERVICE, OBJECT, action);
        message.set_value(value).unwrap();
        self.calls.send_call(&self.transport.handle(), conn, message)
    }

    fn next_disconnect(&self) -> (ConnectionId, String) {
        loop {
            match self.events.recv_timeout(TIMEOUT).unwrap() {
                ClientEvent::Disconnected(conn, reason) => return (conn, reason),
                ClientEvent::Connected(_) => continue,
            }
        }
    }
}

#[test]
fn test_call_reply_roundtrip() {
    let server = start_echo_server(loopback());
    let client = Client::start();
    let conn = client.connect(server.local_addr().unwrap());

    let value = Value::map(vec![
        (Value::from("name"), Value::from("canard")),
        (Value::from("legs"), Value::Int32(2)),
    ]);
    let reply = client.call(conn, ACTION_ECHO, &value).wait_timeout(TIMEOUT);
    assert_eq!(reply, Some(Ok(value)));
    assert!(client.calls.is_empty());
}

#[test]
fn test_remote_error() {
    let server = start_echo_server(loopback());
    let client = Client::start();
    let conn = client.connect(server.local_addr().unwrap());

    let reply = client.call(conn, ACTION_FAIL, &Value::Void).wait_timeout(TIMEOUT);
    assert_eq!(reply, Some(Err(CallError::Remote("boom".to_string()))));
}

#[test]
fn test_many_calls_resolve_to_their_own_reply() {
    let server = start_echo_server(loopback());
    let client = Client::start();
    let conn = client.connect(server.local_addr().unwrap());

    let futures: Vec<_> = (0..200i64)
        .map(|i| (i, client.call(conn, ACTION_ECHO, &Value::Int64(i))))
        .collect();
    for (i, future) in futures {
        assert_eq!(future.wait_timeout(TIMEOUT), Some(Ok(Value::Int64(i))));
    }
}

#[test]
fn test_large_raw_payload() {
    let server = start_echo_server(loopback());
    let client = Client::start();
    let conn = client.connect(server.local_addr().unwrap());

    let data: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let value = Value::Raw(Bytes::from(data));
    let reply = client.call(conn, ACTION_ECHO, &value).wait_timeout(TIMEOUT);
    assert_eq!(reply, Some(Ok(value)));
}

#[test]
fn test_disconnect_fails_pending_calls() {
    let server = start_echo_server(loopback());
    let client = Client::start();
    let conn = client.connect(server.local_addr().unwrap());

    let pending = client.call(conn, ACTION_ECHO, &Value::from("first"));
    assert!(pending.wait_timeout(TIMEOUT).is_some());

    // Call yang tidak akan pernah dibalas
    let orphan = client.calls.track(conn, &Message::call(SERVICE, OBJECT, 999));
    let _ = client.call(conn, ACTION_HANG_UP, &Value::Void);

    let (closed, _reason) = client.next_disconnect();
    assert_eq!(closed, conn);
    assert_eq!(orphan.wait_timeout(TIMEOUT), Some(Err(CallError::Disconnected)));
    assert!(client.calls.is_empty());
}

#[test]
fn test_send_after_close_is_rejected() {
    let server = start_echo_server(loopback());
    let client = Client::start();
    let conn = client.connect(server.local_addr().unwrap());
    let handle = client.transport.handle();

    handle.close(conn);
    let (closed, reason) = client.next_disconnect();
    assert_eq!(closed, conn);
    assert_eq!(reason, DisconnectReason::Closed.to_string());
    assert!(wait_until(|| !handle.is_connected(conn)));

    let result = handle.send(conn, Message::call(SERVICE, OBJECT, ACTION_ECHO));
    assert!(matches!(result, Err(TransportError::NotConnected)));

    let call = client.call(conn, ACTION_ECHO, &Value::Void);
    assert_eq!(call.result(), Some(Err(CallError::Disconnected)));
    assert!(client.calls.is_empty());
}

#[test]
fn test_oversized_send_is_rejected_locally() {
    let server = start_echo_server(loopback());
    let mut config = TransportConfig::default();
    config.max_payload_size = 1024;
    let client = Client::start_with(config);
    let conn = client.connect(server.local_addr().unwrap());
    let handle = client.transport.handle();

    let mut big = Message::call(SERVICE, OBJECT, ACTION_ECHO);
    big.set_value(&Value::Raw(Bytes::from(vec![7u8; 4096]))).unwrap();
    let result = handle.send(conn, big.clone());
    assert!(matches!(
        result,
        Err(TransportError::Io(ref e)) if e.kind() == io::ErrorKind::InvalidInput
    ));

    // Call yang ditolak langsung settle, tidak menggantung
    let call = client.calls.send_call(&handle, conn, big);
    assert!(matches!(call.result(), Some(Err(CallError::SendFailed(_)))));
    assert!(client.calls.is_empty());

    // Connection tetap bisa dipakai
    assert!(handle.is_connected(conn));
    let reply = client.call(conn, ACTION_ECHO, &Value::Int32(7)).wait_timeout(TIMEOUT);
    assert_eq!(reply, Some(Ok(Value::Int32(7))));
}

#[test]
fn test_connect_refused_reports_disconnect() {
    init_tracing();
    // Port bebas yang tidak ada listener-nya
    let addr = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();

    let client = Client::start();
    let conn = client.transport.handle().connect(addr).unwrap();
    let (closed, _reason) = client.next_disconnect();
    assert_eq!(closed, conn);
    assert!(wait_until(|| !client.transport.handle().is_connected(conn)));
}

#[test]
fn test_oversized_payload_closes_connection() {
    let mut config = loopback();
    config.max_payload_size = 1024;
    let server = start_echo_server(config);
    let client = Client::start();
    let conn = client.connect(server.local_addr().unwrap());

    let big = client.call(conn, ACTION_ECHO, &Value::Raw(Bytes::from(vec![0u8; 4096])));
    let (closed, _reason) = client.next_disconnect();
    assert_eq!(closed, conn);
    assert_eq!(big.wait_timeout(TIMEOUT), Some(Err(CallError::Disconnected)));
}

#[test]
fn test_cancel_call_locally() {
    let server = start_echo_server(loopback());
    let client = Client::start();
    let conn = client.connect(server.local_addr().unwrap());

    let message = Message::call(SERVICE, OBJECT, 999);
    let future = client.calls.track(conn, &message);
    client.transport.handle().send(conn, message.clone()).unwrap();
    future.cancel();
    assert_eq!(future.result(), Some(Err(CallError::Canceled)));
    assert!(client.calls.is_empty());

    // Remote diberi tahu; server echo mengabaikannya
    let cancel = message.cancel_request();
    assert_eq!(cancel.canceled_id(), Ok(message.id()));
    client.transport.handle().send(conn, cancel).unwrap();
}

/// Server yang memproses setiap call secara serial di sebuah strand
struct CounterHandler {
    handle: TransportHandle,
    strand: Arc<Strand>,
    counter: Arc<AtomicU64>,
}

impl MessageHandler for CounterHandler {
    fn on_message(&self, conn: ConnectionId, message: Message) {
        let handle = self.handle.clone();
        let counter = self.counter.clone();
        self.strand.post(move || {
            // Read-modify-write tanpa atomic RMW: aman karena serial
            let next = counter.load(Ordering::Relaxed) + 1;
            thread::yield_now();
            counter.store(next, Ordering::Relaxed);

            let mut reply = message.response(MessageType::Reply);
            if reply.set_value(&Value::UInt64(next)).is_ok() {
                let _ = handle.send(conn, reply);
            }
        });
    }
}

#[test]
fn test_handler_serializes_through_strand() {
    init_tracing();
    let pool: Arc<dyn ExecutionContext> = Arc::new(ThreadPool::new(4).unwrap());
    let strand = Arc::new(Strand::new(pool));
    let counter = Arc::new(AtomicU64::new(0));

    let server = {
        let strand = strand.clone();
        let counter = counter.clone();
        TransportServer::start_with(loopback(), move |handle| {
            Arc::new(CounterHandler {
                handle,
                strand,
                counter,
            })
        })
        .unwrap()
    };

    let client = Client::start();
    let conn = client.connect(server.local_addr().unwrap());

    let futures: Vec<_> = (0..100)
        .map(|_| client.call(conn, ACTION_ECHO, &Value::Void))
        .collect();
    let mut seen: Vec<u64> = futures
        .iter()
        .map(|f| match f.wait_timeout(TIMEOUT) {
            Some(Ok(Value::UInt64(n))) => n,
            other => panic!("unexpected reply {:?}", other),
        })
        .collect();
    seen.sort_unstable();

    assert_eq!(seen, (1..=100).collect::<Vec<_>>());
    assert_eq!(counter.load(Ordering::Relaxed), 100);
}

#[test]
fn test_shutdown_disconnects_peers() {
    let mut server = start_echo_server(loopback());
    let client = Client::start();
    let conn = client.connect(server.local_addr().unwrap());

    server.shutdown();
    let (closed, _reason) = client.next_disconnect();
    assert_eq!(closed, conn);

    // Handle dari server yang sudah berhenti menolak command baru
    assert!(matches!(
        server.handle().send(ConnectionId(2), Message::call(SERVICE, OBJECT, ACTION_ECHO)),
        Err(TransportError::NotConnected)
    ));
}
