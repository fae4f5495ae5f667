//! Transport server dengan event-driven I/O
//!
//! Satu thread reactor menjalankan `mio::Poll` dan memiliki semua
//! socket. Thread lain berinteraksi lewat `TransportHandle`: command
//! dimasukkan ke queue lalu reactor dibangunkan dengan `mio::Waker`.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::connection::{ConnectionId, FramedSocket, MessageHandler};
use crate::config::TransportConfig;
use crate::error::{DisconnectReason, ProtocolError, TransportError};
use crate::protocol::Message;

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);
/// Id connection dimulai setelah token yang dicadangkan
const FIRST_CONNECTION_ID: u64 = 2;
const EVENTS_CAPACITY: usize = 1024;

enum Command {
    Connect(ConnectionId, SocketAddr),
    Send(ConnectionId, Message),
    Close(ConnectionId),
    Shutdown,
}

struct Shared {
    commands: Mutex<Vec<Command>>,
    waker: Waker,
    next_id: AtomicU64,
    /// Connection yang masih bisa menerima `send`
    live: Mutex<HashSet<ConnectionId>>,
    stopped: AtomicBool,
    local_addr: Option<SocketAddr>,
    max_payload_size: usize,
}

impl Shared {
    fn push(&self, command: Command) -> Result<(), TransportError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }
        self.commands.lock().push(command);
        self.waker.wake()?;
        Ok(())
    }
}

/// Front thread-safe untuk `TransportServer`
#[derive(Clone)]
pub struct TransportHandle {
    shared: Arc<Shared>,
}

impl TransportHandle {
    /// Mulai connect ke `addr`. Hasilnya dilaporkan lewat
    /// `on_connected` / `on_disconnected` dengan id yang dikembalikan.
    pub fn connect(&self, addr: SocketAddr) -> Result<ConnectionId, TransportError> {
        let id = ConnectionId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        self.shared.live.lock().insert(id);
        if let Err(err) = self.shared.push(Command::Connect(id, addr)) {
            self.shared.live.lock().remove(&id);
            return Err(err);
        }
        Ok(id)
    }

    /// Kirim message. Gagal dengan `NotConnected` jika connection
    /// sudah ditutup, atau `Io(InvalidInput)` jika payload melebihi
    /// `max_payload_size`.
    pub fn send(&self, conn: ConnectionId, message: Message) -> Result<(), TransportError> {
        let size = message.payload().total_size();
        let max = self.shared.max_payload_size;
        if size > max {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                ProtocolError::OversizedPayload { size, max },
            )));
        }
        if !self.is_connected(conn) {
            return Err(TransportError::NotConnected);
        }
        self.shared.push(Command::Send(conn, message))
    }

    pub fn close(&self, conn: ConnectionId) {
        if self.shared.push(Command::Close(conn)).is_err() {
            debug!(%conn, "close after shutdown ignored");
        }
    }

    /// Minta reactor berhenti. Semua connection ditutup.
    pub fn shutdown(&self) {
        let _ = self.shared.push(Command::Shutdown);
        self.shared.stopped.store(true, Ordering::Release);
    }

    /// `true` selama connection belum ditutup (termasuk saat connecting)
    pub fn is_connected(&self, conn: ConnectionId) -> bool {
        self.shared.live.lock().contains(&conn)
    }

    /// Alamat listener, jika ada
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr
    }
}

/// Reactor + thread-nya. Drop menghentikan reactor dan menunggu thread.
pub struct TransportServer {
    handle: TransportHandle,
    thread: Option<JoinHandle<()>>,
}

impl TransportServer {
    /// Start reactor dengan `handler` untuk semua connection
    pub fn start(config: TransportConfig, handler: Arc<dyn MessageHandler>) -> io::Result<Self> {
        Self::start_with(config, move |_| handler)
    }

    /// Start reactor; handler dibuat dari handle sehingga handler bisa
    /// membalas message.
    pub fn start_with<F>(config: TransportConfig, make_handler: F) -> io::Result<Self>
    where
        F: FnOnce(TransportHandle) -> Arc<dyn MessageHandler>,
    {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let listener = match config.listen {
            Some(addr) => {
                let mut listener = TcpListener::bind(addr)?;
                poll.registry()
                    .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
                Some(listener)
            }
            None => None,
        };
        let local_addr = match &listener {
            Some(listener) => Some(listener.local_addr()?),
            None => None,
        };

        let shared = Arc::new(Shared {
            commands: Mutex::new(Vec::new()),
            waker,
            next_id: AtomicU64::new(FIRST_CONNECTION_ID),
            live: Mutex::new(HashSet::new()),
            stopped: AtomicBool::new(false),
            local_addr,
            max_payload_size: config.payload_limit(),
        });
        let handle = TransportHandle {
            shared: shared.clone(),
        };
        let handler = make_handler(handle.clone());

        let mut reactor = Reactor {
            poll,
            listener,
            sockets: HashMap::new(),
            handler,
            config,
            shared,
        };
        let thread = thread::Builder::new()
            .name("courier-reactor".to_string())
            .spawn(move || {
                if let Err(e) = reactor.run() {
                    warn!("reactor stopped with error: {}", e);
                }
                reactor.close_all();
            })?;

        if let Some(addr) = local_addr {
            info!("transport listening on {}", addr);
        }
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> TransportHandle {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.handle.local_addr()
    }

    /// Hentikan reactor dan tunggu thread-nya selesai
    pub fn shutdown(&mut self) {
        self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                warn!("reactor thread panicked");
            }
        }
    }
}

impl Drop for TransportServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Reactor {
    poll: Poll,
    listener: Option<TcpListener>,
    sockets: HashMap<Token, FramedSocket<TcpStream>>,
    handler: Arc<dyn MessageHandler>,
    config: TransportConfig,
    shared: Arc<Shared>,
}

fn token_of(id: ConnectionId) -> Token {
    Token(id.0 as usize)
}

impl Reactor {
    fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        loop {
            match self.poll.poll(&mut events, Some(self.config.poll_interval)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections(),
                    WAKER_TOKEN => {}
                    token => {
                        let Some(socket) = self.sockets.get_mut(&token) else {
                            continue;
                        };
                        if event.is_writable() {
                            socket.on_writable();
                        }
                        if event.is_readable() || event.is_read_closed() || event.is_error() {
                            socket.on_readable();
                        }
                        self.reap(token);
                    }
                }
            }

            if !self.process_commands() {
                debug!("reactor shutting down");
                return Ok(());
            }

            if let Some(timeout) = self.config.idle_timeout {
                let now = Instant::now();
                let idle: Vec<Token> = self
                    .sockets
                    .iter_mut()
                    .filter_map(|(token, socket)| socket.check_idle(now, timeout).then_some(*token))
                    .collect();
                for token in idle {
                    self.reap(token);
                }
            }
        }
    }

    /// Accept semua connection yang menunggu
    fn accept_connections(&mut self) {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };
            match listener.accept() {
                Ok((mut stream, addr)) => {
                    if self.sockets.len() >= self.config.max_connections {
                        warn!("max connections reached, rejecting {}", addr);
                        continue;
                    }
                    if let Err(e) = apply_socket_options(&stream, &self.config) {
                        warn!("failed to configure socket from {}: {}", addr, e);
                        continue;
                    }

                    let id = ConnectionId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
                    let token = token_of(id);
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        warn!("failed to register {}: {}", addr, e);
                        continue;
                    }

                    info!(conn = %id, "accepted connection from {}", addr);
                    self.shared.live.lock().insert(id);
                    let socket =
                        FramedSocket::accepted(id, stream, self.handler.clone(), &self.config);
                    self.sockets.insert(token, socket);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    return;
                }
            }
        }
    }

    fn connect(&mut self, id: ConnectionId, addr: SocketAddr) {
        let result = TcpStream::connect(addr).and_then(|mut stream| {
            stream.set_nodelay(self.config.nodelay)?;
            self.poll.registry().register(
                &mut stream,
                token_of(id),
                Interest::READABLE | Interest::WRITABLE,
            )?;
            Ok(stream)
        });
        match result {
            Ok(stream) => {
                debug!(conn = %id, "connecting to {}", addr);
                let socket = FramedSocket::connecting(id, stream, self.handler.clone(), &self.config);
                self.sockets.insert(token_of(id), socket);
            }
            Err(e) => {
                warn!(conn = %id, "connect to {} failed: {}", addr, e);
                self.shared.live.lock().remove(&id);
                self.handler
                    .on_disconnected(id, &DisconnectReason::Transport(e.into()));
            }
        }
    }

    /// Returns `false` jika menerima `Shutdown`
    fn process_commands(&mut self) -> bool {
        let commands = std::mem::take(&mut *self.shared.commands.lock());
        for command in commands {
            match command {
                Command::Connect(id, addr) => self.connect(id, addr),
                Command::Send(id, message) => {
                    let token = token_of(id);
                    match self.sockets.get_mut(&token) {
                        Some(socket) => {
                            if let Err(e) = socket.send(message) {
                                debug!(conn = %id, "send failed: {}", e);
                            }
                            self.reap(token);
                        }
                        None => debug!(conn = %id, "send to unknown connection dropped"),
                    }
                }
                Command::Close(id) => {
                    let token = token_of(id);
                    if let Some(socket) = self.sockets.get_mut(&token) {
                        socket.close();
                    }
                    self.reap(token);
                }
                Command::Shutdown => return false,
            }
        }
        true
    }

    /// Buang socket yang sudah `Disconnected`
    fn reap(&mut self, token: Token) {
        let closed = self
            .sockets
            .get(&token)
            .map_or(false, |socket| socket.is_closed());
        if !closed {
            return;
        }
        if let Some(mut socket) = self.sockets.remove(&token) {
            self.shared.live.lock().remove(&socket.id());
            if let Err(e) = self.poll.registry().deregister(socket.stream_mut()) {
                debug!(conn = %socket.id(), "deregister failed: {}", e);
            }
        }
    }

    fn close_all(&mut self) {
        self.shared.stopped.store(true, Ordering::Release);
        let tokens: Vec<Token> = self.sockets.keys().copied().collect();
        for token in tokens {
            if let Some(socket) = self.sockets.get_mut(&token) {
                socket.close();
            }
            self.reap(token);
        }
        self.shared.live.lock().clear();
    }
}

/// TCP_NODELAY + ukuran buffer socket
fn apply_socket_options(stream: &TcpStream, config: &TransportConfig) -> io::Result<()> {
    stream.set_nodelay(config.nodelay)?;

    #[cfg(unix)]
    if let Some(size) = config.socket_buffer_size {
        use std::os::unix::io::AsRawFd;
        let fd = stream.as_raw_fd();
        let optval = libc::c_int::try_from(size).unwrap_or(libc::c_int::MAX);
        for option in [libc::SO_SNDBUF, libc::SO_RCVBUF] {
            // SAFETY: fd valid selama `stream` hidup, optval adalah c_int
            let rc = unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    option,
                    &optval as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if rc != 0 {
                // Tidak semua platform mendukung, cukup di-log
                debug!("setsockopt({}) failed: {}", option, io::Error::last_os_error());
            }
        }
    }

    Ok(())
}
