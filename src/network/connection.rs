//! Framed socket: state machine connection + buffered I/O
//!
//! Read: baca sampai `WouldBlock`, feed ke reassembler, dispatch setiap
//! message yang lengkap. Write: queue `OutgoingFrame`, hanya frame
//! terdepan yang ditulis sampai selesai.
//!
//! Socket hanya disentuh oleh satu thread (reactor). Thread lain
//! mengirim lewat `TransportHandle`.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace};

use super::framing::{FrameDecoder, OutgoingFrame};
use crate::config::TransportConfig;
use crate::error::{DisconnectReason, ProtocolError, TransportError};
use crate::protocol::{Message, HEADER_SIZE};

/// Byte stream non-blocking di bawah `FramedSocket`
pub trait ByteStream: Read + Write + Send {
    /// `Ok(true)` jika sudah terhubung, `Ok(false)` jika connect masih
    /// berjalan, error jika connect gagal.
    fn check_connected(&self) -> io::Result<bool>;

    /// Tutup kedua arah. Error diabaikan.
    fn shutdown(&self);
}

impl ByteStream for mio::net::TcpStream {
    fn check_connected(&self) -> io::Result<bool> {
        if let Some(err) = self.take_error()? {
            return Err(err);
        }
        match self.peer_addr() {
            Ok(_) => Ok(true),
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn shutdown(&self) {
        let _ = mio::net::TcpStream::shutdown(self, Shutdown::Both);
    }
}

/// Identitas connection, unik per `TransportServer`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Callback untuk event connection. Dipanggil dari thread reactor,
/// jadi pekerjaan berat sebaiknya dipindah ke `Strand`.
pub trait MessageHandler: Send + Sync {
    fn on_connected(&self, _conn: ConnectionId) {}

    /// Satu message lengkap, sesuai urutan di wire
    fn on_message(&self, conn: ConnectionId, message: Message);

    /// Dipanggil tepat sekali per connection
    fn on_disconnected(&self, _conn: ConnectionId, _reason: &DisconnectReason) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Socket dengan framing message di atas `ByteStream`
pub struct FramedSocket<S: ByteStream> {
    id: ConnectionId,
    stream: S,
    state: SocketState,
    decoder: FrameDecoder,
    outgoing: VecDeque<OutgoingFrame>,
    handler: Arc<dyn MessageHandler>,
    read_buffer: Box<[u8]>,
    max_payload: usize,
    last_activity: Instant,
    messages_received: u64,
    messages_sent: u64,
}

impl<S: ByteStream> FramedSocket<S> {
    fn with_state(
        id: ConnectionId,
        stream: S,
        state: SocketState,
        handler: Arc<dyn MessageHandler>,
        config: &TransportConfig,
    ) -> Self {
        Self {
            id,
            stream,
            state,
            decoder: FrameDecoder::new(config.payload_limit()),
            outgoing: VecDeque::new(),
            handler,
            read_buffer: vec![0u8; config.read_chunk_size.max(HEADER_SIZE)].into_boxed_slice(),
            max_payload: config.payload_limit(),
            last_activity: Instant::now(),
            messages_received: 0,
            messages_sent: 0,
        }
    }

    /// Socket keluar yang connect-nya masih berjalan
    pub fn connecting(
        id: ConnectionId,
        stream: S,
        handler: Arc<dyn MessageHandler>,
        config: &TransportConfig,
    ) -> Self {
        Self::with_state(id, stream, SocketState::Connecting, handler, config)
    }

    /// Socket hasil accept: langsung `Connected`, `on_connected` dipanggil
    pub fn accepted(
        id: ConnectionId,
        stream: S,
        handler: Arc<dyn MessageHandler>,
        config: &TransportConfig,
    ) -> Self {
        let socket = Self::with_state(id, stream, SocketState::Connected, handler, config);
        socket.handler.on_connected(id);
        socket
    }

    #[inline(always)]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[inline(always)]
    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SocketState::Disconnected
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    /// Untuk registrasi ke `mio::Registry`
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Jumlah frame yang belum selesai ditulis
    pub fn pending_writes(&self) -> usize {
        self.outgoing.len()
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent
    }

    /// Queue message untuk dikirim.
    ///
    /// Saat `Connecting` message ditahan sampai connect selesai.
    pub fn send(&mut self, message: Message) -> Result<(), TransportError> {
        match self.state {
            SocketState::Disconnecting | SocketState::Disconnected => {
                return Err(TransportError::NotConnected)
            }
            SocketState::Connecting | SocketState::Connected => {}
        }

        let size = message.payload().total_size();
        if size > self.max_payload {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                ProtocolError::OversizedPayload {
                    size,
                    max: self.max_payload,
                },
            )));
        }

        trace!(conn = %self.id, id = message.id(), "queue message");
        self.outgoing.push_back(OutgoingFrame::new(message));
        if self.state == SocketState::Connected {
            self.flush();
        }
        Ok(())
    }

    /// Socket siap dibaca
    pub fn on_readable(&mut self) {
        if self.state == SocketState::Connecting && !self.complete_connect() {
            return;
        }
        if self.state != SocketState::Connected {
            return;
        }

        loop {
            match self.stream.read(&mut self.read_buffer) {
                Ok(0) => {
                    self.close_with(TransportError::PeerClosed.into());
                    return;
                }
                Ok(n) => {
                    self.last_activity = Instant::now();
                    self.decoder.feed(&self.read_buffer[..n]);
                    if !self.dispatch() {
                        return;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.close_with(TransportError::Io(e).into());
                    return;
                }
            }
        }
    }

    /// Socket siap ditulis (atau connect selesai)
    pub fn on_writable(&mut self) {
        if self.state == SocketState::Connecting && !self.complete_connect() {
            return;
        }
        if self.state == SocketState::Connected {
            self.flush();
        }
    }

    /// Tutup connection secara lokal
    pub fn close(&mut self) {
        self.close_with(DisconnectReason::Closed);
    }

    /// Tutup jika tidak ada data masuk selama `timeout`.
    ///
    /// Returns `true` jika connection ditutup.
    pub fn check_idle(&mut self, now: Instant, timeout: Duration) -> bool {
        if self.state != SocketState::Connected {
            return false;
        }
        if now.saturating_duration_since(self.last_activity) < timeout {
            return false;
        }
        debug!(conn = %self.id, ?timeout, "idle timeout");
        self.close_with(TransportError::Timeout.into());
        true
    }

    /// Returns `true` jika sekarang `Connected`
    fn complete_connect(&mut self) -> bool {
        match self.stream.check_connected() {
            Ok(true) => {
                info!(conn = %self.id, "connected");
                self.state = SocketState::Connected;
                self.last_activity = Instant::now();
                self.handler.on_connected(self.id);
                true
            }
            Ok(false) => false,
            Err(e) => {
                self.close_with(TransportError::Io(e).into());
                false
            }
        }
    }

    /// Dispatch semua message lengkap. Returns `false` jika connection
    /// ditutup karena pelanggaran protokol.
    fn dispatch(&mut self) -> bool {
        loop {
            match self.decoder.next_message() {
                Ok(Some(message)) => {
                    self.messages_received += 1;
                    self.handler.on_message(self.id, message);
                }
                Ok(None) => return true,
                Err(err) => {
                    self.close_with(err.into());
                    return false;
                }
            }
        }
    }

    fn flush(&mut self) {
        while let Some(frame) = self.outgoing.front_mut() {
            match frame.write_to(&mut self.stream) {
                Ok(0) if !frame.is_complete() => {
                    self.close_with(
                        TransportError::Io(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "failed to write to socket",
                        ))
                        .into(),
                    );
                    return;
                }
                Ok(_) => {
                    if frame.is_complete() {
                        trace!(conn = %self.id, id = frame.id(), "message written");
                        self.outgoing.pop_front();
                        self.messages_sent += 1;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.close_with(TransportError::Io(e).into());
                    return;
                }
            }
        }
    }

    fn close_with(&mut self, reason: DisconnectReason) {
        if matches!(
            self.state,
            SocketState::Disconnecting | SocketState::Disconnected
        ) {
            return;
        }
        self.state = SocketState::Disconnecting;
        let dropped = self.outgoing.len();
        self.outgoing.clear();
        self.decoder.reset();
        self.stream.shutdown();
        self.state = SocketState::Disconnected;

        info!(conn = %self.id, dropped, "disconnected: {}", reason);
        self.handler.on_disconnected(self.id, &reason);
    }
}
