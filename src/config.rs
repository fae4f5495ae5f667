//! Konfigurasi runtime
//!
//! Semua nilai punya default yang masuk akal. `from_env()` membaca override
//! dari environment; nilai yang tidak valid di-log lalu diabaikan.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Default quantum strand: 5ms
pub const DEFAULT_STRAND_QUANTUM_US: u64 = 5000;

/// Default batas payload: 16MB
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Payload terbesar yang bisa dinyatakan oleh field `u32` di header
pub const MAX_WIRE_PAYLOAD_SIZE: usize = u32::MAX as usize;

/// Konfigurasi `Strand`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrandConfig {
    /// Lama maksimum satu putaran processing sebelum strand
    /// menyerahkan thread kembali ke execution context.
    pub quantum: Duration,
}

impl Default for StrandConfig {
    fn default() -> Self {
        Self {
            quantum: Duration::from_micros(DEFAULT_STRAND_QUANTUM_US),
        }
    }
}

impl StrandConfig {
    /// Default + override `COURIER_STRAND_QUANTUM_US`
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(us) = env_value::<u64>("COURIER_STRAND_QUANTUM_US") {
            config.quantum = Duration::from_micros(us);
        }
        config
    }
}

/// Konfigurasi `TransportServer` dan socket-socketnya
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Alamat listen. `None` = hanya koneksi keluar.
    pub listen: Option<SocketAddr>,
    /// Batas payload per message (resource-exhaustion guard).
    /// Nilai di atas `MAX_WIRE_PAYLOAD_SIZE` diperlakukan sebagai
    /// `MAX_WIRE_PAYLOAD_SIZE`, lihat `payload_limit()`.
    pub max_payload_size: usize,
    /// Ukuran chunk untuk satu panggilan `read()`
    pub read_chunk_size: usize,
    /// SO_SNDBUF / SO_RCVBUF untuk socket yang di-accept
    pub socket_buffer_size: Option<usize>,
    /// TCP_NODELAY
    pub nodelay: bool,
    /// Tutup connection yang tidak menerima data selama durasi ini
    pub idle_timeout: Option<Duration>,
    /// Timeout untuk satu putaran poll
    pub poll_interval: Duration,
    /// Batas jumlah connection aktif
    pub max_connections: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen: None,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            read_chunk_size: 64 * 1024, // 64KB
            socket_buffer_size: Some(256 * 1024),
            nodelay: true,
            idle_timeout: None,
            poll_interval: Duration::from_millis(50),
            max_connections: 1024,
        }
    }
}

impl TransportConfig {
    /// Default + override `COURIER_MAX_PAYLOAD` dan `COURIER_IDLE_TIMEOUT_MS`
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(max) = env_value::<usize>("COURIER_MAX_PAYLOAD") {
            if max > MAX_WIRE_PAYLOAD_SIZE {
                warn!(max, limit = MAX_WIRE_PAYLOAD_SIZE, "COURIER_MAX_PAYLOAD clamped to header limit");
            }
            config.max_payload_size = max.min(MAX_WIRE_PAYLOAD_SIZE);
        }
        if let Some(ms) = env_value::<u64>("COURIER_IDLE_TIMEOUT_MS") {
            config.idle_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        config
    }

    /// Batas payload efektif: `max_payload_size`, tidak lebih dari yang
    /// muat di header.
    pub fn payload_limit(&self) -> usize {
        self.max_payload_size.min(MAX_WIRE_PAYLOAD_SIZE)
    }

    /// Set alamat listen
    pub fn listen_on(mut self, addr: SocketAddr) -> Self {
        self.listen = Some(addr);
        self
    }
}

fn env_value<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}
