//! Logic for capturing visibility datagrams from the NIC and queueing them for the ingest driver

use crate::{
    datagram::{self, VisDatagram, DATAGRAM_SIZE},
    ring::{DatagramRing, Take},
};
use socket2::{Domain, SockRef, Socket, Type};
use std::{
    net::{Shutdown, SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};
use thingbuf::mpsc::blocking::Sender;
use tracing::{debug, info, info_span, warn};

/// How long a blocked recv waits before re-checking the stop flag
const RECV_POLL: Duration = Duration::from_millis(50);
/// Polling interval for stats
const STATS_POLL_DURATION: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
/// Errors that can be produced setting up a capture
pub enum Error {
    #[error("Failed to set the recv buffer size. We tried to set {expected}, but found {found}. Check sysctl net.core.rmem_max")]
    SetRecvBufferFailed { expected: usize, found: usize },
    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct VisSourceConfig {
    /// Port which we expect datagrams to be directed to (0 picks a free one)
    pub port: u16,
    /// Requested kernel receive buffer, in bytes
    pub recv_buffer_size: usize,
    /// Fail construction if the kernel gave us less receive buffer than requested
    pub verify_recv_buffer: bool,
    /// Number of datagrams the ring can hold
    pub ring_capacity: usize,
    /// Optionally pin the receiver thread to this core
    pub core: Option<usize>,
}

impl Default for VisSourceConfig {
    fn default() -> Self {
        Self {
            port: 16384,
            recv_buffer_size: 64 * 1024 * 1024,
            verify_recv_buffer: true,
            ring_capacity: 131_072,
            core: None,
        }
    }
}

/// Snapshot of the capture counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    pub received: u64,
    pub short: u64,
    pub version_mismatch: u64,
    pub recv_errors: u64,
    pub backlog: usize,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    short: AtomicU64,
    version_mismatch: AtomicU64,
    recv_errors: AtomicU64,
}

impl Counters {
    fn snapshot(&self, backlog: usize) -> Stats {
        Stats {
            received: self.received.load(Ordering::Relaxed),
            short: self.short.load(Ordering::Relaxed),
            version_mismatch: self.version_mismatch.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
            backlog,
        }
    }
}

/// Create the UDP socket, sized for bursty correlator traffic
fn bind_socket(config: &VisSourceConfig) -> Result<UdpSocket, Error> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
    // Reuse local address without timeout
    socket.set_reuse_address(true)?;
    // Bind our listening address
    let address = SocketAddr::from(([0, 0, 0, 0], config.port));
    socket.bind(&address.into())?;
    socket.set_recv_buffer_size(config.recv_buffer_size)?;
    // Linux reports double what we asked for, anything less means we were capped
    let current_buf_size = socket.recv_buffer_size()?;
    if config.verify_recv_buffer && current_buf_size < config.recv_buffer_size {
        return Err(Error::SetRecvBufferFailed {
            expected: config.recv_buffer_size,
            found: current_buf_size,
        });
    }
    socket.set_read_timeout(Some(RECV_POLL))?;
    // Replace the socket2 socket with a std socket
    Ok(socket.into())
}

/// Owns the capture socket and its receiver thread
pub struct VisSource {
    ring: Arc<DatagramRing<VisDatagram>>,
    sock: Arc<UdpSocket>,
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    counters: Arc<Counters>,
    handle: Option<JoinHandle<()>>,
}

impl VisSource {
    pub fn new(config: &VisSourceConfig) -> Result<Self, Error> {
        Self::with_stats(config, None)
    }

    /// Like `new`, but periodically sends capture statistics down `stats_send`
    pub fn with_stats(
        config: &VisSourceConfig,
        stats_send: Option<Sender<Stats>>,
    ) -> Result<Self, Error> {
        let sock = Arc::new(bind_socket(config)?);
        let local_addr = sock.local_addr()?;
        let ring = Arc::new(DatagramRing::new(config.ring_capacity));
        let stop = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(Counters::default());
        let receiver = Receiver {
            sock: sock.clone(),
            ring: ring.clone(),
            stop: stop.clone(),
            counters: counters.clone(),
            stats_send,
        };
        let core = config.core;
        let handle = std::thread::Builder::new()
            .name("vis_capture".to_owned())
            .spawn(move || {
                if let Some(id) = core {
                    if !core_affinity::set_for_current(core_affinity::CoreId { id }) {
                        warn!(core = id, "Couldn't pin the capture thread");
                    }
                }
                receiver.run();
            })?;
        info!(addr = %local_addr, "Visibility capture listening");
        Ok(Self {
            ring,
            sock,
            local_addr,
            stop,
            counters,
            handle: Some(handle),
        })
    }

    /// Wait up to `timeout` for the next valid datagram
    pub fn next(&self, timeout: Duration) -> Take<VisDatagram> {
        self.ring.take(timeout)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> Stats {
        self.counters.snapshot(self.ring.len())
    }

    /// Whether the receiver thread is still running
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Stop the receiver thread and wait for it to exit
    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        // Unblock a receiver waiting on a full ring
        self.ring.shutdown();
        // Unconnected UDP sockets report ENOTCONN here but still wake a pending recv
        let _ = SockRef::from(&*self.sock).shutdown(Shutdown::Read);
        if handle.join().is_err() {
            warn!("Capture thread panicked");
        }
        debug!("Capture thread joined");
    }
}

impl Drop for VisSource {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// State moved onto the receiver thread
struct Receiver {
    sock: Arc<UdpSocket>,
    ring: Arc<DatagramRing<VisDatagram>>,
    stop: Arc<AtomicBool>,
    counters: Arc<Counters>,
    stats_send: Option<Sender<Stats>>,
}

impl Receiver {
    fn run(self) {
        let _span = info_span!("capture").entered();
        info!("Starting capture task!");
        let mut last_stats = Instant::now();
        // One spare byte so oversized datagrams show up as a size mismatch
        let mut buf = vec![0u8; DATAGRAM_SIZE + 1];
        while !self.stop.load(Ordering::Acquire) {
            // Send away the stats if the time has come (non blocking)
            if last_stats.elapsed() >= STATS_POLL_DURATION {
                if let Some(send) = &self.stats_send {
                    let _ = send.try_send(self.counters.snapshot(self.ring.len()));
                }
                last_stats = Instant::now();
            }
            let n = match self.sock.recv(&mut buf) {
                Ok(n) => n,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    continue
                }
                Err(_) if self.stop.load(Ordering::Acquire) => break,
                Err(e) => {
                    self.counters.recv_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("Transient recv error - {e}");
                    continue;
                }
            };
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            let dg = match VisDatagram::from_bytes(&buf[..n]) {
                Ok(dg) => dg,
                Err(datagram::Error::SizeMismatch(len)) => {
                    self.counters.short.fetch_add(1, Ordering::Relaxed);
                    warn!(len, "Discarding datagram of unexpected size");
                    continue;
                }
                Err(datagram::Error::VersionMismatch { found }) => {
                    self.counters
                        .version_mismatch
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(found, "Discarding datagram with a version mismatch");
                    continue;
                }
            };
            self.counters.received.fetch_add(1, Ordering::Relaxed);
            if self.ring.put(dg).is_err() {
                // Ring was closed under us, we're shutting down
                break;
            }
        }
        info!("Capture task stopping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagram::DATAGRAM_VERSION;

    fn test_config() -> VisSourceConfig {
        VisSourceConfig {
            port: 0,
            recv_buffer_size: 1024 * 1024,
            verify_recv_buffer: false,
            ring_capacity: 64,
            core: None,
        }
    }

    fn sender(source: &VisSource) -> (UdpSocket, SocketAddr) {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let dest = SocketAddr::from(([127, 0, 0, 1], source.local_addr().port()));
        (sock, dest)
    }

    #[test]
    fn test_receive_valid() {
        let source = VisSource::new(&test_config()).unwrap();
        let (sock, dest) = sender(&source);
        let dg = VisDatagram {
            timestamp: 42,
            antenna2: 1,
            ..Default::default()
        };
        sock.send_to(&dg.to_bytes(), dest).unwrap();
        assert_eq!(source.next(Duration::from_secs(2)), Take::Item(dg));
        assert_eq!(source.stats().received, 1);
    }

    #[test]
    fn test_version_gate() {
        let source = VisSource::new(&test_config()).unwrap();
        let (sock, dest) = sender(&source);
        let bad = VisDatagram {
            version: DATAGRAM_VERSION + 1,
            timestamp: 1,
            ..Default::default()
        };
        let good = VisDatagram {
            timestamp: 2,
            ..Default::default()
        };
        sock.send_to(&bad.to_bytes(), dest).unwrap();
        sock.send_to(&good.to_bytes(), dest).unwrap();
        assert_eq!(source.next(Duration::from_secs(2)), Take::Item(good));
        assert_eq!(source.next(Duration::from_millis(100)), Take::TimedOut);
        assert_eq!(source.stats().version_mismatch, 1);
        assert!(source.is_running());
    }

    #[test]
    fn test_oversized_is_dropped() {
        let source = VisSource::new(&test_config()).unwrap();
        let (sock, dest) = sender(&source);
        let mut bytes = VisDatagram::default().to_bytes();
        bytes.push(0);
        sock.send_to(&bytes, dest).unwrap();
        assert_eq!(source.next(Duration::from_millis(300)), Take::TimedOut);
        assert_eq!(source.stats().short, 1);
    }

    #[test]
    fn test_shutdown_joins() {
        let mut source = VisSource::new(&test_config()).unwrap();
        assert!(source.is_running());
        source.shutdown();
        assert!(!source.is_running());
        assert_eq!(source.next(Duration::from_millis(10)), Take::Closed);
        // Second call is a no-op
        source.shutdown();
    }
}
