//! Telescope-state metadata that accompanies every correlator cycle

use crate::common::BLOCK_TIMEOUT;
use serde::{Deserialize, Serialize};
use std::{
    net::{SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};
use thingbuf::mpsc::{
    blocking::{channel as thingbuf_channel, Receiver, Sender},
    errors::{RecvTimeoutError, TrySendError},
};
use tracing::{info, info_span, warn};

/// Number of metadata records that may queue up before the publisher is held back
const METADATA_BACKLOG: usize = 64;

#[derive(thiserror::Error, Debug)]
pub enum MetadataError {
    #[error("Metadata feed closed")]
    Closed,
    #[error("Couldn't start the metadata receiver: {0}")]
    Io(#[from] std::io::Error),
}

/// One cycle's worth of telescope state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelescopeMetadata {
    /// Integration timestamp, microseconds since the Unix epoch
    pub timestamp: u64,
    /// Scan index, or one of the idle/complete sentinels
    pub scan_id: i64,
    /// (RA, Dec) of the phase centre, radians
    #[serde(default)]
    pub phase_direction: [f64; 2],
    /// Indices of antennas whose data must be flagged this cycle
    #[serde(default)]
    pub flagged_antennas: Vec<u32>,
}

pub trait MetadataSource: Send {
    /// Wait up to `timeout` for the next metadata record, `None` if none arrived
    fn next(&mut self, timeout: Duration) -> Result<Option<TelescopeMetadata>, MetadataError>;
}

/// Metadata pushed in-process through a channel
pub struct ChannelMetadataSource {
    rx: Receiver<TelescopeMetadata>,
}

/// Create a metadata source along with the sender that feeds it
#[must_use]
pub fn channel(capacity: usize) -> (Sender<TelescopeMetadata>, ChannelMetadataSource) {
    let (tx, rx) = thingbuf_channel(capacity);
    (tx, ChannelMetadataSource { rx })
}

impl MetadataSource for ChannelMetadataSource {
    fn next(&mut self, timeout: Duration) -> Result<Option<TelescopeMetadata>, MetadataError> {
        match self.rx.recv_timeout(timeout) {
            Ok(md) => Ok(Some(md)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(_) => Err(MetadataError::Closed),
        }
    }
}

/// Metadata published as one JSON object per UDP datagram
pub struct UdpMetadataSource {
    inner: ChannelMetadataSource,
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl UdpMetadataSource {
    pub fn bind(port: u16) -> Result<Self, MetadataError> {
        let sock = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port)))?;
        sock.set_read_timeout(Some(BLOCK_TIMEOUT))?;
        let local_addr = sock.local_addr()?;
        let (tx, inner) = channel(METADATA_BACKLOG);
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("metadata".to_owned())
            .spawn(move || metadata_task(&sock, &tx, &thread_stop))?;
        info!(addr = %local_addr, "Metadata receiver listening");
        Ok(Self {
            inner,
            local_addr,
            stop,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl MetadataSource for UdpMetadataSource {
    fn next(&mut self, timeout: Duration) -> Result<Option<TelescopeMetadata>, MetadataError> {
        self.inner.next(timeout)
    }
}

impl Drop for UdpMetadataSource {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Metadata thread panicked");
            }
        }
    }
}

fn metadata_task(sock: &UdpSocket, tx: &Sender<TelescopeMetadata>, stop: &AtomicBool) {
    let _span = info_span!("metadata").entered();
    info!("Starting metadata receiver task!");
    let mut buf = vec![0u8; 65536];
    'recv: while !stop.load(Ordering::Acquire) {
        let n = match sock.recv(&mut buf) {
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue
            }
            Err(e) => {
                warn!("Transient metadata recv error - {e}");
                continue;
            }
        };
        let mut md = match serde_json::from_slice::<TelescopeMetadata>(&buf[..n]) {
            Ok(md) => md,
            Err(e) => {
                warn!("Error deserializing metadata message - {e}");
                continue;
            }
        };
        // Hold the publisher back while the driver catches up, but keep watching for shutdown
        loop {
            match tx.try_send(md) {
                Ok(()) => break,
                Err(TrySendError::Full(back)) => {
                    if stop.load(Ordering::Acquire) {
                        break 'recv;
                    }
                    md = back;
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(_) => break 'recv,
            }
        }
    }
    info!("Metadata receiver task stopping");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_source() {
        let (tx, mut source) = channel(4);
        assert_eq!(source.next(Duration::from_millis(10)).unwrap(), None);
        let md = TelescopeMetadata {
            timestamp: 5,
            scan_id: 1,
            ..Default::default()
        };
        tx.send(md.clone()).unwrap();
        assert_eq!(source.next(Duration::from_millis(10)).unwrap(), Some(md));
        drop(tx);
        assert!(matches!(
            source.next(Duration::from_millis(10)),
            Err(MetadataError::Closed)
        ));
    }

    #[test]
    fn test_udp_source() {
        let mut source = UdpMetadataSource::bind(0).unwrap();
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let dest = SocketAddr::from(([127, 0, 0, 1], source.local_addr().port()));
        sock.send_to(b"not json", dest).unwrap();
        sock.send_to(
            br#"{"timestamp": 10, "scan_id": 3, "flagged_antennas": [2]}"#,
            dest,
        )
        .unwrap();
        let md = source.next(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(md.timestamp, 10);
        assert_eq!(md.scan_id, 3);
        assert_eq!(md.flagged_antennas, vec![2]);
        assert_eq!(md.phase_direction, [0.0, 0.0]);
    }
}
