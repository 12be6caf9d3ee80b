//! Full-mesh TCP transport between ranks running as separate processes
//!
//! Every rank listens on its own address. A rank dials every lower rank and
//! accepts a connection from every higher one, announcing itself with its
//! rank number. One reader thread per peer moves incoming frames into the
//! rank's mailbox. Frames are `[kind u8][tag i32][len u32][bytes]`, all
//! little-endian.

use super::{mailbox::Mailbox, AbortHook, CommsErrorKind, Source, Tag, Transport};
use std::{
    io::{ErrorKind, Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{Arc, Mutex, PoisonError},
    thread::JoinHandle,
    time::{Duration, Instant},
};
use tracing::{debug, error, info, warn};

const FRAME_DATA: u8 = 0;
const FRAME_ABORT: u8 = 1;
const FRAME_HEADER: usize = 9;
const CONNECT_RETRY: Duration = Duration::from_millis(50);

pub struct TcpTransport {
    rank: usize,
    size: usize,
    peers: Vec<Option<Mutex<TcpStream>>>,
    mailbox: Arc<Mailbox>,
    readers: Vec<JoinHandle<()>>,
}

fn read_frame(stream: &mut TcpStream) -> std::io::Result<(u8, Tag, Vec<u8>)> {
    let mut header = [0u8; FRAME_HEADER];
    stream.read_exact(&mut header)?;
    let kind = header[0];
    let tag = Tag::from_le_bytes([header[1], header[2], header[3], header[4]]);
    let len = u32::from_le_bytes([header[5], header[6], header[7], header[8]]) as usize;
    let mut data = vec![0u8; len];
    stream.read_exact(&mut data)?;
    Ok((kind, tag, data))
}

fn write_frame(stream: &mut TcpStream, kind: u8, tag: Tag, data: &[u8]) -> std::io::Result<()> {
    let len = u32::try_from(data.len())
        .map_err(|e| std::io::Error::new(ErrorKind::InvalidInput, e))?;
    let mut frame = Vec::with_capacity(FRAME_HEADER + data.len());
    frame.push(kind);
    frame.extend_from_slice(&tag.to_le_bytes());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(data);
    stream.write_all(&frame)
}

fn reader_task(mut stream: TcpStream, peer: usize, mailbox: &Mailbox) {
    loop {
        match read_frame(&mut stream) {
            Ok((FRAME_DATA, tag, data)) => mailbox.deliver(peer, tag, data),
            Ok((FRAME_ABORT, code, _)) => {
                error!(peer, code, "Peer aborted the group");
                mailbox.abort(code);
            }
            Ok((kind, _, _)) => {
                warn!(peer, kind, "Unknown frame kind, dropping connection");
                break;
            }
            Err(e) => {
                if e.kind() != ErrorKind::UnexpectedEof {
                    warn!(peer, "Connection error - {e}");
                }
                break;
            }
        }
    }
    debug!(peer, "Peer connection closed");
    mailbox.disconnect(peer);
}

fn dial(addr: SocketAddr, deadline: Instant) -> Result<TcpStream, CommsErrorKind> {
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(e) if Instant::now() < deadline => {
                debug!(%addr, "Peer not up yet - {e}");
                std::thread::sleep(CONNECT_RETRY);
            }
            Err(_) => return Err(CommsErrorKind::ConnectTimeout),
        }
    }
}

fn accept(listener: &TcpListener, deadline: Instant) -> Result<TcpStream, CommsErrorKind> {
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                return Ok(stream);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(CommsErrorKind::ConnectTimeout);
                }
                std::thread::sleep(CONNECT_RETRY);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

impl TcpTransport {
    /// Join the group described by `addrs` as `rank`, waiting up to `timeout` for every peer
    pub fn connect(
        rank: usize,
        addrs: &[SocketAddr],
        timeout: Duration,
    ) -> Result<Self, CommsErrorKind> {
        let addr = addrs.get(rank).ok_or(CommsErrorKind::InvalidRank {
            rank,
            size: addrs.len(),
        })?;
        let listener = TcpListener::bind(addr)?;
        Self::with_listener(rank, listener, addrs, timeout)
    }

    /// As `connect`, with this rank's listener already bound
    pub fn with_listener(
        rank: usize,
        listener: TcpListener,
        addrs: &[SocketAddr],
        timeout: Duration,
    ) -> Result<Self, CommsErrorKind> {
        let size = addrs.len();
        if rank >= size {
            return Err(CommsErrorKind::InvalidRank { rank, size });
        }
        let deadline = Instant::now() + timeout;
        let mut streams: Vec<Option<TcpStream>> = (0..size).map(|_| None).collect();

        for (peer, addr) in addrs.iter().enumerate().take(rank) {
            let mut stream = dial(*addr, deadline)?;
            let me = u32::try_from(rank).unwrap_or(u32::MAX);
            stream.write_all(&me.to_le_bytes())?;
            streams[peer] = Some(stream);
        }

        listener.set_nonblocking(true)?;
        for _ in rank + 1..size {
            let mut stream = accept(&listener, deadline)?;
            let mut hello = [0u8; 4];
            stream.read_exact(&mut hello)?;
            let peer = u32::from_le_bytes(hello) as usize;
            if peer <= rank || peer >= size || streams[peer].is_some() {
                return Err(CommsErrorKind::Malformed(format!(
                    "unexpected handshake from rank {peer}"
                )));
            }
            streams[peer] = Some(stream);
        }

        let mailbox = Arc::new(Mailbox::new(rank, size));
        let mut readers = vec![];
        let mut peers = vec![];
        for (peer, stream) in streams.into_iter().enumerate() {
            let Some(stream) = stream else {
                peers.push(None);
                continue;
            };
            stream.set_nodelay(true)?;
            let read_half = stream.try_clone()?;
            let mailbox = mailbox.clone();
            readers.push(
                std::thread::Builder::new()
                    .name(format!("comms_rx_{peer}"))
                    .spawn(move || reader_task(read_half, peer, &mailbox))?,
            );
            peers.push(Some(Mutex::new(stream)));
        }
        info!(rank, size, "Joined the communication group");
        Ok(Self {
            rank,
            size,
            peers,
            mailbox,
            readers,
        })
    }

    fn write(&self, dest: usize, kind: u8, tag: Tag, data: &[u8]) -> Result<(), CommsErrorKind> {
        let stream = self
            .peers
            .get(dest)
            .and_then(Option::as_ref)
            .ok_or(CommsErrorKind::InvalidRank {
                rank: dest,
                size: self.size,
            })?;
        let mut stream = stream.lock().unwrap_or_else(PoisonError::into_inner);
        write_frame(&mut stream, kind, tag, data)?;
        Ok(())
    }
}

impl Transport for TcpTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send_frame(&self, dest: usize, tag: Tag, data: &[u8]) -> Result<(), CommsErrorKind> {
        if dest == self.rank {
            self.mailbox.deliver(self.rank, tag, data.to_vec());
            return Ok(());
        }
        self.write(dest, FRAME_DATA, tag, data)
    }

    fn recv_frame(&self, source: Source, tag: Tag) -> Result<(usize, Vec<u8>), CommsErrorKind> {
        self.mailbox.take(source, tag)
    }

    fn abort(&self, code: i32) {
        error!(rank = self.rank, code, "Aborting the group");
        for peer in (0..self.size).filter(|p| *p != self.rank) {
            if let Err(e) = self.write(peer, FRAME_ABORT, code, &[]) {
                warn!(peer, "Couldn't deliver abort - {e}");
            }
        }
        self.mailbox.abort(code);
    }

    fn on_abort(&self, hook: AbortHook) {
        self.mailbox.set_abort_hook(hook);
    }

    fn aborted(&self) -> Option<i32> {
        self.mailbox.aborted()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        for stream in self.peers.iter().flatten() {
            let stream = stream.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = stream.shutdown(Shutdown::Both);
        }
        for reader in self.readers.drain(..) {
            let _ = reader.join();
        }
    }
}
