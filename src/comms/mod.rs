//! Point-to-point and collective messaging between the ranks of an ingest group
//!
//! Rank 0 is the master. Messages larger than the transport's per-message
//! limit are split: a length header goes first, then the payload in pieces.

mod local;
mod mailbox;
mod tcp;

pub use local::LocalTransport;
pub use tcp::TcpTransport;

use crate::config::Parset;
use byte_slice_cast::{AsByteSlice, AsMutByteSlice};
use thiserror::Error;
use tracing::{debug, error, trace};

/// Message tag, user tags are non-negative
pub type Tag = i32;

/// Reserved for `broadcast`
pub const BROADCAST_TAG: Tag = -1;
/// Reserved for `signal_ready` and `get_ready_worker_id`
pub const READY_TAG: Tag = -2;
/// Reserved for `sum_reduce`
pub const REDUCE_TAG: Tag = -3;

/// Largest single frame a `Comms` will hand to its transport by default
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1 << 20;

const LENGTH_HEADER: usize = 8;

/// Which sender a receive matches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Any,
    Rank(usize),
}

#[derive(Debug, Error)]
pub enum CommsErrorKind {
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    #[error("Rank {0} disconnected")]
    Disconnected(usize),
    #[error("Group aborted with code {0}")]
    Aborted(i32),
    #[error("Rank {rank} is outside a group of {size}")]
    InvalidRank { rank: usize, size: usize },
    #[error("Tag {0} is reserved")]
    InvalidTag(Tag),
    #[error("Malformed message: {0}")]
    Malformed(String),
    #[error("Timed out waiting for peers to connect")]
    ConnectTimeout,
}

/// A failed communication call, naming the operation
#[derive(Debug, Error)]
#[error("{op} failed: {kind}")]
pub struct CommsError {
    pub op: &'static str,
    #[source]
    pub kind: CommsErrorKind,
}

impl CommsError {
    fn new(op: &'static str, kind: CommsErrorKind) -> Self {
        Self { op, kind }
    }

    /// Misuse of the API rather than a failure of the group
    #[must_use]
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self.kind,
            CommsErrorKind::InvalidRank { .. } | CommsErrorKind::InvalidTag(_)
        )
    }
}

/// Run on the rank once its group aborts, with the abort code
pub type AbortHook = Box<dyn Fn(i32) + Send + Sync>;

/// Moves whole frames between ranks.
/// Frames from one sender with one tag are delivered in order.
pub trait Transport: Send + Sync {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    fn send_frame(&self, dest: usize, tag: Tag, data: &[u8]) -> Result<(), CommsErrorKind>;
    /// Blocks until a matching frame arrives, returning the sender and the bytes
    fn recv_frame(&self, source: Source, tag: Tag) -> Result<(usize, Vec<u8>), CommsErrorKind>;
    /// Tear down the whole group, every pending and future receive fails
    fn abort(&self, code: i32);
    /// Install a hook, called from whichever thread notices the abort
    fn on_abort(&self, hook: AbortHook);
    fn aborted(&self) -> Option<i32>;
}

pub struct Comms<T> {
    transport: T,
    max_message_size: usize,
}

impl<T: Transport> Comms<T> {
    pub fn new(transport: T) -> Self {
        Self::with_max_message_size(transport, DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// # Panics
    /// Panics if `max_message_size` is zero
    pub fn with_max_message_size(transport: T, max_message_size: usize) -> Self {
        assert!(max_message_size > 0, "Message size limit must be positive");
        Self {
            transport,
            max_message_size,
        }
    }

    pub fn rank(&self) -> usize {
        self.transport.rank()
    }

    pub fn size(&self) -> usize {
        self.transport.size()
    }

    pub fn is_master(&self) -> bool {
        self.rank() == 0
    }

    fn check_rank(&self, op: &'static str, rank: usize) -> Result<(), CommsError> {
        let size = self.size();
        if rank >= size {
            return Err(CommsError::new(op, CommsErrorKind::InvalidRank { rank, size }));
        }
        Ok(())
    }

    fn check_user_tag(op: &'static str, tag: Tag) -> Result<(), CommsError> {
        if tag < 0 {
            return Err(CommsError::new(op, CommsErrorKind::InvalidTag(tag)));
        }
        Ok(())
    }

    fn send_chunked(&self, dest: usize, tag: Tag, data: &[u8]) -> Result<(), CommsErrorKind> {
        let len = data.len() as u64;
        self.transport.send_frame(dest, tag, &len.to_le_bytes())?;
        for piece in data.chunks(self.max_message_size) {
            self.transport.send_frame(dest, tag, piece)?;
        }
        trace!(dest, tag, len, "Message sent");
        Ok(())
    }

    fn recv_chunked(&self, source: Source, tag: Tag) -> Result<(usize, Vec<u8>), CommsErrorKind> {
        let (from, header) = self.transport.recv_frame(source, tag)?;
        let header: [u8; LENGTH_HEADER] = header.as_slice().try_into().map_err(|_| {
            CommsErrorKind::Malformed(format!("length header of {} bytes", header.len()))
        })?;
        let len = u64::from_le_bytes(header);
        let len = usize::try_from(len)
            .ok()
            .filter(|n| isize::try_from(*n).is_ok())
            .ok_or_else(|| CommsErrorKind::Malformed(format!("impossible length {len}")))?;
        // The header is untrusted, the buffer grows as pieces actually arrive
        let mut data = Vec::with_capacity(len.min(self.max_message_size));
        // The remaining pieces must come from the same sender
        while data.len() < len {
            let (_, piece) = self.transport.recv_frame(Source::Rank(from), tag)?;
            if piece.is_empty() || data.len() + piece.len() > len {
                return Err(CommsErrorKind::Malformed(format!(
                    "piece of {} bytes with {} of {len} received",
                    piece.len(),
                    data.len()
                )));
            }
            data.extend_from_slice(&piece);
        }
        trace!(from, tag, len, "Message received");
        Ok((from, data))
    }

    /// Send `data` to `dest`, splitting it if it exceeds the message size limit
    pub fn send(&self, data: &[u8], dest: usize, tag: Tag) -> Result<(), CommsError> {
        const OP: &str = "send";
        Self::check_user_tag(OP, tag)?;
        self.check_rank(OP, dest)?;
        self.send_chunked(dest, tag, data)
            .map_err(|e| CommsError::new(OP, e))
    }

    /// Receive into `buf`, copying at most `buf.len()` bytes.
    /// Returns the sender and the full length of the message.
    pub fn receive(
        &self,
        buf: &mut [u8],
        source: Source,
        tag: Tag,
    ) -> Result<(usize, usize), CommsError> {
        let (from, data) = self.receive_vec(source, tag)?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        if n < data.len() {
            debug!(from, tag, len = data.len(), capacity = buf.len(), "Message truncated");
        }
        Ok((from, data.len()))
    }

    pub fn receive_vec(&self, source: Source, tag: Tag) -> Result<(usize, Vec<u8>), CommsError> {
        const OP: &str = "receive";
        Self::check_user_tag(OP, tag)?;
        if let Source::Rank(r) = source {
            self.check_rank(OP, r)?;
        }
        self.recv_chunked(source, tag)
            .map_err(|e| CommsError::new(OP, e))
    }

    /// Overwrite `buf` on every rank with the root's contents.
    /// Non-root ranks copy at most `buf.len()` bytes.
    pub fn broadcast(&self, buf: &mut [u8], root: usize) -> Result<(), CommsError> {
        let data = self.broadcast_vec(buf, root)?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(())
    }

    /// Every rank returns the root's `data`, the argument is ignored on non-root ranks
    pub fn broadcast_vec(&self, data: &[u8], root: usize) -> Result<Vec<u8>, CommsError> {
        const OP: &str = "broadcast";
        self.check_rank(OP, root)?;
        let result = if self.rank() == root {
            (0..self.size())
                .filter(|r| *r != root)
                .try_for_each(|r| self.send_chunked(r, BROADCAST_TAG, data))
                .map(|()| data.to_vec())
        } else {
            self.recv_chunked(Source::Rank(root), BROADCAST_TAG)
                .map(|(_, data)| data)
        };
        result.map_err(|e| CommsError::new(OP, e))
    }

    /// Every rank returns the root's parameter set
    pub fn broadcast_parset(&self, parset: &Parset, root: usize) -> Result<Parset, CommsError> {
        let encoded = if self.rank() == root {
            encode_parset(parset)
        } else {
            vec![]
        };
        let bytes = self.broadcast_vec(&encoded, root)?;
        decode_parset(&bytes).map_err(|e| CommsError::new("broadcast_parset", e))
    }

    /// Tell the master this worker is idle
    pub fn signal_ready(&self) -> Result<(), CommsError> {
        let me = self.rank() as u64;
        self.transport
            .send_frame(0, READY_TAG, &me.to_le_bytes())
            .map_err(|e| CommsError::new("signal_ready", e))
    }

    /// Block until some worker signals ready, returning its rank
    pub fn get_ready_worker_id(&self) -> Result<usize, CommsError> {
        const OP: &str = "get_ready_worker_id";
        let (from, data) = self
            .transport
            .recv_frame(Source::Any, READY_TAG)
            .map_err(|e| CommsError::new(OP, e))?;
        let claimed = <[u8; 8]>::try_from(data.as_slice())
            .map(u64::from_le_bytes)
            .map_err(|_| {
                CommsError::new(OP, CommsErrorKind::Malformed("ready signal".to_owned()))
            })?;
        if claimed != from as u64 {
            return Err(CommsError::new(
                OP,
                CommsErrorKind::Malformed(format!("rank {from} claimed to be {claimed}")),
            ));
        }
        Ok(from)
    }

    /// Element-wise sum of `values` across all ranks, written into the root's slice.
    /// Every rank must pass a slice of the same length.
    pub fn sum_reduce(&self, values: &mut [f32], root: usize) -> Result<(), CommsError> {
        const OP: &str = "sum_reduce";
        self.check_rank(OP, root)?;
        let result = if self.rank() == root {
            let mut incoming = vec![0f32; values.len()];
            (0..self.size()).filter(|r| *r != root).try_for_each(|r| {
                let (_, data) = self.recv_chunked(Source::Rank(r), REDUCE_TAG)?;
                let dst = incoming.as_mut_byte_slice();
                if data.len() != dst.len() {
                    return Err(CommsErrorKind::Malformed(format!(
                        "rank {r} contributed {} bytes, expected {}",
                        data.len(),
                        dst.len()
                    )));
                }
                dst.copy_from_slice(&data);
                values
                    .iter_mut()
                    .zip(&incoming)
                    .for_each(|(v, x)| *v += x);
                Ok(())
            })
        } else {
            self.send_chunked(root, REDUCE_TAG, values.as_byte_slice())
        };
        result.map_err(|e| CommsError::new(OP, e))
    }

    /// Terminate the whole group
    pub fn abort(&self, code: i32) {
        error!(rank = self.rank(), code, "Communication group abort requested");
        self.transport.abort(code);
    }

    /// Run `hook` as soon as any rank aborts the group, so work outside of comms can stop
    pub fn on_abort(&self, hook: impl Fn(i32) + Send + Sync + 'static) {
        self.transport.on_abort(Box::new(hook));
    }

    /// The abort code, once the group has been aborted
    pub fn aborted(&self) -> Option<i32> {
        self.transport.aborted()
    }
}

fn put_len(out: &mut Vec<u8>, len: usize) {
    out.extend_from_slice(&(len as u64).to_le_bytes());
}

/// Entry count, then per entry: key length, value length, key bytes, value bytes
fn encode_parset(parset: &Parset) -> Vec<u8> {
    let mut out = vec![];
    put_len(&mut out, parset.len());
    for (k, v) in parset.iter() {
        put_len(&mut out, k.len());
        put_len(&mut out, v.len());
        out.extend_from_slice(k.as_bytes());
        out.extend_from_slice(v.as_bytes());
    }
    out
}

struct Cursor<'a> {
    bytes: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CommsErrorKind> {
        if self.bytes.len() < n {
            return Err(CommsErrorKind::Malformed("truncated parameter set".to_owned()));
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Ok(head)
    }

    fn len(&mut self) -> Result<usize, CommsErrorKind> {
        let raw: [u8; 8] = self
            .take(8)?
            .try_into()
            .map_err(|_| CommsErrorKind::Malformed("length field".to_owned()))?;
        usize::try_from(u64::from_le_bytes(raw)).map_err(|e| CommsErrorKind::Malformed(e.to_string()))
    }

    fn string(&mut self, n: usize) -> Result<String, CommsErrorKind> {
        let bytes = self.take(n)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| CommsErrorKind::Malformed(e.to_string()))
    }
}

fn decode_parset(bytes: &[u8]) -> Result<Parset, CommsErrorKind> {
    let mut cursor = Cursor { bytes };
    let count = cursor.len()?;
    let mut parset = Parset::new();
    for _ in 0..count {
        let key_len = cursor.len()?;
        let value_len = cursor.len()?;
        let key = cursor.string(key_len)?;
        let value = cursor.string(value_len)?;
        parset.insert(key, value);
    }
    if !cursor.bytes.is_empty() {
        return Err(CommsErrorKind::Malformed(format!(
            "{} trailing bytes after parameter set",
            cursor.bytes.len()
        )));
    }
    Ok(parset)
}
