//! The correlator visibility datagram, as it comes off the wire

use crate::common::{Sample, CHANNELS_PER_DATAGRAM, POLS};

/// Only datagrams carrying this version are accepted
pub const DATAGRAM_VERSION: u32 = 1;
/// Size of the fixed header (version, slice, timestamp, antennas, beam, reserved)
const HEADER_SIZE: usize = 32;
/// Number of samples in one datagram
pub const SAMPLES: usize = CHANNELS_PER_DATAGRAM * POLS;
/// Bytes of visibility data (re and im as f32)
const VIS_SIZE: usize = SAMPLES * 8;
/// Total UDP payload size
pub const DATAGRAM_SIZE: usize = HEADER_SIZE + VIS_SIZE + SAMPLES;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
/// Errors that can be produced decoding datagrams
pub enum Error {
    #[error("Datagram was {0} bytes, expected {DATAGRAM_SIZE}")]
    SizeMismatch(usize),
    #[error("Datagram version {found} does not match the expected {DATAGRAM_VERSION}")]
    VersionMismatch { found: u32 },
}

/// One slice of visibilities for a single (antenna pair, beam, channel block)
#[derive(Debug, Clone, PartialEq)]
pub struct VisDatagram {
    pub version: u32,
    /// Index of the block of `CHANNELS_PER_DATAGRAM` channels this datagram covers
    pub slice: u32,
    /// Integration timestamp, microseconds since the Unix epoch
    pub timestamp: u64,
    pub antenna1: u32,
    pub antenna2: u32,
    pub beam: u32,
    /// Samples ordered channel-major, `[chan * POLS + pol]`
    pub vis: [Sample; SAMPLES],
    pub flags: [bool; SAMPLES],
}

impl Default for VisDatagram {
    fn default() -> Self {
        Self {
            version: DATAGRAM_VERSION,
            slice: 0,
            timestamp: 0,
            antenna1: 0,
            antenna2: 0,
            beam: 0,
            vis: [Sample::new(0.0, 0.0); SAMPLES],
            flags: [false; SAMPLES],
        }
    }
}

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}

fn f32_at(bytes: &[u8], offset: usize) -> f32 {
    f32::from_bits(u32_at(bytes, offset))
}

impl VisDatagram {
    /// Construct a datagram from a raw UDP payload, rejecting wrong sizes and versions
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != DATAGRAM_SIZE {
            return Err(Error::SizeMismatch(bytes.len()));
        }
        let version = u32_at(bytes, 0);
        if version != DATAGRAM_VERSION {
            return Err(Error::VersionMismatch { found: version });
        }
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&bytes[8..16]);
        let mut dg = VisDatagram {
            version,
            slice: u32_at(bytes, 4),
            timestamp: u64::from_le_bytes(ts),
            antenna1: u32_at(bytes, 16),
            antenna2: u32_at(bytes, 20),
            beam: u32_at(bytes, 24),
            ..Default::default()
        };
        let vis_bytes = &bytes[HEADER_SIZE..HEADER_SIZE + VIS_SIZE];
        for (i, word) in vis_bytes.chunks_exact(8).enumerate() {
            dg.vis[i] = Sample::new(f32_at(word, 0), f32_at(word, 4));
        }
        for (flag, byte) in dg.flags.iter_mut().zip(&bytes[HEADER_SIZE + VIS_SIZE..]) {
            *flag = *byte != 0;
        }
        Ok(dg)
    }

    /// Pack into the wire format
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DATAGRAM_SIZE);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.slice.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.antenna1.to_le_bytes());
        buf.extend_from_slice(&self.antenna2.to_le_bytes());
        buf.extend_from_slice(&self.beam.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        for s in &self.vis {
            buf.extend_from_slice(&s.re.to_le_bytes());
            buf.extend_from_slice(&s.im.to_le_bytes());
        }
        buf.extend(self.flags.iter().map(|f| u8::from(*f)));
        buf
    }

    /// The first global channel this datagram covers
    #[must_use]
    pub fn first_channel(&self) -> usize {
        self.slice as usize * CHANNELS_PER_DATAGRAM
    }

    /// Sample for a channel within this datagram and a polarisation
    #[must_use]
    pub fn sample(&self, chan: usize, pol: usize) -> (Sample, bool) {
        let idx = chan * POLS + pol;
        (self.vis[idx], self.flags[idx])
    }
}
