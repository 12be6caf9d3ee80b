//! Alignment of the datagram stream with the metadata feed into per-cycle chunks
//!
//! Each cycle starts from a metadata record. Datagrams stamped with the same
//! timestamp are copied into the chunk; datagrams from earlier cycles are
//! late and discarded; the first datagram from a later cycle closes the
//! current one and is held over. If the datagram stream is ahead of the
//! metadata, stale metadata records are skipped until the two line up.
//! Samples that never arrive stay flagged.

use crate::{
    capture::VisSource,
    chunk::VisChunk,
    common::{baselines, CHANNELS_PER_DATAGRAM, POLS},
    config::ObsConfig,
    datagram::VisDatagram,
    metadata::{MetadataError, MetadataSource, TelescopeMetadata},
    monitoring::ALIGN_GAUGE,
    pipeline::{ChunkSource, Fetched},
    ring::{DatagramRing, Take},
};
use hifitime::Duration as HifiDuration;
use std::{
    cmp::Ordering,
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

#[derive(thiserror::Error, Debug)]
pub enum MergeError {
    #[error("Visibility stream closed")]
    VisClosed,
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error("Channel range {offset}..{end} is not a whole number of {CHANNELS_PER_DATAGRAM} channel slices")]
    ChannelLayout { offset: usize, end: usize },
}

/// Anything that hands out datagrams with a bounded wait
pub trait DatagramSource: Send {
    fn next(&self, timeout: Duration) -> Take<VisDatagram>;
}

impl DatagramSource for VisSource {
    fn next(&self, timeout: Duration) -> Take<VisDatagram> {
        VisSource::next(self, timeout)
    }
}

impl DatagramSource for Arc<DatagramRing<VisDatagram>> {
    fn next(&self, timeout: Duration) -> Take<VisDatagram> {
        self.take(timeout)
    }
}

/// Counters for datagrams the aligner couldn't use
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlignStats {
    pub late: u64,
    pub duplicate: u64,
    pub unknown_baseline: u64,
    pub out_of_range: u64,
    pub skipped_metadata: u64,
    pub incomplete_cycles: u64,
}

type RowKey = (u32, u32, u32);

pub struct MergedSource<V, M> {
    vis: V,
    metadata: M,
    config: Arc<ObsConfig>,
    /// (antenna1, antenna2, beam) to row index
    rows: HashMap<RowKey, usize>,
    row_keys: Vec<RowKey>,
    slices_per_row: usize,
    /// First datagram of the next cycle, held over from the last one
    pending: Option<VisDatagram>,
    stats: AlignStats,
}

impl<V: DatagramSource, M: MetadataSource> MergedSource<V, M> {
    pub fn new(vis: V, metadata: M, config: Arc<ObsConfig>) -> Result<Self, MergeError> {
        let offset = config.channel_offset;
        let n_channel = config.correlator.n_channel;
        if offset % CHANNELS_PER_DATAGRAM != 0 || n_channel % CHANNELS_PER_DATAGRAM != 0 {
            return Err(MergeError::ChannelLayout {
                offset,
                end: offset + n_channel,
            });
        }
        let n_ant = u32::try_from(config.antennas.len()).unwrap_or(u32::MAX);
        let n_beam = u32::try_from(config.correlator.n_beam).unwrap_or(u32::MAX);
        let mut row_keys =
            Vec::with_capacity(baselines(config.antennas.len()) * config.correlator.n_beam);
        for beam in 0..n_beam {
            for a1 in 0..n_ant {
                for a2 in a1..n_ant {
                    row_keys.push((a1, a2, beam));
                }
            }
        }
        let rows = row_keys.iter().enumerate().map(|(i, k)| (*k, i)).collect();
        Ok(Self {
            vis,
            metadata,
            rows,
            row_keys,
            slices_per_row: n_channel / CHANNELS_PER_DATAGRAM,
            config,
            pending: None,
            stats: AlignStats::default(),
        })
    }

    pub fn stats(&self) -> &AlignStats {
        &self.stats
    }

    pub fn n_row(&self) -> usize {
        self.row_keys.len()
    }

    fn next_datagram(&mut self, deadline: Instant) -> Result<Option<VisDatagram>, MergeError> {
        if let Some(dg) = self.pending.take() {
            return Ok(Some(dg));
        }
        match self
            .vis
            .next(deadline.saturating_duration_since(Instant::now()))
        {
            Take::Item(dg) => Ok(Some(dg)),
            Take::TimedOut => Ok(None),
            Take::Closed => Err(MergeError::VisClosed),
        }
    }

    /// An all-flagged chunk described by this metadata
    fn new_chunk(&self, md: &TelescopeMetadata) -> VisChunk {
        let correlator = &self.config.correlator;
        let mut chunk = VisChunk::new(self.n_row(), correlator.n_channel, POLS, md.timestamp);
        chunk.interval = HifiDuration::from_seconds(correlator.interval);
        chunk.scan_id = md.scan_id;
        for (row, (a1, a2, beam)) in self.row_keys.iter().enumerate() {
            chunk.antenna1[row] = *a1;
            chunk.antenna2[row] = *a2;
            chunk.beam1[row] = *beam;
            chunk.beam2[row] = *beam;
            chunk.pointing[row] = md.phase_direction;
        }
        for (c, f) in chunk.frequency.iter_mut().enumerate() {
            *f = correlator.frequency(self.config.channel_offset + c);
        }
        chunk
    }

    /// Copy a datagram into the chunk, returning the slice it filled
    fn place(
        &mut self,
        chunk: &mut VisChunk,
        dg: &VisDatagram,
        flagged_antennas: &[u32],
    ) -> Option<usize> {
        let Some(&row) = self.rows.get(&(dg.antenna1, dg.antenna2, dg.beam)) else {
            self.stats.unknown_baseline += 1;
            ALIGN_GAUGE.with_label_values(&["unknown_baseline"]).inc();
            warn!(
                antenna1 = dg.antenna1,
                antenna2 = dg.antenna2,
                beam = dg.beam,
                "Datagram for an unknown baseline"
            );
            return None;
        };
        let first = dg.first_channel();
        let offset = self.config.channel_offset;
        if first < offset || first + CHANNELS_PER_DATAGRAM > offset + chunk.n_channel() {
            self.stats.out_of_range += 1;
            ALIGN_GAUGE.with_label_values(&["out_of_range"]).inc();
            warn!(slice = dg.slice, "Datagram outside this rank's channel range");
            return None;
        }
        let local = first - offset;
        let row_flagged = flagged_antennas.contains(&dg.antenna1)
            || flagged_antennas.contains(&dg.antenna2);
        for c in 0..CHANNELS_PER_DATAGRAM {
            for p in 0..POLS {
                let (sample, flag) = dg.sample(c, p);
                chunk.visibility[[row, local + c, p]] = sample;
                chunk.flag[[row, local + c, p]] = flag || row_flagged;
            }
        }
        Some(row * self.slices_per_row + local / CHANNELS_PER_DATAGRAM)
    }

    fn align(
        &mut self,
        mut md: TelescopeMetadata,
        timeout: Duration,
    ) -> Result<Fetched, MergeError> {
        let deadline = Instant::now() + timeout;
        let expected = self.n_row() * self.slices_per_row;
        let mut chunk = self.new_chunk(&md);
        let mut seen = vec![false; expected];
        let mut received = 0;
        while received < expected {
            let Some(dg) = self.next_datagram(deadline)? else {
                break;
            };
            match dg.timestamp.cmp(&md.timestamp) {
                Ordering::Less => {
                    self.stats.late += 1;
                    ALIGN_GAUGE.with_label_values(&["late"]).inc();
                    debug!(
                        timestamp = dg.timestamp,
                        cycle = md.timestamp,
                        "Discarding late datagram"
                    );
                }
                Ordering::Greater if received == 0 => {
                    // The datagrams have moved past this metadata, catch the metadata up
                    self.pending = Some(dg);
                    self.stats.skipped_metadata += 1;
                    warn!(timestamp = md.timestamp, "Skipping stale metadata");
                    match self
                        .metadata
                        .next(deadline.saturating_duration_since(Instant::now()))?
                    {
                        Some(next) if next.scan_id >= 0 => {
                            md = next;
                            chunk = self.new_chunk(&md);
                        }
                        Some(next) => return Ok(Fetched::Status(next.scan_id)),
                        None => return Ok(Fetched::TimedOut),
                    }
                }
                Ordering::Greater => {
                    self.pending = Some(dg);
                    break;
                }
                Ordering::Equal => {
                    if let Some(slice) = self.place(&mut chunk, &dg, &md.flagged_antennas) {
                        if seen[slice] {
                            self.stats.duplicate += 1;
                            ALIGN_GAUGE.with_label_values(&["duplicate"]).inc();
                            warn!(slice = dg.slice, "Duplicate datagram");
                        } else {
                            seen[slice] = true;
                            received += 1;
                        }
                    }
                }
            }
        }
        if received < expected {
            self.stats.incomplete_cycles += 1;
            warn!(
                timestamp = md.timestamp,
                missing = expected - received,
                expected,
                "Cycle incomplete, missing data left flagged"
            );
        }
        Ok(Fetched::Chunk(chunk))
    }
}

impl<V: DatagramSource, M: MetadataSource> ChunkSource for MergedSource<V, M> {
    type Error = MergeError;

    fn next_chunk(&mut self, timeout: Duration) -> Result<Fetched, MergeError> {
        let Some(md) = self.metadata.next(timeout)? else {
            return Ok(Fetched::TimedOut);
        };
        if md.scan_id < 0 {
            return Ok(Fetched::Status(md.scan_id));
        }
        self.align(md, timeout)
    }
}
