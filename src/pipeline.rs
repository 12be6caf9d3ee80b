//! The ingest driver: fetch a cycle, run it through the task chain, track the scan

use crate::{
    chunk::VisChunk,
    common::SCAN_OBS_COMPLETE,
    monitoring::{CYCLE_GAUGE, SCAN_GAUGE, STALL_GAUGE},
    scan::{ScanError, ScanManager},
    tasks::{ChainError, TaskChain},
};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, info, info_span, warn};

/// Result of asking a source for the next cycle
#[derive(Debug)]
pub enum Fetched {
    /// A complete (possibly partially flagged) cycle
    Chunk(VisChunk),
    /// Metadata reported a negative scan id, there is no data for this cycle
    Status(i64),
    /// Nothing arrived within the timeout
    TimedOut,
}

/// Anything that produces per-cycle chunks with a bounded wait
pub trait ChunkSource {
    type Error: std::error::Error + Send + Sync + 'static;

    fn next_chunk(&mut self, timeout: Duration) -> Result<Fetched, Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Init,
    Running,
    Draining,
    Stopped,
}

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("Rank {rank}, cycle {cycle}: source failed")]
    Source {
        rank: usize,
        cycle: u64,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Rank {rank}, cycle {cycle}: scan tracking failed")]
    Scan {
        rank: usize,
        cycle: u64,
        #[source]
        source: ScanError,
    },
    #[error("Rank {rank}, cycle {cycle}: task {} failed", .source.task)]
    Chain {
        rank: usize,
        cycle: u64,
        #[source]
        source: ChainError,
    },
    #[error("Pipeline has already run")]
    AlreadyRun,
}

impl PipelineError {
    /// The failure means the metadata or peers broke protocol rather than hit an I/O problem
    #[must_use]
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, PipelineError::Scan { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Fetches that returned a chunk or a status
    pub cycles: u64,
    /// Chunks that went through the whole chain
    pub processed: u64,
    /// Fetches that timed out before the observation completed
    pub stalls: u64,
    pub final_scan: i64,
}

impl RunSummary {
    /// The run ended because the observation completed, not because it was stopped early
    #[must_use]
    pub fn completed(&self) -> bool {
        self.final_scan == SCAN_OBS_COMPLETE
    }
}

pub struct IngestPipeline<S> {
    source: S,
    chain: TaskChain,
    scan: ScanManager,
    rank: usize,
    timeout: Duration,
    shutdown: Option<broadcast::Receiver<()>>,
    state: PipelineState,
}

impl<S: ChunkSource> IngestPipeline<S> {
    pub fn new(source: S, chain: TaskChain, rank: usize, timeout: Duration) -> Self {
        Self {
            source,
            chain,
            scan: ScanManager::new(),
            rank,
            timeout,
            shutdown: None,
            state: PipelineState::Init,
        }
    }

    /// Stop cleanly at the next cycle boundary once anything is sent on this channel
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: broadcast::Receiver<()>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn scan(&self) -> &ScanManager {
        &self.scan
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    fn shutdown_requested(&mut self) -> bool {
        match self.shutdown.as_mut().map(broadcast::Receiver::try_recv) {
            None | Some(Err(TryRecvError::Empty)) => false,
            Some(Ok(()) | Err(TryRecvError::Closed | TryRecvError::Lagged(_))) => true,
        }
    }

    fn update_scan(&mut self, scan_id: i64, cycle: u64) -> Result<(), PipelineError> {
        self.scan
            .update(scan_id)
            .map_err(|source| PipelineError::Scan {
                rank: self.rank,
                cycle,
                source,
            })?;
        SCAN_GAUGE.set(self.scan.scan_index());
        if self.scan.observation_complete() && self.state == PipelineState::Running {
            info!(cycle, "Draining");
            self.state = PipelineState::Draining;
        }
        Ok(())
    }

    /// Run until the observation completes, a shutdown is requested or something fails.
    /// Any error leaves the pipeline stopped.
    pub fn run(&mut self) -> Result<RunSummary, PipelineError> {
        if self.state != PipelineState::Init {
            return Err(PipelineError::AlreadyRun);
        }
        let span = info_span!("ingest", rank = self.rank);
        let _enter = span.enter();
        self.state = PipelineState::Running;
        info!(tasks = ?self.chain.names(), "Ingest pipeline running");
        let result = self.run_loop();
        self.state = PipelineState::Stopped;
        match &result {
            Ok(summary) => info!(
                cycles = summary.cycles,
                processed = summary.processed,
                stalls = summary.stalls,
                "Ingest pipeline stopped"
            ),
            Err(e) => warn!("Ingest pipeline failed - {e}"),
        }
        result
    }

    fn run_loop(&mut self) -> Result<RunSummary, PipelineError> {
        let mut summary = RunSummary::default();
        loop {
            if self.shutdown_requested() {
                info!("Shutdown requested");
                break;
            }
            let cycle = summary.cycles;
            let fetched =
                self.source
                    .next_chunk(self.timeout)
                    .map_err(|e| PipelineError::Source {
                        rank: self.rank,
                        cycle,
                        source: Box::new(e),
                    })?;
            match fetched {
                Fetched::TimedOut => {
                    if self.scan.observation_complete() {
                        debug!("Nothing left after observation complete");
                        break;
                    }
                    summary.stalls += 1;
                    STALL_GAUGE.inc();
                    warn!(
                        timeout = ?self.timeout,
                        stalls = summary.stalls,
                        "No data within timeout, still waiting"
                    );
                }
                Fetched::Status(scan_id) => {
                    summary.cycles += 1;
                    self.update_scan(scan_id, cycle)?;
                }
                Fetched::Chunk(mut chunk) => {
                    summary.cycles += 1;
                    if self.state == PipelineState::Draining {
                        debug!(timestamp = chunk.timestamp, "Discarding chunk while draining");
                        continue;
                    }
                    self.update_scan(chunk.scan_id, cycle)?;
                    if !self.scan.is_scanning() {
                        continue;
                    }
                    self.chain
                        .process(&mut chunk)
                        .map_err(|source| PipelineError::Chain {
                            rank: self.rank,
                            cycle,
                            source,
                        })?;
                    summary.processed += 1;
                    CYCLE_GAUGE.inc();
                    debug!(cycle, timestamp = chunk.timestamp, "Cycle processed");
                }
            }
        }
        summary.final_scan = self.scan.scan_index();
        Ok(summary)
    }
}
