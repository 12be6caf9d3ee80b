//! Dynamic amplitude flagging
//!
//! Keeps a running mean amplitude per (antenna1, antenna2, beam, pol) across
//! cycles. Statistics are keyed by row identity rather than chunk layout, so
//! they stay valid when the row order of successive chunks changes. Once
//! the warmup is over, unflagged samples brighter than `threshold` times the
//! running mean get flagged. Only samples that survive feed the statistics.

use super::{Task, TaskError};
use crate::{chunk::VisChunk, config::Parset};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Default, Clone, Copy)]
struct Running {
    sum: f64,
    count: u64,
}

impl Running {
    fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

pub struct AmplitudeFlagTask {
    name: String,
    threshold: f64,
    warmup: usize,
    cycles: usize,
    stats: HashMap<(u32, u32, u32, usize), Running>,
}

impl AmplitudeFlagTask {
    pub fn new(name: impl Into<String>, threshold: f64, warmup: usize) -> Result<Self, TaskError> {
        if !(threshold > 1.0) {
            return Err(TaskError::Invalid(format!(
                "amplitude threshold {threshold} must be greater than 1"
            )));
        }
        Ok(Self {
            name: name.into(),
            threshold,
            warmup,
            cycles: 0,
            stats: HashMap::new(),
        })
    }

    pub fn from_params(name: impl Into<String>, params: &Parset) -> Result<Self, TaskError> {
        Self::new(
            name,
            params.get_or("threshold", 5.0)?,
            params.get_or("warmup", 1)?,
        )
    }
}

impl Task for AmplitudeFlagTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, chunk: &mut VisChunk) -> Result<(), TaskError> {
        let armed = self.cycles >= self.warmup;
        let mut flagged = 0usize;
        for row in 0..chunk.n_row() {
            for pol in 0..chunk.n_pol() {
                let key = (chunk.antenna1[row], chunk.antenna2[row], chunk.beam1[row], pol);
                let running = self.stats.entry(key).or_default();
                let limit = running.mean().map(|m| m * self.threshold);
                for chan in 0..chunk.n_channel() {
                    if chunk.flag[[row, chan, pol]] {
                        continue;
                    }
                    let amp = f64::from(chunk.visibility[[row, chan, pol]].norm());
                    match limit {
                        Some(limit) if armed && limit > 0.0 && amp > limit => {
                            chunk.flag[[row, chan, pol]] = true;
                            flagged += 1;
                        }
                        _ => {
                            running.sum += amp;
                            running.count += 1;
                        }
                    }
                }
            }
        }
        if flagged > 0 {
            debug!(flagged, "Amplitude flagger flagged samples");
        }
        self.cycles += 1;
        Ok(())
    }
}
