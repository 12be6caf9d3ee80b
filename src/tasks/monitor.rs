use super::{Task, TaskError};
use crate::{
    chunk::VisChunk,
    monitoring::{FLAG_FRACTION, MEAN_AMPLITUDE},
};

/// Publishes per-cycle data quality numbers to the metrics endpoint
pub struct MonitorTask {
    name: String,
}

impl MonitorTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Mean amplitude over unflagged samples, zero if everything is flagged
#[must_use]
pub fn mean_amplitude(chunk: &VisChunk) -> f64 {
    let (sum, n) = chunk
        .visibility
        .iter()
        .zip(chunk.flag.iter())
        .filter(|(_, f)| !**f)
        .fold((0f64, 0usize), |(sum, n), (v, _)| {
            (sum + f64::from(v.norm()), n + 1)
        });
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

impl Task for MonitorTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, chunk: &mut VisChunk) -> Result<(), TaskError> {
        FLAG_FRACTION.set(chunk.flag_fraction());
        MEAN_AMPLITUDE.set(mean_amplitude(chunk));
        Ok(())
    }
}
