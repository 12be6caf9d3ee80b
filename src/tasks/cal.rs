//! Application of per-antenna complex gains

use super::{Task, TaskError};
use crate::{
    chunk::VisChunk,
    common::Sample,
    config::{ConfigError, ObsConfig, Parset},
};
use ndarray::s;
use tracing::debug;

pub struct CalTask {
    name: String,
    /// Indexed by antenna
    gains: Vec<Sample>,
}

impl CalTask {
    pub fn new(name: impl Into<String>, gains: Vec<Sample>) -> Self {
        Self {
            name: name.into(),
            gains,
        }
    }

    /// Gains come from `gain.<antenna name> = [re, im]`, defaulting to unity
    pub fn from_params(
        name: impl Into<String>,
        params: &Parset,
        config: &ObsConfig,
    ) -> Result<Self, TaskError> {
        let gains = config
            .antennas
            .iter()
            .map(|ant| {
                let key = format!("gain.{}", ant.name);
                if !params.contains(&key) {
                    return Ok(Sample::new(1.0, 0.0));
                }
                match params.get_list_parsed::<f32>(&key)?.as_slice() {
                    [re, im] => Ok(Sample::new(*re, *im)),
                    other => Err(ConfigError::invalid(
                        &key,
                        &format!("{other:?}"),
                        "expected [re, im]",
                    )),
                }
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Self::new(name, gains))
    }

    fn gain(&self, antenna: u32) -> Result<Sample, TaskError> {
        self.gains
            .get(antenna as usize)
            .copied()
            .ok_or(TaskError::UnknownAntenna(antenna))
    }
}

impl Task for CalTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, chunk: &mut VisChunk) -> Result<(), TaskError> {
        for row in 0..chunk.n_row() {
            let g = self.gain(chunk.antenna1[row])? * self.gain(chunk.antenna2[row])?.conj();
            if g.norm_sqr() == 0.0 {
                debug!(row, "Zero gain, flagging row");
                chunk.flag.slice_mut(s![row, .., ..]).fill(true);
                continue;
            }
            chunk
                .visibility
                .slice_mut(s![row, .., ..])
                .mapv_inplace(|v| v / g);
        }
        Ok(())
    }
}
