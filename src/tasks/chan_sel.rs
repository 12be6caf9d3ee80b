use super::{Task, TaskError};
use crate::{chunk::VisChunk, config::Parset};
use ndarray::s;

/// Keeps a contiguous block of channels
pub struct ChannelSelTask {
    name: String,
    start: usize,
    n_channel: usize,
}

impl ChannelSelTask {
    pub fn new(name: impl Into<String>, start: usize, n_channel: usize) -> Result<Self, TaskError> {
        if n_channel == 0 {
            return Err(TaskError::Invalid("must select at least one channel".to_owned()));
        }
        Ok(Self {
            name: name.into(),
            start,
            n_channel,
        })
    }

    pub fn from_params(name: impl Into<String>, params: &Parset) -> Result<Self, TaskError> {
        Self::new(name, params.get_or("start", 0)?, params.get_parsed("nchan")?)
    }
}

impl Task for ChannelSelTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, chunk: &mut VisChunk) -> Result<(), TaskError> {
        let end = self.start + self.n_channel;
        if end > chunk.n_channel() {
            return Err(TaskError::Invalid(format!(
                "channels {}..{end} requested from a chunk of {}",
                self.start,
                chunk.n_channel()
            )));
        }
        let vis = chunk.visibility.slice(s![.., self.start..end, ..]).to_owned();
        let flag = chunk.flag.slice(s![.., self.start..end, ..]).to_owned();
        let frequency = chunk.frequency[self.start..end].to_vec();
        chunk.replace_channels(vis, flag, frequency)?;
        Ok(())
    }
}
