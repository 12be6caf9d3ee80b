//! Averaging of adjacent frequency channels

use super::{Task, TaskError};
use crate::{chunk::VisChunk, common::Sample, config::Parset};
use ndarray::Array3;

pub struct ChannelAvgTask {
    name: String,
    averaging: usize,
}

impl ChannelAvgTask {
    pub fn new(name: impl Into<String>, averaging: usize) -> Result<Self, TaskError> {
        if averaging == 0 {
            return Err(TaskError::Invalid(
                "channel averaging factor must be at least 1".to_owned(),
            ));
        }
        Ok(Self {
            name: name.into(),
            averaging,
        })
    }

    pub fn from_params(name: impl Into<String>, params: &Parset) -> Result<Self, TaskError> {
        Self::new(name, params.get_parsed("averaging")?)
    }
}

impl Task for ChannelAvgTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, chunk: &mut VisChunk) -> Result<(), TaskError> {
        let n = self.averaging;
        if n == 1 {
            return Ok(());
        }
        let (n_row, n_channel, n_pol) = chunk.visibility.dim();
        if n_channel % n != 0 {
            return Err(TaskError::Invalid(format!(
                "{n_channel} channels can't be averaged by {n}"
            )));
        }
        let n_out = n_channel / n;
        let mut vis = Array3::<Sample>::zeros((n_row, n_out, n_pol));
        let mut flag = Array3::from_elem((n_row, n_out, n_pol), false);
        // Any flagged contributor flags the output
        for ((row, chan, pol), v) in chunk.visibility.indexed_iter() {
            vis[[row, chan / n, pol]] += *v;
            flag[[row, chan / n, pol]] |= chunk.flag[[row, chan, pol]];
        }
        let scale = n as f32;
        vis.mapv_inplace(|v| v / scale);
        let frequency = chunk
            .frequency
            .chunks_exact(n)
            .map(|f| f.iter().sum::<f64>() / n as f64)
            .collect();
        chunk.replace_channels(vis, flag, frequency)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk() -> VisChunk {
        let mut chunk = VisChunk::new(2, 8, 1, 0);
        for ((row, chan, _), v) in chunk.visibility.indexed_iter_mut() {
            *v = Sample::new((row * 8 + chan) as f32, 1.0);
        }
        chunk.flag.fill(false);
        chunk.frequency = (0..8).map(|c| 1e9 + c as f64 * 1e6).collect();
        chunk
    }

    #[test]
    fn test_average() {
        let mut c = chunk();
        c.flag[[1, 6, 0]] = true;
        ChannelAvgTask::new("avg", 4).unwrap().process(&mut c).unwrap();
        assert_eq!((c.n_row(), c.n_channel(), c.n_pol()), (2, 2, 1));
        assert_eq!(c.visibility[[0, 0, 0]], Sample::new(1.5, 1.0));
        assert_eq!(c.visibility[[1, 1, 0]], Sample::new(13.5, 1.0));
        assert!(!c.flag[[1, 0, 0]]);
        assert!(c.flag[[1, 1, 0]]);
        assert!((c.frequency[1] - (1e9 + 5.5e6)).abs() < 1e-3);
    }

    #[test]
    fn test_identity() {
        let mut c = chunk();
        let before = c.clone();
        ChannelAvgTask::new("avg", 1).unwrap().process(&mut c).unwrap();
        assert_eq!(c, before);
    }

    #[test]
    fn test_indivisible() {
        let mut c = chunk();
        assert!(matches!(
            ChannelAvgTask::new("avg", 3).unwrap().process(&mut c),
            Err(TaskError::Invalid(_))
        ));
        assert!(ChannelAvgTask::new("avg", 0).is_err());
    }
}
