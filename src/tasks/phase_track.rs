use super::{Task, TaskError};
use crate::{
    chunk::VisChunk,
    common::{Sample, SPEED_OF_LIGHT},
};
use std::f64::consts::TAU;

/// Rotates each row's visibilities to the phase centre using the `w` term.
/// Must run after `CalcUvwTask`.
pub struct PhaseTrackTask {
    name: String,
}

impl PhaseTrackTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Task for PhaseTrackTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, chunk: &mut VisChunk) -> Result<(), TaskError> {
        for ((row, chan, _), v) in chunk.visibility.indexed_iter_mut() {
            let w = chunk.uvw[row][2];
            let phase = -TAU * w * chunk.frequency[chan] / SPEED_OF_LIGHT;
            let (s, c) = phase.sin_cos();
            *v *= Sample::new(c as f32, s as f32);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quarter_turn() {
        let mut chunk = VisChunk::new(2, 1, 1, 0);
        chunk.visibility.fill(Sample::new(1.0, 0.0));
        // w chosen so w * nu / c is a quarter of a turn
        chunk.frequency = vec![SPEED_OF_LIGHT];
        chunk.uvw = vec![[0.0; 3], [0.0, 0.0, 0.25]];
        PhaseTrackTask::new("pt").process(&mut chunk).unwrap();
        assert_eq!(chunk.visibility[[0, 0, 0]], Sample::new(1.0, 0.0));
        let rotated = chunk.visibility[[1, 0, 0]];
        assert!(rotated.re.abs() < 1e-6);
        assert!((rotated.im + 1.0).abs() < 1e-6);
    }
}
