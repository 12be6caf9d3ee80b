//! One correlator integration cycle worth of visibilities

use crate::common::Sample;
use hifitime::{Duration, Epoch};
use ndarray::Array3;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ShapeError {
    #[error("Per-row field {field} has {found} entries, expected {expected}")]
    RowLength {
        field: &'static str,
        found: usize,
        expected: usize,
    },
    #[error("Flag cube shape {flag:?} doesn't match the visibility cube {vis:?}")]
    FlagShape { flag: Vec<usize>, vis: Vec<usize> },
    #[error("Frequency axis has {found} channels, expected {expected}")]
    Frequency { found: usize, expected: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct VisChunk {
    /// Integration timestamp, microseconds since the Unix epoch
    pub timestamp: u64,
    pub time: Epoch,
    pub interval: Duration,
    pub scan_id: i64,
    pub antenna1: Vec<u32>,
    pub antenna2: Vec<u32>,
    pub beam1: Vec<u32>,
    pub beam2: Vec<u32>,
    /// Pointing direction (RA, Dec) per row, radians
    pub pointing: Vec<[f64; 2]>,
    /// Baseline coordinates per row, metres
    pub uvw: Vec<[f64; 3]>,
    /// (row, channel, pol)
    pub visibility: Array3<Sample>,
    /// (row, channel, pol), true is flagged
    pub flag: Array3<bool>,
    /// Channel centre frequencies, Hz
    pub frequency: Vec<f64>,
}

/// Convert a wire timestamp to an epoch
#[must_use]
pub fn timestamp_epoch(timestamp: u64) -> Epoch {
    Epoch::from_unix_seconds(timestamp as f64 / 1e6)
}

impl VisChunk {
    /// A chunk with every sample zeroed and flagged
    #[must_use]
    pub fn new(n_row: usize, n_channel: usize, n_pol: usize, timestamp: u64) -> Self {
        Self {
            timestamp,
            time: timestamp_epoch(timestamp),
            interval: Duration::from_seconds(0.0),
            scan_id: 0,
            antenna1: vec![0; n_row],
            antenna2: vec![0; n_row],
            beam1: vec![0; n_row],
            beam2: vec![0; n_row],
            pointing: vec![[0.0; 2]; n_row],
            uvw: vec![[0.0; 3]; n_row],
            visibility: Array3::zeros((n_row, n_channel, n_pol)),
            flag: Array3::from_elem((n_row, n_channel, n_pol), true),
            frequency: vec![0.0; n_channel],
        }
    }

    pub fn n_row(&self) -> usize {
        self.visibility.dim().0
    }

    pub fn n_channel(&self) -> usize {
        self.visibility.dim().1
    }

    pub fn n_pol(&self) -> usize {
        self.visibility.dim().2
    }

    /// Swap in new cubes and frequency axis after a channel-axis change
    pub fn replace_channels(
        &mut self,
        visibility: Array3<Sample>,
        flag: Array3<bool>,
        frequency: Vec<f64>,
    ) -> Result<(), ShapeError> {
        self.visibility = visibility;
        self.flag = flag;
        self.frequency = frequency;
        self.validate()
    }

    /// Check every per-row and per-channel field agrees with the visibility cube
    pub fn validate(&self) -> Result<(), ShapeError> {
        let n_row = self.n_row();
        let rows = [
            ("antenna1", self.antenna1.len()),
            ("antenna2", self.antenna2.len()),
            ("beam1", self.beam1.len()),
            ("beam2", self.beam2.len()),
            ("pointing", self.pointing.len()),
            ("uvw", self.uvw.len()),
        ];
        for (field, found) in rows {
            if found != n_row {
                return Err(ShapeError::RowLength {
                    field,
                    found,
                    expected: n_row,
                });
            }
        }
        if self.flag.shape() != self.visibility.shape() {
            return Err(ShapeError::FlagShape {
                flag: self.flag.shape().to_vec(),
                vis: self.visibility.shape().to_vec(),
            });
        }
        if self.frequency.len() != self.n_channel() {
            return Err(ShapeError::Frequency {
                found: self.frequency.len(),
                expected: self.n_channel(),
            });
        }
        Ok(())
    }

    /// Fraction of samples that are flagged
    pub fn flag_fraction(&self) -> f64 {
        if self.flag.is_empty() {
            return 0.0;
        }
        self.flag.iter().filter(|f| **f).count() as f64 / self.flag.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_consistent() {
        let chunk = VisChunk::new(3, 8, 4, 1_000_000);
        assert!(chunk.validate().is_ok());
        assert_eq!((chunk.n_row(), chunk.n_channel(), chunk.n_pol()), (3, 8, 4));
        assert!((chunk.flag_fraction() - 1.0).abs() < f64::EPSILON);
        assert!((chunk.time.to_unix_seconds() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_validate_catches_row_mismatch() {
        let mut chunk = VisChunk::new(2, 4, 1, 0);
        chunk.uvw.pop();
        assert_eq!(
            chunk.validate(),
            Err(ShapeError::RowLength {
                field: "uvw",
                found: 1,
                expected: 2
            })
        );
    }

    #[test]
    fn test_replace_channels_checks_frequency() {
        let mut chunk = VisChunk::new(2, 4, 1, 0);
        let res = chunk.replace_channels(
            Array3::zeros((2, 2, 1)),
            Array3::from_elem((2, 2, 1), false),
            vec![1.0; 3],
        );
        assert_eq!(
            res,
            Err(ShapeError::Frequency {
                found: 3,
                expected: 2
            })
        );
    }
}
