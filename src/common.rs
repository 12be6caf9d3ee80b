//! Common types shared between tasks

use num_complex::Complex;
use std::time::Duration;

/// A single visibility sample
pub type Sample = Complex<f32>;

/// Number of frequency channels carried by one datagram (set by the correlator)
pub const CHANNELS_PER_DATAGRAM: usize = 16;
/// Number of polarisation products carried by one datagram
pub const POLS: usize = 4;
/// How long blocking calls wait before re-checking their stop conditions
pub const BLOCK_TIMEOUT: Duration = Duration::from_millis(100);
/// Speed of light in m/s
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Scan index reported while the telescope is between scans
pub const SCAN_IDLE: i64 = -1;
/// Scan index reported once the observation has finished
pub const SCAN_OBS_COMPLETE: i64 = -2;

/// Number of baselines (including autocorrelations) for `n` antennas
#[must_use]
pub fn baselines(n_antennas: usize) -> usize {
    n_antennas * (n_antennas + 1) / 2
}
