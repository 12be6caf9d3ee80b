//! Baseline coordinates for each row
//!
//! Baselines are formed from ITRF antenna positions and rotated into the
//! (u, v, w) frame of the row's pointing direction using the Greenwich hour
//! angle. Precession, nutation and polar motion are ignored.

use super::{Task, TaskError};
use crate::{chunk::VisChunk, config::ObsConfig};
use std::f64::consts::TAU;

/// Greenwich mean sidereal angle (radians) at a UTC MJD
fn gmst(mjd_utc: f64) -> f64 {
    let days = mjd_utc - 51_544.5;
    (280.460_618_37 + 360.985_647_366_29 * days)
        .to_radians()
        .rem_euclid(TAU)
}

/// Rotate an ITRF baseline into (u, v, w) for a Greenwich hour angle and declination
#[must_use]
pub fn rotate(baseline: [f64; 3], hour_angle: f64, dec: f64) -> [f64; 3] {
    let [bx, by, bz] = baseline;
    let (sh, ch) = hour_angle.sin_cos();
    let (sd, cd) = dec.sin_cos();
    [
        sh * bx + ch * by,
        -sd * ch * bx + sd * sh * by + cd * bz,
        cd * ch * bx - cd * sh * by + sd * bz,
    ]
}

pub struct CalcUvwTask {
    name: String,
    positions: Vec<[f64; 3]>,
}

impl CalcUvwTask {
    pub fn new(name: impl Into<String>, config: &ObsConfig) -> Self {
        Self {
            name: name.into(),
            positions: config.antennas.iter().map(|a| a.location).collect(),
        }
    }

    fn position(&self, antenna: u32) -> Result<[f64; 3], TaskError> {
        self.positions
            .get(antenna as usize)
            .copied()
            .ok_or(TaskError::UnknownAntenna(antenna))
    }
}

impl Task for CalcUvwTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, chunk: &mut VisChunk) -> Result<(), TaskError> {
        let gst = gmst(chunk.time.to_mjd_utc_days());
        for row in 0..chunk.n_row() {
            let p1 = self.position(chunk.antenna1[row])?;
            let p2 = self.position(chunk.antenna2[row])?;
            let baseline = [p2[0] - p1[0], p2[1] - p1[1], p2[2] - p1[2]];
            let [ra, dec] = chunk.pointing[row];
            chunk.uvw[row] = rotate(baseline, gst - ra, dec);
        }
        Ok(())
    }
}
