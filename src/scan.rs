//! Tracking of the current scan, driven by the metadata accompanying each cycle

use crate::common::{SCAN_IDLE, SCAN_OBS_COMPLETE};
use tracing::info;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ScanError {
    #[error("Metadata reported an invalid scan id {0}")]
    InvalidScanId(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Scanning(i64),
    ObservationComplete,
}

#[derive(Debug)]
pub struct ScanManager {
    scan_index: i64,
    obs_complete: bool,
}

impl Default for ScanManager {
    fn default() -> Self {
        Self {
            scan_index: SCAN_IDLE,
            obs_complete: false,
        }
    }
}

impl ScanManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the scan id reported for this cycle
    pub fn update(&mut self, new_scan_id: i64) -> Result<(), ScanError> {
        // Once complete, the state is frozen
        if self.obs_complete {
            return Ok(());
        }
        match new_scan_id {
            SCAN_OBS_COMPLETE => {
                info!(last_scan = self.scan_index, "Observation complete");
                self.obs_complete = true;
                self.scan_index = SCAN_OBS_COMPLETE;
            }
            SCAN_IDLE => {
                if self.scan_index != SCAN_IDLE {
                    info!(last_scan = self.scan_index, "Telescope idle");
                }
                self.scan_index = SCAN_IDLE;
            }
            id if id >= 0 => {
                if id != self.scan_index {
                    info!(from = self.scan_index, to = id, "Scan changed");
                    self.scan_index = id;
                }
            }
            id => return Err(ScanError::InvalidScanId(id)),
        }
        Ok(())
    }

    pub fn scan_index(&self) -> i64 {
        self.scan_index
    }

    pub fn observation_complete(&self) -> bool {
        self.obs_complete
    }

    pub fn is_scanning(&self) -> bool {
        self.scan_index >= 0
    }

    pub fn state(&self) -> ScanState {
        match self.scan_index {
            SCAN_OBS_COMPLETE => ScanState::ObservationComplete,
            id if id >= 0 => ScanState::Scanning(id),
            _ => ScanState::Idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_idle() {
        let sm = ScanManager::new();
        assert_eq!(sm.state(), ScanState::Idle);
        assert_eq!(sm.scan_index(), -1);
        assert!(!sm.observation_complete());
    }

    #[test]
    fn test_transitions() {
        let mut sm = ScanManager::new();
        sm.update(0).unwrap();
        assert_eq!(sm.state(), ScanState::Scanning(0));
        sm.update(0).unwrap();
        assert_eq!(sm.scan_index(), 0);
        sm.update(3).unwrap();
        assert_eq!(sm.state(), ScanState::Scanning(3));
        sm.update(-1).unwrap();
        assert_eq!(sm.state(), ScanState::Idle);
        sm.update(-1).unwrap();
        assert_eq!(sm.state(), ScanState::Idle);
        sm.update(4).unwrap();
        assert!(sm.is_scanning());
        sm.update(-2).unwrap();
        assert_eq!(sm.state(), ScanState::ObservationComplete);
        assert!(sm.observation_complete());
    }

    #[test]
    fn test_large_scan_id() {
        let mut sm = ScanManager::new();
        let id = i64::from(u32::MAX) + 5;
        sm.update(id).unwrap();
        assert_eq!(sm.state(), ScanState::Scanning(id));
        sm.update(i64::MAX).unwrap();
        assert_eq!(sm.state(), ScanState::Scanning(i64::MAX));
    }

    #[test]
    fn test_invalid_scan_id() {
        let mut sm = ScanManager::new();
        sm.update(2).unwrap();
        assert_eq!(sm.update(-3), Err(ScanError::InvalidScanId(-3)));
        // A rejected update leaves the state alone
        assert_eq!(sm.scan_index(), 2);
    }

    #[test]
    fn test_complete_is_terminal() {
        let mut sm = ScanManager::new();
        sm.update(-2).unwrap();
        for id in [0, 5, -1, -2, -3, i64::MIN, i64::MAX] {
            assert!(sm.update(id).is_ok());
            assert!(sm.observation_complete());
            assert_eq!(sm.scan_index(), -2);
        }
    }
}
