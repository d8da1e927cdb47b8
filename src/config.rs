//! Controller Configuration

use crate::controller::number_pool::MINOR_NR_AUTO_BASE;
use crate::controller::reporter::DEFAULT_REPORT_RETENTION;
use crate::controller::satellite::DEFAULT_SATELLITE_TIMEOUT;
use crate::controller::secrets::DEFAULT_PASSPHRASE_ROUNDS;
use crate::error::{Error, Result};
use crate::model::{MINOR_NR_MAX, MINOR_NR_MIN};
use std::path::PathBuf;
use std::time::Duration;

/// Settings of the mutation pipeline and its services
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Range handed out for DRBD minor numbers
    pub minor_nr_min: u32,
    pub minor_nr_max: u32,
    /// First minor number tried by automatic allocation
    pub minor_nr_auto_base: u32,
    /// Time a satellite gets to acknowledge an update
    pub satellite_timeout: Duration,
    /// Error reports kept in memory
    pub report_retention: usize,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
    /// Data directory of the file store, `None` for in-memory
    pub data_dir: Option<PathBuf>,
    /// PBKDF2 rounds used when a master passphrase is created or changed
    pub passphrase_rounds: u32,
    /// Bearer token that grants REST callers the system role, `None`
    /// leaves the REST API without privileged access
    pub admin_token: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            minor_nr_min: MINOR_NR_MIN,
            minor_nr_max: MINOR_NR_MAX,
            minor_nr_auto_base: MINOR_NR_AUTO_BASE,
            satellite_timeout: DEFAULT_SATELLITE_TIMEOUT,
            report_retention: DEFAULT_REPORT_RETENTION,
            event_capacity: 1024,
            data_dir: None,
            passphrase_rounds: DEFAULT_PASSPHRASE_ROUNDS,
            admin_token: None,
        }
    }
}

impl ControllerConfig {
    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.minor_nr_min > self.minor_nr_max || self.minor_nr_max > MINOR_NR_MAX {
            return Err(Error::Configuration(format!(
                "invalid minor number range {} - {}",
                self.minor_nr_min, self.minor_nr_max
            )));
        }
        if self.minor_nr_auto_base < self.minor_nr_min || self.minor_nr_auto_base > self.minor_nr_max {
            return Err(Error::Configuration(format!(
                "minor auto base {} outside {} - {}",
                self.minor_nr_auto_base, self.minor_nr_min, self.minor_nr_max
            )));
        }
        if self.satellite_timeout.is_zero() {
            return Err(Error::Configuration("satellite timeout must not be zero".into()));
        }
        if self.passphrase_rounds == 0 {
            return Err(Error::Configuration("passphrase rounds must not be zero".into()));
        }
        if self.admin_token.as_deref().is_some_and(str::is_empty) {
            return Err(Error::Configuration("admin token must not be empty".into()));
        }
        if self.event_capacity == 0 {
            return Err(Error::Configuration("event capacity must not be zero".into()));
        }
        Ok(())
    }
}
