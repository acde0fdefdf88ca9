// LOADSWEEP ERROR TAXONOMY
// EVERYTHING EXCEPT TRANSMISSION IS FATAL: HARDWARE STATE AFTER A FAILED
// COMMAND IS NOT TRUSTED, SO NOTHING HERE IS RETRIED.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, HarnessError>;

#[derive(Debug, Error)]
pub enum HarnessError {
    // MISSING OR INCONSISTENT SETTINGS. FATAL AT STARTUP.
    #[error("configuration error: {0}")]
    Configuration(String),

    // A HARDWARE-CONFIGURATION COMMAND EXITED NON-ZERO
    #[error("device command `{cmd}` failed with status {status}")]
    DeviceCommand { cmd: String, status: i32 },

    // DUT EXITED BEFORE PRINTING ITS READINESS SENTINEL
    #[error("DUT terminated before becoming ready: {0}")]
    StartupFailure(String),

    // GENERATOR EXITED NON-ZERO: NOT EVERY PACKET CAME BACK IN TIME
    #[error("transmission error: {0}")]
    Transmission(String),

    // MORE PACKETS CAME BACK THAN WERE SENT. THE APPARATUS IS BROKEN.
    #[error("received more packets than sent ({received} > {sent}), measurement is unreliable")]
    MeasurementIntegrity { sent: u64, received: u64 },

    // GENERATOR RAN BUT ITS COUNTS ARE MISSING OR UNREADABLE. NEVER LOSS.
    #[error("generator stats unusable: {0}")]
    GeneratorStats(String),

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("DUT already running")]
    AlreadyRunning,

    #[error("DUT not running")]
    NotRunning,

    #[error("interrupted by operator")]
    Interrupted,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Regex(#[from] regex::Error),
}

impl HarnessError {
    pub fn is_transmission(&self) -> bool {
        matches!(self, Self::Transmission(_))
    }
}
