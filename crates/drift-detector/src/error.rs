use crate::epoch::ThreadNumber;
use drift_config::ConfigError;

/// Conditions after which detection cannot continue soundly.
#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("all {max} thread numbers are in use")]
    ThreadNumbersExhausted { max: usize },
    #[error("clock of thread number {thread} overflowed")]
    ClockOverflow { thread: ThreadNumber },
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, DetectorError>;
