//! Driver error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("no driver registered for: {0}")]
    UnknownDriver(String),

    #[error("failed to open device: {0}")]
    FileOpenFailed(String),

    #[error("device busy: {0}")]
    DeviceBusy(String),

    #[error("invalid driver state: {0}")]
    Internal(String),
}

pub type DriverResult<T> = Result<T, DriverError>;
