//! Capture file error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unrecognized capture format: {0}")]
    UnsupportedFormat(String),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("encoder failed: {0}")]
    EncoderError(String),
}

pub type FileResult<T> = Result<T, FileError>;
