use std::io;

use thiserror::Error;

use crate::types::ShuffleKey;

/// Everything that can go wrong while building or running an uploader.
#[derive(Error, Debug)]
pub enum UploaderError {
    #[error("invalid uploader configuration: {message}")]
    ConfigurationError { message: String },

    #[error("upload handler reported a transient failure for {key}: {reason}")]
    TransientUploadError { key: ShuffleKey, reason: String },

    #[error("local io error for {key} at {path}: {source}")]
    LocalIoError {
        key: ShuffleKey,
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("upload tick for {key} did not complete within the deadline")]
    DeadlineElapsed { key: ShuffleKey },
}

impl UploaderError {
    pub fn config(message: impl Into<String>) -> Self {
        UploaderError::ConfigurationError {
            message: message.into(),
        }
    }

    pub fn transient(key: ShuffleKey, reason: impl Into<String>) -> Self {
        UploaderError::TransientUploadError {
            key,
            reason: reason.into(),
        }
    }

    pub fn local_io(key: ShuffleKey, path: impl Into<String>, source: io::Error) -> Self {
        UploaderError::LocalIoError {
            key,
            path: path.into(),
            source,
        }
    }

    pub fn deadline_elapsed(key: ShuffleKey) -> Self {
        UploaderError::DeadlineElapsed { key }
    }
}

pub type UploaderResult<T> = Result<T, UploaderError>;
