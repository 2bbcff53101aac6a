use std::io;

use thiserror::Error;

/// Recoverable failures. Detected heap faults are not errors; they go
/// through [`crate::alloc::fatal::Fault`] and the configured fatal action.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    #[error("out of memory: the backing allocator could not provide {size} bytes")]
    OutOfMemory { size: usize },

    #[error("a {size} byte request overflows the block layout")]
    LayoutOverflow { size: usize },

    #[error("tracker is already configured (configuration is frozen at first use)")]
    AlreadyConfigured,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("project tag override stack is full")]
    TagStackFull,

    #[error("a process-wide tracker is already installed")]
    AlreadyInstalled,

    #[error("no process-wide tracker has been installed")]
    NotInstalled,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
