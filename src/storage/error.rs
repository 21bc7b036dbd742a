//! Storage layer error types.

use thiserror::Error;

/// Errors that can occur while operating on a slotted page.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PageError {
    #[error("key already present in page")]
    DuplicateKey,

    #[error("page is full: requires {required} bytes but only {available} available")]
    PageFull { required: usize, available: usize },

    #[error("key not found in page")]
    KeyNotFound,
}
