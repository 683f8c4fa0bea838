use thiserror::Error;

/// Failures inside a single scan attempt.
///
/// None of these end the worker loop; they are logged at the iteration
/// boundary and the next attempt starts after the poll interval.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("no card reader available")]
    ReaderUnavailable,

    #[error("pc/sc error: {0}")]
    Reader(#[from] pcsc::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("clipboard error: {0}")]
    Clipboard(String),

    #[error("paste automation failed: {0}")]
    Paste(String),

    #[error("scan iteration panicked: {0}")]
    Panicked(String),
}

impl ScanError {
    /// True when the error only means there was nothing to read yet.
    pub fn is_idle(&self) -> bool {
        matches!(
            self,
            ScanError::ReaderUnavailable
                | ScanError::Reader(pcsc::Error::NoSmartcard)
                | ScanError::Reader(pcsc::Error::RemovedCard)
                | ScanError::Reader(pcsc::Error::NoReadersAvailable)
        )
    }
}
