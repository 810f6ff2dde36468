use thiserror::Error;

use super::assembler::AssemblyWarning;

/// Failure to turn one attachment into pages. Recovered by the assembler.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConversionError {
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("image could not be decoded: {0}")]
    ImageDecode(String),

    #[error("invalid PDF: {0}")]
    Pdf(String),
}

#[derive(Debug, Error)]
pub enum AssemblyError {
    /// None of the attachment kinds produced a single page.
    #[error("no content available: {} attachment(s) skipped", .warnings.len())]
    NoContentAvailable { warnings: Vec<AssemblyWarning> },

    #[error("assembly cancelled")]
    Cancelled,

    #[error("failed to write consolidated PDF: {0}")]
    Pdf(String),

    #[error("assembly worker failed: {0}")]
    Worker(String),
}
