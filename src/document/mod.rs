pub mod assembler;
pub mod converter;
pub mod cover;
pub mod error;
pub mod merge;

pub use assembler::{
    AssembleOptions, AssemblerConfig, AssemblyWarning, CancelSignal, Canceller,
    ConsolidationReadiness, ConsolidationResult, DocumentAssembler, IncludedAttachment,
    SkipReason, canonical_filename, cancellation, consolidation_readiness,
};
pub use converter::{DocumentConverter, Media, PageLayout};
pub use error::{AssemblyError, ConversionError};
