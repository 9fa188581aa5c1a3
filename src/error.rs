//! Error types for the zip combinator.

use crate::adapter::SourceId;

/// Out-of-band failure reported by a source.
pub type SourceError = Box<dyn std::error::Error + Send + Sync>;

/// Control-plane errors for zip operations.
///
/// Distinct from failures carried in-band as tuple elements under
/// [`ErrorPolicy::Pass`](crate::ErrorPolicy::Pass) — those appear as
/// [`SourceItem::Error`](crate::SourceItem::Error) inside a round.
#[derive(Debug, thiserror::Error)]
pub enum ZipError {
    /// A source failed under [`ErrorPolicy::Emit`](crate::ErrorPolicy::Emit)
    /// and the whole combinator aborted.
    #[error("source failure: {0}")]
    SourceFailure(SourceError),

    /// Items can only enter the output through an attached source.
    #[error("direct write is not supported, attach a source instead")]
    DirectWrite,

    /// A source delivered while its previous delivery was still unresolved.
    #[error("source {0:?} delivered before proceed")]
    ProtocolViolation(SourceId),
}
