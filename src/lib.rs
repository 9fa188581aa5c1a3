//! Round-synchronizing zip over a dynamic set of async streams.
//!
//! `streamzip` aligns an arbitrary, changing number of independent sources
//! into one output stream of tuples: round N holds the N-th item from every
//! source active when the round assembled, in attachment order. The consumer
//! dictates pace — a source is only polled for its next item once its current
//! one has been folded into a consumed round — and sources may attach,
//! detach, finish, or fail at any time.
//!
//! # Architecture
//!
//! ```text
//! source ──▶ SourceAdapter ──┐
//! source ──▶ SourceAdapter ──┼──▶ RoundCoordinator ──▶ OutputGate ──▶ consumer
//! source ──▶ SourceAdapter ──┘            ▲                │
//!        ◀── proceed / terminate ─────────┴── consumed ────┘
//! ```
//!
//! Each attached stream gets a one-slot adapter whose pump task delivers an
//! item and then waits for the round coordinator's handshake. The coordinator
//! assembles rounds, the gate buffers them for the pull-driven consumer, and
//! the configured [`ErrorPolicy`] decides whether a source failure travels
//! in-band or aborts the whole combinator.
//!
//! # Example
//!
//! ```rust
//! use futures::StreamExt;
//! use streamzip::Zip;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let mut zip = Zip::new();
//! zip.attach_items(futures::stream::iter(vec![1, 2]));
//! zip.attach_items(futures::stream::iter(vec![10, 20]));
//!
//! let round = zip.next().await.unwrap().unwrap();
//! let values: Vec<_> = round.into_iter().filter_map(|e| e.into_value()).collect();
//! assert_eq!(values, vec![1, 10]);
//! # }
//! ```

pub mod adapter;
pub mod attach;
pub mod config;
pub mod error;
pub mod gate;
mod round;
pub mod zip;

// Re-export main types for convenience
pub use adapter::{SourceId, SourceItem};
pub use attach::SourceHandle;
pub use config::{ErrorPolicy, ZipConfig, DEFAULT_WATERMARK};
pub use error::{SourceError, ZipError};
pub use gate::Round;
pub use zip::Zip;
