//! Combinator configuration.

use serde::{Deserialize, Serialize};

/// Completed rounds buffered ahead of the consumer by default.
pub const DEFAULT_WATERMARK: usize = 16;

/// Policy for converting a source-side failure into output behavior.
///
/// Applies uniformly to every attached source and is fixed at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Forward the failure in-band as the failing source's final tuple
    /// element; the remaining sources keep running.
    #[default]
    Pass,
    /// Abort the whole combinator: abandon the partial round, finish every
    /// source, and raise the failure to the consumer.
    Emit,
}

/// Configuration for a [`Zip`](crate::Zip) combinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZipConfig {
    /// Failure handling policy.
    pub error_policy: ErrorPolicy,
    /// How many completed rounds may sit unconsumed before production
    /// suspends. Zero means every round waits for an explicit pull.
    pub capacity_watermark: usize,
}

impl Default for ZipConfig {
    fn default() -> Self {
        Self {
            error_policy: ErrorPolicy::Pass,
            capacity_watermark: DEFAULT_WATERMARK,
        }
    }
}

impl ZipConfig {
    /// Create a config with the given policy and the default watermark.
    pub fn with_policy(error_policy: ErrorPolicy) -> Self {
        Self {
            error_policy,
            ..Default::default()
        }
    }
}
