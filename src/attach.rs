//! Attachment handles: the bidirectional registration between a source and
//! the combinator.
//!
//! `attach` consumes the source stream and returns a [`SourceHandle`]; either
//! side uses the handle to tear the relationship down. Detaching is the sole
//! cancellation primitive: it takes effect immediately, discards the source's
//! undelivered items, and may retroactively complete an in-flight round.

use std::fmt;
use std::sync::Weak;

use crate::adapter::SourceId;

/// Combinator-side teardown interface, object-safe so handles need not carry
/// the item type.
pub(crate) trait DetachTarget: Send + Sync {
    /// Remove the source from the active set; idempotent.
    fn detach_source(&self, id: SourceId);
    /// Whether the source is still in the active set.
    fn source_active(&self, id: SourceId) -> bool;
}

/// Handle to one attached source.
///
/// Returned by [`Zip::attach`](crate::Zip::attach). Detaching is idempotent
/// and safe on a source that has already finished. Dropping the handle does
/// not detach; an unneeded handle can simply be discarded.
#[derive(Clone)]
pub struct SourceHandle {
    id: SourceId,
    target: Weak<dyn DetachTarget>,
}

impl SourceHandle {
    pub(crate) fn new(id: SourceId, target: Weak<dyn DetachTarget>) -> Self {
        Self { id, target }
    }

    /// Identifier of the attached source.
    pub fn id(&self) -> SourceId {
        self.id
    }

    /// Whether the source is still contributing to rounds.
    pub fn is_active(&self) -> bool {
        self.target
            .upgrade()
            .map(|target| target.source_active(self.id))
            .unwrap_or(false)
    }

    /// Remove the source immediately, discarding any undelivered items.
    ///
    /// May complete the in-flight round if the remaining sources have already
    /// delivered. A no-op once the source is finished or the combinator gone.
    pub fn detach(&self) {
        if let Some(target) = self.target.upgrade() {
            target.detach_source(self.id);
        }
    }
}

impl fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceHandle").field("id", &self.id).finish()
    }
}
