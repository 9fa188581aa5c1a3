//! Round assembly: the ordered active set and the per-round state machine.
//!
//! A round accumulates one item per live source and becomes ready the instant
//! the filled count matches the active-set size. Readiness is re-checked on
//! every delivery and on every membership shrink, because a shrink can make
//! an already-partial round satisfy the new, smaller threshold. All round
//! state is mutated here and nowhere else; adapters and the output gate only
//! call in through the coordinator's API.

use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::adapter::{Handshake, SourceAdapter, SourceId, SourceItem};
use crate::error::{SourceError, ZipError};

/// Result of a readiness evaluation.
pub(crate) enum Evaluation<T> {
    /// The round is still missing contributions.
    Accumulating,
    /// One item per active source, in attachment order.
    Ready(Vec<SourceItem<T>>),
    /// The active set is empty and nothing is pending; terminal.
    Drained,
}

pub(crate) struct RoundCoordinator<T> {
    /// Live adapters in attachment order. Slot positions compact when an
    /// adapter leaves; the survivors keep their relative order.
    adapters: Vec<SourceAdapter<T>>,
    /// Ids handed out so far. A delivery carrying an id outside this range
    /// never came from an attached source.
    next_id: u64,
}

impl<T> RoundCoordinator<T> {
    pub(crate) fn new() -> Self {
        Self {
            adapters: Vec::new(),
            next_id: 0,
        }
    }

    pub(crate) fn active_count(&self) -> usize {
        self.adapters.len()
    }

    pub(crate) fn is_active(&self, id: SourceId) -> bool {
        self.adapters.iter().any(|a| a.id == id)
    }

    /// Allocate an id without joining the active set.
    pub(crate) fn allocate(&mut self) -> SourceId {
        let id = SourceId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Append a new adapter to the end of the active set.
    pub(crate) fn attach(&mut self) -> SourceId {
        let id = self.allocate();
        self.adapters.push(SourceAdapter::new(id));
        debug!(source = id.0, active = self.adapters.len(), "source attached");
        id
    }

    pub(crate) fn set_pump(&mut self, id: SourceId, pump: AbortHandle) {
        if let Some(adapter) = self.find(id) {
            adapter.pump = Some(pump);
        }
    }

    fn find(&mut self, id: SourceId) -> Option<&mut SourceAdapter<T>> {
        self.adapters.iter_mut().find(|a| a.id == id)
    }

    fn remove(&mut self, id: SourceId) {
        self.adapters.retain(|a| a.id != id);
        debug!(
            source = id.0,
            active = self.adapters.len(),
            "source left the active set"
        );
    }

    /// Accept a delivery into the source's round slot.
    ///
    /// At most one delivery may be outstanding per adapter; the returned
    /// receiver resolves once the item has been folded into a consumed round.
    /// `Ok(None)` acknowledges a delivery from a finished or detached source
    /// as a no-op.
    pub(crate) fn deliver(
        &mut self,
        id: SourceId,
        item: SourceItem<T>,
    ) -> Result<Option<oneshot::Receiver<Handshake>>, ZipError> {
        if id.0 >= self.next_id {
            return Err(ZipError::DirectWrite);
        }
        let Some(adapter) = self.find(id) else {
            return Ok(None);
        };
        if adapter.finished || adapter.errored {
            return Ok(None);
        }
        if adapter.pending.is_some() {
            warn!(source = id.0, "delivery before proceed, rejecting");
            return Err(ZipError::ProtocolViolation(id));
        }
        let (tx, rx) = oneshot::channel();
        adapter.pending = Some(item);
        adapter.ack = Some(tx);
        Ok(Some(rx))
    }

    /// Mark a source as ended. It leaves the set immediately if idle,
    /// otherwise once its pending item has been consumed into a round.
    pub(crate) fn finish(&mut self, id: SourceId) {
        let Some(adapter) = self.find(id) else { return };
        adapter.finished = true;
        adapter.pump = None;
        if adapter.pending.is_none() {
            self.remove(id);
        }
    }

    /// Detach immediately: terminate the handshake, abort the pump, discard
    /// any pending item, and drop the adapter from the set.
    pub(crate) fn detach(&mut self, id: SourceId) -> bool {
        let Some(adapter) = self.find(id) else {
            return false;
        };
        adapter.signal(Handshake::Terminate);
        adapter.abort_pump();
        if adapter.pending.is_some() {
            debug!(source = id.0, "discarding undelivered item on detach");
        }
        self.remove(id);
        true
    }

    /// Record an out-of-band failure as the source's final in-band element.
    pub(crate) fn fail_in_band(&mut self, id: SourceId, err: SourceError) {
        let Some(adapter) = self.find(id) else { return };
        adapter.errored = true;
        adapter.finished = true;
        adapter.pump = None;
        if adapter.pending.is_none() {
            adapter.pending = Some(SourceItem::Error(err));
        } else {
            // Unreachable through the pump; never overwrite an occupied slot.
            warn!(source = id.0, "failure while a delivery was pending, dropping");
        }
    }

    /// Check readiness against the current active-set size.
    pub(crate) fn evaluate(&mut self) -> Evaluation<T> {
        if self.adapters.is_empty() {
            return Evaluation::Drained;
        }
        let filled = self.adapters.iter().filter(|a| a.pending.is_some()).count();
        if filled < self.adapters.len() {
            return Evaluation::Accumulating;
        }
        let mut round = Vec::with_capacity(self.adapters.len());
        for adapter in &mut self.adapters {
            if let Some(item) = adapter.pending.take() {
                round.push(item);
            }
        }
        // Finished adapters have now made their last contribution.
        let before = self.adapters.len();
        self.adapters.retain(|a| !a.finished);
        if self.adapters.len() != before {
            debug!(active = self.adapters.len(), "finished sources left after round");
        }
        Evaluation::Ready(round)
    }

    /// Unblock every still-active source for the next round.
    pub(crate) fn proceed_all(&mut self) {
        for adapter in &mut self.adapters {
            adapter.signal(Handshake::Proceed);
        }
    }

    /// Terminate every source and clear the active set.
    pub(crate) fn abort_all(&mut self) {
        for adapter in &mut self.adapters {
            adapter.signal(Handshake::Terminate);
            adapter.abort_pump();
        }
        self.adapters.clear();
    }
}
