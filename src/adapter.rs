//! Per-source adapter: the one-slot handshake between an upstream producer
//! and the round coordinator.
//!
//! Each attached stream is driven by a pump task that delivers one item at a
//! time and waits for the coordinator's handshake before polling the stream
//! again. Backpressure is therefore "don't poll": an upstream can never run
//! ahead of its slot in the round currently being assembled.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::error::SourceError;
use crate::zip::Shared;

/// Identifier for an attached source, unique within one combinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(pub(crate) u64);

/// Resolution of an in-flight delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Handshake {
    /// The item was folded into a completed round; the source may advance.
    Proceed,
    /// The combinator is done with this source.
    Terminate,
}

/// One element of an output tuple.
#[derive(Debug)]
pub enum SourceItem<T> {
    /// A value delivered by a source.
    Value(T),
    /// A source failure forwarded in-band under
    /// [`ErrorPolicy::Pass`](crate::ErrorPolicy::Pass).
    Error(SourceError),
}

impl<T> SourceItem<T> {
    /// The delivered value, unless this element is a forwarded failure.
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Value(value) => Some(value),
            Self::Error(_) => None,
        }
    }

    /// Consume the element, returning the delivered value if there is one.
    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Value(value) => Some(value),
            Self::Error(_) => None,
        }
    }

    /// Whether this element carries a forwarded source failure.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// Outcome of handing an item to the coordinator.
pub(crate) enum DeliverOutcome {
    /// Accepted; resolve the handshake before delivering again.
    Accepted(oneshot::Receiver<Handshake>),
    /// The adapter is finished or gone; stop delivering.
    Stopped,
}

/// Per-source state, owned exclusively by the round coordinator.
pub(crate) struct SourceAdapter<T> {
    pub(crate) id: SourceId,
    /// At most one unconsumed item; this bound is the per-source backpressure.
    pub(crate) pending: Option<SourceItem<T>>,
    /// Handshake resolver for the blocked upstream, if a delivery is in flight.
    pub(crate) ack: Option<oneshot::Sender<Handshake>>,
    /// The upstream will deliver no more items.
    pub(crate) finished: bool,
    /// The upstream reported an out-of-band failure.
    pub(crate) errored: bool,
    /// Pump task handle, aborted on detach and shutdown.
    pub(crate) pump: Option<AbortHandle>,
}

impl<T> SourceAdapter<T> {
    pub(crate) fn new(id: SourceId) -> Self {
        Self {
            id,
            pending: None,
            ack: None,
            finished: false,
            errored: false,
            pump: None,
        }
    }

    /// Resolve the in-flight handshake, if any.
    pub(crate) fn signal(&mut self, handshake: Handshake) {
        if let Some(ack) = self.ack.take() {
            let _ = ack.send(handshake);
        }
    }

    /// Stop the pump task.
    pub(crate) fn abort_pump(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Drive one attached stream: deliver, await the handshake, repeat.
///
/// The first `Err` item is the source's out-of-band failure channel; stream
/// end finishes the source.
pub(crate) async fn pump<T, S>(shared: Arc<Shared<T>>, id: SourceId, source: S)
where
    T: Send + 'static,
    S: Stream<Item = Result<T, SourceError>> + Send + 'static,
{
    tokio::pin!(source);
    loop {
        match source.next().await {
            Some(Ok(item)) => {
                let handshake = match shared.deliver(id, item) {
                    DeliverOutcome::Accepted(rx) => rx.await,
                    DeliverOutcome::Stopped => break,
                };
                match handshake {
                    Ok(Handshake::Proceed) => {}
                    Ok(Handshake::Terminate) | Err(_) => break,
                }
            }
            Some(Err(err)) => {
                debug!(source = id.0, "upstream failure");
                shared.fail(id, err);
                break;
            }
            None => break,
        }
    }
    shared.finish(id);
}
