//! The `Zip` combinator: attach any number of streams, read aligned tuples.
//!
//! All state transitions (delivery, readiness evaluation, emission, attach,
//! detach) run under one mutex, so no two source events ever interleave
//! mid-transition. Suspension is cooperative: a source blocks on its
//! handshake, the consumer blocks on the gate's waker, and nothing holds the
//! lock across an await point.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::adapter::{self, DeliverOutcome, SourceId, SourceItem};
use crate::attach::{DetachTarget, SourceHandle};
use crate::config::{ErrorPolicy, ZipConfig};
use crate::error::{SourceError, ZipError};
use crate::gate::{OutputGate, Round};
use crate::round::{Evaluation, RoundCoordinator};

/// Shared combinator state, reachable from the consumer and every pump task.
pub(crate) struct Shared<T> {
    core: Mutex<Core<T>>,
}

struct Core<T> {
    coordinator: RoundCoordinator<T>,
    gate: OutputGate<T>,
    policy: ErrorPolicy,
    /// A round was handed over while the gate was saturated; its `proceed`
    /// is withheld until the consumer drains below the watermark.
    proceed_withheld: bool,
    /// At least one source was ever attached.
    ever_attached: bool,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Core<T>> {
        // A panicking pump must not wedge the consumer; recover the guard.
        self.core
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn deliver(&self, id: SourceId, item: T) -> DeliverOutcome {
        let mut core = self.lock();
        match core.coordinator.deliver(id, SourceItem::Value(item)) {
            Ok(Some(rx)) => {
                settle(&mut core);
                DeliverOutcome::Accepted(rx)
            }
            Ok(None) => DeliverOutcome::Stopped,
            Err(err) => {
                warn!(error = %err, "rejected delivery");
                DeliverOutcome::Stopped
            }
        }
    }

    pub(crate) fn finish(&self, id: SourceId) {
        let mut core = self.lock();
        core.coordinator.finish(id);
        settle(&mut core);
    }

    /// Dispatch an out-of-band source failure per the configured policy.
    pub(crate) fn fail(&self, id: SourceId, err: SourceError) {
        let mut core = self.lock();
        if core.gate.is_closed() {
            return;
        }
        match core.policy {
            ErrorPolicy::Pass => {
                debug!(source = id.0, error = %err, "forwarding source failure in-band");
                core.coordinator.fail_in_band(id, err);
                settle(&mut core);
            }
            ErrorPolicy::Emit => {
                warn!(source = id.0, error = %err, "source failure, aborting");
                core.coordinator.abort_all();
                core.gate.fail(ZipError::SourceFailure(err));
            }
        }
    }

    fn shutdown(&self) {
        let mut core = self.lock();
        core.coordinator.abort_all();
        core.gate.close();
    }
}

impl<T: Send + 'static> DetachTarget for Shared<T> {
    fn detach_source(&self, id: SourceId) {
        let mut core = self.lock();
        if core.coordinator.detach(id) {
            settle(&mut core);
        }
    }

    fn source_active(&self, id: SourceId) -> bool {
        self.lock().coordinator.is_active(id)
    }
}

/// Re-evaluate readiness until the round settles. Runs after every delivery,
/// finish, detach, and in-band failure; a membership shrink can complete a
/// partial round, and the last shrink drains the whole output.
fn settle<T>(core: &mut Core<T>) {
    loop {
        match core.coordinator.evaluate() {
            Evaluation::Accumulating => break,
            Evaluation::Ready(round) => {
                debug!(len = round.len(), "round complete");
                if core.gate.offer(round) {
                    core.coordinator.proceed_all();
                } else {
                    core.proceed_withheld = true;
                }
            }
            Evaluation::Drained => {
                core.gate.close();
                break;
            }
        }
    }
}

/// Synchronizes a dynamic, changing set of async streams into one stream of
/// aligned tuples.
///
/// Round N holds the N-th item from every source active when the round
/// assembled, in attachment order. A source is polled for its next item only
/// after its current one has been folded into a consumed round, so no source
/// can run ahead of the tuple alignment. Sources attach and detach at any
/// time; the output ends once the active set empties for good.
///
/// Attach sources before the first poll: a combinator that never had a
/// source degenerates to an immediately-ended output.
pub struct Zip<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Zip<T> {
    /// Create a combinator with the default configuration.
    pub fn new() -> Self {
        Self::with_config(ZipConfig::default())
    }

    /// Create a combinator with explicit configuration.
    pub fn with_config(config: ZipConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                core: Mutex::new(Core {
                    coordinator: RoundCoordinator::new(),
                    gate: OutputGate::new(config.capacity_watermark),
                    policy: config.error_policy,
                    proceed_withheld: false,
                    ever_attached: false,
                }),
            }),
        }
    }

    /// Attach a source stream. Must be called within a tokio runtime.
    ///
    /// `Ok` items become the source's round contributions; the first `Err`
    /// is its out-of-band failure, handled per the configured
    /// [`ErrorPolicy`]; stream end finishes the source naturally. Attaching
    /// after the output has already ended returns an inert handle.
    pub fn attach<S>(&self, source: S) -> SourceHandle
    where
        S: Stream<Item = Result<T, SourceError>> + Send + 'static,
    {
        let weak = Arc::downgrade(&self.shared);
        let target: Weak<dyn DetachTarget> = weak;
        let mut core = self.shared.lock();
        if core.gate.is_closed() {
            debug!("attach after end of output, ignoring");
            return SourceHandle::new(core.coordinator.allocate(), target);
        }
        // A growing active set can never complete the in-progress round, so
        // no readiness evaluation is needed here; the new source only raises
        // the threshold for this and subsequent rounds.
        let id = core.coordinator.attach();
        core.ever_attached = true;
        let task = tokio::spawn(adapter::pump(Arc::clone(&self.shared), id, source));
        core.coordinator.set_pump(id, task.abort_handle());
        SourceHandle::new(id, target)
    }

    /// Attach a source that cannot fail.
    pub fn attach_items<S>(&self, source: S) -> SourceHandle
    where
        S: Stream<Item = T> + Send + 'static,
    {
        self.attach(source.map(Ok))
    }

    /// Detach a source through the combinator; equivalent to
    /// [`SourceHandle::detach`] and just as idempotent.
    pub fn detach(&self, handle: &SourceHandle) {
        handle.detach();
    }

    /// Number of sources currently in the active set.
    pub fn active_sources(&self) -> usize {
        self.shared.lock().coordinator.active_count()
    }
}

impl<T: Send + 'static> Default for Zip<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Stream for Zip<T> {
    type Item = Result<Round<T>, ZipError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut core = self.shared.lock();
        if !core.ever_attached {
            // Zero sources from the very start: an immediately-ended output.
            core.gate.close();
        }
        let polled = core.gate.poll_take(cx);
        if let Poll::Ready(Some(_)) = &polled {
            // Consumption, not production, re-arms the sources.
            if core.proceed_withheld && core.gate.below_resume() {
                core.proceed_withheld = false;
                core.coordinator.proceed_all();
            }
        }
        polled
    }
}

impl<T> Drop for Zip<T> {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    fn values(round: Round<&'static str>) -> Vec<&'static str> {
        round.into_iter().filter_map(SourceItem::into_value).collect()
    }

    async fn next_values(zip: &mut Zip<&'static str>) -> Vec<&'static str> {
        values(zip.next().await.expect("output ended").expect("output failed"))
    }

    fn channel_source(zip: &Zip<&'static str>) -> (mpsc::Sender<&'static str>, SourceHandle) {
        let (tx, rx) = mpsc::channel(8);
        let handle = zip.attach_items(ReceiverStream::new(rx));
        (tx, handle)
    }

    #[tokio::test]
    async fn test_normal_flow() {
        let mut zip = Zip::new();
        zip.attach_items(stream::iter(vec!["1.1", "1.2", "1.3", "1.4"]));
        zip.attach_items(stream::iter(vec!["2.1", "2.2", "2.3", "2.4"]));
        zip.attach_items(stream::iter(vec!["3.1", "3.2", "3.3", "3.4"]));

        assert_eq!(next_values(&mut zip).await, vec!["1.1", "2.1", "3.1"]);
        assert_eq!(next_values(&mut zip).await, vec!["1.2", "2.2", "3.2"]);
        assert_eq!(next_values(&mut zip).await, vec!["1.3", "2.3", "3.3"]);
        assert_eq!(next_values(&mut zip).await, vec!["1.4", "2.4", "3.4"]);
        assert!(zip.next().await.is_none());
    }

    #[tokio::test]
    async fn test_short_source_truncation() {
        let mut zip = Zip::new();
        zip.attach_items(stream::iter(vec!["1.1", "1.2", "1.3", "1.4"]));
        zip.attach_items(stream::iter(vec!["2.1", "2.2"]));
        zip.attach_items(stream::iter(vec!["3.1", "3.2", "3.3", "3.4"]));

        assert_eq!(next_values(&mut zip).await, vec!["1.1", "2.1", "3.1"]);
        assert_eq!(next_values(&mut zip).await, vec!["1.2", "2.2", "3.2"]);
        // The short source is gone; the survivors keep their relative order.
        assert_eq!(next_values(&mut zip).await, vec!["1.3", "3.3"]);
        assert_eq!(next_values(&mut zip).await, vec!["1.4", "3.4"]);
        assert!(zip.next().await.is_none());
    }

    #[tokio::test]
    async fn test_mid_stream_detach_completes_round() {
        let mut zip = Zip::new();
        let (tx_a, handle_a) = channel_source(&zip);
        let (tx_b, _handle_b) = channel_source(&zip);
        let (tx_c, _handle_c) = channel_source(&zip);

        for (a, b, c) in [("a1", "b1", "c1"), ("a2", "b2", "c2")] {
            tx_a.send(a).await.unwrap();
            tx_b.send(b).await.unwrap();
            tx_c.send(c).await.unwrap();
        }
        assert_eq!(next_values(&mut zip).await, vec!["a1", "b1", "c1"]);
        assert_eq!(next_values(&mut zip).await, vec!["a2", "b2", "c2"]);

        // b and c already buffered their third item; a has not delivered.
        tx_b.send("b3").await.unwrap();
        tx_c.send("c3").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(zip.active_sources(), 3);

        // Detaching a completes round 3 from b and c alone.
        handle_a.detach();
        assert_eq!(next_values(&mut zip).await, vec!["b3", "c3"]);
        assert_eq!(zip.active_sources(), 2);

        drop(tx_a);
        drop(tx_b);
        drop(tx_c);
        assert!(zip.next().await.is_none());
    }

    #[tokio::test]
    async fn test_late_attach_joins_next_round() {
        let mut zip = Zip::with_config(ZipConfig {
            error_policy: ErrorPolicy::Pass,
            capacity_watermark: 0,
        });
        let (tx_a, _handle_a) = channel_source(&zip);
        let (tx_b, _handle_b) = channel_source(&zip);

        tx_a.send("a1").await.unwrap();
        tx_b.send("b1").await.unwrap();
        assert_eq!(next_values(&mut zip).await, vec!["a1", "b1"]);

        let (tx_c, _handle_c) = channel_source(&zip);
        assert_eq!(zip.active_sources(), 3);

        tx_a.send("a2").await.unwrap();
        tx_b.send("b2").await.unwrap();
        tx_c.send("c1").await.unwrap();
        assert_eq!(next_values(&mut zip).await, vec!["a2", "b2", "c1"]);

        drop(tx_a);
        drop(tx_b);
        drop(tx_c);
        assert!(zip.next().await.is_none());
    }

    #[tokio::test]
    async fn test_error_pass_through() {
        let mut zip = Zip::new();
        zip.attach_items(stream::iter(vec!["1.1", "1.2", "1.3", "1.4"]));
        zip.attach(stream::iter(vec![Ok("2.1"), Err(SourceError::from("boom"))]));
        zip.attach_items(stream::iter(vec!["3.1", "3.2", "3.3", "3.4"]));

        assert_eq!(next_values(&mut zip).await, vec!["1.1", "2.1", "3.1"]);

        let round = zip.next().await.unwrap().unwrap();
        assert_eq!(round[0].value(), Some(&"1.2"));
        assert!(round[1].is_error());
        match &round[1] {
            SourceItem::Error(err) => assert_eq!(err.to_string(), "boom"),
            SourceItem::Value(_) => panic!("expected the failure in-band"),
        }
        assert_eq!(round[2].value(), Some(&"3.2"));

        // The failed source contributes nothing further.
        assert_eq!(next_values(&mut zip).await, vec!["1.3", "3.3"]);
        assert_eq!(next_values(&mut zip).await, vec!["1.4", "3.4"]);
        assert!(zip.next().await.is_none());
    }

    #[tokio::test]
    async fn test_error_emit_aborts() {
        let mut zip = Zip::with_config(ZipConfig::with_policy(ErrorPolicy::Emit));
        zip.attach_items(stream::iter(vec!["1.1", "1.2", "1.3"]));
        zip.attach(stream::iter(vec![Ok("2.1"), Err(SourceError::from("boom"))]));

        assert_eq!(next_values(&mut zip).await, vec!["1.1", "2.1"]);

        let err = zip.next().await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "source failure: boom");

        // No round 2, no stragglers.
        assert!(zip.next().await.is_none());
        assert_eq!(zip.active_sources(), 0);
    }

    #[tokio::test]
    async fn test_backpressure_gates_on_consumption() {
        let polled_a = Arc::new(AtomicUsize::new(0));
        let polled_b = Arc::new(AtomicUsize::new(0));
        let counting = |polled: Arc<AtomicUsize>| {
            stream::iter(["x1", "x2", "x3"]).map(move |item| {
                polled.fetch_add(1, Ordering::SeqCst);
                item
            })
        };

        let mut zip = Zip::with_config(ZipConfig {
            error_policy: ErrorPolicy::Pass,
            capacity_watermark: 0,
        });
        zip.attach_items(counting(polled_a.clone()));
        zip.attach_items(counting(polled_b.clone()));

        // Round 1 is buffered; neither source advances past its first item.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(polled_a.load(Ordering::SeqCst), 1);
        assert_eq!(polled_b.load(Ordering::SeqCst), 1);

        assert_eq!(next_values(&mut zip).await, vec!["x1", "x1"]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(polled_a.load(Ordering::SeqCst), 2);

        assert_eq!(next_values(&mut zip).await, vec!["x2", "x2"]);
        assert_eq!(next_values(&mut zip).await, vec!["x3", "x3"]);
        assert!(zip.next().await.is_none());
    }

    #[tokio::test]
    async fn test_pull_before_delivery_is_synchronous() {
        let mut zip = Zip::new();
        let (tx, _handle) = channel_source(&zip);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send("a1").await.unwrap();
            // tx drops here, ending the source.
        });

        assert_eq!(next_values(&mut zip).await, vec!["a1"]);
        assert!(zip.next().await.is_none());
    }

    #[tokio::test]
    async fn test_detach_is_idempotent() {
        let mut zip = Zip::new();
        let (tx_a, _handle_a) = channel_source(&zip);
        let (_tx_b, handle_b) = channel_source(&zip);

        handle_b.detach();
        assert!(!handle_b.is_active());
        handle_b.detach();
        zip.detach(&handle_b);
        assert_eq!(zip.active_sources(), 1);

        tx_a.send("a1").await.unwrap();
        assert_eq!(next_values(&mut zip).await, vec!["a1"]);

        drop(tx_a);
        assert!(zip.next().await.is_none());
    }

    #[tokio::test]
    async fn test_empty_combinator_ends_immediately() {
        let mut zip = Zip::<&str>::new();
        assert!(zip.next().await.is_none());
        assert!(zip.next().await.is_none());

        // Attach after the end is ignored.
        let handle = zip.attach_items(stream::iter(vec!["late"]));
        assert!(!handle.is_active());
        assert!(zip.next().await.is_none());
    }

    #[tokio::test]
    async fn test_state_lock_recovers_after_panic() {
        let mut zip = Zip::<&str>::new();

        let shared = Arc::clone(&zip.shared);
        std::thread::spawn(move || {
            let _guard = shared.core.lock().unwrap();
            panic!("poisoning the state lock");
        })
        .join()
        .unwrap_err();

        // The combinator stays usable after a holder panicked.
        assert_eq!(zip.active_sources(), 0);
        assert!(zip.next().await.is_none());
    }

    #[tokio::test]
    async fn test_zero_item_source_leaves_quietly() {
        let mut zip = Zip::new();
        zip.attach_items(stream::iter(Vec::<&str>::new()));
        zip.attach_items(stream::iter(vec!["b1", "b2"]));

        assert_eq!(next_values(&mut zip).await, vec!["b1"]);
        assert_eq!(next_values(&mut zip).await, vec!["b2"]);
        assert!(zip.next().await.is_none());
    }

    #[tokio::test]
    async fn test_outstanding_pull_wakes_on_round_completion() {
        let mut zip = Zip::new();
        let (tx, _handle) = channel_source(&zip);

        let mut pull = tokio_test::task::spawn(zip.next());
        tokio_test::assert_pending!(pull.poll());

        tx.send("a1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Completing the round wakes the registered pull.
        assert!(pull.is_woken());
        let round = tokio_test::assert_ready!(pull.poll());
        assert_eq!(values(round.unwrap().unwrap()), vec!["a1"]);

        drop(pull);
        drop(tx);
        assert!(zip.next().await.is_none());
    }

    #[tokio::test]
    async fn test_rounds_buffer_ahead_of_pulls() {
        let mut zip = Zip::new();
        zip.attach_items(stream::iter(vec!["1.1", "1.2", "1.3"]));
        zip.attach_items(stream::iter(vec!["2.1", "2.2", "2.3"]));

        // Give production time to run ahead under the default watermark.
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Pulls still yield every round exactly once, in order.
        assert_eq!(next_values(&mut zip).await, vec!["1.1", "2.1"]);
        assert_eq!(next_values(&mut zip).await, vec!["1.2", "2.2"]);
        assert_eq!(next_values(&mut zip).await, vec!["1.3", "2.3"]);
        assert!(zip.next().await.is_none());
    }
}
