//! Output gate: bridges push-driven round completion to the pull-driven
//! consumer.
//!
//! Completed rounds queue here until the consumer pulls them. `offer` reports
//! whether production may continue autonomously; once the queue reaches the
//! capacity watermark, the coordinator withholds the next `proceed` until
//! consumption drains the queue back below the resume threshold. Upstream
//! advance is therefore gated on consumption, never on production.

use std::collections::VecDeque;
use std::task::{Context, Poll, Waker};

use tracing::debug;

use crate::adapter::SourceItem;
use crate::error::ZipError;

/// A completed output tuple: one element per source active at assembly time,
/// in attachment order.
pub type Round<T> = Vec<SourceItem<T>>;

pub(crate) struct OutputGate<T> {
    /// Completed rounds (and, last of all, a terminal failure) awaiting pulls.
    queue: VecDeque<Result<Round<T>, ZipError>>,
    /// Queue depth at which production suspends.
    watermark: usize,
    /// Consumer waker, present while a pull is outstanding.
    pull: Option<Waker>,
    /// No further rounds will be produced.
    closed: bool,
}

impl<T> OutputGate<T> {
    pub(crate) fn new(watermark: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            watermark,
            pull: None,
            closed: false,
        }
    }

    /// Hand over a completed round. Returns whether production may continue
    /// without waiting for a pull.
    pub(crate) fn offer(&mut self, round: Round<T>) -> bool {
        self.queue.push_back(Ok(round));
        self.wake();
        self.queue.len() < self.watermark
    }

    /// Queue a terminal failure; the output ends once it is consumed.
    pub(crate) fn fail(&mut self, err: ZipError) {
        self.queue.push_back(Err(err));
        self.closed = true;
        self.wake();
    }

    /// End the output once the queue drains.
    pub(crate) fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            debug!("output closed");
            self.wake();
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether consumption has drained below the resume threshold.
    pub(crate) fn below_resume(&self) -> bool {
        self.queue.len() < self.watermark.max(1)
    }

    /// Consumer pull. Registers the waker when nothing is pending so the next
    /// completed round is delivered synchronously rather than buffered.
    pub(crate) fn poll_take(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Round<T>, ZipError>>> {
        if let Some(next) = self.queue.pop_front() {
            return Poll::Ready(Some(next));
        }
        if self.closed {
            return Poll::Ready(None);
        }
        self.pull = Some(cx.waker().clone());
        Poll::Pending
    }

    fn wake(&mut self) {
        if let Some(waker) = self.pull.take() {
            waker.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker;

    fn round(value: &'static str) -> Round<&'static str> {
        vec![SourceItem::Value(value)]
    }

    fn take(gate: &mut OutputGate<&'static str>) -> Poll<Option<Result<Round<&'static str>, ZipError>>> {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        gate.poll_take(&mut cx)
    }

    #[test]
    fn test_offer_reports_watermark() {
        let mut gate = OutputGate::new(2);
        assert!(gate.offer(round("r1")));
        assert!(!gate.offer(round("r2")));

        assert!(matches!(take(&mut gate), Poll::Ready(Some(Ok(_)))));
        assert!(gate.below_resume());
    }

    #[test]
    fn test_watermark_zero_never_continues() {
        let mut gate = OutputGate::new(0);
        assert!(!gate.offer(round("r1")));
        assert!(!gate.below_resume());

        assert!(matches!(take(&mut gate), Poll::Ready(Some(Ok(_)))));
        assert!(gate.below_resume());
    }

    #[test]
    fn test_pull_order_survives_failure() {
        let mut gate = OutputGate::new(4);
        gate.offer(round("r1"));
        gate.fail(ZipError::SourceFailure("boom".into()));
        assert!(gate.is_closed());

        assert!(matches!(take(&mut gate), Poll::Ready(Some(Ok(_)))));
        assert!(matches!(
            take(&mut gate),
            Poll::Ready(Some(Err(ZipError::SourceFailure(_))))
        ));
        assert!(matches!(take(&mut gate), Poll::Ready(None)));
    }

    #[test]
    fn test_empty_pull_is_pending_until_close() {
        let mut gate = OutputGate::<&str>::new(1);
        assert!(matches!(take(&mut gate), Poll::Pending));
        gate.close();
        assert!(matches!(take(&mut gate), Poll::Ready(None)));
    }
}
