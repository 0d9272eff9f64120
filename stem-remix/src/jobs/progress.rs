//! Per-job progress feeds with replay and fan-out.
//!
//! Every job owns one feed. Publishing appends to a bounded history and
//! broadcasts to live subscribers; both happen under the feed lock, as does
//! taking a subscriber's replay snapshot, so a subscriber never misses or
//! duplicates an event at the replay/live boundary. A feed closes after its
//! terminal event (`SEPARATED` or `FAILED`), which ends every stream.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::ProgressEvent;
use crate::{Error, Result};

/// Default number of events kept for replay per job.
pub const DEFAULT_HISTORY_CAPACITY: usize = 256;

/// Default broadcast buffer per job.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

type Sequenced = (u64, ProgressEvent);

struct FeedState {
    history: VecDeque<Sequenced>,
    next_seq: u64,
    last: Option<ProgressEvent>,
    /// Dropped on close so receivers observe the end of the feed.
    tx: Option<broadcast::Sender<Sequenced>>,
}

impl FeedState {
    fn is_closed(&self) -> bool {
        self.tx.is_none()
    }

    fn accepts(&self, event: &ProgressEvent) -> bool {
        match &self.last {
            None => true,
            Some(last) => {
                let (prev, next) = (last.phase.rank(), event.phase.rank());
                next > prev || (next == prev && event.percent >= last.percent)
            }
        }
    }

    fn since(&self, seq: Option<u64>) -> VecDeque<Sequenced> {
        self.history
            .iter()
            .filter(|(s, _)| seq.is_none_or(|last| *s > last))
            .cloned()
            .collect()
    }
}

struct Feed {
    state: Mutex<FeedState>,
}

/// Registry of per-job progress feeds.
pub struct ProgressChannel {
    feeds: DashMap<String, Arc<Feed>>,
    history_capacity: usize,
    channel_capacity: usize,
}

impl Default for ProgressChannel {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY, DEFAULT_CHANNEL_CAPACITY)
    }
}

impl ProgressChannel {
    pub fn new(history_capacity: usize, channel_capacity: usize) -> Self {
        Self {
            feeds: DashMap::new(),
            history_capacity: history_capacity.max(1),
            channel_capacity: channel_capacity.max(1),
        }
    }

    /// Create the feed for a job. Opening an existing feed is a no-op.
    pub fn open(&self, job_id: &str) {
        self.feeds.entry(job_id.to_string()).or_insert_with(|| {
            let (tx, _) = broadcast::channel(self.channel_capacity);
            Arc::new(Feed {
                state: Mutex::new(FeedState {
                    history: VecDeque::with_capacity(self.history_capacity.min(32)),
                    next_seq: 0,
                    last: None,
                    tx: Some(tx),
                }),
            })
        });
    }

    fn feed(&self, job_id: &str) -> Option<Arc<Feed>> {
        self.feeds.get(job_id).map(|f| f.value().clone())
    }

    /// Append an event and notify subscribers.
    ///
    /// Returns `false` when the job has no open feed, the feed is closed, or
    /// the event would move backwards (an earlier phase, or a lower percentage
    /// within the same phase).
    pub fn publish(&self, event: ProgressEvent) -> bool {
        let Some(feed) = self.feed(&event.job_id) else {
            debug!(job_id = %event.job_id, "Progress for unknown job dropped");
            return false;
        };

        let mut state = feed.state.lock();
        if state.is_closed() {
            return false;
        }
        if !state.accepts(&event) {
            warn!(
                job_id = %event.job_id,
                phase = %event.phase,
                percent = event.percent,
                "Rejected out-of-order progress event"
            );
            return false;
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        if state.history.len() == self.history_capacity {
            state.history.pop_front();
        }
        state.history.push_back((seq, event.clone()));
        state.last = Some(event.clone());

        let terminal = event.is_terminal();
        if let Some(tx) = &state.tx {
            // No receivers is fine.
            let _ = tx.send((seq, event));
        }
        if terminal {
            state.tx = None;
        }
        true
    }

    /// Subscribe to a job's feed: replay of retained history, then live events.
    pub fn subscribe(&self, job_id: &str) -> Result<ProgressStream> {
        let feed = self
            .feed(job_id)
            .ok_or_else(|| Error::not_found("Progress feed", job_id))?;
        let (replay, rx) = {
            let state = feed.state.lock();
            (state.since(None), state.tx.as_ref().map(|tx| tx.subscribe()))
        };
        Ok(ProgressStream {
            feed,
            replay,
            rx,
            last_seq: None,
            finished: false,
        })
    }

    /// Most recent event of a job.
    pub fn latest(&self, job_id: &str) -> Option<ProgressEvent> {
        self.feed(job_id).and_then(|f| f.state.lock().last.clone())
    }

    /// Whether the job's feed has seen its terminal event.
    pub fn is_closed(&self, job_id: &str) -> bool {
        self.feed(job_id)
            .map(|f| f.state.lock().is_closed())
            .unwrap_or(true)
    }

    /// Drop a job's feed. Open streams end after draining what they already hold.
    pub fn remove(&self, job_id: &str) {
        if let Some((_, feed)) = self.feeds.remove(job_id) {
            feed.state.lock().tx = None;
        }
    }
}

/// A subscriber's view of one job's progress.
///
/// Dropping the stream unsubscribes without affecting the job.
pub struct ProgressStream {
    feed: Arc<Feed>,
    replay: VecDeque<Sequenced>,
    rx: Option<broadcast::Receiver<Sequenced>>,
    last_seq: Option<u64>,
    finished: bool,
}

impl std::fmt::Debug for ProgressStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressStream")
            .field("last_seq", &self.last_seq)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl ProgressStream {
    fn deliver(&mut self, (seq, event): Sequenced) -> Option<ProgressEvent> {
        if self.last_seq.is_some_and(|last| seq <= last) {
            return None;
        }
        self.last_seq = Some(seq);
        if event.is_terminal() {
            self.finished = true;
        }
        Some(event)
    }

    /// Next event, or `None` once the terminal event was delivered or the feed went away.
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        loop {
            if self.finished {
                return None;
            }
            if let Some(item) = self.replay.pop_front() {
                if let Some(event) = self.deliver(item) {
                    return Some(event);
                }
                continue;
            }
            let Some(rx) = self.rx.as_mut() else {
                self.finished = true;
                return None;
            };
            match rx.recv().await {
                Ok(item) => {
                    if let Some(event) = self.deliver(item) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Progress subscriber lagged, resyncing from history");
                    self.replay = self.feed.state.lock().since(self.last_seq);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    // Pick up anything published between the last recv and close.
                    self.replay = self.feed.state.lock().since(self.last_seq);
                    self.rx = None;
                }
            }
        }
    }

    /// Collect every remaining event.
    pub async fn collect(mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }

    /// Adapt into a [`futures::Stream`].
    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> + Send {
        futures::stream::unfold(self, |mut stream| async move {
            stream.next().await.map(|event| (event, stream))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ProgressPhase;
    use futures::StreamExt;

    fn ev(phase: ProgressPhase, percent: f32) -> ProgressEvent {
        ProgressEvent::new("job", phase, percent, "")
    }

    fn phases(events: &[ProgressEvent]) -> Vec<ProgressPhase> {
        let mut out: Vec<ProgressPhase> = Vec::new();
        for e in events {
            if out.last() != Some(&e.phase) {
                out.push(e.phase);
            }
        }
        out
    }

    #[test]
    fn test_publish_enforces_order() {
        let channel = ProgressChannel::default();
        channel.open("job");
        assert!(channel.publish(ev(ProgressPhase::Queued, 0.0)));
        assert!(channel.publish(ev(ProgressPhase::Separating, 10.0)));
        assert!(!channel.publish(ev(ProgressPhase::Separating, 5.0)));
        assert!(!channel.publish(ev(ProgressPhase::Loading, 100.0)));
        assert!(channel.publish(ev(ProgressPhase::Separating, 10.0)));
        assert!(channel.publish(ev(ProgressPhase::Failed, 100.0)));
        assert!(!channel.publish(ev(ProgressPhase::Separated, 100.0)));
        assert!(channel.is_closed("job"));
        assert_eq!(channel.latest("job").unwrap().phase, ProgressPhase::Failed);
    }

    #[test]
    fn test_unknown_job() {
        let channel = ProgressChannel::default();
        assert!(!channel.publish(ProgressEvent::new("nope", ProgressPhase::Queued, 0.0, "")));
        assert_eq!(channel.subscribe("nope").err().unwrap().kind(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_history_and_terminal() {
        let channel = ProgressChannel::default();
        channel.open("job");
        channel.publish(ev(ProgressPhase::Queued, 0.0));
        channel.publish(ev(ProgressPhase::Loading, 0.0));
        channel.publish(ev(ProgressPhase::Separating, 50.0));
        channel.publish(ev(ProgressPhase::Separated, 100.0));

        let events = channel.subscribe("job").unwrap().collect().await;
        assert_eq!(
            phases(&events),
            vec![
                ProgressPhase::Queued,
                ProgressPhase::Loading,
                ProgressPhase::Separating,
                ProgressPhase::Separated
            ]
        );
    }

    #[tokio::test]
    async fn test_bounded_history_keeps_terminal() {
        let channel = ProgressChannel::new(2, 4);
        channel.open("job");
        channel.publish(ev(ProgressPhase::Queued, 0.0));
        channel.publish(ev(ProgressPhase::Loading, 0.0));
        channel.publish(ev(ProgressPhase::Separating, 0.0));
        channel.publish(ev(ProgressPhase::Failed, 100.0));

        let events = channel.subscribe("job").unwrap().collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events.last().unwrap().phase, ProgressPhase::Failed);
    }

    #[tokio::test]
    async fn test_fan_out_to_live_subscribers() {
        let channel = Arc::new(ProgressChannel::default());
        channel.open("job");
        channel.publish(ev(ProgressPhase::Queued, 0.0));

        let a = channel.subscribe("job").unwrap();
        let b = channel.subscribe("job").unwrap();
        let ta = tokio::spawn(a.collect());
        let tb = tokio::spawn(b.collect());

        let publisher = channel.clone();
        tokio::spawn(async move {
            publisher.publish(ev(ProgressPhase::Loading, 0.0));
            for p in 0..=10 {
                publisher.publish(ev(ProgressPhase::Separating, p as f32 * 10.0));
                tokio::task::yield_now().await;
            }
            publisher.publish(ev(ProgressPhase::Finalizing, 0.0));
            publisher.publish(ev(ProgressPhase::Separated, 100.0));
        });

        let ea = ta.await.unwrap();
        let eb = tb.await.unwrap();
        assert_eq!(phases(&ea), phases(&eb));
        assert_eq!(ea, eb);
        assert_eq!(ea.last().unwrap().phase, ProgressPhase::Separated);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_resyncs() {
        let channel = ProgressChannel::new(512, 2);
        channel.open("job");
        let stream = channel.subscribe("job").unwrap();
        channel.publish(ev(ProgressPhase::Queued, 0.0));
        for p in 0..100 {
            channel.publish(ev(ProgressPhase::Separating, p as f32));
        }
        channel.publish(ev(ProgressPhase::Separated, 100.0));

        let events = stream.collect().await;
        assert_eq!(events.len(), 102);
        assert_eq!(events.last().unwrap().phase, ProgressPhase::Separated);
    }

    #[tokio::test]
    async fn test_remove_ends_streams() {
        let channel = ProgressChannel::default();
        channel.open("job");
        channel.publish(ev(ProgressPhase::Queued, 0.0));
        let stream = channel.subscribe("job").unwrap();
        channel.remove("job");
        let events: Vec<_> = stream.into_stream().collect().await;
        assert_eq!(events.len(), 1);
        assert!(channel.subscribe("job").is_err());
    }

    #[tokio::test]
    async fn test_dropping_subscriber_does_not_affect_feed() {
        let channel = ProgressChannel::default();
        channel.open("job");
        drop(channel.subscribe("job").unwrap());
        assert!(channel.publish(ev(ProgressPhase::Queued, 0.0)));
    }
}
