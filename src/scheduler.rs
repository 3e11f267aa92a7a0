//! Rate-limited, batching request scheduler.
//!
//! Every remote call in the harvester goes through one [`Scheduler`]. Calls
//! are queued FIFO and drained by a single timer-driven task:
//!
//! ```text
//!  enqueue ──▶ ┌──────────────┐   every ≥ interval   ┌─────────────┐
//!  enqueue ──▶ │  FIFO queue  │ ───────────────────▶ │ batch POST  │
//!  (paging) ─▶ └──────────────┘   ≤ batch_size units └──────┬──────┘
//!        ▲                                                  │
//!        └──── continuation units ◀── demultiplex ◀─────────┘
//! ```
//!
//! - No two dispatches start closer together than the configured interval,
//!   however many callers enqueue concurrently.
//! - A unit whose page carries `paging.next` spawns a fresh unit for the
//!   next page at the tail of the queue, delivering to the same sink.
//! - [`Scheduler::remaining_calls`] counts queued plus in-flight units,
//!   continuations included. A continuation is counted before the unit that
//!   produced it is retired, so the count never dips to zero mid-listing.
//! - Each unit yields exactly one [`CallOutcome`]. Outcomes are delivered
//!   under the scheduler lock in retirement order and carry the
//!   `remaining` snapshot taken at retirement.
//!
//! There are no retries at this layer. When a composite call fails at the
//! transport level, every unit of that batch receives the transport error.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::{CallError, GraphApi};
use crate::config::ApiConfig;
use crate::models::Page;

/// Result of one call unit.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    /// Relative path this unit fetched.
    pub path: String,
    pub result: Result<Page, CallError>,
    /// Outstanding units right after this one retired.
    pub remaining: usize,
}

/// Where a unit (and its continuations) deliver their outcomes.
pub type OutcomeSink = mpsc::UnboundedSender<CallOutcome>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub batch_size: usize,
    pub interval: Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &ApiConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            interval: Duration::from_millis(config.rate_limit_ms),
        }
    }
}

struct CallUnit {
    path: String,
    sink: OutcomeSink,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<CallUnit>,
    outstanding: usize,
    stopped: bool,
}

struct Shared {
    api: Arc<dyn GraphApi>,
    settings: SchedulerSettings,
    state: Mutex<QueueState>,
    wake: Notify,
}

/// Stops the dispatch loop once the last [`Scheduler`] handle is dropped.
struct StopOnDrop(Arc<Shared>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.stop();
    }
}

/// Handle to a running scheduler. Clones share the same queue and timer.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
    _guard: Arc<StopOnDrop>,
}

impl Scheduler {
    /// Create a scheduler and spawn its dispatch loop on the current tokio
    /// runtime.
    pub fn new(api: Arc<dyn GraphApi>, settings: SchedulerSettings) -> Self {
        let shared = Arc::new(Shared {
            api,
            settings,
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
        });
        tokio::spawn(dispatch_loop(shared.clone()));

        Self {
            _guard: Arc::new(StopOnDrop(shared.clone())),
            shared,
        }
    }

    /// Queue one call. Exactly one outcome for it is sent to `sink`.
    ///
    /// Returns `false` (and drops `sink`) if the scheduler was stopped.
    pub fn enqueue(&self, path: impl Into<String>, sink: OutcomeSink) -> bool {
        let path = path.into();
        let mut state = self.shared.state.lock().unwrap();
        if state.stopped {
            debug!(path = %path, "scheduler stopped, call not queued");
            return false;
        }
        state.queue.push_back(CallUnit { path, sink });
        state.outstanding += 1;
        drop(state);

        self.shared.wake.notify_one();
        true
    }

    /// Queue one call and wait for its outcome.
    pub async fn call(&self, path: impl Into<String>) -> Result<Page, CallError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        if !self.enqueue(path, tx) {
            return Err(CallError::Transport("scheduler stopped".into()));
        }
        match rx.recv().await {
            Some(outcome) => outcome.result,
            None => Err(CallError::Transport(
                "scheduler stopped before the call was dispatched".into(),
            )),
        }
    }

    /// Halt future dispatch and drop every queued unit.
    ///
    /// Batches already in flight still deliver their outcomes.
    pub fn stop(&self) {
        self.shared.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.state.lock().unwrap().stopped
    }

    /// Queued plus in-flight units.
    pub fn remaining_calls(&self) -> usize {
        self.shared.state.lock().unwrap().outstanding
    }

    pub fn settings(&self) -> SchedulerSettings {
        self.shared.settings
    }
}

impl Shared {
    fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        if state.stopped {
            return;
        }
        state.stopped = true;
        let dropped = state.queue.len();
        state.queue.clear();
        state.outstanding = state.outstanding.saturating_sub(dropped);
        drop(state);

        if dropped > 0 {
            info!(dropped, "scheduler stopped, queued calls dropped");
        }
        self.wake.notify_one();
    }

    /// Retire one unit: queue its continuation, update the count and deliver
    /// the outcome, all under the lock.
    fn retire(&self, unit: CallUnit, result: Result<Page, CallError>) {
        let mut state = self.state.lock().unwrap();

        if let Ok(Page {
            next: Some(next), ..
        }) = &result
        {
            if *next == unit.path {
                warn!(path = %unit.path, "page links to itself, pagination stopped");
            } else if !state.stopped {
                debug!(path = %unit.path, next = %next, "queueing next page");
                state.queue.push_back(CallUnit {
                    path: next.clone(),
                    sink: unit.sink.clone(),
                });
                state.outstanding += 1;
                self.wake.notify_one();
            }
        }

        state.outstanding = state.outstanding.saturating_sub(1);
        let remaining = state.outstanding;

        // A closed sink means the caller went away; the outcome is dropped.
        let _ = unit.sink.send(CallOutcome {
            path: unit.path,
            result,
            remaining,
        });
    }
}

async fn dispatch_loop(shared: Arc<Shared>) {
    let SchedulerSettings {
        batch_size,
        interval,
    } = shared.settings;
    let mut last_dispatch: Option<Instant> = None;

    loop {
        // Idle until there is work
        let mut waited = false;
        loop {
            {
                let state = shared.state.lock().unwrap();
                if state.stopped {
                    return;
                }
                if !state.queue.is_empty() {
                    break;
                }
            }
            waited = true;
            shared.wake.notified().await;
        }

        let deadline = match last_dispatch {
            Some(last) if !waited => last + interval,
            _ => Instant::now() + interval,
        };
        tokio::time::sleep_until(deadline).await;

        let batch: Vec<CallUnit> = {
            let mut state = shared.state.lock().unwrap();
            if state.stopped {
                return;
            }
            let take = batch_size.min(state.queue.len());
            state.queue.drain(..take).collect()
        };
        if batch.is_empty() {
            continue;
        }

        last_dispatch = Some(Instant::now());
        tokio::spawn(dispatch(shared.clone(), batch));
    }
}

async fn dispatch(shared: Arc<Shared>, batch: Vec<CallUnit>) {
    let paths: Vec<String> = batch.iter().map(|unit| unit.path.clone()).collect();
    debug!(size = paths.len(), first = %paths[0], "dispatching batch");

    match shared.api.batch(&paths).await {
        Ok(results) => {
            let mut results = results.into_iter();
            for unit in batch {
                let result = results.next().unwrap_or_else(|| {
                    Err(CallError::Transport("no response for batch item".into()))
                });
                if let Err(ref error) = result {
                    debug!(path = %unit.path, error = %error, "call failed");
                }
                shared.retire(unit, result);
            }
        }
        Err(error) => {
            warn!(size = paths.len(), error = %error, "batch failed, failing all its calls");
            for unit in batch {
                shared.retire(unit, Err(error.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::FixtureGraphApi;
    use serde_json::json;

    const BASE: &str = "https://graph.example.com/";

    fn fixture() -> Arc<FixtureGraphApi> {
        Arc::new(FixtureGraphApi::new(BASE).unwrap())
    }

    fn scheduler(api: Arc<FixtureGraphApi>, batch_size: usize) -> Scheduler {
        Scheduler::new(
            api,
            SchedulerSettings {
                batch_size,
                interval: Duration::from_millis(1000),
            },
        )
    }

    async fn collect(rx: &mut mpsc::UnboundedReceiver<CallOutcome>, n: usize) -> Vec<CallOutcome> {
        let mut outcomes = Vec::new();
        while outcomes.len() < n {
            outcomes.push(rx.recv().await.expect("sink closed early"));
        }
        outcomes
    }

    #[tokio::test(start_paused = true)]
    async fn batches_are_fifo_bounded_and_spaced() {
        let api = fixture();
        for i in 0..5 {
            api.respond(&format!("p{}", i), json!({"data": []}));
        }
        let scheduler = scheduler(api.clone(), 2);

        let (tx, mut rx) = mpsc::unbounded_channel();
        for i in 0..5 {
            scheduler.enqueue(format!("p{}", i), tx.clone());
        }
        drop(tx);
        assert_eq!(scheduler.remaining_calls(), 5);

        let outcomes = collect(&mut rx, 5).await;
        assert!(outcomes.iter().all(|o| o.result.is_ok()));

        let batches = api.batches();
        let paths: Vec<Vec<String>> = batches.iter().map(|b| b.paths.clone()).collect();
        assert_eq!(
            paths,
            vec![
                vec!["p0".to_string(), "p1".to_string()],
                vec!["p2".to_string(), "p3".to_string()],
                vec!["p4".to_string()],
            ]
        );
        for pair in batches.windows(2) {
            assert!(pair[1].at - pair[0].at >= Duration::from_millis(1000));
        }
        assert_eq!(scheduler.remaining_calls(), 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_rate_limit() {
        let api = fixture();
        api.respond("a", json!({"data": []}));
        api.respond("b", json!({"data": []}));
        let scheduler = scheduler(api.clone(), 1);

        let first = scheduler.clone();
        let second = scheduler.clone();
        let (ra, rb) = tokio::join!(first.call("a"), second.call("b"));
        assert!(ra.is_ok() && rb.is_ok());

        let batches = api.batches();
        assert_eq!(batches.len(), 2);
        assert!(batches[1].at - batches[0].at >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_after_idle_still_waits_an_interval() {
        let api = fixture();
        api.respond("a", json!({"data": []}));
        let scheduler = scheduler(api.clone(), 15);

        scheduler.call("a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.call("a").await.unwrap();

        let batches = api.batches();
        assert!(batches[1].at - batches[0].at >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn continuation_counts_as_outstanding_until_done() {
        let api = fixture();
        api.respond(
            "me/posts",
            json!({
                "data": [{"id": "1"}],
                "paging": {"next": "https://graph.example.com/me/posts?after=1&access_token=t"}
            }),
        );
        api.respond("me/posts?after=1", json!({"data": [{"id": "2"}]}));
        let scheduler = scheduler(api.clone(), 15);

        let before = scheduler.remaining_calls();
        let (tx, mut rx) = mpsc::unbounded_channel();
        scheduler.enqueue("me/posts", tx);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.remaining, before + 1);
        assert_eq!(scheduler.remaining_calls(), before + 1);

        let second = rx.recv().await.unwrap();
        assert_eq!(second.path, "me/posts?after=1");
        assert_eq!(second.remaining, before);
        assert!(rx.recv().await.is_none());
        assert_eq!(api.dispatched_paths(), vec!["me/posts", "me/posts?after=1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn continuation_goes_to_the_tail() {
        let api = fixture();
        api.respond(
            "a",
            json!({"data": [], "paging": {"next": "https://graph.example.com/a?page=2"}}),
        );
        api.respond("a?page=2", json!({"data": []}));
        api.respond("b", json!({"data": []}));
        let scheduler = scheduler(api.clone(), 1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        scheduler.enqueue("a", tx.clone());
        scheduler.enqueue("b", tx);
        collect(&mut rx, 3).await;

        assert_eq!(api.dispatched_paths(), vec!["a", "b", "a?page=2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_fails_every_unit_in_the_batch() {
        let api = fixture();
        api.fail_next_batches(1);
        let scheduler = scheduler(api.clone(), 3);

        let (tx, mut rx) = mpsc::unbounded_channel();
        for path in ["x", "y", "z"] {
            scheduler.enqueue(path, tx.clone());
        }
        drop(tx);

        let outcomes = collect(&mut rx, 3).await;
        assert!(outcomes
            .iter()
            .all(|o| matches!(o.result, Err(CallError::Transport(_)))));
        assert_eq!(outcomes.last().unwrap().remaining, 0);
        assert_eq!(scheduler.remaining_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unit_errors_do_not_stop_the_queue() {
        let api = fixture();
        api.respond("ok", json!({"data": [{"id": "1"}]}));
        let scheduler = scheduler(api.clone(), 1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        scheduler.enqueue("missing", tx.clone());
        scheduler.enqueue("ok", tx);

        let outcomes = collect(&mut rx, 2).await;
        assert!(matches!(
            outcomes[0].result,
            Err(CallError::Remote { code: 404, .. })
        ));
        assert!(outcomes[1].result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_drops_queued_units() {
        let api = fixture();
        let scheduler = scheduler(api.clone(), 1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        for path in ["a", "b", "c"] {
            scheduler.enqueue(path, tx.clone());
        }
        drop(tx);
        scheduler.stop();

        assert_eq!(scheduler.remaining_calls(), 0);
        assert!(rx.recv().await.is_none());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(api.batches().is_empty());

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(!scheduler.enqueue("d", tx));
        assert!(scheduler.call("d").await.is_err());
    }
}
