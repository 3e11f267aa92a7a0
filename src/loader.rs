//! Connection loader.
//!
//! Drives the [`Scheduler`] across the root subject and then each of its
//! connections, one subject at a time:
//!
//! 1. every relation of the subject is enqueued at once (the scheduler
//!    serializes actual dispatch);
//! 2. each outcome is reported as [`LoadEvent::Records`] or
//!    [`LoadEvent::CallFailed`], followed by a [`LoadEvent::Progress`] of
//!    `completed / (completed + remaining)`;
//! 3. once the subject's last call (continuations included) has completed,
//!    [`LoadEvent::SubjectDone`] is sent exactly once.
//!
//! Connections are the records the root returns for the connections
//! relation, plus any already known from earlier harvests. Nothing of a
//! connection is enqueued before the previous subject is done.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::CallError;
use crate::models::Subject;
use crate::scheduler::Scheduler;

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("harvest cancelled")]
    Cancelled,
    #[error("nobody is listening for harvest events")]
    EventsClosed,
}

/// What to harvest.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub root: Subject,
    pub relations: Vec<String>,
    /// Relations fetched for each connection.
    pub connection_relations: Vec<String>,
    /// Root relation whose records are the connections.
    pub connections_relation: String,
    /// Only fetch records newer than this (unix seconds).
    pub since: Option<i64>,
    pub known_connections: Vec<Subject>,
}

#[derive(Debug, Clone)]
pub enum LoadEvent {
    /// `position` is 1-based; `total` grows once connections are known.
    SubjectStarted {
        subject: Subject,
        position: usize,
        total: usize,
    },
    Records {
        subject: Subject,
        relation: String,
        items: Vec<Value>,
    },
    CallFailed {
        subject: Subject,
        relation: String,
        path: String,
        error: CallError,
    },
    Progress {
        subject: Subject,
        fraction: f64,
    },
    SubjectDone {
        subject: Subject,
    },
    AllDone(LoadSummary),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub subjects: usize,
    pub calls: usize,
    pub failed_calls: usize,
    pub records: usize,
}

type EventSink = mpsc::UnboundedSender<LoadEvent>;

pub struct ConnectionLoader {
    scheduler: Scheduler,
}

impl ConnectionLoader {
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Harvest the root subject and all of its connections.
    ///
    /// Ends with [`LoadEvent::AllDone`] unless the scheduler is stopped
    /// midway, in which case [`HarvestError::Cancelled`] is returned.
    pub async fn load_all(
        &self,
        request: LoadRequest,
        events: EventSink,
    ) -> Result<LoadSummary, HarvestError> {
        let mut summary = LoadSummary::default();
        let relations = unique(&request.relations);
        let connection_relations = unique(&request.connection_relations);

        let mut discovered = Vec::new();
        let mut seen = HashSet::new();
        seen.insert(request.root.id.clone());

        emit(
            &events,
            LoadEvent::SubjectStarted {
                subject: request.root.clone(),
                position: 1,
                total: 1 + request.known_connections.len(),
            },
        )?;
        self.load_subject(
            &request.root,
            &relations,
            request.since,
            &events,
            &mut summary,
            |relation, items| {
                if relation != request.connections_relation {
                    return;
                }
                for item in items {
                    if let Some(subject) = connection_subject(item) {
                        if seen.insert(subject.id.clone()) {
                            discovered.push(subject);
                        }
                    }
                }
            },
        )
        .await?;

        for subject in &request.known_connections {
            if seen.insert(subject.id.clone()) {
                discovered.push(subject.clone());
            }
        }
        info!(connections = discovered.len(), "root subject loaded");

        let total = 1 + discovered.len();
        for (i, subject) in discovered.iter().enumerate() {
            emit(
                &events,
                LoadEvent::SubjectStarted {
                    subject: subject.clone(),
                    position: i + 2,
                    total,
                },
            )?;
            self.load_subject(
                subject,
                &connection_relations,
                request.since,
                &events,
                &mut summary,
                |_, _| {},
            )
            .await?;
        }

        info!(
            subjects = summary.subjects,
            calls = summary.calls,
            failed = summary.failed_calls,
            records = summary.records,
            "harvest loaded"
        );
        emit(&events, LoadEvent::AllDone(summary))?;
        Ok(summary)
    }

    /// Fetch every relation of one subject and wait for all its calls.
    async fn load_subject(
        &self,
        subject: &Subject,
        relations: &[String],
        since: Option<i64>,
        events: &EventSink,
        summary: &mut LoadSummary,
        mut on_records: impl FnMut(&str, &[Value]),
    ) -> Result<(), HarvestError> {
        if self.scheduler.is_stopped() {
            return Err(HarvestError::Cancelled);
        }

        if relations.is_empty() {
            debug!(subject = %subject.id, "no relations to load");
            emit(
                events,
                LoadEvent::Progress {
                    subject: subject.clone(),
                    fraction: 1.0,
                },
            )?;
            emit(
                events,
                LoadEvent::SubjectDone {
                    subject: subject.clone(),
                },
            )?;
            summary.subjects += 1;
            return Ok(());
        }

        // Continuation paths are mapped back to their relation as they
        // are announced by the page before them.
        let mut relation_of: HashMap<String, String> = HashMap::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        for relation in relations {
            let path = with_since(&format!("{}/{}", subject.id, relation), since);
            relation_of.insert(path.clone(), relation.clone());
            if !self.scheduler.enqueue(path, tx.clone()) {
                return Err(HarvestError::Cancelled);
            }
        }
        drop(tx);

        let mut pending = relations.len();
        let mut completed = 0usize;
        let mut reported_full = false;

        while pending > 0 {
            let Some(outcome) = rx.recv().await else {
                if self.scheduler.is_stopped() {
                    info!(subject = %subject.id, "harvest stopped mid-subject");
                    return Err(HarvestError::Cancelled);
                }
                warn!(subject = %subject.id, pending, "outcome stream ended early");
                break;
            };
            pending -= 1;
            completed += 1;
            summary.calls += 1;

            let relation = relation_of
                .remove(&outcome.path)
                .unwrap_or_else(|| outcome.path.clone());

            match outcome.result {
                Ok(page) => {
                    if let Some(next) = page.next.as_ref().filter(|next| **next != outcome.path) {
                        relation_of.insert(next.clone(), relation.clone());
                        pending += 1;
                    }
                    let items = page.items();
                    if !items.is_empty() {
                        on_records(&relation, &items);
                        summary.records += items.len();
                        emit(
                            events,
                            LoadEvent::Records {
                                subject: subject.clone(),
                                relation,
                                items,
                            },
                        )?;
                    }
                }
                Err(error) => {
                    summary.failed_calls += 1;
                    warn!(subject = %subject.id, path = %outcome.path, error = %error, "call failed");
                    emit(
                        events,
                        LoadEvent::CallFailed {
                            subject: subject.clone(),
                            relation,
                            path: outcome.path,
                            error,
                        },
                    )?;
                }
            }

            let fraction = completed as f64 / (completed + outcome.remaining) as f64;
            if fraction >= 1.0 {
                reported_full = true;
            }
            emit(
                events,
                LoadEvent::Progress {
                    subject: subject.clone(),
                    fraction: fraction.min(1.0),
                },
            )?;
        }

        // Other callers may still have calls queued; this subject is done.
        if !reported_full {
            emit(
                events,
                LoadEvent::Progress {
                    subject: subject.clone(),
                    fraction: 1.0,
                },
            )?;
        }
        emit(
            events,
            LoadEvent::SubjectDone {
                subject: subject.clone(),
            },
        )?;
        summary.subjects += 1;
        Ok(())
    }
}

fn emit(events: &EventSink, event: LoadEvent) -> Result<(), HarvestError> {
    events.send(event).map_err(|_| HarvestError::EventsClosed)
}

fn unique(relations: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    relations
        .iter()
        .filter(|r| seen.insert(r.as_str()))
        .cloned()
        .collect()
}

fn connection_subject(item: &Value) -> Option<Subject> {
    let id = match item.get("id")? {
        Value::String(s) if !s.is_empty() => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let name = item
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| id.clone());
    Some(Subject::new(id, name))
}

/// Append the `since` filter to a relation path.
pub fn with_since(path: &str, since: Option<i64>) -> String {
    match since {
        Some(since) => {
            let separator = if path.contains('?') { '&' } else { '?' };
            format!("{}{}since={}", path, separator, since)
        }
        None => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::FixtureGraphApi;
    use crate::scheduler::SchedulerSettings;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    const BASE: &str = "https://graph.example.com/";

    fn setup() -> (Arc<FixtureGraphApi>, ConnectionLoader) {
        let api = Arc::new(FixtureGraphApi::new(BASE).unwrap());
        let scheduler = Scheduler::new(
            api.clone(),
            SchedulerSettings {
                batch_size: 15,
                interval: Duration::from_millis(1000),
            },
        );
        (api, ConnectionLoader::new(scheduler))
    }

    fn request(relations: &[&str], connection_relations: &[&str]) -> LoadRequest {
        LoadRequest {
            root: Subject::new("me", "me"),
            relations: relations.iter().map(|r| r.to_string()).collect(),
            connection_relations: connection_relations.iter().map(|r| r.to_string()).collect(),
            connections_relation: "friends".into(),
            since: None,
            known_connections: Vec::new(),
        }
    }

    async fn run(
        loader: &ConnectionLoader,
        request: LoadRequest,
    ) -> (Result<LoadSummary, HarvestError>, Vec<LoadEvent>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = loader.load_all(request, tx).await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (result, events)
    }

    fn fractions(events: &[LoadEvent]) -> Vec<f64> {
        events
            .iter()
            .filter_map(|e| match e {
                LoadEvent::Progress { fraction, .. } => Some(*fraction),
                _ => None,
            })
            .collect()
    }

    fn done_subjects(events: &[LoadEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                LoadEvent::SubjectDone { subject } => Some(subject.id.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn root_relations_complete_once() {
        let (api, loader) = setup();
        api.respond("me/likes", json!({"data": [{"id": "1", "name": "Ann"}, {"id": "2", "name": "Rust"}]}));
        api.respond("me/posts", json!({"data": [{"id": "3", "message": "Hi"}, {"id": "4", "message": "Yo"}]}));

        let (result, events) = run(&loader, request(&["likes", "posts"], &[])).await;
        let summary = result.unwrap();

        assert_eq!(api.dispatched_paths(), vec!["me/likes", "me/posts"]);
        assert_eq!(fractions(&events), vec![0.5, 1.0]);
        assert_eq!(done_subjects(&events), vec!["me"]);
        assert_eq!(summary.records, 4);
        assert_eq!(summary.calls, 2);
        assert!(matches!(events.last(), Some(LoadEvent::AllDone(_))));
        assert_eq!(loader.scheduler().remaining_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn subject_without_relations_completes_immediately() {
        let (api, loader) = setup();
        let (result, events) = run(&loader, request(&[], &[])).await;

        assert!(result.is_ok());
        assert!(api.batches().is_empty());
        assert_eq!(fractions(&events), vec![1.0]);
        assert_eq!(done_subjects(&events), vec!["me"]);
    }

    #[tokio::test(start_paused = true)]
    async fn connections_are_loaded_one_at_a_time() {
        let (api, loader) = setup();
        api.respond("me/friends", json!({"data": [{"id": "1", "name": "Ann"}, {"id": "2", "name": "Bob"}]}));
        api.respond("1/likes", json!({"data": [{"id": "10", "name": "Tea"}]}));
        api.respond("1/posts", json!({"data": []}));
        api.respond("2/likes", json!({"data": [{"id": "20", "name": "Coffee"}]}));
        api.respond("2/posts", json!({"data": []}));

        let mut req = request(&["friends"], &["likes", "posts"]);
        req.known_connections = vec![Subject::new("2", "Bob"), Subject::new("3", "Cy")];
        let (result, events) = run(&loader, req).await;
        result.unwrap();

        let batches: Vec<Vec<String>> = api.batches().into_iter().map(|b| b.paths).collect();
        assert_eq!(
            batches,
            vec![
                vec!["me/friends".to_string()],
                vec!["1/likes".to_string(), "1/posts".to_string()],
                vec!["2/likes".to_string(), "2/posts".to_string()],
                vec!["3/likes".to_string(), "3/posts".to_string()],
            ]
        );
        assert_eq!(done_subjects(&events), vec!["me", "1", "2", "3"]);

        let failed = events
            .iter()
            .filter(|e| matches!(e, LoadEvent::CallFailed { subject, .. } if subject.id == "3"))
            .count();
        assert_eq!(failed, 2);

        let started: Vec<(usize, usize)> = events
            .iter()
            .filter_map(|e| match e {
                LoadEvent::SubjectStarted { position, total, .. } => Some((*position, *total)),
                _ => None,
            })
            .collect();
        assert_eq!(started, vec![(1, 3), (2, 4), (3, 4), (4, 4)]);
    }

    #[tokio::test(start_paused = true)]
    async fn since_is_appended_to_every_call() {
        let (api, loader) = setup();
        api.respond("me/likes?since=1700000000", json!({"data": []}));

        let mut req = request(&["likes"], &[]);
        req.since = Some(1_700_000_000);
        run(&loader, req).await.0.unwrap();

        assert_eq!(api.dispatched_paths(), vec!["me/likes?since=1700000000"]);
        assert_eq!(with_since("me/feed?limit=5", Some(7)), "me/feed?limit=5&since=7");
        assert_eq!(with_since("me/feed", None), "me/feed");
    }

    #[tokio::test(start_paused = true)]
    async fn pages_are_followed_under_their_relation() {
        let (api, loader) = setup();
        api.respond(
            "me/posts",
            json!({
                "data": [{"id": "1", "message": "first"}],
                "paging": {"next": "https://graph.example.com/me/posts?after=abc&access_token=t"}
            }),
        );
        api.respond("me/posts?after=abc", json!({"data": [{"id": "2", "message": "second"}]}));

        let (result, events) = run(&loader, request(&["posts"], &[])).await;
        assert_eq!(result.unwrap().records, 2);

        assert_eq!(api.dispatched_paths(), vec!["me/posts", "me/posts?after=abc"]);
        assert_eq!(fractions(&events), vec![0.5, 1.0]);
        let relations: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                LoadEvent::Records { relation, .. } => Some(relation.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(relations, vec!["posts", "posts"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_scheduler_cancels() {
        let (_api, loader) = setup();
        loader.scheduler().stop();
        let (result, events) = run(&loader, request(&["likes"], &[])).await;
        assert!(matches!(result, Err(HarvestError::Cancelled)));
        assert!(done_subjects(&events).is_empty());
    }
}
