//! Query dispatch bridge.
//!
//! Turns evaluate requests into background jobs and routes each result back
//! through the [`ConnectionRegistry`] once the engine finishes. The caller
//! gets a [`JobId`] immediately; evaluation never runs while a registry
//! entry is borrowed.

use std::sync::Arc;

use dashmap::DashMap;
use metrics::counter;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{Instrument, debug, info_span, warn};
use xqws_core::{ConnectionId, JobId};
use xqws_stomp::Frame;

use super::registry::{ConnectionRegistry, DeliveryReport};
use crate::errors::RegistryError;
use crate::query::{EvaluationError, OutputOptions, QueryEvaluator, QueryRequest, QueryValue};

/// Header carrying the job id on replies, errors and receipts.
pub const JOB_ID: &str = "job-id";

/// Who receives a job's result.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Addressing {
    /// The connection that submitted the job.
    #[default]
    Origin,
    /// Exactly these connections; unknown ids are skipped.
    Connections(Vec<ConnectionId>),
    /// Every connection except `exclude`.
    Broadcast {
        /// Connection left out of the broadcast.
        exclude: Option<ConnectionId>,
    },
}

/// A submitted evaluation and where its result goes.
#[derive(Clone, Debug)]
pub struct Job {
    /// Job id, also sent as the `job-id` header.
    pub id: JobId,
    /// Submitting connection; receives evaluation errors.
    pub origin: ConnectionId,
    /// Result recipients.
    pub addressing: Addressing,
    /// Options for the result delivery.
    pub options: OutputOptions,
}

/// Runs queries in the background and delivers their results.
pub struct QueryBridge {
    evaluator: Arc<dyn QueryEvaluator>,
    registry: Arc<ConnectionRegistry>,
    jobs: Arc<DashMap<JobId, AbortHandle>>,
}

impl QueryBridge {
    /// Create a bridge over an evaluator and registry.
    pub fn new(evaluator: Arc<dyn QueryEvaluator>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            evaluator,
            registry,
            jobs: Arc::new(DashMap::new()),
        }
    }

    /// Start evaluating `request` and return its job id.
    ///
    /// `options` gains a `job-id` header so every reply can be paired with
    /// the request. The request is given the origin's id and attribute store
    /// unless the caller already set them.
    pub fn submit(
        &self,
        mut request: QueryRequest,
        origin: ConnectionId,
        addressing: Addressing,
        options: OutputOptions,
    ) -> JobId {
        let id = JobId::new();
        let job = Job {
            id: id.clone(),
            origin,
            addressing,
            options: options.with_header(JOB_ID, id.as_str()),
        };
        if request.origin.is_none() {
            request.origin = Some(job.origin.clone());
        }
        if request.attributes.is_none() {
            request.attributes = self
                .registry
                .lookup(&job.origin)
                .ok()
                .map(|conn| conn.attributes().clone());
        }
        debug!(job_id = %id, origin = %job.origin, "query job submitted");
        counter!("query_jobs_total").increment(1);

        let evaluator = self.evaluator.clone();
        let registry = self.registry.clone();
        let jobs = self.jobs.clone();
        // The job body waits until its handle is tracked, so its own removal
        // always comes after the insert.
        let (tracked_tx, tracked_rx) = oneshot::channel::<()>();
        let span = info_span!("query_job", job_id = %id);
        let handle = tokio::spawn(
            async move {
                let _ = tracked_rx.await;
                let result = evaluator.evaluate(request).await;
                let _ = route(&registry, &job, result);
                let _ = jobs.remove(&job.id);
            }
            .instrument(span),
        );

        let _ = self.jobs.insert(id.clone(), handle.abort_handle());
        let _ = tracked_tx.send(());
        id
    }

    /// Deliver a finished job's result (or error) to its recipients.
    pub fn complete(
        &self,
        job: &Job,
        result: Result<QueryValue, EvaluationError>,
    ) -> DeliveryReport {
        route(&self.registry, job, result)
    }

    /// Jobs submitted and not yet finished.
    pub fn active_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Abort every running job. Returns how many were aborted.
    pub fn abort_all(&self) -> usize {
        let ids: Vec<JobId> = self.jobs.iter().map(|e| e.key().clone()).collect();
        let mut aborted = 0;
        for id in ids {
            if let Some((_, handle)) = self.jobs.remove(&id) {
                handle.abort();
                aborted += 1;
            }
        }
        if aborted > 0 {
            warn!(aborted, "aborted running query jobs");
        }
        aborted
    }
}

fn route(
    registry: &ConnectionRegistry,
    job: &Job,
    result: Result<QueryValue, EvaluationError>,
) -> DeliveryReport {
    match result {
        Ok(value) => {
            counter!("query_jobs_completed_total", "outcome" => "ok").increment(1);
            match &job.addressing {
                Addressing::Origin => {
                    let mut report = DeliveryReport::default();
                    match registry.send_to(&job.origin, &value, &job.options) {
                        Ok(()) => report.delivered.push(job.origin.clone()),
                        Err(RegistryError::NotFound(id)) => {
                            debug!(conn_id = %id, job_id = %job.id, "origin gone, dropping result");
                            report.missing.push(id);
                        }
                        Err(e) => {
                            warn!(conn_id = %job.origin, job_id = %job.id, error = %e, "result delivery failed");
                            report.failed.push(job.origin.clone());
                        }
                    }
                    report
                }
                Addressing::Connections(ids) => registry.multicast(&value, &job.options, ids),
                Addressing::Broadcast { exclude } => {
                    registry.broadcast(&value, &job.options, exclude.as_ref())
                }
            }
        }
        Err(err) => {
            counter!("query_jobs_completed_total", "outcome" => "error").increment(1);
            warn!(job_id = %job.id, code = %err.code, "query evaluation failed");
            let frame = Frame::error(&err.code, err.message).with_header(JOB_ID, job.id.as_str());
            let mut report = DeliveryReport::default();
            match registry.lookup(&job.origin) {
                Ok(conn) => match conn.send_frame(&frame) {
                    Ok(()) => report.delivered.push(job.origin.clone()),
                    Err(e) => {
                        debug!(conn_id = %job.origin, error = %e, "error frame not delivered");
                        report.failed.push(job.origin.clone());
                    }
                },
                Err(_) => report.missing.push(job.origin.clone()),
            }
            report
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::{Connection, Outbound, close_code};
    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tracing::Level;
    use xqws_core::logging::capture_logs;
    use xqws_stomp::Command;

    /// Returns the query text with `$name` replaced by bindings; queries
    /// starting with `fail` raise an error and `hang` never completes.
    /// `remember <text>` stores text in the origin's attributes, `recall`
    /// reads it back and `whoami` returns the origin id.
    struct Echo;

    #[async_trait]
    impl QueryEvaluator for Echo {
        async fn evaluate(&self, request: QueryRequest) -> Result<QueryValue, EvaluationError> {
            if request.query.starts_with("fail") {
                return Err(EvaluationError::new("FOER0000", "requested failure"));
            }
            if request.query == "hang" {
                futures::future::pending::<()>().await;
            }
            if let Some(text) = request.query.strip_prefix("remember ") {
                let attributes = request.attributes.as_ref().unwrap();
                let _ = attributes.set("last", QueryValue::Text(text.to_owned()));
                return Ok(QueryValue::Text("ok".into()));
            }
            if request.query == "recall" {
                let attributes = request.attributes.as_ref().unwrap();
                return Ok(attributes.get("last").unwrap_or(QueryValue::Empty));
            }
            if request.query == "whoami" {
                return Ok(QueryValue::Text(request.origin.unwrap().to_string()));
            }
            let mut out = request.query.clone();
            for (name, value) in &request.bindings {
                out = out.replace(&format!("${name}"), value);
            }
            Ok(QueryValue::Text(out))
        }
    }

    fn setup(ids: &[&str]) -> (QueryBridge, Arc<ConnectionRegistry>, Vec<mpsc::Receiver<Outbound>>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut receivers = Vec::new();
        for id in ids {
            let (tx, rx) = mpsc::channel(16);
            let _ = registry
                .register(Arc::new(Connection::new(ConnectionId::from(*id), tx)))
                .unwrap();
            receivers.push(rx);
        }
        (QueryBridge::new(Arc::new(Echo), registry.clone()), registry, receivers)
    }

    async fn next_frame(rx: &mut mpsc::Receiver<Outbound>) -> Frame {
        match rx.recv().await.unwrap() {
            Outbound::Text(text) => Frame::parse(&text).unwrap(),
            Outbound::Binary(_) => panic!("expected text"),
        }
    }

    fn cid(id: &str) -> ConnectionId {
        ConnectionId::from(id)
    }

    #[tokio::test]
    async fn result_returns_to_origin() {
        let (bridge, _registry, mut rxs) = setup(&["a", "b"]);
        let job_id = bridge.submit(
            QueryRequest::new("hello $who").bind("who", "world"),
            cid("a"),
            Addressing::Origin,
            OutputOptions::for_destination("/query"),
        );

        let frame = next_frame(&mut rxs[0]).await;
        assert_eq!(frame.command(), Command::Message);
        assert_eq!(frame.body(), "hello world");
        assert_eq!(frame.header(JOB_ID), Some(job_id.as_str()));
        assert_eq!(frame.header("destination"), Some("/query"));
        assert!(rxs[1].try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_excludes_sender() {
        let (bridge, _registry, mut rxs) = setup(&["a", "b", "c"]);
        let _ = bridge.submit(
            QueryRequest::new("news"),
            cid("a"),
            Addressing::Broadcast {
                exclude: Some(cid("a")),
            },
            OutputOptions::default(),
        );
        assert_eq!(next_frame(&mut rxs[1]).await.body(), "news");
        assert_eq!(next_frame(&mut rxs[2]).await.body(), "news");
        assert!(rxs[0].try_recv().is_err());
    }

    #[tokio::test]
    async fn multicast_to_listed_ids() {
        let (bridge, _registry, mut rxs) = setup(&["a", "b", "c"]);
        let _ = bridge.submit(
            QueryRequest::new("dm"),
            cid("a"),
            Addressing::Connections(vec![cid("c"), cid("zzz")]),
            OutputOptions::default(),
        );
        assert_eq!(next_frame(&mut rxs[2]).await.body(), "dm");
        assert!(rxs[0].try_recv().is_err());
        assert!(rxs[1].try_recv().is_err());
    }

    #[tokio::test]
    async fn evaluation_error_goes_to_origin() {
        let (logs, _guard) = capture_logs();
        let (bridge, _registry, mut rxs) = setup(&["a", "b"]);
        let job_id = bridge.submit(
            QueryRequest::new("fail please"),
            cid("a"),
            Addressing::Broadcast { exclude: None },
            OutputOptions::default(),
        );

        let frame = next_frame(&mut rxs[0]).await;
        assert_eq!(frame.command(), Command::Error);
        assert_eq!(frame.header("message"), Some("FOER0000"));
        assert_eq!(frame.header(JOB_ID), Some(job_id.as_str()));
        assert_eq!(frame.body(), "requested failure");
        assert!(rxs[1].try_recv().is_err());
        assert!(logs.has_event(Level::WARN, "query evaluation failed"));
    }

    #[tokio::test]
    async fn complete_without_origin_is_silent() {
        let (bridge, registry, _rxs) = setup(&["a"]);
        let job = Job {
            id: JobId::new(),
            origin: cid("a"),
            addressing: Addressing::Origin,
            options: OutputOptions::default(),
        };
        let _ = registry.unregister(&cid("a"));
        let report = bridge.complete(&job, Ok("late".into()));
        assert_eq!(report.missing, vec![cid("a")]);
        let report = bridge.complete(&job, Err(EvaluationError::new("X", "y")));
        assert_eq!(report.missing, vec![cid("a")]);
    }

    #[tokio::test]
    async fn closed_origin_is_reported_missing() {
        let (bridge, registry, _rxs) = setup(&["a"]);
        let _ = registry
            .lookup(&cid("a"))
            .unwrap()
            .close(close_code::NORMAL, "bye");
        let job = Job {
            id: JobId::new(),
            origin: cid("a"),
            addressing: Addressing::Origin,
            options: OutputOptions::default(),
        };
        assert_eq!(bridge.complete(&job, Ok("x".into())).missing, vec![cid("a")]);
    }

    #[tokio::test]
    async fn finished_jobs_are_forgotten() {
        let (bridge, _registry, mut rxs) = setup(&["a"]);
        let _ = bridge.submit(
            QueryRequest::new("done"),
            cid("a"),
            Addressing::Origin,
            OutputOptions::default(),
        );
        let _ = next_frame(&mut rxs[0]).await;
        for _ in 0..10 {
            if bridge.active_jobs() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(bridge.active_jobs(), 0);
    }

    #[tokio::test]
    async fn query_state_persists_in_origin_attributes() {
        let (bridge, registry, mut rxs) = setup(&["a", "b"]);
        let submit = |query: &str, origin: &str| {
            bridge.submit(
                QueryRequest::new(query),
                cid(origin),
                Addressing::Origin,
                OutputOptions::default(),
            )
        };

        let _ = submit("remember blue", "a");
        assert_eq!(next_frame(&mut rxs[0]).await.body(), "ok");
        assert_eq!(
            registry.lookup(&cid("a")).unwrap().attributes().get("last"),
            Some(QueryValue::Text("blue".into()))
        );
        assert!(registry.lookup(&cid("b")).unwrap().attributes().is_empty());

        let _ = submit("recall", "a");
        assert_eq!(next_frame(&mut rxs[0]).await.body(), "blue");

        let _ = submit("whoami", "b");
        assert_eq!(next_frame(&mut rxs[1]).await.body(), "b");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn jobs_finishing_immediately_are_not_leaked() {
        let (bridge, _registry, _rxs) = setup(&["a"]);
        for _ in 0..200 {
            let _ = bridge.submit(
                QueryRequest::new("done"),
                cid("a"),
                Addressing::Connections(Vec::new()),
                OutputOptions::default(),
            );
        }
        for _ in 0..200 {
            if bridge.active_jobs() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(bridge.active_jobs(), 0);
    }

    #[tokio::test]
    async fn abort_all_stops_running_jobs() {
        let (bridge, _registry, mut rxs) = setup(&["a"]);
        let _ = bridge.submit(
            QueryRequest::new("hang"),
            cid("a"),
            Addressing::Origin,
            OutputOptions::default(),
        );
        tokio::task::yield_now().await;
        assert_eq!(bridge.active_jobs(), 1);
        assert_eq!(bridge.abort_all(), 1);
        assert_eq!(bridge.active_jobs(), 0);
        assert!(rxs[0].try_recv().is_err());
    }
}
